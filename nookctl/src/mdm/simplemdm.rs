//! reqwest implementation of [`MdmClient`] for a SimpleMDM-style REST API.
//!
//! Resources are addressed JSON:API style (`/device_groups/{id}`,
//! `/profiles/{id}/relationships/device_groups`), authenticated with the API key as the basic-auth
//! username and an empty password.

use super::{Enrollment, ExternalServiceError, GroupLink, MdmClient, Result};
use crate::config::MdmConfig;
use crate::content::ContentBlob;
use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{debug, instrument, warn};
use url::Url;

/// Upper bound on how much of an error body ends up in an error message
const MAX_ERROR_BODY: usize = 512;

pub struct SimpleMdmClient {
    client: Client,
    base_url: Url,
    api_key: String,
    group_auto_deploy: bool,
}

impl std::fmt::Debug for SimpleMdmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimpleMdmClient")
            .field("base_url", &self.base_url.as_str())
            .field("group_auto_deploy", &self.group_auto_deploy)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    data: Resource,
}

#[derive(Debug, Deserialize)]
struct Resource {
    id: Value,
    #[serde(default)]
    attributes: Option<Attributes>,
    #[serde(default)]
    relationships: Option<Relationships>,
}

#[derive(Debug, Default, Deserialize)]
struct Attributes {
    #[serde(default)]
    url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Relationships {
    #[serde(default)]
    profiles: Option<RelationshipList>,
}

#[derive(Debug, Deserialize)]
struct RelationshipList {
    #[serde(default)]
    data: Vec<ResourceIdentifier>,
}

#[derive(Debug, Deserialize)]
struct ResourceIdentifier {
    id: Value,
}

/// Resource ids come back as numbers from SimpleMDM but are kept as opaque strings locally.
fn id_to_string(id: &Value) -> Option<String> {
    match id {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

/// Send ids back in the shape the API handed them out in.
fn id_to_json(id: &str) -> Value {
    id.parse::<u64>().map(Value::from).unwrap_or_else(|_| Value::String(id.to_string()))
}

fn truncate(body: &str) -> &str {
    match body.char_indices().nth(MAX_ERROR_BODY) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

fn parse_retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn record<T>(operation: &'static str, result: &Result<T>) {
    let outcome = match result {
        Ok(_) => "success",
        Err(e) if e.retryable => "retryable",
        Err(_) => "permanent",
    };
    metrics::counter!("nookctl_mdm_requests_total", "operation" => operation, "outcome" => outcome).increment(1);
}

/// A non-success response, with its body read for the error message.
struct Failure {
    status: StatusCode,
    body: String,
    retry_after: Option<Duration>,
}

impl Failure {
    fn into_error(self, operation: &str) -> ExternalServiceError {
        ExternalServiceError::from_status(
            self.status.as_u16(),
            format!("MDM {operation} failed with {}: {}", self.status, truncate(&self.body)),
            self.retry_after,
        )
    }
}

impl SimpleMdmClient {
    pub fn new(config: &MdmConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .context("Failed to create MDM HTTP client")?;
        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
            group_auto_deploy: config.group_auto_deploy,
        })
    }

    /// Base URL plus path segments, percent-encoding each segment.
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ExternalServiceError::malformed(format!("MDM base URL {} cannot carry a path", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, segments: &[&str]) -> Result<RequestBuilder> {
        let url = self.endpoint(segments)?;
        Ok(self.client.request(method, url).basic_auth(&self.api_key, Some("")))
    }

    /// Send a request. Transport errors come back as `Err`; HTTP failures come back as
    /// `Ok(Err(failure))` so callers can treat specific statuses as success.
    async fn send(&self, operation: &str, builder: RequestBuilder) -> Result<std::result::Result<Response, Failure>> {
        let response = builder.send().await.map_err(|e| {
            if e.is_builder() {
                ExternalServiceError::malformed(format!("MDM {operation} request could not be built: {e}"))
            } else if e.is_timeout() {
                ExternalServiceError::transport(format!("MDM {operation} timed out"))
            } else {
                ExternalServiceError::transport(format!("MDM {operation} failed to connect: {e}"))
            }
        })?;

        let status = response.status();
        debug!(%status, operation, "MDM responded");
        if status.is_success() {
            return Ok(Ok(response));
        }
        let retry_after = parse_retry_after(&response);
        let body = response.text().await.unwrap_or_default();
        Ok(Err(Failure { status, body, retry_after }))
    }

    /// Send and require a 2xx.
    async fn send_ok(&self, operation: &str, builder: RequestBuilder) -> Result<Response> {
        self.send(operation, builder).await?.map_err(|f| f.into_error(operation))
    }

    /// Send a delete-like request where 404 means the thing is already gone.
    async fn send_gone_ok(&self, operation: &str, builder: RequestBuilder) -> Result<()> {
        match self.send(operation, builder).await? {
            Ok(_) => Ok(()),
            Err(f) if f.status == StatusCode::NOT_FOUND => {
                debug!(operation, "MDM resource already absent");
                Ok(())
            }
            Err(f) => Err(f.into_error(operation)),
        }
    }

    /// Send a link request where an existing link is success.
    async fn send_link(&self, operation: &str, builder: RequestBuilder) -> Result<()> {
        match self.send(operation, builder).await? {
            Ok(_) => Ok(()),
            Err(f) if f.status == StatusCode::CONFLICT => Ok(()),
            Err(f) if f.status == StatusCode::UNPROCESSABLE_ENTITY && f.body.to_ascii_lowercase().contains("already") => {
                debug!(operation, "MDM link already present");
                Ok(())
            }
            Err(f) => Err(f.into_error(operation)),
        }
    }

    async fn read_envelope(operation: &str, response: Response) -> Result<Envelope> {
        let text = response
            .text()
            .await
            .map_err(|e| ExternalServiceError::transport(format!("MDM {operation} response could not be read: {e}")))?;
        serde_json::from_str::<Envelope>(&text).map_err(|e| {
            warn!(operation, error = %e, "Unparseable MDM response");
            ExternalServiceError::malformed(format!("MDM {operation} returned an unexpected body: {e}"))
        })
    }

    async fn read_id(operation: &str, response: Response) -> Result<String> {
        let envelope = Self::read_envelope(operation, response).await?;
        id_to_string(&envelope.data.id).ok_or_else(|| ExternalServiceError::malformed(format!("MDM {operation} returned no resource id")))
    }

    async fn create_group_inner(&self, name: &str) -> Result<String> {
        let body = json!({ "name": name, "auto_deploy_enabled": self.group_auto_deploy });
        let response = self
            .send_ok("create_group", self.request(Method::POST, &["device_groups"])?.json(&body))
            .await?;
        Self::read_id("create_group", response).await
    }

    async fn create_profile_inner(&self, name: &str, content: &ContentBlob) -> Result<String> {
        let body = json!({ "name": name, "mobileconfig": content.as_str() });
        let response = self
            .send_ok("create_profile", self.request(Method::POST, &["profiles"])?.json(&body))
            .await?;
        Self::read_id("create_profile", response).await
    }

    async fn create_enrollment_inner(&self, group_ref: &str) -> Result<Enrollment> {
        let body = json!({ "device_group_id": id_to_json(group_ref) });
        let response = self
            .send_ok("create_enrollment", self.request(Method::POST, &["enrollments"])?.json(&body))
            .await?;
        let envelope = Self::read_envelope("create_enrollment", response).await?;
        let enrollment_ref = id_to_string(&envelope.data.id)
            .ok_or_else(|| ExternalServiceError::malformed("MDM create_enrollment returned no resource id"))?;
        let url = envelope
            .data
            .attributes
            .and_then(|a| a.url)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| ExternalServiceError::malformed("MDM create_enrollment returned no enrollment url"))?;
        Ok(Enrollment { enrollment_ref, url })
    }

    async fn list_group_links_inner(&self, group_ref: &str) -> Result<Vec<GroupLink>> {
        let response = self
            .send_ok("list_group_links", self.request(Method::GET, &["device_groups", group_ref])?)
            .await?;
        let envelope = Self::read_envelope("list_group_links", response).await?;
        let profiles = envelope
            .data
            .relationships
            .and_then(|r| r.profiles)
            .map(|p| p.data)
            .unwrap_or_default();
        Ok(profiles
            .iter()
            .filter_map(|p| id_to_string(&p.id))
            .map(|profile_ref| GroupLink {
                link_id: format!("{group_ref}/{profile_ref}"),
                profile_ref,
            })
            .collect())
    }
}

#[async_trait]
impl MdmClient for SimpleMdmClient {
    #[instrument(skip(self), err)]
    async fn create_group(&self, name: &str) -> Result<String> {
        let result = self.create_group_inner(name).await;
        record("create_group", &result);
        result
    }

    #[instrument(skip(self), err)]
    async fn rename_group(&self, group_ref: &str, name: &str) -> Result<()> {
        let builder = self.request(Method::PATCH, &["device_groups", group_ref])?.json(&json!({ "name": name }));
        let result = self.send_ok("rename_group", builder).await.map(|_| ());
        record("rename_group", &result);
        result
    }

    #[instrument(skip(self), err)]
    async fn delete_group(&self, group_ref: &str) -> Result<()> {
        let result = self
            .send_gone_ok("delete_group", self.request(Method::DELETE, &["device_groups", group_ref])?)
            .await;
        record("delete_group", &result);
        result
    }

    #[instrument(skip(self, content), fields(content_len = content.len()), err)]
    async fn create_profile(&self, name: &str, content: &ContentBlob) -> Result<String> {
        let result = self.create_profile_inner(name, content).await;
        record("create_profile", &result);
        result
    }

    #[instrument(skip(self, content), fields(content_len = content.len()), err)]
    async fn update_profile(&self, profile_ref: &str, name: &str, content: &ContentBlob) -> Result<()> {
        let body = json!({ "name": name, "mobileconfig": content.as_str() });
        let builder = self.request(Method::PATCH, &["profiles", profile_ref])?.json(&body);
        let result = self.send_ok("update_profile", builder).await.map(|_| ());
        record("update_profile", &result);
        result
    }

    #[instrument(skip(self), err)]
    async fn delete_profile(&self, profile_ref: &str) -> Result<()> {
        let result = self
            .send_gone_ok("delete_profile", self.request(Method::DELETE, &["profiles", profile_ref])?)
            .await;
        record("delete_profile", &result);
        result
    }

    #[instrument(skip(self), err)]
    async fn link_profile_to_group(&self, profile_ref: &str, group_ref: &str) -> Result<String> {
        let builder = self
            .request(Method::POST, &["profiles", profile_ref, "relationships", "device_groups"])?
            .json(&json!({ "device_group_id": id_to_json(group_ref) }));
        let result = self.send_link("link_profile_to_group", builder).await;
        record("link_profile_to_group", &result);
        result.map(|()| format!("{group_ref}/{profile_ref}"))
    }

    #[instrument(skip(self), err)]
    async fn unlink_profile_from_group(&self, profile_ref: &str, group_ref: &str) -> Result<()> {
        let builder = self.request(Method::DELETE, &["profiles", profile_ref, "relationships", "device_groups", group_ref])?;
        let result = self.send_gone_ok("unlink_profile_from_group", builder).await;
        record("unlink_profile_from_group", &result);
        result
    }

    #[instrument(skip(self), err)]
    async fn link_profile_to_device(&self, profile_ref: &str, device_ref: &str) -> Result<String> {
        let builder = self
            .request(Method::POST, &["profiles", profile_ref, "relationships", "devices"])?
            .json(&json!({ "device_id": id_to_json(device_ref) }));
        let result = self.send_link("link_profile_to_device", builder).await;
        record("link_profile_to_device", &result);
        result.map(|()| format!("{device_ref}/{profile_ref}"))
    }

    #[instrument(skip(self), err)]
    async fn unlink_profile_from_device(&self, profile_ref: &str, device_ref: &str) -> Result<()> {
        let builder = self.request(Method::DELETE, &["profiles", profile_ref, "relationships", "devices", device_ref])?;
        let result = self.send_gone_ok("unlink_profile_from_device", builder).await;
        record("unlink_profile_from_device", &result);
        result
    }

    #[instrument(skip(self), err)]
    async fn list_group_links(&self, group_ref: &str) -> Result<Vec<GroupLink>> {
        let result = self.list_group_links_inner(group_ref).await;
        record("list_group_links", &result);
        result
    }

    #[instrument(skip(self), err)]
    async fn create_enrollment(&self, group_ref: &str) -> Result<Enrollment> {
        let result = self.create_enrollment_inner(group_ref).await;
        record("create_enrollment", &result);
        result
    }

    #[instrument(skip(self), err)]
    async fn delete_enrollment(&self, enrollment_ref: &str) -> Result<()> {
        let result = self
            .send_gone_ok("delete_enrollment", self.request(Method::DELETE, &["enrollments", enrollment_ref])?)
            .await;
        record("delete_enrollment", &result);
        result
    }

    #[instrument(skip(self, message), err)]
    async fn lock_device(&self, device_ref: &str, message: &str) -> Result<()> {
        let builder = self
            .request(Method::POST, &["devices", device_ref, "lock"])?
            .json(&json!({ "message": message }));
        let result = self.send_ok("lock_device", builder).await.map(|_| ());
        record("lock_device", &result);
        result
    }

    #[instrument(skip(self), err)]
    async fn delete_device(&self, device_ref: &str) -> Result<()> {
        let result = self
            .send_gone_ok("delete_device", self.request(Method::DELETE, &["devices", device_ref])?)
            .await;
        record("delete_device", &result);
        result
    }
}
