//! Test utilities: an application wired to in-memory collaborators and request helpers.

use crate::{
    AppState,
    api::models::{families::FamilyResponse, profiles::FamilyProfileResponse, users::CurrentUser},
    build_router,
    config::Config,
    content::MobileconfigGenerator,
    ledger::memory::InMemoryLedger,
    mdm::fake::FakeMdm,
    sync::SyncCoordinator,
    types::{FamilyId, Role},
};
use axum::http::StatusCode;
use axum_test::{TestRequest, TestServer};
use std::sync::Arc;
use uuid::Uuid;

/// Application state backed by an [`InMemoryLedger`] and a [`FakeMdm`].
///
/// The ledger and MDM handles are kept so tests can inspect or sabotage them directly.
pub struct TestApp {
    pub state: AppState,
    pub ledger: Arc<InMemoryLedger>,
    pub mdm: Arc<FakeMdm>,
}

impl TestApp {
    pub fn server(&self) -> TestServer {
        let router = build_router(&self.state).expect("Failed to build router");
        TestServer::new(router).expect("Failed to create test server")
    }
}

pub fn create_test_config() -> Config {
    let mut config = Config::default();
    config.mdm.api_key = "test-key".to_string();
    config.enable_metrics = false;
    config
}

pub fn create_test_app() -> TestApp {
    let ledger = Arc::new(InMemoryLedger::new());
    let mdm = Arc::new(FakeMdm::new());
    let content = Arc::new(MobileconfigGenerator::new().expect("Failed to load profile templates"));
    let coordinator = SyncCoordinator::new(ledger.clone(), mdm.clone(), content);

    let state = AppState::builder()
        .config(create_test_config())
        .coordinator(Arc::new(coordinator))
        .build();

    TestApp { state, ledger, mdm }
}

pub fn parent_user() -> CurrentUser {
    CurrentUser {
        id: Uuid::new_v4(),
        role: Role::Parent,
        family_id: None,
    }
}

pub fn admin_user() -> CurrentUser {
    CurrentUser {
        id: Uuid::new_v4(),
        role: Role::Admin,
        family_id: None,
    }
}

pub fn child_user(family_id: FamilyId) -> CurrentUser {
    CurrentUser {
        id: Uuid::new_v4(),
        role: Role::Child,
        family_id: Some(family_id),
    }
}

/// Attach the identity headers an authenticating proxy would set.
pub trait AsUser {
    fn as_user(self, user: &CurrentUser) -> Self;
}

impl AsUser for TestRequest {
    fn as_user(self, user: &CurrentUser) -> Self {
        let request = self
            .add_header("x-nook-user", user.id.to_string())
            .add_header("x-nook-role", user.role.to_string());
        match user.family_id {
            Some(family_id) => request.add_header("x-nook-family", family_id.to_string()),
            None => request,
        }
    }
}

/// Create the four master profiles in the fake MDM.
pub async fn bootstrap(app: &TestApp) {
    let report = app
        .state
        .coordinator
        .bootstrap_master_profiles()
        .await
        .expect("Failed to bootstrap master profiles");
    assert!(report.failed.is_empty(), "bootstrap failures: {:?}", report.failed);
}

pub async fn create_family_as(server: &TestServer, user: &CurrentUser, name: &str) -> FamilyResponse {
    let response = server
        .post("/api/v1/families")
        .as_user(user)
        .json(&serde_json::json!({ "name": name }))
        .await;
    response.assert_status(StatusCode::CREATED);
    response.json()
}

pub async fn assign_profile_as(server: &TestServer, user: &CurrentUser, family_id: FamilyId, body: serde_json::Value) -> FamilyProfileResponse {
    let response = server
        .post(&format!("/api/v1/families/{family_id}/profiles"))
        .as_user(user)
        .json(&body)
        .await;
    response.assert_status(StatusCode::CREATED);
    response.json()
}
