//! # nookctl: Control Layer for Family Device Restrictions
//!
//! `nookctl` is the backend that keeps parental restriction profiles in step with an external
//! mobile device management (MDM) service. Parents organise their household into a **family**,
//! pick restriction profiles for it, and assign those profiles to their children's devices.
//! The MDM is what actually pushes the profiles to the devices; `nookctl` decides what should be
//! pushed where and makes sure the MDM agrees.
//!
//! ## Overview
//!
//! Two stores hold overlapping truth. The local **assignment ledger** ([`ledger`]) records
//! families, the profiles they use and which device gets which profile. The MDM holds device
//! groups, profile payloads and the links between them. Every MDM call can fail or time out, so
//! the two are kept consistent by ordering rather than by distributed transactions:
//!
//! - creates happen in the MDM first and are recorded locally only once confirmed
//! - deletes clean up in the MDM first, but a failed cleanup never blocks the local delete
//! - drift left behind by crashes or out-of-band edits is found by a read-only verify and fixed
//!   by an idempotent repair or a periodic bulk sync
//!
//! The four predefined profile types (first phone, explorer, guardian, time out) are each
//! served by one **master profile** in the MDM, shared by every family that uses the type.
//! Custom profiles are rendered per family from the parent's settings.
//!
//! ## Architecture
//!
//! The application is built on [Axum](https://github.com/tokio-rs/axum) for the HTTP layer and
//! uses PostgreSQL for persistence.
//!
//! ### Core Components
//!
//! The **API layer** ([`api`]) exposes the management API at `/api/v1/*`. Handlers authorize the
//! caller and hand the operation to the coordinator; they never touch the ledger or the MDM.
//!
//! The **authentication layer** ([`auth`]) reads the caller identity from trusted headers set by
//! an authenticating proxy and checks role and family ownership.
//!
//! The **sync layer** ([`sync`]) holds the [`SyncCoordinator`](sync::SyncCoordinator), the only
//! component that talks to both stores. It serializes mutations per family and implements the
//! ordering rules above.
//!
//! The **MDM client** ([`mdm`]) talks to a SimpleMDM-style REST API with bounded timeouts and
//! classifies every failure as retryable or not.
//!
//! The **content layer** ([`content`]) renders profile payloads from templates.
//!
//! The **database layer** ([`db`]) uses the repository pattern for queries; the ledger builds
//! its transactions and invariant checks on top of it.
//!
//! ## Quick Start
//!
//! ```no_run
//! use clap::Parser;
//! use nookctl::{Application, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = nookctl::config::Args::parse();
//!     let config = Config::load(&args)?;
//!     nookctl::telemetry::init_telemetry(config.enable_otel_export)?;
//!
//!     let app = Application::new(config).await?;
//!     app.serve(async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Database Setup
//!
//! The application runs migrations on startup:
//!
//! ```no_run
//! # use sqlx::PgPool;
//! # async fn example(pool: PgPool) -> Result<(), sqlx::migrate::MigrateError> {
//! nookctl::migrator().run(&pool).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration
//!
//! See the [`config`] module for configuration options.
pub mod api;
pub mod auth;
pub mod config;
pub mod content;
pub mod db;
pub mod errors;
pub mod ledger;
pub mod mdm;
mod openapi;
pub mod sync;
pub mod telemetry;
pub mod types;

#[cfg(test)]
pub mod test_utils;

use crate::{
    config::CorsOrigin,
    content::MobileconfigGenerator,
    ledger::postgres::PgLedger,
    mdm::simplemdm::SimpleMdmClient,
    openapi::ApiDoc,
    sync::{BootstrapReport, BulkReport, SyncCoordinator},
};
use axum::{
    Json, Router,
    http::{self, HeaderValue},
    routing::{delete, get, post, put},
};
use axum_prometheus::PrometheusMetricLayer;
use bon::Builder;
pub use config::Config;
use sqlx::{PgPool, postgres::PgPoolOptions};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{Level, debug, info, instrument, warn};
use utoipa::OpenApi;
use utoipa_scalar::{Scalar, Servable};

/// Application state shared across all request handlers.
///
/// # Example
///
/// ```ignore
/// let state = AppState::builder()
///     .config(config)
///     .coordinator(Arc::new(coordinator))
///     .build();
/// ```
#[derive(Clone, Builder)]
pub struct AppState {
    pub config: Config,
    pub coordinator: Arc<SyncCoordinator>,
}

/// Get the nookctl database migrator
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}

/// Connect to PostgreSQL with the configured pool limits and run pending migrations.
#[instrument(skip_all)]
async fn setup_database(config: &Config) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .min_connections(config.database.min_connections)
        .acquire_timeout(config.database.acquire_timeout)
        .connect(&config.database.url)
        .await?;
    migrator().run(&pool).await?;
    info!("Database ready");
    Ok(pool)
}

/// Wire the production collaborators into a coordinator.
fn build_coordinator(config: &Config, pool: PgPool) -> anyhow::Result<SyncCoordinator> {
    let ledger = Arc::new(PgLedger::new(pool));
    let mdm = Arc::new(SimpleMdmClient::new(&config.mdm)?);
    let content = Arc::new(MobileconfigGenerator::new()?);
    Ok(SyncCoordinator::new(ledger, mdm, content).with_bulk_concurrency(config.sync.bulk_concurrency))
}

fn create_cors_layer(config: &Config) -> anyhow::Result<CorsLayer> {
    let mut origins = Vec::new();
    for origin in &config.cors.allowed_origins {
        let header_value = match origin {
            CorsOrigin::Wildcard => "*".parse::<HeaderValue>()?,
            CorsOrigin::Url(url) => url.as_str().trim_end_matches('/').parse::<HeaderValue>()?,
        };
        origins.push(header_value);
    }

    let mut cors = CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([http::Method::GET, http::Method::POST, http::Method::PUT, http::Method::PATCH, http::Method::DELETE])
        .allow_headers([
            http::header::CONTENT_TYPE,
            http::HeaderName::from_bytes(config.auth.user_header.as_bytes())?,
            http::HeaderName::from_bytes(config.auth.role_header.as_bytes())?,
            http::HeaderName::from_bytes(config.auth.family_header.as_bytes())?,
        ])
        .allow_credentials(config.cors.allow_credentials)
        .expose_headers(vec![http::header::LOCATION, http::header::RETRY_AFTER]);

    if let Some(max_age) = config.cors.max_age {
        cors = cors.max_age(std::time::Duration::from_secs(max_age));
    }

    Ok(cors)
}

/// Build the application router with all endpoints and middleware.
///
/// This function constructs the complete Axum router with:
/// - Management API routes under `/api/v1`
/// - OpenAPI document and Scalar UI
/// - Optional Prometheus metrics
/// - CORS configuration
/// - Tracing middleware
///
/// # Errors
///
/// Returns an error if the CORS configuration is invalid.
pub fn build_router(state: &AppState) -> anyhow::Result<Router> {
    use api::handlers::{devices, enrollments, families, master_profiles, profiles, sync};

    let api_routes = Router::new()
        // Families
        .route("/families", get(families::list_families).post(families::create_family))
        .route(
            "/families/{family_id}",
            get(families::get_family)
                .patch(families::update_family)
                .delete(families::delete_family),
        )
        // Family profiles
        .route(
            "/families/{family_id}/profiles",
            get(profiles::list_family_profiles).post(profiles::assign_profile),
        )
        .route(
            "/profiles/{profile_id}",
            get(profiles::get_profile)
                .patch(profiles::update_profile)
                .delete(profiles::unassign_profile),
        )
        // Devices
        .route(
            "/families/{family_id}/devices",
            get(devices::list_devices).post(devices::register_device),
        )
        .route("/devices/{device_id}", get(devices::get_device).delete(devices::delete_device))
        .route("/devices/{device_id}/profile", put(devices::reassign_device))
        .route("/devices/{device_id}/enrollment", put(devices::record_enrollment))
        .route("/devices/{device_id}/lock", post(devices::lock_device))
        // Enrollment codes
        .route("/families/{family_id}/enroll", post(enrollments::issue_enrollment_code))
        .route("/enroll/validate/{code}", get(enrollments::validate_enrollment_code))
        // Consistency
        .route("/families/{family_id}/sync", get(sync::verify_family))
        .route("/families/{family_id}/sync/repair", post(sync::repair_family))
        // Master profiles and administration
        .route("/master-profiles", get(master_profiles::list_master_profiles))
        .route(
            "/admin/master-profiles/bootstrap",
            post(master_profiles::bootstrap_master_profiles),
        )
        .route(
            "/admin/master-profiles/{master_profile_id}",
            delete(master_profiles::delete_master_profile),
        )
        .route("/admin/sync", post(sync::bulk_sync))
        .with_state(state.clone());

    let router = Router::new()
        .route("/healthz", get(|| async { "OK" }))
        .route("/api-docs/openapi.json", get(|| async { Json(ApiDoc::openapi()) }))
        .nest("/api/v1", api_routes)
        .merge(Scalar::with_url("/docs", ApiDoc::openapi()));

    let cors_layer = create_cors_layer(&state.config)?;
    let mut router = router.layer(cors_layer);

    // Add Prometheus metrics if enabled
    if state.config.enable_metrics {
        let (prometheus_layer, metric_handle) = PrometheusMetricLayer::pair();
        router = router
            .route("/internal/metrics", get(move || async move { metric_handle.render() }))
            .layer(prometheus_layer);
    }

    // Add tracing layer
    let router = router.layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_request(DefaultOnRequest::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    );

    Ok(router)
}

/// A fully wired service: database pool, coordinator and router.
pub struct Application {
    router: Router,
    state: AppState,
    config: Config,
    pool: PgPool,
}

impl Application {
    /// Create a new application instance with all resources initialized
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        debug!(host = %config.host, port = config.port, mdm = %config.mdm.base_url, "Starting control layer");

        let pool = setup_database(&config).await?;
        let coordinator = Arc::new(build_coordinator(&config, pool.clone())?);
        let state = AppState::builder().config(config.clone()).coordinator(coordinator).build();

        if config.sync.bootstrap_on_startup {
            let report = state.coordinator.bootstrap_master_profiles().await?;
            if !report.failed.is_empty() {
                warn!(failed = report.failed.len(), "Some master profiles could not be bootstrapped");
            }
        }

        let router = build_router(&state)?;
        Ok(Self {
            router,
            state,
            config,
            pool,
        })
    }

    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.state.coordinator
    }

    /// Create any missing master profiles, then release the database pool.
    pub async fn bootstrap(self) -> anyhow::Result<BootstrapReport> {
        let report = self.state.coordinator.bootstrap_master_profiles().await?;
        self.pool.close().await;
        Ok(report)
    }

    /// Re-assert every expected link for every family, then release the database pool.
    pub async fn bulk_sync(self) -> anyhow::Result<BulkReport> {
        let report = self.state.coordinator.bulk_sync().await?;
        self.pool.close().await;
        Ok(report)
    }

    /// Start serving the application
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr).await?;
        info!(
            "Control layer listening on http://{}, available at http://localhost:{}",
            bind_addr, self.config.port
        );

        // Run the server with graceful shutdown
        axum::serve(listener, self.router).with_graceful_shutdown(shutdown).await?;

        // Close database connections
        info!("Closing database connections...");
        self.pool.close().await;

        // Shutdown telemetry
        info!("Shutting down telemetry...");
        telemetry::shutdown_telemetry();

        Ok(())
    }
}
