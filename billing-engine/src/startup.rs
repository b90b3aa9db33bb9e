//! Application startup and lifecycle management.

use crate::config::BillingEngineConfig;
use crate::models::JobTrigger;
use crate::services::{
    get_metrics, init_metrics, BillingOrchestrator, BillingStore, Database, TracingEventSink,
};
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use serde_json::json;
use service_core::error::AppError;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

/// State for health check endpoints.
#[derive(Clone)]
struct HealthState {
    store: Arc<dyn BillingStore>,
}

/// Health check endpoint for Docker/K8s liveness probes.
async fn health_check(State(state): State<HealthState>) -> impl IntoResponse {
    match state.store.health_check().await {
        Ok(_) => {
            tracing::debug!("Health check passed");
            (
                StatusCode::OK,
                Json(json!({
                    "status": "ok",
                    "service": "billing-engine",
                    "version": env!("CARGO_PKG_VERSION")
                })),
            )
        }
        Err(e) => {
            tracing::warn!(error = %e, "Health check failed - store unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "service": "billing-engine",
                    "error": e.to_string()
                })),
            )
        }
    }
}

/// Readiness check endpoint for K8s readiness probes.
async fn readiness_check(State(state): State<HealthState>) -> impl IntoResponse {
    match state.store.health_check().await {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// Metrics endpoint for Prometheus scraping.
async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        get_metrics(),
    )
}

/// Health, readiness and metrics routes over any store.
pub fn router(store: Arc<dyn BillingStore>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(HealthState { store })
}

/// Run scheduled billing for the current UTC date every `interval` until
/// `shutdown` fires.
///
/// The first tick fires immediately only when `run_on_startup` is set. A run
/// in flight when `shutdown` fires stops before its next contract and leaves
/// its job cancelled.
pub async fn run_scheduler(
    orchestrator: BillingOrchestrator,
    interval: Duration,
    run_on_startup: bool,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    if !run_on_startup {
        ticker.tick().await;
    }

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("Billing scheduler shutting down");
                break;
            }
            _ = ticker.tick() => {}
        }

        let today = Utc::now().date_naive();
        match orchestrator
            .run_billing_job_until(today, JobTrigger::Scheduled, None, &shutdown)
            .await
        {
            Ok(summary) => tracing::info!(
                job_id = %summary.job_id,
                success = summary.success,
                invoices_created = summary.invoices_created,
                skipped = summary.skipped_customers,
                "Scheduled billing run finished"
            ),
            Err(e) => tracing::error!(error = %e, as_of_date = %today, "Scheduled billing run failed"),
        }
    }
}

/// Application container for managing server lifecycle.
pub struct Application {
    http_port: u16,
    http_listener: TcpListener,
    config: BillingEngineConfig,
    db: Arc<Database>,
    orchestrator: BillingOrchestrator,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: BillingEngineConfig) -> Result<Self, AppError> {
        Self::build_internal(config, true).await
    }

    /// Build the application without running migrations.
    pub async fn build_without_migrations(config: BillingEngineConfig) -> Result<Self, AppError> {
        Self::build_internal(config, false).await
    }

    async fn build_internal(
        config: BillingEngineConfig,
        run_migrations: bool,
    ) -> Result<Self, AppError> {
        init_metrics();

        let db = Database::new(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            e
        })?;

        if run_migrations {
            db.run_migrations().await.map_err(|e| {
                tracing::error!(error = %e, "Failed to run migrations");
                e
            })?;
        }

        let db = Arc::new(db);
        let orchestrator = BillingOrchestrator::new(
            db.clone(),
            Arc::new(TracingEventSink),
            config.invoicing.settings(),
        );

        let http_addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let http_listener = TcpListener::bind(http_addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %http_addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let http_port = http_listener.local_addr()?.port();

        tracing::info!(http_port = http_port, "Billing engine listener bound");

        Ok(Self {
            http_port,
            http_listener,
            config,
            db,
            orchestrator,
        })
    }

    /// Get the HTTP port the server is listening on.
    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    /// Get a reference to the database.
    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn orchestrator(&self) -> &BillingOrchestrator {
        &self.orchestrator
    }

    /// Serve HTTP and run the billing scheduler until `shutdown` resolves,
    /// then wait for the scheduler to leave its current job.
    pub async fn run_until_stopped<F>(self, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let http_router = router(self.db.clone());
        let shutdown_token = CancellationToken::new();

        let scheduler = tokio::spawn(run_scheduler(
            self.orchestrator.clone(),
            Duration::from_secs(self.config.schedule.interval_secs),
            self.config.schedule.run_on_startup,
            shutdown_token.clone(),
        ));

        tracing::info!(
            service = "billing-engine",
            version = env!("CARGO_PKG_VERSION"),
            http_port = self.http_port,
            schedule_interval_secs = self.config.schedule.interval_secs,
            "Service ready to accept connections"
        );

        let result = axum::serve(self.http_listener, http_router)
            .with_graceful_shutdown(shutdown)
            .await;

        shutdown_token.cancel();
        if let Err(e) = scheduler.await {
            tracing::error!(error = %e, "Billing scheduler task failed");
        }

        result.map_err(|e| {
            tracing::error!(error = %e, "HTTP server error");
            std::io::Error::other(format!("HTTP server error: {}", e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{InvoiceSettings, MemoryStore, NoopEventSink};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[tokio::test]
    async fn health_reports_ok_for_a_working_store() {
        let app = router(Arc::new(MemoryStore::new()));
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn readiness_fails_when_store_is_down() {
        let store = Arc::new(MemoryStore::new());
        store.inject_failure("health_check").await;
        let app = router(store);
        let response = app
            .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn scheduler_stops_when_shutdown_fires() {
        let orchestrator = BillingOrchestrator::new(
            Arc::new(MemoryStore::new()),
            Arc::new(NoopEventSink),
            InvoiceSettings::default(),
        );
        let shutdown = CancellationToken::new();
        let scheduler = tokio::spawn(run_scheduler(
            orchestrator,
            Duration::from_secs(3600),
            false,
            shutdown.clone(),
        ));

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), scheduler)
            .await
            .expect("Scheduler did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn metrics_are_served_as_text() {
        init_metrics();
        let app = router(Arc::new(MemoryStore::new()));
        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
