//! Billing Engine entry point.

use billing_engine::config::BillingEngineConfig;
use billing_engine::services::init_metrics;
use billing_engine::startup::Application;

use service_core::observability::init_tracing;
use tokio::signal;

/// Resolves on Ctrl+C or SIGTERM. The scheduler stops before its next
/// contract once this fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, stopping billing engine"),
        _ = terminate => tracing::info!("Received SIGTERM, stopping billing engine"),
    }
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    dotenvy::dotenv().ok();

    let config = BillingEngineConfig::from_env().map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        std::io::Error::other(format!("Configuration error: {}", e))
    })?;

    init_tracing(
        &config.service_name,
        &config.log_level,
        config.otlp_endpoint.as_deref(),
    );
    init_metrics();

    tracing::info!(
        service_name = %config.service_name,
        version = %config.service_version,
        otlp_enabled = config.otlp_endpoint.is_some(),
        http_port = config.common.port,
        db_max_connections = config.database.max_connections,
        invoice_prefix = %config.invoicing.prefix,
        payment_terms_days = config.invoicing.payment_terms_days,
        schedule_interval_secs = config.schedule.interval_secs,
        run_on_startup = config.schedule.run_on_startup,
        "Starting billing-engine"
    );

    let app = Application::build(config).await.map_err(|e| {
        tracing::error!(error = %e, "Failed to build application");
        std::io::Error::other(format!("Application build error: {}", e))
    })?;

    app.run_until_stopped(shutdown_signal()).await?;

    tracing::info!("Billing engine stopped");
    Ok(())
}
