//! Configuration module for billing-engine.

use crate::services::invoice_generator::InvoiceSettings;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct BillingEngineConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub invoicing: InvoicingConfig,
    pub schedule: ScheduleConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct InvoicingConfig {
    pub prefix: String,
    pub currency: String,
    pub payment_terms_days: i64,
}

impl InvoicingConfig {
    pub fn settings(&self) -> InvoiceSettings {
        InvoiceSettings {
            prefix: self.prefix.clone(),
            default_currency: self.currency.clone(),
            payment_terms_days: self.payment_terms_days,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub interval_secs: u64,
    pub run_on_startup: bool,
}

/// Read `name`, falling back to `default` when unset. A value that does not
/// parse is a configuration error.
fn parse_var<T>(name: &str, default: T) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| {
            AppError::ConfigError(anyhow::anyhow!("{} has invalid value '{}': {}", name, raw, e))
        }),
        Err(_) => Ok(default),
    }
}

impl BillingEngineConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        let payment_terms_days: i64 = parse_var("PAYMENT_TERMS_DAYS", 30)?;
        if payment_terms_days < 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "PAYMENT_TERMS_DAYS must not be negative"
            )));
        }
        let interval_secs: u64 = parse_var("BILLING_SCHEDULE_INTERVAL_SECS", 3600)?;
        if interval_secs == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "BILLING_SCHEDULE_INTERVAL_SECS must be greater than zero"
            )));
        }

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME").unwrap_or_else(|_| "billing-engine".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|s| !s.is_empty()),
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?,
                max_connections: parse_var("DATABASE_MAX_CONNECTIONS", 10)?,
                min_connections: parse_var("DATABASE_MIN_CONNECTIONS", 2)?,
            },
            invoicing: InvoicingConfig {
                prefix: env::var("INVOICE_PREFIX").unwrap_or_else(|_| "INV".to_string()),
                currency: env::var("INVOICE_CURRENCY").unwrap_or_else(|_| "USD".to_string()),
                payment_terms_days,
            },
            schedule: ScheduleConfig {
                interval_secs,
                run_on_startup: parse_var("BILLING_RUN_ON_STARTUP", false)?,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "DATABASE_URL",
        "DATABASE_MAX_CONNECTIONS",
        "INVOICE_PREFIX",
        "PAYMENT_TERMS_DAYS",
        "BILLING_SCHEDULE_INTERVAL_SECS",
        "BILLING_RUN_ON_STARTUP",
    ];

    fn clear() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn defaults_apply_when_only_database_url_is_set() {
        clear();
        env::set_var("DATABASE_URL", "postgres://localhost/billing");

        let config = BillingEngineConfig::from_env().unwrap();
        clear();

        assert_eq!(config.database.max_connections, 10);
        assert_eq!(config.database.min_connections, 2);
        assert_eq!(config.invoicing.prefix, "INV");
        assert_eq!(config.invoicing.payment_terms_days, 30);
        assert_eq!(config.schedule.interval_secs, 3600);
        assert!(!config.schedule.run_on_startup);
    }

    #[test]
    #[serial]
    fn missing_database_url_is_a_config_error() {
        clear();
        let err = BillingEngineConfig::from_env().unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));
    }

    #[test]
    #[serial]
    fn unparseable_number_is_rejected() {
        clear();
        env::set_var("DATABASE_URL", "postgres://localhost/billing");
        env::set_var("PAYMENT_TERMS_DAYS", "thirty");

        let result = BillingEngineConfig::from_env();
        clear();

        assert!(matches!(result, Err(AppError::ConfigError(_))));
    }

    #[test]
    #[serial]
    fn overrides_are_read() {
        clear();
        env::set_var("DATABASE_URL", "postgres://localhost/billing");
        env::set_var("INVOICE_PREFIX", "MKT");
        env::set_var("BILLING_RUN_ON_STARTUP", "true");

        let config = BillingEngineConfig::from_env().unwrap();
        clear();

        assert_eq!(config.invoicing.settings().prefix, "MKT");
        assert!(config.schedule.run_on_startup);
    }
}
