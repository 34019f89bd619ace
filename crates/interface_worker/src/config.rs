//! Worker configuration
//!
//! Loaded from an optional file named by `BILLING_CONFIG`, then overridden
//! by `BILLING_*` environment variables. Nested keys use `__`, so
//! `BILLING_GATEWAY__BASE_URL` sets `gateway.base_url` and
//! `BILLING_BILLING__INVOICE_DUE_DAYS` sets the engine's net terms.

use std::time::Duration;

use serde::Deserialize;

use core_kernel::Timezone;
use domain_billing::BillingConfig;
use infra_db::DatabaseConfig;

use crate::error::WorkerError;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Payment gateway connection settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    pub base_url: String,
    pub api_key: String,
    pub timeout_secs: u64,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8090".to_string(),
            api_key: String::new(),
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub min_connections: u32,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 2,
        }
    }
}

/// Worker process configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Database URL
    pub database_url: String,
    /// Log level
    pub log_level: String,
    pub log_format: LogFormat,
    /// Operator timezone (IANA name) that decides the business date
    pub timezone: Timezone,
    /// Seconds between scheduler ticks
    pub tick_secs: u64,
    /// Day of month (1-28) on which the previous month is invoiced
    pub invoice_cycle_day: u32,
    pub pool: PoolSettings,
    pub gateway: GatewaySettings,
    pub billing: BillingConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/billing".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            timezone: Timezone::default(),
            tick_secs: 300,
            invoice_cycle_day: 1,
            pool: PoolSettings::default(),
            gateway: GatewaySettings::default(),
            billing: BillingConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Loads `.env`, the optional config file and the environment
    pub fn load() -> Result<Self, WorkerError> {
        dotenvy::dotenv().ok();
        let file = std::env::var("BILLING_CONFIG").ok();
        Self::from_sources(file.as_deref(), environment())
    }

    /// Builds the configuration from an optional file plus an environment source
    pub fn from_sources(
        file: Option<&str>,
        environment: config::Environment,
    ) -> Result<Self, WorkerError> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }
        let config: WorkerConfig = builder
            .add_source(environment)
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), WorkerError> {
        if !(1..=28).contains(&self.invoice_cycle_day) {
            return Err(WorkerError::InvalidConfig(format!(
                "invoice_cycle_day must be between 1 and 28, got {}",
                self.invoice_cycle_day
            )));
        }
        if self.tick_secs == 0 {
            return Err(WorkerError::InvalidConfig("tick_secs must be positive".into()));
        }
        if self.pool.min_connections > self.pool.max_connections {
            return Err(WorkerError::InvalidConfig(
                "pool.min_connections exceeds pool.max_connections".into(),
            ));
        }
        Ok(())
    }

    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }

    pub fn database(&self) -> DatabaseConfig {
        DatabaseConfig::new(&self.database_url)
            .max_connections(self.pool.max_connections)
            .min_connections(self.pool.min_connections)
    }
}

/// `BILLING_*` variables with `__` between nested keys
pub fn environment() -> config::Environment {
    config::Environment::with_prefix("BILLING")
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> config::Environment {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        environment().source(Some(map))
    }

    #[test]
    fn test_defaults_without_sources() {
        let config = WorkerConfig::from_sources(None, env(&[])).unwrap();
        assert_eq!(config.database_url, "postgres://localhost/billing");
        assert_eq!(config.invoice_cycle_day, 1);
        assert_eq!(config.log_format, LogFormat::Pretty);
        assert_eq!(config.billing.invoice_due_days, 14);
    }

    #[test]
    fn test_environment_overrides_nested_keys() {
        let config = WorkerConfig::from_sources(
            None,
            env(&[
                ("BILLING_DATABASE_URL", "postgres://db/billing"),
                ("BILLING_LOG_FORMAT", "json"),
                ("BILLING_TIMEZONE", "Europe/Berlin"),
                ("BILLING_TICK_SECS", "60"),
                ("BILLING_GATEWAY__BASE_URL", "https://pay.example.net"),
                ("BILLING_BILLING__INVOICE_DUE_DAYS", "30"),
            ]),
        )
        .unwrap();

        assert_eq!(config.database_url, "postgres://db/billing");
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.timezone, "Europe/Berlin".parse().unwrap());
        assert_eq!(config.tick(), Duration::from_secs(60));
        assert_eq!(config.gateway.base_url, "https://pay.example.net");
        assert_eq!(config.billing.invoice_due_days, 30);
    }

    #[test]
    fn test_cycle_day_outside_every_month_is_rejected() {
        let result =
            WorkerConfig::from_sources(None, env(&[("BILLING_INVOICE_CYCLE_DAY", "31")]));
        assert!(matches!(result, Err(WorkerError::InvalidConfig(_))));
    }

    #[test]
    fn test_pool_settings_flow_into_database_config() {
        let mut config = WorkerConfig::default();
        config.pool.max_connections = 25;
        let database = config.database();
        assert_eq!(database.max_connections, 25);
        assert_eq!(database.url, config.database_url);
    }

    proptest::proptest! {
        #[test]
        fn cycle_day_valid_only_within_every_month(day in 0u32..40) {
            let config = WorkerConfig {
                invoice_cycle_day: day,
                ..WorkerConfig::default()
            };
            proptest::prop_assert_eq!(config.validate().is_ok(), (1..=28).contains(&day));
        }
    }
}
