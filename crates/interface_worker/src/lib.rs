//! Billing Worker
//!
//! The long-running process that drives the billing engine's batch work:
//! invoice cycles, payment retries, installment checks and dunning.
//!
//! # Architecture
//!
//! - **Config**: layered file + environment configuration
//! - **Gateway**: HTTP client for the payment processor
//! - **Notifier**: log-backed delivery of dunning notices and receipts
//! - **Scheduler**: the tick loop running each pass
//!
//! # Example
//!
//! ```rust,ignore
//! let config = WorkerConfig::load()?;
//! init_tracing(&config);
//! let scheduler = bootstrap(&config).await?;
//! scheduler.run(shutdown_signal()).await;
//! ```

pub mod config;
pub mod error;
pub mod gateway;
pub mod notifier;
pub mod scheduler;

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use domain_billing::{BillingService, UsageLineItems};
use infra_db::{create_pool, run_migrations, PgBillingStore, PgUsageSource};

pub use crate::config::{LogFormat, WorkerConfig};
pub use crate::error::WorkerError;
pub use crate::gateway::HttpPaymentGateway;
pub use crate::notifier::LogNotificationDispatcher;
pub use crate::scheduler::{Scheduler, TickSummary};

/// Installs the global tracing subscriber
///
/// `RUST_LOG` wins over the configured level.
pub fn init_tracing(config: &WorkerConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .init(),
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .init(),
    }
}

/// Connects to PostgreSQL, applies migrations and wires the service
pub async fn bootstrap(config: &WorkerConfig) -> Result<Scheduler, WorkerError> {
    let pool = create_pool(config.database()).await?;
    run_migrations(&pool).await?;

    let store = Arc::new(PgBillingStore::new(pool.clone()));
    let usage = Arc::new(PgUsageSource::new(pool));
    let gateway = Arc::new(HttpPaymentGateway::new(&config.gateway)?);
    let notifier = Arc::new(LogNotificationDispatcher::new());

    let service = Arc::new(
        BillingService::new(store, gateway, notifier, config.billing.clone())
            .with_timezone(config.timezone),
    );
    let line_items = Arc::new(UsageLineItems::new(usage, config.billing.usage_rates.clone()));

    info!(
        timezone = %config.timezone.0.name(),
        currency = %config.billing.currency,
        "Billing service ready"
    );
    Ok(Scheduler::new(
        service,
        line_items,
        config.tick(),
        config.invoice_cycle_day,
    ))
}
