//! Billing Worker Binary
//!
//! # Usage
//!
//! ```bash
//! BILLING_DATABASE_URL=postgres://... BILLING_GATEWAY__API_KEY=... cargo run --bin billing-worker
//! ```
//!
//! # Environment Variables
//!
//! * `BILLING_CONFIG` - Optional config file (TOML, YAML or JSON)
//! * `BILLING_DATABASE_URL` - PostgreSQL connection string
//! * `BILLING_LOG_LEVEL` - trace, debug, info, warn, error (default: info)
//! * `BILLING_LOG_FORMAT` - `pretty` or `json`
//! * `BILLING_TIMEZONE` - IANA timezone deciding the business date
//! * `BILLING_TICK_SECS` - Seconds between passes (default: 300)
//! * `BILLING_INVOICE_CYCLE_DAY` - Day of month the previous month is invoiced
//! * `BILLING_GATEWAY__BASE_URL`, `BILLING_GATEWAY__API_KEY` - Payment processor

use anyhow::Context;
use interface_worker::{bootstrap, init_tracing, WorkerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = WorkerConfig::load().context("loading worker configuration")?;
    init_tracing(&config);

    tracing::info!(
        tick_secs = config.tick_secs,
        invoice_cycle_day = config.invoice_cycle_day,
        "Starting billing worker"
    );

    let scheduler = bootstrap(&config)
        .await
        .context("starting billing service")?;
    scheduler.run(shutdown_signal()).await;

    tracing::info!("Billing worker shutdown complete");
    Ok(())
}

/// Waits for Ctrl+C or SIGTERM
///
/// If a handler cannot be installed that signal is ignored and the other
/// one still stops the worker.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, finishing current pass");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, finishing current pass");
        }
    }
}
