//! Periodic billing passes
//!
//! Every tick runs, in order: the invoice cycle (once per month, from the
//! configured cycle day on), payment retries, the installment pass and the
//! dunning pass. Each pass is idempotent, so a tick that is interrupted or
//! repeated leaves the books unchanged. A failing pass is logged and the
//! remaining passes still run.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, NaiveDate};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use core_kernel::DateRange;
use domain_billing::{
    BillingService, CycleReport, DunningReport, InstallmentReport, LineItemSource, RetryReport,
};

/// Reports from one scheduler tick; `None` when a pass did not run or failed
#[derive(Debug, Default)]
pub struct TickSummary {
    pub invoice_cycle: Option<CycleReport>,
    pub payment_retries: Option<RetryReport>,
    pub installments: Option<InstallmentReport>,
    pub dunning: Option<DunningReport>,
    pub failed_passes: u32,
}

pub struct Scheduler {
    service: Arc<BillingService>,
    line_items: Arc<dyn LineItemSource>,
    tick: Duration,
    invoice_cycle_day: u32,
    /// Last period the invoice cycle completed without account failures
    last_cycle: Option<DateRange>,
}

impl Scheduler {
    pub fn new(
        service: Arc<BillingService>,
        line_items: Arc<dyn LineItemSource>,
        tick: Duration,
        invoice_cycle_day: u32,
    ) -> Self {
        Self {
            service,
            line_items,
            tick,
            invoice_cycle_day,
            last_cycle: None,
        }
    }

    /// The billing period to invoice on `today`, if the cycle is due
    ///
    /// From the cycle day until the end of the month the previous month is
    /// due until one run finishes cleanly.
    pub fn due_cycle(&self, today: NaiveDate) -> Option<DateRange> {
        if today.day() < self.invoice_cycle_day {
            return None;
        }
        let period = DateRange::previous_month_of(today).ok()?;
        (self.last_cycle != Some(period)).then_some(period)
    }

    pub async fn run_once(&mut self) -> TickSummary {
        let today = self.service.today();
        let mut summary = TickSummary::default();

        if let Some(period) = self.due_cycle(today) {
            match self
                .service
                .run_invoice_cycle(period, self.line_items.as_ref())
                .await
            {
                Ok(report) => {
                    if report.failed == 0 {
                        self.last_cycle = Some(period);
                    }
                    summary.invoice_cycle = Some(report);
                }
                Err(err) => {
                    error!(error = %err, period_start = %period.start, "Invoice cycle failed");
                    summary.failed_passes += 1;
                }
            }
        }

        match self.service.run_payment_retries().await {
            Ok(report) => summary.payment_retries = Some(report),
            Err(err) => {
                error!(error = %err, "Payment retry pass failed");
                summary.failed_passes += 1;
            }
        }

        match self.service.run_installment_pass().await {
            Ok(report) => summary.installments = Some(report),
            Err(err) => {
                error!(error = %err, "Installment pass failed");
                summary.failed_passes += 1;
            }
        }

        match self.service.run_dunning_pass().await {
            Ok(report) => summary.dunning = Some(report),
            Err(err) => {
                error!(error = %err, "Dunning pass failed");
                summary.failed_passes += 1;
            }
        }

        debug!(%today, failed_passes = summary.failed_passes, "Scheduler tick finished");
        summary
    }

    /// Ticks until `shutdown` resolves; a tick in progress is finished first
    pub async fn run<F>(mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        info!(
            tick_secs = self.tick.as_secs(),
            invoice_cycle_day = self.invoice_cycle_day,
            "Scheduler started"
        );
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => {
                    self.run_once().await;
                }
            }
        }
        info!("Scheduler stopped");
    }
}
