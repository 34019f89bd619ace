//! Billing service
//!
//! [`BillingService`] is the command surface of the engine. Each command
//! runs under the target account's lock:
//!
//! 1. acquire the account lock (bounded wait)
//! 2. load the account and open a [`UnitOfWork`]
//! 3. apply domain operations to the working copy
//! 4. commit through [`BillingStore::commit`]
//!
//! A commit that loses the optimistic version check is retried from step 2
//! a bounded number of times. Gateway and notification calls never run
//! while a lock is held.

mod accounts;
mod collections;
mod credit_notes;
mod invoicing;
mod payments;
mod plans;
mod queries;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use tracing::{debug, warn};

use core_kernel::{
    BillingAccountId, DunningCaseId, InvoiceId, PaymentId, PaymentPlanId, Timezone,
};

use crate::account::BillingAccount;
use crate::config::BillingConfig;
use crate::dunning::DunningCase;
use crate::error::BillingError;
use crate::invoice::Invoice;
use crate::locks::AccountLocks;
use crate::payment::Payment;
use crate::payment_plan::PaymentPlan;
use crate::ports::{BillingStore, Clock, NotificationDispatcher, PaymentGateway, SystemClock};
use crate::unit_of_work::UnitOfWork;

pub use accounts::AccountLimits;
pub use collections::{DunningReport, ReconcileOutcome};
pub use credit_notes::CreditNoteRequest;
pub use invoicing::CycleReport;
pub use payments::{PaymentRequest, RetryReport};
pub use plans::{InstallmentReport, PaymentPlanRequest};
pub use queries::{AccountSummary, PaymentPlanStatus};

/// Orchestrates billing commands over the storage, gateway and
/// notification ports
pub struct BillingService {
    store: Arc<dyn BillingStore>,
    gateway: Arc<dyn PaymentGateway>,
    notifier: Arc<dyn NotificationDispatcher>,
    clock: Arc<dyn Clock>,
    timezone: Timezone,
    locks: AccountLocks,
    config: BillingConfig,
}

impl BillingService {
    /// Creates a service on the wall clock in UTC
    pub fn new(
        store: Arc<dyn BillingStore>,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn NotificationDispatcher>,
        config: BillingConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            notifier,
            clock: Arc::new(SystemClock),
            timezone: Timezone::default(),
            locks: AccountLocks::new(Duration::from_millis(config.lock_timeout_ms)),
            config,
        }
    }

    /// Replaces the time source
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sets the operator timezone used to derive calendar dates
    pub fn with_timezone(mut self, timezone: Timezone) -> Self {
        self.timezone = timezone;
        self
    }

    pub fn config(&self) -> &BillingConfig {
        &self.config
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Business date: the service clock's calendar day in the operator
    /// timezone
    pub fn today(&self) -> NaiveDate {
        self.timezone.local_date(self.now())
    }

    /// Runs `op` under the account lock, retrying on lost updates
    async fn with_account_lock<T, F, Fut>(
        &self,
        account_id: BillingAccountId,
        op: F,
    ) -> Result<T, BillingError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, BillingError>>,
    {
        let mut attempt = 0;
        loop {
            let guard = self.locks.acquire(account_id).await?;
            let result = op().await;
            drop(guard);

            match result {
                Err(err) if err.is_conflict() && attempt < self.config.max_conflict_retries => {
                    attempt += 1;
                    warn!(
                        account_id = %account_id,
                        attempt,
                        error = %err,
                        "Lost update on account, retrying"
                    );
                }
                other => return other,
            }
        }
    }

    async fn load_account(&self, id: BillingAccountId) -> Result<BillingAccount, BillingError> {
        self.store
            .load_account(id)
            .await?
            .ok_or_else(|| BillingError::AccountNotFound(id.to_string()))
    }

    async fn begin(&self, id: BillingAccountId) -> Result<UnitOfWork, BillingError> {
        Ok(UnitOfWork::begin(self.load_account(id).await?))
    }

    async fn commit(&self, unit: UnitOfWork) -> Result<(), BillingError> {
        let account_id = unit.account_id();
        let entries = unit.entries().len();
        self.store.commit(unit).await?;
        debug!(account_id = %account_id, entries, "Unit of work committed");
        Ok(())
    }

    // Loaders that prefer the copy already staged in the unit of work

    async fn load_invoice(&self, id: InvoiceId) -> Result<Invoice, BillingError> {
        self.store
            .load_invoice(id)
            .await?
            .ok_or_else(|| BillingError::InvoiceNotFound(id.to_string()))
    }

    async fn invoice_for_update(
        &self,
        unit: &UnitOfWork,
        id: InvoiceId,
    ) -> Result<Invoice, BillingError> {
        if let Some(staged) = unit.staged_invoice(id) {
            return Ok(staged.clone());
        }
        let invoice = self.load_invoice(id).await?;
        if invoice.account_id != unit.account_id() {
            return Err(BillingError::validation(format!(
                "invoice {} does not belong to account {}",
                id,
                unit.account_id()
            )));
        }
        Ok(invoice)
    }

    async fn load_payment(&self, id: PaymentId) -> Result<Payment, BillingError> {
        self.store
            .load_payment(id)
            .await?
            .ok_or_else(|| BillingError::PaymentNotFound(id.to_string()))
    }

    async fn payment_for_update(
        &self,
        unit: &UnitOfWork,
        id: PaymentId,
    ) -> Result<Payment, BillingError> {
        match unit.staged_payment(id) {
            Some(staged) => Ok(staged.clone()),
            None => self.load_payment(id).await,
        }
    }

    async fn load_plan(&self, id: PaymentPlanId) -> Result<PaymentPlan, BillingError> {
        self.store
            .load_payment_plan(id)
            .await?
            .ok_or_else(|| BillingError::PaymentPlanNotFound(id.to_string()))
    }

    async fn plan_for_update(
        &self,
        unit: &UnitOfWork,
        id: PaymentPlanId,
    ) -> Result<PaymentPlan, BillingError> {
        if let Some(staged) = unit.staged_payment_plan(id) {
            return Ok(staged.clone());
        }
        let plan = self.load_plan(id).await?;
        if plan.account_id != unit.account_id() {
            return Err(BillingError::validation(format!(
                "payment plan {} does not belong to account {}",
                id,
                unit.account_id()
            )));
        }
        Ok(plan)
    }

    async fn load_case(&self, id: DunningCaseId) -> Result<DunningCase, BillingError> {
        self.store
            .load_dunning_case(id)
            .await?
            .ok_or_else(|| BillingError::DunningCaseNotFound(id.to_string()))
    }

    async fn case_for_update(
        &self,
        unit: &UnitOfWork,
        id: DunningCaseId,
    ) -> Result<DunningCase, BillingError> {
        match unit.staged_dunning_case(id) {
            Some(staged) => Ok(staged.clone()),
            None => self.load_case(id).await,
        }
    }

    /// Committed invoices of the unit's account, overlaid with staged copies
    async fn current_invoices(&self, unit: &UnitOfWork) -> Result<Vec<Invoice>, BillingError> {
        let mut invoices = self.store.invoices_for_account(unit.account_id()).await?;
        for staged in unit.invoices() {
            match invoices.iter_mut().find(|i| i.id == staged.id) {
                Some(existing) => *existing = staged.clone(),
                None => invoices.push(staged.clone()),
            }
        }
        Ok(invoices)
    }

    async fn current_plans(&self, unit: &UnitOfWork) -> Result<Vec<PaymentPlan>, BillingError> {
        let mut plans = self.store.payment_plans_for_account(unit.account_id()).await?;
        for staged in unit.payment_plans() {
            match plans.iter_mut().find(|p| p.id == staged.id) {
                Some(existing) => *existing = staged.clone(),
                None => plans.push(staged.clone()),
            }
        }
        Ok(plans)
    }

    async fn current_cases(&self, unit: &UnitOfWork) -> Result<Vec<DunningCase>, BillingError> {
        let mut cases = self.store.dunning_cases_for_account(unit.account_id()).await?;
        for staged in unit.dunning_cases() {
            match cases.iter_mut().find(|c| c.id == staged.id) {
                Some(existing) => *existing = staged.clone(),
                None => cases.push(staged.clone()),
            }
        }
        Ok(cases)
    }
}
