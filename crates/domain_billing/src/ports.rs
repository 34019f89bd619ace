//! Billing ports
//!
//! Outbound interfaces the engine depends on. Adapters live in `infra_db`
//! (storage, usage feed) and `interface_worker` (gateway, notifications);
//! in-memory versions live in this crate and in `test_utils`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use core_kernel::{
    BillingAccountId, CreditNoteId, DateRange, DomainPort, DunningCaseId, InvoiceId, Money,
    PaymentId, PaymentPlanId, PortError, TransactionId,
};

use crate::account::BillingAccount;
use crate::credit_note::CreditNote;
use crate::dunning::DunningCase;
use crate::error::BillingError;
use crate::invoice::{Invoice, InvoiceItem};
use crate::ledger::{BalanceSnapshot, LedgerEntry};
use crate::payment::Payment;
use crate::payment_plan::PaymentPlan;
use crate::unit_of_work::UnitOfWork;

/// Durable storage for every billing aggregate
///
/// Reads return the last committed state. All writes go through
/// [`BillingStore::commit`], which applies a whole [`UnitOfWork`] atomically
/// or not at all.
#[async_trait]
pub trait BillingStore: DomainPort {
    async fn load_account(&self, id: BillingAccountId)
        -> Result<Option<BillingAccount>, PortError>;

    async fn find_account_by_number(
        &self,
        account_number: &str,
    ) -> Result<Option<BillingAccount>, PortError>;

    async fn list_account_ids(&self) -> Result<Vec<BillingAccountId>, PortError>;

    async fn find_entry(&self, id: TransactionId) -> Result<Option<LedgerEntry>, PortError>;

    async fn find_entry_by_key(
        &self,
        account_id: BillingAccountId,
        key: &str,
    ) -> Result<Option<LedgerEntry>, PortError>;

    /// Entries in ledger order, optionally limited to an effective-date range
    async fn ledger_entries(
        &self,
        account_id: BillingAccountId,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<LedgerEntry>, PortError>;

    async fn balance_snapshots(
        &self,
        account_id: BillingAccountId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<BalanceSnapshot>, PortError>;

    async fn load_invoice(&self, id: InvoiceId) -> Result<Option<Invoice>, PortError>;

    async fn find_invoice_by_number(&self, number: &str) -> Result<Option<Invoice>, PortError>;

    async fn invoices_for_account(
        &self,
        account_id: BillingAccountId,
    ) -> Result<Vec<Invoice>, PortError>;

    async fn load_payment(&self, id: PaymentId) -> Result<Option<Payment>, PortError>;

    async fn find_payment_by_key(
        &self,
        account_id: BillingAccountId,
        key: &str,
    ) -> Result<Option<Payment>, PortError>;

    async fn payments_for_account(
        &self,
        account_id: BillingAccountId,
    ) -> Result<Vec<Payment>, PortError>;

    /// Failed payments whose next retry time has passed
    async fn payments_due_for_retry(&self, now: DateTime<Utc>) -> Result<Vec<Payment>, PortError>;

    async fn load_credit_note(&self, id: CreditNoteId) -> Result<Option<CreditNote>, PortError>;

    async fn credit_notes_for_account(
        &self,
        account_id: BillingAccountId,
    ) -> Result<Vec<CreditNote>, PortError>;

    async fn load_dunning_case(&self, id: DunningCaseId)
        -> Result<Option<DunningCase>, PortError>;

    async fn dunning_cases_for_account(
        &self,
        account_id: BillingAccountId,
    ) -> Result<Vec<DunningCase>, PortError>;

    /// Cases in `Active` status across all accounts
    async fn active_dunning_cases(&self) -> Result<Vec<DunningCase>, PortError>;

    async fn load_payment_plan(&self, id: PaymentPlanId)
        -> Result<Option<PaymentPlan>, PortError>;

    async fn payment_plans_for_account(
        &self,
        account_id: BillingAccountId,
    ) -> Result<Vec<PaymentPlan>, PortError>;

    /// Applies the unit of work atomically
    ///
    /// Fails with [`PortError::Conflict`] if the account version changed
    /// since the unit of work was opened or a unique key is already taken.
    async fn commit(&self, unit: UnitOfWork) -> Result<(), PortError>;
}

/// Outcome reported by the payment gateway for a charge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GatewayStatus {
    Succeeded,
    Declined { reason: String },
}

/// Result of a gateway charge call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayCharge {
    pub gateway_transaction_id: String,
    #[serde(flatten)]
    pub status: GatewayStatus,
}

/// Result of a gateway refund call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayRefund {
    pub refund_id: String,
}

/// Card, wallet and direct-debit processor
#[async_trait]
pub trait PaymentGateway: DomainPort {
    async fn charge(
        &self,
        amount: &Money,
        payment_method_token: &str,
    ) -> Result<GatewayCharge, PortError>;

    async fn refund(
        &self,
        gateway_transaction_id: &str,
        amount: &Money,
    ) -> Result<GatewayRefund, PortError>;
}

/// Delivery outcome reported by the notification dispatcher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Not attempted yet
    Pending,
    /// Accepted by the dispatcher for asynchronous delivery
    Queued,
    Delivered,
    Failed { reason: String },
}

/// Free-form values substituted into a notification template
pub type NotificationContext = BTreeMap<String, String>;

/// Sends dunning notices and payment receipts to account holders
#[async_trait]
pub trait NotificationDispatcher: DomainPort {
    async fn send(
        &self,
        account_id: BillingAccountId,
        template: &str,
        context: &NotificationContext,
    ) -> Result<DeliveryStatus, PortError>;
}

/// Aggregated usage for an account over part of a billing period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub account_id: BillingAccountId,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub quantity: Decimal,
    pub unit_type: String,
}

/// Upstream accounting feed (RADIUS-style session aggregation)
#[async_trait]
pub trait UsageSource: DomainPort {
    async fn usage_for(
        &self,
        account_id: BillingAccountId,
        period: &DateRange,
    ) -> Result<Vec<UsageRecord>, PortError>;
}

/// Produces the billable lines for an account and period
#[async_trait]
pub trait LineItemSource: Send + Sync {
    async fn line_items(
        &self,
        account: &BillingAccount,
        period: &DateRange,
    ) -> Result<Vec<InvoiceItem>, BillingError>;
}

/// A fixed list of line items, used for ad-hoc and recurring flat charges
#[derive(Debug, Clone, Default)]
pub struct StaticLineItems(pub Vec<InvoiceItem>);

#[async_trait]
impl LineItemSource for StaticLineItems {
    async fn line_items(
        &self,
        _account: &BillingAccount,
        _period: &DateRange,
    ) -> Result<Vec<InvoiceItem>, BillingError> {
        Ok(self
            .0
            .iter()
            .cloned()
            .map(|mut item| {
                item.id = core_kernel::InvoiceItemId::new_v7();
                item
            })
            .collect())
    }
}

/// Time source, so batch passes can be driven deterministically
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
