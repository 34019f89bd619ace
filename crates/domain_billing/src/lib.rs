//! Billing Domain - ISP account ledger and collections
//!
//! This crate implements the billing and account-lifecycle engine for an
//! internet service provider back office:
//! - Per-account balance ledger with immutable entries and reversals
//! - Invoices with line-item, tax, discount and proration arithmetic
//! - Payments with gateway processing, retry backoff and refunds
//! - Credit notes with an approval step
//! - Dunning cases, escalation and automatic suspension/restoration
//! - Payment plans with installment schedules and late fees
//!
//! # Balance Sign Convention
//!
//! A positive balance means the customer holds credit; a negative balance
//! means the customer owes money. Charges decrease the balance, payments
//! and credits increase it.
//!
//! # Mutation Model
//!
//! Every command touches exactly one billing account. The
//! [`BillingService`] takes the account's lock, loads the account into a
//! [`UnitOfWork`], applies domain operations, and commits the unit through
//! the [`BillingStore`] port in one atomic write.
//!
//! # Example
//!
//! ```rust,ignore
//! use domain_billing::{BillingService, BillingType, LedgerPosting, BillingCategory};
//!
//! let account = service.open_account(customer_id, "ACC-1001", BillingType::Postpaid).await?;
//! let entry = service
//!     .post_ledger_entry(account.id(), LedgerPosting::charge(fee, BillingCategory::Installation))
//!     .await?;
//! assert_eq!(entry.balance_after, entry.balance_before - fee);
//! ```

pub mod account;
pub mod config;
pub mod credit_note;
pub mod dunning;
pub mod error;
pub mod invoice;
pub mod ledger;
pub mod lifecycle;
pub mod locks;
pub mod payment;
pub mod payment_plan;
pub mod ports;
pub mod service;
pub mod store;
pub mod unit_of_work;
pub mod usage;

pub use account::{AccountStatus, BillingAccount, BillingType, SuspensionReason};
pub use config::{AccountDefaults, BillingConfig, DunningSettings, PlanSettings, UsageRate};
pub use credit_note::{CreditNote, CreditNoteStatus};
pub use dunning::{
    calculate_escalation_level, DunningAction, DunningActionKind, DunningCase, DunningSchedule,
    DunningStatus, EscalationLevel,
};
pub use error::BillingError;
pub use invoice::{Invoice, InvoiceItem, InvoiceItemType, InvoiceStatus, PaymentSource};
pub use ledger::{
    BalanceSnapshot, BillingCategory, Direction, LedgerEntry, LedgerPosting, LedgerReference,
    TransactionType,
};
pub use lifecycle::{LifecycleAction, LifecyclePolicy};
pub use locks::AccountLocks;
pub use payment::{Payment, PaymentMethod, PaymentStatus, PaymentTarget, RetryPolicy};
pub use payment_plan::{
    Installment, InstallmentStatus, PaymentPlan, PlanFrequency, PlanStatus, PlanTerms,
};
pub use ports::{
    BillingStore, Clock, DeliveryStatus, GatewayCharge, GatewayRefund, GatewayStatus,
    LineItemSource, NotificationContext, NotificationDispatcher, PaymentGateway,
    StaticLineItems, SystemClock, UsageRecord, UsageSource,
};
pub use service::{
    AccountLimits, AccountSummary, BillingService, CreditNoteRequest, CycleReport,
    DunningReport, InstallmentReport, PaymentPlanRequest, PaymentPlanStatus, PaymentRequest,
    ReconcileOutcome, RetryReport,
};
pub use store::InMemoryBillingStore;
pub use unit_of_work::UnitOfWork;
pub use usage::UsageLineItems;
