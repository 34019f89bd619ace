//! Core Kernel - Foundational types for the billing engine
//!
//! This crate provides the building blocks shared by every billing crate:
//! - Money types with precise decimal arithmetic
//! - Calendar ranges for billing periods and the operator timezone
//! - Typed identifiers for accounts, ledger entries, invoices and payments
//! - The port error taxonomy used by storage and external adapters

pub mod money;
pub mod temporal;
pub mod identifiers;
pub mod ports;

pub use money::{Money, Currency, MoneyError, Rate};
pub use temporal::{DateRange, TemporalError, Timezone};
pub use identifiers::{
    BillingAccountId, CreditNoteId, CustomerId, DunningActionId, DunningCaseId,
    InstallmentId, InvoiceId, InvoiceItemId, PaymentId, PaymentPlanId, SnapshotId,
    TransactionId,
};
pub use ports::{
    AdapterHealth, DomainPort, HealthCheckResult, HealthCheckable, OperationMetadata, PortError,
};
