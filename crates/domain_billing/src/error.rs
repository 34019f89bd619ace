//! Billing domain errors

use core_kernel::{MoneyError, PortError, TemporalError};
use thiserror::Error;

/// Errors that can occur in the billing domain
///
/// Business-rule violations are returned to the caller as typed variants;
/// `Storage` aborts the current unit of work and leaves state unchanged.
#[derive(Debug, Error)]
pub enum BillingError {
    /// Billing account not found
    #[error("Billing account not found: {0}")]
    AccountNotFound(String),

    /// Account number already in use
    #[error("Billing account already exists: {0}")]
    DuplicateAccount(String),

    /// Ledger entry not found
    #[error("Ledger entry not found: {0}")]
    EntryNotFound(String),

    /// Invoice not found
    #[error("Invoice not found: {0}")]
    InvoiceNotFound(String),

    /// Invoice number already issued
    #[error("Duplicate invoice number: {0}")]
    DuplicateInvoice(String),

    /// Payment not found
    #[error("Payment not found: {0}")]
    PaymentNotFound(String),

    /// Credit note not found
    #[error("Credit note not found: {0}")]
    CreditNoteNotFound(String),

    /// Dunning case not found
    #[error("Dunning case not found: {0}")]
    DunningCaseNotFound(String),

    /// Payment plan not found
    #[error("Payment plan not found: {0}")]
    PaymentPlanNotFound(String),

    /// Installment not found
    #[error("Installment not found: {0}")]
    InstallmentNotFound(String),

    /// Amount is zero, negative or otherwise unusable
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// Amounts in different currencies were combined
    #[error("Currency mismatch: expected {expected}, got {actual}")]
    CurrencyMismatch {
        expected: String,
        actual: String,
    },

    /// Input failed a business validation rule
    #[error("Validation error: {0}")]
    Validation(String),

    /// State machine transition not allowed
    #[error("Invalid {entity} transition from {from} to {to}")]
    InvalidStateTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    /// Closed accounts accept no further mutation
    #[error("Billing account is closed: {0}")]
    AccountClosed(String),

    /// A completed payment was applied a second time
    #[error("Payment already applied: {0}")]
    PaymentAlreadyApplied(String),

    /// The payment was already recorded against this installment
    #[error("Payment {payment} already applied to installment {installment}")]
    InstallmentPaymentAlreadyApplied {
        installment: String,
        payment: String,
    },

    /// Ledger entry has already been reversed
    #[error("Ledger entry already reversed: {0}")]
    EntryAlreadyReversed(String),

    /// Lost update on the account aggregate
    #[error("Concurrent modification of account {0}")]
    ConcurrencyConflict(String),

    /// Account lock could not be acquired in time
    #[error("Timed out waiting for lock on account {0}")]
    LockTimeout(String),

    /// Gateway, notification or usage feed failure
    #[error("External dependency failed: {0}")]
    External(PortError),

    /// Unexpected persistence failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Calculation error
    #[error("Calculation error: {0}")]
    Calculation(String),
}

impl BillingError {
    /// Creates a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        BillingError::Validation(message.into())
    }

    /// Creates an invalid amount error
    pub fn invalid_amount(message: impl Into<String>) -> Self {
        BillingError::InvalidAmount(message.into())
    }

    /// Creates an invalid transition error
    pub fn transition(
        entity: &'static str,
        from: impl std::fmt::Debug,
        to: impl std::fmt::Debug,
    ) -> Self {
        BillingError::InvalidStateTransition {
            entity,
            from: format!("{:?}", from),
            to: format!("{:?}", to),
        }
    }

    /// Returns true for failures a caller may retry a bounded number of times
    pub fn is_transient(&self) -> bool {
        match self {
            BillingError::ConcurrencyConflict(_) | BillingError::LockTimeout(_) => true,
            BillingError::External(port) => port.is_transient(),
            _ => false,
        }
    }

    /// Returns true for lost-update conflicts that warrant re-running the unit of work
    pub fn is_conflict(&self) -> bool {
        matches!(self, BillingError::ConcurrencyConflict(_))
    }
}

impl From<MoneyError> for BillingError {
    fn from(error: MoneyError) -> Self {
        match error {
            MoneyError::CurrencyMismatch(expected, actual) => {
                BillingError::CurrencyMismatch { expected, actual }
            }
            other => BillingError::Calculation(other.to_string()),
        }
    }
}

impl From<TemporalError> for BillingError {
    fn from(error: TemporalError) -> Self {
        BillingError::Validation(error.to_string())
    }
}

impl From<PortError> for BillingError {
    fn from(error: PortError) -> Self {
        match error {
            PortError::Conflict { message } => BillingError::ConcurrencyConflict(message),
            PortError::Connection { .. } | PortError::Internal { .. } => {
                BillingError::Storage(error.to_string())
            }
            other => BillingError::External(other),
        }
    }
}
