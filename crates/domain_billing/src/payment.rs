//! Payment processing
//!
//! A [`Payment`] is one payment attempt. It moves
//! `Pending -> Processing -> Completed | Failed`; a failed payment with
//! retries left may return to `Pending`. Applying a completed payment to the
//! ledger happens exactly once and is recorded in `ledger_transaction_id`.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use core_kernel::{BillingAccountId, InvoiceId, Money, PaymentId, PaymentPlanId, TransactionId};

use crate::error::BillingError;

/// Payment method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Card,
    DirectDebit,
    MobileMoney,
    BankTransfer,
    Cash,
    Cheque,
}

impl PaymentMethod {
    /// Methods settled through the payment gateway
    pub fn uses_gateway(&self) -> bool {
        matches!(
            self,
            PaymentMethod::Card | PaymentMethod::DirectDebit | PaymentMethod::MobileMoney
        )
    }
}

/// Payment status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    /// Submitted to the gateway
    Processing,
    Completed,
    Failed,
    Cancelled,
    Refunded,
}

/// What a payment pays for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum PaymentTarget {
    /// Credit the account balance only
    Account,
    /// Settle an invoice; excess stays on the account
    Invoice(InvoiceId),
    /// Pay installments of a payment plan
    PaymentPlan(PaymentPlanId),
}

/// Longest delay any policy may schedule: 30 days
pub const MAX_RETRY_DELAY_SECS: u64 = 30 * 24 * 3_600;

/// Backoff between payment retries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Same delay before every retry
    Fixed { delay_secs: u64 },
    /// `base * 2^retry_count`, capped at `max_secs`
    Exponential { base_secs: u64, max_secs: u64 },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Fixed { delay_secs: 3_600 }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt, given retries already made
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let secs = match self {
            RetryPolicy::Fixed { delay_secs } => *delay_secs,
            RetryPolicy::Exponential { base_secs, max_secs } => {
                let factor = 1u64.checked_shl(retry_count.min(32)).unwrap_or(u64::MAX);
                base_secs.saturating_mul(factor).min(*max_secs)
            }
        };
        Duration::seconds(secs.min(MAX_RETRY_DELAY_SECS) as i64)
    }
}

/// A payment attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: PaymentId,
    pub account_id: BillingAccountId,
    pub target: PaymentTarget,
    pub amount: Money,
    /// Gateway or handling fee withheld from the amount
    pub processing_fee: Money,
    pub method: PaymentMethod,
    pub payment_method_token: Option<String>,
    pub status: PaymentStatus,
    pub gateway_transaction_id: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub next_retry_date: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub idempotency_key: Option<String>,
    /// Ledger entry written when the payment was applied
    pub ledger_transaction_id: Option<TransactionId>,
    pub refunded_amount: Money,
    /// Refunds sent to the gateway and not yet recorded
    pub refund_pending: Money,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Payment {
    /// Records a new payment attempt in `Pending`
    ///
    /// # Arguments
    ///
    /// * `account_id` - Paying account
    /// * `target` - What the payment settles
    /// * `amount` - Gross amount
    /// * `method` - Payment method
    pub fn new(
        account_id: BillingAccountId,
        target: PaymentTarget,
        amount: Money,
        method: PaymentMethod,
    ) -> Result<Self, BillingError> {
        if !amount.is_positive() {
            return Err(BillingError::invalid_amount("payment amount must be positive"));
        }
        let now = Utc::now();
        Ok(Self {
            id: PaymentId::new_v7(),
            account_id,
            target,
            amount,
            processing_fee: Money::zero(amount.currency()),
            method,
            payment_method_token: None,
            status: PaymentStatus::Pending,
            gateway_transaction_id: None,
            retry_count: 0,
            max_retries: 3,
            next_retry_date: None,
            failure_reason: None,
            idempotency_key: None,
            ledger_transaction_id: None,
            refunded_amount: Money::zero(amount.currency()),
            refund_pending: Money::zero(amount.currency()),
            created_at: now,
            updated_at: now,
            completed_at: None,
        })
    }

    pub fn with_fee(mut self, fee: Money) -> Result<Self, BillingError> {
        if fee.is_negative() || fee.amount() >= self.amount.amount() {
            return Err(BillingError::invalid_amount(
                "processing fee must be non-negative and below the amount",
            ));
        }
        if fee.currency() != self.amount.currency() {
            return Err(BillingError::CurrencyMismatch {
                expected: self.amount.currency().to_string(),
                actual: fee.currency().to_string(),
            });
        }
        self.processing_fee = fee;
        Ok(self)
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.payment_method_token = Some(token.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Amount credited to the account: gross amount less the processing fee
    pub fn net_amount(&self) -> Result<Money, BillingError> {
        Ok(self.amount.checked_sub(&self.processing_fee)?)
    }

    pub fn is_applied(&self) -> bool {
        self.ledger_transaction_id.is_some()
    }

    /// Pending -> Processing
    pub fn start_processing(&mut self) -> Result<(), BillingError> {
        if self.status != PaymentStatus::Pending {
            return Err(BillingError::transition("payment", self.status, PaymentStatus::Processing));
        }
        self.status = PaymentStatus::Processing;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Processing -> Completed
    ///
    /// Completing an already completed payment is rejected, never ignored.
    pub fn mark_completed(
        &mut self,
        gateway_transaction_id: Option<String>,
    ) -> Result<(), BillingError> {
        match self.status {
            PaymentStatus::Processing => {
                let now = Utc::now();
                self.status = PaymentStatus::Completed;
                if gateway_transaction_id.is_some() {
                    self.gateway_transaction_id = gateway_transaction_id;
                }
                self.failure_reason = None;
                self.next_retry_date = None;
                self.completed_at = Some(now);
                self.updated_at = now;
                info!(payment_id = %self.id, amount = %self.amount, "Payment completed");
                Ok(())
            }
            PaymentStatus::Completed => Err(BillingError::PaymentAlreadyApplied(self.id.to_string())),
            from => Err(BillingError::transition("payment", from, PaymentStatus::Completed)),
        }
    }

    /// Records the ledger entry the payment produced
    pub fn mark_applied(&mut self, transaction_id: TransactionId) -> Result<(), BillingError> {
        if self.status != PaymentStatus::Completed {
            return Err(BillingError::validation("only completed payments can be applied"));
        }
        if self.is_applied() {
            return Err(BillingError::PaymentAlreadyApplied(self.id.to_string()));
        }
        self.ledger_transaction_id = Some(transaction_id);
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Processing -> Failed, scheduling a retry if any remain
    pub fn mark_failed(
        &mut self,
        reason: impl Into<String>,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<(), BillingError> {
        if self.status != PaymentStatus::Processing {
            return Err(BillingError::transition("payment", self.status, PaymentStatus::Failed));
        }
        let reason = reason.into();
        self.status = PaymentStatus::Failed;
        self.next_retry_date = if self.can_retry() {
            now.checked_add_signed(policy.delay_for(self.retry_count))
        } else {
            None
        };
        warn!(
            payment_id = %self.id,
            reason = %reason,
            retry_count = self.retry_count,
            next_retry = ?self.next_retry_date,
            "Payment failed"
        );
        self.failure_reason = Some(reason);
        self.updated_at = now;
        Ok(())
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Failed with retries left and the backoff elapsed
    pub fn is_due_for_retry(&self, now: DateTime<Utc>) -> bool {
        self.status == PaymentStatus::Failed
            && self.can_retry()
            && self.next_retry_date.is_some_and(|at| now >= at)
    }

    /// Failed -> Pending
    pub fn retry(&mut self) -> Result<(), BillingError> {
        if self.status != PaymentStatus::Failed || !self.can_retry() {
            return Err(BillingError::transition("payment", self.status, PaymentStatus::Pending));
        }
        self.retry_count += 1;
        self.status = PaymentStatus::Pending;
        self.next_retry_date = None;
        self.updated_at = Utc::now();
        info!(payment_id = %self.id, retry_count = self.retry_count, "Payment queued for retry");
        Ok(())
    }

    /// Pending or Failed -> Cancelled
    pub fn cancel(&mut self) -> Result<(), BillingError> {
        match self.status {
            PaymentStatus::Pending | PaymentStatus::Failed => {
                self.status = PaymentStatus::Cancelled;
                self.next_retry_date = None;
                self.updated_at = Utc::now();
                Ok(())
            }
            from => Err(BillingError::transition("payment", from, PaymentStatus::Cancelled)),
        }
    }

    /// Amount still refundable, net of refunds in flight
    pub fn refundable(&self) -> Result<Money, BillingError> {
        Ok(self
            .net_amount()?
            .checked_sub(&self.refunded_amount)?
            .checked_sub(&self.refund_pending)?)
    }

    fn check_refund(&self, amount: &Money) -> Result<(), BillingError> {
        if self.status != PaymentStatus::Completed {
            return Err(BillingError::transition("payment", self.status, PaymentStatus::Refunded));
        }
        let refundable = self.refundable()?;
        if !amount.is_positive() || amount.amount() > refundable.amount() {
            return Err(BillingError::invalid_amount(format!(
                "refund {} exceeds refundable {}",
                amount, refundable
            )));
        }
        Ok(())
    }

    /// Holds `amount` while the gateway refund is in flight
    pub fn reserve_refund(&mut self, amount: &Money) -> Result<(), BillingError> {
        self.check_refund(amount)?;
        self.refund_pending = self.refund_pending.checked_add(amount)?;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Drops a hold taken by [`Payment::reserve_refund`]
    pub fn release_refund(&mut self, amount: &Money) -> Result<(), BillingError> {
        if !amount.is_positive() || amount.amount() > self.refund_pending.amount() {
            return Err(BillingError::invalid_amount(format!(
                "release {} exceeds pending refunds {}",
                amount, self.refund_pending
            )));
        }
        self.refund_pending = self.refund_pending.checked_sub(amount)?;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Records a refund; the payment becomes `Refunded` once fully returned
    /// and nothing is left in flight
    pub fn record_refund(&mut self, amount: &Money) -> Result<(), BillingError> {
        self.check_refund(amount)?;
        self.refunded_amount = self.refunded_amount.checked_add(amount)?;
        if self.refundable()?.is_zero() && self.refund_pending.is_zero() {
            self.status = PaymentStatus::Refunded;
        }
        self.updated_at = Utc::now();
        Ok(())
    }
}
