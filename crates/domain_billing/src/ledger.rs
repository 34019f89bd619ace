//! Account ledger
//!
//! Every balance-affecting event on a billing account is recorded as an
//! immutable [`LedgerEntry`], together with a [`BalanceSnapshot`] of the
//! balances right after it was applied.
//!
//! # Invariants
//!
//! - `balance_after = balance_before + net_amount`
//! - each entry's `balance_before` equals the previous entry's `balance_after`
//! - entries are never edited; a reversal is a new entry with the inverse
//!   net effect, and only `is_reversed`/`reversed_by` change on the original

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use core_kernel::{
    BillingAccountId, CreditNoteId, InstallmentId, InvoiceId, Money, PaymentId, PaymentPlanId,
    SnapshotId, TransactionId,
};

use crate::error::BillingError;

/// Which way an entry moves the account balance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Increase,
    Decrease,
}

impl Direction {
    pub fn inverse(self) -> Self {
        match self {
            Direction::Increase => Direction::Decrease,
            Direction::Decrease => Direction::Increase,
        }
    }
}

/// Kind of ledger entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Charge,
    Payment,
    Refund,
    Adjustment,
    Transfer,
    Credit,
    Debit,
    Reversal,
}

impl TransactionType {
    /// The direction implied by the type, if the type fixes one
    ///
    /// Credits, payments and refunds increase the balance; charges and
    /// debits decrease it. Adjustments, transfers and reversals carry an
    /// explicit direction.
    pub fn fixed_direction(&self) -> Option<Direction> {
        match self {
            TransactionType::Credit | TransactionType::Payment | TransactionType::Refund => {
                Some(Direction::Increase)
            }
            TransactionType::Charge | TransactionType::Debit => Some(Direction::Decrease),
            TransactionType::Adjustment | TransactionType::Transfer | TransactionType::Reversal => {
                None
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Charge => "charge",
            TransactionType::Payment => "payment",
            TransactionType::Refund => "refund",
            TransactionType::Adjustment => "adjustment",
            TransactionType::Transfer => "transfer",
            TransactionType::Credit => "credit",
            TransactionType::Debit => "debit",
            TransactionType::Reversal => "reversal",
        }
    }
}

/// Billing reason attached to an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingCategory {
    Subscription,
    Usage,
    Equipment,
    Installation,
    LateFee,
    Payment,
    Refund,
    CreditNote,
    Adjustment,
    Transfer,
    Other,
}

/// What caused a ledger entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum LedgerReference {
    Invoice(InvoiceId),
    Payment(PaymentId),
    CreditNote(CreditNoteId),
    PaymentPlan(PaymentPlanId),
    Installment(InstallmentId),
    Entry(TransactionId),
}

/// Signed effect of an entry on the account balance
pub fn net_amount(direction: Direction, amount: &Money) -> Money {
    match direction {
        Direction::Increase => *amount,
        Direction::Decrease => -*amount,
    }
}

/// A request to move an account balance
///
/// Postings are turned into [`LedgerEntry`] values by
/// [`BillingAccount::apply_ledger_entry`](crate::account::BillingAccount::apply_ledger_entry),
/// the only operation that changes an account's balance.
#[derive(Debug, Clone)]
pub struct LedgerPosting {
    pub transaction_type: TransactionType,
    pub direction: Direction,
    pub category: BillingCategory,
    /// Always a positive magnitude
    pub amount: Money,
    pub description: String,
    pub reference: Option<LedgerReference>,
    /// Replaying a posting with a key already on the account is a no-op
    pub idempotency_key: Option<String>,
    pub effective_date: Option<DateTime<Utc>>,
}

impl LedgerPosting {
    fn with_type(transaction_type: TransactionType, direction: Direction, amount: Money) -> Self {
        Self {
            transaction_type,
            direction,
            category: BillingCategory::Other,
            amount,
            description: String::new(),
            reference: None,
            idempotency_key: None,
            effective_date: None,
        }
    }

    /// A charge against the account (decreases the balance)
    pub fn charge(amount: Money, category: BillingCategory) -> Self {
        Self::with_type(TransactionType::Charge, Direction::Decrease, amount).category(category)
    }

    /// A debit (decreases the balance)
    pub fn debit(amount: Money, category: BillingCategory) -> Self {
        Self::with_type(TransactionType::Debit, Direction::Decrease, amount).category(category)
    }

    /// A received payment (increases the balance)
    pub fn payment(amount: Money) -> Self {
        Self::with_type(TransactionType::Payment, Direction::Increase, amount)
            .category(BillingCategory::Payment)
    }

    /// A refund credited to the account (increases the balance)
    pub fn refund(amount: Money) -> Self {
        Self::with_type(TransactionType::Refund, Direction::Increase, amount)
            .category(BillingCategory::Refund)
    }

    /// A credit (increases the balance)
    pub fn credit(amount: Money, category: BillingCategory) -> Self {
        Self::with_type(TransactionType::Credit, Direction::Increase, amount).category(category)
    }

    /// A manual adjustment in either direction
    pub fn adjustment(amount: Money, direction: Direction) -> Self {
        Self::with_type(TransactionType::Adjustment, direction, amount)
            .category(BillingCategory::Adjustment)
    }

    /// A balance transfer in either direction
    pub fn transfer(amount: Money, direction: Direction) -> Self {
        Self::with_type(TransactionType::Transfer, direction, amount)
            .category(BillingCategory::Transfer)
    }

    /// The posting that cancels `original`
    pub fn reversal_of(original: &LedgerEntry) -> Self {
        Self::with_type(
            TransactionType::Reversal,
            original.direction.inverse(),
            original.amount,
        )
        .category(original.category)
        .reference(LedgerReference::Entry(original.transaction_id))
    }

    pub fn category(mut self, category: BillingCategory) -> Self {
        self.category = category;
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn reference(mut self, reference: LedgerReference) -> Self {
        self.reference = Some(reference);
        self
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn effective_at(mut self, at: DateTime<Utc>) -> Self {
        self.effective_date = Some(at);
        self
    }

    /// Checks the posting is well formed
    pub fn validate(&self) -> Result<(), BillingError> {
        if !self.amount.is_positive() {
            return Err(BillingError::invalid_amount(format!(
                "ledger amount must be positive, got {}",
                self.amount
            )));
        }
        if let Some(expected) = self.transaction_type.fixed_direction() {
            if expected != self.direction {
                return Err(BillingError::validation(format!(
                    "{} entries must {:?} the balance",
                    self.transaction_type.as_str(),
                    expected
                )));
            }
        }
        Ok(())
    }

    /// Signed effect of this posting on the balance
    pub fn net_amount(&self) -> Money {
        net_amount(self.direction, &self.amount)
    }
}

/// An immutable record of one balance movement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub transaction_id: TransactionId,
    pub account_id: BillingAccountId,
    /// Position in the account's ledger, starting at 1
    pub sequence: u64,
    pub transaction_type: TransactionType,
    pub direction: Direction,
    pub category: BillingCategory,
    pub amount: Money,
    pub balance_before: Money,
    pub balance_after: Money,
    pub description: String,
    pub reference: Option<LedgerReference>,
    pub idempotency_key: Option<String>,
    pub effective_date: DateTime<Utc>,
    pub is_reversed: bool,
    pub reversed_by: Option<TransactionId>,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Signed effect of this entry on the balance
    pub fn net_amount(&self) -> Money {
        net_amount(self.direction, &self.amount)
    }

    /// True when `balance_after - balance_before` matches the entry's net effect
    pub fn is_consistent(&self) -> bool {
        self.balance_before
            .checked_add(&self.net_amount())
            .map(|expected| expected == self.balance_after)
            .unwrap_or(false)
    }

    /// Flags this entry as cancelled by `reversal`
    pub(crate) fn mark_reversed(&mut self, reversal: TransactionId) -> Result<(), BillingError> {
        if self.is_reversed {
            return Err(BillingError::EntryAlreadyReversed(
                self.transaction_id.to_string(),
            ));
        }
        self.is_reversed = true;
        self.reversed_by = Some(reversal);
        Ok(())
    }
}

/// Balances of an account right after a ledger entry was applied
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub id: SnapshotId,
    pub account_id: BillingAccountId,
    pub transaction_id: TransactionId,
    pub sequence: u64,
    pub current_balance: Money,
    pub available_balance: Money,
    pub reserved_balance: Money,
    pub recorded_at: DateTime<Utc>,
}

/// An applied posting: the new entry and the snapshot written with it
#[derive(Debug, Clone)]
pub struct LedgerRecord {
    pub entry: LedgerEntry,
    pub snapshot: BalanceSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_kernel::Currency;
    use rust_decimal_macros::dec;

    fn usd(amount: rust_decimal::Decimal) -> Money {
        Money::new(amount, Currency::USD)
    }

    #[test]
    fn test_fixed_directions() {
        assert_eq!(TransactionType::Payment.fixed_direction(), Some(Direction::Increase));
        assert_eq!(TransactionType::Charge.fixed_direction(), Some(Direction::Decrease));
        assert_eq!(TransactionType::Reversal.fixed_direction(), None);
    }

    #[test]
    fn test_charge_net_amount_is_negative() {
        let posting = LedgerPosting::charge(usd(dec!(40)), BillingCategory::Subscription);
        assert_eq!(posting.net_amount().amount(), dec!(-40));
    }

    #[test]
    fn test_rejects_non_positive_amount() {
        let posting = LedgerPosting::payment(usd(dec!(0)));
        assert!(matches!(posting.validate(), Err(BillingError::InvalidAmount(_))));
    }

    #[test]
    fn test_rejects_direction_contradicting_type() {
        let mut posting = LedgerPosting::credit(usd(dec!(5)), BillingCategory::CreditNote);
        posting.direction = Direction::Decrease;
        assert!(matches!(posting.validate(), Err(BillingError::Validation(_))));
    }
}
