//! Billing Account Aggregate
//!
//! The billing account holds a customer's balances, limits and lifecycle
//! state. Balances change only through [`BillingAccount::apply_ledger_entry`],
//! which produces the ledger entry and balance snapshot for every movement.
//!
//! # Invariants
//!
//! - `available_balance == current_balance - reserved_balance`
//! - `reserved_balance >= 0`
//! - a closed account accepts no further mutation

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use core_kernel::{BillingAccountId, Currency, CustomerId, Money, SnapshotId, TransactionId};

use crate::config::AccountDefaults;
use crate::error::BillingError;
use crate::ledger::{BalanceSnapshot, LedgerEntry, LedgerPosting, LedgerRecord};

/// How an account is billed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingType {
    /// Service is consumed against a positive balance
    Prepaid,
    /// Service is invoiced after the fact, up to a credit limit
    Postpaid,
    /// Prepaid balance with a postpaid credit line
    Hybrid,
}

/// Account lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Pending,
    Active,
    Suspended,
    /// Terminal
    Closed,
}

/// Why an account was suspended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspensionReason {
    /// Balance crossed the suspension threshold; eligible for auto-restore
    Balance,
    /// Suspended by an administrator; only lifted manually
    Manual,
}

/// The billing account aggregate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingAccount {
    id: BillingAccountId,
    customer_id: CustomerId,
    /// Unique, human-readable account number
    account_number: String,
    billing_type: BillingType,
    currency: Currency,
    current_balance: Money,
    available_balance: Money,
    reserved_balance: Money,
    credit_limit: Money,
    minimum_balance: Money,
    suspension_threshold: Money,
    termination_threshold: Money,
    status: AccountStatus,
    suspension_reason: Option<SuspensionReason>,
    /// Sequence number of the last ledger entry
    ledger_sequence: u64,
    /// Version for optimistic concurrency
    version: u64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    suspended_at: Option<DateTime<Utc>>,
    closed_at: Option<DateTime<Utc>>,
}

impl BillingAccount {
    /// Creates a pending account with zero balances
    ///
    /// # Arguments
    ///
    /// * `customer_id` - Customer that owns the account
    /// * `account_number` - Unique account number
    /// * `billing_type` - Prepaid, postpaid or hybrid
    /// * `currency` - Account currency
    pub fn new(
        customer_id: CustomerId,
        account_number: impl Into<String>,
        billing_type: BillingType,
        currency: Currency,
    ) -> Self {
        let now = Utc::now();
        let zero = Money::zero(currency);
        Self {
            id: BillingAccountId::new_v7(),
            customer_id,
            account_number: account_number.into(),
            billing_type,
            currency,
            current_balance: zero,
            available_balance: zero,
            reserved_balance: zero,
            credit_limit: zero,
            minimum_balance: zero,
            suspension_threshold: zero,
            termination_threshold: zero,
            status: AccountStatus::Pending,
            suspension_reason: None,
            ledger_sequence: 0,
            version: 0,
            created_at: now,
            updated_at: now,
            suspended_at: None,
            closed_at: None,
        }
    }

    /// Applies configured default limits
    pub fn with_defaults(self, defaults: &AccountDefaults) -> Result<Self, BillingError> {
        let currency = self.currency;
        self.with_credit_limit(Money::new(defaults.credit_limit, currency))?
            .with_minimum_balance(Money::new(defaults.minimum_balance, currency))?
            .with_thresholds(
                Money::new(defaults.suspension_threshold, currency),
                Money::new(defaults.termination_threshold, currency),
            )
    }

    /// Sets the postpaid credit limit
    pub fn with_credit_limit(mut self, limit: Money) -> Result<Self, BillingError> {
        self.set_credit_limit(limit)?;
        Ok(self)
    }

    /// Sets the prepaid minimum balance
    pub fn with_minimum_balance(mut self, minimum: Money) -> Result<Self, BillingError> {
        self.set_minimum_balance(minimum)?;
        Ok(self)
    }

    /// Sets suspension and termination thresholds
    pub fn with_thresholds(
        mut self,
        suspension: Money,
        termination: Money,
    ) -> Result<Self, BillingError> {
        self.set_thresholds(suspension, termination)?;
        Ok(self)
    }

    // Accessors

    pub fn id(&self) -> BillingAccountId {
        self.id
    }

    pub fn customer_id(&self) -> CustomerId {
        self.customer_id
    }

    pub fn account_number(&self) -> &str {
        &self.account_number
    }

    pub fn billing_type(&self) -> BillingType {
        self.billing_type
    }

    pub fn currency(&self) -> Currency {
        self.currency
    }

    pub fn current_balance(&self) -> Money {
        self.current_balance
    }

    pub fn available_balance(&self) -> Money {
        self.available_balance
    }

    pub fn reserved_balance(&self) -> Money {
        self.reserved_balance
    }

    pub fn credit_limit(&self) -> Money {
        self.credit_limit
    }

    pub fn minimum_balance(&self) -> Money {
        self.minimum_balance
    }

    pub fn suspension_threshold(&self) -> Money {
        self.suspension_threshold
    }

    pub fn termination_threshold(&self) -> Money {
        self.termination_threshold
    }

    pub fn status(&self) -> AccountStatus {
        self.status
    }

    pub fn suspension_reason(&self) -> Option<SuspensionReason> {
        self.suspension_reason
    }

    pub fn ledger_sequence(&self) -> u64 {
        self.ledger_sequence
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn suspended_at(&self) -> Option<DateTime<Utc>> {
        self.suspended_at
    }

    pub fn closed_at(&self) -> Option<DateTime<Utc>> {
        self.closed_at
    }

    pub fn is_closed(&self) -> bool {
        self.status == AccountStatus::Closed
    }

    /// Records the version a store assigned on commit
    pub fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    /// Returns true when the invariant `available == current - reserved` holds
    pub fn balances_consistent(&self) -> bool {
        !self.reserved_balance.is_negative()
            && self
                .current_balance
                .checked_sub(&self.reserved_balance)
                .map(|available| available == self.available_balance)
                .unwrap_or(false)
    }

    fn ensure_open(&self) -> Result<(), BillingError> {
        if self.is_closed() {
            return Err(BillingError::AccountClosed(self.id.to_string()));
        }
        Ok(())
    }

    fn ensure_currency(&self, amount: &Money) -> Result<(), BillingError> {
        if amount.currency() != self.currency {
            return Err(BillingError::CurrencyMismatch {
                expected: self.currency.to_string(),
                actual: amount.currency().to_string(),
            });
        }
        Ok(())
    }

    fn recompute_available(&mut self) -> Result<(), BillingError> {
        self.available_balance = self.current_balance.checked_sub(&self.reserved_balance)?;
        Ok(())
    }

    /// Applies a posting to the balance and returns the resulting entry
    ///
    /// This is the only path that changes `current_balance`. The entry and
    /// snapshot are returned to the caller's unit of work, which persists
    /// them together with the account.
    ///
    /// # Errors
    ///
    /// - `AccountClosed` if the account is closed
    /// - `InvalidAmount`/`Validation` for a malformed posting
    /// - `CurrencyMismatch` if the posting is in another currency
    pub fn apply_ledger_entry(
        &mut self,
        posting: LedgerPosting,
    ) -> Result<LedgerRecord, BillingError> {
        self.ensure_open()?;
        posting.validate()?;
        self.ensure_currency(&posting.amount)?;

        let now = Utc::now();
        let balance_before = self.current_balance;
        let balance_after = balance_before.checked_add(&posting.net_amount())?;

        self.current_balance = balance_after;
        self.recompute_available()?;
        self.ledger_sequence += 1;
        self.updated_at = now;

        let entry = LedgerEntry {
            transaction_id: TransactionId::new_v7(),
            account_id: self.id,
            sequence: self.ledger_sequence,
            transaction_type: posting.transaction_type,
            direction: posting.direction,
            category: posting.category,
            amount: posting.amount,
            balance_before,
            balance_after,
            description: posting.description,
            reference: posting.reference,
            idempotency_key: posting.idempotency_key,
            effective_date: posting.effective_date.unwrap_or(now),
            is_reversed: false,
            reversed_by: None,
            created_at: now,
        };

        let snapshot = BalanceSnapshot {
            id: SnapshotId::new_v7(),
            account_id: self.id,
            transaction_id: entry.transaction_id,
            sequence: entry.sequence,
            current_balance: self.current_balance,
            available_balance: self.available_balance,
            reserved_balance: self.reserved_balance,
            recorded_at: now,
        };

        info!(
            account_id = %self.id,
            transaction_id = %entry.transaction_id,
            transaction_type = entry.transaction_type.as_str(),
            amount = %entry.amount,
            balance_after = %entry.balance_after,
            "Ledger entry applied"
        );

        Ok(LedgerRecord { entry, snapshot })
    }

    /// Cancels `original` with a new entry of inverse net effect
    ///
    /// The original keeps every field except `is_reversed` and
    /// `reversed_by`, which are set here.
    pub fn reverse_ledger_entry(
        &mut self,
        original: &mut LedgerEntry,
        reason: &str,
    ) -> Result<LedgerRecord, BillingError> {
        if original.account_id != self.id {
            return Err(BillingError::validation(format!(
                "entry {} does not belong to account {}",
                original.transaction_id, self.id
            )));
        }
        if original.is_reversed {
            return Err(BillingError::EntryAlreadyReversed(
                original.transaction_id.to_string(),
            ));
        }

        let posting = LedgerPosting::reversal_of(original)
            .describe(format!("Reversal of {}: {}", original.transaction_id, reason))
            .idempotency_key(format!("reversal:{}", original.transaction_id));
        let record = self.apply_ledger_entry(posting)?;
        original.mark_reversed(record.entry.transaction_id)?;
        Ok(record)
    }

    /// Checks whether the account can absorb a charge of `amount`
    ///
    /// Prepaid accounts must stay at or above their minimum balance;
    /// postpaid and hybrid accounts may go negative down to the credit limit.
    pub fn has_sufficient_balance(&self, amount: &Money) -> bool {
        let Ok(remaining) = self.available_balance.checked_sub(amount) else {
            return false;
        };
        let floor = match self.billing_type {
            BillingType::Prepaid => self.minimum_balance,
            BillingType::Postpaid | BillingType::Hybrid => -self.credit_limit,
        };
        remaining.amount() >= floor.amount()
    }

    /// Places a hold on part of the available balance
    ///
    /// Returns `Ok(false)` without mutation when the available balance is
    /// smaller than `amount`. No ledger entry is written.
    pub fn reserve_balance(&mut self, amount: &Money) -> Result<bool, BillingError> {
        self.ensure_open()?;
        self.ensure_currency(amount)?;
        if !amount.is_positive() {
            return Err(BillingError::invalid_amount("reservation must be positive"));
        }
        if self.available_balance.amount() < amount.amount() {
            return Ok(false);
        }

        self.reserved_balance = self.reserved_balance.checked_add(amount)?;
        self.recompute_available()?;
        self.updated_at = Utc::now();
        Ok(true)
    }

    /// Releases a previously placed hold
    pub fn release_reserved_balance(&mut self, amount: &Money) -> Result<(), BillingError> {
        self.ensure_open()?;
        self.ensure_currency(amount)?;
        if !amount.is_positive() {
            return Err(BillingError::invalid_amount("release must be positive"));
        }
        if amount.amount() > self.reserved_balance.amount() {
            return Err(BillingError::invalid_amount(format!(
                "cannot release {} from a reservation of {}",
                amount, self.reserved_balance
            )));
        }

        self.reserved_balance = self.reserved_balance.checked_sub(amount)?;
        self.recompute_available()?;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Sets the credit limit; must not be negative
    pub fn set_credit_limit(&mut self, limit: Money) -> Result<(), BillingError> {
        self.ensure_open()?;
        self.ensure_currency(&limit)?;
        if limit.is_negative() {
            return Err(BillingError::invalid_amount("credit limit must not be negative"));
        }
        self.credit_limit = limit;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Sets the prepaid floor
    pub fn set_minimum_balance(&mut self, minimum: Money) -> Result<(), BillingError> {
        self.ensure_open()?;
        self.ensure_currency(&minimum)?;
        self.minimum_balance = minimum;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Sets the suspension and termination thresholds
    ///
    /// Both must be at or below zero, and termination at or below suspension.
    pub fn set_thresholds(
        &mut self,
        suspension: Money,
        termination: Money,
    ) -> Result<(), BillingError> {
        self.ensure_open()?;
        self.ensure_currency(&suspension)?;
        self.ensure_currency(&termination)?;
        if suspension.is_positive() || termination.is_positive() {
            return Err(BillingError::validation("thresholds must be zero or negative"));
        }
        if termination.amount() > suspension.amount() {
            return Err(BillingError::validation(
                "termination threshold must not be above suspension threshold",
            ));
        }
        self.suspension_threshold = suspension;
        self.termination_threshold = termination;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Balance is at or below the suspension threshold
    pub fn below_suspension_threshold(&self) -> bool {
        self.current_balance.amount() <= self.suspension_threshold.amount()
    }

    /// Balance is at or below the termination threshold
    pub fn below_termination_threshold(&self) -> bool {
        self.current_balance.amount() <= self.termination_threshold.amount()
    }

    // Lifecycle transitions

    /// Pending -> Active
    pub fn activate(&mut self) -> Result<(), BillingError> {
        match self.status {
            AccountStatus::Pending => {
                self.status = AccountStatus::Active;
                self.updated_at = Utc::now();
                info!(account_id = %self.id, "Billing account activated");
                Ok(())
            }
            from => Err(BillingError::transition("account", from, AccountStatus::Active)),
        }
    }

    /// Active -> Suspended
    pub fn suspend(&mut self, reason: SuspensionReason) -> Result<(), BillingError> {
        match self.status {
            AccountStatus::Active => {
                let now = Utc::now();
                self.status = AccountStatus::Suspended;
                self.suspension_reason = Some(reason);
                self.suspended_at = Some(now);
                self.updated_at = now;
                info!(account_id = %self.id, ?reason, "Billing account suspended");
                Ok(())
            }
            AccountStatus::Closed => Err(BillingError::AccountClosed(self.id.to_string())),
            from => Err(BillingError::transition("account", from, AccountStatus::Suspended)),
        }
    }

    /// Suspended -> Active
    pub fn reactivate(&mut self) -> Result<(), BillingError> {
        match self.status {
            AccountStatus::Suspended => {
                self.status = AccountStatus::Active;
                self.suspension_reason = None;
                self.suspended_at = None;
                self.updated_at = Utc::now();
                info!(account_id = %self.id, "Billing account reactivated");
                Ok(())
            }
            AccountStatus::Closed => Err(BillingError::AccountClosed(self.id.to_string())),
            from => Err(BillingError::transition("account", from, AccountStatus::Active)),
        }
    }

    /// Any open state -> Closed (terminal)
    pub fn close(&mut self) -> Result<(), BillingError> {
        self.ensure_open()?;
        if self.reserved_balance.is_positive() {
            return Err(BillingError::validation(
                "cannot close an account with reserved balance",
            ));
        }
        let now = Utc::now();
        self.status = AccountStatus::Closed;
        self.closed_at = Some(now);
        self.updated_at = now;
        info!(account_id = %self.id, balance = %self.current_balance, "Billing account closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{BillingCategory, Direction};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn usd(amount: Decimal) -> Money {
        Money::new(amount, Currency::USD)
    }

    fn active_postpaid(credit_limit: Decimal) -> BillingAccount {
        let mut account =
            BillingAccount::new(CustomerId::new(), "ACC-1001", BillingType::Postpaid, Currency::USD)
                .with_credit_limit(usd(credit_limit))
                .unwrap();
        account.activate().unwrap();
        account
    }

    #[test]
    fn test_charge_then_payment_scenario() {
        let mut account = active_postpaid(dec!(100));

        let charge = account
            .apply_ledger_entry(LedgerPosting::charge(usd(dec!(150)), BillingCategory::Subscription))
            .unwrap();
        assert_eq!(charge.entry.balance_before, usd(dec!(0)));
        assert_eq!(charge.entry.balance_after, usd(dec!(-150)));
        assert!(!account.has_sufficient_balance(&usd(dec!(0))));

        let payment = account
            .apply_ledger_entry(LedgerPosting::payment(usd(dec!(150))))
            .unwrap();
        assert_eq!(payment.entry.balance_before, usd(dec!(-150)));
        assert_eq!(account.current_balance(), usd(dec!(0)));
        assert_eq!(payment.entry.sequence, 2);
    }

    #[test]
    fn test_prepaid_sufficiency_uses_minimum_balance() {
        let mut account =
            BillingAccount::new(CustomerId::new(), "ACC-2", BillingType::Prepaid, Currency::USD)
                .with_minimum_balance(usd(dec!(5)))
                .unwrap();
        account.activate().unwrap();
        account
            .apply_ledger_entry(LedgerPosting::payment(usd(dec!(20))))
            .unwrap();

        assert!(account.has_sufficient_balance(&usd(dec!(15))));
        assert!(!account.has_sufficient_balance(&usd(dec!(15.01))));
    }

    #[test]
    fn test_reservation_keeps_invariant() {
        let mut account = active_postpaid(dec!(0));
        account
            .apply_ledger_entry(LedgerPosting::payment(usd(dec!(50))))
            .unwrap();

        assert!(account.reserve_balance(&usd(dec!(30))).unwrap());
        assert_eq!(account.available_balance(), usd(dec!(20)));
        assert!(account.balances_consistent());

        assert!(!account.reserve_balance(&usd(dec!(25))).unwrap());
        assert_eq!(account.reserved_balance(), usd(dec!(30)));

        account.release_reserved_balance(&usd(dec!(30))).unwrap();
        assert_eq!(account.available_balance(), usd(dec!(50)));
        assert!(account.release_reserved_balance(&usd(dec!(1))).is_err());
    }

    #[test]
    fn test_reversal_restores_balance_and_flags_original() {
        let mut account = active_postpaid(dec!(0));
        let mut charge = account
            .apply_ledger_entry(LedgerPosting::charge(usd(dec!(70)), BillingCategory::Usage))
            .unwrap()
            .entry;
        let snapshot = charge.clone();

        let reversal = account.reverse_ledger_entry(&mut charge, "billing error").unwrap();
        assert_eq!(reversal.entry.direction, Direction::Increase);
        assert_eq!(account.current_balance(), usd(dec!(0)));
        assert!(charge.is_reversed);
        assert_eq!(charge.reversed_by, Some(reversal.entry.transaction_id));
        assert_eq!(charge.amount, snapshot.amount);
        assert_eq!(charge.balance_after, snapshot.balance_after);

        let again = account.reverse_ledger_entry(&mut charge, "twice");
        assert!(matches!(again, Err(BillingError::EntryAlreadyReversed(_))));
    }

    #[test]
    fn test_closed_account_rejects_mutation() {
        let mut account = active_postpaid(dec!(0));
        account.close().unwrap();

        let result = account.apply_ledger_entry(LedgerPosting::payment(usd(dec!(1))));
        assert!(matches!(result, Err(BillingError::AccountClosed(_))));
        assert!(matches!(account.reactivate(), Err(BillingError::AccountClosed(_))));
    }

    #[test]
    fn test_thresholds_must_be_ordered() {
        let account =
            BillingAccount::new(CustomerId::new(), "ACC-3", BillingType::Postpaid, Currency::USD);
        assert!(account
            .clone()
            .with_thresholds(usd(dec!(-100)), usd(dec!(-50)))
            .is_err());
        assert!(account
            .with_thresholds(usd(dec!(-50)), usd(dec!(-100)))
            .is_ok());
    }

    #[test]
    fn test_currency_mismatch_rejected() {
        let mut account = active_postpaid(dec!(0));
        let posting = LedgerPosting::payment(Money::new(dec!(10), Currency::EUR));
        assert!(matches!(
            account.apply_ledger_entry(posting),
            Err(BillingError::CurrencyMismatch { .. })
        ));
    }
}
