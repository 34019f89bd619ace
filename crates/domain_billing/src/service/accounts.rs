//! Account commands: opening, ledger postings, holds and status changes

use tracing::info;

use core_kernel::{BillingAccountId, CustomerId, Money, TransactionId};

use crate::account::{BillingAccount, BillingType, SuspensionReason};
use crate::error::BillingError;
use crate::ledger::{LedgerEntry, LedgerPosting, LedgerReference};
use crate::unit_of_work::UnitOfWork;

use super::BillingService;

/// Limit changes; `None` leaves a value unchanged
#[derive(Debug, Clone, Default)]
pub struct AccountLimits {
    pub credit_limit: Option<Money>,
    pub minimum_balance: Option<Money>,
    pub suspension_threshold: Option<Money>,
    pub termination_threshold: Option<Money>,
}

impl BillingService {
    /// Opens an active account with the configured default limits
    ///
    /// # Errors
    ///
    /// - `DuplicateAccount` if the account number is taken
    pub async fn open_account(
        &self,
        customer_id: CustomerId,
        account_number: &str,
        billing_type: BillingType,
    ) -> Result<BillingAccount, BillingError> {
        if account_number.trim().is_empty() {
            return Err(BillingError::validation("account number is required"));
        }
        if self.store.find_account_by_number(account_number).await?.is_some() {
            return Err(BillingError::DuplicateAccount(account_number.to_string()));
        }

        let mut account =
            BillingAccount::new(customer_id, account_number, billing_type, self.config.currency)
                .with_defaults(&self.config.account_defaults)?;
        account.activate()?;

        let unit = UnitOfWork::create(account);
        let opened = unit.committed_account();
        self.store.commit(unit).await.map_err(|err| {
            if err.is_conflict() {
                BillingError::DuplicateAccount(account_number.to_string())
            } else {
                err.into()
            }
        })?;

        info!(
            account_id = %opened.id(),
            account_number,
            billing_type = ?billing_type,
            "Billing account opened"
        );
        Ok(opened)
    }

    /// Posts a ledger entry to an account
    ///
    /// A posting carrying an idempotency key that was already committed
    /// returns the original entry instead of posting again.
    pub async fn post_ledger_entry(
        &self,
        account_id: BillingAccountId,
        posting: LedgerPosting,
    ) -> Result<LedgerEntry, BillingError> {
        self.with_account_lock(account_id, || self.post_once(account_id, &posting))
            .await
    }

    async fn post_once(
        &self,
        account_id: BillingAccountId,
        posting: &LedgerPosting,
    ) -> Result<LedgerEntry, BillingError> {
        if let Some(key) = posting.idempotency_key.as_deref() {
            if let Some(existing) = self.store.find_entry_by_key(account_id, key).await? {
                info!(account_id = %account_id, key, "Duplicate posting ignored");
                return Ok(existing);
            }
        }
        let mut unit = self.begin(account_id).await?;
        let entry = unit.post(posting.clone())?;
        self.commit(unit).await?;
        Ok(entry)
    }

    /// Reverses a committed ledger entry
    ///
    /// # Errors
    ///
    /// - `EntryNotFound` if no such entry exists
    /// - `EntryAlreadyReversed` if it was reversed before
    /// - `Validation` if the entry belongs to an invoice, payment, credit
    ///   note or payment plan; those are undone through their own commands
    pub async fn reverse_transaction(
        &self,
        transaction_id: TransactionId,
        reason: &str,
    ) -> Result<LedgerEntry, BillingError> {
        let entry = self
            .store
            .find_entry(transaction_id)
            .await?
            .ok_or_else(|| BillingError::EntryNotFound(transaction_id.to_string()))?;
        if let Some(reference) = &entry.reference {
            if let Some(command) = owning_command(reference) {
                return Err(BillingError::validation(format!(
                    "entry {} belongs to {:?}; use {} instead",
                    transaction_id, reference, command
                )));
            }
        }
        let account_id = entry.account_id;
        self.with_account_lock(account_id, || {
            self.reverse_once(account_id, transaction_id, reason)
        })
        .await
    }

    async fn reverse_once(
        &self,
        account_id: BillingAccountId,
        transaction_id: TransactionId,
        reason: &str,
    ) -> Result<LedgerEntry, BillingError> {
        let original = self
            .store
            .find_entry(transaction_id)
            .await?
            .ok_or_else(|| BillingError::EntryNotFound(transaction_id.to_string()))?;
        let mut unit = self.begin(account_id).await?;
        let reversal = unit.reverse(original, reason)?;
        self.commit(unit).await?;
        Ok(reversal)
    }

    /// Places a hold; returns false when the available balance is short
    pub async fn reserve_balance(
        &self,
        account_id: BillingAccountId,
        amount: Money,
    ) -> Result<bool, BillingError> {
        self.with_account_lock(account_id, || async move {
            let mut unit = self.begin(account_id).await?;
            if !unit.account_mut().reserve_balance(&amount)? {
                return Ok(false);
            }
            self.commit(unit).await?;
            Ok(true)
        })
        .await
    }

    pub async fn release_reserved_balance(
        &self,
        account_id: BillingAccountId,
        amount: Money,
    ) -> Result<BillingAccount, BillingError> {
        self.update_account(account_id, |account| {
            account.release_reserved_balance(&amount)
        })
        .await
    }

    /// Changes credit limit, minimum balance or lifecycle thresholds
    pub async fn update_limits(
        &self,
        account_id: BillingAccountId,
        limits: AccountLimits,
    ) -> Result<BillingAccount, BillingError> {
        self.update_account(account_id, |account| {
            if let Some(limit) = limits.credit_limit {
                account.set_credit_limit(limit)?;
            }
            if limits.suspension_threshold.is_some() || limits.termination_threshold.is_some() {
                let suspension = limits
                    .suspension_threshold
                    .unwrap_or_else(|| account.suspension_threshold());
                let termination = limits
                    .termination_threshold
                    .unwrap_or_else(|| account.termination_threshold());
                account.set_thresholds(suspension, termination)?;
            }
            if let Some(minimum) = limits.minimum_balance {
                account.set_minimum_balance(minimum)?;
            }
            Ok(())
        })
        .await
    }

    /// Suspends an account on administrator request
    pub async fn suspend_account(
        &self,
        account_id: BillingAccountId,
    ) -> Result<BillingAccount, BillingError> {
        self.update_account(account_id, |account| account.suspend(SuspensionReason::Manual))
            .await
    }

    pub async fn reactivate_account(
        &self,
        account_id: BillingAccountId,
    ) -> Result<BillingAccount, BillingError> {
        self.update_account(account_id, BillingAccount::reactivate).await
    }

    /// Closes an account; closed accounts accept no further postings
    pub async fn close_account(
        &self,
        account_id: BillingAccountId,
    ) -> Result<BillingAccount, BillingError> {
        self.update_account(account_id, BillingAccount::close).await
    }

    async fn update_account<F>(
        &self,
        account_id: BillingAccountId,
        change: F,
    ) -> Result<BillingAccount, BillingError>
    where
        F: Fn(&mut BillingAccount) -> Result<(), BillingError>,
    {
        let change = &change;
        self.with_account_lock(account_id, || async move {
            let mut unit = self.begin(account_id).await?;
            change(unit.account_mut())?;
            let updated = unit.committed_account();
            self.commit(unit).await?;
            Ok(updated)
        })
        .await
    }
}

/// The command that undoes an entry written on behalf of another aggregate
fn owning_command(reference: &LedgerReference) -> Option<&'static str> {
    match reference {
        LedgerReference::Invoice(_) => Some("cancel_invoice or a credit note"),
        LedgerReference::Payment(_) => Some("refund_payment"),
        LedgerReference::CreditNote(_) => Some("void_credit_note"),
        LedgerReference::PaymentPlan(_) | LedgerReference::Installment(_) => {
            Some("cancel_payment_plan")
        }
        LedgerReference::Entry(_) => None,
    }
}
