//! Unit of work
//!
//! Every command mutates exactly one billing account. A [`UnitOfWork`] holds
//! the working copy of that account plus everything the command staged:
//! new ledger entries and snapshots, reversal flags, and updated invoices,
//! payments, credit notes, dunning cases and payment plans.
//! [`BillingStore::commit`](crate::ports::BillingStore::commit) applies all of
//! it atomically, checking the account version it was opened at.

use std::collections::BTreeMap;

use core_kernel::{
    BillingAccountId, CreditNoteId, DunningCaseId, InvoiceId, PaymentId, PaymentPlanId,
    TransactionId,
};

use crate::account::BillingAccount;
use crate::credit_note::CreditNote;
use crate::dunning::DunningCase;
use crate::error::BillingError;
use crate::invoice::Invoice;
use crate::ledger::{BalanceSnapshot, LedgerEntry, LedgerPosting};
use crate::payment::Payment;
use crate::payment_plan::PaymentPlan;

/// A reversal flag to set on an already persisted entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReversalMark {
    pub original: TransactionId,
    pub reversed_by: TransactionId,
}

#[derive(Debug, Clone)]
pub struct UnitOfWork {
    account: BillingAccount,
    /// `None` when the account is being created
    expected_version: Option<u64>,
    entries: Vec<LedgerEntry>,
    snapshots: Vec<BalanceSnapshot>,
    reversals: Vec<ReversalMark>,
    invoices: BTreeMap<InvoiceId, Invoice>,
    payments: BTreeMap<PaymentId, Payment>,
    credit_notes: BTreeMap<CreditNoteId, CreditNote>,
    dunning_cases: BTreeMap<DunningCaseId, DunningCase>,
    payment_plans: BTreeMap<PaymentPlanId, PaymentPlan>,
}

impl UnitOfWork {
    fn with_account(account: BillingAccount, expected_version: Option<u64>) -> Self {
        Self {
            account,
            expected_version,
            entries: Vec::new(),
            snapshots: Vec::new(),
            reversals: Vec::new(),
            invoices: BTreeMap::new(),
            payments: BTreeMap::new(),
            credit_notes: BTreeMap::new(),
            dunning_cases: BTreeMap::new(),
            payment_plans: BTreeMap::new(),
        }
    }

    /// Opens a unit of work on a loaded account
    pub fn begin(account: BillingAccount) -> Self {
        let version = account.version();
        Self::with_account(account, Some(version))
    }

    /// Opens a unit of work that inserts a new account
    pub fn create(account: BillingAccount) -> Self {
        Self::with_account(account, None)
    }

    pub fn account_id(&self) -> BillingAccountId {
        self.account.id()
    }

    pub fn account(&self) -> &BillingAccount {
        &self.account
    }

    pub fn account_mut(&mut self) -> &mut BillingAccount {
        &mut self.account
    }

    pub fn expected_version(&self) -> Option<u64> {
        self.expected_version
    }

    /// Applies a posting to the working account and stages the entry
    pub fn post(&mut self, posting: LedgerPosting) -> Result<LedgerEntry, BillingError> {
        if let Some(key) = posting.idempotency_key.as_deref() {
            if let Some(existing) = self.staged_entry_by_key(key) {
                return Ok(existing.clone());
            }
        }
        let record = self.account.apply_ledger_entry(posting)?;
        let entry = record.entry.clone();
        self.entries.push(record.entry);
        self.snapshots.push(record.snapshot);
        Ok(entry)
    }

    /// Reverses `original` (persisted or staged in this unit)
    pub fn reverse(
        &mut self,
        mut original: LedgerEntry,
        reason: &str,
    ) -> Result<LedgerEntry, BillingError> {
        if let Some(staged) = self
            .entries
            .iter()
            .find(|e| e.transaction_id == original.transaction_id)
        {
            original = staged.clone();
        }
        if self.reversals.iter().any(|r| r.original == original.transaction_id) {
            return Err(BillingError::EntryAlreadyReversed(
                original.transaction_id.to_string(),
            ));
        }

        let record = self.account.reverse_ledger_entry(&mut original, reason)?;
        let reversal = record.entry.clone();

        match self
            .entries
            .iter_mut()
            .find(|e| e.transaction_id == original.transaction_id)
        {
            Some(staged) => *staged = original,
            None => self.reversals.push(ReversalMark {
                original: original.transaction_id,
                reversed_by: reversal.transaction_id,
            }),
        }
        self.entries.push(record.entry);
        self.snapshots.push(record.snapshot);
        Ok(reversal)
    }

    fn ensure_owned(&self, account_id: BillingAccountId, what: &str) -> Result<(), BillingError> {
        if account_id != self.account.id() {
            return Err(BillingError::validation(format!(
                "{} belongs to account {}, not {}",
                what,
                account_id,
                self.account.id()
            )));
        }
        Ok(())
    }

    pub fn stage_invoice(&mut self, invoice: Invoice) -> Result<(), BillingError> {
        self.ensure_owned(invoice.account_id, "invoice")?;
        self.invoices.insert(invoice.id, invoice);
        Ok(())
    }

    pub fn stage_payment(&mut self, payment: Payment) -> Result<(), BillingError> {
        self.ensure_owned(payment.account_id, "payment")?;
        self.payments.insert(payment.id, payment);
        Ok(())
    }

    pub fn stage_credit_note(&mut self, note: CreditNote) -> Result<(), BillingError> {
        self.ensure_owned(note.account_id, "credit note")?;
        self.credit_notes.insert(note.id, note);
        Ok(())
    }

    pub fn stage_dunning_case(&mut self, case: DunningCase) -> Result<(), BillingError> {
        self.ensure_owned(case.account_id, "dunning case")?;
        self.dunning_cases.insert(case.id, case);
        Ok(())
    }

    pub fn stage_payment_plan(&mut self, plan: PaymentPlan) -> Result<(), BillingError> {
        self.ensure_owned(plan.account_id, "payment plan")?;
        self.payment_plans.insert(plan.id, plan);
        Ok(())
    }

    // Staged state, for reads within the same command

    pub fn staged_entry_by_key(&self, key: &str) -> Option<&LedgerEntry> {
        self.entries
            .iter()
            .find(|e| e.idempotency_key.as_deref() == Some(key))
    }

    pub fn staged_invoice(&self, id: InvoiceId) -> Option<&Invoice> {
        self.invoices.get(&id)
    }

    pub fn staged_payment(&self, id: PaymentId) -> Option<&Payment> {
        self.payments.get(&id)
    }

    pub fn staged_dunning_case(&self, id: DunningCaseId) -> Option<&DunningCase> {
        self.dunning_cases.get(&id)
    }

    pub fn staged_payment_plan(&self, id: PaymentPlanId) -> Option<&PaymentPlan> {
        self.payment_plans.get(&id)
    }

    // Change set, for stores

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    pub fn snapshots(&self) -> &[BalanceSnapshot] {
        &self.snapshots
    }

    pub fn reversals(&self) -> &[ReversalMark] {
        &self.reversals
    }

    pub fn invoices(&self) -> impl Iterator<Item = &Invoice> {
        self.invoices.values()
    }

    pub fn payments(&self) -> impl Iterator<Item = &Payment> {
        self.payments.values()
    }

    pub fn credit_notes(&self) -> impl Iterator<Item = &CreditNote> {
        self.credit_notes.values()
    }

    pub fn dunning_cases(&self) -> impl Iterator<Item = &DunningCase> {
        self.dunning_cases.values()
    }

    pub fn payment_plans(&self) -> impl Iterator<Item = &PaymentPlan> {
        self.payment_plans.values()
    }

    /// The account as it will be stored: version advanced by one
    pub fn committed_account(&self) -> BillingAccount {
        let mut account = self.account.clone();
        account.set_version(self.expected_version.map_or(1, |v| v + 1));
        account
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::BillingType;
    use crate::ledger::BillingCategory;
    use core_kernel::{Currency, CustomerId, Money};
    use rust_decimal_macros::dec;

    fn unit() -> UnitOfWork {
        let mut account =
            BillingAccount::new(CustomerId::new(), "ACC-U", BillingType::Postpaid, Currency::USD);
        account.activate().unwrap();
        UnitOfWork::begin(account)
    }

    #[test]
    fn test_idempotent_post_within_unit() {
        let mut unit = unit();
        let posting = LedgerPosting::payment(Money::new(dec!(10), Currency::USD))
            .idempotency_key("pay-1");

        let first = unit.post(posting.clone()).unwrap();
        let second = unit.post(posting).unwrap();

        assert_eq!(first.transaction_id, second.transaction_id);
        assert_eq!(unit.entries().len(), 1);
        assert_eq!(unit.account().current_balance(), Money::new(dec!(10), Currency::USD));
    }

    #[test]
    fn test_reversing_staged_entry_updates_it_in_place() {
        let mut unit = unit();
        let charge = unit
            .post(LedgerPosting::charge(
                Money::new(dec!(30), Currency::USD),
                BillingCategory::Usage,
            ))
            .unwrap();

        let reversal = unit.reverse(charge.clone(), "duplicate").unwrap();
        assert!(unit.reversals().is_empty());
        assert!(unit.entries()[0].is_reversed);
        assert_eq!(unit.entries()[0].reversed_by, Some(reversal.transaction_id));
        assert!(unit.reverse(charge, "again").is_err());
    }

    #[test]
    fn test_committed_account_advances_version() {
        let unit = unit();
        assert_eq!(unit.committed_account().version(), 1);
    }
}
