//! In-memory billing store
//!
//! Each aggregate type lives in its own table keyed by id, with secondary
//! indexes for account number, invoice number and per-account ledger order.
//! Used by tests and by single-process deployments without PostgreSQL.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use core_kernel::{
    BillingAccountId, CreditNoteId, DomainPort, DunningCaseId, InvoiceId, PaymentId,
    PaymentPlanId, PortError, TransactionId,
};

use crate::account::BillingAccount;
use crate::credit_note::CreditNote;
use crate::dunning::{DunningCase, DunningStatus};
use crate::invoice::Invoice;
use crate::ledger::{BalanceSnapshot, LedgerEntry};
use crate::payment::Payment;
use crate::payment_plan::PaymentPlan;
use crate::ports::BillingStore;
use crate::unit_of_work::UnitOfWork;

#[derive(Debug, Default)]
struct Tables {
    accounts: HashMap<BillingAccountId, BillingAccount>,
    account_numbers: HashMap<String, BillingAccountId>,
    entries: HashMap<TransactionId, LedgerEntry>,
    ledger_order: HashMap<BillingAccountId, Vec<TransactionId>>,
    snapshots: HashMap<BillingAccountId, Vec<BalanceSnapshot>>,
    invoices: HashMap<InvoiceId, Invoice>,
    invoice_numbers: HashMap<String, InvoiceId>,
    payments: HashMap<PaymentId, Payment>,
    credit_notes: HashMap<CreditNoteId, CreditNote>,
    dunning_cases: HashMap<DunningCaseId, DunningCase>,
    payment_plans: HashMap<PaymentPlanId, PaymentPlan>,
}

impl Tables {
    fn check(&self, unit: &UnitOfWork) -> Result<(), PortError> {
        let account = unit.account();
        match (unit.expected_version(), self.accounts.get(&account.id())) {
            (None, Some(_)) => {
                return Err(PortError::conflict(format!("account {} already exists", account.id())))
            }
            (None, None) => {
                if self.account_numbers.contains_key(account.account_number()) {
                    return Err(PortError::conflict(format!(
                        "account number {} already taken",
                        account.account_number()
                    )));
                }
            }
            (Some(expected), Some(stored)) if stored.version() != expected => {
                return Err(PortError::conflict(format!(
                    "account {} is at version {}, expected {}",
                    account.id(),
                    stored.version(),
                    expected
                )))
            }
            (Some(_), None) => return Err(PortError::not_found("BillingAccount", account.id())),
            (Some(_), Some(_)) => {}
        }

        for invoice in unit.invoices() {
            if let Some(existing) = self.invoice_numbers.get(&invoice.invoice_number) {
                if *existing != invoice.id {
                    return Err(PortError::conflict(format!(
                        "invoice number {} already issued",
                        invoice.invoice_number
                    )));
                }
            }
        }
        for mark in unit.reversals() {
            match self.entries.get(&mark.original) {
                Some(entry) if entry.is_reversed => {
                    return Err(PortError::conflict(format!(
                        "entry {} already reversed",
                        mark.original
                    )))
                }
                Some(_) => {}
                None => return Err(PortError::not_found("LedgerEntry", mark.original)),
            }
        }
        Ok(())
    }

    fn apply(&mut self, unit: &UnitOfWork) {
        let account = unit.committed_account();
        let account_id = account.id();
        self.account_numbers
            .insert(account.account_number().to_string(), account_id);
        self.accounts.insert(account_id, account);

        for entry in unit.entries() {
            self.ledger_order
                .entry(account_id)
                .or_default()
                .push(entry.transaction_id);
            self.entries.insert(entry.transaction_id, entry.clone());
        }
        for mark in unit.reversals() {
            if let Some(entry) = self.entries.get_mut(&mark.original) {
                entry.is_reversed = true;
                entry.reversed_by = Some(mark.reversed_by);
            }
        }
        self.snapshots
            .entry(account_id)
            .or_default()
            .extend(unit.snapshots().iter().cloned());

        for invoice in unit.invoices() {
            self.invoice_numbers
                .insert(invoice.invoice_number.clone(), invoice.id);
            self.invoices.insert(invoice.id, invoice.clone());
        }
        for payment in unit.payments() {
            self.payments.insert(payment.id, payment.clone());
        }
        for note in unit.credit_notes() {
            self.credit_notes.insert(note.id, note.clone());
        }
        for case in unit.dunning_cases() {
            self.dunning_cases.insert(case.id, case.clone());
        }
        for plan in unit.payment_plans() {
            self.payment_plans.insert(plan.id, plan.clone());
        }
    }
}

/// Thread-safe in-memory implementation of [`BillingStore`]
#[derive(Debug, Default)]
pub struct InMemoryBillingStore {
    tables: RwLock<Tables>,
    fail_next_commit: AtomicBool,
    conflict_next_commit: AtomicBool,
}

impl InMemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next commit fail with a storage error, leaving state untouched
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    /// Makes the next commit lose its version check, as if another writer
    /// got there first
    pub fn conflict_next_commit(&self) {
        self.conflict_next_commit.store(true, Ordering::SeqCst);
    }

    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn sorted<T: Clone, K: Ord>(items: impl Iterator<Item = T>, key: impl Fn(&T) -> K) -> Vec<T> {
        let mut items: Vec<T> = items.collect();
        items.sort_by_key(|item| key(item));
        items
    }
}

impl DomainPort for InMemoryBillingStore {}

#[async_trait]
impl BillingStore for InMemoryBillingStore {
    async fn load_account(
        &self,
        id: BillingAccountId,
    ) -> Result<Option<BillingAccount>, PortError> {
        Ok(self.read().accounts.get(&id).cloned())
    }

    async fn find_account_by_number(
        &self,
        account_number: &str,
    ) -> Result<Option<BillingAccount>, PortError> {
        let tables = self.read();
        Ok(tables
            .account_numbers
            .get(account_number)
            .and_then(|id| tables.accounts.get(id))
            .cloned())
    }

    async fn list_account_ids(&self) -> Result<Vec<BillingAccountId>, PortError> {
        let mut ids: Vec<_> = self.read().accounts.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }

    async fn find_entry(&self, id: TransactionId) -> Result<Option<LedgerEntry>, PortError> {
        Ok(self.read().entries.get(&id).cloned())
    }

    async fn find_entry_by_key(
        &self,
        account_id: BillingAccountId,
        key: &str,
    ) -> Result<Option<LedgerEntry>, PortError> {
        let tables = self.read();
        let Some(order) = tables.ledger_order.get(&account_id) else {
            return Ok(None);
        };
        Ok(order
            .iter()
            .filter_map(|id| tables.entries.get(id))
            .find(|entry| entry.idempotency_key.as_deref() == Some(key))
            .cloned())
    }

    async fn ledger_entries(
        &self,
        account_id: BillingAccountId,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<LedgerEntry>, PortError> {
        let tables = self.read();
        let Some(order) = tables.ledger_order.get(&account_id) else {
            return Ok(Vec::new());
        };
        Ok(order
            .iter()
            .filter_map(|id| tables.entries.get(id))
            .filter(|entry| from.map_or(true, |from| entry.effective_date >= from))
            .filter(|entry| to.map_or(true, |to| entry.effective_date <= to))
            .cloned()
            .collect())
    }

    async fn balance_snapshots(
        &self,
        account_id: BillingAccountId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<BalanceSnapshot>, PortError> {
        Ok(self
            .read()
            .snapshots
            .get(&account_id)
            .map(|snapshots| {
                snapshots
                    .iter()
                    .filter(|s| s.recorded_at >= from && s.recorded_at <= to)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn load_invoice(&self, id: InvoiceId) -> Result<Option<Invoice>, PortError> {
        Ok(self.read().invoices.get(&id).cloned())
    }

    async fn find_invoice_by_number(&self, number: &str) -> Result<Option<Invoice>, PortError> {
        let tables = self.read();
        Ok(tables
            .invoice_numbers
            .get(number)
            .and_then(|id| tables.invoices.get(id))
            .cloned())
    }

    async fn invoices_for_account(
        &self,
        account_id: BillingAccountId,
    ) -> Result<Vec<Invoice>, PortError> {
        let tables = self.read();
        Ok(Self::sorted(
            tables
                .invoices
                .values()
                .filter(|i| i.account_id == account_id)
                .cloned(),
            |i| (i.invoice_date, i.id),
        ))
    }

    async fn load_payment(&self, id: PaymentId) -> Result<Option<Payment>, PortError> {
        Ok(self.read().payments.get(&id).cloned())
    }

    async fn find_payment_by_key(
        &self,
        account_id: BillingAccountId,
        key: &str,
    ) -> Result<Option<Payment>, PortError> {
        Ok(self
            .read()
            .payments
            .values()
            .find(|p| p.account_id == account_id && p.idempotency_key.as_deref() == Some(key))
            .cloned())
    }

    async fn payments_for_account(
        &self,
        account_id: BillingAccountId,
    ) -> Result<Vec<Payment>, PortError> {
        let tables = self.read();
        Ok(Self::sorted(
            tables
                .payments
                .values()
                .filter(|p| p.account_id == account_id)
                .cloned(),
            |p| (p.created_at, p.id),
        ))
    }

    async fn payments_due_for_retry(&self, now: DateTime<Utc>) -> Result<Vec<Payment>, PortError> {
        let tables = self.read();
        Ok(Self::sorted(
            tables
                .payments
                .values()
                .filter(|p| p.is_due_for_retry(now))
                .cloned(),
            |p| (p.next_retry_date, p.id),
        ))
    }

    async fn load_credit_note(&self, id: CreditNoteId) -> Result<Option<CreditNote>, PortError> {
        Ok(self.read().credit_notes.get(&id).cloned())
    }

    async fn credit_notes_for_account(
        &self,
        account_id: BillingAccountId,
    ) -> Result<Vec<CreditNote>, PortError> {
        let tables = self.read();
        Ok(Self::sorted(
            tables
                .credit_notes
                .values()
                .filter(|n| n.account_id == account_id)
                .cloned(),
            |n| (n.created_at, n.id),
        ))
    }

    async fn load_dunning_case(
        &self,
        id: DunningCaseId,
    ) -> Result<Option<DunningCase>, PortError> {
        Ok(self.read().dunning_cases.get(&id).cloned())
    }

    async fn dunning_cases_for_account(
        &self,
        account_id: BillingAccountId,
    ) -> Result<Vec<DunningCase>, PortError> {
        let tables = self.read();
        Ok(Self::sorted(
            tables
                .dunning_cases
                .values()
                .filter(|c| c.account_id == account_id)
                .cloned(),
            |c| (c.opened_at, c.id),
        ))
    }

    async fn active_dunning_cases(&self) -> Result<Vec<DunningCase>, PortError> {
        let tables = self.read();
        Ok(Self::sorted(
            tables
                .dunning_cases
                .values()
                .filter(|c| c.status == DunningStatus::Active)
                .cloned(),
            |c| (c.opened_at, c.id),
        ))
    }

    async fn load_payment_plan(
        &self,
        id: PaymentPlanId,
    ) -> Result<Option<PaymentPlan>, PortError> {
        Ok(self.read().payment_plans.get(&id).cloned())
    }

    async fn payment_plans_for_account(
        &self,
        account_id: BillingAccountId,
    ) -> Result<Vec<PaymentPlan>, PortError> {
        let tables = self.read();
        Ok(Self::sorted(
            tables
                .payment_plans
                .values()
                .filter(|p| p.account_id == account_id)
                .cloned(),
            |p| (p.created_at, p.id),
        ))
    }

    async fn commit(&self, unit: UnitOfWork) -> Result<(), PortError> {
        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(PortError::internal("injected commit failure"));
        }
        if self.conflict_next_commit.swap(false, Ordering::SeqCst) {
            return Err(PortError::conflict("injected version conflict"));
        }
        let mut tables = self.write();
        tables.check(&unit)?;
        tables.apply(&unit);
        Ok(())
    }
}
