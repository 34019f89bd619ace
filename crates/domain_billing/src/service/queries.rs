//! Read-side queries
//!
//! Queries read committed state without taking account locks.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

use core_kernel::{
    BillingAccountId, CreditNoteId, InvoiceId, Money, PaymentId, PaymentPlanId,
};

use crate::account::BillingAccount;
use crate::credit_note::CreditNote;
use crate::dunning::DunningCase;
use crate::error::BillingError;
use crate::invoice::Invoice;
use crate::ledger::{BalanceSnapshot, LedgerEntry};
use crate::payment::Payment;
use crate::payment_plan::{InstallmentStatus, PaymentPlan};

use super::collections::overdue_summary;
use super::BillingService;

/// Balance and collections overview for one account
#[derive(Debug, Clone, Serialize)]
pub struct AccountSummary {
    pub account: BillingAccount,
    /// Unpaid balance across open invoices
    pub outstanding: Money,
    /// Past-due balance not covered by an active plan
    pub overdue: Money,
    pub open_invoices: usize,
    pub dunning_case: Option<DunningCase>,
    pub active_plans: Vec<PaymentPlanId>,
}

/// Progress of a payment plan
#[derive(Debug, Clone, Serialize)]
pub struct PaymentPlanStatus {
    pub plan: PaymentPlan,
    pub remaining_balance: Money,
    pub next_due_date: Option<NaiveDate>,
    pub next_due_amount: Option<Money>,
    pub overdue_installments: usize,
    pub paid_installments: usize,
}

impl BillingService {
    pub async fn account(&self, account_id: BillingAccountId) -> Result<BillingAccount, BillingError> {
        self.load_account(account_id).await
    }

    pub async fn account_summary(
        &self,
        account_id: BillingAccountId,
    ) -> Result<AccountSummary, BillingError> {
        let account = self.load_account(account_id).await?;
        let currency = account.currency();
        let invoices = self.store.invoices_for_account(account_id).await?;
        let plans = self.store.payment_plans_for_account(account_id).await?;

        let open: Vec<&Invoice> = invoices.iter().filter(|i| i.status.is_open()).collect();
        let outstanding = Money::try_sum(currency, open.iter().map(|i| &i.balance_due))?;
        let overdue = overdue_summary(&invoices, &plans, self.today(), currency)?;
        let dunning_case = self
            .store
            .dunning_cases_for_account(account_id)
            .await?
            .into_iter()
            .find(DunningCase::is_open);

        Ok(AccountSummary {
            outstanding,
            overdue: overdue.amount,
            open_invoices: open.len(),
            dunning_case,
            active_plans: plans.iter().filter(|p| p.is_active()).map(|p| p.id).collect(),
            account,
        })
    }

    pub async fn invoice(&self, invoice_id: InvoiceId) -> Result<Invoice, BillingError> {
        self.load_invoice(invoice_id).await
    }

    /// Invoices of an account, newest first
    pub async fn invoices(&self, account_id: BillingAccountId) -> Result<Vec<Invoice>, BillingError> {
        let mut invoices = self.store.invoices_for_account(account_id).await?;
        invoices.sort_by(|a, b| b.invoice_date.cmp(&a.invoice_date).then(b.created_at.cmp(&a.created_at)));
        Ok(invoices)
    }

    /// Ledger entries in sequence order, optionally by effective date
    pub async fn ledger_history(
        &self,
        account_id: BillingAccountId,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<LedgerEntry>, BillingError> {
        self.load_account(account_id).await?;
        Ok(self.store.ledger_entries(account_id, from, to).await?)
    }

    pub async fn balance_history(
        &self,
        account_id: BillingAccountId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<BalanceSnapshot>, BillingError> {
        if from > to {
            return Err(BillingError::validation("history range starts after it ends"));
        }
        self.load_account(account_id).await?;
        Ok(self.store.balance_snapshots(account_id, from, to).await?)
    }

    pub async fn payment(&self, payment_id: PaymentId) -> Result<Payment, BillingError> {
        self.load_payment(payment_id).await
    }

    pub async fn payments(&self, account_id: BillingAccountId) -> Result<Vec<Payment>, BillingError> {
        Ok(self.store.payments_for_account(account_id).await?)
    }

    pub async fn credit_note(&self, credit_note_id: CreditNoteId) -> Result<CreditNote, BillingError> {
        self.load_note(credit_note_id).await
    }

    pub async fn credit_notes(
        &self,
        account_id: BillingAccountId,
    ) -> Result<Vec<CreditNote>, BillingError> {
        Ok(self.store.credit_notes_for_account(account_id).await?)
    }

    /// Active cases across all accounts, most overdue first
    pub async fn active_dunning_cases(&self) -> Result<Vec<DunningCase>, BillingError> {
        let mut cases = self.store.active_dunning_cases().await?;
        cases.sort_by(|a, b| {
            b.escalation_level
                .cmp(&a.escalation_level)
                .then(b.total_overdue_amount.amount().cmp(&a.total_overdue_amount.amount()))
        });
        Ok(cases)
    }

    pub async fn dunning_cases(
        &self,
        account_id: BillingAccountId,
    ) -> Result<Vec<DunningCase>, BillingError> {
        Ok(self.store.dunning_cases_for_account(account_id).await?)
    }

    pub async fn payment_plan_status(
        &self,
        plan_id: PaymentPlanId,
    ) -> Result<PaymentPlanStatus, BillingError> {
        let plan = self.load_plan(plan_id).await?;
        let today = self.today();
        let next = plan.next_due();
        Ok(PaymentPlanStatus {
            remaining_balance: plan.remaining_balance()?,
            next_due_date: next.map(|i| i.due_date),
            next_due_amount: next.map(|i| i.balance_due),
            overdue_installments: plan
                .installments
                .iter()
                .filter(|i| {
                    i.status == InstallmentStatus::Overdue || i.is_overdue(today, plan.grace_period_days)
                })
                .count(),
            paid_installments: plan.installments.iter().filter(|i| i.is_paid()).count(),
            plan,
        })
    }
}
