//! Invoice commands
//!
//! Issuing an invoice posts one charge for its total to the account
//! ledger; cancelling reverses that charge.

use chrono::Duration;
use tracing::{info, warn};

use core_kernel::{BillingAccountId, DateRange, InvoiceId, InvoiceItemId, Money};

use crate::account::AccountStatus;
use crate::error::BillingError;
use crate::invoice::{adhoc_invoice_number, cycle_invoice_number, Invoice, InvoiceItem};
use crate::ledger::{BillingCategory, LedgerPosting, LedgerReference};
use crate::ports::LineItemSource;
use crate::unit_of_work::UnitOfWork;

use super::BillingService;

/// Result of an invoice cycle across all accounts
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub generated: u32,
    /// Accounts already invoiced for the period
    pub already_invoiced: u32,
    /// Accounts with nothing billable
    pub empty: u32,
    pub skipped_inactive: u32,
    pub failed: u32,
}

/// Single category when every line shares one, `Other` otherwise
fn invoice_category(invoice: &Invoice) -> BillingCategory {
    let mut categories = invoice.items.iter().map(|item| item.item_type.category());
    match categories.next() {
        Some(first) if categories.all(|c| c == first) => first,
        _ => BillingCategory::Other,
    }
}

impl BillingService {
    /// Issues a draft invoice and posts its charge within `unit`
    fn issue(&self, unit: &mut UnitOfWork, invoice: &mut Invoice) -> Result<(), BillingError> {
        invoice.submit()?;
        if invoice.total.is_positive() {
            let entry = unit.post(
                LedgerPosting::charge(invoice.total, invoice_category(invoice))
                    .describe(format!("Invoice {}", invoice.invoice_number))
                    .reference(LedgerReference::Invoice(invoice.id))
                    .idempotency_key(format!("invoice:{}", invoice.id))
                    .effective_at(self.now()),
            )?;
            invoice.charge_transaction_id = Some(entry.transaction_id);
        }
        Ok(())
    }

    /// Generates and issues the cycle invoice for `period`
    ///
    /// Line items are collected before the account lock is taken. The
    /// invoice number is derived from the account and period, so a second
    /// run for the same period fails with `DuplicateInvoice`.
    ///
    /// # Errors
    ///
    /// - `DuplicateInvoice` if the period was already invoiced
    /// - `Validation` if the source yields no billable items
    pub async fn generate_invoice(
        &self,
        account_id: BillingAccountId,
        period: DateRange,
        source: &dyn LineItemSource,
    ) -> Result<Invoice, BillingError> {
        self.generate_for(account_id, period, source)
            .await?
            .ok_or_else(|| {
                BillingError::validation(format!(
                    "no billable items for account {} from {} to {}",
                    account_id, period.start, period.end
                ))
            })
    }

    /// `None` when there is nothing to bill
    async fn generate_for(
        &self,
        account_id: BillingAccountId,
        period: DateRange,
        source: &dyn LineItemSource,
    ) -> Result<Option<Invoice>, BillingError> {
        let account = self.load_account(account_id).await?;
        let number = cycle_invoice_number(account.account_number(), &period);
        if self.store.find_invoice_by_number(&number).await?.is_some() {
            return Err(BillingError::DuplicateInvoice(number));
        }

        let items = source.line_items(&account, &period).await?;
        if items.is_empty() {
            return Ok(None);
        }

        let invoice = self
            .with_account_lock(account_id, || {
                self.generate_once(account_id, &number, period, &items)
            })
            .await?;
        Ok(Some(invoice))
    }

    async fn generate_once(
        &self,
        account_id: BillingAccountId,
        number: &str,
        period: DateRange,
        items: &[InvoiceItem],
    ) -> Result<Invoice, BillingError> {
        // A concurrent run may have committed the number since the first check
        if self.store.find_invoice_by_number(number).await?.is_some() {
            return Err(BillingError::DuplicateInvoice(number.to_string()));
        }
        let mut unit = self.begin(account_id).await?;
        let today = self.today();
        let mut invoice = Invoice::new(
            account_id,
            number,
            period,
            today,
            today + Duration::days(i64::from(self.config.invoice_due_days)),
            unit.account().currency(),
        )?;
        for item in items {
            invoice.add_item(item.clone())?;
        }
        self.issue(&mut unit, &mut invoice)?;
        unit.stage_invoice(invoice.clone())?;
        self.commit(unit).await?;

        info!(
            account_id = %account_id,
            invoice_number = %invoice.invoice_number,
            total = %invoice.total,
            prorated = invoice.is_prorated,
            "Cycle invoice generated"
        );
        Ok(invoice)
    }

    /// Generates cycle invoices for every active or suspended account
    ///
    /// One account's failure never stops the run.
    pub async fn run_invoice_cycle(
        &self,
        period: DateRange,
        source: &dyn LineItemSource,
    ) -> Result<CycleReport, BillingError> {
        let mut report = CycleReport::default();
        for account_id in self.store.list_account_ids().await? {
            let account = match self.load_account(account_id).await {
                Ok(account) => account,
                Err(err) => {
                    warn!(account_id = %account_id, error = %err, "Cannot load account for invoicing");
                    report.failed += 1;
                    continue;
                }
            };
            if matches!(account.status(), AccountStatus::Pending | AccountStatus::Closed) {
                report.skipped_inactive += 1;
                continue;
            }

            match self.generate_for(account_id, period, source).await {
                Ok(Some(_)) => report.generated += 1,
                Ok(None) => report.empty += 1,
                Err(BillingError::DuplicateInvoice(_)) => report.already_invoiced += 1,
                Err(err) => {
                    warn!(account_id = %account_id, error = %err, "Invoice generation failed");
                    report.failed += 1;
                }
            }
        }
        info!(
            period_start = %period.start,
            generated = report.generated,
            already_invoiced = report.already_invoiced,
            failed = report.failed,
            "Invoice cycle finished"
        );
        Ok(report)
    }

    /// Creates an empty ad-hoc draft invoice
    pub async fn create_invoice(
        &self,
        account_id: BillingAccountId,
        notes: Option<String>,
    ) -> Result<Invoice, BillingError> {
        let notes = &notes;
        self.with_account_lock(account_id, || async move {
            let mut unit = self.begin(account_id).await?;
            if unit.account().is_closed() {
                return Err(BillingError::AccountClosed(account_id.to_string()));
            }
            let today = self.today();
            let sequence = self.current_invoices(&unit).await?.len() + 1;
            let mut invoice = Invoice::new(
                account_id,
                adhoc_invoice_number(unit.account().account_number(), today, sequence),
                DateRange::new(today, today)?,
                today,
                today + Duration::days(i64::from(self.config.invoice_due_days)),
                unit.account().currency(),
            )?;
            invoice.notes = notes.clone();
            unit.stage_invoice(invoice.clone())?;
            self.commit(unit).await?;
            Ok(invoice)
        })
        .await
    }

    pub async fn add_invoice_item(
        &self,
        invoice_id: InvoiceId,
        item: InvoiceItem,
    ) -> Result<Invoice, BillingError> {
        self.update_invoice(invoice_id, |invoice| invoice.add_item(item.clone()))
            .await
    }

    pub async fn remove_invoice_item(
        &self,
        invoice_id: InvoiceId,
        item_id: InvoiceItemId,
    ) -> Result<Invoice, BillingError> {
        self.update_invoice(invoice_id, |invoice| invoice.remove_item(item_id).map(|_| ()))
            .await
    }

    /// Sets a manual adjustment on a draft invoice
    pub async fn set_invoice_adjustment(
        &self,
        invoice_id: InvoiceId,
        adjustment: Money,
    ) -> Result<Invoice, BillingError> {
        self.update_invoice(invoice_id, |invoice| invoice.set_adjustment(adjustment))
            .await
    }

    pub async fn mark_invoice_sent(&self, invoice_id: InvoiceId) -> Result<Invoice, BillingError> {
        self.update_invoice(invoice_id, Invoice::mark_sent).await
    }

    /// Issues a draft invoice: Draft -> Pending and the charge is posted
    pub async fn finalize_invoice(&self, invoice_id: InvoiceId) -> Result<Invoice, BillingError> {
        let account_id = self.load_invoice(invoice_id).await?.account_id;
        self.with_account_lock(account_id, || async move {
            let mut unit = self.begin(account_id).await?;
            let mut invoice = self.invoice_for_update(&unit, invoice_id).await?;
            self.issue(&mut unit, &mut invoice)?;
            unit.stage_invoice(invoice.clone())?;
            self.commit(unit).await?;
            Ok(invoice)
        })
        .await
    }

    /// Cancels an unpaid invoice and reverses its charge
    pub async fn cancel_invoice(
        &self,
        invoice_id: InvoiceId,
        reason: &str,
    ) -> Result<Invoice, BillingError> {
        let account_id = self.load_invoice(invoice_id).await?.account_id;
        self.with_account_lock(account_id, || async move {
            let mut unit = self.begin(account_id).await?;
            let mut invoice = self.invoice_for_update(&unit, invoice_id).await?;
            invoice.cancel(reason)?;
            if let Some(charge_id) = invoice.charge_transaction_id {
                let charge = self
                    .store
                    .find_entry(charge_id)
                    .await?
                    .ok_or_else(|| BillingError::EntryNotFound(charge_id.to_string()))?;
                unit.reverse(charge, &format!("invoice {} cancelled", invoice.invoice_number))?;
            }
            unit.stage_invoice(invoice.clone())?;
            self.commit(unit).await?;
            Ok(invoice)
        })
        .await
    }

    async fn update_invoice<F>(&self, invoice_id: InvoiceId, change: F) -> Result<Invoice, BillingError>
    where
        F: Fn(&mut Invoice) -> Result<(), BillingError>,
    {
        let account_id = self.load_invoice(invoice_id).await?.account_id;
        let change = &change;
        self.with_account_lock(account_id, || async move {
            let mut unit = self.begin(account_id).await?;
            let mut invoice = self.invoice_for_update(&unit, invoice_id).await?;
            change(&mut invoice)?;
            unit.stage_invoice(invoice.clone())?;
            self.commit(unit).await?;
            Ok(invoice)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoice::InvoiceItemType;
    use chrono::NaiveDate;
    use core_kernel::Currency;
    use rust_decimal_macros::dec;

    fn invoice_with(types: &[InvoiceItemType]) -> Invoice {
        let day = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let mut invoice = Invoice::new(
            BillingAccountId::new(),
            "INV-T",
            DateRange::new(day, day).unwrap(),
            day,
            day,
            Currency::USD,
        )
        .unwrap();
        for item_type in types {
            invoice
                .add_item(
                    InvoiceItem::new("line", *item_type, dec!(1), Money::new(dec!(5), Currency::USD))
                        .unwrap(),
                )
                .unwrap();
        }
        invoice
    }

    #[test]
    fn test_invoice_category_uniform() {
        let invoice = invoice_with(&[InvoiceItemType::Usage, InvoiceItemType::Usage]);
        assert_eq!(invoice_category(&invoice), BillingCategory::Usage);
    }

    #[test]
    fn test_invoice_category_mixed() {
        let invoice = invoice_with(&[InvoiceItemType::Usage, InvoiceItemType::Equipment]);
        assert_eq!(invoice_category(&invoice), BillingCategory::Other);
    }
}
