//! Invoice management
//!
//! Invoices are built from line items while in draft, then issued. After
//! issue the only changes are payment application, refunds and status
//! transitions.
//!
//! # Invariants
//!
//! - `total = subtotal + tax - discount + adjustment`
//! - `balance_due = total - paid`
//! - `status == Paid` iff `balance_due <= 0` (for issued invoices)

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::info;

use core_kernel::{
    BillingAccountId, CreditNoteId, Currency, DateRange, InvoiceId, InvoiceItemId, Money,
    PaymentId, TransactionId,
};

use crate::error::BillingError;
use crate::ledger::BillingCategory;

/// Invoice status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    /// Being built; items and totals may change
    Draft,
    /// Issued and awaiting payment
    Pending,
    /// Delivered to the customer
    Sent,
    Paid,
    /// Past due date with a balance remaining
    Overdue,
    Cancelled,
    /// Payments were returned in full
    Refunded,
}

impl InvoiceStatus {
    /// Issued and not yet settled
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            InvoiceStatus::Pending | InvoiceStatus::Sent | InvoiceStatus::Overdue
        )
    }
}

/// What an invoice line bills for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceItemType {
    Subscription,
    Usage,
    Equipment,
    Installation,
    LateFee,
    Other,
}

impl InvoiceItemType {
    pub fn category(&self) -> BillingCategory {
        match self {
            InvoiceItemType::Subscription => BillingCategory::Subscription,
            InvoiceItemType::Usage => BillingCategory::Usage,
            InvoiceItemType::Equipment => BillingCategory::Equipment,
            InvoiceItemType::Installation => BillingCategory::Installation,
            InvoiceItemType::LateFee => BillingCategory::LateFee,
            InvoiceItemType::Other => BillingCategory::Other,
        }
    }
}

/// Fraction of `period` covered by `service`, counting days inclusively
///
/// Returns a factor in `(0, 1]`, or `None` when the two do not overlap
/// (such a line should not be billed at all).
pub fn proration_factor(service: &DateRange, period: &DateRange) -> Option<Decimal> {
    let overlap = service.intersection(period)?;
    let factor = Decimal::from(overlap.days()) / Decimal::from(period.days());
    Some(factor.round_dp(6).min(Decimal::ONE))
}

/// A line on an invoice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceItem {
    pub id: InvoiceItemId,
    pub description: String,
    pub item_type: InvoiceItemType,
    pub quantity: Decimal,
    pub unit_price: Money,
    /// Percentage taken off the prorated base before tax
    pub discount_percentage: Decimal,
    pub tax_percentage: Decimal,
    /// Scales this line independently of the rest of the invoice
    pub proration_factor: Option<Decimal>,
    pub service_period: Option<DateRange>,
    /// `quantity * unit_price * proration_factor`
    pub base_amount: Money,
    pub discount_amount: Money,
    pub tax_amount: Money,
    /// Base minus discount, before tax
    pub line_total: Money,
}

impl InvoiceItem {
    /// Creates a line item and computes its amounts
    ///
    /// # Arguments
    ///
    /// * `description` - Line description
    /// * `item_type` - What the line bills for
    /// * `quantity` - Billed quantity
    /// * `unit_price` - Price per unit
    pub fn new(
        description: impl Into<String>,
        item_type: InvoiceItemType,
        quantity: Decimal,
        unit_price: Money,
    ) -> Result<Self, BillingError> {
        let zero = Money::zero(unit_price.currency());
        let mut item = Self {
            id: InvoiceItemId::new_v7(),
            description: description.into(),
            item_type,
            quantity,
            unit_price,
            discount_percentage: Decimal::ZERO,
            tax_percentage: Decimal::ZERO,
            proration_factor: None,
            service_period: None,
            base_amount: zero,
            discount_amount: zero,
            tax_amount: zero,
            line_total: zero,
        };
        item.calculate_line_total()?;
        Ok(item)
    }

    pub fn with_tax(mut self, tax_percentage: Decimal) -> Result<Self, BillingError> {
        self.tax_percentage = tax_percentage;
        self.calculate_line_total()?;
        Ok(self)
    }

    pub fn with_discount(mut self, discount_percentage: Decimal) -> Result<Self, BillingError> {
        self.discount_percentage = discount_percentage;
        self.calculate_line_total()?;
        Ok(self)
    }

    pub fn with_proration(mut self, factor: Decimal) -> Result<Self, BillingError> {
        self.proration_factor = Some(factor);
        self.calculate_line_total()?;
        Ok(self)
    }

    /// Prorates the line by how much of `period` the service window covers
    pub fn for_service_period(
        mut self,
        service: DateRange,
        period: &DateRange,
    ) -> Result<Self, BillingError> {
        let factor = proration_factor(&service, period).ok_or_else(|| {
            BillingError::validation(format!(
                "service period {}..{} lies outside the billing period",
                service.start, service.end
            ))
        })?;
        self.service_period = Some(service);
        self.proration_factor = (factor < Decimal::ONE).then_some(factor);
        self.calculate_line_total()?;
        Ok(self)
    }

    pub fn is_prorated(&self) -> bool {
        self.proration_factor.is_some_and(|f| f < Decimal::ONE)
    }

    /// Recomputes base, discount, tax and line total
    ///
    /// Every derived amount is recomputed on each call, so resetting the
    /// discount percentage to zero also clears the discount amount.
    pub fn calculate_line_total(&mut self) -> Result<(), BillingError> {
        if self.quantity.is_sign_negative() {
            return Err(BillingError::validation("quantity must not be negative"));
        }
        if self.unit_price.is_negative() {
            return Err(BillingError::invalid_amount("unit price must not be negative"));
        }
        if self.discount_percentage < Decimal::ZERO || self.discount_percentage > dec!(100) {
            return Err(BillingError::validation("discount must be between 0 and 100 percent"));
        }
        if self.tax_percentage < Decimal::ZERO {
            return Err(BillingError::validation("tax must not be negative"));
        }
        let factor = self.proration_factor.unwrap_or(Decimal::ONE);
        if factor <= Decimal::ZERO || factor > Decimal::ONE {
            return Err(BillingError::validation(format!(
                "proration factor {} outside (0, 1]",
                factor
            )));
        }

        self.base_amount = self
            .unit_price
            .multiply(self.quantity * factor)
            .round_to_currency();
        self.discount_amount = self
            .base_amount
            .percent_of(self.discount_percentage)
            .round_to_currency();
        self.line_total = self.base_amount.checked_sub(&self.discount_amount)?;
        self.tax_amount = self
            .line_total
            .percent_of(self.tax_percentage)
            .round_to_currency();
        Ok(())
    }
}

/// Where money applied to an invoice came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum PaymentSource {
    Payment(PaymentId),
    CreditNote(CreditNoteId),
}

/// A single application of money to an invoice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedPayment {
    pub source: PaymentSource,
    pub amount: Money,
    pub refunded: Money,
    pub applied_at: DateTime<Utc>,
}

/// Result of applying money to an invoice
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PaymentApplication {
    /// Portion that reduced the balance due
    pub applied: Money,
    /// Portion beyond the balance due, left on the account as credit
    pub excess: Money,
}

/// An invoice for a billing period or an ad-hoc charge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: InvoiceId,
    /// Invoice number (human-readable, unique)
    pub invoice_number: String,
    pub account_id: BillingAccountId,
    pub billing_period: DateRange,
    pub invoice_date: NaiveDate,
    pub due_date: NaiveDate,
    pub currency: Currency,
    pub items: Vec<InvoiceItem>,
    pub subtotal: Money,
    pub tax_amount: Money,
    pub discount_amount: Money,
    pub adjustment_amount: Money,
    pub total: Money,
    pub paid_amount: Money,
    pub balance_due: Money,
    pub status: InvoiceStatus,
    pub is_prorated: bool,
    /// Smallest proration factor among the lines, 1 when none is prorated
    pub proration_factor: Decimal,
    /// Ledger entry that charged the total to the account
    pub charge_transaction_id: Option<TransactionId>,
    pub payments: Vec<AppliedPayment>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
}

impl Invoice {
    /// Creates a draft invoice
    pub fn new(
        account_id: BillingAccountId,
        invoice_number: impl Into<String>,
        billing_period: DateRange,
        invoice_date: NaiveDate,
        due_date: NaiveDate,
        currency: Currency,
    ) -> Result<Self, BillingError> {
        if due_date < invoice_date {
            return Err(BillingError::validation("due date precedes invoice date"));
        }
        let now = Utc::now();
        let zero = Money::zero(currency);
        Ok(Self {
            id: InvoiceId::new_v7(),
            invoice_number: invoice_number.into(),
            account_id,
            billing_period,
            invoice_date,
            due_date,
            currency,
            items: Vec::new(),
            subtotal: zero,
            tax_amount: zero,
            discount_amount: zero,
            adjustment_amount: zero,
            total: zero,
            paid_amount: zero,
            balance_due: zero,
            status: InvoiceStatus::Draft,
            is_prorated: false,
            proration_factor: Decimal::ONE,
            charge_transaction_id: None,
            payments: Vec::new(),
            notes: None,
            created_at: now,
            updated_at: now,
            sent_at: None,
            paid_at: None,
        })
    }

    fn ensure_draft(&self, action: &str) -> Result<(), BillingError> {
        if self.status != InvoiceStatus::Draft {
            return Err(BillingError::validation(format!(
                "cannot {} invoice {} in status {:?}",
                action, self.invoice_number, self.status
            )));
        }
        Ok(())
    }

    /// Adds a line item (draft only)
    pub fn add_item(&mut self, item: InvoiceItem) -> Result<(), BillingError> {
        self.ensure_draft("add items to")?;
        if item.unit_price.currency() != self.currency {
            return Err(BillingError::CurrencyMismatch {
                expected: self.currency.to_string(),
                actual: item.unit_price.currency().to_string(),
            });
        }
        self.items.push(item);
        self.calculate_totals()
    }

    /// Removes a line item (draft only)
    pub fn remove_item(&mut self, item_id: InvoiceItemId) -> Result<InvoiceItem, BillingError> {
        self.ensure_draft("remove items from")?;
        let position = self
            .items
            .iter()
            .position(|item| item.id == item_id)
            .ok_or_else(|| BillingError::validation(format!("no item {} on invoice", item_id)))?;
        let removed = self.items.remove(position);
        self.calculate_totals()?;
        Ok(removed)
    }

    /// Sets a signed adjustment added to the total (draft only)
    pub fn set_adjustment(&mut self, adjustment: Money) -> Result<(), BillingError> {
        self.ensure_draft("adjust")?;
        if adjustment.currency() != self.currency {
            return Err(BillingError::CurrencyMismatch {
                expected: self.currency.to_string(),
                actual: adjustment.currency().to_string(),
            });
        }
        self.adjustment_amount = adjustment;
        self.calculate_totals()
    }

    /// Recomputes every total from the items; idempotent, draft only
    pub fn calculate_totals(&mut self) -> Result<(), BillingError> {
        self.ensure_draft("recalculate")?;
        for item in &mut self.items {
            item.calculate_line_total()?;
        }

        self.subtotal = Money::try_sum(self.currency, self.items.iter().map(|i| &i.base_amount))?;
        self.discount_amount =
            Money::try_sum(self.currency, self.items.iter().map(|i| &i.discount_amount))?;
        self.tax_amount = Money::try_sum(self.currency, self.items.iter().map(|i| &i.tax_amount))?;
        self.total = self
            .subtotal
            .checked_add(&self.tax_amount)?
            .checked_sub(&self.discount_amount)?
            .checked_add(&self.adjustment_amount)?;
        self.balance_due = self.total.checked_sub(&self.paid_amount)?;

        self.proration_factor = self
            .items
            .iter()
            .filter_map(|i| i.proration_factor)
            .min()
            .unwrap_or(Decimal::ONE);
        self.is_prorated = self.proration_factor < Decimal::ONE;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Draft -> Pending
    pub fn submit(&mut self) -> Result<(), BillingError> {
        if self.status != InvoiceStatus::Draft {
            return Err(BillingError::transition("invoice", self.status, InvoiceStatus::Pending));
        }
        if self.items.is_empty() {
            return Err(BillingError::validation("cannot issue an invoice with no items"));
        }
        self.calculate_totals()?;
        if self.total.is_negative() {
            return Err(BillingError::invalid_amount("invoice total is negative"));
        }
        self.status = if self.balance_due.is_positive() {
            InvoiceStatus::Pending
        } else {
            self.paid_at = Some(Utc::now());
            InvoiceStatus::Paid
        };
        self.updated_at = Utc::now();
        info!(
            invoice_id = %self.id,
            invoice_number = %self.invoice_number,
            total = %self.total,
            "Invoice issued"
        );
        Ok(())
    }

    /// Pending -> Sent
    pub fn mark_sent(&mut self) -> Result<(), BillingError> {
        if self.status != InvoiceStatus::Pending {
            return Err(BillingError::transition("invoice", self.status, InvoiceStatus::Sent));
        }
        let now = Utc::now();
        self.status = InvoiceStatus::Sent;
        self.sent_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Flags an unpaid invoice past its due date; returns true if it changed
    pub fn mark_overdue(&mut self, today: NaiveDate) -> bool {
        let eligible = matches!(self.status, InvoiceStatus::Pending | InvoiceStatus::Sent);
        if eligible && today > self.due_date && self.balance_due.is_positive() {
            self.status = InvoiceStatus::Overdue;
            self.updated_at = Utc::now();
            return true;
        }
        false
    }

    /// Days past the due date, zero when not yet due
    pub fn days_overdue(&self, today: NaiveDate) -> i64 {
        (today - self.due_date).num_days().max(0)
    }

    /// Returns true when the invoice is issued, unpaid and past due
    pub fn is_past_due(&self, today: NaiveDate) -> bool {
        self.status.is_open() && self.balance_due.is_positive() && today > self.due_date
    }

    /// Applies money to the balance due
    ///
    /// Any amount beyond the balance due is returned as `excess` and is not
    /// retained on the invoice. Each source may be applied only once.
    pub fn apply_payment(
        &mut self,
        amount: Money,
        source: PaymentSource,
    ) -> Result<PaymentApplication, BillingError> {
        if !self.status.is_open() {
            return Err(BillingError::validation(format!(
                "invoice {} is {:?} and cannot take payments",
                self.invoice_number, self.status
            )));
        }
        if !amount.is_positive() {
            return Err(BillingError::invalid_amount("payment amount must be positive"));
        }
        if self.payments.iter().any(|p| p.source == source) {
            return Err(BillingError::PaymentAlreadyApplied(format!("{:?}", source)));
        }

        let applied = amount.min(&self.balance_due.floor_zero())?;
        let excess = amount.checked_sub(&applied)?;
        let now = Utc::now();

        self.paid_amount = self.paid_amount.checked_add(&applied)?;
        self.balance_due = self.total.checked_sub(&self.paid_amount)?;
        self.payments.push(AppliedPayment {
            source,
            amount: applied,
            refunded: Money::zero(self.currency),
            applied_at: now,
        });
        if !self.balance_due.is_positive() {
            self.status = InvoiceStatus::Paid;
            self.paid_at = Some(now);
        }
        self.updated_at = now;

        info!(
            invoice_id = %self.id,
            applied = %applied,
            balance_due = %self.balance_due,
            status = ?self.status,
            "Payment applied to invoice"
        );

        Ok(PaymentApplication { applied, excess })
    }

    /// Returns money previously applied from `source`
    ///
    /// Returns the amount taken off the invoice (at most what the source
    /// applied). A fully refunded invoice becomes `Refunded`; a partially
    /// refunded paid invoice reopens as `Pending`.
    pub fn record_refund(
        &mut self,
        source: PaymentSource,
        amount: Money,
    ) -> Result<Money, BillingError> {
        if !amount.is_positive() {
            return Err(BillingError::invalid_amount("refund amount must be positive"));
        }
        let application = self
            .payments
            .iter_mut()
            .find(|p| p.source == source)
            .ok_or_else(|| {
                BillingError::validation(format!("{:?} was not applied to this invoice", source))
            })?;

        let refundable = application.amount.checked_sub(&application.refunded)?;
        let refunded = amount.min(&refundable)?;
        if !refunded.is_positive() {
            return Ok(refunded);
        }
        application.refunded = application.refunded.checked_add(&refunded)?;

        self.paid_amount = self.paid_amount.checked_sub(&refunded)?;
        self.balance_due = self.total.checked_sub(&self.paid_amount)?;
        if self.paid_amount.is_zero() {
            self.status = InvoiceStatus::Refunded;
        } else if self.status == InvoiceStatus::Paid && self.balance_due.is_positive() {
            self.status = InvoiceStatus::Pending;
            self.paid_at = None;
        }
        self.updated_at = Utc::now();
        Ok(refunded)
    }

    /// Cancels an invoice nothing has been paid against
    pub fn cancel(&mut self, reason: &str) -> Result<(), BillingError> {
        let cancellable = self.status == InvoiceStatus::Draft || self.status.is_open();
        if !cancellable {
            return Err(BillingError::transition("invoice", self.status, InvoiceStatus::Cancelled));
        }
        if self.paid_amount.is_positive() {
            return Err(BillingError::validation(
                "cannot cancel an invoice with payments applied",
            ));
        }
        self.status = InvoiceStatus::Cancelled;
        self.notes = Some(reason.to_string());
        self.updated_at = Utc::now();
        info!(invoice_id = %self.id, reason, "Invoice cancelled");
        Ok(())
    }
}

/// Invoice number for a cycle invoice: one per account per period
pub fn cycle_invoice_number(account_number: &str, period: &DateRange) -> String {
    format!("INV-{}-{}", account_number, period.start.format("%Y%m%d"))
}

/// Invoice number for an ad-hoc invoice
pub fn adhoc_invoice_number(account_number: &str, issued: NaiveDate, sequence: usize) -> String {
    format!("INV-{}-{}-A{:03}", account_number, issued.format("%Y%m%d"), sequence)
}
