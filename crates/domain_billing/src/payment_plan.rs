//! Installment payment plans
//!
//! A payment plan spreads an overdue balance over a schedule of
//! installments, after an optional down payment.
//!
//! # Invariants
//!
//! - at generation, `sum(installment.amount) + down_payment == total_amount`
//! - an installment is overdue only after `due_date + grace_period_days`
//! - a late fee is added at most once per installment

use chrono::{DateTime, Duration, Months, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use core_kernel::{BillingAccountId, InstallmentId, InvoiceId, Money, PaymentId, PaymentPlanId};

use crate::error::BillingError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanFrequency {
    Weekly,
    BiWeekly,
    Monthly,
}

impl PlanFrequency {
    /// Due date of the installment at `index` (0-based)
    ///
    /// Monthly dates are computed from the start date each time, so a plan
    /// starting on the 31st falls on the last day of shorter months without
    /// drifting afterwards.
    pub fn due_date(&self, start: NaiveDate, index: u32) -> Option<NaiveDate> {
        match self {
            PlanFrequency::Weekly => start.checked_add_signed(Duration::weeks(i64::from(index))),
            PlanFrequency::BiWeekly => {
                start.checked_add_signed(Duration::weeks(2 * i64::from(index)))
            }
            PlanFrequency::Monthly => start.checked_add_months(Months::new(index)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Active,
    Completed,
    Defaulted,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallmentStatus {
    Pending,
    Paid,
    Overdue,
    Defaulted,
}

/// One scheduled payment within a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Installment {
    pub id: InstallmentId,
    /// 1-based position in the schedule
    pub number: u32,
    pub due_date: NaiveDate,
    pub amount: Money,
    pub paid_amount: Money,
    pub late_fee_applied: Money,
    pub balance_due: Money,
    pub status: InstallmentStatus,
    pub paid_date: Option<DateTime<Utc>>,
    pub payment_ids: Vec<PaymentId>,
}

impl Installment {
    pub fn new(number: u32, due_date: NaiveDate, amount: Money) -> Self {
        let zero = Money::zero(amount.currency());
        Self {
            id: InstallmentId::new_v7(),
            number,
            due_date,
            amount,
            paid_amount: zero,
            late_fee_applied: zero,
            balance_due: amount,
            status: InstallmentStatus::Pending,
            paid_date: None,
            payment_ids: Vec::new(),
        }
    }

    fn recompute_balance(&mut self) -> Result<(), BillingError> {
        self.balance_due = self
            .amount
            .checked_add(&self.late_fee_applied)?
            .checked_sub(&self.paid_amount)?;
        Ok(())
    }

    pub fn is_paid(&self) -> bool {
        self.status == InstallmentStatus::Paid
    }

    /// Unpaid and past the due date plus grace period
    pub fn is_overdue(&self, today: NaiveDate, grace_period_days: u32) -> bool {
        !self.is_paid()
            && self.balance_due.is_positive()
            && today > self.due_date + Duration::days(i64::from(grace_period_days))
    }

    /// Late fee not yet covered by payments
    pub fn outstanding_fee(&self) -> Result<Money, BillingError> {
        let fee_paid = self.paid_amount.min(&self.late_fee_applied)?;
        Ok(self.late_fee_applied.checked_sub(&fee_paid)?)
    }

    /// Applies up to `amount`; returns the portion used
    ///
    /// Payments cover an outstanding late fee first. The installment flips
    /// to `Paid` once `balance_due <= 0`.
    pub fn apply_payment(
        &mut self,
        amount: Money,
        payment_id: PaymentId,
        now: DateTime<Utc>,
    ) -> Result<Money, BillingError> {
        if self.payment_ids.contains(&payment_id) {
            return Err(BillingError::InstallmentPaymentAlreadyApplied {
                installment: self.id.to_string(),
                payment: payment_id.to_string(),
            });
        }
        if !amount.is_positive() {
            return Err(BillingError::invalid_amount("installment payment must be positive"));
        }
        if self.is_paid() {
            return Err(BillingError::validation(format!(
                "installment {} is already paid",
                self.number
            )));
        }

        let applied = amount.min(&self.balance_due)?;
        self.paid_amount = self.paid_amount.checked_add(&applied)?;
        self.payment_ids.push(payment_id);
        self.recompute_balance()?;
        if !self.balance_due.is_positive() {
            self.status = InstallmentStatus::Paid;
            self.paid_date = Some(now);
        }
        Ok(applied)
    }

    /// Adds the plan's late fee once, only when overdue
    pub fn apply_late_fee(
        &mut self,
        fee: Money,
        today: NaiveDate,
        grace_period_days: u32,
    ) -> Result<(), BillingError> {
        if !self.is_overdue(today, grace_period_days) {
            return Err(BillingError::validation(format!(
                "installment {} is not overdue",
                self.number
            )));
        }
        if !self.late_fee_applied.is_zero() {
            return Err(BillingError::validation(format!(
                "late fee already applied to installment {}",
                self.number
            )));
        }
        if !fee.is_positive() {
            return Err(BillingError::invalid_amount("late fee must be positive"));
        }
        self.late_fee_applied = fee;
        self.recompute_balance()
    }

    /// Pending -> Overdue when past grace; returns true if it changed
    pub fn mark_overdue(&mut self, today: NaiveDate, grace_period_days: u32) -> bool {
        if self.status == InstallmentStatus::Pending && self.is_overdue(today, grace_period_days) {
            self.status = InstallmentStatus::Overdue;
            return true;
        }
        false
    }

    pub fn mark_defaulted(&mut self) -> Result<(), BillingError> {
        if self.is_paid() {
            return Err(BillingError::transition(
                "installment",
                self.status,
                InstallmentStatus::Defaulted,
            ));
        }
        self.status = InstallmentStatus::Defaulted;
        Ok(())
    }
}

/// How a payment was split across a plan
#[derive(Debug, Clone, PartialEq)]
pub struct PlanPaymentOutcome {
    pub to_down_payment: Money,
    pub to_installments: Money,
    /// Part of `to_installments` that paid late fees
    pub to_late_fees: Money,
    /// Left over after every installment was paid
    pub excess: Money,
}

impl PlanPaymentOutcome {
    /// Money that reduced the original debt
    pub fn principal(&self) -> Result<Money, BillingError> {
        Ok(self
            .to_down_payment
            .checked_add(&self.to_installments)?
            .checked_sub(&self.to_late_fees)?)
    }
}

/// An installment agreement against an overdue balance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentPlan {
    pub id: PaymentPlanId,
    pub account_id: BillingAccountId,
    /// Invoices whose balance the plan covers
    pub invoice_ids: Vec<InvoiceId>,
    pub total_amount: Money,
    pub down_payment: Money,
    pub down_payment_paid: Money,
    pub number_of_installments: u32,
    pub frequency: PlanFrequency,
    pub start_date: NaiveDate,
    pub grace_period_days: u32,
    pub late_fee: Money,
    pub status: PlanStatus,
    pub installments: Vec<Installment>,
    pub down_payment_ids: Vec<PaymentId>,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Terms for a new plan
#[derive(Debug, Clone)]
pub struct PlanTerms {
    pub total_amount: Money,
    pub down_payment: Money,
    pub number_of_installments: u32,
    pub frequency: PlanFrequency,
    pub start_date: NaiveDate,
    pub grace_period_days: u32,
    pub late_fee: Money,
}

impl PaymentPlan {
    /// Creates an active plan with no installments yet
    pub fn new(
        account_id: BillingAccountId,
        invoice_ids: Vec<InvoiceId>,
        terms: PlanTerms,
    ) -> Result<Self, BillingError> {
        let currency = terms.total_amount.currency();
        if !terms.total_amount.is_positive() {
            return Err(BillingError::invalid_amount("plan total must be positive"));
        }
        if terms.down_payment.is_negative()
            || terms.down_payment.amount() >= terms.total_amount.amount()
        {
            return Err(BillingError::invalid_amount(
                "down payment must be non-negative and below the plan total",
            ));
        }
        if terms.late_fee.is_negative() {
            return Err(BillingError::invalid_amount("late fee must not be negative"));
        }
        if terms.down_payment.currency() != currency || terms.late_fee.currency() != currency {
            return Err(BillingError::CurrencyMismatch {
                expected: currency.to_string(),
                actual: terms.down_payment.currency().to_string(),
            });
        }
        if terms.number_of_installments == 0 {
            return Err(BillingError::validation("a plan needs at least one installment"));
        }

        let now = Utc::now();
        Ok(Self {
            id: PaymentPlanId::new_v7(),
            account_id,
            invoice_ids,
            total_amount: terms.total_amount,
            down_payment: terms.down_payment,
            down_payment_paid: Money::zero(currency),
            number_of_installments: terms.number_of_installments,
            frequency: terms.frequency,
            start_date: terms.start_date,
            grace_period_days: terms.grace_period_days,
            late_fee: terms.late_fee,
            status: PlanStatus::Active,
            installments: Vec::new(),
            down_payment_ids: Vec::new(),
            created_by: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        })
    }

    /// Builds the installment schedule
    ///
    /// The financed amount (`total - down_payment`) is split in minor units;
    /// any remainder goes to the earliest installments.
    pub fn generate_installments(&mut self) -> Result<&[Installment], BillingError> {
        if !self.installments.is_empty() {
            return Err(BillingError::validation("installments already generated"));
        }
        let financed = self.total_amount.checked_sub(&self.down_payment)?;
        let amounts = financed.allocate(self.number_of_installments)?;

        let mut installments = Vec::with_capacity(amounts.len());
        for (index, amount) in (0u32..).zip(amounts) {
            let due_date = self
                .frequency
                .due_date(self.start_date, index)
                .ok_or_else(|| BillingError::validation("installment due date out of range"))?;
            installments.push(Installment::new(index + 1, due_date, amount));
        }
        self.installments = installments;
        self.updated_at = Utc::now();
        info!(
            plan_id = %self.id,
            installments = self.number_of_installments,
            financed = %financed,
            "Installment schedule generated"
        );
        Ok(&self.installments)
    }

    pub fn is_active(&self) -> bool {
        self.status == PlanStatus::Active
    }

    pub fn installment_mut(&mut self, id: InstallmentId) -> Option<&mut Installment> {
        self.installments.iter_mut().find(|i| i.id == id)
    }

    pub fn down_payment_outstanding(&self) -> Result<Money, BillingError> {
        Ok(self.down_payment.checked_sub(&self.down_payment_paid)?.floor_zero())
    }

    /// Amount still owed, late fees included
    pub fn remaining_balance(&self) -> Result<Money, BillingError> {
        let currency = self.total_amount.currency();
        let fees = Money::try_sum(currency, self.installments.iter().map(|i| &i.late_fee_applied))?;
        let paid = Money::try_sum(currency, self.installments.iter().map(|i| &i.paid_amount))?;
        Ok(self
            .total_amount
            .checked_add(&fees)?
            .checked_sub(&self.down_payment_paid)?
            .checked_sub(&paid)?
            .floor_zero())
    }

    /// Earliest unpaid installment
    pub fn next_due(&self) -> Option<&Installment> {
        self.installments.iter().find(|i| !i.is_paid())
    }

    /// Applies a payment: outstanding down payment first, then installments
    /// in due order
    pub fn apply_payment(
        &mut self,
        amount: Money,
        payment_id: PaymentId,
        now: DateTime<Utc>,
    ) -> Result<PlanPaymentOutcome, BillingError> {
        if !self.is_active() {
            return Err(BillingError::validation(format!(
                "payment plan {} is {:?}",
                self.id, self.status
            )));
        }
        if self.down_payment_ids.contains(&payment_id)
            || self.installments.iter().any(|i| i.payment_ids.contains(&payment_id))
        {
            return Err(BillingError::PaymentAlreadyApplied(payment_id.to_string()));
        }
        if !amount.is_positive() {
            return Err(BillingError::invalid_amount("plan payment must be positive"));
        }

        let currency = amount.currency();
        let mut remaining = amount;

        let to_down_payment = remaining.min(&self.down_payment_outstanding()?)?;
        if to_down_payment.is_positive() {
            self.down_payment_paid = self.down_payment_paid.checked_add(&to_down_payment)?;
            self.down_payment_ids.push(payment_id);
            remaining = remaining.checked_sub(&to_down_payment)?;
        }

        let mut to_installments = Money::zero(currency);
        let mut to_late_fees = Money::zero(currency);
        let mut order: Vec<usize> = (0..self.installments.len()).collect();
        order.sort_by_key(|&i| (self.installments[i].due_date, self.installments[i].number));

        for index in order {
            if !remaining.is_positive() {
                break;
            }
            let installment = &mut self.installments[index];
            if installment.is_paid() || !installment.balance_due.is_positive() {
                continue;
            }
            let fee_outstanding = installment.outstanding_fee()?;
            let applied = installment.apply_payment(remaining, payment_id, now)?;
            to_late_fees = to_late_fees.checked_add(&applied.min(&fee_outstanding)?)?;
            to_installments = to_installments.checked_add(&applied)?;
            remaining = remaining.checked_sub(&applied)?;
        }

        self.updated_at = now;
        self.refresh_status(now);

        info!(
            plan_id = %self.id,
            payment_id = %payment_id,
            to_installments = %to_installments,
            excess = %remaining,
            status = ?self.status,
            "Payment applied to plan"
        );

        Ok(PlanPaymentOutcome {
            to_down_payment,
            to_installments,
            to_late_fees,
            excess: remaining,
        })
    }

    /// Completes the plan once everything is paid
    pub fn refresh_status(&mut self, now: DateTime<Utc>) {
        let down_paid = self
            .down_payment_outstanding()
            .map(|m| m.is_zero())
            .unwrap_or(false);
        if self.is_active()
            && down_paid
            && !self.installments.is_empty()
            && self.installments.iter().all(Installment::is_paid)
        {
            self.status = PlanStatus::Completed;
            self.completed_at = Some(now);
            info!(plan_id = %self.id, "Payment plan completed");
        }
    }

    /// Length of the trailing run of overdue installments as of `today`
    pub fn consecutive_overdue(&self, today: NaiveDate) -> u32 {
        let mut due: Vec<&Installment> = self
            .installments
            .iter()
            .filter(|i| i.due_date + Duration::days(i64::from(self.grace_period_days)) < today)
            .collect();
        due.sort_by_key(|i| i.due_date);
        due.iter()
            .rev()
            .take_while(|i| i.is_overdue(today, self.grace_period_days))
            .count() as u32
    }

    /// Marks an installment defaulted, which defaults the plan
    pub fn mark_defaulted(&mut self, installment_id: InstallmentId) -> Result<(), BillingError> {
        if !self.is_active() {
            return Err(BillingError::transition("payment plan", self.status, PlanStatus::Defaulted));
        }
        let installment = self
            .installment_mut(installment_id)
            .ok_or_else(|| BillingError::InstallmentNotFound(installment_id.to_string()))?;
        installment.mark_defaulted()?;
        self.status = PlanStatus::Defaulted;
        self.updated_at = Utc::now();
        info!(plan_id = %self.id, installment_id = %installment_id, "Payment plan defaulted");
        Ok(())
    }

    /// Active -> Cancelled
    pub fn cancel(&mut self) -> Result<(), BillingError> {
        if !self.is_active() {
            return Err(BillingError::transition("payment plan", self.status, PlanStatus::Cancelled));
        }
        self.status = PlanStatus::Cancelled;
        self.updated_at = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_kernel::Currency;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn usd(amount: Decimal) -> Money {
        Money::new(amount, Currency::USD)
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn plan(total: Decimal, down: Decimal, n: u32, frequency: PlanFrequency, start: NaiveDate) -> PaymentPlan {
        let mut plan = PaymentPlan::new(
            BillingAccountId::new(),
            Vec::new(),
            PlanTerms {
                total_amount: usd(total),
                down_payment: usd(down),
                number_of_installments: n,
                frequency,
                start_date: start,
                grace_period_days: 5,
                late_fee: usd(dec!(10)),
            },
        )
        .unwrap();
        plan.generate_installments().unwrap();
        plan
    }

    #[test]
    fn test_twelve_monthly_installments() {
        let plan = plan(dec!(1200), dec!(0), 12, PlanFrequency::Monthly, date(2024, 3, 15));

        assert_eq!(plan.installments.len(), 12);
        assert!(plan.installments.iter().all(|i| i.amount == usd(dec!(100))));
        assert_eq!(plan.installments[0].due_date, date(2024, 3, 15));
        assert_eq!(plan.installments[9].due_date, date(2024, 12, 15));
        assert_eq!(plan.installments[10].due_date, date(2025, 1, 15));
        assert_eq!(plan.installments[11].due_date, date(2025, 2, 15));
    }

    #[test]
    fn test_month_end_start_clamps_without_drift() {
        let plan = plan(dec!(300), dec!(0), 3, PlanFrequency::Monthly, date(2024, 1, 31));
        assert_eq!(plan.installments[1].due_date, date(2024, 2, 29));
        assert_eq!(plan.installments[2].due_date, date(2024, 3, 31));
    }

    #[test]
    fn test_remainder_goes_to_first_installments() {
        let plan = plan(dec!(100), dec!(0), 3, PlanFrequency::Weekly, date(2024, 6, 3));
        assert_eq!(plan.installments[0].amount, usd(dec!(33.34)));
        assert_eq!(plan.installments[2].amount, usd(dec!(33.33)));
        assert_eq!(plan.installments[1].due_date, date(2024, 6, 10));
    }

    #[test]
    fn test_down_payment_is_excluded_from_schedule() {
        let plan = plan(dec!(500), dec!(100), 4, PlanFrequency::BiWeekly, date(2024, 6, 3));
        let scheduled: Decimal = plan.installments.iter().map(|i| i.amount.amount()).sum();
        assert_eq!(scheduled + dec!(100), dec!(500));
        assert_eq!(plan.installments[1].due_date, date(2024, 6, 17));
    }

    #[test]
    fn test_late_fee_only_after_grace_and_once() {
        let mut plan = plan(dec!(300), dec!(0), 3, PlanFrequency::Monthly, date(2024, 6, 1));
        let installment = &mut plan.installments[0];

        assert!(installment.apply_late_fee(usd(dec!(10)), date(2024, 6, 6), 5).is_err());
        installment.apply_late_fee(usd(dec!(10)), date(2024, 6, 7), 5).unwrap();
        assert_eq!(installment.balance_due, usd(dec!(110)));
        assert!(installment.apply_late_fee(usd(dec!(10)), date(2024, 6, 8), 5).is_err());
    }

    #[test]
    fn test_waterfall_pays_fee_then_installments_in_order() {
        let now = Utc::now();
        let mut plan = plan(dec!(300), dec!(0), 3, PlanFrequency::Monthly, date(2024, 6, 1));
        plan.installments[0]
            .apply_late_fee(usd(dec!(10)), date(2024, 6, 10), 5)
            .unwrap();

        let outcome = plan.apply_payment(usd(dec!(150)), PaymentId::new(), now).unwrap();
        assert_eq!(outcome.to_installments, usd(dec!(150)));
        assert_eq!(outcome.to_late_fees, usd(dec!(10)));
        assert_eq!(outcome.principal().unwrap(), usd(dec!(140)));
        assert!(plan.installments[0].is_paid());
        assert_eq!(plan.installments[1].paid_amount, usd(dec!(40)));
        assert_eq!(plan.remaining_balance().unwrap(), usd(dec!(160)));
    }

    #[test]
    fn test_same_payment_cannot_apply_twice() {
        let now = Utc::now();
        let mut plan = plan(dec!(300), dec!(0), 3, PlanFrequency::Monthly, date(2024, 6, 1));
        let payment_id = PaymentId::new();
        plan.apply_payment(usd(dec!(50)), payment_id, now).unwrap();

        assert!(plan.apply_payment(usd(dec!(50)), payment_id, now).is_err());
        assert!(matches!(
            plan.installments[0].apply_payment(usd(dec!(50)), payment_id, now),
            Err(BillingError::InstallmentPaymentAlreadyApplied { .. })
        ));
    }

    #[test]
    fn test_overpayment_completes_plan_with_excess() {
        let now = Utc::now();
        let mut plan = plan(dec!(300), dec!(50), 2, PlanFrequency::Monthly, date(2024, 6, 1));
        let outcome = plan.apply_payment(usd(dec!(320)), PaymentId::new(), now).unwrap();

        assert_eq!(outcome.to_down_payment, usd(dec!(50)));
        assert_eq!(outcome.excess, usd(dec!(20)));
        assert_eq!(plan.status, PlanStatus::Completed);
        assert!(plan.remaining_balance().unwrap().is_zero());
    }

    #[test]
    fn test_consecutive_overdue_and_default() {
        let mut plan = plan(dec!(300), dec!(0), 3, PlanFrequency::Monthly, date(2024, 6, 1));
        let today = date(2024, 8, 20);
        assert_eq!(plan.consecutive_overdue(today), 3);

        plan.apply_payment(usd(dec!(100)), PaymentId::new(), Utc::now()).unwrap();
        assert_eq!(plan.consecutive_overdue(today), 2);

        let last = plan.installments[2].id;
        plan.mark_defaulted(last).unwrap();
        assert_eq!(plan.status, PlanStatus::Defaulted);
        assert_eq!(plan.installments[2].status, InstallmentStatus::Defaulted);
    }
}
