//! Payment plan commands and the installment pass

use chrono::NaiveDate;
use tracing::{info, warn};

use core_kernel::{
    BillingAccountId, InstallmentId, InvoiceId, Money, OperationMetadata, PaymentPlanId,
};

use crate::error::BillingError;
use crate::ledger::{BillingCategory, LedgerPosting, LedgerReference};
use crate::payment_plan::{InstallmentStatus, PaymentPlan, PlanFrequency, PlanTerms};

use super::BillingService;

/// Terms requested for a new plan
///
/// `total_amount` defaults to the sum of the covered invoices' balances,
/// `grace_period_days` to the configured default.
#[derive(Debug, Clone)]
pub struct PaymentPlanRequest {
    pub account_id: BillingAccountId,
    pub invoice_ids: Vec<InvoiceId>,
    pub total_amount: Option<Money>,
    pub down_payment: Option<Money>,
    pub number_of_installments: u32,
    pub frequency: PlanFrequency,
    pub start_date: NaiveDate,
    pub grace_period_days: Option<u32>,
    pub late_fee: Option<Money>,
}

/// Result of an installment pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallmentReport {
    pub plans_checked: u32,
    pub installments_marked_overdue: u32,
    pub late_fees_charged: u32,
    pub plans_defaulted: u32,
    pub failed: u32,
}

impl BillingService {
    /// Creates an active plan over open invoices and builds its schedule
    ///
    /// # Errors
    ///
    /// - `Validation` if an invoice is not open, belongs to another account
    ///   or is already covered by an active plan
    pub async fn create_payment_plan(
        &self,
        request: PaymentPlanRequest,
        meta: &OperationMetadata,
    ) -> Result<PaymentPlan, BillingError> {
        let request = &request;
        self.with_account_lock(request.account_id, || async move {
            let mut unit = self.begin(request.account_id).await?;
            if unit.account().is_closed() {
                return Err(BillingError::AccountClosed(request.account_id.to_string()));
            }
            let currency = unit.account().currency();

            let covered: Vec<InvoiceId> = self
                .current_plans(&unit)
                .await?
                .iter()
                .filter(|p| p.is_active())
                .flat_map(|p| p.invoice_ids.iter().copied())
                .collect();

            let mut outstanding = Money::zero(currency);
            for invoice_id in &request.invoice_ids {
                let invoice = self.invoice_for_update(&unit, *invoice_id).await?;
                if !invoice.status.is_open() || !invoice.balance_due.is_positive() {
                    return Err(BillingError::validation(format!(
                        "invoice {} has nothing outstanding",
                        invoice.invoice_number
                    )));
                }
                if covered.contains(invoice_id) {
                    return Err(BillingError::validation(format!(
                        "invoice {} is already covered by a payment plan",
                        invoice.invoice_number
                    )));
                }
                outstanding = outstanding.checked_add(&invoice.balance_due)?;
            }

            let terms = PlanTerms {
                total_amount: request.total_amount.unwrap_or(outstanding),
                down_payment: request.down_payment.unwrap_or_else(|| Money::zero(currency)),
                number_of_installments: request.number_of_installments,
                frequency: request.frequency,
                start_date: request.start_date,
                grace_period_days: request
                    .grace_period_days
                    .unwrap_or(self.config.plans.default_grace_period_days),
                late_fee: request.late_fee.unwrap_or_else(|| Money::zero(currency)),
            };
            let mut plan = PaymentPlan::new(request.account_id, request.invoice_ids.clone(), terms)?;
            plan.created_by = meta.initiated_by.clone();
            plan.generate_installments()?;

            unit.stage_payment_plan(plan.clone())?;
            self.commit(unit).await?;
            info!(
                plan_id = %plan.id,
                account_id = %plan.account_id,
                total = %plan.total_amount,
                installments = plan.number_of_installments,
                "Payment plan created"
            );
            Ok(plan)
        })
        .await
    }

    pub async fn cancel_payment_plan(
        &self,
        plan_id: PaymentPlanId,
    ) -> Result<PaymentPlan, BillingError> {
        self.update_plan(plan_id, PaymentPlan::cancel).await
    }

    /// Defaults a plan on an explicit decision, outside the automatic rule
    pub async fn default_payment_plan(
        &self,
        plan_id: PaymentPlanId,
        installment_id: InstallmentId,
    ) -> Result<PaymentPlan, BillingError> {
        self.update_plan(plan_id, |plan| plan.mark_defaulted(installment_id))
            .await
    }

    async fn update_plan<F>(&self, plan_id: PaymentPlanId, change: F) -> Result<PaymentPlan, BillingError>
    where
        F: Fn(&mut PaymentPlan) -> Result<(), BillingError>,
    {
        let account_id = self.load_plan(plan_id).await?.account_id;
        let change = &change;
        self.with_account_lock(account_id, || async move {
            let mut unit = self.begin(account_id).await?;
            let mut plan = self.plan_for_update(&unit, plan_id).await?;
            change(&mut plan)?;
            unit.stage_payment_plan(plan.clone())?;
            self.commit(unit).await?;
            Ok(plan)
        })
        .await
    }

    /// Marks overdue installments, charges late fees and defaults plans
    /// with too many consecutive misses
    pub async fn run_installment_pass(&self) -> Result<InstallmentReport, BillingError> {
        let mut report = InstallmentReport::default();
        for account_id in self.store.list_account_ids().await? {
            let plans = self.store.payment_plans_for_account(account_id).await?;
            if !plans.iter().any(PaymentPlan::is_active) {
                continue;
            }
            match self
                .with_account_lock(account_id, || self.installments_once(account_id))
                .await
            {
                Ok(account_report) => {
                    report.plans_checked += account_report.plans_checked;
                    report.installments_marked_overdue += account_report.installments_marked_overdue;
                    report.late_fees_charged += account_report.late_fees_charged;
                    report.plans_defaulted += account_report.plans_defaulted;
                }
                Err(err) => {
                    warn!(account_id = %account_id, error = %err, "Installment pass failed for account");
                    report.failed += 1;
                }
            }
        }
        info!(
            plans = report.plans_checked,
            overdue = report.installments_marked_overdue,
            late_fees = report.late_fees_charged,
            defaulted = report.plans_defaulted,
            "Installment pass finished"
        );
        Ok(report)
    }

    async fn installments_once(
        &self,
        account_id: BillingAccountId,
    ) -> Result<InstallmentReport, BillingError> {
        let today = self.today();
        let mut unit = self.begin(account_id).await?;
        let mut report = InstallmentReport::default();
        if unit.account().is_closed() {
            return Ok(report);
        }
        let default_after = self.config.plans.default_after_consecutive_overdue;

        for mut plan in self.store.payment_plans_for_account(account_id).await? {
            if !plan.is_active() {
                continue;
            }
            report.plans_checked += 1;
            let mut changed = false;
            let grace = plan.grace_period_days;
            let late_fee = plan.late_fee;

            for installment in plan.installments.iter_mut() {
                if installment.mark_overdue(today, grace) {
                    report.installments_marked_overdue += 1;
                    changed = true;
                }
                let owes_fee = installment.status == InstallmentStatus::Overdue
                    && late_fee.is_positive()
                    && installment.late_fee_applied.is_zero();
                if owes_fee {
                    installment.apply_late_fee(late_fee, today, grace)?;
                    unit.post(
                        LedgerPosting::charge(late_fee, BillingCategory::LateFee)
                            .describe(format!("Late fee, installment {}", installment.number))
                            .reference(LedgerReference::Installment(installment.id))
                            .idempotency_key(format!("late-fee:{}", installment.id))
                            .effective_at(self.now()),
                    )?;
                    report.late_fees_charged += 1;
                    changed = true;
                }
            }

            if default_after > 0 && plan.consecutive_overdue(today) >= default_after {
                let latest = plan
                    .installments
                    .iter()
                    .filter(|i| i.status == InstallmentStatus::Overdue)
                    .max_by_key(|i| i.due_date)
                    .map(|i| i.id);
                if let Some(installment_id) = latest {
                    plan.mark_defaulted(installment_id)?;
                    report.plans_defaulted += 1;
                    changed = true;
                }
            }

            if changed {
                unit.stage_payment_plan(plan)?;
            }
        }

        if report.installments_marked_overdue > 0
            || report.late_fees_charged > 0
            || report.plans_defaulted > 0
        {
            self.commit(unit).await?;
        }
        Ok(report)
    }
}
