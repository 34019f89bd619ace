//! Collections: overdue reconciliation, dunning and lifecycle enforcement
//!
//! The reconciliation pass walks every account under its lock. For each
//! one it marks past-due invoices overdue, opens, escalates or resolves the
//! account's dunning case, and applies the lifecycle policy. Notices are
//! delivered afterwards with no lock held, and their delivery status is
//! written back in a separate unit of work.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, NaiveDate, Utc};
use tracing::{info, warn};

use core_kernel::{
    BillingAccountId, Currency, DunningActionId, DunningCaseId, Money, OperationMetadata,
};

use crate::account::{AccountStatus, SuspensionReason};
use crate::dunning::{DunningActionKind, DunningCase};
use crate::error::BillingError;
use crate::invoice::Invoice;
use crate::lifecycle::LifecycleAction;
use crate::payment_plan::PaymentPlan;
use crate::ports::{DeliveryStatus, NotificationContext};
use crate::unit_of_work::UnitOfWork;

use super::BillingService;

/// Overdue exposure of one account
#[derive(Debug, Clone, Copy, PartialEq)]
pub(super) struct OverdueSummary {
    pub amount: Money,
    /// Age of the oldest overdue invoice
    pub days: i64,
    pub invoices: usize,
}

/// Sums past-due invoice balances, skipping invoices an active payment plan
/// covers
pub(super) fn overdue_summary(
    invoices: &[Invoice],
    plans: &[PaymentPlan],
    today: NaiveDate,
    currency: Currency,
) -> Result<OverdueSummary, BillingError> {
    let covered: HashSet<_> = plans
        .iter()
        .filter(|p| p.is_active())
        .flat_map(|p| p.invoice_ids.iter().copied())
        .collect();

    let mut summary = OverdueSummary {
        amount: Money::zero(currency),
        days: 0,
        invoices: 0,
    };
    for invoice in invoices
        .iter()
        .filter(|i| i.is_past_due(today) && !covered.contains(&i.id))
    {
        summary.amount = summary.amount.checked_add(&invoice.balance_due)?;
        summary.days = summary.days.max(invoice.days_overdue(today));
        summary.invoices += 1;
    }
    Ok(summary)
}

/// What a reconciliation pass did to one account
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub invoices_marked_overdue: u32,
    pub case_opened: Option<DunningCaseId>,
    pub escalated_to: Option<u32>,
    pub case_resolved: bool,
    pub lifecycle: Option<LifecycleAction>,
}

impl ReconcileOutcome {
    fn changed(&self) -> bool {
        self.invoices_marked_overdue > 0
            || self.case_opened.is_some()
            || self.escalated_to.is_some()
            || self.case_resolved
            || self.lifecycle.is_some()
    }
}

/// Totals for a dunning pass across all accounts
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DunningReport {
    pub accounts: u32,
    pub invoices_marked_overdue: u32,
    pub cases_opened: u32,
    pub cases_escalated: u32,
    pub cases_resolved: u32,
    pub suspended: u32,
    pub terminated: u32,
    pub restored: u32,
    pub notices_sent: u32,
    pub failed: u32,
}

impl DunningReport {
    fn record(&mut self, outcome: &ReconcileOutcome) {
        self.invoices_marked_overdue += outcome.invoices_marked_overdue;
        self.cases_opened += u32::from(outcome.case_opened.is_some());
        self.cases_escalated += u32::from(outcome.escalated_to.is_some());
        self.cases_resolved += u32::from(outcome.case_resolved);
        match outcome.lifecycle {
            Some(LifecycleAction::Suspend) => self.suspended += 1,
            Some(LifecycleAction::Terminate) => self.terminated += 1,
            Some(LifecycleAction::Restore) => self.restored += 1,
            None => {}
        }
    }
}

/// A delivery attempt to record under the account lock
#[derive(Debug, Clone)]
struct DeliveryResult {
    case_id: DunningCaseId,
    action_id: DunningActionId,
    status: DeliveryStatus,
}

impl BillingService {
    /// Reconciles every account, then delivers pending notices
    ///
    /// Accounts are independent: a failure is logged and counted and the
    /// pass moves on.
    pub async fn run_dunning_pass(&self) -> Result<DunningReport, BillingError> {
        let mut report = DunningReport::default();
        for account_id in self.store.list_account_ids().await? {
            report.accounts += 1;
            match self.reconcile_account(account_id).await {
                Ok(outcome) => report.record(&outcome),
                Err(err) => {
                    warn!(account_id = %account_id, error = %err, "Account reconciliation failed");
                    report.failed += 1;
                    continue;
                }
            }
            match self.deliver_notices(account_id).await {
                Ok(sent) => report.notices_sent += sent,
                Err(err) => {
                    warn!(account_id = %account_id, error = %err, "Notice delivery failed");
                    report.failed += 1;
                }
            }
        }
        info!(
            accounts = report.accounts,
            opened = report.cases_opened,
            escalated = report.cases_escalated,
            resolved = report.cases_resolved,
            suspended = report.suspended,
            failed = report.failed,
            "Dunning pass finished"
        );
        Ok(report)
    }

    /// Brings one account's overdue state, dunning case and lifecycle
    /// status up to date
    ///
    /// Running it twice at the same instant changes nothing the second
    /// time.
    pub async fn reconcile_account(
        &self,
        account_id: BillingAccountId,
    ) -> Result<ReconcileOutcome, BillingError> {
        self.with_account_lock(account_id, || self.reconcile_once(account_id))
            .await
    }

    async fn reconcile_once(
        &self,
        account_id: BillingAccountId,
    ) -> Result<ReconcileOutcome, BillingError> {
        let now = self.now();
        let today = self.today();
        let mut unit = self.begin(account_id).await?;
        let mut outcome = ReconcileOutcome::default();
        if matches!(unit.account().status(), AccountStatus::Pending | AccountStatus::Closed) {
            return Ok(outcome);
        }

        let mut invoices = self.store.invoices_for_account(account_id).await?;
        for invoice in &mut invoices {
            if invoice.mark_overdue(today) {
                outcome.invoices_marked_overdue += 1;
                unit.stage_invoice(invoice.clone())?;
            }
        }
        let plans = self.store.payment_plans_for_account(account_id).await?;
        let overdue = overdue_summary(&invoices, &plans, today, unit.account().currency())?;

        let schedule = self.config.dunning_schedule();
        let open_case = self
            .store
            .dunning_cases_for_account(account_id)
            .await?
            .into_iter()
            .find(DunningCase::is_open);

        let mut case_dirty = false;
        let mut case = match open_case {
            Some(mut case) if !overdue.amount.is_positive() && case.is_active() => {
                case.resolve(now)?;
                outcome.case_resolved = true;
                case_dirty = true;
                Some(case)
            }
            Some(mut case) => {
                if case.total_overdue_amount != overdue.amount || case.days_overdue != overdue.days {
                    case.update_overdue(overdue.amount, overdue.days, now);
                    case_dirty = true;
                }
                if case.is_active() {
                    outcome.escalated_to = case.escalate(&schedule, now)?;
                }
                Some(case)
            }
            None if overdue.amount.is_positive() => {
                let case =
                    DunningCase::open(account_id, overdue.amount, overdue.days, &schedule, now)?;
                outcome.case_opened = Some(case.id);
                Some(case)
            }
            None => None,
        };

        let open_case = case.as_mut().filter(|c| c.is_open());
        outcome.lifecycle = self.enforce_lifecycle(&mut unit, open_case, now)?;

        let dirty = case_dirty || outcome.changed();
        if let Some(case) = case {
            if dirty {
                unit.stage_dunning_case(case)?;
            }
        }
        if dirty {
            self.commit(unit).await?;
        }
        Ok(outcome)
    }

    /// Applies the lifecycle policy to the working account
    fn enforce_lifecycle(
        &self,
        unit: &mut UnitOfWork,
        case: Option<&mut DunningCase>,
        now: DateTime<Utc>,
    ) -> Result<Option<LifecycleAction>, BillingError> {
        let policy = &self.config.lifecycle;
        let Some(action) = policy.evaluate(unit.account()) else {
            return Ok(None);
        };
        let account_id = unit.account_id();

        match action {
            LifecycleAction::Suspend => {
                unit.account_mut().suspend(SuspensionReason::Balance)?;
                if let Some(case) = case {
                    case.record_notice(DunningActionKind::SuspensionNotice, now);
                }
                info!(account_id = %account_id, "Account suspended for balance");
                Ok(Some(action))
            }
            LifecycleAction::Terminate if policy.auto_terminate => {
                unit.account_mut().close()?;
                if let Some(case) = case {
                    case.record_notice(DunningActionKind::TerminationNotice, now);
                }
                warn!(account_id = %account_id, "Account terminated for balance");
                Ok(Some(action))
            }
            LifecycleAction::Terminate => {
                let mut changed = false;
                if unit.account().status() == AccountStatus::Active && policy.auto_suspend {
                    unit.account_mut().suspend(SuspensionReason::Balance)?;
                    changed = true;
                }
                if let Some(case) = case {
                    if !case.has_notice(DunningActionKind::TerminationNotice) {
                        case.record_notice(DunningActionKind::TerminationNotice, now);
                        changed = true;
                    }
                }
                if changed {
                    warn!(
                        account_id = %account_id,
                        balance = %unit.account().current_balance(),
                        "Account below termination threshold, flagged for manual termination"
                    );
                    return Ok(Some(action));
                }
                Ok(None)
            }
            LifecycleAction::Restore => {
                unit.account_mut().reactivate()?;
                info!(account_id = %account_id, "Account restored after payment");
                Ok(Some(action))
            }
        }
    }

    /// Resolves active cases and restores service once nothing is overdue;
    /// runs inside payment and credit units of work. Paused cases stay
    /// paused and resolve on the first dunning pass after they resume.
    pub(super) async fn after_settlement(&self, unit: &mut UnitOfWork) -> Result<(), BillingError> {
        let now = self.now();
        let invoices = self.current_invoices(unit).await?;
        let plans = self.current_plans(unit).await?;
        let overdue = overdue_summary(&invoices, &plans, self.today(), unit.account().currency())?;
        if overdue.amount.is_positive() {
            return Ok(());
        }

        for mut case in self.current_cases(unit).await? {
            if case.is_active() {
                case.resolve(now)?;
                unit.stage_dunning_case(case)?;
            }
        }
        if self.config.lifecycle.evaluate(unit.account()) == Some(LifecycleAction::Restore) {
            unit.account_mut().reactivate()?;
            info!(account_id = %unit.account_id(), "Account restored after payment");
        }
        Ok(())
    }

    /// Opens a case by hand for an account with an overdue balance
    pub async fn open_dunning_case(
        &self,
        account_id: BillingAccountId,
    ) -> Result<DunningCase, BillingError> {
        self.with_account_lock(account_id, || async move {
            let mut unit = self.begin(account_id).await?;
            if self.current_cases(&unit).await?.iter().any(DunningCase::is_open) {
                return Err(BillingError::validation(format!(
                    "account {} already has an open dunning case",
                    account_id
                )));
            }
            let invoices = self.current_invoices(&unit).await?;
            let plans = self.current_plans(&unit).await?;
            let overdue =
                overdue_summary(&invoices, &plans, self.today(), unit.account().currency())?;
            let case = DunningCase::open(
                account_id,
                overdue.amount,
                overdue.days,
                &self.config.dunning_schedule(),
                self.now(),
            )?;
            unit.stage_dunning_case(case.clone())?;
            self.commit(unit).await?;
            Ok(case)
        })
        .await
    }

    /// Escalates a case immediately; requires `meta.initiated_by`
    pub async fn escalate_dunning_case(
        &self,
        case_id: DunningCaseId,
        meta: &OperationMetadata,
    ) -> Result<DunningCase, BillingError> {
        let actor = meta
            .initiated_by
            .as_deref()
            .ok_or_else(|| BillingError::validation("manual escalation requires an actor id"))?;
        let schedule = self.config.dunning_schedule();
        self.update_case(case_id, |case, now| {
            case.force_escalate(actor, &schedule, now).map(|_| ())
        })
        .await
    }

    pub async fn pause_dunning_case(
        &self,
        case_id: DunningCaseId,
        reason: Option<String>,
    ) -> Result<DunningCase, BillingError> {
        self.update_case(case_id, |case, _| case.pause(reason.clone()))
            .await
    }

    pub async fn resume_dunning_case(
        &self,
        case_id: DunningCaseId,
    ) -> Result<DunningCase, BillingError> {
        let schedule = self.config.dunning_schedule();
        self.update_case(case_id, |case, now| case.resume(&schedule, now))
            .await
    }

    pub async fn cancel_dunning_case(
        &self,
        case_id: DunningCaseId,
        reason: &str,
    ) -> Result<DunningCase, BillingError> {
        self.update_case(case_id, |case, _| case.cancel(reason)).await
    }

    /// Closes a case as settled; fails while anything is still overdue
    pub async fn resolve_dunning_case(
        &self,
        case_id: DunningCaseId,
    ) -> Result<DunningCase, BillingError> {
        let account_id = self.load_case(case_id).await?.account_id;
        self.with_account_lock(account_id, || async move {
            let mut unit = self.begin(account_id).await?;
            let invoices = self.current_invoices(&unit).await?;
            let plans = self.current_plans(&unit).await?;
            let overdue =
                overdue_summary(&invoices, &plans, self.today(), unit.account().currency())?;
            if overdue.amount.is_positive() {
                return Err(BillingError::validation(format!(
                    "account {} still has {} overdue",
                    account_id, overdue.amount
                )));
            }
            let mut case = self.case_for_update(&unit, case_id).await?;
            case.resolve(self.now())?;
            unit.stage_dunning_case(case.clone())?;
            self.commit(unit).await?;
            Ok(case)
        })
        .await
    }

    async fn update_case<F>(&self, case_id: DunningCaseId, change: F) -> Result<DunningCase, BillingError>
    where
        F: Fn(&mut DunningCase, DateTime<Utc>) -> Result<(), BillingError>,
    {
        let account_id = self.load_case(case_id).await?.account_id;
        let change = &change;
        self.with_account_lock(account_id, || async move {
            let mut unit = self.begin(account_id).await?;
            let mut case = self.case_for_update(&unit, case_id).await?;
            change(&mut case, self.now())?;
            unit.stage_dunning_case(case.clone())?;
            self.commit(unit).await?;
            Ok(case)
        })
        .await
    }

    /// Sends every undelivered notice on the account's open cases
    ///
    /// Returns how many were accepted by the dispatcher.
    pub async fn deliver_notices(&self, account_id: BillingAccountId) -> Result<u32, BillingError> {
        let max_attempts = self.config.dunning.max_delivery_attempts;
        let account = self.load_account(account_id).await?;
        let cases = self.store.dunning_cases_for_account(account_id).await?;

        let mut results = Vec::new();
        for case in cases.iter().filter(|c| c.is_open()) {
            for action in case.actions.iter().filter(|a| a.needs_delivery(max_attempts)) {
                let mut context = NotificationContext::new();
                context.insert("account_number".to_string(), account.account_number().to_string());
                context.insert("overdue_amount".to_string(), case.total_overdue_amount.to_string());
                context.insert("days_overdue".to_string(), case.days_overdue.to_string());
                context.insert("stage".to_string(), action.stage.to_string());
                context.insert("balance".to_string(), account.current_balance().to_string());

                let status = match self.notifier.send(account_id, &action.template, &context).await {
                    Ok(status) => status,
                    Err(err) => DeliveryStatus::Failed {
                        reason: err.to_string(),
                    },
                };
                results.push(DeliveryResult {
                    case_id: case.id,
                    action_id: action.id,
                    status,
                });
            }
        }
        if results.is_empty() {
            return Ok(0);
        }

        let sent = results
            .iter()
            .filter(|r| matches!(r.status, DeliveryStatus::Delivered | DeliveryStatus::Queued))
            .count() as u32;
        let results = &results;
        self.with_account_lock(account_id, || async move {
            self.record_deliveries(account_id, results).await
        })
        .await?;
        Ok(sent)
    }

    async fn record_deliveries(
        &self,
        account_id: BillingAccountId,
        results: &[DeliveryResult],
    ) -> Result<(), BillingError> {
        let now = self.now();
        let mut unit = self.begin(account_id).await?;
        let mut cases: BTreeMap<DunningCaseId, DunningCase> = BTreeMap::new();
        for result in results {
            if !cases.contains_key(&result.case_id) {
                let case = self.case_for_update(&unit, result.case_id).await?;
                cases.insert(result.case_id, case);
            }
            let Some(case) = cases.get_mut(&result.case_id) else {
                continue;
            };
            match case.action_mut(result.action_id) {
                Some(action) => action.record_delivery(result.status.clone(), now),
                None => warn!(action_id = %result.action_id, "Dunning action disappeared"),
            }
        }
        for case in cases.into_values() {
            unit.stage_dunning_case(case)?;
        }
        self.commit(unit).await
    }
}
