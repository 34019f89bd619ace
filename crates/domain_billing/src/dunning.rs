//! Dunning cases
//!
//! A dunning case tracks collection activity for one account with an
//! overdue balance.
//!
//! ```text
//! Active ──pause──▶ Paused ──resume──▶ Active
//!   │                 │
//!   ├──resolve──▶ Completed
//!   └──cancel───▶ Cancelled ◀──cancel── Paused
//! ```
//!
//! `current_stage` only increases. Escalation is guarded by
//! `next_action_date`, so re-running a pass cannot escalate twice.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::info;

use core_kernel::{BillingAccountId, DunningActionId, DunningCaseId, Money};

use crate::error::BillingError;
use crate::ports::DeliveryStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DunningStatus {
    Active,
    Paused,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// Level for an overdue amount and age
pub fn calculate_escalation_level(amount: Decimal, days_overdue: i64) -> EscalationLevel {
    if amount >= dec!(1000) || days_overdue >= 60 {
        EscalationLevel::Critical
    } else if amount >= dec!(500) || days_overdue >= 30 {
        EscalationLevel::High
    } else if amount >= dec!(100) || days_overdue >= 14 {
        EscalationLevel::Medium
    } else {
        EscalationLevel::Low
    }
}

/// Delay before the next contact, by escalation level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DunningSchedule {
    pub contact_frequency_days: u32,
    pub critical_delay_days: u32,
    pub high_delay_days: u32,
}

impl Default for DunningSchedule {
    fn default() -> Self {
        Self {
            contact_frequency_days: 7,
            critical_delay_days: 1,
            high_delay_days: 3,
        }
    }
}

impl DunningSchedule {
    pub fn delay_for(&self, level: EscalationLevel) -> Duration {
        let days = match level {
            EscalationLevel::Critical => self.critical_delay_days,
            EscalationLevel::High => self.high_delay_days,
            EscalationLevel::Medium | EscalationLevel::Low => self.contact_frequency_days,
        };
        Duration::days(i64::from(days))
    }
}

/// Kind of communication a dunning action sends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DunningActionKind {
    Reminder,
    Warning,
    FinalNotice,
    SuspensionNotice,
    TerminationNotice,
}

impl DunningActionKind {
    /// Communication sent when a case reaches `stage`
    pub fn for_stage(stage: u32) -> Self {
        match stage {
            0 | 1 => DunningActionKind::Reminder,
            2 => DunningActionKind::Warning,
            _ => DunningActionKind::FinalNotice,
        }
    }

    pub fn template(&self) -> &'static str {
        match self {
            DunningActionKind::Reminder => "dunning_reminder",
            DunningActionKind::Warning => "dunning_warning",
            DunningActionKind::FinalNotice => "dunning_final_notice",
            DunningActionKind::SuspensionNotice => "service_suspension_notice",
            DunningActionKind::TerminationNotice => "service_termination_notice",
        }
    }
}

/// One contact attempt within a case
///
/// Delivery status is tracked here, separately from the case stage, so
/// delivery retries never move the case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DunningAction {
    pub id: DunningActionId,
    pub stage: u32,
    pub kind: DunningActionKind,
    pub template: String,
    pub delivery_status: DeliveryStatus,
    pub attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub performed_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl DunningAction {
    pub fn new(stage: u32, kind: DunningActionKind, now: DateTime<Utc>) -> Self {
        Self {
            id: DunningActionId::new_v7(),
            stage,
            kind,
            template: kind.template().to_string(),
            delivery_status: DeliveryStatus::Pending,
            attempts: 0,
            last_attempt_at: None,
            delivered_at: None,
            performed_by: None,
            created_at: now,
        }
    }

    /// Never attempted, or failed with attempts remaining
    pub fn needs_delivery(&self, max_attempts: u32) -> bool {
        matches!(
            self.delivery_status,
            DeliveryStatus::Pending | DeliveryStatus::Failed { .. }
        ) && self.attempts < max_attempts
    }

    pub fn record_delivery(&mut self, status: DeliveryStatus, now: DateTime<Utc>) {
        self.attempts += 1;
        self.last_attempt_at = Some(now);
        if status == DeliveryStatus::Delivered {
            self.delivered_at = Some(now);
        }
        self.delivery_status = status;
    }
}

/// Collection case for an account's overdue balance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DunningCase {
    pub id: DunningCaseId,
    pub account_id: BillingAccountId,
    pub total_overdue_amount: Money,
    pub days_overdue: i64,
    pub status: DunningStatus,
    pub current_stage: u32,
    pub escalation_level: EscalationLevel,
    pub next_action_date: Option<DateTime<Utc>>,
    pub actions: Vec<DunningAction>,
    pub opened_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
}

impl DunningCase {
    /// Opens a case at stage 1 and records its first action
    pub fn open(
        account_id: BillingAccountId,
        overdue: Money,
        days_overdue: i64,
        schedule: &DunningSchedule,
        now: DateTime<Utc>,
    ) -> Result<Self, BillingError> {
        if !overdue.is_positive() {
            return Err(BillingError::validation(
                "a dunning case needs a positive overdue balance",
            ));
        }
        let level = calculate_escalation_level(overdue.amount(), days_overdue);
        let case = Self {
            id: DunningCaseId::new_v7(),
            account_id,
            total_overdue_amount: overdue,
            days_overdue,
            status: DunningStatus::Active,
            current_stage: 1,
            escalation_level: level,
            next_action_date: Some(now + schedule.delay_for(level)),
            actions: vec![DunningAction::new(1, DunningActionKind::Reminder, now)],
            opened_at: now,
            updated_at: now,
            closed_at: None,
            notes: None,
        };
        info!(
            case_id = %case.id,
            account_id = %account_id,
            overdue = %overdue,
            days_overdue,
            level = ?level,
            "Dunning case opened"
        );
        Ok(case)
    }

    pub fn is_active(&self) -> bool {
        self.status == DunningStatus::Active
    }

    /// Not yet completed or cancelled
    pub fn is_open(&self) -> bool {
        matches!(self.status, DunningStatus::Active | DunningStatus::Paused)
    }

    pub fn should_escalate(&self, now: DateTime<Utc>) -> bool {
        self.is_active() && self.next_action_date.map_or(true, |at| now >= at)
    }

    /// Refreshes the overdue figures from invoice state
    pub fn update_overdue(&mut self, overdue: Money, days_overdue: i64, now: DateTime<Utc>) {
        self.total_overdue_amount = overdue;
        self.days_overdue = days_overdue;
        self.updated_at = now;
    }

    fn advance(&mut self, schedule: &DunningSchedule, now: DateTime<Utc>) -> &mut DunningAction {
        self.current_stage += 1;
        self.escalation_level =
            calculate_escalation_level(self.total_overdue_amount.amount(), self.days_overdue);
        self.next_action_date = Some(now + schedule.delay_for(self.escalation_level));
        self.updated_at = now;
        self.actions.push(DunningAction::new(
            self.current_stage,
            DunningActionKind::for_stage(self.current_stage),
            now,
        ));
        info!(
            case_id = %self.id,
            stage = self.current_stage,
            level = ?self.escalation_level,
            next_action = ?self.next_action_date,
            "Dunning case escalated"
        );
        let last = self.actions.len() - 1;
        &mut self.actions[last]
    }

    /// Escalates when due; returns the new stage, or `None` if not yet due
    pub fn escalate(
        &mut self,
        schedule: &DunningSchedule,
        now: DateTime<Utc>,
    ) -> Result<Option<u32>, BillingError> {
        if !self.is_active() {
            return Err(BillingError::transition("dunning case", self.status, "Escalated"));
        }
        if !self.should_escalate(now) {
            return Ok(None);
        }
        self.advance(schedule, now);
        Ok(Some(self.current_stage))
    }

    /// Escalates immediately on behalf of an administrator
    pub fn force_escalate(
        &mut self,
        actor: &str,
        schedule: &DunningSchedule,
        now: DateTime<Utc>,
    ) -> Result<u32, BillingError> {
        if actor.trim().is_empty() {
            return Err(BillingError::validation("manual escalation requires an actor id"));
        }
        if !self.is_active() {
            return Err(BillingError::transition("dunning case", self.status, "Escalated"));
        }
        let action = self.advance(schedule, now);
        action.performed_by = Some(actor.to_string());
        Ok(self.current_stage)
    }

    /// Records a non-stage communication such as a suspension notice
    pub fn record_notice(&mut self, kind: DunningActionKind, now: DateTime<Utc>) {
        self.actions.push(DunningAction::new(self.current_stage, kind, now));
        self.updated_at = now;
    }

    pub fn has_notice(&self, kind: DunningActionKind) -> bool {
        self.actions.iter().any(|a| a.kind == kind)
    }

    /// Active -> Paused
    pub fn pause(&mut self, reason: Option<String>) -> Result<(), BillingError> {
        if self.status != DunningStatus::Active {
            return Err(BillingError::transition("dunning case", self.status, DunningStatus::Paused));
        }
        self.status = DunningStatus::Paused;
        if reason.is_some() {
            self.notes = reason;
        }
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Paused -> Active; the next contact is due no earlier than `now`
    pub fn resume(&mut self, schedule: &DunningSchedule, now: DateTime<Utc>) -> Result<(), BillingError> {
        if self.status != DunningStatus::Paused {
            return Err(BillingError::transition("dunning case", self.status, DunningStatus::Active));
        }
        self.status = DunningStatus::Active;
        if self.next_action_date.map_or(true, |at| at < now) {
            self.next_action_date = Some(now + schedule.delay_for(self.escalation_level));
        }
        self.updated_at = now;
        Ok(())
    }

    /// Active -> Completed once the overdue balance is cleared
    ///
    /// A paused case must be resumed first.
    pub fn resolve(&mut self, now: DateTime<Utc>) -> Result<(), BillingError> {
        if self.status != DunningStatus::Active {
            return Err(BillingError::transition("dunning case", self.status, DunningStatus::Completed));
        }
        self.status = DunningStatus::Completed;
        self.total_overdue_amount = Money::zero(self.total_overdue_amount.currency());
        self.next_action_date = None;
        self.closed_at = Some(now);
        self.updated_at = now;
        info!(case_id = %self.id, account_id = %self.account_id, "Dunning case resolved");
        Ok(())
    }

    /// Any open state -> Cancelled
    pub fn cancel(&mut self, reason: &str) -> Result<(), BillingError> {
        if !self.is_open() {
            return Err(BillingError::transition("dunning case", self.status, DunningStatus::Cancelled));
        }
        let now = Utc::now();
        self.status = DunningStatus::Cancelled;
        self.next_action_date = None;
        self.notes = Some(reason.to_string());
        self.closed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Actions that still need a delivery attempt
    pub fn pending_deliveries(&self, max_attempts: u32) -> Vec<DunningActionId> {
        self.actions
            .iter()
            .filter(|a| a.needs_delivery(max_attempts))
            .map(|a| a.id)
            .collect()
    }

    pub fn action_mut(&mut self, id: DunningActionId) -> Option<&mut DunningAction> {
        self.actions.iter_mut().find(|a| a.id == id)
    }
}
