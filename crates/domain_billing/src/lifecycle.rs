//! Automatic account lifecycle rules
//!
//! A small typed policy decides whether an account's balance warrants
//! suspension, termination or restoration. The reconciliation pass
//! evaluates it; it never changes the account itself.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::account::{AccountStatus, BillingAccount, SuspensionReason};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecyclePolicy {
    /// Suspend active accounts at or below the suspension threshold
    pub auto_suspend: bool,
    /// Close accounts at or below the termination threshold
    pub auto_terminate: bool,
    /// Reactivate accounts suspended for balance once they recover
    pub auto_restore: bool,
    /// How far above the suspension threshold the balance must climb
    /// before an automatic restore
    pub restore_margin: Decimal,
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self {
            auto_suspend: true,
            auto_terminate: false,
            auto_restore: true,
            restore_margin: Decimal::ZERO,
        }
    }
}

/// Action recommended by [`LifecyclePolicy::evaluate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleAction {
    Suspend,
    /// Close the account, or flag it for manual termination when
    /// `auto_terminate` is off
    Terminate,
    Restore,
}

impl LifecyclePolicy {
    pub fn evaluate(&self, account: &BillingAccount) -> Option<LifecycleAction> {
        match account.status() {
            AccountStatus::Active => {
                if account.below_termination_threshold() {
                    Some(LifecycleAction::Terminate)
                } else if self.auto_suspend && account.below_suspension_threshold() {
                    Some(LifecycleAction::Suspend)
                } else {
                    None
                }
            }
            AccountStatus::Suspended => {
                if account.below_termination_threshold() {
                    return Some(LifecycleAction::Terminate);
                }
                let restore_above = account.suspension_threshold().amount() + self.restore_margin;
                let recovered = account.current_balance().amount() > restore_above;
                let balance_suspension =
                    account.suspension_reason() == Some(SuspensionReason::Balance);
                (self.auto_restore && balance_suspension && recovered)
                    .then_some(LifecycleAction::Restore)
            }
            AccountStatus::Pending | AccountStatus::Closed => None,
        }
    }
}
