//! Billing engine configuration
//!
//! Every knob the engine reasons about lives here as a typed value, so the
//! worker can load it from a file or environment and hand it to
//! [`BillingService`](crate::service::BillingService) unchanged.

use std::collections::HashMap;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use core_kernel::{Currency, Money};

use crate::dunning::DunningSchedule;
use crate::lifecycle::LifecyclePolicy;
use crate::payment::RetryPolicy;

/// Top-level configuration for the billing engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BillingConfig {
    /// Operating currency for new accounts
    pub currency: Currency,
    /// Net payment terms for generated invoices
    pub invoice_due_days: u32,
    /// How long a command waits for the per-account lock
    pub lock_timeout_ms: u64,
    /// Bounded retries when a unit of work loses an optimistic version check
    pub max_conflict_retries: u32,
    /// Upper bound on a single payment gateway call
    pub gateway_timeout_ms: u64,
    /// Retry budget for failed gateway payments
    pub payment_max_retries: u32,
    /// Backoff between payment retries
    pub retry_policy: RetryPolicy,
    /// Dunning cadence and delivery settings
    pub dunning: DunningSettings,
    /// Automatic suspension, termination and restore rules
    pub lifecycle: LifecyclePolicy,
    /// Payment plan defaults
    pub plans: PlanSettings,
    /// Default limits applied to newly opened accounts
    pub account_defaults: AccountDefaults,
    /// Price per unit for usage records, keyed by unit type
    pub usage_rates: HashMap<String, UsageRate>,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            currency: Currency::USD,
            invoice_due_days: 14,
            lock_timeout_ms: 5_000,
            max_conflict_retries: 3,
            gateway_timeout_ms: 30_000,
            payment_max_retries: 3,
            retry_policy: RetryPolicy::default(),
            dunning: DunningSettings::default(),
            lifecycle: LifecyclePolicy::default(),
            plans: PlanSettings::default(),
            account_defaults: AccountDefaults::default(),
            usage_rates: HashMap::new(),
        }
    }
}

impl BillingConfig {
    /// Adds a usage rate
    pub fn with_usage_rate(mut self, unit_type: impl Into<String>, rate: UsageRate) -> Self {
        self.usage_rates.insert(unit_type.into(), rate);
        self
    }

    /// Sets the lifecycle policy
    pub fn with_lifecycle(mut self, lifecycle: LifecyclePolicy) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    /// Sets the retry policy
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// The dunning delay table derived from these settings
    pub fn dunning_schedule(&self) -> DunningSchedule {
        DunningSchedule {
            contact_frequency_days: self.dunning.contact_frequency_days,
            critical_delay_days: self.dunning.critical_delay_days,
            high_delay_days: self.dunning.high_delay_days,
        }
    }
}

/// Dunning cadence
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DunningSettings {
    /// Delay between contacts for low and medium cases
    pub contact_frequency_days: u32,
    /// Delay between contacts for critical cases
    pub critical_delay_days: u32,
    /// Delay between contacts for high cases
    pub high_delay_days: u32,
    /// Delivery attempts per dunning action before giving up
    pub max_delivery_attempts: u32,
}

impl Default for DunningSettings {
    fn default() -> Self {
        Self {
            contact_frequency_days: 7,
            critical_delay_days: 1,
            high_delay_days: 3,
            max_delivery_attempts: 3,
        }
    }
}

/// Payment plan settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanSettings {
    /// Consecutive overdue installments after which the plan defaults
    pub default_after_consecutive_overdue: u32,
    /// Grace period used when a plan request does not specify one
    pub default_grace_period_days: u32,
}

impl Default for PlanSettings {
    fn default() -> Self {
        Self {
            default_after_consecutive_overdue: 3,
            default_grace_period_days: 5,
        }
    }
}

/// Limits given to new accounts, in units of the account currency
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountDefaults {
    pub credit_limit: Decimal,
    pub minimum_balance: Decimal,
    /// Balance at or below which an active account is suspended
    pub suspension_threshold: Decimal,
    /// Balance at or below which a suspended account is terminated
    pub termination_threshold: Decimal,
}

impl Default for AccountDefaults {
    fn default() -> Self {
        Self {
            credit_limit: dec!(0),
            minimum_balance: dec!(0),
            suspension_threshold: dec!(-100),
            termination_threshold: dec!(-500),
        }
    }
}

/// How a usage unit type is priced on an invoice
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRate {
    /// Line item description, e.g. "Data transfer (GB)"
    pub description: String,
    /// Price per unit
    pub unit_price: Decimal,
    /// Tax percentage applied to the line
    #[serde(default)]
    pub tax_percentage: Decimal,
    /// Discount percentage applied before tax
    #[serde(default)]
    pub discount_percentage: Decimal,
    /// Recurring charges are prorated by how much of the billing period the
    /// record covers; metered units are billed by quantity as reported
    #[serde(default)]
    pub recurring: bool,
}

impl UsageRate {
    pub fn new(description: impl Into<String>, unit_price: Decimal) -> Self {
        Self {
            description: description.into(),
            unit_price,
            tax_percentage: Decimal::ZERO,
            discount_percentage: Decimal::ZERO,
            recurring: false,
        }
    }

    /// Marks the rate as a recurring (prorated) charge
    pub fn recurring(mut self) -> Self {
        self.recurring = true;
        self
    }

    pub fn with_tax(mut self, tax_percentage: Decimal) -> Self {
        self.tax_percentage = tax_percentage;
        self
    }

    pub fn with_discount(mut self, discount_percentage: Decimal) -> Self {
        self.discount_percentage = discount_percentage;
        self
    }

    /// Unit price as money in the given currency
    pub fn price(&self, currency: Currency) -> Money {
        Money::new(self.unit_price, currency)
    }
}
