//! Pre-built Test Fixtures
//!
//! Ready-to-use money amounts, dates and billing periods. Scenarios are set
//! around the February 2026 billing period, invoiced on March 1st.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use once_cell::sync::Lazy;
use rust_decimal_macros::dec;

use core_kernel::{BillingAccountId, Currency, CustomerId, DateRange, Money};
use domain_billing::BillingConfig;

/// Billing configuration whose lifecycle thresholds sit far below anything a
/// test scenario charges, so suspension rules stay quiet unless opted into
pub static QUIET_BILLING_CONFIG: Lazy<BillingConfig> = Lazy::new(|| {
    let mut config = BillingConfig::default();
    config.account_defaults.suspension_threshold = dec!(-10000);
    config.account_defaults.termination_threshold = dec!(-20000);
    config
});

/// Fixture for Money test data
pub struct MoneyFixtures;

impl MoneyFixtures {
    /// A typical monthly broadband subscription
    pub fn usd_subscription() -> Money {
        Money::new(dec!(49.99), Currency::USD)
    }

    pub fn usd_100() -> Money {
        Money::new(dec!(100.00), Currency::USD)
    }

    /// One-off router installation charge
    pub fn usd_installation() -> Money {
        Money::new(dec!(150.00), Currency::USD)
    }

    pub fn usd_zero() -> Money {
        Money::zero(Currency::USD)
    }

    /// Creates a EUR amount for currency mismatch tests
    pub fn eur_100() -> Money {
        Money::new(dec!(100.00), Currency::EUR)
    }

    /// Creates a JPY amount (zero decimal places)
    pub fn jpy_10000() -> Money {
        Money::new(dec!(10000), Currency::JPY)
    }
}

/// Fixture for dates, instants and billing periods
pub struct DateFixtures;

impl DateFixtures {
    pub fn date(year: i32, month: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, month, day).expect("valid fixture date")
    }

    /// Midday UTC, far from any timezone's date boundary
    pub fn noon(year: i32, month: u32, day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, month, day, 12, 0, 0)
            .single()
            .expect("valid fixture instant")
    }

    /// The standard billing period
    pub fn february() -> DateRange {
        DateRange::month_of(Self::date(2026, 2, 1)).expect("valid period")
    }

    pub fn march() -> DateRange {
        DateRange::month_of(Self::date(2026, 3, 1)).expect("valid period")
    }

    /// First day of the month after the standard period
    pub fn cycle_day() -> NaiveDate {
        Self::date(2026, 3, 1)
    }

    /// Instant the standard invoice cycle runs at
    pub fn cycle_instant() -> DateTime<Utc> {
        Self::noon(2026, 3, 1)
    }
}

/// Fixture for identifiers
pub struct IdFixtures;

impl IdFixtures {
    pub fn account_id() -> BillingAccountId {
        BillingAccountId::new()
    }

    pub fn customer_id() -> CustomerId {
        CustomerId::new()
    }

    /// Account number unique within a test run
    pub fn account_number() -> String {
        format!("ACC-{}", &uuid::Uuid::new_v4().simple().to_string()[..10])
    }
}
