//! Property-Based Test Generators
//!
//! Proptest strategies that produce billing data respecting domain
//! invariants: positive amounts, valid percentages and well-formed periods.

use chrono::{Duration, NaiveDate};
use proptest::prelude::*;
use rust_decimal::Decimal;

use core_kernel::{Currency, DateRange, Money};
use domain_billing::{
    BillingCategory, Direction, InvoiceItem, InvoiceItemType, LedgerPosting, PaymentMethod,
};

/// Strategy for generating valid Currency values
pub fn currency_strategy() -> impl Strategy<Value = Currency> {
    prop_oneof![
        Just(Currency::USD),
        Just(Currency::EUR),
        Just(Currency::GBP),
        Just(Currency::NGN),
        Just(Currency::KES),
        Just(Currency::INR),
    ]
}

/// Strategy for generating valid positive amounts in minor units
pub fn positive_amount_minor_strategy() -> impl Strategy<Value = i64> {
    1i64..100_000_000i64
}

/// Strategy for generating valid Money values with positive amounts
pub fn positive_money_strategy() -> impl Strategy<Value = Money> {
    (positive_amount_minor_strategy(), currency_strategy())
        .prop_map(|(amount, currency)| Money::from_minor(amount, currency))
}

/// Strategy for generating positive USD Money values
pub fn usd_money_strategy() -> impl Strategy<Value = Money> {
    positive_amount_minor_strategy().prop_map(|amount| Money::from_minor(amount, Currency::USD))
}

/// Percentages from 0.00 to 100.00
pub fn percentage_strategy() -> impl Strategy<Value = Decimal> {
    (0u32..=10000u32).prop_map(|n| Decimal::new(n as i64, 2))
}

/// Whole or fractional quantities up to 10,000 units
pub fn quantity_strategy() -> impl Strategy<Value = Decimal> {
    (1i64..10_000_000i64).prop_map(|n| Decimal::new(n, 3))
}

pub fn item_type_strategy() -> impl Strategy<Value = InvoiceItemType> {
    prop_oneof![
        Just(InvoiceItemType::Subscription),
        Just(InvoiceItemType::Usage),
        Just(InvoiceItemType::Equipment),
        Just(InvoiceItemType::Installation),
        Just(InvoiceItemType::Other),
    ]
}

pub fn payment_method_strategy() -> impl Strategy<Value = PaymentMethod> {
    prop_oneof![
        Just(PaymentMethod::Card),
        Just(PaymentMethod::DirectDebit),
        Just(PaymentMethod::MobileMoney),
        Just(PaymentMethod::BankTransfer),
        Just(PaymentMethod::Cash),
        Just(PaymentMethod::Cheque),
    ]
}

/// USD line items with random quantity, price, tax and discount
pub fn line_item_strategy() -> impl Strategy<Value = InvoiceItem> {
    (
        item_type_strategy(),
        quantity_strategy(),
        usd_money_strategy(),
        percentage_strategy(),
        percentage_strategy(),
    )
        .prop_filter_map(
            "line item rejected",
            |(item_type, quantity, price, tax, discount)| {
                InvoiceItem::new("generated line", item_type, quantity, price)
                    .and_then(|item| item.with_tax(tax))
                    .and_then(|item| item.with_discount(discount))
                    .ok()
            },
        )
}

/// Dates between 2024 and the end of 2027
pub fn date_strategy() -> impl Strategy<Value = NaiveDate> {
    (0i64..1460i64).prop_map(|offset| {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap_or_default() + Duration::days(offset)
    })
}

/// Calendar month periods
pub fn billing_period_strategy() -> impl Strategy<Value = DateRange> {
    date_strategy().prop_filter_map("month period", |date| DateRange::month_of(date).ok())
}

/// A billing period together with a service window that overlaps it
pub fn service_window_strategy() -> impl Strategy<Value = (DateRange, DateRange)> {
    (billing_period_strategy(), 0i64..28i64, 0i64..60i64).prop_filter_map(
        "service window",
        |(period, offset, length)| {
            let start = period.start + Duration::days(offset);
            DateRange::new(start, start + Duration::days(length))
                .ok()
                .map(|service| (service, period))
        },
    )
}

/// USD postings of either sign
pub fn usd_posting_strategy() -> impl Strategy<Value = LedgerPosting> {
    (usd_money_strategy(), any::<bool>()).prop_map(|(amount, increase)| {
        if increase {
            LedgerPosting::credit(amount, BillingCategory::Payment)
        } else {
            LedgerPosting::charge(amount, BillingCategory::Usage)
        }
    })
}

/// Signed direction of a manual adjustment
pub fn direction_strategy() -> impl Strategy<Value = Direction> {
    prop_oneof![Just(Direction::Increase), Just(Direction::Decrease)]
}
