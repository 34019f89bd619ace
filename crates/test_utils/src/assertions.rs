//! Custom Test Assertions
//!
//! Assertion helpers for money, ledgers and invoices that give more
//! meaningful failure messages than plain `assert_eq!`.

use core_kernel::Money;
use domain_billing::{BillingAccount, Invoice, LedgerEntry};
use rust_decimal::Decimal;

/// Asserts that two Money values are approximately equal within a tolerance
///
/// # Arguments
///
/// * `actual` - The actual Money value
/// * `expected` - The expected Money value
/// * `tolerance` - The allowed difference in the amount
///
/// # Panics
///
/// Panics if the currencies don't match or the amounts differ by more than tolerance
pub fn assert_money_approx_eq(actual: &Money, expected: &Money, tolerance: Decimal) {
    assert_eq!(
        actual.currency(),
        expected.currency(),
        "Currency mismatch: actual={}, expected={}",
        actual.currency(),
        expected.currency()
    );

    let diff = (actual.amount() - expected.amount()).abs();
    assert!(
        diff <= tolerance,
        "Money amounts differ by more than tolerance: actual={}, expected={}, diff={}, tolerance={}",
        actual.amount(),
        expected.amount(),
        diff,
        tolerance
    );
}

/// Asserts that a Money value is positive
pub fn assert_money_positive(money: &Money) {
    assert!(
        money.is_positive(),
        "Expected positive money, got {} {}",
        money.currency().symbol(),
        money.amount()
    );
}

/// Asserts that a Money value is zero
pub fn assert_money_zero(money: &Money) {
    assert!(
        money.is_zero(),
        "Expected zero money, got {} {}",
        money.currency().symbol(),
        money.amount()
    );
}

/// Asserts that a Money value is negative
pub fn assert_money_negative(money: &Money) {
    assert!(
        money.is_negative(),
        "Expected negative money, got {} {}",
        money.currency().symbol(),
        money.amount()
    );
}

/// Asserts that money values sum to a total
///
/// # Arguments
///
/// * `parts` - The money values that should sum to total
/// * `total` - The expected total
///
/// # Panics
///
/// Panics if the sum doesn't equal the total
pub fn assert_money_sum_equals(parts: &[Money], total: &Money) {
    let sum = parts.iter().fold(Money::zero(total.currency()), |acc, m| {
        acc.checked_add(m).expect("Currency mismatch in sum")
    });

    assert_eq!(
        sum.amount(),
        total.amount(),
        "Sum of parts ({}) doesn't equal total ({})",
        sum.amount(),
        total.amount()
    );
}

/// Asserts that a ledger forms an unbroken chain
///
/// Sequences run 1, 2, 3, ... with no gaps, each entry's `balance_before`
/// equals the previous entry's `balance_after`, and every entry's balance
/// movement matches its signed amount.
pub fn assert_ledger_chain(entries: &[LedgerEntry]) {
    let mut previous: Option<&LedgerEntry> = None;
    for (index, entry) in entries.iter().enumerate() {
        assert_eq!(
            entry.sequence,
            index as u64 + 1,
            "Ledger sequence gap at position {}: found sequence {}",
            index,
            entry.sequence
        );
        assert!(
            entry.is_consistent(),
            "Entry {} moves the balance from {} to {} but nets {}",
            entry.sequence,
            entry.balance_before,
            entry.balance_after,
            entry.net_amount()
        );
        if let Some(prev) = previous {
            assert_eq!(
                entry.balance_before, prev.balance_after,
                "Entry {} starts at {} but entry {} ended at {}",
                entry.sequence, entry.balance_before, prev.sequence, prev.balance_after
            );
        }
        previous = Some(entry);
    }
}

/// Asserts the account balance equals the last ledger entry's closing balance
pub fn assert_balance_matches_ledger(account: &BillingAccount, entries: &[LedgerEntry]) {
    let expected = entries
        .last()
        .map(|entry| entry.balance_after)
        .unwrap_or_else(|| Money::zero(account.currency()));
    assert_eq!(
        account.current_balance(),
        expected,
        "Account balance {} disagrees with ledger closing balance {}",
        account.current_balance(),
        expected
    );
    assert_eq!(
        account.ledger_sequence(),
        entries.len() as u64,
        "Account ledger sequence {} but {} entries recorded",
        account.ledger_sequence(),
        entries.len()
    );
}

/// Asserts `available == current - reserved` and `reserved >= 0`
pub fn assert_balance_invariant(account: &BillingAccount) {
    assert!(
        account.balances_consistent(),
        "Balance invariant broken: current={}, reserved={}, available={}",
        account.current_balance(),
        account.reserved_balance(),
        account.available_balance()
    );
}

/// Asserts `total = subtotal + tax - discount + adjustment` and
/// `balance_due = total - paid`
pub fn assert_invoice_totals(invoice: &Invoice) {
    let expected_total = invoice.subtotal.amount() + invoice.tax_amount.amount()
        - invoice.discount_amount.amount()
        + invoice.adjustment_amount.amount();
    assert_eq!(
        invoice.total.amount(),
        expected_total,
        "Invoice {} total {} does not match its components ({})",
        invoice.invoice_number,
        invoice.total.amount(),
        expected_total
    );
    assert_eq!(
        invoice.balance_due.amount(),
        invoice.total.amount() - invoice.paid_amount.amount(),
        "Invoice {} balance due {} is not total {} minus paid {}",
        invoice.invoice_number,
        invoice.balance_due.amount(),
        invoice.total.amount(),
        invoice.paid_amount.amount()
    );
}

/// Asserts that a decimal value is within a range
pub fn assert_decimal_in_range(value: Decimal, min: Decimal, max: Decimal) {
    assert!(
        value >= min && value <= max,
        "Decimal {} is not in range [{}, {}]",
        value,
        min,
        max
    );
}

/// Asserts that a decimal value is approximately equal to another
pub fn assert_decimal_approx_eq(actual: Decimal, expected: Decimal, tolerance: Decimal) {
    let diff = (actual - expected).abs();
    assert!(
        diff <= tolerance,
        "Decimals differ by more than tolerance: actual={}, expected={}, diff={}, tolerance={}",
        actual,
        expected,
        diff,
        tolerance
    );
}

/// Asserts that a result is Ok and returns the value
#[macro_export]
macro_rules! assert_ok {
    ($result:expr) => {
        match $result {
            Ok(value) => value,
            Err(e) => panic!("Expected Ok, got Err: {:?}", e),
        }
    };
    ($result:expr, $msg:expr) => {
        match $result {
            Ok(value) => value,
            Err(e) => panic!("{}: {:?}", $msg, e),
        }
    };
}

/// Asserts that a result is Err and returns the error
#[macro_export]
macro_rules! assert_err {
    ($result:expr) => {
        match $result {
            Ok(value) => panic!("Expected Err, got Ok: {:?}", value),
            Err(e) => e,
        }
    };
    ($result:expr, $msg:expr) => {
        match $result {
            Ok(value) => panic!("{}: got Ok({:?})", $msg, value),
            Err(e) => e,
        }
    };
}

/// Asserts that an error matches a specific variant
#[macro_export]
macro_rules! assert_err_variant {
    ($result:expr, $pattern:pat) => {
        match $result {
            Ok(value) => panic!("Expected Err matching {}, got Ok({:?})", stringify!($pattern), value),
            Err(ref e) => {
                assert!(
                    matches!(e, $pattern),
                    "Error {:?} does not match pattern {}",
                    e,
                    stringify!($pattern)
                );
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builders::{TestAccountBuilder, TestLineItemBuilder};
    use crate::fixtures::DateFixtures;
    use core_kernel::Currency;
    use domain_billing::{BillingCategory, LedgerPosting};
    use rust_decimal_macros::dec;

    fn usd(amount: Decimal) -> Money {
        Money::new(amount, Currency::USD)
    }

    #[test]
    fn test_assert_money_approx_eq_passes() {
        assert_money_approx_eq(&usd(dec!(100.001)), &usd(dec!(100.002)), dec!(0.01));
    }

    #[test]
    #[should_panic(expected = "Currency mismatch")]
    fn test_assert_money_approx_eq_currency_mismatch() {
        let eur = Money::new(dec!(100.00), Currency::EUR);
        assert_money_approx_eq(&usd(dec!(100.00)), &eur, dec!(0.01));
    }

    #[test]
    #[should_panic(expected = "Expected positive money")]
    fn test_assert_money_positive_fails_for_zero() {
        assert_money_positive(&Money::zero(Currency::USD));
    }

    #[test]
    fn test_assert_money_sum_equals() {
        let parts = vec![usd(dec!(33.34)), usd(dec!(33.33)), usd(dec!(33.33))];
        assert_money_sum_equals(&parts, &usd(dec!(100.00)));
    }

    #[test]
    fn test_ledger_chain_from_account_postings() {
        let mut account = TestAccountBuilder::new().build().unwrap();
        let first = account
            .apply_ledger_entry(LedgerPosting::charge(
                usd(dec!(49.99)),
                BillingCategory::Subscription,
            ))
            .unwrap()
            .entry;
        let second = account
            .apply_ledger_entry(LedgerPosting::credit(usd(dec!(20)), BillingCategory::Payment))
            .unwrap()
            .entry;

        let entries = vec![first, second];
        assert_ledger_chain(&entries);
        assert_balance_matches_ledger(&account, &entries);
        assert_balance_invariant(&account);
    }

    #[test]
    #[should_panic(expected = "Ledger sequence gap")]
    fn test_ledger_chain_detects_gap() {
        let mut account = TestAccountBuilder::new().build().unwrap();
        account
            .apply_ledger_entry(LedgerPosting::charge(usd(dec!(10)), BillingCategory::Usage))
            .unwrap();
        let second = account
            .apply_ledger_entry(LedgerPosting::charge(usd(dec!(10)), BillingCategory::Usage))
            .unwrap()
            .entry;
        assert_ledger_chain(&[second]);
    }

    #[test]
    fn test_assert_invoice_totals() {
        let mut invoice = Invoice::new(
            core_kernel::BillingAccountId::new(),
            "INV-TEST-1",
            DateFixtures::february(),
            DateFixtures::cycle_day(),
            DateFixtures::date(2026, 3, 31),
            Currency::USD,
        )
        .unwrap();
        invoice
            .add_item(TestLineItemBuilder::new().with_tax(dec!(10)).build().unwrap())
            .unwrap();
        assert_invoice_totals(&invoice);
    }

    #[test]
    fn test_assert_decimal_approx_eq() {
        assert_decimal_approx_eq(dec!(100.001), dec!(100.002), dec!(0.01));
    }
}
