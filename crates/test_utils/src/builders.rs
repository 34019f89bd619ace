//! Test Data Builders
//!
//! Builder patterns for constructing billing test data with sensible
//! defaults. Tests set only the fields they care about.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use core_kernel::{
    BillingAccountId, Currency, CustomerId, DateRange, InvoiceId, Money, PaymentPlanId,
};
use domain_billing::{
    AccountDefaults, BillingAccount, BillingError, BillingType, InvoiceItem, InvoiceItemType,
    PaymentMethod, PaymentRequest,
};

use crate::fixtures::{IdFixtures, MoneyFixtures};

/// Builder for an active billing account with configured limits
pub struct TestAccountBuilder {
    customer_id: CustomerId,
    account_number: String,
    billing_type: BillingType,
    currency: Currency,
    defaults: AccountDefaults,
    activate: bool,
}

impl Default for TestAccountBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TestAccountBuilder {
    pub fn new() -> Self {
        Self {
            customer_id: IdFixtures::customer_id(),
            account_number: IdFixtures::account_number(),
            billing_type: BillingType::Postpaid,
            currency: Currency::USD,
            defaults: AccountDefaults::default(),
            activate: true,
        }
    }

    pub fn with_customer(mut self, customer_id: CustomerId) -> Self {
        self.customer_id = customer_id;
        self
    }

    pub fn with_account_number(mut self, number: impl Into<String>) -> Self {
        self.account_number = number.into();
        self
    }

    pub fn prepaid(mut self) -> Self {
        self.billing_type = BillingType::Prepaid;
        self
    }

    pub fn with_billing_type(mut self, billing_type: BillingType) -> Self {
        self.billing_type = billing_type;
        self
    }

    pub fn with_currency(mut self, currency: Currency) -> Self {
        self.currency = currency;
        self
    }

    pub fn with_credit_limit(mut self, limit: Decimal) -> Self {
        self.defaults.credit_limit = limit;
        self
    }

    pub fn with_thresholds(mut self, suspension: Decimal, termination: Decimal) -> Self {
        self.defaults.suspension_threshold = suspension;
        self.defaults.termination_threshold = termination;
        self
    }

    /// Leaves the account in `Pending`
    pub fn pending(mut self) -> Self {
        self.activate = false;
        self
    }

    pub fn build(self) -> Result<BillingAccount, BillingError> {
        let mut account = BillingAccount::new(
            self.customer_id,
            self.account_number,
            self.billing_type,
            self.currency,
        )
        .with_defaults(&self.defaults)?;
        if self.activate {
            account.activate()?;
        }
        Ok(account)
    }
}

/// Builder for invoice line items
pub struct TestLineItemBuilder {
    description: String,
    item_type: InvoiceItemType,
    quantity: Decimal,
    unit_price: Money,
    tax_percentage: Decimal,
    discount_percentage: Decimal,
    service_period: Option<(DateRange, DateRange)>,
}

impl Default for TestLineItemBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TestLineItemBuilder {
    /// One month of the standard subscription, untaxed
    pub fn new() -> Self {
        Self {
            description: "Fibre 100 monthly".to_string(),
            item_type: InvoiceItemType::Subscription,
            quantity: dec!(1),
            unit_price: MoneyFixtures::usd_subscription(),
            tax_percentage: Decimal::ZERO,
            discount_percentage: Decimal::ZERO,
            service_period: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_type(mut self, item_type: InvoiceItemType) -> Self {
        self.item_type = item_type;
        self
    }

    pub fn with_quantity(mut self, quantity: Decimal) -> Self {
        self.quantity = quantity;
        self
    }

    pub fn with_unit_price(mut self, unit_price: Money) -> Self {
        self.unit_price = unit_price;
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

    /// Prorates the line to the part of `period` that `service` covers
    pub fn for_service_period(mut self, service: DateRange, period: DateRange) -> Self {
        self.service_period = Some((service, period));
        self
    }

    pub fn build(self) -> Result<InvoiceItem, BillingError> {
        let mut item = InvoiceItem::new(
            self.description,
            self.item_type,
            self.quantity,
            self.unit_price,
        )?
        .with_tax(self.tax_percentage)?
        .with_discount(self.discount_percentage)?;
        if let Some((service, period)) = self.service_period {
            item = item.for_service_period(service, &period)?;
        }
        Ok(item)
    }
}

/// Builder for payment requests
pub struct TestPaymentRequestBuilder {
    account_id: BillingAccountId,
    amount: Money,
    method: PaymentMethod,
    invoice_id: Option<InvoiceId>,
    plan_id: Option<PaymentPlanId>,
    fee: Option<Money>,
    token: Option<String>,
}

impl TestPaymentRequestBuilder {
    /// A manual bank transfer of 100 USD to the account balance
    pub fn new(account_id: BillingAccountId) -> Self {
        Self {
            account_id,
            amount: MoneyFixtures::usd_100(),
            method: PaymentMethod::BankTransfer,
            invoice_id: None,
            plan_id: None,
            fee: None,
            token: None,
        }
    }

    pub fn with_amount(mut self, amount: Money) -> Self {
        self.amount = amount;
        self
    }

    /// Card payment through the gateway with a test token
    pub fn by_card(mut self) -> Self {
        self.method = PaymentMethod::Card;
        self.token = Some("tok_test_visa".to_string());
        self
    }

    pub fn with_method(mut self, method: PaymentMethod) -> Self {
        self.method = method;
        self
    }

    pub fn for_invoice(mut self, invoice_id: InvoiceId) -> Self {
        self.invoice_id = Some(invoice_id);
        self
    }

    pub fn for_plan(mut self, plan_id: PaymentPlanId) -> Self {
        self.plan_id = Some(plan_id);
        self
    }

    pub fn with_fee(mut self, fee: Money) -> Self {
        self.fee = Some(fee);
        self
    }

    pub fn build(self) -> PaymentRequest {
        let mut request = PaymentRequest::new(self.account_id, self.amount, self.method);
        if let Some(invoice_id) = self.invoice_id {
            request = request.for_invoice(invoice_id);
        }
        if let Some(plan_id) = self.plan_id {
            request = request.for_plan(plan_id);
        }
        if let Some(fee) = self.fee {
            request = request.with_fee(fee);
        }
        if let Some(token) = self.token {
            request = request.with_token(token);
        }
        request
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::DateFixtures;
    use domain_billing::{AccountStatus, PaymentTarget};

    #[test]
    fn test_account_builder_defaults() {
        let account = TestAccountBuilder::new().build().unwrap();
        assert_eq!(account.status(), AccountStatus::Active);
        assert_eq!(account.billing_type(), BillingType::Postpaid);
        assert!(account.current_balance().is_zero());
    }

    #[test]
    fn test_account_builder_pending() {
        let account = TestAccountBuilder::new().prepaid().pending().build().unwrap();
        assert_eq!(account.status(), AccountStatus::Pending);
        assert_eq!(account.billing_type(), BillingType::Prepaid);
    }

    #[test]
    fn test_line_item_builder_applies_tax() {
        let item = TestLineItemBuilder::new()
            .with_unit_price(MoneyFixtures::usd_100())
            .with_tax(dec!(10))
            .build()
            .unwrap();
        assert_eq!(item.line_total.amount(), dec!(100.00));
        assert_eq!(item.tax_amount.amount(), dec!(10.00));
    }

    #[test]
    fn test_line_item_builder_prorates() {
        let period = DateFixtures::february();
        let half = DateRange::new(DateFixtures::date(2026, 2, 15), period.end).unwrap();
        let item = TestLineItemBuilder::new()
            .for_service_period(half, period)
            .build()
            .unwrap();
        assert!(item.is_prorated());
        assert_eq!(item.proration_factor, Some(dec!(0.5)));
    }

    #[test]
    fn test_payment_request_builder_targets_invoice() {
        let invoice_id = InvoiceId::new();
        let request = TestPaymentRequestBuilder::new(BillingAccountId::new())
            .by_card()
            .for_invoice(invoice_id)
            .build();
        assert_eq!(request.target, PaymentTarget::Invoice(invoice_id));
        assert_eq!(request.method, PaymentMethod::Card);
        assert!(request.payment_method_token.is_some());
    }
}
