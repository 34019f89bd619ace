//! End-to-end tests for the billing service over the in-memory store

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use core_kernel::{
    BillingAccountId, Currency, CustomerId, DateRange, DomainPort, Money, OperationMetadata,
    PaymentId, PortError,
};

use domain_billing::{
    AccountStatus, BillingAccount, BillingCategory, BillingConfig, BillingError, BillingService,
    BillingStore, BillingType, Clock, CreditNoteRequest, CreditNoteStatus, DeliveryStatus,
    DunningStatus, GatewayCharge, GatewayRefund, GatewayStatus, InMemoryBillingStore, Invoice,
    InvoiceItem, InvoiceItemType, InvoiceStatus, LedgerPosting, LifecycleAction, LifecyclePolicy,
    NotificationContext, NotificationDispatcher, PaymentGateway, PaymentMethod,
    PaymentPlanRequest, PaymentRequest, PaymentStatus, PlanFrequency, PlanStatus,
    StaticLineItems, SuspensionReason, TransactionType,
};

// ============================================================================
// Test doubles
// ============================================================================

struct ManualClock(Mutex<DateTime<Utc>>);

impl ManualClock {
    fn at(now: DateTime<Utc>) -> Self {
        Self(Mutex::new(now))
    }

    fn advance(&self, by: Duration) {
        let mut now = self.0.lock().unwrap();
        *now += by;
    }

    fn set(&self, to: DateTime<Utc>) {
        *self.0.lock().unwrap() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap()
    }
}

/// Replays scripted charge outcomes, then succeeds
#[derive(Default)]
struct ScriptedGateway {
    outcomes: Mutex<VecDeque<GatewayStatus>>,
    charges: Mutex<Vec<Money>>,
    refunds: Mutex<Vec<(String, Money)>>,
    delay: Option<StdDuration>,
    refund_delay: Option<StdDuration>,
    refund_errors: Mutex<VecDeque<PortError>>,
    /// Store whose next commit fails once a refund has gone out
    fail_store_after_refund: Mutex<Option<Arc<InMemoryBillingStore>>>,
}

impl ScriptedGateway {
    fn then(&self, status: GatewayStatus) {
        self.outcomes.lock().unwrap().push_back(status);
    }

    fn charge_count(&self) -> usize {
        self.charges.lock().unwrap().len()
    }

    fn refund_count(&self) -> usize {
        self.refunds.lock().unwrap().len()
    }
}

impl DomainPort for ScriptedGateway {}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    async fn charge(&self, amount: &Money, _token: &str) -> Result<GatewayCharge, PortError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let mut charges = self.charges.lock().unwrap();
        charges.push(*amount);
        let status = self
            .outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(GatewayStatus::Succeeded);
        Ok(GatewayCharge {
            gateway_transaction_id: format!("gw_{}", charges.len()),
            status,
        })
    }

    async fn refund(
        &self,
        gateway_transaction_id: &str,
        amount: &Money,
    ) -> Result<GatewayRefund, PortError> {
        if let Some(delay) = self.refund_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.refund_errors.lock().unwrap().pop_front() {
            return Err(err);
        }
        if let Some(store) = self.fail_store_after_refund.lock().unwrap().take() {
            store.fail_next_commit();
        }
        let mut refunds = self.refunds.lock().unwrap();
        refunds.push((gateway_transaction_id.to_string(), *amount));
        Ok(GatewayRefund {
            refund_id: format!("re_{}", refunds.len()),
        })
    }
}

struct RecordingNotifier {
    status: Mutex<DeliveryStatus>,
    sent: Mutex<Vec<(BillingAccountId, String, NotificationContext)>>,
}

impl RecordingNotifier {
    fn new() -> Self {
        Self {
            status: Mutex::new(DeliveryStatus::Delivered),
            sent: Mutex::new(Vec::new()),
        }
    }

    fn respond_with(&self, status: DeliveryStatus) {
        *self.status.lock().unwrap() = status;
    }

    fn templates(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|(_, t, _)| t.clone()).collect()
    }
}

impl DomainPort for RecordingNotifier {}

#[async_trait]
impl NotificationDispatcher for RecordingNotifier {
    async fn send(
        &self,
        account_id: BillingAccountId,
        template: &str,
        context: &NotificationContext,
    ) -> Result<DeliveryStatus, PortError> {
        self.sent
            .lock()
            .unwrap()
            .push((account_id, template.to_string(), context.clone()));
        Ok(self.status.lock().unwrap().clone())
    }
}

// ============================================================================
// Fixtures
// ============================================================================

struct Harness {
    service: Arc<BillingService>,
    store: Arc<InMemoryBillingStore>,
    gateway: Arc<ScriptedGateway>,
    notifier: Arc<RecordingNotifier>,
    clock: Arc<ManualClock>,
}

fn usd(amount: Decimal) -> Money {
    Money::new(amount, Currency::USD)
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn noon(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
}

fn february() -> DateRange {
    DateRange::month_of(date(2026, 2, 1)).unwrap()
}

/// Thresholds far below anything the scenario charges, so lifecycle rules
/// stay out of the way unless a test opts in
fn quiet_config() -> BillingConfig {
    let mut config = BillingConfig::default();
    config.account_defaults.suspension_threshold = dec!(-10000);
    config.account_defaults.termination_threshold = dec!(-20000);
    config
}

fn harness_with(config: BillingConfig, gateway: ScriptedGateway) -> Harness {
    let store = Arc::new(InMemoryBillingStore::new());
    let gateway = Arc::new(gateway);
    let notifier = Arc::new(RecordingNotifier::new());
    let clock = Arc::new(ManualClock::at(noon(2026, 3, 1)));
    let service = BillingService::new(store.clone(), gateway.clone(), notifier.clone(), config)
        .with_clock(clock.clone());
    Harness {
        service: Arc::new(service),
        store,
        gateway,
        notifier,
        clock,
    }
}

fn harness(config: BillingConfig) -> Harness {
    harness_with(config, ScriptedGateway::default())
}

async fn open(h: &Harness, number: &str) -> BillingAccount {
    h.service
        .open_account(CustomerId::new(), number, BillingType::Postpaid)
        .await
        .unwrap()
}

fn line(description: &str, price: Decimal, tax: Decimal) -> InvoiceItem {
    InvoiceItem::new(description, InvoiceItemType::Subscription, dec!(1), usd(price))
        .unwrap()
        .with_tax(tax)
        .unwrap()
}

async fn invoice_for(h: &Harness, account: &BillingAccount, items: Vec<InvoiceItem>) -> Invoice {
    h.service
        .generate_invoice(account.id(), february(), &StaticLineItems(items))
        .await
        .unwrap()
}

async fn balance(h: &Harness, account: &BillingAccount) -> Money {
    h.service.account(account.id()).await.unwrap().current_balance()
}

// ============================================================================
// Account Tests
// ============================================================================

mod account_tests {
    use super::*;

    #[tokio::test]
    async fn test_open_account_applies_defaults() {
        let h = harness(BillingConfig::default());
        let account = open(&h, "ACC-1001").await;

        assert_eq!(account.status(), AccountStatus::Active);
        assert_eq!(account.current_balance(), usd(dec!(0)));
        assert_eq!(account.suspension_threshold(), usd(dec!(-100)));
        assert_eq!(account.termination_threshold(), usd(dec!(-500)));
    }

    #[tokio::test]
    async fn test_duplicate_account_number_rejected() {
        let h = harness(BillingConfig::default());
        open(&h, "ACC-1001").await;

        let result = h
            .service
            .open_account(CustomerId::new(), "ACC-1001", BillingType::Prepaid)
            .await;
        assert!(matches!(result, Err(BillingError::DuplicateAccount(_))));
    }

    #[tokio::test]
    async fn test_posting_with_same_key_is_applied_once() {
        let h = harness(quiet_config());
        let account = open(&h, "ACC-1001").await;
        let posting = LedgerPosting::charge(usd(dec!(49.99)), BillingCategory::Installation)
            .idempotency_key("install:ACC-1001");

        let first = h.service.post_ledger_entry(account.id(), posting.clone()).await.unwrap();
        let second = h.service.post_ledger_entry(account.id(), posting).await.unwrap();

        assert_eq!(first.transaction_id, second.transaction_id);
        assert_eq!(balance(&h, &account).await, usd(dec!(-49.99)));
        assert_eq!(
            h.service.ledger_history(account.id(), None, None).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_reversal_restores_balance_once() {
        let h = harness(quiet_config());
        let account = open(&h, "ACC-1001").await;
        let entry = h
            .service
            .post_ledger_entry(
                account.id(),
                LedgerPosting::charge(usd(dec!(30)), BillingCategory::Equipment),
            )
            .await
            .unwrap();

        let reversal = h
            .service
            .reverse_transaction(entry.transaction_id, "router returned")
            .await
            .unwrap();
        assert_eq!(reversal.transaction_type, TransactionType::Reversal);
        assert_eq!(balance(&h, &account).await, usd(dec!(0)));

        let again = h.service.reverse_transaction(entry.transaction_id, "twice").await;
        assert!(matches!(again, Err(BillingError::EntryAlreadyReversed(_))));
        assert_eq!(balance(&h, &account).await, usd(dec!(0)));
    }

    #[tokio::test]
    async fn test_entries_owned_by_documents_cannot_be_reversed_by_hand() {
        let h = harness(quiet_config());
        let account = open(&h, "ACC-1001").await;
        let invoice = invoice_for(&h, &account, vec![line("Fibre 100", dec!(100), dec!(0))]).await;
        let payment = h
            .service
            .record_manual_payment(
                PaymentRequest::new(account.id(), usd(dec!(40)), PaymentMethod::Cash)
                    .for_invoice(invoice.id),
                &OperationMetadata::default(),
            )
            .await
            .unwrap();

        let history = h.service.ledger_history(account.id(), None, None).await.unwrap();
        assert_eq!(history.len(), 2);
        for entry in &history {
            let result = h.service.reverse_transaction(entry.transaction_id, "manual").await;
            assert!(matches!(result, Err(BillingError::Validation(_))));
        }

        assert_eq!(balance(&h, &account).await, usd(dec!(-60)));
        let stored = h.service.invoice(invoice.id).await.unwrap();
        assert_eq!(stored.balance_due, usd(dec!(60)));
        assert_eq!(
            h.service.payment(payment.id).await.unwrap().status,
            PaymentStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_reservation_needs_available_funds() {
        let h = harness(quiet_config());
        let account = open(&h, "ACC-1001").await;

        assert!(!h.service.reserve_balance(account.id(), usd(dec!(10))).await.unwrap());

        h.service
            .post_ledger_entry(account.id(), LedgerPosting::payment(usd(dec!(50))))
            .await
            .unwrap();
        assert!(h.service.reserve_balance(account.id(), usd(dec!(30))).await.unwrap());

        let stored = h.service.account(account.id()).await.unwrap();
        assert_eq!(stored.reserved_balance(), usd(dec!(30)));
        assert_eq!(stored.available_balance(), usd(dec!(20)));
        assert!(stored.balances_consistent());

        let released = h
            .service
            .release_reserved_balance(account.id(), usd(dec!(30)))
            .await
            .unwrap();
        assert_eq!(released.available_balance(), usd(dec!(50)));
    }

    #[tokio::test]
    async fn test_closed_account_rejects_postings() {
        let h = harness(quiet_config());
        let account = open(&h, "ACC-1001").await;
        h.service.close_account(account.id()).await.unwrap();

        let result = h
            .service
            .post_ledger_entry(account.id(), LedgerPosting::payment(usd(dec!(5))))
            .await;
        assert!(matches!(result, Err(BillingError::AccountClosed(_))));
    }

    #[tokio::test]
    async fn test_failed_commit_leaves_no_trace() {
        let h = harness(quiet_config());
        let account = open(&h, "ACC-1001").await;
        h.store.fail_next_commit();

        let result = h
            .service
            .post_ledger_entry(account.id(), LedgerPosting::payment(usd(dec!(5))))
            .await;
        assert!(matches!(result, Err(BillingError::Storage(_))));
        assert_eq!(balance(&h, &account).await, usd(dec!(0)));
        assert!(h.store.ledger_entries(account.id(), None, None).await.unwrap().is_empty());
    }
}

// ============================================================================
// Invoice Tests
// ============================================================================

mod invoice_tests {
    use super::*;

    #[tokio::test]
    async fn test_generated_invoice_totals_and_charge() {
        let h = harness(quiet_config());
        let account = open(&h, "ACC-1001").await;

        let invoice = invoice_for(
            &h,
            &account,
            vec![line("Fibre 100", dec!(100), dec!(10)), line("Static IP", dec!(50), dec!(10))],
        )
        .await;

        assert_eq!(invoice.subtotal, usd(dec!(150)));
        assert_eq!(invoice.tax_amount, usd(dec!(15)));
        assert_eq!(invoice.total, usd(dec!(165)));
        assert_eq!(invoice.status, InvoiceStatus::Pending);
        assert_eq!(invoice.invoice_date, date(2026, 3, 1));
        assert_eq!(invoice.due_date, date(2026, 3, 15));
        assert!(invoice.charge_transaction_id.is_some());
        assert_eq!(balance(&h, &account).await, usd(dec!(-165)));
    }

    #[tokio::test]
    async fn test_same_period_cannot_be_invoiced_twice() {
        let h = harness(quiet_config());
        let account = open(&h, "ACC-1001").await;
        invoice_for(&h, &account, vec![line("Fibre 100", dec!(100), dec!(0))]).await;

        let result = h
            .service
            .generate_invoice(
                account.id(),
                february(),
                &StaticLineItems(vec![line("Fibre 100", dec!(100), dec!(0))]),
            )
            .await;
        assert!(matches!(result, Err(BillingError::DuplicateInvoice(_))));
        assert_eq!(balance(&h, &account).await, usd(dec!(-100)));
    }

    #[tokio::test]
    async fn test_nothing_to_bill_is_rejected() {
        let h = harness(quiet_config());
        let account = open(&h, "ACC-1001").await;

        let result = h
            .service
            .generate_invoice(account.id(), february(), &StaticLineItems::default())
            .await;
        assert!(matches!(result, Err(BillingError::Validation(_))));
    }

    #[tokio::test]
    async fn test_invoice_cycle_is_repeatable() {
        let h = harness(quiet_config());
        open(&h, "ACC-1001").await;
        open(&h, "ACC-1002").await;
        let closed = open(&h, "ACC-1003").await;
        h.service.close_account(closed.id()).await.unwrap();
        let source = StaticLineItems(vec![line("Fibre 100", dec!(100), dec!(0))]);

        let first = h.service.run_invoice_cycle(february(), &source).await.unwrap();
        assert_eq!(first.generated, 2);
        assert_eq!(first.skipped_inactive, 1);

        let second = h.service.run_invoice_cycle(february(), &source).await.unwrap();
        assert_eq!(second.generated, 0);
        assert_eq!(second.already_invoiced, 2);
    }

    #[tokio::test]
    async fn test_prorated_line_scales_invoice() {
        let h = harness(quiet_config());
        let account = open(&h, "ACC-1001").await;
        let period = february();
        let half = DateRange::new(date(2026, 2, 15), date(2026, 2, 28)).unwrap();
        let item = InvoiceItem::new("Fibre 100", InvoiceItemType::Subscription, dec!(1), usd(dec!(56)))
            .unwrap()
            .for_service_period(half, &period)
            .unwrap();

        let invoice = h
            .service
            .generate_invoice(account.id(), period, &StaticLineItems(vec![item]))
            .await
            .unwrap();

        assert!(invoice.is_prorated);
        assert_eq!(invoice.proration_factor, dec!(0.5));
        assert_eq!(invoice.total, usd(dec!(28)));
    }

    #[tokio::test]
    async fn test_adhoc_invoice_lifecycle() {
        let h = harness(quiet_config());
        let account = open(&h, "ACC-1001").await;

        let draft = h
            .service
            .create_invoice(account.id(), Some("Site survey".to_string()))
            .await
            .unwrap();
        assert_eq!(draft.status, InvoiceStatus::Draft);

        let draft = h
            .service
            .add_invoice_item(draft.id, line("Survey", dec!(80), dec!(0)))
            .await
            .unwrap();
        let draft = h
            .service
            .set_invoice_adjustment(draft.id, usd(dec!(-5)))
            .await
            .unwrap();
        assert_eq!(balance(&h, &account).await, usd(dec!(0)));

        let issued = h.service.finalize_invoice(draft.id).await.unwrap();
        assert_eq!(issued.total, usd(dec!(75)));
        assert_eq!(balance(&h, &account).await, usd(dec!(-75)));

        let sent = h.service.mark_invoice_sent(issued.id).await.unwrap();
        assert_eq!(sent.status, InvoiceStatus::Sent);

        let again = h.service.add_invoice_item(sent.id, line("Extra", dec!(1), dec!(0))).await;
        assert!(again.is_err());
    }

    #[tokio::test]
    async fn test_cancel_reverses_charge() {
        let h = harness(quiet_config());
        let account = open(&h, "ACC-1001").await;
        let invoice = invoice_for(&h, &account, vec![line("Fibre 100", dec!(100), dec!(0))]).await;

        let cancelled = h.service.cancel_invoice(invoice.id, "billed in error").await.unwrap();
        assert_eq!(cancelled.status, InvoiceStatus::Cancelled);
        assert_eq!(balance(&h, &account).await, usd(dec!(0)));

        let history = h.service.ledger_history(account.id(), None, None).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[0].is_reversed);
    }
}

// ============================================================================
// Payment Tests
// ============================================================================

mod payment_tests {
    use super::*;

    #[tokio::test]
    async fn test_manual_payment_settles_invoice() {
        let h = harness(quiet_config());
        let account = open(&h, "ACC-1001").await;
        let invoice = invoice_for(&h, &account, vec![line("Fibre 100", dec!(100), dec!(10))]).await;

        let payment = h
            .service
            .record_manual_payment(
                PaymentRequest::new(account.id(), usd(dec!(110)), PaymentMethod::Cash)
                    .for_invoice(invoice.id),
                &OperationMetadata::default(),
            )
            .await
            .unwrap();

        assert_eq!(payment.status, PaymentStatus::Completed);
        assert!(payment.ledger_transaction_id.is_some());
        let invoice = h.service.invoice(invoice.id).await.unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Paid);
        assert_eq!(invoice.balance_due, usd(dec!(0)));
        assert_eq!(balance(&h, &account).await, usd(dec!(0)));
        assert_eq!(h.notifier.templates(), vec!["payment_receipt".to_string()]);
    }

    #[tokio::test]
    async fn test_overpayment_stays_as_credit() {
        let h = harness(quiet_config());
        let account = open(&h, "ACC-1001").await;
        let invoice = invoice_for(&h, &account, vec![line("Fibre 100", dec!(100), dec!(0))]).await;

        h.service
            .record_manual_payment(
                PaymentRequest::new(account.id(), usd(dec!(130)), PaymentMethod::BankTransfer)
                    .for_invoice(invoice.id),
                &OperationMetadata::default(),
            )
            .await
            .unwrap();

        assert_eq!(h.service.invoice(invoice.id).await.unwrap().paid_amount, usd(dec!(100)));
        assert_eq!(balance(&h, &account).await, usd(dec!(30)));
    }

    #[tokio::test]
    async fn test_replayed_request_is_recorded_once() {
        let h = harness(quiet_config());
        let account = open(&h, "ACC-1001").await;
        let meta = OperationMetadata::default().idempotent("till-7:receipt-42");
        let request = PaymentRequest::new(account.id(), usd(dec!(20)), PaymentMethod::Cash);

        let first = h.service.record_manual_payment(request.clone(), &meta).await.unwrap();
        let second = h.service.record_manual_payment(request, &meta).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(balance(&h, &account).await, usd(dec!(20)));
        assert_eq!(h.service.payments(account.id()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_processing_fee_is_withheld() {
        let h = harness(quiet_config());
        let account = open(&h, "ACC-1001").await;

        h.service
            .record_manual_payment(
                PaymentRequest::new(account.id(), usd(dec!(100)), PaymentMethod::MobileMoney)
                    .with_fee(usd(dec!(3))),
                &OperationMetadata::default(),
            )
            .await
            .unwrap();

        assert_eq!(balance(&h, &account).await, usd(dec!(97)));
    }

    #[tokio::test]
    async fn test_declined_charge_is_retried_after_backoff() {
        let h = harness(quiet_config());
        h.gateway.then(GatewayStatus::Declined {
            reason: "insufficient_funds".to_string(),
        });
        let account = open(&h, "ACC-1001").await;
        let invoice = invoice_for(&h, &account, vec![line("Fibre 100", dec!(100), dec!(0))]).await;

        let pending = h
            .service
            .record_payment(
                PaymentRequest::new(account.id(), usd(dec!(100)), PaymentMethod::Card)
                    .for_invoice(invoice.id)
                    .with_token("tok_visa"),
                &OperationMetadata::default(),
            )
            .await
            .unwrap();
        assert_eq!(pending.status, PaymentStatus::Pending);

        let failed = h.service.process_payment(pending.id).await.unwrap();
        assert_eq!(failed.status, PaymentStatus::Failed);
        assert_eq!(failed.failure_reason.as_deref(), Some("insufficient_funds"));
        assert_eq!(failed.next_retry_date, Some(noon(2026, 3, 1) + Duration::hours(1)));
        assert_eq!(balance(&h, &account).await, usd(dec!(-100)));

        let early = h.service.run_payment_retries().await.unwrap();
        assert_eq!(early.attempted, 0);

        h.clock.advance(Duration::hours(1));
        let report = h.service.run_payment_retries().await.unwrap();
        assert_eq!(report.attempted, 1);
        assert_eq!(report.succeeded, 1);

        let settled = h.service.payment(pending.id).await.unwrap();
        assert_eq!(settled.status, PaymentStatus::Completed);
        assert_eq!(settled.retry_count, 1);
        assert_eq!(h.gateway.charge_count(), 2);
        assert_eq!(h.service.invoice(invoice.id).await.unwrap().status, InvoiceStatus::Paid);
    }

    #[tokio::test]
    async fn test_gateway_timeout_fails_payment() {
        let mut config = quiet_config();
        config.gateway_timeout_ms = 20;
        let h = harness_with(
            config,
            ScriptedGateway {
                delay: Some(StdDuration::from_millis(500)),
                ..Default::default()
            },
        );
        let account = open(&h, "ACC-1001").await;
        let payment = h
            .service
            .record_payment(
                PaymentRequest::new(account.id(), usd(dec!(10)), PaymentMethod::Card)
                    .with_token("tok_visa"),
                &OperationMetadata::default(),
            )
            .await
            .unwrap();

        let result = h.service.process_payment(payment.id).await.unwrap();
        assert_eq!(result.status, PaymentStatus::Failed);
        assert!(result.next_retry_date.is_some());
        assert_eq!(balance(&h, &account).await, usd(dec!(0)));
    }

    #[tokio::test]
    async fn test_cash_payment_is_not_sent_to_gateway() {
        let h = harness(quiet_config());
        let account = open(&h, "ACC-1001").await;
        let payment = h
            .service
            .record_payment(
                PaymentRequest::new(account.id(), usd(dec!(10)), PaymentMethod::Cash),
                &OperationMetadata::default(),
            )
            .await
            .unwrap();

        let result = h.service.process_payment(payment.id).await;
        assert!(matches!(result, Err(BillingError::Validation(_))));

        let completed = h.service.complete_payment(payment.id, None).await.unwrap();
        assert_eq!(completed.status, PaymentStatus::Completed);
        assert_eq!(balance(&h, &account).await, usd(dec!(10)));
        assert_eq!(h.gateway.charge_count(), 0);
    }

    #[tokio::test]
    async fn test_full_refund_reverses_payment() {
        let h = harness(quiet_config());
        let account = open(&h, "ACC-1001").await;
        let invoice = invoice_for(&h, &account, vec![line("Fibre 100", dec!(100), dec!(0))]).await;
        let payment = h
            .service
            .record_payment(
                PaymentRequest::new(account.id(), usd(dec!(100)), PaymentMethod::Card)
                    .for_invoice(invoice.id)
                    .with_token("tok_visa"),
                &OperationMetadata::default(),
            )
            .await
            .unwrap();
        h.service.process_payment(payment.id).await.unwrap();

        let refunded = h
            .service
            .refund_payment(payment.id, None, "duplicate charge")
            .await
            .unwrap();

        assert_eq!(refunded.status, PaymentStatus::Refunded);
        assert_eq!(h.gateway.refund_count(), 1);
        assert_eq!(balance(&h, &account).await, usd(dec!(-100)));
        assert_eq!(
            h.service.invoice(invoice.id).await.unwrap().status,
            InvoiceStatus::Refunded
        );
    }

    #[tokio::test]
    async fn test_partial_refund_posts_debit() {
        let h = harness(quiet_config());
        let account = open(&h, "ACC-1001").await;
        let payment = h
            .service
            .record_manual_payment(
                PaymentRequest::new(account.id(), usd(dec!(60)), PaymentMethod::Cash),
                &OperationMetadata::default(),
            )
            .await
            .unwrap();

        let refunded = h
            .service
            .refund_payment(payment.id, Some(usd(dec!(25))), "goodwill")
            .await
            .unwrap();
        assert_eq!(refunded.refunded_amount, usd(dec!(25)));
        assert_eq!(balance(&h, &account).await, usd(dec!(35)));

        let too_much = h.service.refund_payment(payment.id, Some(usd(dec!(50))), "again").await;
        assert!(matches!(too_much, Err(BillingError::InvalidAmount(_))));
    }

    async fn card_payment(h: &Harness, account: &BillingAccount, amount: Decimal) -> PaymentId {
        let payment = h
            .service
            .record_payment(
                PaymentRequest::new(account.id(), usd(amount), PaymentMethod::Card)
                    .with_token("tok_visa"),
                &OperationMetadata::default(),
            )
            .await
            .unwrap();
        h.service.process_payment(payment.id).await.unwrap();
        payment.id
    }

    #[tokio::test]
    async fn test_concurrent_refunds_pay_out_once() {
        let gateway = ScriptedGateway {
            refund_delay: Some(StdDuration::from_millis(20)),
            ..Default::default()
        };
        let h = harness_with(quiet_config(), gateway);
        let account = open(&h, "ACC-1001").await;
        let payment_id = card_payment(&h, &account, dec!(100)).await;

        let (one, two) = tokio::join!(
            h.service.refund_payment(payment_id, None, "one"),
            h.service.refund_payment(payment_id, None, "two"),
        );

        assert_eq!(one.is_ok() as u8 + two.is_ok() as u8, 1);
        let rejected = if one.is_err() { one } else { two };
        assert!(matches!(rejected, Err(BillingError::InvalidAmount(_))));
        assert_eq!(h.gateway.refund_count(), 1);

        let payment = h.service.payment(payment_id).await.unwrap();
        assert_eq!(payment.status, PaymentStatus::Refunded);
        assert_eq!(payment.refunded_amount, usd(dec!(100)));
        assert!(payment.refund_pending.is_zero());
        assert_eq!(balance(&h, &account).await, usd(dec!(0)));
    }

    #[tokio::test]
    async fn test_declined_gateway_refund_releases_hold() {
        let h = harness(quiet_config());
        let account = open(&h, "ACC-1001").await;
        let payment_id = card_payment(&h, &account, dec!(80)).await;
        h.gateway
            .refund_errors
            .lock()
            .unwrap()
            .push_back(PortError::timeout("refund", 5000));

        let failed = h.service.refund_payment(payment_id, None, "duplicate").await;
        assert!(matches!(failed, Err(BillingError::External(_))));
        let payment = h.service.payment(payment_id).await.unwrap();
        assert_eq!(payment.status, PaymentStatus::Completed);
        assert!(payment.refund_pending.is_zero());
        assert_eq!(balance(&h, &account).await, usd(dec!(80)));

        h.service
            .refund_payment(payment_id, None, "duplicate")
            .await
            .unwrap();
        assert_eq!(h.gateway.refund_count(), 1);
        assert_eq!(balance(&h, &account).await, usd(dec!(0)));
    }

    #[tokio::test]
    async fn test_unrecorded_gateway_refund_keeps_hold() {
        let h = harness(quiet_config());
        let account = open(&h, "ACC-1001").await;
        let payment_id = card_payment(&h, &account, dec!(50)).await;
        *h.gateway.fail_store_after_refund.lock().unwrap() = Some(h.store.clone());

        let result = h.service.refund_payment(payment_id, None, "duplicate").await;
        assert!(matches!(result, Err(BillingError::Storage(_))));
        assert_eq!(h.gateway.refund_count(), 1);

        let payment = h.service.payment(payment_id).await.unwrap();
        assert_eq!(payment.refund_pending, usd(dec!(50)));
        assert!(payment.refunded_amount.is_zero());

        let again = h.service.refund_payment(payment_id, None, "retry").await;
        assert!(matches!(again, Err(BillingError::InvalidAmount(_))));
        assert_eq!(h.gateway.refund_count(), 1);
    }

    #[tokio::test]
    async fn test_lost_update_is_retried() {
        let h = harness(quiet_config());
        let account = open(&h, "ACC-1001").await;
        h.store.conflict_next_commit();

        h.service
            .record_manual_payment(
                PaymentRequest::new(account.id(), usd(dec!(15)), PaymentMethod::Cash),
                &OperationMetadata::default(),
            )
            .await
            .unwrap();

        assert_eq!(balance(&h, &account).await, usd(dec!(15)));
        assert_eq!(h.service.payments(account.id()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_payments_keep_ledger_consistent() {
        let h = harness(quiet_config());
        let account = open(&h, "ACC-1001").await;

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let service = h.service.clone();
            let account_id = account.id();
            tasks.push(tokio::spawn(async move {
                service
                    .record_manual_payment(
                        PaymentRequest::new(account_id, usd(dec!(7.50)), PaymentMethod::Cash),
                        &OperationMetadata::default(),
                    )
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(balance(&h, &account).await, usd(dec!(75)));
        let history = h.service.ledger_history(account.id(), None, None).await.unwrap();
        assert_eq!(history.len(), 10);
        for (expected, entry) in (1u64..).zip(&history) {
            assert_eq!(entry.sequence, expected);
            assert!(entry.is_consistent());
        }
        for pair in history.windows(2) {
            assert_eq!(pair[0].balance_after, pair[1].balance_before);
        }
    }
}

// ============================================================================
// Credit Note Tests
// ============================================================================

mod credit_note_tests {
    use super::*;

    #[tokio::test]
    async fn test_note_waits_for_approval() {
        let h = harness(quiet_config());
        let account = open(&h, "ACC-1001").await;
        let invoice = invoice_for(&h, &account, vec![line("Fibre 100", dec!(100), dec!(0))]).await;

        let note = h
            .service
            .issue_credit_note(
                CreditNoteRequest::new(account.id(), usd(dec!(40)), "outage 2026-02-10")
                    .for_invoice(invoice.id),
                &OperationMetadata::by_actor("agent-12"),
            )
            .await
            .unwrap();
        assert_eq!(note.status, CreditNoteStatus::Active);
        assert_eq!(balance(&h, &account).await, usd(dec!(-100)));

        let early = h.service.apply_credit_note(note.id).await;
        assert!(early.is_err());

        let anonymous = h.service.approve_credit_note(note.id, &OperationMetadata::default()).await;
        assert!(matches!(anonymous, Err(BillingError::Validation(_))));

        h.service
            .approve_credit_note(note.id, &OperationMetadata::by_actor("supervisor-3"))
            .await
            .unwrap();
        let applied = h.service.apply_credit_note(note.id).await.unwrap();

        assert_eq!(applied.status, CreditNoteStatus::Applied);
        assert_eq!(balance(&h, &account).await, usd(dec!(-60)));
        assert_eq!(h.service.invoice(invoice.id).await.unwrap().balance_due, usd(dec!(60)));
    }

    #[tokio::test]
    async fn test_auto_applied_note_needs_no_second_step() {
        let h = harness(quiet_config());
        let account = open(&h, "ACC-1001").await;

        let note = h
            .service
            .issue_credit_note(
                CreditNoteRequest::new(account.id(), usd(dec!(12)), "promo")
                    .without_approval()
                    .auto_applied(),
                &OperationMetadata::default(),
            )
            .await
            .unwrap();

        assert_eq!(note.status, CreditNoteStatus::Applied);
        assert_eq!(balance(&h, &account).await, usd(dec!(12)));
    }

    #[tokio::test]
    async fn test_voided_note_cannot_be_applied() {
        let h = harness(quiet_config());
        let account = open(&h, "ACC-1001").await;
        let note = h
            .service
            .issue_credit_note(
                CreditNoteRequest::new(account.id(), usd(dec!(12)), "promo").without_approval(),
                &OperationMetadata::default(),
            )
            .await
            .unwrap();

        let voided = h.service.void_credit_note(note.id, "issued by mistake").await.unwrap();
        assert_eq!(voided.status, CreditNoteStatus::Voided);
        assert!(h.service.apply_credit_note(note.id).await.is_err());
        assert_eq!(balance(&h, &account).await, usd(dec!(0)));
    }
}

// ============================================================================
// Dunning Tests
// ============================================================================

mod dunning_tests {
    use super::*;

    async fn overdue_account(h: &Harness) -> (BillingAccount, Invoice) {
        let account = open(h, "ACC-1001").await;
        let invoice = invoice_for(h, &account, vec![line("Fibre 100", dec!(150), dec!(10))]).await;
        h.clock.set(noon(2026, 3, 20));
        (account, invoice)
    }

    #[tokio::test]
    async fn test_invoice_not_overdue_on_due_date() {
        let h = harness(quiet_config());
        let account = open(&h, "ACC-1001").await;
        invoice_for(&h, &account, vec![line("Fibre 100", dec!(100), dec!(0))]).await;
        h.clock.set(noon(2026, 3, 15));

        let outcome = h.service.reconcile_account(account.id()).await.unwrap();
        assert_eq!(outcome.invoices_marked_overdue, 0);
        assert!(outcome.case_opened.is_none());
    }

    #[tokio::test]
    async fn test_case_opens_escalates_and_resolves() {
        let h = harness(quiet_config());
        let (account, invoice) = overdue_account(&h).await;

        let opened = h.service.reconcile_account(account.id()).await.unwrap();
        assert_eq!(opened.invoices_marked_overdue, 1);
        let case_id = opened.case_opened.unwrap();
        assert_eq!(h.service.invoice(invoice.id).await.unwrap().status, InvoiceStatus::Overdue);

        let unchanged = h.service.reconcile_account(account.id()).await.unwrap();
        assert!(unchanged.escalated_to.is_none());

        h.clock.advance(Duration::days(7));
        let escalated = h.service.reconcile_account(account.id()).await.unwrap();
        assert_eq!(escalated.escalated_to, Some(2));

        h.service
            .record_manual_payment(
                PaymentRequest::new(account.id(), usd(dec!(165)), PaymentMethod::Cash)
                    .for_invoice(invoice.id),
                &OperationMetadata::default(),
            )
            .await
            .unwrap();

        let cases = h.service.dunning_cases(account.id()).await.unwrap();
        let case = cases.iter().find(|c| c.id == case_id).unwrap();
        assert_eq!(case.status, DunningStatus::Completed);
        assert_eq!(case.current_stage, 2);
        assert!(h.service.active_dunning_cases().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_notices_sent_once() {
        let h = harness(quiet_config());
        let (account, _) = overdue_account(&h).await;
        h.service.reconcile_account(account.id()).await.unwrap();

        assert_eq!(h.service.deliver_notices(account.id()).await.unwrap(), 1);
        assert_eq!(h.service.deliver_notices(account.id()).await.unwrap(), 0);

        let sent = h.notifier.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, "dunning_reminder");
        assert_eq!(sent[0].2["account_number"], "ACC-1001");
        assert_eq!(sent[0].2["stage"], "1");
    }

    #[tokio::test]
    async fn test_failed_delivery_is_capped() {
        let h = harness(quiet_config());
        h.notifier.respond_with(DeliveryStatus::Failed {
            reason: "mailbox full".to_string(),
        });
        let (account, _) = overdue_account(&h).await;
        h.service.reconcile_account(account.id()).await.unwrap();

        for _ in 0..5 {
            assert_eq!(h.service.deliver_notices(account.id()).await.unwrap(), 0);
        }
        assert_eq!(h.notifier.templates().len(), 3);

        let case = &h.service.dunning_cases(account.id()).await.unwrap()[0];
        assert_eq!(case.current_stage, 1);
        assert_eq!(case.actions[0].attempts, 3);
    }

    #[tokio::test]
    async fn test_queued_delivery_is_not_resent() {
        let h = harness(quiet_config());
        h.notifier.respond_with(DeliveryStatus::Queued);
        let (account, _) = overdue_account(&h).await;
        h.service.reconcile_account(account.id()).await.unwrap();

        assert_eq!(h.service.deliver_notices(account.id()).await.unwrap(), 1);
        assert_eq!(h.service.deliver_notices(account.id()).await.unwrap(), 0);
        assert_eq!(h.notifier.templates().len(), 1);
    }

    #[tokio::test]
    async fn test_paused_case_does_not_escalate() {
        let h = harness(quiet_config());
        let (account, _) = overdue_account(&h).await;
        let case_id = h
            .service
            .reconcile_account(account.id())
            .await
            .unwrap()
            .case_opened
            .unwrap();

        h.service
            .pause_dunning_case(case_id, Some("customer disputes charge".to_string()))
            .await
            .unwrap();
        h.clock.advance(Duration::days(30));
        let outcome = h.service.reconcile_account(account.id()).await.unwrap();
        assert!(outcome.escalated_to.is_none());

        let resumed = h.service.resume_dunning_case(case_id).await.unwrap();
        assert_eq!(resumed.status, DunningStatus::Active);
    }

    #[tokio::test]
    async fn test_paused_case_stays_paused_when_settled() {
        let h = harness(quiet_config());
        let (account, invoice) = overdue_account(&h).await;
        let case_id = h
            .service
            .reconcile_account(account.id())
            .await
            .unwrap()
            .case_opened
            .unwrap();
        h.service.pause_dunning_case(case_id, None).await.unwrap();

        h.service
            .record_manual_payment(
                PaymentRequest::new(account.id(), usd(dec!(165)), PaymentMethod::Cash)
                    .for_invoice(invoice.id),
                &OperationMetadata::default(),
            )
            .await
            .unwrap();
        let outcome = h.service.reconcile_account(account.id()).await.unwrap();
        assert!(!outcome.case_resolved);
        assert!(h.service.resolve_dunning_case(case_id).await.is_err());

        let cases = h.service.dunning_cases(account.id()).await.unwrap();
        assert_eq!(cases[0].status, DunningStatus::Paused);

        h.service.resume_dunning_case(case_id).await.unwrap();
        let outcome = h.service.reconcile_account(account.id()).await.unwrap();
        assert!(outcome.case_resolved);
        let cases = h.service.dunning_cases(account.id()).await.unwrap();
        assert_eq!(cases[0].status, DunningStatus::Completed);
    }

    #[tokio::test]
    async fn test_manual_escalation_requires_actor() {
        let h = harness(quiet_config());
        let (account, _) = overdue_account(&h).await;
        let case_id = h
            .service
            .reconcile_account(account.id())
            .await
            .unwrap()
            .case_opened
            .unwrap();

        let anonymous = h
            .service
            .escalate_dunning_case(case_id, &OperationMetadata::default())
            .await;
        assert!(matches!(anonymous, Err(BillingError::Validation(_))));

        let case = h
            .service
            .escalate_dunning_case(case_id, &OperationMetadata::by_actor("collections-1"))
            .await
            .unwrap();
        assert_eq!(case.current_stage, 2);
        assert_eq!(case.actions.last().unwrap().performed_by.as_deref(), Some("collections-1"));
    }

    #[tokio::test]
    async fn test_case_cannot_be_resolved_while_overdue() {
        let h = harness(quiet_config());
        let (account, _) = overdue_account(&h).await;
        let case_id = h
            .service
            .reconcile_account(account.id())
            .await
            .unwrap()
            .case_opened
            .unwrap();

        assert!(h.service.resolve_dunning_case(case_id).await.is_err());
        let cancelled = h.service.cancel_dunning_case(case_id, "written off").await.unwrap();
        assert_eq!(cancelled.status, DunningStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_dunning_pass_covers_every_account() {
        let h = harness(quiet_config());
        let (first, _) = overdue_account(&h).await;
        open(&h, "ACC-1002").await;

        let report = h.service.run_dunning_pass().await.unwrap();
        assert_eq!(report.accounts, 2);
        assert_eq!(report.cases_opened, 1);
        assert_eq!(report.notices_sent, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(h.service.dunning_cases(first.id()).await.unwrap().len(), 1);
    }
}

// ============================================================================
// Lifecycle Tests
// ============================================================================

mod lifecycle_tests {
    use super::*;

    async fn charge(h: &Harness, account: &BillingAccount, amount: Decimal) {
        h.service
            .post_ledger_entry(
                account.id(),
                LedgerPosting::charge(usd(amount), BillingCategory::Subscription),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_suspended_below_threshold_and_restored_by_payment() {
        let h = harness(BillingConfig::default());
        let account = open(&h, "ACC-1001").await;
        charge(&h, &account, dec!(150)).await;

        let outcome = h.service.reconcile_account(account.id()).await.unwrap();
        assert_eq!(outcome.lifecycle, Some(LifecycleAction::Suspend));
        let suspended = h.service.account(account.id()).await.unwrap();
        assert_eq!(suspended.status(), AccountStatus::Suspended);
        assert_eq!(suspended.suspension_reason(), Some(SuspensionReason::Balance));

        h.service
            .record_manual_payment(
                PaymentRequest::new(account.id(), usd(dec!(150)), PaymentMethod::Cash),
                &OperationMetadata::default(),
            )
            .await
            .unwrap();
        assert_eq!(
            h.service.account(account.id()).await.unwrap().status(),
            AccountStatus::Active
        );
    }

    #[tokio::test]
    async fn test_manual_suspension_is_not_auto_restored() {
        let h = harness(BillingConfig::default());
        let account = open(&h, "ACC-1001").await;
        h.service.suspend_account(account.id()).await.unwrap();

        let outcome = h.service.reconcile_account(account.id()).await.unwrap();
        assert!(outcome.lifecycle.is_none());
        assert_eq!(
            h.service.account(account.id()).await.unwrap().status(),
            AccountStatus::Suspended
        );
    }

    #[tokio::test]
    async fn test_termination_flagged_when_not_automatic() {
        let h = harness(BillingConfig::default());
        let account = open(&h, "ACC-1001").await;
        charge(&h, &account, dec!(600)).await;

        let outcome = h.service.reconcile_account(account.id()).await.unwrap();
        assert_eq!(outcome.lifecycle, Some(LifecycleAction::Terminate));
        assert_eq!(
            h.service.account(account.id()).await.unwrap().status(),
            AccountStatus::Suspended
        );

        let again = h.service.reconcile_account(account.id()).await.unwrap();
        assert!(again.lifecycle.is_none());
    }

    #[tokio::test]
    async fn test_automatic_termination_closes_account() {
        let config = BillingConfig::default().with_lifecycle(LifecyclePolicy {
            auto_terminate: true,
            ..LifecyclePolicy::default()
        });
        let h = harness(config);
        let account = open(&h, "ACC-1001").await;
        charge(&h, &account, dec!(600)).await;

        h.service.reconcile_account(account.id()).await.unwrap();
        assert_eq!(
            h.service.account(account.id()).await.unwrap().status(),
            AccountStatus::Closed
        );
    }

    #[tokio::test]
    async fn test_limits_can_be_tightened() {
        let h = harness(BillingConfig::default());
        let account = open(&h, "ACC-1001").await;
        charge(&h, &account, dec!(60)).await;

        h.service
            .update_limits(
                account.id(),
                domain_billing::AccountLimits {
                    suspension_threshold: Some(usd(dec!(-50))),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let outcome = h.service.reconcile_account(account.id()).await.unwrap();
        assert_eq!(outcome.lifecycle, Some(LifecycleAction::Suspend));
    }
}

// ============================================================================
// Payment Plan Tests
// ============================================================================

mod plan_tests {
    use super::*;

    fn plan_request(account: &BillingAccount, invoice: &Invoice) -> PaymentPlanRequest {
        PaymentPlanRequest {
            account_id: account.id(),
            invoice_ids: vec![invoice.id],
            total_amount: None,
            down_payment: None,
            number_of_installments: 3,
            frequency: PlanFrequency::Monthly,
            start_date: date(2026, 4, 1),
            grace_period_days: Some(5),
            late_fee: Some(usd(dec!(10))),
        }
    }

    async fn pay_plan(h: &Harness, account: &BillingAccount, plan_id: core_kernel::PaymentPlanId, amount: Decimal) {
        h.service
            .record_manual_payment(
                PaymentRequest::new(account.id(), usd(amount), PaymentMethod::Cash).for_plan(plan_id),
                &OperationMetadata::default(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_plan_payment_flows_to_invoice() {
        let h = harness(quiet_config());
        let account = open(&h, "ACC-1001").await;
        let invoice = invoice_for(&h, &account, vec![line("Arrears", dec!(300), dec!(0))]).await;

        let plan = h
            .service
            .create_payment_plan(plan_request(&account, &invoice), &OperationMetadata::by_actor("agent-4"))
            .await
            .unwrap();
        assert_eq!(plan.total_amount, usd(dec!(300)));
        assert_eq!(plan.installments.len(), 3);
        assert_eq!(plan.installments[2].due_date, date(2026, 6, 1));
        assert_eq!(plan.created_by.as_deref(), Some("agent-4"));

        pay_plan(&h, &account, plan.id, dec!(100)).await;

        let status = h.service.payment_plan_status(plan.id).await.unwrap();
        assert_eq!(status.paid_installments, 1);
        assert_eq!(status.remaining_balance, usd(dec!(200)));
        assert_eq!(status.next_due_date, Some(date(2026, 5, 1)));
        let invoice = h.service.invoice(invoice.id).await.unwrap();
        assert_eq!(invoice.paid_amount, usd(dec!(100)));
        assert_eq!(balance(&h, &account).await, usd(dec!(-200)));
    }

    #[tokio::test]
    async fn test_invoice_cannot_join_two_plans() {
        let h = harness(quiet_config());
        let account = open(&h, "ACC-1001").await;
        let invoice = invoice_for(&h, &account, vec![line("Arrears", dec!(300), dec!(0))]).await;
        h.service
            .create_payment_plan(plan_request(&account, &invoice), &OperationMetadata::default())
            .await
            .unwrap();

        let second = h
            .service
            .create_payment_plan(plan_request(&account, &invoice), &OperationMetadata::default())
            .await;
        assert!(matches!(second, Err(BillingError::Validation(_))));
    }

    #[tokio::test]
    async fn test_late_fee_charged_once_and_paid_first() {
        let h = harness(quiet_config());
        let account = open(&h, "ACC-1001").await;
        let invoice = invoice_for(&h, &account, vec![line("Arrears", dec!(300), dec!(0))]).await;
        let plan = h
            .service
            .create_payment_plan(plan_request(&account, &invoice), &OperationMetadata::default())
            .await
            .unwrap();

        h.clock.set(noon(2026, 4, 7));
        let report = h.service.run_installment_pass().await.unwrap();
        assert_eq!(report.installments_marked_overdue, 1);
        assert_eq!(report.late_fees_charged, 1);
        assert_eq!(balance(&h, &account).await, usd(dec!(-310)));

        let repeat = h.service.run_installment_pass().await.unwrap();
        assert_eq!(repeat.late_fees_charged, 0);

        pay_plan(&h, &account, plan.id, dec!(110)).await;
        let status = h.service.payment_plan_status(plan.id).await.unwrap();
        assert_eq!(status.paid_installments, 1);
        assert_eq!(
            h.service.invoice(invoice.id).await.unwrap().paid_amount,
            usd(dec!(100))
        );
        assert_eq!(balance(&h, &account).await, usd(dec!(-200)));
    }

    #[tokio::test]
    async fn test_plan_defaults_after_consecutive_misses() {
        let h = harness(quiet_config());
        let account = open(&h, "ACC-1001").await;
        let invoice = invoice_for(&h, &account, vec![line("Arrears", dec!(300), dec!(0))]).await;
        let plan = h
            .service
            .create_payment_plan(plan_request(&account, &invoice), &OperationMetadata::default())
            .await
            .unwrap();

        h.clock.set(noon(2026, 6, 10));
        let report = h.service.run_installment_pass().await.unwrap();
        assert_eq!(report.installments_marked_overdue, 3);
        assert_eq!(report.plans_defaulted, 1);

        let status = h.service.payment_plan_status(plan.id).await.unwrap();
        assert_eq!(status.plan.status, PlanStatus::Defaulted);
    }

    #[tokio::test]
    async fn test_covered_invoice_is_left_out_of_dunning() {
        let h = harness(quiet_config());
        let account = open(&h, "ACC-1001").await;
        let invoice = invoice_for(&h, &account, vec![line("Arrears", dec!(300), dec!(0))]).await;
        h.service
            .create_payment_plan(plan_request(&account, &invoice), &OperationMetadata::default())
            .await
            .unwrap();

        h.clock.set(noon(2026, 3, 20));
        let outcome = h.service.reconcile_account(account.id()).await.unwrap();
        assert!(outcome.case_opened.is_none());
    }

    #[tokio::test]
    async fn test_plan_payment_cannot_be_refunded() {
        let h = harness(quiet_config());
        let account = open(&h, "ACC-1001").await;
        let invoice = invoice_for(&h, &account, vec![line("Arrears", dec!(300), dec!(0))]).await;
        let plan = h
            .service
            .create_payment_plan(plan_request(&account, &invoice), &OperationMetadata::default())
            .await
            .unwrap();
        let payment = h
            .service
            .record_manual_payment(
                PaymentRequest::new(account.id(), usd(dec!(100)), PaymentMethod::Cash).for_plan(plan.id),
                &OperationMetadata::default(),
            )
            .await
            .unwrap();

        let result = h.service.refund_payment(payment.id, None, "changed mind").await;
        assert!(matches!(result, Err(BillingError::Validation(_))));
    }
}

// ============================================================================
// Query Tests
// ============================================================================

mod query_tests {
    use super::*;

    #[tokio::test]
    async fn test_account_summary() {
        let h = harness(quiet_config());
        let account = open(&h, "ACC-1001").await;
        invoice_for(&h, &account, vec![line("Fibre 100", dec!(100), dec!(0))]).await;
        h.clock.set(noon(2026, 3, 20));
        h.service.reconcile_account(account.id()).await.unwrap();

        let summary = h.service.account_summary(account.id()).await.unwrap();
        assert_eq!(summary.outstanding, usd(dec!(100)));
        assert_eq!(summary.overdue, usd(dec!(100)));
        assert_eq!(summary.open_invoices, 1);
        assert!(summary.dunning_case.is_some());
        assert!(summary.active_plans.is_empty());
    }

    #[tokio::test]
    async fn test_balance_history_range() {
        let h = harness(quiet_config());
        let account = open(&h, "ACC-1001").await;
        h.service
            .post_ledger_entry(account.id(), LedgerPosting::payment(usd(dec!(10))))
            .await
            .unwrap();

        let from = Utc::now() - Duration::hours(1);
        let to = Utc::now() + Duration::hours(1);
        let snapshots = h.service.balance_history(account.id(), from, to).await.unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].current_balance, usd(dec!(10)));

        let reversed = h.service.balance_history(account.id(), to, from).await;
        assert!(matches!(reversed, Err(BillingError::Validation(_))));
    }

    #[tokio::test]
    async fn test_unknown_account() {
        let h = harness(quiet_config());
        let result = h.service.account(BillingAccountId::new()).await;
        assert!(matches!(result, Err(BillingError::AccountNotFound(_))));
    }
}

// ============================================================================
// Property-Based Tests
// ============================================================================

mod property_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn test_balance_equals_sum_of_entries(
            moves in prop::collection::vec((any::<bool>(), 1i64..100_000i64), 1..40)
        ) {
            let mut account = BillingAccount::new(
                CustomerId::new(),
                "ACC-P",
                BillingType::Hybrid,
                Currency::USD,
            );
            account.activate().unwrap();

            let mut expected = Decimal::ZERO;
            for (is_payment, cents) in moves {
                let amount = Money::from_minor(cents, Currency::USD);
                let posting = if is_payment {
                    expected += amount.amount();
                    LedgerPosting::payment(amount)
                } else {
                    expected -= amount.amount();
                    LedgerPosting::charge(amount, BillingCategory::Usage)
                };
                let record = account.apply_ledger_entry(posting).unwrap();
                prop_assert!(record.entry.is_consistent());
                prop_assert_eq!(record.entry.sequence, account.ledger_sequence());
            }

            prop_assert_eq!(account.current_balance().amount(), expected);
            prop_assert!(account.balances_consistent());
        }

        #[test]
        fn test_invoice_total_never_below_base_minus_discount(
            price in 1i64..1_000_000i64,
            tax in 0u32..30u32,
            discount in 0u32..100u32,
        ) {
            let item = InvoiceItem::new(
                "Line",
                InvoiceItemType::Usage,
                dec!(1),
                Money::from_minor(price, Currency::USD),
            )
            .unwrap()
            .with_discount(Decimal::from(discount))
            .unwrap()
            .with_tax(Decimal::from(tax))
            .unwrap();

            prop_assert!(!item.line_total.is_negative());
            prop_assert!(item.discount_amount.amount() <= item.base_amount.amount());
            prop_assert!(item.tax_amount.amount() <= item.line_total.amount());
        }
    }
}
