//! Payment commands
//!
//! Gateway payments run in three steps: mark the payment `Processing`
//! under the account lock, call the gateway with no lock held, then record
//! the outcome under the lock again. A successful payment writes one
//! ledger credit and is then applied to its target.

use std::time::Duration;

use tracing::{error, info, warn};

use core_kernel::{
    BillingAccountId, InvoiceId, Money, OperationMetadata, PaymentId, PaymentPlanId, PortError,
};

use crate::error::BillingError;
use crate::invoice::PaymentSource;
use crate::ledger::{BillingCategory, LedgerEntry, LedgerPosting, LedgerReference};
use crate::payment::{Payment, PaymentMethod, PaymentStatus, PaymentTarget};
use crate::ports::{GatewayCharge, GatewayStatus, NotificationContext};
use crate::unit_of_work::UnitOfWork;

use super::BillingService;

/// A payment to record against an account
#[derive(Debug, Clone)]
pub struct PaymentRequest {
    pub account_id: BillingAccountId,
    pub target: PaymentTarget,
    /// Gross amount
    pub amount: Money,
    pub processing_fee: Option<Money>,
    pub method: PaymentMethod,
    pub payment_method_token: Option<String>,
}

impl PaymentRequest {
    /// A payment to the account balance
    pub fn new(account_id: BillingAccountId, amount: Money, method: PaymentMethod) -> Self {
        Self {
            account_id,
            target: PaymentTarget::Account,
            amount,
            processing_fee: None,
            method,
            payment_method_token: None,
        }
    }

    pub fn for_invoice(mut self, invoice_id: InvoiceId) -> Self {
        self.target = PaymentTarget::Invoice(invoice_id);
        self
    }

    pub fn for_plan(mut self, plan_id: PaymentPlanId) -> Self {
        self.target = PaymentTarget::PaymentPlan(plan_id);
        self
    }

    pub fn with_fee(mut self, fee: Money) -> Self {
        self.processing_fee = Some(fee);
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.payment_method_token = Some(token.into());
        self
    }
}

/// Result of a retry pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryReport {
    pub attempted: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub errors: u32,
}

impl BillingService {
    /// Records a payment in `Pending`, to be processed through the gateway
    ///
    /// Replaying a request with the same idempotency key returns the
    /// payment created the first time.
    pub async fn record_payment(
        &self,
        request: PaymentRequest,
        meta: &OperationMetadata,
    ) -> Result<Payment, BillingError> {
        if let Some(existing) = self.replayed_payment(request.account_id, meta).await? {
            return Ok(existing);
        }
        self.with_account_lock(request.account_id, || {
            self.record_once(&request, meta, false)
        })
        .await
    }

    /// Records and settles a payment received outside the gateway
    /// (cash, cheque, bank transfer)
    pub async fn record_manual_payment(
        &self,
        request: PaymentRequest,
        meta: &OperationMetadata,
    ) -> Result<Payment, BillingError> {
        if let Some(existing) = self.replayed_payment(request.account_id, meta).await? {
            return Ok(existing);
        }
        let payment = self
            .with_account_lock(request.account_id, || {
                self.record_once(&request, meta, true)
            })
            .await?;
        self.send_receipt(&payment).await;
        Ok(payment)
    }

    async fn replayed_payment(
        &self,
        account_id: BillingAccountId,
        meta: &OperationMetadata,
    ) -> Result<Option<Payment>, BillingError> {
        let Some(key) = meta.idempotency_key.as_deref() else {
            return Ok(None);
        };
        let existing = self.store.find_payment_by_key(account_id, key).await?;
        if let Some(payment) = &existing {
            info!(payment_id = %payment.id, key, "Duplicate payment request ignored");
        }
        Ok(existing)
    }

    async fn record_once(
        &self,
        request: &PaymentRequest,
        meta: &OperationMetadata,
        settle: bool,
    ) -> Result<Payment, BillingError> {
        if let Some(existing) = self.replayed_payment(request.account_id, meta).await? {
            return Ok(existing);
        }
        let mut unit = self.begin(request.account_id).await?;
        if unit.account().is_closed() {
            return Err(BillingError::AccountClosed(request.account_id.to_string()));
        }
        match request.target {
            PaymentTarget::Account => {}
            PaymentTarget::Invoice(invoice_id) => {
                let invoice = self.invoice_for_update(&unit, invoice_id).await?;
                if !invoice.status.is_open() {
                    return Err(BillingError::validation(format!(
                        "invoice {} is {:?} and cannot take payments",
                        invoice.invoice_number, invoice.status
                    )));
                }
            }
            PaymentTarget::PaymentPlan(plan_id) => {
                let plan = self.plan_for_update(&unit, plan_id).await?;
                if !plan.is_active() {
                    return Err(BillingError::validation(format!(
                        "payment plan {} is {:?}",
                        plan_id, plan.status
                    )));
                }
            }
        }

        let mut payment = Payment::new(
            request.account_id,
            request.target,
            request.amount,
            request.method,
        )?
        .with_max_retries(self.config.payment_max_retries);
        if let Some(fee) = request.processing_fee {
            payment = payment.with_fee(fee)?;
        }
        if let Some(token) = &request.payment_method_token {
            payment = payment.with_token(token.clone());
        }
        if let Some(key) = &meta.idempotency_key {
            payment = payment.with_idempotency_key(key.clone());
        }

        if settle {
            payment.start_processing()?;
            payment.mark_completed(None)?;
            self.settle_payment(&mut unit, &mut payment).await?;
        }

        unit.stage_payment(payment.clone())?;
        self.commit(unit).await?;
        info!(
            payment_id = %payment.id,
            account_id = %payment.account_id,
            amount = %payment.amount,
            method = ?payment.method,
            status = ?payment.status,
            "Payment recorded"
        );
        Ok(payment)
    }

    /// Posts the ledger credit for a completed payment and applies it to
    /// its target
    ///
    /// The ledger receives the net amount; whatever the target cannot
    /// absorb stays on the account as credit.
    pub(super) async fn settle_payment(
        &self,
        unit: &mut UnitOfWork,
        payment: &mut Payment,
    ) -> Result<LedgerEntry, BillingError> {
        if payment.is_applied() {
            return Err(BillingError::PaymentAlreadyApplied(payment.id.to_string()));
        }
        let net = payment.net_amount()?;
        let entry = unit.post(
            LedgerPosting::payment(net)
                .describe(format!("Payment {} by {:?}", payment.id, payment.method))
                .reference(LedgerReference::Payment(payment.id))
                .idempotency_key(format!("payment:{}", payment.id))
                .effective_at(self.now()),
        )?;
        payment.mark_applied(entry.transaction_id)?;

        match payment.target {
            PaymentTarget::Account => {}
            PaymentTarget::Invoice(invoice_id) => {
                self.apply_to_invoice(unit, invoice_id, net, PaymentSource::Payment(payment.id))
                    .await?;
            }
            PaymentTarget::PaymentPlan(plan_id) => {
                self.apply_to_plan(unit, plan_id, net, payment.id).await?;
            }
        }

        self.after_settlement(unit).await?;
        Ok(entry)
    }

    /// Applies money to an invoice; returns what the invoice could not take
    pub(super) async fn apply_to_invoice(
        &self,
        unit: &mut UnitOfWork,
        invoice_id: InvoiceId,
        amount: Money,
        source: PaymentSource,
    ) -> Result<Money, BillingError> {
        let mut invoice = self.invoice_for_update(unit, invoice_id).await?;
        if !invoice.status.is_open() || !invoice.balance_due.is_positive() {
            info!(
                invoice_id = %invoice_id,
                status = ?invoice.status,
                "Invoice not payable, amount kept as account credit"
            );
            return Ok(amount);
        }
        let application = invoice.apply_payment(amount, source)?;
        unit.stage_invoice(invoice)?;
        Ok(application.excess)
    }

    /// Applies money to a plan, then passes the principal on to the plan's
    /// invoices in order
    async fn apply_to_plan(
        &self,
        unit: &mut UnitOfWork,
        plan_id: PaymentPlanId,
        amount: Money,
        payment_id: PaymentId,
    ) -> Result<(), BillingError> {
        let mut plan = self.plan_for_update(unit, plan_id).await?;
        if !plan.is_active() {
            warn!(
                plan_id = %plan_id,
                status = ?plan.status,
                "Payment plan no longer active, amount kept as account credit"
            );
            return Ok(());
        }
        let outcome = plan.apply_payment(amount, payment_id, self.now())?;

        let mut principal = outcome.principal()?;
        for invoice_id in plan.invoice_ids.clone() {
            if !principal.is_positive() {
                break;
            }
            principal = self
                .apply_to_invoice(unit, invoice_id, principal, PaymentSource::Payment(payment_id))
                .await?;
        }
        unit.stage_payment_plan(plan)?;
        Ok(())
    }

    /// Charges a pending gateway payment
    ///
    /// A decline or gateway error leaves the payment `Failed` with a retry
    /// scheduled by the configured policy; the call itself still succeeds.
    pub async fn process_payment(&self, payment_id: PaymentId) -> Result<Payment, BillingError> {
        let account_id = self.load_payment(payment_id).await?.account_id;

        let (amount, token) = self
            .with_account_lock(account_id, || self.begin_processing(account_id, payment_id))
            .await?;

        let outcome = self.charge_gateway(&amount, &token).await;

        let payment = self
            .with_account_lock(account_id, || {
                self.finish_processing(account_id, payment_id, &outcome)
            })
            .await?;
        if payment.status == PaymentStatus::Completed {
            self.send_receipt(&payment).await;
        }
        Ok(payment)
    }

    async fn begin_processing(
        &self,
        account_id: BillingAccountId,
        payment_id: PaymentId,
    ) -> Result<(Money, String), BillingError> {
        let mut unit = self.begin(account_id).await?;
        if unit.account().is_closed() {
            return Err(BillingError::AccountClosed(account_id.to_string()));
        }
        let mut payment = self.payment_for_update(&unit, payment_id).await?;
        if !payment.method.uses_gateway() {
            return Err(BillingError::validation(format!(
                "{:?} payments are not processed through the gateway",
                payment.method
            )));
        }
        let token = payment.payment_method_token.clone().ok_or_else(|| {
            BillingError::validation(format!("payment {} has no payment method token", payment_id))
        })?;
        payment.start_processing()?;
        let amount = payment.amount;
        unit.stage_payment(payment)?;
        self.commit(unit).await?;
        Ok((amount, token))
    }

    async fn charge_gateway(&self, amount: &Money, token: &str) -> Result<GatewayCharge, PortError> {
        let limit = Duration::from_millis(self.config.gateway_timeout_ms);
        match tokio::time::timeout(limit, self.gateway.charge(amount, token)).await {
            Ok(result) => result,
            Err(_) => Err(PortError::timeout("gateway charge", self.config.gateway_timeout_ms)),
        }
    }

    async fn finish_processing(
        &self,
        account_id: BillingAccountId,
        payment_id: PaymentId,
        outcome: &Result<GatewayCharge, PortError>,
    ) -> Result<Payment, BillingError> {
        let mut unit = self.begin(account_id).await?;
        let mut payment = self.payment_for_update(&unit, payment_id).await?;
        if payment.status != PaymentStatus::Processing {
            warn!(
                payment_id = %payment_id,
                status = ?payment.status,
                "Payment settled elsewhere while at the gateway"
            );
            return Ok(payment);
        }

        let now = self.now();
        match outcome {
            Ok(charge) => match &charge.status {
                GatewayStatus::Succeeded => {
                    payment.mark_completed(Some(charge.gateway_transaction_id.clone()))?;
                    self.settle_payment(&mut unit, &mut payment).await?;
                }
                GatewayStatus::Declined { reason } => {
                    payment.gateway_transaction_id = Some(charge.gateway_transaction_id.clone());
                    payment.mark_failed(reason.clone(), &self.config.retry_policy, now)?;
                }
            },
            Err(err) => {
                payment.mark_failed(err.to_string(), &self.config.retry_policy, now)?;
            }
        }

        unit.stage_payment(payment.clone())?;
        self.commit(unit).await?;
        Ok(payment)
    }

    /// Confirms a payment settled asynchronously (bank transfer, webhook)
    pub async fn complete_payment(
        &self,
        payment_id: PaymentId,
        gateway_transaction_id: Option<String>,
    ) -> Result<Payment, BillingError> {
        let account_id = self.load_payment(payment_id).await?.account_id;
        let gateway_transaction_id = &gateway_transaction_id;
        let payment = self
            .with_account_lock(account_id, || async move {
                let mut unit = self.begin(account_id).await?;
                let mut payment = self.payment_for_update(&unit, payment_id).await?;
                if payment.status == PaymentStatus::Pending {
                    payment.start_processing()?;
                }
                payment.mark_completed(gateway_transaction_id.clone())?;
                self.settle_payment(&mut unit, &mut payment).await?;
                unit.stage_payment(payment.clone())?;
                self.commit(unit).await?;
                Ok(payment)
            })
            .await?;
        self.send_receipt(&payment).await;
        Ok(payment)
    }

    /// Records a failure reported outside the gateway call
    pub async fn fail_payment(
        &self,
        payment_id: PaymentId,
        reason: &str,
    ) -> Result<Payment, BillingError> {
        self.update_payment(payment_id, |service, payment| {
            if payment.status == PaymentStatus::Pending {
                payment.start_processing()?;
            }
            payment.mark_failed(reason, &service.config.retry_policy, service.now())
        })
        .await
    }

    pub async fn cancel_payment(&self, payment_id: PaymentId) -> Result<Payment, BillingError> {
        self.update_payment(payment_id, |_, payment| payment.cancel())
            .await
    }

    /// Moves a failed payment back to `Pending` and charges it again
    pub async fn retry_payment(&self, payment_id: PaymentId) -> Result<Payment, BillingError> {
        let payment = self
            .update_payment(payment_id, |_, payment| payment.retry())
            .await?;
        if payment.method.uses_gateway() {
            return self.process_payment(payment_id).await;
        }
        Ok(payment)
    }

    /// Retries every failed payment whose backoff has elapsed
    pub async fn run_payment_retries(&self) -> Result<RetryReport, BillingError> {
        let mut report = RetryReport::default();
        for payment in self.store.payments_due_for_retry(self.now()).await? {
            report.attempted += 1;
            match self.retry_payment(payment.id).await {
                Ok(p) if p.status == PaymentStatus::Completed => report.succeeded += 1,
                Ok(_) => report.failed += 1,
                Err(err) => {
                    warn!(payment_id = %payment.id, error = %err, "Payment retry failed");
                    report.errors += 1;
                }
            }
        }
        info!(
            attempted = report.attempted,
            succeeded = report.succeeded,
            failed = report.failed,
            "Payment retry pass finished"
        );
        Ok(report)
    }

    /// Refunds all or part of a completed payment
    ///
    /// Gateway payments are refunded in three steps: the amount is reserved
    /// on the payment under the account lock, the gateway refunds it with
    /// no lock held, then the refund is recorded (or the hold released if
    /// the gateway refused). A full refund reverses the payment's ledger
    /// entry; a partial refund posts a debit.
    pub async fn refund_payment(
        &self,
        payment_id: PaymentId,
        amount: Option<Money>,
        reason: &str,
    ) -> Result<Payment, BillingError> {
        let payment = self.load_payment(payment_id).await?;
        let account_id = payment.account_id;
        let gateway_id = match payment.gateway_transaction_id {
            Some(id) if payment.method.uses_gateway() => id,
            _ => {
                return self
                    .with_account_lock(account_id, || {
                        let requested = RefundAmount::Requested(amount);
                        self.refund_once(account_id, payment_id, requested, reason)
                    })
                    .await;
            }
        };

        let amount = self
            .with_account_lock(account_id, || {
                self.reserve_refund(account_id, payment_id, amount)
            })
            .await?;

        let limit = Duration::from_millis(self.config.gateway_timeout_ms);
        let call = self.gateway.refund(&gateway_id, &amount);
        let outcome = match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => Err(PortError::timeout("gateway refund", self.config.gateway_timeout_ms)),
        };
        let refund = match outcome {
            Ok(refund) => refund,
            Err(err) => {
                warn!(
                    payment_id = %payment_id,
                    error = %err,
                    "Gateway refund failed, releasing hold"
                );
                self.with_account_lock(account_id, || {
                    self.release_refund(account_id, payment_id, amount)
                })
                .await?;
                return Err(BillingError::External(err));
            }
        };
        info!(payment_id = %payment_id, refund_id = %refund.refund_id, "Gateway refund issued");

        self.with_account_lock(account_id, || {
            self.refund_once(account_id, payment_id, RefundAmount::Reserved(amount), reason)
        })
        .await
        .map_err(|err| {
            error!(
                payment_id = %payment_id,
                refund_id = %refund.refund_id,
                amount = %amount,
                error = %err,
                "Gateway refund issued but not recorded, hold kept on the payment"
            );
            err
        })
    }

    async fn reserve_refund(
        &self,
        account_id: BillingAccountId,
        payment_id: PaymentId,
        requested: Option<Money>,
    ) -> Result<Money, BillingError> {
        let mut unit = self.begin(account_id).await?;
        if unit.account().is_closed() {
            return Err(BillingError::AccountClosed(account_id.to_string()));
        }
        let mut payment = self.payment_for_update(&unit, payment_id).await?;
        let amount = refund_amount(&payment, requested)?;
        payment.reserve_refund(&amount)?;
        unit.stage_payment(payment)?;
        self.commit(unit).await?;
        Ok(amount)
    }

    async fn release_refund(
        &self,
        account_id: BillingAccountId,
        payment_id: PaymentId,
        amount: Money,
    ) -> Result<(), BillingError> {
        let mut unit = self.begin(account_id).await?;
        let mut payment = self.payment_for_update(&unit, payment_id).await?;
        payment.release_refund(&amount)?;
        unit.stage_payment(payment)?;
        self.commit(unit).await
    }

    async fn refund_once(
        &self,
        account_id: BillingAccountId,
        payment_id: PaymentId,
        amount: RefundAmount,
        reason: &str,
    ) -> Result<Payment, BillingError> {
        let mut unit = self.begin(account_id).await?;
        let mut payment = self.payment_for_update(&unit, payment_id).await?;
        let amount = match amount {
            RefundAmount::Requested(requested) => {
                if unit.account().is_closed() {
                    return Err(BillingError::AccountClosed(account_id.to_string()));
                }
                refund_amount(&payment, requested)?
            }
            RefundAmount::Reserved(amount) => {
                payment.release_refund(&amount)?;
                amount
            }
        };
        let whole_payment = payment.refunded_amount.is_zero() && amount == payment.net_amount()?;
        payment.record_refund(&amount)?;

        let ledger_id = payment.ledger_transaction_id.ok_or_else(|| {
            BillingError::validation(format!("payment {} was never applied", payment_id))
        })?;
        let original = self
            .store
            .find_entry(ledger_id)
            .await?
            .ok_or_else(|| BillingError::EntryNotFound(ledger_id.to_string()))?;
        if whole_payment && !original.is_reversed {
            unit.reverse(original, &format!("refund: {}", reason))?;
        } else {
            unit.post(
                LedgerPosting::debit(amount, BillingCategory::Refund)
                    .describe(format!("Partial refund of payment {}: {}", payment_id, reason))
                    .reference(LedgerReference::Payment(payment_id))
                    .idempotency_key(format!("refund:{}:{}", payment_id, payment.refunded_amount))
                    .effective_at(self.now()),
            )?;
        }

        if let PaymentTarget::Invoice(invoice_id) = payment.target {
            let mut invoice = self.invoice_for_update(&unit, invoice_id).await?;
            let source = PaymentSource::Payment(payment_id);
            if invoice.payments.iter().any(|p| p.source == source) {
                invoice.record_refund(source, amount)?;
                unit.stage_invoice(invoice)?;
            }
        }

        unit.stage_payment(payment.clone())?;
        self.commit(unit).await?;
        info!(payment_id = %payment_id, amount = %amount, reason, "Payment refunded");
        Ok(payment)
    }

    async fn update_payment<F>(&self, payment_id: PaymentId, change: F) -> Result<Payment, BillingError>
    where
        F: Fn(&Self, &mut Payment) -> Result<(), BillingError>,
    {
        let account_id = self.load_payment(payment_id).await?.account_id;
        let change = &change;
        self.with_account_lock(account_id, || async move {
            let mut unit = self.begin(account_id).await?;
            let mut payment = self.payment_for_update(&unit, payment_id).await?;
            change(self, &mut payment)?;
            unit.stage_payment(payment.clone())?;
            self.commit(unit).await?;
            Ok(payment)
        })
        .await
    }

    /// Sends a payment receipt; delivery failures are logged, not returned
    async fn send_receipt(&self, payment: &Payment) {
        let mut context = NotificationContext::new();
        context.insert("payment_id".to_string(), payment.id.to_string());
        context.insert("amount".to_string(), payment.amount.to_string());
        context.insert("method".to_string(), format!("{:?}", payment.method));
        match self
            .notifier
            .send(payment.account_id, "payment_receipt", &context)
            .await
        {
            Ok(status) => info!(payment_id = %payment.id, status = ?status, "Payment receipt sent"),
            Err(err) => warn!(payment_id = %payment.id, error = %err, "Payment receipt not delivered"),
        }
    }
}

/// How much a refund moves: asked for now, or already held on the payment
#[derive(Debug, Clone, Copy)]
enum RefundAmount {
    Requested(Option<Money>),
    Reserved(Money),
}

/// The refund amount for a request; `None` means everything refundable
fn refund_amount(payment: &Payment, requested: Option<Money>) -> Result<Money, BillingError> {
    if payment.status != PaymentStatus::Completed {
        return Err(BillingError::transition(
            "payment",
            payment.status,
            PaymentStatus::Refunded,
        ));
    }
    if matches!(payment.target, PaymentTarget::PaymentPlan(_)) {
        return Err(BillingError::validation(
            "payments made under a payment plan cannot be refunded",
        ));
    }
    match requested {
        Some(amount) => Ok(amount),
        None => payment.refundable(),
    }
}
