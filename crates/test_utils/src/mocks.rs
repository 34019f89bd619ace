//! In-process test doubles for the billing ports
//!
//! Each double records what it was asked to do so tests can assert on the
//! calls the service made.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use core_kernel::{BillingAccountId, DateRange, DomainPort, Money, PortError};
use domain_billing::{
    Clock, DeliveryStatus, GatewayCharge, GatewayRefund, GatewayStatus, NotificationContext,
    NotificationDispatcher, PaymentGateway, UsageRecord, UsageSource,
};

/// Clock that only moves when told to
pub struct ManualClock(Mutex<DateTime<Utc>>);

impl ManualClock {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self(Mutex::new(now))
    }

    pub fn advance(&self, by: Duration) {
        *self.0.lock().unwrap() += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.0.lock().unwrap() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap()
    }
}

/// Gateway replaying scripted outcomes; once the script runs out every
/// charge succeeds
#[derive(Default)]
pub struct MockGateway {
    outcomes: Mutex<VecDeque<Result<GatewayStatus, PortError>>>,
    charges: Mutex<Vec<(Money, String)>>,
    refunds: Mutex<Vec<(String, Money)>>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the outcome of the next unscripted charge
    pub fn then(&self, status: GatewayStatus) -> &Self {
        self.outcomes.lock().unwrap().push_back(Ok(status));
        self
    }

    pub fn then_decline(&self, reason: &str) -> &Self {
        self.then(GatewayStatus::Declined {
            reason: reason.to_string(),
        })
    }

    /// Queues a transport or processor failure
    pub fn then_fail(&self, error: PortError) -> &Self {
        self.outcomes.lock().unwrap().push_back(Err(error));
        self
    }

    pub fn charge_count(&self) -> usize {
        self.charges.lock().unwrap().len()
    }

    pub fn charges(&self) -> Vec<(Money, String)> {
        self.charges.lock().unwrap().clone()
    }

    pub fn refunds(&self) -> Vec<(String, Money)> {
        self.refunds.lock().unwrap().clone()
    }
}

impl DomainPort for MockGateway {}

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn charge(
        &self,
        amount: &Money,
        payment_method_token: &str,
    ) -> Result<GatewayCharge, PortError> {
        let outcome = self
            .outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(GatewayStatus::Succeeded));
        let mut charges = self.charges.lock().unwrap();
        charges.push((*amount, payment_method_token.to_string()));
        Ok(GatewayCharge {
            gateway_transaction_id: format!("ch_mock_{}", charges.len()),
            status: outcome?,
        })
    }

    async fn refund(
        &self,
        gateway_transaction_id: &str,
        amount: &Money,
    ) -> Result<GatewayRefund, PortError> {
        let mut refunds = self.refunds.lock().unwrap();
        refunds.push((gateway_transaction_id.to_string(), *amount));
        Ok(GatewayRefund {
            refund_id: format!("re_mock_{}", refunds.len()),
        })
    }
}

/// A notification the dispatcher was asked to send
#[derive(Debug, Clone)]
pub struct SentNotification {
    pub account_id: BillingAccountId,
    pub template: String,
    pub context: NotificationContext,
}

/// Dispatcher that records every send and answers with a fixed status
pub struct RecordingNotifier {
    status: Mutex<DeliveryStatus>,
    sent: Mutex<Vec<SentNotification>>,
}

impl Default for RecordingNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self {
            status: Mutex::new(DeliveryStatus::Delivered),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn respond_with(&self, status: DeliveryStatus) {
        *self.status.lock().unwrap() = status;
    }

    pub fn sent(&self) -> Vec<SentNotification> {
        self.sent.lock().unwrap().clone()
    }

    pub fn templates(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|n| n.template.clone())
            .collect()
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
        self.sent.lock().unwrap().push(SentNotification {
            account_id,
            template: template.to_string(),
            context: context.clone(),
        });
        Ok(self.status.lock().unwrap().clone())
    }
}

/// Usage feed backed by a fixed list of records
#[derive(Default)]
pub struct StaticUsageSource {
    records: Mutex<Vec<UsageRecord>>,
}

impl StaticUsageSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, record: UsageRecord) {
        self.records.lock().unwrap().push(record);
    }
}

impl DomainPort for StaticUsageSource {}

#[async_trait]
impl UsageSource for StaticUsageSource {
    async fn usage_for(
        &self,
        account_id: BillingAccountId,
        period: &DateRange,
    ) -> Result<Vec<UsageRecord>, PortError> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| {
                r.account_id == account_id
                    && r.period_start <= period.end
                    && r.period_end >= period.start
            })
            .cloned()
            .collect())
    }
}
