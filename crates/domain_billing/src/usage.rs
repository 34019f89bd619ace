//! Usage records to invoice lines

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::debug;

use core_kernel::DateRange;

use crate::account::BillingAccount;
use crate::config::UsageRate;
use crate::error::BillingError;
use crate::invoice::{InvoiceItem, InvoiceItemType};
use crate::ports::{LineItemSource, UsageRecord, UsageSource};

/// Line item source backed by the usage feed and a rate table
pub struct UsageLineItems {
    source: Arc<dyn UsageSource>,
    rates: HashMap<String, UsageRate>,
}

impl UsageLineItems {
    pub fn new(source: Arc<dyn UsageSource>, rates: HashMap<String, UsageRate>) -> Self {
        Self { source, rates }
    }

    /// Prices usage records for `period`
    ///
    /// Records entirely outside the period are skipped. Recurring unit
    /// types are prorated by the share of the period the record covers.
    pub fn price_records(
        &self,
        account: &BillingAccount,
        records: &[UsageRecord],
        period: &DateRange,
    ) -> Result<Vec<InvoiceItem>, BillingError> {
        let mut items = Vec::with_capacity(records.len());
        for record in records {
            if record.account_id != account.id() {
                return Err(BillingError::validation(format!(
                    "usage record for {} returned for account {}",
                    record.account_id,
                    account.id()
                )));
            }
            let rate = self.rates.get(&record.unit_type).ok_or_else(|| {
                BillingError::validation(format!("no rate for unit type '{}'", record.unit_type))
            })?;
            let window = DateRange::new(record.period_start, record.period_end)?;
            if !window.overlaps(period) {
                debug!(unit_type = %record.unit_type, "Usage record outside billing period");
                continue;
            }
            if record.quantity <= Decimal::ZERO {
                continue;
            }

            let item_type = if rate.recurring {
                InvoiceItemType::Subscription
            } else {
                InvoiceItemType::Usage
            };
            let mut item = InvoiceItem::new(
                rate.description.clone(),
                item_type,
                record.quantity,
                rate.price(account.currency()),
            )?
            .with_discount(rate.discount_percentage)?
            .with_tax(rate.tax_percentage)?;

            if rate.recurring {
                item = item.for_service_period(window, period)?;
            } else {
                item.service_period = Some(window);
            }
            items.push(item);
        }
        Ok(items)
    }
}

#[async_trait]
impl LineItemSource for UsageLineItems {
    async fn line_items(
        &self,
        account: &BillingAccount,
        period: &DateRange,
    ) -> Result<Vec<InvoiceItem>, BillingError> {
        let records = self
            .source
            .usage_for(account.id(), period)
            .await
            .map_err(BillingError::External)?;
        self.price_records(account, &records, period)
    }
}
