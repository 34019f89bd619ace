//! Usage feed backed by the `usage_records` table
//!
//! Accounting collectors write aggregated session usage here; invoice
//! generation reads it back through the [`UsageSource`] port.

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use sqlx::PgPool;
use tracing::{debug, instrument};
use uuid::Uuid;

use core_kernel::{BillingAccountId, DateRange, DomainPort, PortError};
use domain_billing::{UsageRecord, UsageSource};

use crate::error::DatabaseError;

#[derive(Debug, sqlx::FromRow)]
struct UsageRow {
    account_id: Uuid,
    period_start: NaiveDate,
    period_end: NaiveDate,
    quantity: Decimal,
    unit_type: String,
}

impl From<UsageRow> for UsageRecord {
    fn from(row: UsageRow) -> Self {
        UsageRecord {
            account_id: BillingAccountId::from(row.account_id),
            period_start: row.period_start,
            period_end: row.period_end,
            quantity: row.quantity,
            unit_type: row.unit_type,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgUsageSource {
    pool: PgPool,
}

impl PgUsageSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Appends one aggregated usage record
    #[instrument(skip(self, record), fields(account_id = %record.account_id, unit_type = %record.unit_type))]
    pub async fn record(&self, record: &UsageRecord) -> Result<(), PortError> {
        if record.period_start > record.period_end {
            return Err(PortError::validation("usage period starts after it ends"));
        }
        sqlx::query(
            r#"
            INSERT INTO usage_records (usage_id, account_id, period_start, period_end, quantity, unit_type)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(Uuid::from(record.account_id))
        .bind(record.period_start)
        .bind(record.period_end)
        .bind(record.quantity)
        .bind(&record.unit_type)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from)?;
        Ok(())
    }
}

impl DomainPort for PgUsageSource {}

#[async_trait]
impl UsageSource for PgUsageSource {
    /// Records overlapping `period`; callers prorate partial overlaps
    #[instrument(skip(self), fields(account_id = %account_id))]
    async fn usage_for(
        &self,
        account_id: BillingAccountId,
        period: &DateRange,
    ) -> Result<Vec<UsageRecord>, PortError> {
        let rows = sqlx::query_as::<_, UsageRow>(
            r#"
            SELECT account_id, period_start, period_end, quantity, unit_type
            FROM usage_records
            WHERE account_id = $1 AND period_end >= $2 AND period_start <= $3
            ORDER BY period_start, unit_type
            "#,
        )
        .bind(Uuid::from(account_id))
        .bind(period.start)
        .bind(period.end)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from)?;

        debug!(records = rows.len(), "Loaded usage records");
        Ok(rows.into_iter().map(UsageRecord::from).collect())
    }
}
