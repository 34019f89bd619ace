//! PostgreSQL billing store
//!
//! Each aggregate is stored as a JSONB document next to the handful of
//! columns the engine filters and orders by. A commit writes the whole
//! unit of work in one transaction, guarded by the account's version.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use core_kernel::{
    AdapterHealth, BillingAccountId, CreditNoteId, DomainPort, DunningCaseId, HealthCheckResult,
    HealthCheckable, InvoiceId, PaymentId, PaymentPlanId, PortError, TransactionId,
};
use domain_billing::{
    BalanceSnapshot, BillingAccount, BillingStore, CreditNote, DunningCase, DunningStatus,
    Invoice, LedgerEntry, Payment, PaymentPlan, UnitOfWork,
};

use crate::error::DatabaseError;

/// PostgreSQL-backed implementation of [`BillingStore`]
#[derive(Debug, Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_one_doc<T: DeserializeOwned>(
        &self,
        sql: &str,
        id: Uuid,
    ) -> Result<Option<T>, DatabaseError> {
        let doc = sqlx::query_scalar::<_, Value>(sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        doc.map(from_document).transpose()
    }

    async fn fetch_docs_for_account<T: DeserializeOwned>(
        &self,
        sql: &str,
        account_id: BillingAccountId,
    ) -> Result<Vec<T>, DatabaseError> {
        sqlx::query_scalar::<_, Value>(sql)
            .bind(Uuid::from(account_id))
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(from_document)
            .collect()
    }

    async fn write_unit(&self, unit: &UnitOfWork) -> Result<(), DatabaseError> {
        let mut tx = self.pool.begin().await?;

        write_account(&mut tx, unit).await?;
        for entry in unit.entries() {
            insert_entry(&mut tx, entry).await?;
        }
        for mark in unit.reversals() {
            let updated = sqlx::query(
                r#"
                UPDATE ledger_entries
                SET is_reversed = TRUE,
                    document = jsonb_set(
                        jsonb_set(document, '{is_reversed}', 'true'::jsonb),
                        '{reversed_by}', to_jsonb($2::uuid)
                    )
                WHERE transaction_id = $1 AND is_reversed = FALSE
                "#,
            )
            .bind(Uuid::from(mark.original))
            .bind(Uuid::from(mark.reversed_by))
            .execute(&mut *tx)
            .await?;
            if updated.rows_affected() == 0 {
                return Err(DatabaseError::VersionConflict(format!(
                    "entry {} already reversed or missing",
                    mark.original
                )));
            }
        }
        for snapshot in unit.snapshots() {
            insert_snapshot(&mut tx, snapshot).await?;
        }
        for invoice in unit.invoices() {
            upsert_invoice(&mut tx, invoice).await?;
        }
        for payment in unit.payments() {
            upsert_payment(&mut tx, payment).await?;
        }
        for note in unit.credit_notes() {
            upsert_document(
                &mut tx,
                "credit_notes",
                "credit_note_id",
                Uuid::from(note.id),
                note.account_id,
                &label(&note.status)?,
                note.created_at,
                note,
            )
            .await?;
        }
        for case in unit.dunning_cases() {
            upsert_document(
                &mut tx,
                "dunning_cases",
                "case_id",
                Uuid::from(case.id),
                case.account_id,
                &label(&case.status)?,
                case.opened_at,
                case,
            )
            .await?;
        }
        for plan in unit.payment_plans() {
            upsert_document(
                &mut tx,
                "payment_plans",
                "plan_id",
                Uuid::from(plan.id),
                plan.account_id,
                &label(&plan.status)?,
                plan.created_at,
                plan,
            )
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

impl DomainPort for PgBillingStore {}

#[async_trait]
impl HealthCheckable for PgBillingStore {
    async fn health_check(&self) -> HealthCheckResult {
        let start = std::time::Instant::now();
        let result = sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await;
        let latency_ms = start.elapsed().as_millis() as u64;

        let (status, message) = match result {
            Ok(_) => (AdapterHealth::Healthy, None),
            Err(e) => (AdapterHealth::Unhealthy, Some(format!("Database error: {}", e))),
        };
        HealthCheckResult {
            adapter_id: "postgres-billing-store".to_string(),
            status,
            latency_ms,
            message,
            checked_at: Utc::now(),
        }
    }
}

#[async_trait]
impl BillingStore for PgBillingStore {
    #[instrument(skip(self), fields(account_id = %id))]
    async fn load_account(
        &self,
        id: BillingAccountId,
    ) -> Result<Option<BillingAccount>, PortError> {
        Ok(self
            .fetch_one_doc("SELECT document FROM billing_accounts WHERE account_id = $1", id.into())
            .await?)
    }

    #[instrument(skip(self))]
    async fn find_account_by_number(
        &self,
        account_number: &str,
    ) -> Result<Option<BillingAccount>, PortError> {
        let doc = sqlx::query_scalar::<_, Value>(
            "SELECT document FROM billing_accounts WHERE account_number = $1",
        )
        .bind(account_number)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from)?;
        Ok(doc.map(from_document).transpose()?)
    }

    async fn list_account_ids(&self) -> Result<Vec<BillingAccountId>, PortError> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            "SELECT account_id FROM billing_accounts ORDER BY account_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from)?;
        Ok(ids.into_iter().map(BillingAccountId::from).collect())
    }

    async fn find_entry(&self, id: TransactionId) -> Result<Option<LedgerEntry>, PortError> {
        Ok(self
            .fetch_one_doc("SELECT document FROM ledger_entries WHERE transaction_id = $1", id.into())
            .await?)
    }

    async fn find_entry_by_key(
        &self,
        account_id: BillingAccountId,
        key: &str,
    ) -> Result<Option<LedgerEntry>, PortError> {
        let doc = sqlx::query_scalar::<_, Value>(
            "SELECT document FROM ledger_entries WHERE account_id = $1 AND idempotency_key = $2",
        )
        .bind(Uuid::from(account_id))
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from)?;
        Ok(doc.map(from_document).transpose()?)
    }

    #[instrument(skip(self), fields(account_id = %account_id))]
    async fn ledger_entries(
        &self,
        account_id: BillingAccountId,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<LedgerEntry>, PortError> {
        let docs = sqlx::query_scalar::<_, Value>(
            r#"
            SELECT document FROM ledger_entries
            WHERE account_id = $1
              AND ($2::timestamptz IS NULL OR effective_date >= $2)
              AND ($3::timestamptz IS NULL OR effective_date <= $3)
            ORDER BY sequence
            "#,
        )
        .bind(Uuid::from(account_id))
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from)?;
        Ok(docs
            .into_iter()
            .map(from_document)
            .collect::<Result<Vec<_>, DatabaseError>>()?)
    }

    async fn balance_snapshots(
        &self,
        account_id: BillingAccountId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<BalanceSnapshot>, PortError> {
        let docs = sqlx::query_scalar::<_, Value>(
            r#"
            SELECT document FROM balance_snapshots
            WHERE account_id = $1 AND recorded_at BETWEEN $2 AND $3
            ORDER BY sequence
            "#,
        )
        .bind(Uuid::from(account_id))
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from)?;
        Ok(docs
            .into_iter()
            .map(from_document)
            .collect::<Result<Vec<_>, DatabaseError>>()?)
    }

    async fn load_invoice(&self, id: InvoiceId) -> Result<Option<Invoice>, PortError> {
        Ok(self
            .fetch_one_doc("SELECT document FROM invoices WHERE invoice_id = $1", id.into())
            .await?)
    }

    async fn find_invoice_by_number(&self, number: &str) -> Result<Option<Invoice>, PortError> {
        let doc = sqlx::query_scalar::<_, Value>(
            "SELECT document FROM invoices WHERE invoice_number = $1",
        )
        .bind(number)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from)?;
        Ok(doc.map(from_document).transpose()?)
    }

    async fn invoices_for_account(
        &self,
        account_id: BillingAccountId,
    ) -> Result<Vec<Invoice>, PortError> {
        Ok(self
            .fetch_docs_for_account(
                "SELECT document FROM invoices WHERE account_id = $1 ORDER BY invoice_date, invoice_id",
                account_id,
            )
            .await?)
    }

    async fn load_payment(&self, id: PaymentId) -> Result<Option<Payment>, PortError> {
        Ok(self
            .fetch_one_doc("SELECT document FROM payments WHERE payment_id = $1", id.into())
            .await?)
    }

    async fn find_payment_by_key(
        &self,
        account_id: BillingAccountId,
        key: &str,
    ) -> Result<Option<Payment>, PortError> {
        let doc = sqlx::query_scalar::<_, Value>(
            "SELECT document FROM payments WHERE account_id = $1 AND idempotency_key = $2",
        )
        .bind(Uuid::from(account_id))
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from)?;
        Ok(doc.map(from_document).transpose()?)
    }

    async fn payments_for_account(
        &self,
        account_id: BillingAccountId,
    ) -> Result<Vec<Payment>, PortError> {
        Ok(self
            .fetch_docs_for_account(
                "SELECT document FROM payments WHERE account_id = $1 ORDER BY created_at, payment_id",
                account_id,
            )
            .await?)
    }

    #[instrument(skip(self))]
    async fn payments_due_for_retry(&self, now: DateTime<Utc>) -> Result<Vec<Payment>, PortError> {
        let docs = sqlx::query_scalar::<_, Value>(
            r#"
            SELECT document FROM payments
            WHERE next_retry_date IS NOT NULL AND next_retry_date <= $1
            ORDER BY next_retry_date, payment_id
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from)?;

        let mut due = Vec::with_capacity(docs.len());
        for doc in docs {
            let payment: Payment = from_document(doc)?;
            if payment.is_due_for_retry(now) {
                due.push(payment);
            }
        }
        debug!(count = due.len(), "Payments due for retry");
        Ok(due)
    }

    async fn load_credit_note(&self, id: CreditNoteId) -> Result<Option<CreditNote>, PortError> {
        Ok(self
            .fetch_one_doc("SELECT document FROM credit_notes WHERE credit_note_id = $1", id.into())
            .await?)
    }

    async fn credit_notes_for_account(
        &self,
        account_id: BillingAccountId,
    ) -> Result<Vec<CreditNote>, PortError> {
        Ok(self
            .fetch_docs_for_account(
                "SELECT document FROM credit_notes WHERE account_id = $1 ORDER BY created_at, credit_note_id",
                account_id,
            )
            .await?)
    }

    async fn load_dunning_case(
        &self,
        id: DunningCaseId,
    ) -> Result<Option<DunningCase>, PortError> {
        Ok(self
            .fetch_one_doc("SELECT document FROM dunning_cases WHERE case_id = $1", id.into())
            .await?)
    }

    async fn dunning_cases_for_account(
        &self,
        account_id: BillingAccountId,
    ) -> Result<Vec<DunningCase>, PortError> {
        Ok(self
            .fetch_docs_for_account(
                "SELECT document FROM dunning_cases WHERE account_id = $1 ORDER BY sort_at, case_id",
                account_id,
            )
            .await?)
    }

    async fn active_dunning_cases(&self) -> Result<Vec<DunningCase>, PortError> {
        let docs = sqlx::query_scalar::<_, Value>(
            "SELECT document FROM dunning_cases WHERE status = $1 ORDER BY sort_at, case_id",
        )
        .bind(label(&DunningStatus::Active)?)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from)?;
        Ok(docs
            .into_iter()
            .map(from_document)
            .collect::<Result<Vec<_>, DatabaseError>>()?)
    }

    async fn load_payment_plan(
        &self,
        id: PaymentPlanId,
    ) -> Result<Option<PaymentPlan>, PortError> {
        Ok(self
            .fetch_one_doc("SELECT document FROM payment_plans WHERE plan_id = $1", id.into())
            .await?)
    }

    async fn payment_plans_for_account(
        &self,
        account_id: BillingAccountId,
    ) -> Result<Vec<PaymentPlan>, PortError> {
        Ok(self
            .fetch_docs_for_account(
                "SELECT document FROM payment_plans WHERE account_id = $1 ORDER BY sort_at, plan_id",
                account_id,
            )
            .await?)
    }

    #[instrument(
        skip(self, unit),
        fields(
            account_id = %unit.account_id(),
            expected_version = ?unit.expected_version(),
            entries = unit.entries().len()
        )
    )]
    async fn commit(&self, unit: UnitOfWork) -> Result<(), PortError> {
        match self.write_unit(&unit).await {
            Ok(()) => {
                debug!("Unit of work committed");
                Ok(())
            }
            Err(err) => {
                if err.is_conflict() {
                    debug!(error = %err, "Unit of work lost a version race");
                } else {
                    warn!(error = %err, "Unit of work commit failed");
                }
                Err(err.into())
            }
        }
    }
}

/// Inserts a new account or advances an existing one from its expected version
async fn write_account(
    tx: &mut Transaction<'_, Postgres>,
    unit: &UnitOfWork,
) -> Result<(), DatabaseError> {
    let account = unit.committed_account();
    let document = to_document(&account)?;
    let status = label(&account.status())?;

    let Some(expected) = unit.expected_version() else {
        sqlx::query(
            r#"
            INSERT INTO billing_accounts (account_id, account_number, status, version, document, updated_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            "#,
        )
        .bind(Uuid::from(account.id()))
        .bind(account.account_number())
        .bind(&status)
        .bind(to_db_version(account.version())?)
        .bind(document)
        .execute(&mut **tx)
        .await?;
        return Ok(());
    };

    let updated = sqlx::query(
        r#"
        UPDATE billing_accounts
        SET status = $2, version = $3, document = $4, updated_at = NOW()
        WHERE account_id = $1 AND version = $5
        "#,
    )
    .bind(Uuid::from(account.id()))
    .bind(&status)
    .bind(to_db_version(account.version())?)
    .bind(document)
    .bind(to_db_version(expected)?)
    .execute(&mut **tx)
    .await?;

    if updated.rows_affected() == 0 {
        return Err(DatabaseError::VersionConflict(format!(
            "account {} is no longer at version {}",
            account.id(),
            expected
        )));
    }
    Ok(())
}

async fn insert_entry(
    tx: &mut Transaction<'_, Postgres>,
    entry: &LedgerEntry,
) -> Result<(), DatabaseError> {
    sqlx::query(
        r#"
        INSERT INTO ledger_entries (
            transaction_id, account_id, sequence, idempotency_key,
            effective_date, is_reversed, document
        ) VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(Uuid::from(entry.transaction_id))
    .bind(Uuid::from(entry.account_id))
    .bind(to_db_version(entry.sequence)?)
    .bind(entry.idempotency_key.as_deref())
    .bind(entry.effective_date)
    .bind(entry.is_reversed)
    .bind(to_document(entry)?)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn insert_snapshot(
    tx: &mut Transaction<'_, Postgres>,
    snapshot: &BalanceSnapshot,
) -> Result<(), DatabaseError> {
    sqlx::query(
        r#"
        INSERT INTO balance_snapshots (snapshot_id, account_id, transaction_id, sequence, recorded_at, document)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(Uuid::from(snapshot.id))
    .bind(Uuid::from(snapshot.account_id))
    .bind(Uuid::from(snapshot.transaction_id))
    .bind(to_db_version(snapshot.sequence)?)
    .bind(snapshot.recorded_at)
    .bind(to_document(snapshot)?)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn upsert_invoice(
    tx: &mut Transaction<'_, Postgres>,
    invoice: &Invoice,
) -> Result<(), DatabaseError> {
    sqlx::query(
        r#"
        INSERT INTO invoices (invoice_id, account_id, invoice_number, invoice_date, status, document, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, NOW())
        ON CONFLICT (invoice_id) DO UPDATE
        SET status = EXCLUDED.status, document = EXCLUDED.document, updated_at = NOW()
        "#,
    )
    .bind(Uuid::from(invoice.id))
    .bind(Uuid::from(invoice.account_id))
    .bind(&invoice.invoice_number)
    .bind(invoice.invoice_date)
    .bind(label(&invoice.status)?)
    .bind(to_document(invoice)?)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn upsert_payment(
    tx: &mut Transaction<'_, Postgres>,
    payment: &Payment,
) -> Result<(), DatabaseError> {
    sqlx::query(
        r#"
        INSERT INTO payments (
            payment_id, account_id, idempotency_key, status,
            next_retry_date, created_at, document, updated_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
        ON CONFLICT (payment_id) DO UPDATE
        SET status = EXCLUDED.status,
            next_retry_date = EXCLUDED.next_retry_date,
            document = EXCLUDED.document,
            updated_at = NOW()
        "#,
    )
    .bind(Uuid::from(payment.id))
    .bind(Uuid::from(payment.account_id))
    .bind(payment.idempotency_key.as_deref())
    .bind(label(&payment.status)?)
    .bind(payment.next_retry_date)
    .bind(payment.created_at)
    .bind(to_document(payment)?)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Upserts an aggregate into one of the tables sharing the
/// `(id, account_id, status, sort_at, document)` layout
#[allow(clippy::too_many_arguments)]
async fn upsert_document<T: Serialize>(
    tx: &mut Transaction<'_, Postgres>,
    table: &'static str,
    id_column: &'static str,
    id: Uuid,
    account_id: BillingAccountId,
    status: &str,
    sort_at: DateTime<Utc>,
    aggregate: &T,
) -> Result<(), DatabaseError> {
    let sql = format!(
        r#"
        INSERT INTO {table} ({id_column}, account_id, status, sort_at, document, updated_at)
        VALUES ($1, $2, $3, $4, $5, NOW())
        ON CONFLICT ({id_column}) DO UPDATE
        SET status = EXCLUDED.status, document = EXCLUDED.document, updated_at = NOW()
        "#
    );
    sqlx::query(&sql)
        .bind(id)
        .bind(Uuid::from(account_id))
        .bind(status)
        .bind(sort_at)
        .bind(to_document(aggregate)?)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

fn to_document<T: Serialize>(value: &T) -> Result<Value, DatabaseError> {
    Ok(serde_json::to_value(value)?)
}

fn from_document<T: DeserializeOwned>(document: Value) -> Result<T, DatabaseError> {
    Ok(serde_json::from_value(document)?)
}

/// The serialized name of a unit enum variant, as stored in `status` columns
pub(crate) fn label<T: Serialize>(value: &T) -> Result<String, DatabaseError> {
    match serde_json::to_value(value)? {
        Value::String(name) => Ok(name),
        other => Ok(other.to_string()),
    }
}

/// Versions and sequences are `BIGINT` columns
pub(crate) fn to_db_version(value: u64) -> Result<i64, DatabaseError> {
    i64::try_from(value)
        .map_err(|_| DatabaseError::ConstraintViolation(format!("{} exceeds BIGINT", value)))
}
