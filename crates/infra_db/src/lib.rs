//! Infrastructure Database Layer
//!
//! PostgreSQL adapters for the billing engine's storage ports, built on
//! SQLx.
//!
//! # Storage Model
//!
//! Aggregates (accounts, invoices, payments, credit notes, dunning cases,
//! payment plans) are stored as JSONB documents alongside the columns used
//! for lookups and ordering. Ledger entries and balance snapshots are
//! append-only rows; only the reversal flag of an entry is ever updated.
//!
//! Every commit runs in one transaction. Account rows carry a version and
//! are updated with `WHERE version = $expected`, so a writer that loaded a
//! stale account gets a conflict instead of overwriting newer state.
//!
//! # Example
//!
//! ```rust,ignore
//! use infra_db::{create_pool, run_migrations, DatabaseConfig, PgBillingStore};
//!
//! let pool = create_pool(DatabaseConfig::new("postgres://localhost/billing")).await?;
//! run_migrations(&pool).await?;
//! let store = Arc::new(PgBillingStore::new(pool));
//! ```

pub mod error;
pub mod pool;
pub mod store;
pub mod usage;

pub use error::DatabaseError;
pub use pool::{create_pool, create_pool_from_url, run_migrations, DatabaseConfig, DatabasePool};
pub use store::PgBillingStore;
pub use usage::PgUsageSource;
