//! Test Utilities Crate
//!
//! Shared fixtures, builders, doubles and assertions for the billing
//! engine test suite.
//!
//! # Modules
//!
//! - `fixtures`: Pre-built money amounts, dates and billing periods
//! - `builders`: Builder patterns for accounts, line items and payment requests
//! - `mocks`: In-process stand-ins for the gateway, notifier, usage feed and clock
//! - `assertions`: Custom assertion helpers for money and ledgers
//! - `generators`: Property-based test data generators

pub mod fixtures;
pub mod builders;
pub mod mocks;
pub mod assertions;
pub mod generators;

pub use fixtures::*;
pub use builders::*;
pub use mocks::*;
pub use assertions::*;
pub use generators::*;
