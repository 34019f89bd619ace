//! Strongly-typed identifiers for billing entities
//!
//! Entities reference each other by id rather than by pointer (an invoice
//! knows its account id, a payment knows its invoice id). Newtype wrappers
//! around UUIDs keep those references from being mixed up.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! define_id {
    ($name:ident, $prefix:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Creates a new random identifier
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Creates a new time-ordered identifier (v7)
            pub fn new_v7() -> Self {
                Self(Uuid::now_v7())
            }

            /// Creates from an existing UUID
            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Returns the underlying UUID
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }

            /// Returns the identifier prefix for display
            pub fn prefix() -> &'static str {
                $prefix
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}-{}", $prefix, self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let uuid_str = s.strip_prefix(concat!($prefix, "-")).unwrap_or(s);
                Ok(Self(Uuid::parse_str(uuid_str)?))
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Uuid {
                id.0
            }
        }
    };
}

// Customer-side identifiers (owned by the CRM, referenced here)
define_id!(CustomerId, "CUS");

// Account and ledger identifiers
define_id!(BillingAccountId, "BAC");
define_id!(TransactionId, "TXN");
define_id!(SnapshotId, "SNP");

// Invoicing identifiers
define_id!(InvoiceId, "INV");
define_id!(InvoiceItemId, "INVI");

// Payment identifiers
define_id!(PaymentId, "PAY");
define_id!(CreditNoteId, "CRN");

// Collections identifiers
define_id!(DunningCaseId, "DUN");
define_id!(DunningActionId, "DNA");
define_id!(PaymentPlanId, "PLN");
define_id!(InstallmentId, "INS");
