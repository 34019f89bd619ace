//! Credit notes
//!
//! A credit note is an approval-gated credit to an account balance,
//! optionally tied to an invoice. Applying it writes exactly one ledger
//! credit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use core_kernel::{BillingAccountId, CreditNoteId, InvoiceId, Money, TransactionId};

use crate::error::BillingError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditNoteStatus {
    Active,
    Applied,
    Voided,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditNote {
    pub id: CreditNoteId,
    pub account_id: BillingAccountId,
    /// Invoice whose balance the credit reduces, if any
    pub invoice_id: Option<InvoiceId>,
    pub amount: Money,
    pub reason: String,
    pub status: CreditNoteStatus,
    pub requires_approval: bool,
    pub approved_by: Option<String>,
    pub approved_date: Option<DateTime<Utc>>,
    /// Apply as soon as the note is approved
    pub auto_apply: bool,
    pub applied_at: Option<DateTime<Utc>>,
    pub ledger_transaction_id: Option<TransactionId>,
    pub created_by: Option<String>,
    pub void_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CreditNote {
    pub fn new(
        account_id: BillingAccountId,
        amount: Money,
        reason: impl Into<String>,
    ) -> Result<Self, BillingError> {
        if !amount.is_positive() {
            return Err(BillingError::invalid_amount("credit note amount must be positive"));
        }
        let reason = reason.into();
        if reason.trim().is_empty() {
            return Err(BillingError::validation("credit note requires a reason"));
        }
        let now = Utc::now();
        Ok(Self {
            id: CreditNoteId::new_v7(),
            account_id,
            invoice_id: None,
            amount,
            reason,
            status: CreditNoteStatus::Active,
            requires_approval: true,
            approved_by: None,
            approved_date: None,
            auto_apply: false,
            applied_at: None,
            ledger_transaction_id: None,
            created_by: None,
            void_reason: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn for_invoice(mut self, invoice_id: InvoiceId) -> Self {
        self.invoice_id = Some(invoice_id);
        self
    }

    pub fn without_approval(mut self) -> Self {
        self.requires_approval = false;
        self
    }

    pub fn auto_applied(mut self) -> Self {
        self.auto_apply = true;
        self
    }

    pub fn created_by(mut self, actor: impl Into<String>) -> Self {
        self.created_by = Some(actor.into());
        self
    }

    pub fn is_approved(&self) -> bool {
        !self.requires_approval || self.approved_by.is_some()
    }

    pub fn is_applied(&self) -> bool {
        self.applied_at.is_some()
    }

    pub fn can_be_applied(&self) -> bool {
        self.status == CreditNoteStatus::Active && self.is_approved() && !self.is_applied()
    }

    /// Records approval by an administrator
    pub fn approve(&mut self, actor: &str) -> Result<(), BillingError> {
        if actor.trim().is_empty() {
            return Err(BillingError::validation("approval requires an actor id"));
        }
        if self.status != CreditNoteStatus::Active {
            return Err(BillingError::validation(format!(
                "credit note {} is {:?}",
                self.id, self.status
            )));
        }
        if self.is_approved() {
            return Err(BillingError::validation(format!(
                "credit note {} is already approved",
                self.id
            )));
        }
        let now = Utc::now();
        self.approved_by = Some(actor.to_string());
        self.approved_date = Some(now);
        self.updated_at = now;
        info!(credit_note_id = %self.id, approved_by = actor, "Credit note approved");
        Ok(())
    }

    /// Records the ledger credit the note produced
    pub fn mark_applied(&mut self, transaction_id: TransactionId) -> Result<(), BillingError> {
        if !self.can_be_applied() {
            return Err(BillingError::validation(format!(
                "credit note {} cannot be applied (status {:?}, approved {}, applied {})",
                self.id,
                self.status,
                self.is_approved(),
                self.is_applied()
            )));
        }
        let now = Utc::now();
        self.status = CreditNoteStatus::Applied;
        self.applied_at = Some(now);
        self.ledger_transaction_id = Some(transaction_id);
        self.updated_at = now;
        Ok(())
    }

    /// Active -> Voided
    pub fn void(&mut self, reason: &str) -> Result<(), BillingError> {
        if self.status != CreditNoteStatus::Active {
            return Err(BillingError::transition("credit note", self.status, CreditNoteStatus::Voided));
        }
        self.status = CreditNoteStatus::Voided;
        self.void_reason = Some(reason.to_string());
        self.updated_at = Utc::now();
        Ok(())
    }
}
