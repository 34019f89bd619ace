//! Credit note commands

use tracing::info;

use core_kernel::{BillingAccountId, CreditNoteId, InvoiceId, Money, OperationMetadata};

use crate::credit_note::CreditNote;
use crate::error::BillingError;
use crate::invoice::PaymentSource;
use crate::ledger::{BillingCategory, LedgerPosting, LedgerReference};
use crate::unit_of_work::UnitOfWork;

use super::BillingService;

#[derive(Debug, Clone)]
pub struct CreditNoteRequest {
    pub account_id: BillingAccountId,
    pub amount: Money,
    pub reason: String,
    pub invoice_id: Option<InvoiceId>,
    pub requires_approval: bool,
    /// Apply as soon as the note is approved
    pub auto_apply: bool,
}

impl CreditNoteRequest {
    pub fn new(account_id: BillingAccountId, amount: Money, reason: impl Into<String>) -> Self {
        Self {
            account_id,
            amount,
            reason: reason.into(),
            invoice_id: None,
            requires_approval: true,
            auto_apply: false,
        }
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
}

impl BillingService {
    /// Issues a credit note
    ///
    /// A note that needs no approval and is marked auto-apply is applied in
    /// the same unit of work.
    pub async fn issue_credit_note(
        &self,
        request: CreditNoteRequest,
        meta: &OperationMetadata,
    ) -> Result<CreditNote, BillingError> {
        let request = &request;
        self.with_account_lock(request.account_id, || async move {
            let mut unit = self.begin(request.account_id).await?;
            if unit.account().is_closed() {
                return Err(BillingError::AccountClosed(request.account_id.to_string()));
            }

            let mut note = CreditNote::new(request.account_id, request.amount, &request.reason)?;
            if let Some(invoice_id) = request.invoice_id {
                self.invoice_for_update(&unit, invoice_id).await?;
                note = note.for_invoice(invoice_id);
            }
            if !request.requires_approval {
                note = note.without_approval();
            }
            if request.auto_apply {
                note = note.auto_applied();
            }
            if let Some(actor) = &meta.initiated_by {
                note = note.created_by(actor.clone());
            }

            if note.auto_apply && note.can_be_applied() {
                self.apply_note(&mut unit, &mut note).await?;
            }
            unit.stage_credit_note(note.clone())?;
            self.commit(unit).await?;
            info!(
                credit_note_id = %note.id,
                account_id = %note.account_id,
                amount = %note.amount,
                status = ?note.status,
                "Credit note issued"
            );
            Ok(note)
        })
        .await
    }

    /// Approves a note; requires `meta.initiated_by`
    pub async fn approve_credit_note(
        &self,
        credit_note_id: CreditNoteId,
        meta: &OperationMetadata,
    ) -> Result<CreditNote, BillingError> {
        let actor = meta
            .initiated_by
            .as_deref()
            .ok_or_else(|| BillingError::validation("approval requires an actor id"))?;
        self.update_note(credit_note_id, true, |note| note.approve(actor))
            .await
    }

    /// Applies an approved note: one ledger credit, then the linked
    /// invoice's balance is reduced
    pub async fn apply_credit_note(
        &self,
        credit_note_id: CreditNoteId,
    ) -> Result<CreditNote, BillingError> {
        self.update_note(credit_note_id, false, |_| Ok(())).await
    }

    pub async fn void_credit_note(
        &self,
        credit_note_id: CreditNoteId,
        reason: &str,
    ) -> Result<CreditNote, BillingError> {
        let account_id = self.load_note(credit_note_id).await?.account_id;
        self.with_account_lock(account_id, || async move {
            let mut unit = self.begin(account_id).await?;
            let mut note = self.load_note(credit_note_id).await?;
            note.void(reason)?;
            unit.stage_credit_note(note.clone())?;
            self.commit(unit).await?;
            Ok(note)
        })
        .await
    }

    pub(super) async fn load_note(&self, id: CreditNoteId) -> Result<CreditNote, BillingError> {
        self.store
            .load_credit_note(id)
            .await?
            .ok_or_else(|| BillingError::CreditNoteNotFound(id.to_string()))
    }

    /// Runs `change`, then applies the note; with `only_if_auto` the note
    /// is applied only when it is flagged auto-apply
    async fn update_note<F>(
        &self,
        credit_note_id: CreditNoteId,
        only_if_auto: bool,
        change: F,
    ) -> Result<CreditNote, BillingError>
    where
        F: Fn(&mut CreditNote) -> Result<(), BillingError>,
    {
        let account_id = self.load_note(credit_note_id).await?.account_id;
        let change = &change;
        self.with_account_lock(account_id, || async move {
            let mut unit = self.begin(account_id).await?;
            let mut note = self.load_note(credit_note_id).await?;
            change(&mut note)?;
            if !only_if_auto || (note.auto_apply && note.can_be_applied()) {
                self.apply_note(&mut unit, &mut note).await?;
            }
            unit.stage_credit_note(note.clone())?;
            self.commit(unit).await?;
            Ok(note)
        })
        .await
    }

    async fn apply_note(
        &self,
        unit: &mut UnitOfWork,
        note: &mut CreditNote,
    ) -> Result<(), BillingError> {
        if !note.can_be_applied() {
            return Err(BillingError::validation(format!(
                "credit note {} cannot be applied (status {:?}, approved {})",
                note.id,
                note.status,
                note.is_approved()
            )));
        }
        let entry = unit.post(
            LedgerPosting::credit(note.amount, BillingCategory::CreditNote)
                .describe(format!("Credit note: {}", note.reason))
                .reference(LedgerReference::CreditNote(note.id))
                .idempotency_key(format!("credit-note:{}", note.id))
                .effective_at(self.now()),
        )?;
        note.mark_applied(entry.transaction_id)?;

        if let Some(invoice_id) = note.invoice_id {
            self.apply_to_invoice(unit, invoice_id, note.amount, PaymentSource::CreditNote(note.id))
                .await?;
        }
        self.after_settlement(unit).await?;
        info!(credit_note_id = %note.id, amount = %note.amount, "Credit note applied");
        Ok(())
    }
}
