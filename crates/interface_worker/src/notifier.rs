//! Log-backed notification dispatcher
//!
//! Writes every dunning notice and receipt to the structured log under the
//! `billing::notifications` target, where a log shipper forwards them to
//! the mail/SMS pipeline.

use async_trait::async_trait;
use tracing::info;

use core_kernel::{BillingAccountId, DomainPort, PortError};
use domain_billing::{DeliveryStatus, NotificationContext, NotificationDispatcher};

#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotificationDispatcher;

impl LogNotificationDispatcher {
    pub fn new() -> Self {
        Self
    }
}

impl DomainPort for LogNotificationDispatcher {}

#[async_trait]
impl NotificationDispatcher for LogNotificationDispatcher {
    async fn send(
        &self,
        account_id: BillingAccountId,
        template: &str,
        context: &NotificationContext,
    ) -> Result<DeliveryStatus, PortError> {
        if template.trim().is_empty() {
            return Err(PortError::validation("notification template is empty"));
        }
        let rendered = serde_json::to_string(context)
            .map_err(|e| PortError::internal(format!("cannot render notification context: {}", e)))?;
        info!(
            target: "billing::notifications",
            account_id = %account_id,
            template,
            context = %rendered,
            "Notification dispatched"
        );
        Ok(DeliveryStatus::Delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_logged_notices_count_as_delivered() {
        let mut context = NotificationContext::new();
        context.insert("amount_due".into(), "120.00 USD".into());

        let status = LogNotificationDispatcher::new()
            .send(BillingAccountId::new(), "dunning_reminder", &context)
            .await
            .unwrap();
        assert_eq!(status, DeliveryStatus::Delivered);
    }

    #[tokio::test]
    async fn test_blank_template_is_rejected() {
        let result = LogNotificationDispatcher::new()
            .send(BillingAccountId::new(), "  ", &NotificationContext::new())
            .await;
        assert!(matches!(result, Err(PortError::Validation { .. })));
    }
}
