//! HTTP payment gateway client
//!
//! Talks to the card/wallet processor over a small JSON API:
//!
//! - `POST {base}/v1/charges` with `{amount, currency, payment_method_token}`
//!   returns `{id, status: "succeeded" | "declined", decline_reason?}`
//! - `POST {base}/v1/charges/{id}/refunds` with `{amount, currency}` returns `{id}`
//! - `GET {base}/health`
//!
//! HTTP failures map onto [`PortError`]: 429 -> `RateLimited`, 5xx ->
//! `ServiceUnavailable`, other 4xx -> `Validation`, client timeouts ->
//! `Timeout`, connection failures -> `Connection`.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, Response, StatusCode};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use core_kernel::{
    AdapterHealth, Currency, DomainPort, HealthCheckResult, HealthCheckable, Money, PortError,
};
use domain_billing::{GatewayCharge, GatewayRefund, GatewayStatus, PaymentGateway};

use crate::config::GatewaySettings;
use crate::error::WorkerError;

const SERVICE: &str = "payment-gateway";

#[derive(Debug, Serialize)]
struct ChargeRequest<'a> {
    amount: Decimal,
    currency: Currency,
    payment_method_token: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ChargeOutcome {
    Succeeded,
    Declined,
}

#[derive(Debug, Deserialize)]
struct ChargeResponse {
    id: String,
    status: ChargeOutcome,
    #[serde(default)]
    decline_reason: Option<String>,
}

#[derive(Debug, Serialize)]
struct RefundRequest {
    amount: Decimal,
    currency: Currency,
}

#[derive(Debug, Deserialize)]
struct RefundResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
}

/// [`PaymentGateway`] over HTTP
#[derive(Debug, Clone)]
pub struct HttpPaymentGateway {
    client: Client,
    base_url: String,
    api_key: String,
    timeout: Duration,
}

impl HttpPaymentGateway {
    pub fn new(settings: &GatewaySettings) -> Result<Self, WorkerError> {
        let timeout = Duration::from_secs(settings.timeout_secs);
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| WorkerError::Gateway(e.to_string()))?;

        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn transport_error(&self, operation: &str, error: reqwest::Error) -> PortError {
        if error.is_timeout() {
            PortError::timeout(operation, self.timeout.as_millis() as u64)
        } else if error.is_connect() {
            PortError::connection(format!("{}: {}", SERVICE, error))
        } else {
            PortError::internal(format!("{} {}: {}", SERVICE, operation, error))
        }
    }

    /// Parses a 2xx body as `T`, or maps the error status
    async fn read<T: serde::de::DeserializeOwned>(
        &self,
        operation: &str,
        response: Response,
    ) -> Result<T, PortError> {
        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| PortError::internal(format!("{} returned an unreadable body: {}", SERVICE, e)));
        }

        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let message = response
            .json::<ErrorBody>()
            .await
            .ok()
            .and_then(|body| body.message)
            .unwrap_or_else(|| status.to_string());
        warn!(operation, status = %status, message = %message, "Payment gateway rejected request");
        Err(status_error(status, retry_after, message))
    }
}

fn status_error(status: StatusCode, retry_after: Option<u64>, message: String) -> PortError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => PortError::RateLimited {
            retry_after_secs: retry_after.unwrap_or(60),
        },
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            PortError::timeout(SERVICE, 0)
        }
        s if s.is_server_error() => PortError::ServiceUnavailable {
            service: format!("{} ({})", SERVICE, message),
        },
        StatusCode::NOT_FOUND => PortError::not_found("GatewayTransaction", message),
        _ => PortError::validation(format!("{} rejected request: {}", SERVICE, message)),
    }
}

impl DomainPort for HttpPaymentGateway {}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    #[instrument(skip(self, amount, payment_method_token), fields(amount = %amount))]
    async fn charge(
        &self,
        amount: &Money,
        payment_method_token: &str,
    ) -> Result<GatewayCharge, PortError> {
        let url = format!("{}/v1/charges", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&ChargeRequest {
                amount: amount.amount(),
                currency: amount.currency(),
                payment_method_token,
            })
            .send()
            .await
            .map_err(|e| self.transport_error("charge", e))?;

        let body: ChargeResponse = self.read("charge", response).await?;
        let status = match body.status {
            ChargeOutcome::Succeeded => GatewayStatus::Succeeded,
            ChargeOutcome::Declined => GatewayStatus::Declined {
                reason: body
                    .decline_reason
                    .unwrap_or_else(|| "declined by issuer".to_string()),
            },
        };
        info!(gateway_transaction_id = %body.id, status = ?status, "Gateway charge completed");
        Ok(GatewayCharge {
            gateway_transaction_id: body.id,
            status,
        })
    }

    #[instrument(skip(self, amount), fields(amount = %amount))]
    async fn refund(
        &self,
        gateway_transaction_id: &str,
        amount: &Money,
    ) -> Result<GatewayRefund, PortError> {
        let url = format!("{}/v1/charges/{}/refunds", self.base_url, gateway_transaction_id);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&RefundRequest {
                amount: amount.amount(),
                currency: amount.currency(),
            })
            .send()
            .await
            .map_err(|e| self.transport_error("refund", e))?;

        let body: RefundResponse = self.read("refund", response).await?;
        info!(refund_id = %body.id, "Gateway refund completed");
        Ok(GatewayRefund { refund_id: body.id })
    }
}

#[async_trait]
impl HealthCheckable for HttpPaymentGateway {
    async fn health_check(&self) -> HealthCheckResult {
        let start = Instant::now();
        let result = self
            .client
            .get(format!("{}/health", self.base_url))
            .send()
            .await;
        let latency_ms = start.elapsed().as_millis() as u64;

        let (status, message) = match result {
            Ok(response) if response.status().is_success() => (AdapterHealth::Healthy, None),
            Ok(response) if response.status().is_server_error() => (
                AdapterHealth::Unhealthy,
                Some(format!("Gateway returned {}", response.status())),
            ),
            Ok(response) => (
                AdapterHealth::Degraded,
                Some(format!("Gateway returned {}", response.status())),
            ),
            Err(e) => (AdapterHealth::Unhealthy, Some(format!("Gateway unreachable: {}", e))),
        };
        debug!(status = ?status, latency_ms, "Gateway health checked");
        HealthCheckResult {
            adapter_id: "http-payment-gateway".to_string(),
            status,
            latency_ms,
            message,
            checked_at: Utc::now(),
        }
    }
}
