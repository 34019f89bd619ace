//! HTTP payment gateway tests against a mock processor

use rust_decimal_macros::dec;
use serde_json::json;
use wiremock::matchers::{bearer_token, body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use core_kernel::{AdapterHealth, Currency, HealthCheckable, Money, PortError};
use domain_billing::{GatewayStatus, PaymentGateway};
use interface_worker::config::GatewaySettings;
use interface_worker::HttpPaymentGateway;

fn gateway_for(server: &MockServer) -> HttpPaymentGateway {
    HttpPaymentGateway::new(&GatewaySettings {
        base_url: server.uri(),
        api_key: "sk_test_billing".to_string(),
        timeout_secs: 2,
    })
    .unwrap()
}

fn usd(amount: rust_decimal::Decimal) -> Money {
    Money::new(amount, Currency::USD)
}

mod charges {
    use super::*;

    #[tokio::test]
    async fn test_successful_charge_returns_transaction_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/charges"))
            .and(bearer_token("sk_test_billing"))
            .and(body_partial_json(json!({
                "currency": "USD",
                "payment_method_token": "tok_visa"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "ch_123",
                "status": "succeeded"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let charge = gateway_for(&server)
            .charge(&usd(dec!(49.99)), "tok_visa")
            .await
            .unwrap();
        assert_eq!(charge.gateway_transaction_id, "ch_123");
        assert_eq!(charge.status, GatewayStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_decline_carries_reason() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/charges"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "ch_124",
                "status": "declined",
                "decline_reason": "insufficient_funds"
            })))
            .mount(&server)
            .await;

        let charge = gateway_for(&server)
            .charge(&usd(dec!(20)), "tok_visa")
            .await
            .unwrap();
        assert_eq!(
            charge.status,
            GatewayStatus::Declined {
                reason: "insufficient_funds".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_rate_limit_honours_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/charges"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "7"))
            .mount(&server)
            .await;

        let err = gateway_for(&server)
            .charge(&usd(dec!(20)), "tok_visa")
            .await
            .unwrap_err();
        assert!(matches!(err, PortError::RateLimited { retry_after_secs: 7 }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/charges"))
            .respond_with(
                ResponseTemplate::new(503).set_body_json(json!({"message": "maintenance"})),
            )
            .mount(&server)
            .await;

        let err = gateway_for(&server)
            .charge(&usd(dec!(20)), "tok_visa")
            .await
            .unwrap_err();
        assert!(matches!(err, PortError::ServiceUnavailable { .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_rejected_request_is_validation_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/charges"))
            .respond_with(
                ResponseTemplate::new(422).set_body_json(json!({"message": "unknown token"})),
            )
            .mount(&server)
            .await;

        let err = gateway_for(&server)
            .charge(&usd(dec!(20)), "tok_bad")
            .await
            .unwrap_err();
        assert!(matches!(err, PortError::Validation { .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_slow_processor_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/charges"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(std::time::Duration::from_secs(5))
                    .set_body_json(json!({"id": "ch_late", "status": "succeeded"})),
            )
            .mount(&server)
            .await;

        let err = gateway_for(&server)
            .charge(&usd(dec!(20)), "tok_visa")
            .await
            .unwrap_err();
        assert!(matches!(err, PortError::Timeout { .. }));
    }
}

mod refunds {
    use super::*;

    #[tokio::test]
    async fn test_refund_posts_to_charge() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/charges/ch_123/refunds"))
            .and(header("content-type", "application/json"))
            .and(body_partial_json(json!({"currency": "USD"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "re_1"})))
            .expect(1)
            .mount(&server)
            .await;

        let refund = gateway_for(&server)
            .refund("ch_123", &usd(dec!(10)))
            .await
            .unwrap();
        assert_eq!(refund.refund_id, "re_1");
    }

    #[tokio::test]
    async fn test_unknown_charge_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/charges/ch_missing/refunds"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = gateway_for(&server)
            .refund("ch_missing", &usd(dec!(10)))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}

mod health {
    use super::*;

    #[tokio::test]
    async fn test_healthy_processor() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let result = gateway_for(&server).health_check().await;
        assert_eq!(result.status, AdapterHealth::Healthy);
    }

    #[tokio::test]
    async fn test_failing_processor_is_unhealthy() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let result = gateway_for(&server).health_check().await;
        assert_eq!(result.status, AdapterHealth::Unhealthy);
        assert!(result.message.is_some());
    }
}
