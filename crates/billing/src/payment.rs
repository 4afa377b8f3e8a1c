//! Payment provider seam and the FakePay mock provider.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::BillingResult;

/// A checkout session opened with the payment provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentSession {
    pub provider_payment_id: String,
    pub confirmation_url: String,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_payment(
        &self,
        order_id: Uuid,
        return_to: Option<&str>,
    ) -> BillingResult<PaymentSession>;

    /// Checkout link for a session that already exists.
    fn confirmation_url(
        &self,
        provider_payment_id: &str,
        order_id: Uuid,
        return_to: Option<&str>,
    ) -> String;
}

/// Mock provider whose checkout pages are served by this service itself.
#[derive(Debug, Clone)]
pub struct FakePayGateway {
    app_base_url: String,
}

impl FakePayGateway {
    pub fn new(app_base_url: impl Into<String>) -> Self {
        Self {
            app_base_url: app_base_url.into(),
        }
    }
}

#[async_trait]
impl PaymentGateway for FakePayGateway {
    async fn create_payment(
        &self,
        order_id: Uuid,
        return_to: Option<&str>,
    ) -> BillingResult<PaymentSession> {
        let provider_payment_id = Uuid::new_v4().to_string();
        let confirmation_url = self.confirmation_url(&provider_payment_id, order_id, return_to);
        tracing::debug!(
            order_id = %order_id,
            provider_payment_id = %provider_payment_id,
            "FakePay session created"
        );
        Ok(PaymentSession {
            provider_payment_id,
            confirmation_url,
        })
    }

    fn confirmation_url(
        &self,
        provider_payment_id: &str,
        order_id: Uuid,
        return_to: Option<&str>,
    ) -> String {
        let mut query = url::form_urlencoded::Serializer::new(String::new());
        query.append_pair("orderId", &order_id.to_string());
        if let Some(return_to) = return_to {
            query.append_pair("returnTo", return_to);
        }
        format!(
            "{}/fakepay/checkout/{}?{}",
            self.app_base_url,
            provider_payment_id,
            query.finish()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn checkout_url_points_at_the_mock_provider() {
        let gateway = FakePayGateway::new("https://pay.example");
        let order_id = Uuid::new_v4();

        let session = gateway
            .create_payment(order_id, Some("/profile?paid=1"))
            .await
            .unwrap();

        assert!(Uuid::parse_str(&session.provider_payment_id).is_ok());
        assert_eq!(
            session.confirmation_url,
            format!(
                "https://pay.example/fakepay/checkout/{}?orderId={}&returnTo=%2Fprofile%3Fpaid%3D1",
                session.provider_payment_id, order_id
            )
        );
    }
}
