//! Outbound user notifications.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

use crate::error::{BillingError, BillingResult};

const TELEGRAM_API: &str = "https://api.telegram.org";

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, telegram_id: i64, text: &str) -> BillingResult<()>;
}

/// Sends messages through the Telegram Bot API.
pub struct TelegramNotifier {
    http: reqwest::Client,
    api_base: String,
    bot_token: String,
}

impl TelegramNotifier {
    pub fn new(bot_token: impl Into<String>) -> BillingResult<Self> {
        Self::with_api_base(bot_token, TELEGRAM_API)
    }

    pub fn with_api_base(
        bot_token: impl Into<String>,
        api_base: impl Into<String>,
    ) -> BillingResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| BillingError::Config(format!("http client: {e}")))?;
        Ok(Self {
            http,
            api_base: api_base.into(),
            bot_token: bot_token.into(),
        })
    }

    async fn send_once(&self, telegram_id: i64, text: &str) -> BillingResult<()> {
        let url = format!("{}/bot{}/sendMessage", self.api_base, self.bot_token);
        let response = self
            .http
            .post(&url)
            .json(&json!({ "chat_id": telegram_id, "text": text }))
            .send()
            .await
            .map_err(|e| BillingError::Upstream(format!("telegram: {e}")))?;

        if !response.status().is_success() {
            return Err(BillingError::Upstream(format!(
                "telegram: status {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, telegram_id: i64, text: &str) -> BillingResult<()> {
        // Up to two retries, roughly 200ms then 400ms apart.
        let strategy = ExponentialBackoff::from_millis(2)
            .factor(100)
            .map(jitter)
            .take(2);
        Retry::spawn(strategy, || self.send_once(telegram_id, text)).await
    }
}

/// Used when no bot token is configured.
pub struct DisabledNotifier;

#[async_trait]
impl Notifier for DisabledNotifier {
    async fn notify(&self, telegram_id: i64, _text: &str) -> BillingResult<()> {
        tracing::debug!(telegram_id, "Notifications disabled, message dropped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    #[tokio::test]
    async fn posts_message_to_bot_api() {
        let mut server = Server::new_async().await;
        let send = server
            .mock("POST", "/botTOKEN/sendMessage")
            .match_body(Matcher::Json(json!({"chat_id": 42, "text": "hello"})))
            .with_status(200)
            .with_body(r#"{"ok":true}"#)
            .expect(1)
            .create_async()
            .await;

        let notifier = TelegramNotifier::with_api_base("TOKEN", server.url()).unwrap();
        notifier.notify(42, "hello").await.unwrap();

        send.assert_async().await;
    }

    #[tokio::test]
    async fn retries_then_gives_up() {
        let mut server = Server::new_async().await;
        let send = server
            .mock("POST", "/botTOKEN/sendMessage")
            .with_status(500)
            .expect(3)
            .create_async()
            .await;

        let notifier = TelegramNotifier::with_api_base("TOKEN", server.url()).unwrap();
        let result = notifier.notify(42, "hello").await;

        assert!(matches!(result, Err(BillingError::Upstream(_))));
        send.assert_async().await;
    }
}
