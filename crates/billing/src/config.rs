//! Environment-driven configuration for the billing pipeline.

use crate::error::{BillingError, BillingResult};

pub const DEFAULT_CURRENCY: &str = "RUB";

/// Everything the payment-to-entitlement pipeline needs from the environment.
#[derive(Debug, Clone)]
pub struct BillingConfig {
    /// Public base URL of this service, used for checkout and profile links.
    pub app_base_url: String,
    pub webhook_secret: String,
    pub currency: String,
    /// Telegram bot token; notifications are disabled when unset.
    pub bot_token: Option<String>,
    pub panel: PanelConfig,
    pub connection: ConnectionConfig,
}

impl BillingConfig {
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self {
            app_base_url: normalize_base_url(&required("APP_BASE_URL")?),
            webhook_secret: required("FAKEPAY_WEBHOOK_SECRET")?,
            currency: env_or("ORDER_CURRENCY", DEFAULT_CURRENCY),
            bot_token: optional("BOT_TOKEN"),
            panel: PanelConfig::from_env()?,
            connection: ConnectionConfig::from_env()?,
        })
    }
}

/// Access to the 3x-ui panel.
#[derive(Debug, Clone, Default)]
pub struct PanelConfig {
    /// Empty when no panel is configured.
    pub base_url: String,
    pub web_base_path: String,
    pub username: String,
    pub password: String,
    pub two_factor_code: Option<String>,
    pub inbound_id: i32,
    pub subscription_base_url: Option<String>,
}

impl PanelConfig {
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self {
            base_url: optional("THREEXUI_BASE_URL")
                .map(|v| normalize_base_url(&v))
                .unwrap_or_default(),
            web_base_path: normalize_path(&env_or("THREEXUI_WEBBASEPATH", "/panel")),
            username: env_or("THREEXUI_USERNAME", ""),
            password: env_or("THREEXUI_PASSWORD", ""),
            two_factor_code: optional("THREEXUI_TWO_FACTOR"),
            inbound_id: parse_env("THREEXUI_INBOUND_ID", 1)?,
            subscription_base_url: optional("THREEXUI_SUBSCRIPTION_BASE_URL")
                .map(|v| normalize_base_url(&v)),
        })
    }

    pub fn is_configured(&self) -> bool {
        !self.base_url.is_empty()
    }
}

/// Parameters of the connection URI handed to users.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub network_type: String,
    pub security: String,
    pub sni: String,
    pub flow: String,
    pub public_key: String,
    pub short_id: String,
    pub spider_x: String,
    pub fingerprint: String,
    /// `{telegramId}` is substituted.
    pub tag_template: String,
    /// Full URI template with `{uuid}`, `{email}` and `{telegramId}`
    /// placeholders. Takes precedence over the individual parameters.
    pub uri_template: Option<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 443,
            network_type: "tcp".to_string(),
            security: "reality".to_string(),
            sni: String::new(),
            flow: "xtls-rprx-vision".to_string(),
            public_key: String::new(),
            short_id: String::new(),
            spider_x: "/".to_string(),
            fingerprint: "chrome".to_string(),
            tag_template: "reality-tg-{telegramId}".to_string(),
            uri_template: None,
        }
    }
}

impl ConnectionConfig {
    pub fn from_env() -> BillingResult<Self> {
        let defaults = Self::default();
        Ok(Self {
            host: env_or("VPN_PUBLIC_HOST", &defaults.host),
            port: parse_env("VPN_PUBLIC_PORT", defaults.port)?,
            network_type: env_or("VPN_PUBLIC_TYPE", &defaults.network_type),
            security: env_or("VPN_PUBLIC_SECURITY", &defaults.security),
            sni: env_or("VPN_PUBLIC_SNI", &defaults.sni),
            flow: env_or("VPN_PUBLIC_FLOW", &defaults.flow),
            public_key: env_or("VPN_PUBLIC_PBK", &defaults.public_key),
            short_id: env_or("VPN_PUBLIC_SID", &defaults.short_id),
            spider_x: env_or("VPN_PUBLIC_SPX", &defaults.spider_x),
            fingerprint: env_or("VPN_PUBLIC_FP", &defaults.fingerprint),
            tag_template: env_or("VPN_PUBLIC_TAG_TEMPLATE", &defaults.tag_template),
            uri_template: optional("VPN_PUBLIC_VLESS_URI"),
        })
    }
}

/// Add a scheme when missing and strip trailing slashes.
pub fn normalize_base_url(value: &str) -> String {
    let trimmed = value.trim();
    let lower = trimmed.to_ascii_lowercase();
    let with_scheme = if lower.starts_with("http://") || lower.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    };
    with_scheme.trim_end_matches('/').to_string()
}

/// `"panel/"` -> `"/panel"`; blank stays blank.
pub fn normalize_path(value: &str) -> String {
    let inner = value.trim().trim_matches('/');
    if inner.is_empty() {
        String::new()
    } else {
        format!("/{inner}")
    }
}

pub(crate) fn required(name: &str) -> BillingResult<String> {
    optional(name).ok_or_else(|| BillingError::Config(format!("{name} must be set")))
}

pub(crate) fn optional(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_or(name: &str, default: &str) -> String {
    optional(name).unwrap_or_else(|| default.to_string())
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> BillingResult<T> {
    match optional(name) {
        Some(raw) => raw
            .parse()
            .map_err(|_| BillingError::Config(format!("{name} has an invalid value: {raw}"))),
        None => Ok(default),
    }
}
