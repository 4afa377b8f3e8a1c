//! API server configuration

use passgate_billing::{BillingConfig, BillingError};

const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:3000";
const DEFAULT_MAX_CONNECTIONS: u32 = 10;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} has an invalid value: {value}")]
    Invalid { name: &'static str, value: String },

    #[error(transparent)]
    Billing(#[from] BillingError),
}

/// When the profile session cookie carries the `Secure` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CookieSecurity {
    /// Secure whenever the public base URL is https.
    Auto,
    Always,
    Never,
}

impl CookieSecurity {
    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "always" | "true" | "1" => Some(Self::Always),
            "never" | "false" | "0" => Some(Self::Never),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: String,
    pub database_url: String,
    pub database_max_connections: u32,
    pub run_migrations: bool,
    /// Bearer token for the admin and trusted-bot routes.
    pub admin_token: String,
    /// Used for the "back to the bot" link on expired profile pages.
    pub bot_username: Option<String>,
    pub cookie_security: CookieSecurity,
    pub billing: BillingConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let cookie_security = match optional("PROFILE_COOKIE_SECURE") {
            Some(raw) => CookieSecurity::parse(&raw).ok_or(ConfigError::Invalid {
                name: "PROFILE_COOKIE_SECURE",
                value: raw,
            })?,
            None => CookieSecurity::Auto,
        };

        Ok(Self {
            bind_address: optional("BIND_ADDRESS")
                .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string()),
            database_url: required("DATABASE_URL")?,
            database_max_connections: parse_env(
                "DATABASE_MAX_CONNECTIONS",
                DEFAULT_MAX_CONNECTIONS,
            )?,
            run_migrations: parse_env("RUN_MIGRATIONS", true)?,
            admin_token: required("ADMIN_TOKEN")?,
            bot_username: optional("BOT_USERNAME").map(|v| v.trim_start_matches('@').to_string()),
            cookie_security,
            billing: BillingConfig::from_env()?,
        })
    }

    pub fn secure_cookies(&self) -> bool {
        match self.cookie_security {
            CookieSecurity::Always => true,
            CookieSecurity::Never => false,
            CookieSecurity::Auto => self
                .billing
                .app_base_url
                .to_ascii_lowercase()
                .starts_with("https://"),
        }
    }

    /// Deep link back to the bot, when its username is known.
    pub fn bot_url(&self) -> Option<String> {
        self.bot_username
            .as_ref()
            .map(|name| format!("https://t.me/{name}"))
    }
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    optional(name).ok_or(ConfigError::Missing(name))
}

fn optional(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_env<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match optional(name) {
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: [(&str, &str); 4] = [
        ("DATABASE_URL", "postgres://localhost/passgate"),
        ("APP_BASE_URL", "https://vpn.example.com/"),
        ("FAKEPAY_WEBHOOK_SECRET", "whsec"),
        ("ADMIN_TOKEN", "admin"),
    ];

    fn set_required() {
        for (key, value) in VARS {
            std::env::set_var(key, value);
        }
        for key in [
            "BIND_ADDRESS",
            "PROFILE_COOKIE_SECURE",
            "RUN_MIGRATIONS",
            "BOT_USERNAME",
            "DATABASE_MAX_CONNECTIONS",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn defaults_apply_when_only_required_vars_are_set() {
        set_required();

        let config = Config::from_env().unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:3000");
        assert_eq!(config.database_max_connections, 10);
        assert!(config.run_migrations);
        assert_eq!(config.cookie_security, CookieSecurity::Auto);
        assert_eq!(config.billing.app_base_url, "https://vpn.example.com");
        assert!(config.secure_cookies());
        assert!(config.bot_url().is_none());
    }

    #[test]
    #[serial]
    fn missing_admin_token_is_reported() {
        set_required();
        std::env::remove_var("ADMIN_TOKEN");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("ADMIN_TOKEN")));
    }

    #[test]
    #[serial]
    fn cookie_policy_and_bot_link_are_parsed() {
        set_required();
        std::env::set_var("PROFILE_COOKIE_SECURE", "never");
        std::env::set_var("BOT_USERNAME", "@passgate_bot");

        let config = Config::from_env().unwrap();
        assert!(!config.secure_cookies());
        assert_eq!(config.bot_url().as_deref(), Some("https://t.me/passgate_bot"));

        std::env::set_var("PROFILE_COOKIE_SECURE", "sometimes");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid { name: "PROFILE_COOKIE_SECURE", .. })
        ));
        std::env::remove_var("PROFILE_COOKIE_SECURE");
        std::env::remove_var("BOT_USERNAME");
    }
}
