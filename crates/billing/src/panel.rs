//! 3x-ui panel client
//!
//! The panel is the system of record for provisioned clients. It speaks a
//! cookie-session JSON API: log in once, replay the session cookie, and log
//! in again when the panel answers 401/403.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{COOKIE, SET_COOKIE};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use time::OffsetDateTime;
use tokio::sync::{Mutex, RwLock};

use crate::config::PanelConfig;
use crate::error::BillingError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Desired state of one client on the panel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteClient {
    pub client_id: String,
    pub email: String,
    pub sub_id: String,
    pub flow: String,
    pub expires_at: OffsetDateTime,
}

#[derive(Debug, thiserror::Error)]
pub enum PanelError {
    #[error("panel is not configured")]
    NotConfigured,

    #[error("login failed: {0}")]
    Login(String),

    #[error("request failed: {0}")]
    Http(String),

    #[error("panel rejected request: {0}")]
    Rejected(String),
}

impl From<reqwest::Error> for PanelError {
    fn from(err: reqwest::Error) -> Self {
        PanelError::Http(err.to_string())
    }
}

impl From<PanelError> for BillingError {
    fn from(err: PanelError) -> Self {
        BillingError::Upstream(format!("3x-ui: {err}"))
    }
}

#[async_trait]
pub trait PanelClient: Send + Sync {
    /// Inbound the clients are attached to.
    fn inbound_id(&self) -> i32;

    /// Create the client or bring an existing one up to date.
    async fn upsert_client(&self, client: &RemoteClient) -> Result<(), PanelError>;

    /// Remove the client. Removing an unknown client succeeds.
    async fn delete_client(&self, client_id: &str) -> Result<(), PanelError>;
}

#[derive(Debug, Deserialize)]
struct PanelResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    obj: Option<serde_json::Value>,
}

impl PanelResponse {
    fn message(&self) -> String {
        self.msg.clone().unwrap_or_else(|| "no message".to_string())
    }

    fn mentions(&self, needle: &str) -> bool {
        self.msg
            .as_deref()
            .map(|m| m.to_ascii_lowercase().contains(needle))
            .unwrap_or(false)
    }
}

/// Session-authenticated client for the 3x-ui HTTP API.
pub struct XuiPanelClient {
    http: reqwest::Client,
    config: PanelConfig,
    cookie: RwLock<Option<String>>,
    login_lock: Mutex<()>,
}

impl XuiPanelClient {
    pub fn new(config: PanelConfig) -> Result<Self, PanelError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            config,
            cookie: RwLock::new(None),
            login_lock: Mutex::new(()),
        })
    }

    fn panel_url(&self, path: &str) -> String {
        format!("{}{}{}", self.config.base_url, self.config.web_base_path, path)
    }

    /// Login endpoints in the order they are tried: under the web base path,
    /// under its parent, then at the root.
    fn login_urls(&self) -> Vec<String> {
        let base = &self.config.base_url;
        let web = &self.config.web_base_path;
        let mut urls = vec![format!("{base}{web}/login")];
        if let Some(parent) = web.strip_suffix("/panel") {
            urls.push(format!("{base}{parent}/login"));
        }
        urls.push(format!("{base}/login"));
        urls.dedup();
        urls
    }

    async fn login(&self) -> Result<String, PanelError> {
        if !self.config.is_configured() {
            return Err(PanelError::NotConfigured);
        }

        let mut credentials = HashMap::from([
            ("username", self.config.username.clone()),
            ("password", self.config.password.clone()),
        ]);
        if let Some(code) = &self.config.two_factor_code {
            credentials.insert("twoFactorCode", code.clone());
        }

        let mut last_error = String::from("no login endpoint answered");
        for url in self.login_urls() {
            // Newer panels take JSON, older ones only a form body.
            let attempts = [
                self.http.post(&url).json(&credentials),
                self.http.post(&url).form(&credentials),
            ];
            for request in attempts {
                match Self::session_from_login(request.send().await).await {
                    Ok(cookie) => {
                        tracing::info!(url = %url, "Logged in to 3x-ui panel");
                        return Ok(cookie);
                    }
                    Err(e) => {
                        tracing::debug!(url = %url, error = %e, "Panel login attempt failed");
                        last_error = e;
                    }
                }
            }
        }

        Err(PanelError::Login(last_error))
    }

    async fn session_from_login(
        response: Result<reqwest::Response, reqwest::Error>,
    ) -> Result<String, String> {
        let response = response.map_err(|e| e.to_string())?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("status {status}"));
        }

        let cookie = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(|v| v.split(';').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .collect::<Vec<_>>()
            .join("; ");

        let body: Option<PanelResponse> = response.json().await.ok();
        if let Some(body) = &body {
            if !body.success {
                return Err(body.message());
            }
        }
        if cookie.is_empty() {
            return Err("no session cookie returned".to_string());
        }
        Ok(cookie)
    }

    async fn session_cookie(&self) -> Result<String, PanelError> {
        if let Some(cookie) = self.cookie.read().await.clone() {
            return Ok(cookie);
        }
        self.refresh_session(None).await
    }

    /// Log in again unless another caller already replaced `stale`.
    async fn refresh_session(&self, stale: Option<&str>) -> Result<String, PanelError> {
        let _guard = self.login_lock.lock().await;
        if let Some(current) = self.cookie.read().await.clone() {
            if Some(current.as_str()) != stale {
                return Ok(current);
            }
        }

        let cookie = self.login().await?;
        *self.cookie.write().await = Some(cookie.clone());
        Ok(cookie)
    }

    /// Send an authenticated request, re-authenticating once on 401/403.
    async fn send_authed<F>(&self, build: F) -> Result<PanelResponse, PanelError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let cookie = self.session_cookie().await?;
        let response = build(&self.http).header(COOKIE, &cookie).send().await?;

        let response = if matches!(
            response.status(),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
        ) {
            tracing::info!(status = %response.status(), "Panel session expired, logging in again");
            let fresh = self.refresh_session(Some(&cookie)).await?;
            build(&self.http).header(COOKIE, &fresh).send().await?
        } else {
            response
        };

        let status = response.status();
        if !status.is_success() {
            return Err(PanelError::Http(format!("status {status}")));
        }
        response
            .json::<PanelResponse>()
            .await
            .map_err(|e| PanelError::Http(format!("unexpected response body: {e}")))
    }

    fn client_settings(client: &RemoteClient) -> String {
        json!({
            "clients": [{
                "id": client.client_id,
                "flow": client.flow,
                "email": client.email,
                "limitIp": 0,
                "totalGB": 0,
                "expiryTime": client.expires_at.unix_timestamp() * 1000,
                "enable": true,
                "tgId": "",
                "subId": client.sub_id,
            }]
        })
        .to_string()
    }

    fn client_form(&self, client: &RemoteClient) -> [(&'static str, String); 2] {
        [
            ("id", self.config.inbound_id.to_string()),
            ("settings", Self::client_settings(client)),
        ]
    }

    async fn add_client(&self, client: &RemoteClient) -> Result<PanelResponse, PanelError> {
        let url = self.panel_url("/api/inbounds/addClient");
        let form = self.client_form(client);
        self.send_authed(|http| http.post(&url).form(&form)).await
    }

    async fn update_client(&self, client: &RemoteClient) -> Result<PanelResponse, PanelError> {
        let url = self.panel_url(&format!("/api/inbounds/updateClient/{}", client.client_id));
        let form = self.client_form(client);
        self.send_authed(|http| http.post(&url).form(&form)).await
    }

    /// Id of the client currently registered under `email`, if any.
    async fn find_client_id_by_email(&self, email: &str) -> Result<Option<String>, PanelError> {
        let url = self.panel_url(&format!("/api/inbounds/get/{}", self.config.inbound_id));
        let response = self.send_authed(|http| http.get(&url)).await?;
        if !response.success {
            return Err(PanelError::Rejected(response.message()));
        }

        // `settings` is a JSON document embedded as a string.
        let settings = response
            .obj
            .as_ref()
            .and_then(|obj| obj.get("settings"))
            .and_then(|s| s.as_str())
            .and_then(|s| serde_json::from_str::<serde_json::Value>(s).ok());

        let id = settings
            .as_ref()
            .and_then(|s| s.get("clients"))
            .and_then(|c| c.as_array())
            .and_then(|clients| {
                clients
                    .iter()
                    .find(|c| c.get("email").and_then(|e| e.as_str()) == Some(email))
            })
            .and_then(|c| c.get("id"))
            .and_then(|id| id.as_str())
            .map(str::to_string);
        Ok(id)
    }

    async fn remove_client(&self, client_id: &str) -> Result<PanelResponse, PanelError> {
        let url = self.panel_url(&format!(
            "/api/inbounds/{}/delClient/{}",
            self.config.inbound_id, client_id
        ));
        self.send_authed(|http| http.post(&url)).await
    }
}

#[async_trait]
impl PanelClient for XuiPanelClient {
    fn inbound_id(&self) -> i32 {
        self.config.inbound_id
    }

    async fn upsert_client(&self, client: &RemoteClient) -> Result<(), PanelError> {
        let added = self.add_client(client).await?;
        if added.success {
            return Ok(());
        }
        if !added.mentions("duplicate") {
            return Err(PanelError::Rejected(added.message()));
        }

        // The email is already taken: either our own client (renewal) or a
        // stale one left behind under another id.
        let existing = self.find_client_id_by_email(&client.email).await?;
        let retried = match existing {
            Some(id) if id != client.client_id => {
                tracing::warn!(
                    email = %client.email,
                    stale_client_id = %id,
                    "Replacing stale panel client with the same email"
                );
                let removed = self.remove_client(&id).await?;
                if !removed.success {
                    return Err(PanelError::Rejected(removed.message()));
                }
                self.add_client(client).await?
            }
            _ => self.update_client(client).await?,
        };

        if retried.success {
            Ok(())
        } else {
            Err(PanelError::Rejected(retried.message()))
        }
    }

    async fn delete_client(&self, client_id: &str) -> Result<(), PanelError> {
        let response = self.remove_client(client_id).await?;
        if response.success || response.mentions("not found") {
            Ok(())
        } else {
            Err(PanelError::Rejected(response.message()))
        }
    }
}

/// Panel double that keeps clients in memory. Failures can be switched on
/// to exercise the error paths.
#[derive(Default)]
pub struct InMemoryPanel {
    clients: Mutex<HashMap<String, RemoteClient>>,
    fail_upserts: AtomicBool,
    fail_deletes: AtomicBool,
    upsert_calls: AtomicUsize,
    delete_calls: AtomicUsize,
}

impl InMemoryPanel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_upserts(&self, fail: bool) {
        self.fail_upserts.store(fail, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    pub fn upsert_calls(&self) -> usize {
        self.upsert_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    pub async fn client(&self, client_id: &str) -> Option<RemoteClient> {
        self.clients.lock().await.get(client_id).cloned()
    }

    pub async fn client_count(&self) -> usize {
        self.clients.lock().await.len()
    }
}

#[async_trait]
impl PanelClient for InMemoryPanel {
    fn inbound_id(&self) -> i32 {
        1
    }

    async fn upsert_client(&self, client: &RemoteClient) -> Result<(), PanelError> {
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_upserts.load(Ordering::SeqCst) {
            return Err(PanelError::Http("panel unreachable".to_string()));
        }
        let mut clients = self.clients.lock().await;
        clients.retain(|id, c| c.email != client.email || id == &client.client_id);
        clients.insert(client.client_id.clone(), client.clone());
        Ok(())
    }

    async fn delete_client(&self, client_id: &str) -> Result<(), PanelError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(PanelError::Http("panel unreachable".to_string()));
        }
        self.clients.lock().await.remove(client_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    fn config_for(server: &Server) -> PanelConfig {
        PanelConfig {
            base_url: server.url(),
            web_base_path: "/panel".to_string(),
            username: "admin".to_string(),
            password: "secret".to_string(),
            two_factor_code: None,
            inbound_id: 3,
            subscription_base_url: None,
        }
    }

    fn remote_client() -> RemoteClient {
        RemoteClient {
            client_id: "c0ffee00-0000-4000-8000-000000000001".to_string(),
            email: "tg-42".to_string(),
            sub_id: "0123456789abcdef".to_string(),
            flow: "xtls-rprx-vision".to_string(),
            expires_at: OffsetDateTime::from_unix_timestamp(1_900_000_000).unwrap(),
        }
    }

    #[test]
    fn login_urls_cover_parent_and_root() {
        let client = XuiPanelClient::new(PanelConfig {
            base_url: "http://panel.local".to_string(),
            web_base_path: "/secret/panel".to_string(),
            ..PanelConfig::default()
        })
        .unwrap();

        assert_eq!(
            client.login_urls(),
            vec![
                "http://panel.local/secret/panel/login",
                "http://panel.local/secret/login",
                "http://panel.local/login",
            ]
        );
    }

    #[test]
    fn client_settings_carry_expiry_in_millis() {
        let settings: serde_json::Value =
            serde_json::from_str(&XuiPanelClient::client_settings(&remote_client())).unwrap();
        let entry = &settings["clients"][0];

        assert_eq!(entry["expiryTime"], 1_900_000_000_000_i64);
        assert_eq!(entry["email"], "tg-42");
        assert_eq!(entry["enable"], true);
    }

    #[tokio::test]
    async fn unconfigured_panel_fails_fast() {
        let client = XuiPanelClient::new(PanelConfig::default()).unwrap();
        let err = client.upsert_client(&remote_client()).await.unwrap_err();
        assert!(matches!(err, PanelError::NotConfigured));
    }

    #[tokio::test]
    async fn adds_client_with_session_cookie() {
        let mut server = Server::new_async().await;
        let login = server
            .mock("POST", "/panel/login")
            .with_status(200)
            .with_header("set-cookie", "3x-ui=session-1; Path=/; HttpOnly")
            .with_body(r#"{"success":true,"msg":"ok"}"#)
            .expect(1)
            .create_async()
            .await;
        let add = server
            .mock("POST", "/panel/api/inbounds/addClient")
            .match_header("cookie", "3x-ui=session-1")
            .match_body(Matcher::UrlEncoded("id".into(), "3".into()))
            .with_status(200)
            .with_body(r#"{"success":true}"#)
            .expect(1)
            .create_async()
            .await;

        let client = XuiPanelClient::new(config_for(&server)).unwrap();
        client.upsert_client(&remote_client()).await.unwrap();

        login.assert_async().await;
        add.assert_async().await;
    }

    #[tokio::test]
    async fn relogs_in_once_when_session_expires() {
        let mut server = Server::new_async().await;
        let login = server
            .mock("POST", "/panel/login")
            .with_status(200)
            .with_header("set-cookie", "3x-ui=fresh")
            .with_body(r#"{"success":true}"#)
            .expect(1)
            .create_async()
            .await;
        let rejected = server
            .mock("POST", "/panel/api/inbounds/3/delClient/abc")
            .match_header("cookie", "3x-ui=stale")
            .with_status(401)
            .expect(1)
            .create_async()
            .await;
        let accepted = server
            .mock("POST", "/panel/api/inbounds/3/delClient/abc")
            .match_header("cookie", "3x-ui=fresh")
            .with_status(200)
            .with_body(r#"{"success":true}"#)
            .expect(1)
            .create_async()
            .await;

        let client = XuiPanelClient::new(config_for(&server)).unwrap();
        *client.cookie.write().await = Some("3x-ui=stale".to_string());

        client.delete_client("abc").await.unwrap();

        login.assert_async().await;
        rejected.assert_async().await;
        accepted.assert_async().await;
        assert_eq!(client.cookie.read().await.as_deref(), Some("3x-ui=fresh"));
    }

    #[tokio::test]
    async fn second_rejection_surfaces_as_error() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/panel/login")
            .with_status(200)
            .with_header("set-cookie", "3x-ui=fresh")
            .with_body(r#"{"success":true}"#)
            .create_async()
            .await;
        let rejected = server
            .mock("POST", "/panel/api/inbounds/3/delClient/abc")
            .with_status(403)
            .expect(2)
            .create_async()
            .await;

        let client = XuiPanelClient::new(config_for(&server)).unwrap();
        let result = client.delete_client("abc").await;

        assert!(matches!(result, Err(PanelError::Http(_))));
        rejected.assert_async().await;
    }

    #[tokio::test]
    async fn duplicate_email_for_same_client_updates_in_place() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/panel/login")
            .with_status(200)
            .with_header("set-cookie", "3x-ui=s")
            .with_body(r#"{"success":true}"#)
            .create_async()
            .await;
        server
            .mock("POST", "/panel/api/inbounds/addClient")
            .with_status(200)
            .with_body(r#"{"success":false,"msg":"Duplicate email: tg-42"}"#)
            .create_async()
            .await;
        let settings = json!({"clients": [{"id": remote_client().client_id, "email": "tg-42"}]})
            .to_string();
        server
            .mock("GET", "/panel/api/inbounds/get/3")
            .with_status(200)
            .with_body(json!({"success": true, "obj": {"settings": settings}}).to_string())
            .create_async()
            .await;
        let update = server
            .mock(
                "POST",
                format!("/panel/api/inbounds/updateClient/{}", remote_client().client_id).as_str(),
            )
            .with_status(200)
            .with_body(r#"{"success":true}"#)
            .expect(1)
            .create_async()
            .await;

        let client = XuiPanelClient::new(config_for(&server)).unwrap();
        client.upsert_client(&remote_client()).await.unwrap();

        update.assert_async().await;
    }

    #[tokio::test]
    async fn duplicate_email_for_other_client_deletes_before_readding() {
        use std::sync::Arc;

        let mut server = Server::new_async().await;
        server
            .mock("POST", "/panel/login")
            .with_status(200)
            .with_header("set-cookie", "3x-ui=s")
            .with_body(r#"{"success":true}"#)
            .create_async()
            .await;

        let stale_removed = Arc::new(AtomicBool::new(false));
        let removed = stale_removed.clone();
        let add = server
            .mock("POST", "/panel/api/inbounds/addClient")
            .with_status(200)
            .with_body_from_request(move |_| {
                if removed.load(Ordering::SeqCst) {
                    br#"{"success":true}"#.to_vec()
                } else {
                    br#"{"success":false,"msg":"Duplicate email: tg-42"}"#.to_vec()
                }
            })
            .expect(2)
            .create_async()
            .await;
        let settings = json!({"clients": [{"id": "stale-client", "email": "tg-42"}]}).to_string();
        server
            .mock("GET", "/panel/api/inbounds/get/3")
            .with_status(200)
            .with_body(json!({"success": true, "obj": {"settings": settings}}).to_string())
            .create_async()
            .await;
        let removed = stale_removed.clone();
        let delete = server
            .mock("POST", "/panel/api/inbounds/3/delClient/stale-client")
            .with_status(200)
            .with_body_from_request(move |_| {
                removed.store(true, Ordering::SeqCst);
                br#"{"success":true}"#.to_vec()
            })
            .expect(1)
            .create_async()
            .await;

        let client = XuiPanelClient::new(config_for(&server)).unwrap();
        client.upsert_client(&remote_client()).await.unwrap();

        delete.assert_async().await;
        add.assert_async().await;
        assert!(stale_removed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn deleting_unknown_client_succeeds() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/panel/login")
            .with_status(200)
            .with_header("set-cookie", "3x-ui=s")
            .with_body(r#"{"success":true}"#)
            .create_async()
            .await;
        server
            .mock("POST", "/panel/api/inbounds/3/delClient/gone")
            .with_status(200)
            .with_body(r#"{"success":false,"msg":"Client Not Found"}"#)
            .create_async()
            .await;

        let client = XuiPanelClient::new(config_for(&server)).unwrap();
        client.delete_client("gone").await.unwrap();
    }

    #[tokio::test]
    async fn in_memory_panel_replaces_clients_sharing_an_email() {
        let panel = InMemoryPanel::new();
        let mut first = remote_client();
        panel.upsert_client(&first).await.unwrap();

        first.client_id = "other".to_string();
        panel.upsert_client(&first).await.unwrap();

        assert_eq!(panel.client_count().await, 1);
        assert!(panel.client("other").await.is_some());
    }
}
