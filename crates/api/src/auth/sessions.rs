//! Profile access links and web sessions
//!
//! The bot hands out single-use access links. Opening one trades the token
//! for a browser session (cookie) on the self-service profile pages. A link
//! opened twice within a short grace window (link previews, double taps)
//! lands in the session the first visit created.

use std::sync::Arc;

use passgate_shared::{ProfileAccessToken, ProfileWebSession, Store, StoreTx};
use rand::RngCore;
use serde::Serialize;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};

pub const ACCESS_TOKEN_TTL: Duration = Duration::hours(1);
pub const SESSION_TTL: Duration = Duration::hours(1);
/// How long an already consumed link keeps resolving to its session.
pub const TOKEN_REUSE_GRACE: Duration = Duration::seconds(30);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessLink {
    #[serde(skip)]
    pub token: String,
    pub url: String,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

/// A live browser session on the profile pages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileSession {
    pub session_key: String,
    pub user_id: Uuid,
    pub telegram_id: i64,
    pub expires_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub deleted_tokens: u64,
    pub deleted_sessions: u64,
}

#[derive(Clone)]
pub struct ProfileSessions {
    store: Arc<dyn Store>,
    app_base_url: String,
}

impl ProfileSessions {
    pub fn new(store: Arc<dyn Store>, app_base_url: impl Into<String>) -> Self {
        Self {
            store,
            app_base_url: app_base_url.into(),
        }
    }

    /// Issue a fresh access link, invalidating the user's earlier ones.
    pub async fn issue_access_token(&self, telegram_id: i64) -> ApiResult<AccessLink> {
        self.issue_access_token_at(telegram_id, OffsetDateTime::now_utc())
            .await
    }

    pub async fn issue_access_token_at(
        &self,
        telegram_id: i64,
        now: OffsetDateTime,
    ) -> ApiResult<AccessLink> {
        if telegram_id <= 0 {
            return Err(ApiError::Validation(
                "telegramId must be a positive integer".to_string(),
            ));
        }

        let mut tx = self.store.begin().await?;
        let user = tx.upsert_user(telegram_id, now).await?;
        let revoked = tx.consume_live_access_tokens(user.id, now).await?;

        let token = ProfileAccessToken {
            id: Uuid::new_v4(),
            token: Uuid::new_v4().to_string(),
            user_id: user.id,
            expires_at: now + ACCESS_TOKEN_TTL,
            consumed_at: None,
            created_at: now,
        };
        tx.insert_access_token(&token).await?;
        tx.commit().await?;

        tracing::info!(
            user_id = %user.id,
            revoked_links = revoked,
            "Profile access link issued"
        );

        Ok(AccessLink {
            url: format!("{}/profile/access/{}", self.app_base_url, token.token),
            token: token.token,
            expires_at: token.expires_at,
        })
    }

    /// Trade an access token for a session. `None` means the link is unknown,
    /// expired or already used.
    pub async fn consume_token(&self, token: &str) -> ApiResult<Option<ProfileSession>> {
        self.consume_token_at(token, OffsetDateTime::now_utc()).await
    }

    pub async fn consume_token_at(
        &self,
        token: &str,
        now: OffsetDateTime,
    ) -> ApiResult<Option<ProfileSession>> {
        let mut tx = self.store.begin().await?;
        let Some(record) = tx.find_access_token(token).await? else {
            return Ok(None);
        };
        if record.expires_at <= now {
            return Ok(None);
        }

        if let Some(consumed_at) = record.consumed_at {
            if now - consumed_at > TOKEN_REUSE_GRACE {
                tracing::info!(user_id = %record.user_id, "Replayed profile access link rejected");
                return Ok(None);
            }
            let Some(session) = tx.latest_live_web_session(record.user_id, now).await? else {
                return Ok(None);
            };
            return with_telegram_id(tx.as_mut(), session).await;
        }

        if tx.mark_access_token_consumed(record.id, now).await? != 1 {
            return Ok(None);
        }

        let session = ProfileWebSession {
            id: Uuid::new_v4(),
            session_key: new_session_key(),
            user_id: record.user_id,
            expires_at: now + SESSION_TTL,
            last_seen_at: now,
            created_at: now,
        };
        tx.insert_web_session(&session).await?;
        let session = with_telegram_id(tx.as_mut(), session).await?;
        tx.commit().await?;

        tracing::info!(user_id = %record.user_id, "Profile session opened");
        Ok(session)
    }

    /// Resolve a session cookie and stamp its last use.
    pub async fn touch(&self, session_key: &str) -> ApiResult<Option<ProfileSession>> {
        self.touch_at(session_key, OffsetDateTime::now_utc()).await
    }

    pub async fn touch_at(
        &self,
        session_key: &str,
        now: OffsetDateTime,
    ) -> ApiResult<Option<ProfileSession>> {
        let mut tx = self.store.begin().await?;
        let Some(session) = tx.find_web_session(session_key).await? else {
            return Ok(None);
        };
        if session.expires_at <= now {
            return Ok(None);
        }

        tx.touch_web_session(session.id, now).await?;
        let session = with_telegram_id(tx.as_mut(), session).await?;
        tx.commit().await?;
        Ok(session)
    }

    pub async fn clear(&self, session_key: &str) -> ApiResult<bool> {
        let mut tx = self.store.begin().await?;
        let deleted = tx.delete_web_session(session_key).await?;
        tx.commit().await?;
        Ok(deleted > 0)
    }

    /// Purge expired or consumed tokens and expired sessions.
    pub async fn cleanup_expired(&self) -> ApiResult<CleanupReport> {
        self.cleanup_expired_at(OffsetDateTime::now_utc()).await
    }

    pub async fn cleanup_expired_at(&self, now: OffsetDateTime) -> ApiResult<CleanupReport> {
        let mut tx = self.store.begin().await?;
        let report = CleanupReport {
            deleted_tokens: tx.purge_access_tokens(now).await?,
            deleted_sessions: tx.purge_web_sessions(now).await?,
        };
        tx.commit().await?;

        if report.deleted_tokens > 0 || report.deleted_sessions > 0 {
            tracing::info!(
                deleted_tokens = report.deleted_tokens,
                deleted_sessions = report.deleted_sessions,
                "Expired profile tokens and sessions purged"
            );
        }
        Ok(report)
    }
}

async fn with_telegram_id(
    tx: &mut dyn StoreTx,
    session: ProfileWebSession,
) -> ApiResult<Option<ProfileSession>> {
    let Some(user) = tx.find_user(session.user_id).await? else {
        return Ok(None);
    };
    Ok(Some(ProfileSession {
        session_key: session.session_key,
        user_id: user.id,
        telegram_id: user.telegram_id,
        expires_at: session.expires_at,
    }))
}

/// 32 random bytes, hex encoded.
fn new_session_key() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
