//! Edge Case Tests for Profile Access
//!
//! Tests boundary conditions of the access-link and session lifecycle:
//! - Link issuance and invalidation of earlier links
//! - Single use with a short reuse grace window
//! - Session expiry and cleanup

#[cfg(test)]
mod session_tests {
    use std::sync::Arc;

    use passgate_shared::MemoryStore;
    use time::{Duration, OffsetDateTime};

    use super::super::sessions::*;

    fn sessions() -> ProfileSessions {
        ProfileSessions::new(Arc::new(MemoryStore::new()), "https://vpn.test")
    }

    // =========================================================================
    // Issue -> consume -> touch yields a live session
    // =========================================================================
    #[tokio::test]
    async fn test_issue_consume_touch() {
        let sessions = sessions();
        let now = OffsetDateTime::now_utc();

        let link = sessions.issue_access_token_at(42, now).await.unwrap();
        assert_eq!(link.url, format!("https://vpn.test/profile/access/{}", link.token));
        assert_eq!(link.expires_at, now + ACCESS_TOKEN_TTL);

        let session = sessions
            .consume_token_at(&link.token, now + Duration::seconds(1))
            .await
            .unwrap()
            .expect("first consumption opens a session");
        assert_eq!(session.telegram_id, 42);
        assert_eq!(session.session_key.len(), 64);

        let touched = sessions
            .touch_at(&session.session_key, now + Duration::minutes(5))
            .await
            .unwrap()
            .expect("session is live");
        assert_eq!(touched.user_id, session.user_id);
    }

    // =========================================================================
    // Reuse inside the grace window returns the same session
    // =========================================================================
    #[tokio::test]
    async fn test_reuse_within_grace_window() {
        let sessions = sessions();
        let now = OffsetDateTime::now_utc();
        let link = sessions.issue_access_token_at(7, now).await.unwrap();

        let first = sessions.consume_token_at(&link.token, now).await.unwrap().unwrap();
        let second = sessions
            .consume_token_at(&link.token, now + Duration::seconds(10))
            .await
            .unwrap()
            .expect("reuse within grace window");

        assert_eq!(first.session_key, second.session_key);
    }

    // =========================================================================
    // Replays beyond the grace window fail
    // =========================================================================
    #[tokio::test]
    async fn test_replay_after_grace_window_is_rejected() {
        let sessions = sessions();
        let now = OffsetDateTime::now_utc();
        let link = sessions.issue_access_token_at(7, now).await.unwrap();

        sessions.consume_token_at(&link.token, now).await.unwrap().unwrap();
        let replay = sessions
            .consume_token_at(&link.token, now + TOKEN_REUSE_GRACE + Duration::seconds(1))
            .await
            .unwrap();

        assert!(replay.is_none());
    }

    // =========================================================================
    // Unknown and expired links are rejected
    // =========================================================================
    #[tokio::test]
    async fn test_unknown_and_expired_tokens() {
        let sessions = sessions();
        let now = OffsetDateTime::now_utc();

        assert!(sessions.consume_token_at("nope", now).await.unwrap().is_none());

        let link = sessions.issue_access_token_at(9, now).await.unwrap();
        let late = now + ACCESS_TOKEN_TTL;
        assert!(sessions.consume_token_at(&link.token, late).await.unwrap().is_none());
    }

    // =========================================================================
    // A new link invalidates the previous one
    // =========================================================================
    #[tokio::test]
    async fn test_new_link_revokes_previous() {
        let sessions = sessions();
        let now = OffsetDateTime::now_utc();

        let old = sessions.issue_access_token_at(5, now).await.unwrap();
        let new = sessions
            .issue_access_token_at(5, now + Duration::seconds(1))
            .await
            .unwrap();

        // The old link counts as consumed and no session exists to reuse.
        let reused = sessions
            .consume_token_at(&old.token, now + Duration::seconds(2))
            .await
            .unwrap();
        assert!(reused.is_none());

        assert!(sessions
            .consume_token_at(&new.token, now + Duration::seconds(2))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_invalid_telegram_id_is_rejected() {
        let err = sessions()
            .issue_access_token_at(0, OffsetDateTime::now_utc())
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::ApiError::Validation(_)));
    }

    // =========================================================================
    // Expired sessions stop resolving and are purged by cleanup
    // =========================================================================
    #[tokio::test]
    async fn test_session_expiry_and_cleanup() {
        let sessions = sessions();
        let now = OffsetDateTime::now_utc();
        let link = sessions.issue_access_token_at(11, now).await.unwrap();
        let session = sessions.consume_token_at(&link.token, now).await.unwrap().unwrap();

        let after_expiry = now + SESSION_TTL + Duration::seconds(1);
        assert!(sessions
            .touch_at(&session.session_key, after_expiry)
            .await
            .unwrap()
            .is_none());

        let report = sessions.cleanup_expired_at(after_expiry).await.unwrap();
        assert_eq!(report.deleted_tokens, 1);
        assert_eq!(report.deleted_sessions, 1);

        let again = sessions.cleanup_expired_at(after_expiry).await.unwrap();
        assert_eq!(again, CleanupReport::default());
    }

    #[tokio::test]
    async fn test_clear_removes_session() {
        let sessions = sessions();
        let now = OffsetDateTime::now_utc();
        let link = sessions.issue_access_token_at(3, now).await.unwrap();
        let session = sessions.consume_token_at(&link.token, now).await.unwrap().unwrap();

        assert!(sessions.clear(&session.session_key).await.unwrap());
        assert!(!sessions.clear(&session.session_key).await.unwrap());
        assert!(sessions.touch(&session.session_key).await.unwrap().is_none());
    }
}
