//! Unit tests for authentication middleware helpers
//!
//! Tests cover:
//! - Cookie parsing (named lookup, prefixes, empty values)
//! - Bearer token extraction
//! - Session cookie attributes

#[cfg(test)]
mod tests {
    use axum::{
        http::{
            header::{AUTHORIZATION, COOKIE},
            HeaderMap, HeaderValue, StatusCode,
        },
        response::IntoResponse,
    };

    use super::super::middleware::*;

    fn headers(name: axum::http::HeaderName, value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(name, HeaderValue::from_static(value));
        headers
    }

    #[test]
    fn test_cookie_value_finds_named_cookie() {
        let headers = headers(COOKIE, "theme=dark; passgate_profile_session=abc123; lang=ru");
        assert_eq!(
            cookie_value(&headers, SESSION_COOKIE).as_deref(),
            Some("abc123")
        );
    }

    #[test]
    fn test_cookie_value_ignores_prefixed_names_and_empty_values() {
        let headers = headers(
            COOKIE,
            "passgate_profile_session_old=zzz; passgate_profile_session=",
        );
        assert_eq!(cookie_value(&headers, SESSION_COOKIE), None);
        assert_eq!(cookie_value(&HeaderMap::new(), SESSION_COOKIE), None);
    }

    #[test]
    fn test_bearer_token_extraction() {
        assert_eq!(
            extract_bearer_token(&headers(AUTHORIZATION, "Bearer s3cret")),
            Some("s3cret")
        );
        assert_eq!(extract_bearer_token(&headers(AUTHORIZATION, "Basic abc")), None);
        assert_eq!(extract_bearer_token(&headers(AUTHORIZATION, "Bearer ")), None);
        assert_eq!(extract_bearer_token(&HeaderMap::new()), None);
    }

    #[test]
    fn test_session_cookie_attributes() {
        let cookie = session_cookie("key", true);
        assert!(cookie.starts_with("passgate_profile_session=key;"));
        assert!(cookie.contains("Path=/profile"));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("SameSite=Lax"));
        assert!(cookie.contains("Max-Age=3600"));
        assert!(cookie.ends_with("; Secure"));

        assert!(!session_cookie("key", false).contains("Secure"));
        assert!(clear_session_cookie(false).contains("Max-Age=0"));
    }

    #[test]
    fn test_auth_error_statuses() {
        assert_eq!(
            AuthError::MissingAuth.into_response().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AuthError::InvalidToken.into_response().status(),
            StatusCode::UNAUTHORIZED
        );

        let expired = AuthError::SessionExpired {
            bot_url: None,
            secure_cookie: false,
        }
        .into_response();
        assert_eq!(expired.status(), StatusCode::GONE);
        assert!(expired.headers().contains_key("set-cookie"));
    }
}
