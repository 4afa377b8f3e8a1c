//! Authentication middleware for Axum
//!
//! Two principals exist: the bot and operators, who present the shared
//! admin token as a bearer credential, and browser users of the profile
//! pages, who carry a session cookie obtained through an access link.

use axum::{
    extract::{FromRequestParts, Request, State},
    http::{
        header::{AUTHORIZATION, COOKIE, SET_COOKIE},
        request::Parts,
        HeaderMap, HeaderValue, StatusCode,
    },
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use subtle::ConstantTimeEq;

use super::sessions::{ProfileSession, SESSION_TTL};
use crate::state::AppState;

pub const SESSION_COOKIE: &str = "passgate_profile_session";
const COOKIE_PATH: &str = "/profile";

/// Value of a named cookie from the `Cookie` header.
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let cookies = headers.get(COOKIE).and_then(|h| h.to_str().ok())?;
    cookies.split(';').find_map(|cookie| {
        cookie
            .trim()
            .strip_prefix(name)
            .and_then(|rest| rest.strip_prefix('='))
            .filter(|value| !value.is_empty())
            .map(String::from)
    })
}

pub fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|header| header.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// `Set-Cookie` value for a fresh profile session.
pub fn session_cookie(session_key: &str, secure: bool) -> String {
    let mut cookie = format!(
        "{SESSION_COOKIE}={session_key}; Path={COOKIE_PATH}; HttpOnly; SameSite=Lax; Max-Age={}",
        SESSION_TTL.whole_seconds()
    );
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

/// `Set-Cookie` value that removes the profile session.
pub fn clear_session_cookie(secure: bool) -> String {
    let mut cookie =
        format!("{SESSION_COOKIE}=; Path={COOKIE_PATH}; HttpOnly; SameSite=Lax; Max-Age=0");
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

/// Guard for the admin and trusted-bot routes.
pub async fn require_admin(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(token) = extract_bearer_token(request.headers()) else {
        return AuthError::MissingAuth.into_response();
    };

    let expected = state.config.admin_token.as_bytes();
    let matches = token.len() == expected.len() && bool::from(token.as_bytes().ct_eq(expected));
    if !matches {
        tracing::warn!(
            security_event = true,
            path = %request.uri().path(),
            "Rejected admin request with invalid token"
        );
        return AuthError::InvalidToken.into_response();
    }

    next.run(request).await
}

/// Extractor for handlers behind the profile session cookie.
#[derive(Debug, Clone)]
pub struct ProfileUser(pub ProfileSession);

impl FromRequestParts<AppState> for ProfileUser {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let expired = || AuthError::SessionExpired {
            bot_url: state.config.bot_url(),
            secure_cookie: state.config.secure_cookies(),
        };

        let Some(session_key) = cookie_value(&parts.headers, SESSION_COOKIE) else {
            return Err(expired());
        };

        match state.profiles.touch(&session_key).await {
            Ok(Some(session)) => Ok(ProfileUser(session)),
            Ok(None) => Err(expired()),
            Err(e) => {
                tracing::error!(error = %e, "Failed to resolve profile session");
                Err(AuthError::Internal(e.to_string()))
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing authentication")]
    MissingAuth,
    #[error("Invalid or expired token")]
    InvalidToken,
    /// The profile link or session is no longer valid.
    #[error("Profile session expired")]
    SessionExpired {
        bot_url: Option<String>,
        secure_cookie: bool,
    },
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        match self {
            AuthError::SessionExpired {
                bot_url,
                secure_cookie,
            } => expired_page(bot_url, secure_cookie),
            other => {
                let (status, message) = match other {
                    AuthError::MissingAuth => (StatusCode::UNAUTHORIZED, "Authentication required"),
                    AuthError::InvalidToken => {
                        (StatusCode::UNAUTHORIZED, "Invalid or expired token")
                    }
                    _ => (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error"),
                };

                let body = Json(json!({
                    "error": message,
                    "code": status.as_u16()
                }));

                (status, body).into_response()
            }
        }
    }
}

/// 410 page for stale links and sessions, pointing back to the bot. The
/// session cookie is dropped.
pub fn expired_page(bot_url: Option<String>, secure_cookie: bool) -> Response {
    let body = Json(json!({
        "error": "link_expired",
        "message": "This link has expired. Ask the bot for a new one.",
        "botUrl": bot_url,
    }));

    let mut response = (StatusCode::GONE, body).into_response();
    if let Ok(value) = HeaderValue::from_str(&clear_session_cookie(secure_cookie)) {
        response.headers_mut().insert(SET_COOKIE, value);
    }
    response
}
