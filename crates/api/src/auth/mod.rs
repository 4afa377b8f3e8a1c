//! Authentication module for PassGate

#[cfg(test)]
mod edge_case_tests;
pub mod middleware;
#[cfg(test)]
mod middleware_tests;
pub mod sessions;

pub use middleware::{
    clear_session_cookie, cookie_value, expired_page, extract_bearer_token, require_admin,
    session_cookie, AuthError, ProfileUser, SESSION_COOKIE,
};
pub use sessions::{
    AccessLink, CleanupReport, ProfileSession, ProfileSessions, ACCESS_TOKEN_TTL, SESSION_TTL,
    TOKEN_REUSE_GRACE,
};
