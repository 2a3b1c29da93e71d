use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::error::SessionError;
use super::principal::AuthUser;

pub type SessionToken = String;

/// Raw entropy per token; 32 bytes encode to 43 base64url characters.
const TOKEN_BYTES: usize = 32;
pub const TOKEN_LEN: usize = 43;

/// Persisted unit of session state. One of these lives in `<dir>/<token>.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    pub token: SessionToken,
    pub user_id: i64,
    pub user_name: String,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl Session {
    pub fn new(token: SessionToken, user: &AuthUser, now: DateTime<Utc>) -> Self {
        Self {
            token,
            user_id: user.id,
            user_name: user.name.clone(),
            created_at: now,
            last_activity_at: now,
        }
    }

    pub fn user(&self) -> AuthUser { AuthUser::new(self.user_id, self.user_name.clone()) }

    pub fn expires_at(&self, duration: Duration) -> DateTime<Utc> { self.last_activity_at + duration }

    /// Live iff `now < last_activity_at + duration`.
    pub fn is_live(&self, now: DateTime<Utc>, duration: Duration) -> bool { now < self.expires_at(duration) }

    /// Copy with the activity anchor moved to `now`, never backwards.
    pub fn refreshed(&self, now: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        if now > next.last_activity_at { next.last_activity_at = now; }
        next
    }
}

/// Fresh unguessable token: OS randomness, base64url without padding.
pub fn generate_token() -> Result<SessionToken, SessionError> {
    let mut buf = [0u8; TOKEN_BYTES];
    getrandom::getrandom(&mut buf).map_err(|e| SessionError::Entropy(e.to_string()))?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(buf))
}

/// True when `token` has the exact shape `generate_token` produces. Anything
/// else never reaches the filesystem, which also rules out path traversal.
pub fn is_well_formed(token: &str) -> bool {
    token.len() == TOKEN_LEN
        && token.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}
