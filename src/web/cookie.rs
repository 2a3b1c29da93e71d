//! Session cookie codec: `Cookie` parsing and `Set-Cookie` serialization.
//!
//! The `Expires` attribute only informs the browser. Liveness is decided by the
//! session store alone; both use the same clock and duration.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use axum::http::header::{COOKIE, SET_COOKIE};
use axum::http::{HeaderMap, HeaderValue};
use chrono::{DateTime, Duration, Utc};
use tracing::warn;

use crate::identity::{Clock, SessionError};

const REVOKED_VALUE: &str = "deleted";
const EPOCH_EXPIRES: &str = "Thu, 01 Jan 1970 00:00:00 GMT";

#[derive(Clone)]
pub struct SessionCookies {
    name: String,
    duration: Duration,
    https_only: bool,
    clock: Arc<dyn Clock>,
}

fn rfc1123(at: DateTime<Utc>) -> String { at.format("%a, %d %b %Y %H:%M:%S GMT").to_string() }

impl SessionCookies {
    /// Fails for a zero duration or one too large to add to a timestamp.
    pub fn new(name: impl Into<String>, duration: StdDuration, https_only: bool, clock: Arc<dyn Clock>) -> Result<Self, SessionError> {
        if duration.is_zero() { return Err(SessionError::Config("cookie duration must be positive".into())); }
        let duration = Duration::from_std(duration)
            .ok()
            .filter(|d| clock.now().checked_add_signed(*d).is_some())
            .ok_or_else(|| SessionError::Config(format!("cookie duration {duration:?} is out of range")))?;
        Ok(Self { name: name.into(), duration, https_only, clock })
    }

    pub fn name(&self) -> &str { &self.name }

    /// Value of the configured cookie across every `Cookie` header, or `None`.
    /// Pairs without `=` and other junk are skipped.
    pub fn session_from_cookie(&self, headers: &HeaderMap) -> Option<String> {
        for raw in headers.get_all(COOKIE) {
            let Ok(s) = raw.to_str() else { continue };
            for part in s.split(';') {
                let Some((k, v)) = part.split_once('=') else { continue };
                if k.trim() != self.name { continue; }
                let v = v.trim().trim_matches('"');
                if v.is_empty() { return None; }
                return Some(v.to_string());
            }
        }
        None
    }

    /// `Set-Cookie` value for `token`, or the immediately expiring placeholder
    /// when `revoke` is set.
    pub fn cookie_value(&self, token: &str, revoke: bool) -> String {
        let (value, expires) = if revoke {
            (REVOKED_VALUE, EPOCH_EXPIRES.to_string())
        } else {
            (token, rfc1123(self.clock.now() + self.duration))
        };
        let mut cookie = format!("{}={}; HttpOnly; SameSite=Strict; Path=/; Expires={}", self.name, value, expires);
        if self.https_only { cookie.push_str("; Secure"); }
        cookie
    }

    /// Append the session cookie (or its revocation) to response headers.
    pub fn set_cookie(&self, headers: &mut HeaderMap, token: &str, revoke: bool) {
        match HeaderValue::from_str(&self.cookie_value(token, revoke)) {
            Ok(v) => { headers.append(SET_COOKIE, v); }
            Err(e) => warn!(error = %e, "session cookie not representable as a header value"),
        }
    }
}
