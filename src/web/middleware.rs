//! Per-request session authentication.
//!
//! [`authenticate_request`] runs before every handler: it resolves the session
//! cookie to an identity, gates protected paths, and slides the session forward
//! when it is due for a refresh.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{FromRequestParts, OptionalFromRequestParts, Request, State};
use axum::http::header::{LOCATION, SET_COOKIE};
use axum::http::request::Parts;
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::{debug, warn};

use crate::error::AppError;
use crate::identity::{AuthUser, SessionStore};

use super::cookie::SessionCookies;

/// Paths reachable without a session: anything under one of `prefixes`, or
/// containing one of `markers` (static assets).
#[derive(Debug, Clone)]
pub struct PublicPaths {
    pub prefixes: Vec<String>,
    pub markers: Vec<String>,
}

impl Default for PublicPaths {
    fn default() -> Self {
        Self {
            prefixes: vec!["/user".into()],
            markers: vec![".css".into(), ".js".into(), ".ico".into()],
        }
    }
}

impl PublicPaths {
    pub fn is_public(&self, path: &str) -> bool {
        self.prefixes.iter().any(|p| path.starts_with(p.as_str())) || self.markers.iter().any(|m| path.contains(m.as_str()))
    }
}

/// Everything the middleware needs, cheap to clone into each request.
#[derive(Clone)]
pub struct SessionAuth {
    pub sessions: Arc<SessionStore>,
    pub cookies: SessionCookies,
    pub public: PublicPaths,
    pub sign_in_endpoint: String,
}

/// Identity attached to a request by [`authenticate_request`]. Read-only for
/// handlers; absent on public requests without a live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentUser(pub AuthUser);

impl<S: Send + Sync> FromRequestParts<S> for CurrentUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts.extensions.get::<CurrentUser>().cloned()
            .ok_or_else(|| AppError::auth("NOT_AUTHENTICATED", "no session attached to request"))
    }
}

impl<S: Send + Sync> OptionalFromRequestParts<S> for CurrentUser {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Option<Self>, Self::Rejection> {
        Ok(parts.extensions.get::<CurrentUser>().cloned())
    }
}

/// `302 Found` to `location`.
pub fn redirect(location: &str) -> Response {
    let mut res = StatusCode::FOUND.into_response();
    match HeaderValue::from_str(location) {
        Ok(v) => { res.headers_mut().insert(LOCATION, v); }
        Err(e) => warn!(error = %e, "redirect target is not a valid header value"),
    }
    res
}

pub async fn authenticate_request(State(auth): State<SessionAuth>, mut req: Request, next: Next) -> Response {
    let token = auth.cookies.session_from_cookie(req.headers());
    let user = match token.as_deref() {
        Some(t) => auth.sessions.authenticate(t).await,
        None => None,
    };
    if let Some(u) = &user {
        req.extensions_mut().insert(CurrentUser(u.clone()));
    }

    let path = req.uri().path().to_string();
    if user.is_none() && !auth.public.is_public(&path) {
        debug!(path = %path, had_cookie = token.is_some(), "unauthenticated request sent to sign-in");
        return redirect(&auth.sign_in_endpoint);
    }

    let reissue = match (&user, token) {
        (Some(u), Some(t)) if auth.sessions.should_refresh(&t) => match auth.sessions.refresh(&t).await {
            Ok(true) => Some(t),
            Ok(false) => None,
            Err(e) => {
                warn!(user_id = u.id, error = %e, "session refresh failed; keeping current expiry");
                None
            }
        },
        _ => None,
    };

    let mut res = next.run(req).await;
    if let Some(t) = reissue {
        // A handler that already wrote the session cookie (sign-out) has the last word.
        let prefix = format!("{}=", auth.cookies.name());
        let handler_set_cookie = res.headers().get_all(SET_COOKIE).iter()
            .any(|v| v.to_str().map(|s| s.starts_with(&prefix)).unwrap_or(false));
        if !handler_set_cookie { auth.cookies.set_cookie(res.headers_mut(), &t, false); }
    }
    res
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_paths_cover_user_routes_and_assets() {
        let p = PublicPaths::default();
        assert!(p.is_public("/user/sign-in"));
        assert!(p.is_public("/user"));
        assert!(p.is_public("/style.css"));
        assert!(p.is_public("/assets/index.js"));
        assert!(p.is_public("/favicon.ico"));
        assert!(!p.is_public("/"));
        assert!(!p.is_public("/authors/seneca"));
    }

    #[test]
    fn redirect_sets_location() {
        let res = redirect("/user/sign-in");
        assert_eq!(res.status(), StatusCode::FOUND);
        assert_eq!(res.headers().get(LOCATION).unwrap(), "/user/sign-in");
    }
}
