//!
//! wisdom HTTP server
//! ------------------
//! Axum router for the sign-in surface of the wisdom app.
//!
//! Responsibilities:
//! - Open the session store and start its background sweep.
//! - Sign-in / sign-out endpoints that create and delete sessions and write the cookie,
//!   plus per-field validation of the sign-in form.
//! - Run every request through the session middleware, which redirects
//!   unauthenticated requests for protected paths to the sign-in page.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::{Form, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::error::AppResult;
use crate::identity::{Clock, SessionStore, SystemClock};
use crate::users::{import_users, Argon2PasswordHasher, InMemoryUserRepository, UserService};
use crate::web::{authenticate_request, redirect, CurrentUser, PublicPaths, SessionAuth, SessionCookies};

pub const SIGN_IN_ENDPOINT: &str = "/user/sign-in";
pub const SIGN_IN_EXECUTE_ENDPOINT: &str = "/user/sign-in/execute";
pub const SIGN_IN_VALIDATE_NAME_ENDPOINT: &str = "/user/sign-in/validate-name";
pub const SIGN_IN_VALIDATE_PASSWORD_ENDPOINT: &str = "/user/sign-in/validate-password";
pub const SIGN_OUT_ENDPOINT: &str = "/user/sign-out";
pub const HOME_ENDPOINT: &str = "/";

/// Shared server state injected into all handlers.
#[derive(Clone)]
pub struct AppState {
    pub auth: SessionAuth,
    pub users: Arc<UserService>,
}

/// Missing fields read as empty and fail validation like blank ones.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SignInPayload { name: String, password: String }

/// Answer of the per-field validation endpoints: the field's error code, if
/// any, and whether the whole form would pass.
#[derive(Debug, Serialize)]
struct FieldValidation {
    error: Option<&'static str>,
    form_valid: bool,
}

/// Build the router with the session middleware applied to every route.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route(HOME_ENDPOINT, get(home))
        .route(SIGN_IN_ENDPOINT, get(sign_in_page))
        .route(SIGN_IN_EXECUTE_ENDPOINT, post(sign_in))
        .route(SIGN_IN_VALIDATE_NAME_ENDPOINT, post(validate_name))
        .route(SIGN_IN_VALIDATE_PASSWORD_ENDPOINT, post(validate_password))
        .route(SIGN_OUT_ENDPOINT, post(sign_out))
        .route("/user", get(current_user))
        .layer(middleware::from_fn_with_state(state.auth.clone(), authenticate_request))
        .with_state(state)
}

async fn home(CurrentUser(user): CurrentUser) -> impl IntoResponse {
    format!("Some wisdom for {}", user.name)
}

async fn sign_in_page(user: Option<CurrentUser>) -> Response {
    if user.is_some() { return redirect(HOME_ENDPOINT); }
    "sign in".into_response()
}

async fn sign_in(State(state): State<AppState>, Form(payload): Form<SignInPayload>) -> AppResult<Response> {
    let user = state.users.sign_in(&payload.name, &payload.password)?;
    let token = state.auth.sessions.create(&user).await?;
    info!(user_id = user.id, "user signed in");
    let mut res = redirect(HOME_ENDPOINT);
    state.auth.cookies.set_cookie(res.headers_mut(), &token, false);
    Ok(res)
}

async fn validate_name(State(state): State<AppState>, Form(payload): Form<SignInPayload>) -> Json<FieldValidation> {
    let name_error = state.users.validate_user_name(&payload.name);
    let password_error = state.users.validate_user_password(&payload.password);
    Json(FieldValidation { error: name_error, form_valid: name_error.is_none() && password_error.is_none() })
}

async fn validate_password(State(state): State<AppState>, Form(payload): Form<SignInPayload>) -> Json<FieldValidation> {
    let name_error = state.users.validate_user_name(&payload.name);
    let password_error = state.users.validate_user_password(&payload.password);
    Json(FieldValidation { error: password_error, form_valid: name_error.is_none() && password_error.is_none() })
}

async fn sign_out(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let mut res = redirect(SIGN_IN_ENDPOINT);
    if let Some(token) = state.auth.cookies.session_from_cookie(&headers) {
        match state.auth.sessions.delete(&token).await {
            Ok(_) => {}
            Err(e) => warn!(error = %e, "sign-out could not fully remove session"),
        }
        state.auth.cookies.set_cookie(res.headers_mut(), &token, true);
    }
    res
}

async fn current_user(user: Option<CurrentUser>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "name": user.map(|CurrentUser(u)| u.name) }))
}

/// Wire config into a ready-to-serve state. Opens (and reloads) the session
/// store and imports the users db when one is configured.
pub async fn build_state(config: &AppConfig, clock: Arc<dyn Clock>) -> anyhow::Result<AppState> {
    let sessions = SessionStore::open(config.session.clone(), clock.clone())
        .await
        .with_context(|| format!("While opening session store at {}", config.session.dir.display()))?;
    let repo = Arc::new(InMemoryUserRepository::new());
    if let Some(path) = &config.users_db {
        if let Err(e) = import_users(path, repo.as_ref()) {
            warn!("Failed to load users db: {:#}", e);
        }
    }
    let users = Arc::new(UserService::new(repo, Arc::new(Argon2PasswordHasher)));
    let cookies = SessionCookies::new(config.cookie.name.clone(), config.cookie.duration, config.cookie.https_only, clock)
        .context("While configuring the session cookie")?;
    Ok(AppState {
        auth: SessionAuth {
            sessions: Arc::new(sessions),
            cookies,
            public: PublicPaths::default(),
            sign_in_endpoint: SIGN_IN_ENDPOINT.to_string(),
        },
        users,
    })
}

/// Start the HTTP server with the given configuration.
pub async fn run(config: AppConfig) -> anyhow::Result<()> {
    let state = build_state(&config, Arc::new(SystemClock)).await?;
    let _sweeper = state.auth.sessions.spawn_sweeper();

    let app = router(state).layer(TraceLayer::new_for_http());
    let addr: SocketAddr = format!("0.0.0.0:{}", config.server.port).parse()?;
    info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
