use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::identity::SessionSettings;

/// Application configuration loaded from environment variables.
///
/// | Env Var                    | Default            |
/// |----------------------------|--------------------|
/// | `SERVER_PORT`              | `8080`             |
/// | `SESSION_DIR`              | `/tmp/session`     |
/// | `SESSION_DURATION`         | `18000000` (5h ms) |
/// | `SESSION_REFRESH_INTERVAL` | `60000` (ms)       |
/// | `SESSION_REFRESH_FRACTION` | `0.5`              |
/// | `SESSION_IO_TIMEOUT`       | `2000` (ms)        |
/// | `SESSION_COOKIE_NAME`      | `session-id`       |
/// | `SESSION_COOKIE_DURATION`  | session duration   |
/// | `SESSION_HTTPS_ONLY`       | `false`            |
/// | `USERS_DB_PATH`            | unset              |
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub session: SessionSettings,
    pub cookie: CookieConfig,
    /// JSON users db imported at startup, if any.
    pub users_db: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct CookieConfig {
    pub name: String,
    /// Should match the session duration.
    pub duration: Duration,
    pub https_only: bool,
}

const DEFAULT_SESSION_DURATION_MS: u64 = 5 * 60 * 60 * 1000;
const DEFAULT_SWEEP_INTERVAL_MS: u64 = 60 * 1000;

impl AppConfig {
    pub fn from_env() -> Result<Self> { Self::from_lookup(|k| std::env::var(k).ok()) }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let port = parse_or(&get, "SERVER_PORT", 8080u16)?;
        let dir = get("SESSION_DIR").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("/tmp/session"));
        let duration = Duration::from_millis(parse_or(&get, "SESSION_DURATION", DEFAULT_SESSION_DURATION_MS)?);
        let sweep = Duration::from_millis(parse_or(&get, "SESSION_REFRESH_INTERVAL", DEFAULT_SWEEP_INTERVAL_MS)?);
        let fraction = parse_or(&get, "SESSION_REFRESH_FRACTION", 0.5f64)?;
        let io_timeout = Duration::from_millis(parse_or(&get, "SESSION_IO_TIMEOUT", 2000u64)?);

        let session = SessionSettings::new(dir, duration, sweep)
            .with_refresh_fraction(fraction)
            .with_io_timeout(io_timeout);
        session.validate().context("session settings")?;

        let cookie_duration = match get("SESSION_COOKIE_DURATION") {
            Some(_) => Duration::from_millis(parse_or(&get, "SESSION_COOKIE_DURATION", 0u64)?),
            None => duration,
        };
        if cookie_duration.is_zero() { anyhow::bail!("SESSION_COOKIE_DURATION must be positive"); }
        let cookie = CookieConfig {
            name: get("SESSION_COOKIE_NAME").unwrap_or_else(|| "session-id".to_string()),
            duration: cookie_duration,
            https_only: parse_bool(&get, "SESSION_HTTPS_ONLY")?.unwrap_or(false),
        };

        Ok(Self {
            server: ServerConfig { port },
            session,
            cookie,
            users_db: get("USERS_DB_PATH").map(PathBuf::from),
        })
    }
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match get(key) {
        Some(raw) => raw.trim().parse::<T>().with_context(|| format!("{key} has an invalid value: {raw:?}")),
        None => Ok(default),
    }
}

fn parse_bool(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<bool>> {
    match get(key) {
        Some(v) => match v.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            other => anyhow::bail!("{key} must be a boolean, got {other:?}"),
        },
        None => Ok(None),
    }
}
