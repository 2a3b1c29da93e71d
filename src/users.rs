//! User records, credential checks and the sign-in entry point that produces
//! the [`AuthUser`] a session is created for.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use argon2::{Argon2, PasswordHasher as _, PasswordVerifier};
use parking_lot::RwLock;
use password_hash::{PasswordHash, SaltString};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::identity::AuthUser;

const MIN_USER_NAME_LENGTH: usize = 2;
const MAX_USER_NAME_LENGTH: usize = 30;
const MIN_USER_PASSWORD_LENGTH: usize = 8;
const MAX_USER_PASSWORD_LENGTH: usize = 50;

pub const INVALID_USER_NAME: &str = "INVALID_USER_NAME";
pub const INVALID_USER_PASSWORD: &str = "INVALID_USER_PASSWORD";
pub const USER_DOES_NOT_EXIST: &str = "USER_DOES_NOT_EXIST";
pub const INCORRECT_USER_PASSWORD: &str = "INCORRECT_USER_PASSWORD";

/// Full user record. `password` holds the stored hash, never the raw password.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignInError {
    #[error("invalid sign-in input: {}", .0.join(", "))]
    InvalidInput(Vec<&'static str>),
    #[error("USER_DOES_NOT_EXIST")]
    UserDoesNotExist,
    #[error("INCORRECT_USER_PASSWORD")]
    IncorrectPassword,
}

impl SignInError {
    pub fn codes(&self) -> Vec<&'static str> {
        match self {
            SignInError::InvalidInput(codes) => codes.clone(),
            SignInError::UserDoesNotExist => vec![USER_DOES_NOT_EXIST],
            SignInError::IncorrectPassword => vec![INCORRECT_USER_PASSWORD],
        }
    }
}

pub trait UserRepository: Send + Sync {
    fn of_name(&self, name: &str) -> Option<User>;
    fn create(&self, user: User);
}

#[derive(Default)]
pub struct InMemoryUserRepository {
    db: RwLock<HashMap<i64, User>>,
}

impl InMemoryUserRepository {
    pub fn new() -> Self { Self::default() }
}

impl UserRepository for InMemoryUserRepository {
    fn of_name(&self, name: &str) -> Option<User> { self.db.read().values().find(|u| u.name == name).cloned() }

    fn create(&self, user: User) { self.db.write().insert(user.id, user); }
}

/// Pluggable credential check.
pub trait PasswordHasher: Send + Sync {
    fn verify(&self, raw_password: &str, stored_hash: &str) -> bool;
}

/// Argon2 over PHC strings.
#[derive(Debug, Clone, Copy, Default)]
pub struct Argon2PasswordHasher;

impl Argon2PasswordHasher {
    pub fn hash(&self, password: &str) -> Result<String> {
        let mut salt_bytes = [0u8; 16];
        getrandom::getrandom(&mut salt_bytes).map_err(|e| anyhow!(e.to_string()))?;
        let salt = SaltString::encode_b64(&salt_bytes).map_err(|e| anyhow!(e.to_string()))?;
        let phc = Argon2::default().hash_password(password.as_bytes(), &salt).map_err(|e| anyhow!(e.to_string()))?.to_string();
        Ok(phc)
    }
}

impl PasswordHasher for Argon2PasswordHasher {
    fn verify(&self, raw_password: &str, stored_hash: &str) -> bool {
        if let Ok(parsed) = PasswordHash::new(stored_hash) {
            Argon2::default().verify_password(raw_password.as_bytes(), &parsed).is_ok()
        } else { false }
    }
}

fn has_any_content(s: &str) -> bool { !s.trim().is_empty() }

fn has_length(s: &str, min: usize, max: usize) -> bool {
    let n = s.chars().count();
    n >= min && n <= max
}

pub struct UserService {
    repository: Arc<dyn UserRepository>,
    hasher: Arc<dyn PasswordHasher>,
}

impl UserService {
    pub fn new(repository: Arc<dyn UserRepository>, hasher: Arc<dyn PasswordHasher>) -> Self { Self { repository, hasher } }

    /// Check credentials and project the user down to the identity a session carries.
    pub fn sign_in(&self, name: &str, password: &str) -> Result<AuthUser, SignInError> {
        let errors: Vec<&'static str> = [self.validate_user_name(name), self.validate_user_password(password)]
            .into_iter()
            .flatten()
            .collect();
        if !errors.is_empty() { return Err(SignInError::InvalidInput(errors)); }

        let user = self.repository.of_name(name).ok_or(SignInError::UserDoesNotExist)?;
        if !self.hasher.verify(password, &user.password) { return Err(SignInError::IncorrectPassword); }
        Ok(AuthUser::from(&user))
    }

    pub fn validate_user_name(&self, name: &str) -> Option<&'static str> {
        if has_any_content(name) && has_length(name, MIN_USER_NAME_LENGTH, MAX_USER_NAME_LENGTH) { None } else { Some(INVALID_USER_NAME) }
    }

    pub fn validate_user_password(&self, password: &str) -> Option<&'static str> {
        if has_any_content(password) && has_length(password, MIN_USER_PASSWORD_LENGTH, MAX_USER_PASSWORD_LENGTH) { None } else { Some(INVALID_USER_PASSWORD) }
    }
}

/// Load `[{id, name, password}]` records from a JSON file into `repository`.
pub fn import_users(path: &Path, repository: &dyn UserRepository) -> Result<usize> {
    let bytes = std::fs::read(path).with_context(|| format!("reading users db {}", path.display()))?;
    let users: Vec<User> = serde_json::from_slice(&bytes).with_context(|| format!("parsing users db {}", path.display()))?;
    let n = users.len();
    for u in users { repository.create(u); }
    info!(users = n, path = %path.display(), "users db loaded");
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service_with(name: &str, password: &str) -> UserService {
        let repo = Arc::new(InMemoryUserRepository::new());
        let hasher = Argon2PasswordHasher;
        repo.create(User { id: 1, name: name.into(), password: hasher.hash(password).unwrap() });
        UserService::new(repo, Arc::new(hasher))
    }

    #[test]
    fn sign_in_projects_identity() {
        let svc = service_with("Seneca", "letters-to-lucilius");
        let au = svc.sign_in("Seneca", "letters-to-lucilius").unwrap();
        assert_eq!(au, AuthUser::new(1, "Seneca"));
    }

    #[test]
    fn sign_in_reports_every_input_error_at_once() {
        let svc = service_with("Seneca", "letters-to-lucilius");
        let err = svc.sign_in(" ", "short").unwrap_err();
        assert_eq!(err.codes(), vec![INVALID_USER_NAME, INVALID_USER_PASSWORD]);
    }

    #[test]
    fn sign_in_distinguishes_unknown_user_and_bad_password() {
        let svc = service_with("Seneca", "letters-to-lucilius");
        assert_eq!(svc.sign_in("Epictetus", "enchiridion").unwrap_err(), SignInError::UserDoesNotExist);
        assert_eq!(svc.sign_in("Seneca", "wrong-password").unwrap_err(), SignInError::IncorrectPassword);
    }

    #[test]
    fn length_limits_are_inclusive() {
        let svc = service_with("ab", "12345678");
        assert_eq!(svc.validate_user_name("ab"), None);
        assert_eq!(svc.validate_user_name("a"), Some(INVALID_USER_NAME));
        assert_eq!(svc.validate_user_name(&"x".repeat(30)), None);
        assert_eq!(svc.validate_user_name(&"x".repeat(31)), Some(INVALID_USER_NAME));
        assert_eq!(svc.validate_user_password("12345678"), None);
        assert_eq!(svc.validate_user_password(&"p".repeat(51)), Some(INVALID_USER_PASSWORD));
    }

    #[test]
    fn garbage_hash_never_verifies() {
        assert!(!Argon2PasswordHasher.verify("anything", "not-a-phc-string"));
    }

    #[test]
    fn import_reads_json_array() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");
        std::fs::write(&path, r#"[{"id":1,"name":"Marcus","password":"h1"},{"id":2,"name":"Zeno","password":"h2"}]"#).unwrap();
        let repo = InMemoryUserRepository::new();
        assert_eq!(import_users(&path, &repo).unwrap(), 2);
        assert_eq!(repo.of_name("Zeno").map(|u| u.id), Some(2));
        assert_eq!(repo.of_name("Seneca"), None);
    }
}
