use serde::{Deserialize, Serialize};

use crate::users::User;

/// Identity carried by a live session. Built once at sign-in and never
/// re-validated against the user store for the life of the session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct AuthUser {
    pub id: i64,
    pub name: String,
}

impl AuthUser {
    pub fn new(id: i64, name: impl Into<String>) -> Self { Self { id, name: name.into() } }
}

impl From<&User> for AuthUser {
    fn from(user: &User) -> Self { Self { id: user.id, name: user.name.clone() } }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn projection_drops_credentials() {
        let user = User { id: 7, name: "Marcus".into(), password: "$argon2id$v=19$...".into() };
        let au = AuthUser::from(&user);
        assert_eq!(au, AuthUser::new(7, "Marcus"));
        let json = serde_json::to_string(&au).unwrap();
        assert!(!json.contains("argon2"));
    }
}
