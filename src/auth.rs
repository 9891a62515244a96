//! The `AuthResolver` external interface from spec.md \S6.
//!
//! The real JWT verification (`original_source/backend/auth.py`) is out
//! of scope per spec.md \S1. This module defines the trait the core
//! consumes and ships a minimal in-memory resolver so the binary and
//! integration tests have something concrete to run against; a
//! production deployment supplies its own resolver backed by the real
//! session/identity service.

use std::collections::HashMap;

use async_trait::async_trait;

/// A resolved connection identity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Identity {
    Guest,
    User { id: String, name: String, active: bool },
}

impl Identity {
    pub fn display_name(&self) -> &str {
        match self {
            Identity::Guest => "Guest",
            Identity::User { name, .. } => name,
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        match self {
            Identity::Guest => None,
            Identity::User { id, .. } => Some(id),
        }
    }

    pub fn is_guest(&self) -> bool {
        matches!(self, Identity::Guest)
    }
}

/// Resolves a bearer token into an identity. A missing or malformed token
/// must not be treated as an error: spec.md \S4.3 step 1 says it yields
/// guest identity, not rejection.
#[async_trait]
pub trait AuthResolver: Send + Sync {
    async fn resolve(&self, token: Option<&str>) -> Identity;
}

/// A static table of valid tokens, for the bundled binary and tests.
/// Stands in for the JWT verification the original performs in
/// `auth.py::verify_token` / `get_current_user_or_guest`.
#[derive(Default)]
pub struct DevTokenResolver {
    tokens: HashMap<String, (String, String)>,
}

impl DevTokenResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, user_id: impl Into<String>, name: impl Into<String>) -> Self {
        self.tokens.insert(token.into(), (user_id.into(), name.into()));
        self
    }
}

#[async_trait]
impl AuthResolver for DevTokenResolver {
    async fn resolve(&self, token: Option<&str>) -> Identity {
        match token.and_then(|t| self.tokens.get(t)) {
            Some((id, name)) => Identity::User {
                id: id.clone(),
                name: name.clone(),
                active: true,
            },
            None => Identity::Guest,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_token_is_guest() {
        let resolver = DevTokenResolver::new();
        assert_eq!(resolver.resolve(None).await, Identity::Guest);
    }

    #[tokio::test]
    async fn unknown_token_is_guest() {
        let resolver = DevTokenResolver::new();
        assert_eq!(resolver.resolve(Some("nope")).await, Identity::Guest);
    }

    #[tokio::test]
    async fn known_token_resolves_user() {
        let resolver = DevTokenResolver::new().with_token("tok-1", "u1", "Ada");
        let identity = resolver.resolve(Some("tok-1")).await;
        assert_eq!(
            identity,
            Identity::User {
                id: "u1".to_string(),
                name: "Ada".to_string(),
                active: true,
            }
        );
    }
}
