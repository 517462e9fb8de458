//! Authentication capability consumed by the Session Core's facade
//! (`spec.md` §1: "The Session Core consumes an `AuthValidator`
//! capability"). The auth/key store itself is out of scope; this module
//! defines the trait boundary plus a default, config-driven implementation
//! so the daemon is runnable standalone.

use async_trait::async_trait;

/// Vets a bearer token and, if valid, returns the authenticated principal id.
/// An embedder wiring the Session Core into a larger product swaps this for
/// whatever its real key store looks like.
#[async_trait]
pub trait AuthValidator: Send + Sync {
    async fn validate(&self, token: &str) -> Option<String>;
}

/// Default implementation: a static allow-list of tokens loaded from
/// `Config::auth_tokens`. Each accepted token authenticates as itself (no
/// separate principal-id mapping), which is sufficient for a single-operator
/// deployment and keeps the daemon runnable without external wiring.
pub struct StaticTokenValidator {
    tokens: Vec<String>,
}

impl StaticTokenValidator {
    pub fn new(tokens: Vec<String>) -> Self {
        StaticTokenValidator { tokens }
    }
}

#[async_trait]
impl AuthValidator for StaticTokenValidator {
    async fn validate(&self, token: &str) -> Option<String> {
        if self.tokens.iter().any(|t| t == token) {
            Some(token.to_string())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[tokio::test]
    async fn known_token_validates_to_itself() {
        let validator = StaticTokenValidator::new(vec!["secret".to_string()]);
        assert_eq!(validator.validate("secret").await, Some("secret".to_string()));
    }

    #[tokio::test]
    async fn unknown_token_is_rejected() {
        let validator = StaticTokenValidator::new(vec!["secret".to_string()]);
        assert_eq!(validator.validate("nope").await, None);
    }
}
