//! Credential verification seam
//!
//! The coordination core never inspects raw credentials. A verifier turns a
//! credential into a resolved identity or rejects it; token formats and
//! signing live with whatever implements this trait.

use async_trait::async_trait;
use log::debug;
use std::collections::HashMap;

use crate::error::{PulseError, Result};

/// Identity produced by a successful verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedIdentity {
    pub user_id: String,
}

#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    /// Resolve a credential, or fail with `AuthError`
    async fn verify(&self, credential: &str) -> Result<VerifiedIdentity>;

    /// Name used in logs
    fn verifier_name(&self) -> &'static str;
}

/// Fixed token table, for development and tests
pub struct StaticIdentityVerifier {
    tokens: HashMap<String, String>,
}

impl StaticIdentityVerifier {
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }

    pub fn add_token(&mut self, token: impl Into<String>, user_id: impl Into<String>) {
        self.tokens.insert(token.into(), user_id.into());
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl IdentityVerifier for StaticIdentityVerifier {
    async fn verify(&self, credential: &str) -> Result<VerifiedIdentity> {
        match self.tokens.get(credential) {
            Some(user_id) => {
                debug!("{} verified user {}", self.verifier_name(), user_id);
                Ok(VerifiedIdentity {
                    user_id: user_id.clone(),
                })
            }
            None => Err(PulseError::AuthError("Invalid token".to_string())),
        }
    }

    fn verifier_name(&self) -> &'static str {
        "static"
    }
}
