//! Session-token verification seam.
//!
//! Token issuance and signature checking live with the identity
//! collaborator; the server only needs `token -> user id`.

use anyhow::Result;
use async_trait::async_trait;

#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<String>;
}

/// Development verifier: the token *is* the user id. Stands in until a
/// signed-token verifier is wired against the identity service.
pub struct PlainTokenVerifier;

#[async_trait]
impl TokenVerifier for PlainTokenVerifier {
    async fn verify(&self, token: &str) -> Result<String> {
        let token = token.trim();
        if token.is_empty() {
            anyhow::bail!("empty token");
        }
        Ok(token.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn plain_verifier_accepts_non_empty_tokens() {
        let verifier = PlainTokenVerifier;
        assert_eq!(verifier.verify("alice").await.unwrap(), "alice");
        assert!(verifier.verify("   ").await.is_err());
    }
}
