//! Authentication plugin contract.
//!
//! The connection drives authentication at two points: the initial
//! CONNECT command carries the method name and initial credentials, and a
//! broker may demand fresh credentials at any time with AUTH_CHALLENGE
//! (e.g. when a token nears expiry). Implementations that authenticate
//! with client certificates can additionally supply TLS key material.

use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// Client certificate and key supplied by an authentication plugin.
#[derive(Debug, Clone)]
pub struct TlsKeyMaterial {
    pub certificate_path: PathBuf,
    pub private_key_path: PathBuf,
}

/// An authentication method as seen by the connection.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Method name sent in the CONNECT command (e.g. `token`, `tls`).
    fn auth_method_name(&self) -> &str;

    /// Credentials for the initial CONNECT.
    async fn auth_data(&self) -> Result<Bytes>;

    /// Answer an AUTH_CHALLENGE from the broker.
    async fn authenticate(&self, challenge: Bytes) -> Result<Bytes>;

    /// Client certificate material for mutual TLS, when this method
    /// authenticates at the transport layer.
    fn tls_key_material(&self) -> Option<TlsKeyMaterial> {
        None
    }
}

/// The no-op authenticator: anonymous connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct AuthNone;

#[async_trait]
impl Authenticator for AuthNone {
    fn auth_method_name(&self) -> &str {
        "none"
    }

    async fn auth_data(&self) -> Result<Bytes> {
        Ok(Bytes::new())
    }

    async fn authenticate(&self, _challenge: Bytes) -> Result<Bytes> {
        Ok(Bytes::new())
    }
}

/// Static token authentication.
#[derive(Debug, Clone)]
pub struct AuthToken {
    token: String,
}

impl AuthToken {
    pub fn new(token: impl Into<String>) -> Self {
        AuthToken {
            token: token.into(),
        }
    }
}

#[async_trait]
impl Authenticator for AuthToken {
    fn auth_method_name(&self) -> &str {
        "token"
    }

    async fn auth_data(&self) -> Result<Bytes> {
        Ok(Bytes::from(self.token.clone()))
    }

    async fn authenticate(&self, _challenge: Bytes) -> Result<Bytes> {
        // Tokens are bearer credentials: the answer to a challenge is the
        // current token again.
        Ok(Bytes::from(self.token.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_auth_none() {
        let auth = AuthNone;
        assert_eq!(auth.auth_method_name(), "none");
        assert!(auth.auth_data().await.unwrap().is_empty());
        assert!(auth.authenticate(Bytes::new()).await.unwrap().is_empty());
        assert!(auth.tls_key_material().is_none());
    }

    #[tokio::test]
    async fn test_auth_token_answers_challenge_with_token() {
        let auth = AuthToken::new("jwt-abc");
        assert_eq!(auth.auth_method_name(), "token");
        assert_eq!(auth.auth_data().await.unwrap(), Bytes::from_static(b"jwt-abc"));
        assert_eq!(
            auth.authenticate(Bytes::from_static(b"nonce")).await.unwrap(),
            Bytes::from_static(b"jwt-abc")
        );
    }
}
