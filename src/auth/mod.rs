//! Incoming authentication providers: anonymous, local static token, JWT
//! (JWKS-backed), and OIDC (discovery + JWKS).

pub mod jwt;
pub mod oidc;

use async_trait::async_trait;

use crate::config::IncomingAuthConfig;
use crate::errors::RequestError;
use crate::middleware::UserIdentity;

/// Resolves a bearer token into a caller identity.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn authenticate(&self, token: Option<&str>) -> Result<UserIdentity, RequestError>;
}

pub struct AnonymousProvider;

#[async_trait]
impl AuthProvider for AnonymousProvider {
    async fn authenticate(&self, _token: Option<&str>) -> Result<UserIdentity, RequestError> {
        Ok(UserIdentity {
            subject: "anonymous".to_string(),
            email: None,
            name: None,
            roles: Vec::new(),
            provider: "anonymous",
            claims: serde_json::Value::Null,
        })
    }
}

pub struct LocalProvider {
    token: String,
}

impl LocalProvider {
    pub fn new(token: String) -> Self {
        Self { token }
    }
}

#[async_trait]
impl AuthProvider for LocalProvider {
    async fn authenticate(&self, token: Option<&str>) -> Result<UserIdentity, RequestError> {
        let presented = token.ok_or_else(|| RequestError::Unauthorized("missing bearer token".to_string()))?;

        if !constant_time_eq(presented.as_bytes(), self.token.as_bytes()) {
            return Err(RequestError::Unauthorized("invalid token".to_string()));
        }

        Ok(UserIdentity {
            subject: "local".to_string(),
            email: None,
            name: None,
            roles: vec!["admin".to_string()],
            provider: "local",
            claims: serde_json::Value::Null,
        })
    }
}

/// Constant-time byte comparison so token-matching doesn't leak timing
/// information about where the first mismatching byte falls.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Builds the configured provider. OIDC wraps a JWT validator whose JWKS
/// URI is resolved lazily from the discovery document.
pub async fn build_provider(config: &IncomingAuthConfig) -> anyhow::Result<std::sync::Arc<dyn AuthProvider>> {
    match config {
        IncomingAuthConfig::Anonymous => Ok(std::sync::Arc::new(AnonymousProvider)),
        IncomingAuthConfig::Local { token } => Ok(std::sync::Arc::new(LocalProvider::new(token.clone()))),
        IncomingAuthConfig::Jwt { jwks_uri, issuer, audience, key_ttl } => {
            Ok(std::sync::Arc::new(jwt::JwtProvider::new(
                jwks_uri.clone(),
                issuer.clone(),
                audience.clone(),
                *key_ttl,
            )))
        }
        IncomingAuthConfig::Oidc { issuer, audience, key_ttl } => {
            let jwks_uri = oidc::discover_jwks_uri(issuer).await?;
            Ok(std::sync::Arc::new(jwt::JwtProvider::new(
                jwks_uri,
                issuer.clone(),
                audience.clone(),
                *key_ttl,
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn anonymous_always_succeeds() {
        let identity = AnonymousProvider.authenticate(None).await.unwrap();
        assert_eq!(identity.subject, "anonymous");
    }

    #[tokio::test]
    async fn local_rejects_missing_token() {
        let provider = LocalProvider::new("secret".to_string());
        assert!(provider.authenticate(None).await.is_err());
    }

    #[tokio::test]
    async fn local_rejects_wrong_token() {
        let provider = LocalProvider::new("secret".to_string());
        assert!(provider.authenticate(Some("wrong")).await.is_err());
    }

    #[tokio::test]
    async fn local_accepts_matching_token() {
        let provider = LocalProvider::new("secret".to_string());
        assert!(provider.authenticate(Some("secret")).await.is_ok());
    }

    #[test]
    fn constant_time_eq_rejects_different_lengths() {
        assert!(!constant_time_eq(b"abc", b"ab"));
    }
}
