//! JWT validation against a JWKS endpoint, with TTL-cached keys and a
//! retry-once-on-invalid-signature path for key rotation.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use super::AuthProvider;
use crate::errors::RequestError;
use crate::middleware::UserIdentity;

const SUPPORTED_ALGORITHMS: &[Algorithm] = &[
    Algorithm::RS256,
    Algorithm::RS384,
    Algorithm::RS512,
    Algorithm::ES256,
    Algorithm::ES384,
];

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    roles: Option<Vec<String>>,
    #[serde(default)]
    realm_access: Option<RealmAccess>,
    #[serde(flatten)]
    raw: std::collections::HashMap<String, Value>,
}

#[derive(Debug, Deserialize)]
struct RealmAccess {
    #[serde(default)]
    roles: Vec<String>,
}

impl Claims {
    fn roles(&self) -> Vec<String> {
        self.roles
            .clone()
            .or_else(|| self.realm_access.as_ref().map(|r| r.roles.clone()))
            .unwrap_or_default()
    }
}

pub struct JwtProvider {
    jwks_uri: String,
    issuer: String,
    audience: String,
    key_ttl: Duration,
    client: reqwest::Client,
    cache: Mutex<Option<(JwkSet, Instant)>>,
}

impl JwtProvider {
    pub fn new(jwks_uri: String, issuer: String, audience: String, key_ttl: Duration) -> Self {
        Self {
            jwks_uri,
            issuer,
            audience,
            key_ttl,
            client: reqwest::Client::new(),
            cache: Mutex::new(None),
        }
    }

    async fn jwks(&self, force_refresh: bool) -> Result<JwkSet, RequestError> {
        let mut cache = self.cache.lock().await;
        if !force_refresh
            && let Some((set, fetched_at)) = cache.as_ref()
            && fetched_at.elapsed() < self.key_ttl
        {
            return Ok(set.clone());
        }

        debug!(jwks_uri = %self.jwks_uri, "fetching JWKS keys");
        let set: JwkSet = self
            .client
            .get(&self.jwks_uri)
            .send()
            .await
            .map_err(|e| RequestError::Unauthorized(format!("JWKS fetch failed: {e}")))?
            .json()
            .await
            .map_err(|e| RequestError::Unauthorized(format!("invalid JWKS document: {e}")))?;

        *cache = Some((set.clone(), Instant::now()));
        Ok(set)
    }

    fn decode_claims(&self, token: &str, jwks: &JwkSet) -> Result<Claims, jsonwebtoken::errors::Error> {
        let header = decode_header(token)?;
        let kid = header.kid.as_deref();
        let jwk = kid
            .and_then(|kid| jwks.keys.iter().find(|k| k.common.key_id.as_deref() == Some(kid)))
            .or_else(|| jwks.keys.first())
            .ok_or(jsonwebtoken::errors::ErrorKind::InvalidKeyFormat)?;

        let decoding_key = DecodingKey::from_jwk(jwk)?;

        let mut validation = Validation::new(header.alg);
        validation.algorithms = SUPPORTED_ALGORITHMS.to_vec();
        if !self.issuer.is_empty() {
            validation.set_issuer(&[self.issuer.clone()]);
        }
        if !self.audience.is_empty() {
            validation.set_audience(&[self.audience.clone()]);
        } else {
            validation.validate_aud = false;
        }

        decode::<Claims>(token, &decoding_key, &validation).map(|data| data.claims)
    }
}

#[async_trait]
impl AuthProvider for JwtProvider {
    async fn authenticate(&self, token: Option<&str>) -> Result<UserIdentity, RequestError> {
        let token = token.ok_or_else(|| RequestError::Unauthorized("missing bearer token".to_string()))?;

        let jwks = self.jwks(false).await?;
        let claims = match self.decode_claims(token, &jwks) {
            Ok(claims) => claims,
            Err(e) if matches!(e.kind(), jsonwebtoken::errors::ErrorKind::InvalidSignature) => {
                debug!("JWT signature invalid, re-fetching JWKS keys");
                let jwks = self.jwks(true).await?;
                self.decode_claims(token, &jwks)
                    .map_err(|e| RequestError::Unauthorized(format!("invalid token: {e}")))?
            }
            Err(e) => return Err(RequestError::Unauthorized(format!("invalid token: {e}"))),
        };

        Ok(UserIdentity {
            subject: claims.sub.clone(),
            email: claims.email.clone(),
            name: claims.name.clone(),
            roles: claims.roles(),
            provider: "jwt",
            claims: serde_json::to_value(&claims.raw).unwrap_or(Value::Null),
        })
    }
}
