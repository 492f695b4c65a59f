//! Outgoing authentication toward backend MCP servers: static headers or
//! an OAuth2 client-credentials flow with a cached, auto-refreshing token.

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::config::OutgoingAuthConfig;

/// Margin subtracted from a token's reported `expires_in` before it's
/// considered stale, so a refresh happens before the backend rejects it.
const REFRESH_BUFFER: std::time::Duration = std::time::Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

struct CachedToken {
    token: String,
    expires_at: tokio::time::Instant,
}

/// Resolves and caches the Authorization header value for a backend connection.
pub enum OutgoingAuth {
    None,
    Static {
        headers: Vec<(String, String)>,
    },
    OAuth2ClientCredentials {
        token_url: String,
        client_id: String,
        client_secret: String,
        scope: Option<String>,
        client: reqwest::Client,
        cached: Mutex<Option<CachedToken>>,
    },
}

impl OutgoingAuth {
    pub fn from_config(config: &OutgoingAuthConfig) -> Self {
        match config {
            OutgoingAuthConfig::None => OutgoingAuth::None,
            OutgoingAuthConfig::Static { headers } => OutgoingAuth::Static {
                headers: headers.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            },
            OutgoingAuthConfig::OAuth2ClientCredentials {
                token_url,
                client_id,
                client_secret,
                scope,
            } => OutgoingAuth::OAuth2ClientCredentials {
                token_url: token_url.clone(),
                client_id: client_id.clone(),
                client_secret: client_secret.clone(),
                scope: scope.clone(),
                client: reqwest::Client::new(),
                cached: Mutex::new(None),
            },
        }
    }

    /// Extra headers to attach to every outgoing request to the backend.
    pub async fn headers(&self) -> Result<Vec<(String, String)>> {
        match self {
            OutgoingAuth::None => Ok(Vec::new()),
            OutgoingAuth::Static { headers } => Ok(headers.clone()),
            OutgoingAuth::OAuth2ClientCredentials { .. } => {
                let token = self.access_token().await?;
                Ok(vec![("Authorization".to_string(), format!("Bearer {token}"))])
            }
        }
    }

    /// Fetch a cached access token, refreshing it if expired or absent.
    /// Called again after a 401 to force one retry with a freshly minted token.
    pub async fn access_token(&self) -> Result<String> {
        let OutgoingAuth::OAuth2ClientCredentials {
            token_url,
            client_id,
            client_secret,
            scope,
            client,
            cached,
        } = self
        else {
            anyhow::bail!("access_token() called on a non-oauth2 auth config");
        };

        let mut guard = cached.lock().await;
        if let Some(existing) = guard.as_ref()
            && existing.expires_at > tokio::time::Instant::now()
        {
            return Ok(existing.token.clone());
        }

        let fetched = fetch_token(client, token_url, client_id, client_secret, scope.as_deref())
            .await
            .context("failed to fetch oauth2 client-credentials token")?;

        let ttl = fetched
            .expires_in
            .map(std::time::Duration::from_secs)
            .unwrap_or(std::time::Duration::from_secs(3600));
        let ttl = ttl.saturating_sub(REFRESH_BUFFER);

        *guard = Some(CachedToken {
            token: fetched.access_token.clone(),
            expires_at: tokio::time::Instant::now() + ttl,
        });

        Ok(fetched.access_token)
    }

    /// Drop the cached token so the next `access_token()` call re-fetches.
    /// Used after a 401 response to retry once against a rotated token.
    pub async fn invalidate(&self) {
        if let OutgoingAuth::OAuth2ClientCredentials { cached, .. } = self {
            *cached.lock().await = None;
        }
    }
}

async fn fetch_token(
    client: &reqwest::Client,
    token_url: &str,
    client_id: &str,
    client_secret: &str,
    scope: Option<&str>,
) -> Result<TokenResponse> {
    let mut form = vec![
        ("grant_type", "client_credentials"),
        ("client_id", client_id),
        ("client_secret", client_secret),
    ];
    if let Some(scope) = scope {
        form.push(("scope", scope));
    }

    let response = client
        .post(token_url)
        .form(&form)
        .send()
        .await
        .context("token request failed")?
        .error_for_status()
        .context("token endpoint returned an error status")?;

    response
        .json::<TokenResponse>()
        .await
        .context("token response was not valid JSON")
}
