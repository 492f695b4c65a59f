//! OIDC discovery: fetches `${issuer}/.well-known/openid-configuration` and
//! extracts `jwks_uri`.
//!
//! The original source shortcuts this by using the issuer URL directly as
//! the JWKS endpoint; this crate performs real discovery instead.

use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct DiscoveryDocument {
    jwks_uri: String,
}

pub async fn discover_jwks_uri(issuer: &str) -> anyhow::Result<String> {
    let issuer = issuer.trim_end_matches('/');
    let discovery_url = format!("{issuer}/.well-known/openid-configuration");

    let doc: DiscoveryDocument = reqwest::get(&discovery_url)
        .await
        .map_err(|e| anyhow::anyhow!("OIDC discovery request to '{discovery_url}' failed: {e}"))?
        .json()
        .await
        .map_err(|e| anyhow::anyhow!("OIDC discovery document at '{discovery_url}' is malformed: {e}"))?;

    Ok(doc.jwks_uri)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovery_document_parses_jwks_uri() {
        let raw = r#"{"issuer":"https://example.com","jwks_uri":"https://example.com/jwks"}"#;
        let doc: DiscoveryDocument = serde_json::from_str(raw).unwrap();
        assert_eq!(doc.jwks_uri, "https://example.com/jwks");
    }
}
