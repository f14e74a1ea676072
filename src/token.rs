//! Bearer credential sourcing (spec §4.6).
//!
//! Two variants: a fixed static bearer, or a signed short-lived token
//! exchanged for a scoped session token via OAuth JWT-bearer. Both are
//! exposed behind the same `get()` call so [`crate::ingest::client::IngestClient`]
//! doesn't need to know which mode is active.

use base64::Engine;
use chrono::Utc;
use jsonwebtoken::{encode, EncodingKey, Header};
use rsa::pkcs8::{DecodePrivateKey, EncodePublicKey};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const SIGNED_TOKEN_TTL: Duration = Duration::from_secs(59 * 60);
const REFRESH_MARGIN: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("reading private key file '{0}': {1}")]
    KeyFileIo(String, String),
    #[error("invalid private key: {0}")]
    InvalidKey(String),
    #[error("signing local token failed: {0}")]
    Sign(String),
    #[error("token exchange request failed: {0}")]
    Exchange(String),
    #[error("token exchange returned {0}: {1}")]
    ExchangeStatus(u16, String),
}

#[derive(Debug, Clone)]
struct Credential {
    bearer: String,
    expires_at: Option<Instant>,
}

impl Credential {
    fn needs_refresh(&self) -> bool {
        match self.expires_at {
            None => false,
            Some(exp) => Instant::now() + REFRESH_MARGIN >= exp,
        }
    }
}

/// Returns a currently-valid bearer credential, refreshing transparently
/// as needed. Safe for concurrent callers from multiple threads —
/// concurrent refreshes are serialized behind the inner mutex so only one
/// exchange happens at a time (spec §4.6 "concurrent callers share a
/// single refresh").
pub enum TokenSource {
    Static(String),
    Signed(SignedTokenSource),
}

impl TokenSource {
    pub fn static_bearer(token: impl Into<String>) -> Self {
        TokenSource::Static(token.into())
    }

    pub fn signed(params: SignedTokenParams) -> Result<Self, TokenError> {
        Ok(TokenSource::Signed(SignedTokenSource::new(params)?))
    }

    pub async fn get(&self) -> Result<String, TokenError> {
        match self {
            TokenSource::Static(t) => Ok(t.clone()),
            TokenSource::Signed(s) => s.get().await,
        }
    }

    /// Force a refresh on the next `get()` call (used after a 401 per
    /// spec §4.7's classification table). No-op for static bearers.
    pub async fn force_refresh(&self) {
        if let TokenSource::Signed(s) = self {
            s.invalidate().await;
        }
    }
}

pub struct SignedTokenParams {
    pub account: String,
    pub user: String,
    pub role: String,
    pub oauth_url: String,
    pub private_key_pem: String,
}

pub struct SignedTokenSource {
    account: String,
    user: String,
    role: String,
    oauth_url: String,
    encoding_key: EncodingKey,
    fingerprint: String,
    http: reqwest::Client,
    cached: Mutex<Option<Credential>>,
}

impl SignedTokenSource {
    pub fn new(params: SignedTokenParams) -> Result<Self, TokenError> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(&params.private_key_pem)
            .map_err(|e| TokenError::InvalidKey(e.to_string()))?;
        let public_key = RsaPublicKey::from(&private_key);
        let der = public_key
            .to_public_key_der()
            .map_err(|e| TokenError::InvalidKey(e.to_string()))?;
        let fingerprint = format!(
            "SHA256:{}",
            base64::engine::general_purpose::STANDARD.encode(Sha256::digest(der.as_bytes()))
        );

        let encoding_key = EncodingKey::from_rsa_pem(params.private_key_pem.as_bytes())
            .map_err(|e| TokenError::InvalidKey(e.to_string()))?;

        Ok(SignedTokenSource {
            account: params.account,
            user: params.user,
            role: params.role,
            oauth_url: params.oauth_url,
            encoding_key,
            fingerprint,
            http: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(5))
                .timeout(Duration::from_secs(30))
                .build()
                .expect("reqwest client builds"),
            cached: Mutex::new(None),
        })
    }

    pub async fn get(&self) -> Result<String, TokenError> {
        let mut cached = self.cached.lock().await;
        if let Some(c) = cached.as_ref() {
            if !c.needs_refresh() {
                return Ok(c.bearer.clone());
            }
        }
        let fresh = self.exchange().await?;
        *cached = Some(fresh.clone());
        Ok(fresh.bearer)
    }

    pub async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }

    fn mint_signed_jwt(&self) -> Result<String, TokenError> {
        let now = Utc::now().timestamp();
        let claims = SignedClaims {
            iss: format!("{}.{}.{}", self.account, self.user, self.fingerprint),
            sub: format!("{}.{}", self.account, self.user),
            iat: now,
            exp: now + SIGNED_TOKEN_TTL.as_secs() as i64,
        };
        encode(&Header::new(jsonwebtoken::Algorithm::RS256), &claims, &self.encoding_key)
            .map_err(|e| TokenError::Sign(e.to_string()))
    }

    async fn exchange(&self) -> Result<Credential, TokenError> {
        let assertion = self.mint_signed_jwt()?;

        let scope = format!(
            "SESSION:ROLE-ANY:{} {}.snowflakecomputing.com",
            self.role, self.account
        );
        let form = [
            ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
            ("scope", scope.as_str()),
            ("assertion", assertion.as_str()),
        ];

        let response = self
            .http
            .post(&self.oauth_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| TokenError::Exchange(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TokenError::ExchangeStatus(status.as_u16(), body));
        }

        let body: OAuthResponse = response
            .json()
            .await
            .map_err(|e| TokenError::Exchange(e.to_string()))?;

        Ok(Credential {
            bearer: body.access_token,
            expires_at: Some(Instant::now() + Duration::from_secs(body.expires_in)),
        })
    }
}

#[derive(Debug, Serialize)]
struct SignedClaims {
    iss: String,
    sub: String,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct OAuthResponse {
    access_token: String,
    expires_in: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_bearer_never_refreshes() {
        let source = TokenSource::static_bearer("fixed-token");
        assert_eq!(source.get().await.unwrap(), "fixed-token");
        source.force_refresh().await;
        assert_eq!(source.get().await.unwrap(), "fixed-token");
    }

    #[test]
    fn credential_needs_refresh_within_margin() {
        let c = Credential {
            bearer: "x".to_owned(),
            expires_at: Some(Instant::now() + Duration::from_secs(60)),
        };
        assert!(c.needs_refresh());

        let c = Credential {
            bearer: "x".to_owned(),
            expires_at: Some(Instant::now() + Duration::from_secs(3600)),
        };
        assert!(!c.needs_refresh());

        let c = Credential {
            bearer: "x".to_owned(),
            expires_at: None,
        };
        assert!(!c.needs_refresh());
    }
}
