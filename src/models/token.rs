//! Short-lived HS256 bearer tokens for providers that authenticate with an
//! access key / secret key pair instead of a static API key.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::Duration;

use crate::models::retry::ProviderError;

type HmacSha256 = Hmac<Sha256>;

const DEFAULT_TTL: Duration = Duration::from_secs(30 * 60);
const DEFAULT_NOT_BEFORE_SKEW: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize)]
struct Header {
    alg: &'static str,
    typ: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub iss: String,
    pub exp: i64,
    pub nbf: i64,
}

#[derive(Clone)]
pub struct TokenSigner {
    access_key: String,
    secret_key: String,
    ttl: Duration,
    not_before_skew: Duration,
}

impl std::fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSigner")
            .field("access_key", &self.access_key)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl TokenSigner {
    pub fn new(access_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            ttl: DEFAULT_TTL,
            not_before_skew: DEFAULT_NOT_BEFORE_SKEW,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn is_configured(&self) -> bool {
        !self.access_key.is_empty() && !self.secret_key.is_empty()
    }

    pub fn claims_at(&self, now: i64) -> Claims {
        Claims {
            iss: self.access_key.clone(),
            exp: now + self.ttl.as_secs() as i64,
            nbf: now - self.not_before_skew.as_secs() as i64,
        }
    }

    /// Signs a fresh token. Called once per HTTP request; tokens are never cached.
    pub fn sign(&self) -> Result<String, ProviderError> {
        self.sign_claims(&self.claims_at(Utc::now().timestamp()))
    }

    fn sign_claims(&self, claims: &Claims) -> Result<String, ProviderError> {
        let header = serde_json::to_vec(&Header {
            alg: "HS256",
            typ: "JWT",
        })
        .map_err(|e| ProviderError::invalid_request(format!("token header: {}", e)))?;
        let payload = serde_json::to_vec(claims)
            .map_err(|e| ProviderError::invalid_request(format!("token claims: {}", e)))?;

        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(header),
            URL_SAFE_NO_PAD.encode(payload)
        );

        let mut mac = HmacSha256::new_from_slice(self.secret_key.as_bytes())
            .map_err(|e| ProviderError::unavailable(format!("invalid secret key: {}", e)))?;
        mac.update(signing_input.as_bytes());
        let signature = mac.finalize().into_bytes();

        Ok(format!(
            "{}.{}",
            signing_input,
            URL_SAFE_NO_PAD.encode(signature)
        ))
    }
}
