//! Access token records and secure handling of the secret parts.
//!
//! Tokens are decoded without signature verification: they were just issued
//! to this process by the token endpoint, so only the claims are of interest.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::AuthError;

/// A secure string wrapper that zeroizes its contents on drop.
#[derive(Clone, Default, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(s: String) -> Self {
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for SecretString {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for SecretString {
    fn from(s: &str) -> Self {
        Self::new(s.to_string())
    }
}

impl std::fmt::Debug for SecretString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("[REDACTED]")
    }
}

/// Successful token response from Azure AD.
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: String,
    pub expires_in: Option<u64>,
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: String,
}

impl Zeroize for TokenResponse {
    fn zeroize(&mut self) {
        self.access_token.zeroize();
        if let Some(ref mut rt) = self.refresh_token {
            rt.zeroize();
        }
    }
}

impl Drop for TokenResponse {
    fn drop(&mut self) {
        self.zeroize();
    }
}

/// Error payload returned by the token endpoint.
#[derive(Debug, Deserialize)]
pub struct TokenErrorResponse {
    pub error: String,
    #[serde(default)]
    pub error_description: String,
}

/// An acquired access token with its expiry and decoded claims.
///
/// Records are replaced wholesale on refresh, never mutated.
#[derive(Debug, Clone)]
pub struct TokenRecord {
    access_token: SecretString,
    expires_at: DateTime<Utc>,
    claims: Map<String, Value>,
}

impl TokenRecord {
    pub fn new(
        access_token: SecretString,
        expires_at: DateTime<Utc>,
        claims: Map<String, Value>,
    ) -> Self {
        Self {
            access_token,
            expires_at,
            claims,
        }
    }

    /// Build a record from a token endpoint response.
    ///
    /// The `exp` claim wins; `expires_in` is only used for opaque tokens.
    pub fn from_response(
        response: &TokenResponse,
        issued_at: DateTime<Utc>,
    ) -> Result<Self, AuthError> {
        if response.access_token.is_empty() {
            return Err(AuthError::InvalidToken(
                "token endpoint returned an empty access token".into(),
            ));
        }

        let claims = decode_claims(&response.access_token).unwrap_or_default();

        let expires_at = match expiry_claim(&claims) {
            Some(exp) => exp,
            None => match response.expires_in {
                Some(seconds) => i64::try_from(seconds)
                    .ok()
                    .and_then(Duration::try_seconds)
                    .and_then(|lifetime| issued_at.checked_add_signed(lifetime))
                    .ok_or_else(|| {
                        AuthError::InvalidToken(format!("expires_in {} is out of range", seconds))
                    })?,
                None => {
                    return Err(AuthError::InvalidToken(
                        "token carries neither an exp claim nor expires_in".into(),
                    ))
                }
            },
        };

        Ok(Self::new(
            SecretString::new(response.access_token.clone()),
            expires_at,
            claims,
        ))
    }

    pub fn access_token(&self) -> &SecretString {
        &self.access_token
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn claims(&self) -> &Map<String, Value> {
        &self.claims
    }

    /// A string claim such as `upn`, `appid` or `tid`.
    pub fn claim_str(&self, name: &str) -> Option<&str> {
        self.claims.get(name).and_then(Value::as_str)
    }

    /// True once `now` has reached the expiry, moved forward by `skew`.
    pub fn is_expired_at(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        now + skew >= self.expires_at
    }

    pub fn is_expired(&self, skew: Duration) -> bool {
        self.is_expired_at(Utc::now(), skew)
    }
}

/// Decode the payload segment of a JWT. Returns `None` for opaque tokens.
pub fn decode_claims(token: &str) -> Option<Map<String, Value>> {
    let mut parts = token.split('.');
    let (_header, payload, _signature) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()?;
    match serde_json::from_slice::<Value>(&bytes).ok()? {
        Value::Object(claims) => Some(claims),
        _ => None,
    }
}

fn expiry_claim(claims: &Map<String, Value>) -> Option<DateTime<Utc>> {
    let exp = claims.get("exp")?;
    let seconds = exp
        .as_i64()
        .or_else(|| exp.as_f64().map(|f| f as i64))?;
    DateTime::from_timestamp(seconds, 0)
}
