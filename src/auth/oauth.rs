//! Token acquisition against the Azure AD v2.0 token endpoint.
//!
//! Two flows share the [`TokenProvider`] contract: the delegated
//! username/password flow (with silent refresh from an in-process cache) and
//! the application client-credentials flow.

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::token::{SecretString, TokenErrorResponse, TokenRecord, TokenResponse};
use crate::error::{truncate, AuthError, LOGGED_BODY_MAX_LEN};

/// HTTP request timeout.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
/// HTTP connection timeout.
const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Scopes Azure AD needs to hand out a refresh token and an id token.
const RESERVED_SCOPES: [&str; 3] = ["offline_access", "openid", "profile"];

/// Which grant the client authenticates with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Flow {
    Delegated,
    Application,
}

impl Flow {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Delegated => "delegated",
            Self::Application => "application",
        }
    }
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Flow {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "delegated" => Ok(Self::Delegated),
            "application" => Ok(Self::Application),
            other => Err(format!(
                "unknown flow '{other}', expected 'delegated' or 'application'"
            )),
        }
    }
}

/// Connection parameters for token acquisition.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub flow: Flow,
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: SecretString,
    pub scopes: Vec<String>,
    /// Authority URL, e.g. `https://login.microsoftonline.com/<tenant>`.
    pub authority: String,
    pub username: String,
    pub password: SecretString,
}

impl Credentials {
    pub fn token_url(&self) -> String {
        format!(
            "{}/oauth2/v2.0/token",
            self.authority.trim_end_matches('/')
        )
    }

    /// Build the provider for the configured flow.
    pub fn provider(&self) -> Result<Arc<dyn TokenProvider>, AuthError> {
        let provider: Arc<dyn TokenProvider> = match self.flow {
            Flow::Delegated => Arc::new(DelegatedFlow::new(self.clone())?),
            Flow::Application => Arc::new(ApplicationFlow::new(self.clone())?),
        };
        Ok(provider)
    }
}

/// Uniform token acquisition contract.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Acquire a fresh token record.
    async fn acquire(&self) -> Result<TokenRecord, AuthError>;

    /// Short name of the flow, for logging.
    fn flow(&self) -> &'static str;
}

/// Shared HTTP plumbing for the token endpoint.
struct TokenEndpoint {
    url: String,
    http_client: reqwest::Client,
}

impl TokenEndpoint {
    fn new(url: String) -> Result<Self, AuthError> {
        let http_client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .connect_timeout(HTTP_CONNECT_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| AuthError::Request(e.to_string()))?;

        Ok(Self { url, http_client })
    }

    /// POST a grant and decode either the token or the OAuth2 error.
    async fn request(&self, params: &[(&str, &str)]) -> Result<TokenResponse, AuthError> {
        let response = self
            .http_client
            .post(&self.url)
            .form(params)
            .send()
            .await
            .map_err(|e| AuthError::Request(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AuthError::Request(e.to_string()))?;

        if let Ok(payload) = serde_json::from_str::<TokenErrorResponse>(&body) {
            error!(
                "Token request failed: HTTP {} - {}",
                status, payload.error
            );
            return Err(AuthError::provider(payload.error, &payload.error_description));
        }

        if !status.is_success() {
            error!(
                "Token request failed: HTTP {} - {}",
                status,
                truncate(&body, LOGGED_BODY_MAX_LEN)
            );
            return Err(AuthError::provider(
                format!("http_{}", status.as_u16()),
                truncate(&body, LOGGED_BODY_MAX_LEN),
            ));
        }

        serde_json::from_str(&body).map_err(|e| AuthError::InvalidToken(e.to_string()))
    }
}

/// Account remembered by the delegated flow for silent refresh.
struct CachedAccount {
    username: String,
    refresh_token: SecretString,
}

/// Delegated (resource owner password) flow.
pub struct DelegatedFlow {
    credentials: Credentials,
    endpoint: TokenEndpoint,
    cache: Mutex<Option<CachedAccount>>,
}

impl DelegatedFlow {
    pub fn new(credentials: Credentials) -> Result<Self, AuthError> {
        if credentials.username.is_empty() {
            return Err(AuthError::MissingCredential("username"));
        }
        if credentials.password.is_empty() {
            return Err(AuthError::MissingCredential("password"));
        }

        let endpoint = TokenEndpoint::new(credentials.token_url())?;
        Ok(Self {
            credentials,
            endpoint,
            cache: Mutex::new(None),
        })
    }

    fn scope(&self) -> String {
        let mut scopes: Vec<&str> = self.credentials.scopes.iter().map(String::as_str).collect();
        for reserved in RESERVED_SCOPES {
            if !scopes.contains(&reserved) {
                scopes.push(reserved);
            }
        }
        scopes.join(" ")
    }

    async fn refresh_silently(&self, refresh_token: &SecretString) -> Result<TokenResponse, AuthError> {
        let scope = self.scope();
        let mut params = vec![
            ("client_id", self.credentials.client_id.as_str()),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
            ("scope", scope.as_str()),
        ];
        if !self.credentials.client_secret.is_empty() {
            params.push(("client_secret", self.credentials.client_secret.as_str()));
        }
        self.endpoint.request(&params).await
    }

    async fn sign_in(&self) -> Result<TokenResponse, AuthError> {
        let scope = self.scope();
        let mut params = vec![
            ("client_id", self.credentials.client_id.as_str()),
            ("grant_type", "password"),
            ("username", self.credentials.username.as_str()),
            ("password", self.credentials.password.as_str()),
            ("scope", scope.as_str()),
        ];
        if !self.credentials.client_secret.is_empty() {
            params.push(("client_secret", self.credentials.client_secret.as_str()));
        }
        self.endpoint.request(&params).await
    }
}

#[async_trait]
impl TokenProvider for DelegatedFlow {
    async fn acquire(&self) -> Result<TokenRecord, AuthError> {
        let mut cache = self.cache.lock().await;

        let cached_refresh = cache
            .as_ref()
            .filter(|account| account.username == self.credentials.username)
            .map(|account| account.refresh_token.clone());

        let mut response = None;
        if let Some(refresh_token) = cached_refresh {
            info!("Account exists in cache, attempting silent refresh");
            match self.refresh_silently(&refresh_token).await {
                Ok(token) => response = Some(token),
                Err(e) => warn!("Silent refresh failed, signing in again: {}", e),
            }
        }

        let response = match response {
            Some(token) => token,
            None => {
                info!("No usable cached token, requesting a new one from Azure AD");
                self.sign_in().await?
            }
        };

        if let Some(refresh_token) = &response.refresh_token {
            *cache = Some(CachedAccount {
                username: self.credentials.username.clone(),
                refresh_token: SecretString::new(refresh_token.clone()),
            });
        }

        let record = TokenRecord::from_response(&response, Utc::now())?;
        debug!("Delegated token acquired, expires at {}", record.expires_at());
        Ok(record)
    }

    fn flow(&self) -> &'static str {
        Flow::Delegated.as_str()
    }
}

/// Application (client credentials) flow.
pub struct ApplicationFlow {
    credentials: Credentials,
    endpoint: TokenEndpoint,
}

impl ApplicationFlow {
    pub fn new(credentials: Credentials) -> Result<Self, AuthError> {
        if credentials.client_secret.is_empty() {
            return Err(AuthError::MissingCredential("client_secret"));
        }

        let endpoint = TokenEndpoint::new(credentials.token_url())?;
        Ok(Self {
            credentials,
            endpoint,
        })
    }
}

#[async_trait]
impl TokenProvider for ApplicationFlow {
    async fn acquire(&self) -> Result<TokenRecord, AuthError> {
        let scope = self.credentials.scopes.join(" ");
        let params = [
            ("client_id", self.credentials.client_id.as_str()),
            ("client_secret", self.credentials.client_secret.as_str()),
            ("grant_type", "client_credentials"),
            ("scope", scope.as_str()),
        ];

        let response = self.endpoint.request(&params).await?;
        let record = TokenRecord::from_response(&response, Utc::now())?;
        debug!("Application token acquired, expires at {}", record.expires_at());
        Ok(record)
    }

    fn flow(&self) -> &'static str {
        Flow::Application.as_str()
    }
}
