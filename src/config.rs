//! Configuration loading and management.
//!
//! Loads configuration from embedded config.toml (or a user supplied file) with
//! environment variable overrides.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;

use crate::auth::{Credentials, Flow};
use crate::http::RetryPolicy;
use crate::mail::Mailbox;

/// Embedded configuration file content.
const CONFIG_TOML: &str = include_str!("../config.toml");

/// Login host used when no authority is configured.
pub const LOGIN_BASE_URL: &str = "https://login.microsoftonline.com";

/// Upper bound for `token.refresh_before_expiry_seconds` (one day).
pub const MAX_REFRESH_SKEW_SECONDS: u64 = 86_400;

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub graph: GraphConfig,
    pub auth: AuthConfig,
    pub http: HttpConfig,
    pub pagination: PaginationConfig,
    pub token: TokenConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GraphConfig {
    pub base_url: String,
    #[serde(default)]
    pub mailbox: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    pub flow: Flow,
    pub tenant: String,
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    pub scopes: Vec<String>,
    #[serde(default)]
    pub authority: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    pub retries: u32,
    pub status_force_retry: Vec<u16>,
    pub backoff_factor: f64,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaginationConfig {
    pub max_pages: usize,
    #[serde(default)]
    pub page_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    pub refresh_before_expiry_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Config {
    /// Load configuration from embedded config.toml with environment variable overrides.
    pub fn load() -> Result<Self> {
        let config: Config =
            toml::from_str(CONFIG_TOML).context("Failed to parse embedded config.toml")?;
        config.finish()
    }

    /// Load configuration from a TOML file with environment variable overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        config.finish()
    }

    fn finish(mut self) -> Result<Self> {
        self.apply_env_overrides();
        self.validate()?;
        Ok(self)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(tenant) = env::var("AZURE_TENANT_ID") {
            self.auth.tenant = tenant;
        }

        if let Ok(client_id) = env::var("AZURE_CLIENT_ID") {
            self.auth.client_id = client_id;
        }

        if let Ok(secret) = env::var("AZURE_CLIENT_SECRET") {
            self.auth.client_secret = secret;
        }

        if let Ok(username) = env::var("AZURE_USERNAME") {
            self.auth.username = username;
        }

        if let Ok(password) = env::var("AZURE_PASSWORD") {
            self.auth.password = password;
        }

        if let Ok(authority) = env::var("AZURE_AUTHORITY") {
            self.auth.authority = authority;
        }

        if let Ok(flow) = env::var("GRAPHMAIL_FLOW") {
            match flow.parse() {
                Ok(flow) => self.auth.flow = flow,
                Err(e) => tracing::warn!("Ignoring GRAPHMAIL_FLOW: {}", e),
            }
        }

        if let Ok(mailbox) = env::var("GRAPHMAIL_MAILBOX") {
            self.graph.mailbox = mailbox;
        }

        if let Ok(log_level) = env::var("RUST_LOG") {
            self.logging.level = log_level;
        }
    }

    /// Validate that required configuration is present.
    fn validate(&self) -> Result<()> {
        if self.auth.client_id.is_empty() || self.auth.client_id == "YOUR_AZURE_AD_CLIENT_ID" {
            anyhow::bail!(
                "Azure AD client_id not configured. Set AZURE_CLIENT_ID environment variable \
                 or update config.toml"
            );
        }

        if self.auth.tenant.is_empty() || self.auth.tenant == "YOUR_TENANT_ID" {
            anyhow::bail!(
                "Azure AD tenant not configured. Set AZURE_TENANT_ID environment variable \
                 or update config.toml"
            );
        }

        match self.auth.flow {
            Flow::Application if self.auth.client_secret.is_empty() => {
                anyhow::bail!(
                    "The application flow needs a client secret. Set AZURE_CLIENT_SECRET"
                );
            }
            Flow::Delegated if self.auth.username.is_empty() || self.auth.password.is_empty() => {
                anyhow::bail!(
                    "The delegated flow needs a username and password. Set AZURE_USERNAME \
                     and AZURE_PASSWORD"
                );
            }
            _ => {}
        }

        if self.auth.scopes.is_empty() {
            anyhow::bail!("At least one scope must be configured");
        }

        if self.pagination.max_pages == 0 {
            anyhow::bail!("pagination.max_pages must be at least 1");
        }

        if self.token.refresh_before_expiry_seconds > MAX_REFRESH_SKEW_SECONDS {
            anyhow::bail!(
                "token.refresh_before_expiry_seconds must not exceed {}",
                MAX_REFRESH_SKEW_SECONDS
            );
        }

        url::Url::parse(&self.graph.base_url)
            .with_context(|| format!("Invalid graph.base_url {}", self.graph.base_url))?;

        Ok(())
    }

    /// Get the authority URL for Azure AD.
    pub fn authority(&self) -> String {
        if self.auth.authority.is_empty() {
            format!("{}/{}", LOGIN_BASE_URL, self.auth.tenant)
        } else {
            self.auth.authority.trim_end_matches('/').to_string()
        }
    }

    /// Get the token URL for Azure AD.
    pub fn token_url(&self) -> String {
        self.credentials().token_url()
    }

    /// Connection parameters for the configured token flow.
    pub fn credentials(&self) -> Credentials {
        Credentials {
            flow: self.auth.flow,
            tenant_id: self.auth.tenant.clone(),
            client_id: self.auth.client_id.clone(),
            client_secret: self.auth.client_secret.clone().into(),
            scopes: self.auth.scopes.clone(),
            authority: self.authority(),
            username: self.auth.username.clone(),
            password: self.auth.password.clone().into(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retries: self.http.retries,
            status_forcelist: self.http.status_force_retry.clone(),
            backoff_factor: self.http.backoff_factor,
            raise_on_status: true,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.http.timeout_seconds)
    }

    pub fn page_delay(&self) -> Option<Duration> {
        (self.pagination.page_delay_ms > 0)
            .then(|| Duration::from_millis(self.pagination.page_delay_ms))
    }

    pub fn refresh_skew(&self) -> chrono::Duration {
        let seconds = self
            .token
            .refresh_before_expiry_seconds
            .min(MAX_REFRESH_SKEW_SECONDS);
        chrono::Duration::seconds(seconds as i64)
    }

    /// Default mailbox for operations that don't name one.
    pub fn default_mailbox(&self) -> Mailbox {
        Mailbox::from_address(Some(self.graph.mailbox.as_str()))
    }
}
