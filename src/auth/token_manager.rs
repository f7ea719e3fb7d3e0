//! Token freshness guard.
//!
//! Every Graph request asks the guard for a bearer token first. The guard
//! re-acquires the token through its provider once the held record has
//! expired, so callers never see an expired token.

use chrono::Duration;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use super::oauth::TokenProvider;
use super::token::{SecretString, TokenRecord};
use crate::error::AuthError;

/// Holds the current token and refreshes it on demand.
///
/// The record sits behind an async mutex that stays locked during a refresh,
/// so concurrent callers trigger a single re-acquisition.
pub struct TokenGuard {
    provider: Arc<dyn TokenProvider>,
    current: Mutex<TokenRecord>,
    skew: Duration,
}

impl TokenGuard {
    /// Acquire the initial token.
    pub async fn acquire(provider: Arc<dyn TokenProvider>, skew: Duration) -> Result<Self, AuthError> {
        let record = provider.acquire().await?;
        info!(
            "Token acquired via {} flow, expires at {}",
            provider.flow(),
            record.expires_at()
        );
        Ok(Self::with_record(provider, record, skew))
    }

    /// Start from an already acquired record.
    pub fn with_record(provider: Arc<dyn TokenProvider>, record: TokenRecord, skew: Duration) -> Self {
        Self {
            provider,
            current: Mutex::new(record),
            skew,
        }
    }

    /// Return a valid bearer token, refreshing the held record if it expired.
    pub async fn bearer(&self) -> Result<SecretString, AuthError> {
        let mut current = self.current.lock().await;
        if current.is_expired(self.skew) {
            info!(
                "Token expired at {}, re-acquiring via {} flow",
                current.expires_at(),
                self.provider.flow()
            );
            *current = self.provider.acquire().await?;
            info!("Token refreshed, expires at {}", current.expires_at());
        }
        Ok(current.access_token().clone())
    }

    /// Replace the held record regardless of its expiry.
    pub async fn force_refresh(&self) -> Result<(), AuthError> {
        let mut current = self.current.lock().await;
        *current = self.provider.acquire().await?;
        info!("Token force-refreshed, expires at {}", current.expires_at());
        Ok(())
    }

    /// Snapshot of the held record.
    pub async fn current(&self) -> TokenRecord {
        self.current.lock().await.clone()
    }
}

/// Format duration as human-readable string (e.g., "45 min", "1 hour").
pub fn format_duration(duration: Duration) -> String {
    let total_minutes = duration.num_minutes();

    if total_minutes < 1 {
        "< 1 min".to_string()
    } else if total_minutes < 60 {
        format!("{} min", total_minutes)
    } else {
        let hours = total_minutes / 60;
        let mins = total_minutes % 60;
        if mins == 0 {
            format!("{} hour{}", hours, if hours == 1 { "" } else { "s" })
        } else {
            format!("{}h {}m", hours, mins)
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::Map;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Provider handing out numbered tokens that stay valid for an hour.
    #[derive(Default)]
    pub(crate) struct CountingProvider {
        pub(crate) calls: AtomicUsize,
    }

    #[async_trait]
    impl TokenProvider for CountingProvider {
        async fn acquire(&self) -> Result<TokenRecord, AuthError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(TokenRecord::new(
                format!("token-{n}").into(),
                Utc::now() + Duration::hours(1),
                Map::new(),
            ))
        }

        fn flow(&self) -> &'static str {
            "test"
        }
    }

    fn record(token: &str, expires_in: Duration) -> TokenRecord {
        TokenRecord::new(token.into(), Utc::now() + expires_in, Map::new())
    }

    #[tokio::test]
    async fn test_expired_token_is_reacquired_exactly_once() {
        let provider = Arc::new(CountingProvider::default());
        let guard = TokenGuard::with_record(
            provider.clone(),
            record("stale", Duration::minutes(-5)),
            Duration::zero(),
        );

        let token = guard.bearer().await.unwrap();
        assert_eq!(token.as_str(), "token-1");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

        // The refreshed token is valid, so no further acquisition
        let token = guard.bearer().await.unwrap();
        assert_eq!(token.as_str(), "token-1");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fresh_token_is_not_reacquired() {
        let provider = Arc::new(CountingProvider::default());
        let guard = TokenGuard::with_record(
            provider.clone(),
            record("fresh", Duration::hours(1)),
            Duration::zero(),
        );

        assert_eq!(guard.bearer().await.unwrap().as_str(), "fresh");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_skew_refreshes_ahead_of_expiry() {
        let provider = Arc::new(CountingProvider::default());
        let guard = TokenGuard::with_record(
            provider.clone(),
            record("almost", Duration::seconds(30)),
            Duration::seconds(60),
        );

        assert_eq!(guard.bearer().await.unwrap().as_str(), "token-1");
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_refresh() {
        let provider = Arc::new(CountingProvider::default());
        let guard = Arc::new(TokenGuard::with_record(
            provider.clone(),
            record("stale", Duration::minutes(-1)),
            Duration::zero(),
        ));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let guard = Arc::clone(&guard);
                tokio::spawn(async move { guard.bearer().await.unwrap() })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.await.unwrap().as_str(), "token-1");
        }
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_initial_acquire_and_force_refresh() {
        let provider = Arc::new(CountingProvider::default());
        let guard = TokenGuard::acquire(provider.clone(), Duration::zero())
            .await
            .unwrap();
        assert_eq!(guard.current().await.access_token().as_str(), "token-1");

        guard.force_refresh().await.unwrap();
        assert_eq!(guard.bearer().await.unwrap().as_str(), "token-2");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::seconds(30)), "< 1 min");
        assert_eq!(format_duration(Duration::minutes(45)), "45 min");
        assert_eq!(format_duration(Duration::hours(1)), "1 hour");
        assert_eq!(format_duration(Duration::hours(2)), "2 hours");
        assert_eq!(format_duration(Duration::minutes(90)), "1h 30m");
    }
}
