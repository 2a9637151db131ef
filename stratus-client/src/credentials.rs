use std::sync::Arc;

use async_trait::async_trait;
use jiff::Timestamp;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// An authenticated session as handed out by the identity layer.
#[derive(Debug, Clone)]
pub struct Session {
    /// Bearer token attached to gateway calls.
    pub token: Box<str>,
    pub expires_at: Timestamp,
    /// Present when the account also carries signing material for the
    /// socket transport. Gateway-token-only accounts leave this empty.
    pub signing: Option<SigningCredentials>,
}

impl Session {
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Timestamp::now()
    }
}

/// Raw signing material for presigned socket URLs.
#[derive(Debug, Clone)]
pub struct SigningCredentials {
    pub access_key_id: Box<str>,
    pub secret_access_key: Box<str>,
    pub session_token: Option<Box<str>>,
}

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("no active session")]
    NoSession,
    #[error("session refresh failed: {0}")]
    RefreshFailed(Box<str>),
    #[error("access denied by identity provider")]
    Denied,
}

/// Source of sessions. Implementations talk to whatever identity backend
/// the deployment uses; tests substitute a scripted provider.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Return the current session, refreshing it first when `force_refresh`
    /// is set.
    async fn current_session(&self, force_refresh: bool) -> Result<Session, CredentialError>;
}

/// Caches the session and serializes refreshes.
///
/// The cache slot sits behind an async [`Mutex`] held across the provider
/// call, so concurrent callers that all observe an expired session trigger
/// exactly one refresh and the rest reuse its result.
pub struct CredentialCache {
    provider: Arc<dyn IdentityProvider>,
    cached: Mutex<Option<Session>>,
}

impl CredentialCache {
    pub fn new(provider: Arc<dyn IdentityProvider>) -> Self {
        Self {
            provider,
            cached: Mutex::new(None),
        }
    }

    /// Return a session valid right now, fetching or refreshing as needed.
    pub async fn session(&self) -> Result<Session, CredentialError> {
        let mut slot = self.cached.lock().await;

        if let Some(session) = slot.as_ref()
            && !session.is_expired()
        {
            return Ok(session.clone());
        }

        let mut session = self.provider.current_session(false).await?;
        if session.is_expired() {
            debug!("cached session expired, forcing refresh");
            session = self.provider.current_session(true).await?;
            if session.is_expired() {
                warn!("identity provider returned an already-expired session");
                return Err(CredentialError::RefreshFailed(
                    "refreshed session is already expired".into(),
                ));
            }
        }

        *slot = Some(session.clone());
        Ok(session)
    }

    /// Drop the cached session and fetch a fresh one. Used once per request
    /// after the service rejects the current token.
    pub async fn force_refresh(&self) -> Result<Session, CredentialError> {
        let mut slot = self.cached.lock().await;
        let session = self.provider.current_session(true).await?;
        if session.is_expired() {
            return Err(CredentialError::RefreshFailed(
                "refreshed session is already expired".into(),
            ));
        }
        *slot = Some(session.clone());
        Ok(session)
    }

    /// Forget the cached session without contacting the provider.
    pub async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use jiff::SignedDuration;

    use super::*;

    struct CountingProvider {
        calls: AtomicU32,
        forced: AtomicU32,
        ttl: SignedDuration,
    }

    impl CountingProvider {
        fn new(ttl_secs: i64) -> Self {
            Self {
                calls: AtomicU32::new(0),
                forced: AtomicU32::new(0),
                ttl: SignedDuration::from_secs(ttl_secs),
            }
        }
    }

    #[async_trait]
    impl IdentityProvider for CountingProvider {
        async fn current_session(&self, force_refresh: bool) -> Result<Session, CredentialError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if force_refresh {
                self.forced.fetch_add(1, Ordering::SeqCst);
            }
            // Small delay so concurrent callers overlap the lock window.
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(Session {
                token: format!("tok-{n}").into(),
                expires_at: Timestamp::now() + self.ttl,
                signing: None,
            })
        }
    }

    #[tokio::test]
    async fn valid_session_is_reused() {
        let provider = Arc::new(CountingProvider::new(3600));
        let cache = CredentialCache::new(provider.clone());

        let a = cache.session().await.unwrap();
        let b = cache.session().await.unwrap();

        assert_eq!(a.token, b.token);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_session_forces_one_refresh() {
        let provider = Arc::new(CountingProvider::new(-10));
        let cache = CredentialCache::new(provider.clone());

        let err = cache.session().await.unwrap_err();
        assert!(matches!(err, CredentialError::RefreshFailed(_)));
        // One plain fetch, then one forced refresh, both expired.
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
        assert_eq!(provider.forced.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_fetch() {
        let provider = Arc::new(CountingProvider::new(3600));
        let cache = Arc::new(CredentialCache::new(provider.clone()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move { cache.session().await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn force_refresh_replaces_cached_token() {
        let provider = Arc::new(CountingProvider::new(3600));
        let cache = CredentialCache::new(provider.clone());

        let a = cache.session().await.unwrap();
        let b = cache.force_refresh().await.unwrap();
        let c = cache.session().await.unwrap();

        assert_ne!(a.token, b.token);
        assert_eq!(b.token, c.token);
        assert_eq!(provider.forced.load(Ordering::SeqCst), 1);
    }
}
