use std::sync::Arc;

use tracing::{debug, warn};

use crate::credentials::CredentialCache;
use crate::error::{ClientError, Result};
use crate::ratelimit::RateLimiter;
use crate::retry::{ErrorClass, RetryPolicy};
use crate::transport::{QueryData, QueryOperation, QueryTransport};

/// Runs queries through admission control, credential handling, and the
/// retry policy. Every read path in the crate funnels through here.
pub struct RequestExecutor<Q> {
    transport: Arc<Q>,
    credentials: Arc<CredentialCache>,
    limiter: RateLimiter,
    policy: RetryPolicy,
}

impl<Q: QueryTransport> RequestExecutor<Q> {
    pub fn new(transport: Arc<Q>, credentials: Arc<CredentialCache>) -> Self {
        Self {
            transport,
            credentials,
            limiter: RateLimiter::default(),
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    /// Execute one query. `key` names the operation family for admission
    /// control, so e.g. stats queries and current-reading queries consume
    /// separate budgets.
    ///
    /// Transient failures are retried with capped jittered backoff. An
    /// authorization failure triggers at most one forced credential
    /// refresh per call, outside the retry budget; a second one is
    /// terminal.
    pub async fn execute(&self, key: &str, operation: QueryOperation) -> Result<QueryData> {
        if !self.limiter.allow(key) {
            return Err(ClientError::RateLimited(key.into()));
        }

        let mut attempt = 0u32;
        let mut refreshed = false;
        loop {
            let session = self.credentials.session().await?;
            let outcome = self
                .transport
                .execute(operation.clone(), &session)
                .await
                .and_then(|envelope| envelope.into_data());

            let err = match outcome {
                Ok(data) => return Ok(data),
                Err(err) => err,
            };

            match RetryPolicy::classify(&err) {
                ErrorClass::Auth if !refreshed => {
                    debug!(key, "authorization rejected, refreshing credentials once");
                    refreshed = true;
                    self.credentials.force_refresh().await?;
                }
                ErrorClass::Auth => return Err(ClientError::AuthRejected(err)),
                ErrorClass::Retryable if self.policy.has_budget(attempt) => {
                    let delay = self.policy.jittered_delay(attempt);
                    warn!(
                        key,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                ErrorClass::Retryable => {
                    return Err(ClientError::Exhausted {
                        attempts: attempt + 1,
                        source: err,
                    });
                }
                ErrorClass::Fatal => return Err(ClientError::Terminal(err)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use jiff::{SignedDuration, Timestamp};

    use crate::credentials::{CredentialError, IdentityProvider, Session};
    use crate::error::TransportError;
    use crate::transport::Envelope;

    use super::*;

    struct StaticProvider {
        refreshes: AtomicU32,
    }

    #[async_trait]
    impl IdentityProvider for StaticProvider {
        async fn current_session(&self, force_refresh: bool) -> std::result::Result<Session, CredentialError> {
            if force_refresh {
                self.refreshes.fetch_add(1, Ordering::SeqCst);
            }
            Ok(Session {
                token: "tok".into(),
                expires_at: Timestamp::now() + SignedDuration::from_secs(3600),
                signing: None,
            })
        }
    }

    /// Fails the first `failures` calls with `code`, then succeeds.
    struct ScriptedTransport {
        calls: AtomicU32,
        failures: u32,
        code: &'static str,
    }

    impl ScriptedTransport {
        fn new(failures: u32, code: &'static str) -> Self {
            Self {
                calls: AtomicU32::new(0),
                failures,
                code,
            }
        }
    }

    #[async_trait]
    impl QueryTransport for ScriptedTransport {
        async fn execute(
            &self,
            _operation: QueryOperation,
            _session: &Session,
        ) -> std::result::Result<Envelope<QueryData>, TransportError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(TransportError::service(self.code, "scripted failure"));
            }
            Ok(Envelope {
                data: Some(QueryData::Readings(Vec::new())),
                errors: Vec::new(),
            })
        }
    }

    fn executor(transport: Arc<ScriptedTransport>) -> RequestExecutor<ScriptedTransport> {
        let credentials = Arc::new(CredentialCache::new(Arc::new(StaticProvider {
            refreshes: AtomicU32::new(0),
        })));
        RequestExecutor::new(transport, credentials)
    }

    fn current(device: &str) -> QueryOperation {
        QueryOperation::CurrentReading {
            device_id: device.parse().unwrap(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_to_success() {
        let transport = Arc::new(ScriptedTransport::new(2, "NETWORK_ERROR"));
        let exec = executor(transport.clone());

        exec.execute("current", current("M-X-001")).await.unwrap();
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn budget_is_one_initial_call_plus_max_attempts_retries() {
        let transport = Arc::new(ScriptedTransport::new(u32::MAX, "SERVICE_UNAVAILABLE"));
        let exec = executor(transport.clone());

        let err = exec.execute("current", current("M-X-001")).await.unwrap_err();
        match err {
            ClientError::Exhausted { attempts, .. } => assert_eq!(attempts, 4),
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(transport.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_failures_are_not_retried() {
        let transport = Arc::new(ScriptedTransport::new(u32::MAX, "VALIDATION_ERROR"));
        let exec = executor(transport.clone());

        let err = exec.execute("current", current("M-X-001")).await.unwrap_err();
        assert!(matches!(err, ClientError::Terminal(_)));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn auth_failure_refreshes_once_then_is_terminal() {
        let provider = Arc::new(StaticProvider {
            refreshes: AtomicU32::new(0),
        });
        let transport = Arc::new(ScriptedTransport::new(u32::MAX, "UNAUTHORIZED"));
        let exec = RequestExecutor::new(
            transport.clone(),
            Arc::new(CredentialCache::new(provider.clone())),
        );

        let err = exec.execute("current", current("M-X-001")).await.unwrap_err();
        assert!(matches!(err, ClientError::AuthRejected(_)));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
        assert_eq!(provider.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn auth_failure_recovers_after_refresh() {
        let transport = Arc::new(ScriptedTransport::new(1, "FORBIDDEN"));
        let exec = executor(transport.clone());

        exec.execute("current", current("M-X-001")).await.unwrap();
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_admission_never_reaches_the_transport() {
        let transport = Arc::new(ScriptedTransport::new(0, ""));
        let exec = executor(transport.clone())
            .with_limiter(RateLimiter::new(1, Duration::from_secs(60)));

        exec.execute("stats", current("M-X-001")).await.unwrap();
        let err = exec.execute("stats", current("M-X-001")).await.unwrap_err();
        assert!(matches!(err, ClientError::RateLimited(_)));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }
}
