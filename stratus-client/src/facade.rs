//! The top-level client tying queries, caching, the push connection,
//! and subscriptions together.

use std::sync::{Arc, Mutex};

use jiff::{SignedDuration, Timestamp};
use serde::{Deserialize, Serialize};
use tracing::debug;

use stratus_core::{ConnectionState, DeviceId, Reading, StatSummary, StatsPeriod};

use crate::cache::{RollingWindowCache, TtlCache};
use crate::config::ClientConfig;
use crate::connection::ConnectionController;
use crate::credentials::{CredentialCache, IdentityProvider};
use crate::error::{ClientError, Result};
use crate::executor::RequestExecutor;
use crate::retry::RetryPolicy;
use crate::subscription::{ReadingEvent, SubscriptionManager, SubscriptionToken};
use crate::transport::{
    HttpGatewayTransport, PushTransport, QueryData, QueryOperation, QueryTransport,
    SignedSocketTransport,
};

const MAX_HISTORY_MINUTES: u32 = 1440;

/// Overall client health derived from the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub connection: ConnectionState,
    pub reconnect_attempts: u32,
    pub active_subscriptions: usize,
}

/// What an observer callback receives: the merged rolling window after
/// each live reading, or notice that live delivery stopped.
#[derive(Debug, Clone)]
pub enum ObserveUpdate {
    Window(Vec<Reading>),
    ConnectionLost,
}

pub type ObserveCallback = Arc<dyn Fn(ObserveUpdate) + Send + Sync>;

/// Keeps an observation alive; cancel it to release the subscription
/// and the device's window.
pub struct ObserveGuard {
    device: DeviceId,
    token: SubscriptionToken,
    subscriptions: Arc<SubscriptionManager>,
    window: Arc<RollingWindowCache>,
}

impl ObserveGuard {
    pub async fn cancel(self) -> Result<()> {
        self.subscriptions.unsubscribe(&self.token).await?;
        self.window.evict(&self.device);
        Ok(())
    }
}

/// The last fetch that failed, kept so [`TelemetryClient::retry`] can
/// replay it.
#[derive(Debug, Clone)]
enum FetchTarget {
    Current(DeviceId),
    History(DeviceId, u32),
    Stats(DeviceId, StatsPeriod),
}

pub struct TelemetryClient<Q> {
    executor: RequestExecutor<Q>,
    controller: Arc<ConnectionController>,
    subscriptions: Arc<SubscriptionManager>,
    window: Arc<RollingWindowCache>,
    results: TtlCache<QueryData>,
    window_minutes: u32,
    last_failed: Mutex<Option<FetchTarget>>,
}

impl TelemetryClient<HttpGatewayTransport> {
    /// Build a client with the stock HTTP gateway and signed-socket
    /// transports described by the config.
    pub fn connect(
        config: &ClientConfig,
        provider: Arc<dyn IdentityProvider>,
    ) -> Result<Self> {
        let query = Arc::new(
            HttpGatewayTransport::new(config.gateway.endpoint.as_str())
                .map_err(ClientError::Terminal)?,
        );
        let push = Arc::new(SignedSocketTransport::new(
            config.socket.host.as_str(),
            config.socket.port,
            config.socket.path.as_str(),
            config.socket.region.as_str(),
            config.socket.service.as_str(),
        ));
        Ok(Self::with_transports(config, query, push, provider))
    }
}

impl<Q: QueryTransport + 'static> TelemetryClient<Q> {
    /// Build a client from explicit transports. Tests inject scripted
    /// ones through here.
    pub fn with_transports<P>(
        config: &ClientConfig,
        query: Arc<Q>,
        push: Arc<P>,
        provider: Arc<dyn IdentityProvider>,
    ) -> Self
    where
        P: PushTransport + 'static,
        P::Channel: Send + 'static,
    {
        let credentials = Arc::new(CredentialCache::new(provider));
        let executor = RequestExecutor::new(query, credentials.clone())
            .with_policy(config.retry.policy())
            .with_limiter(config.rate_limit.limiter());

        let (controller, events) =
            ConnectionController::spawn(push, credentials, RetryPolicy::for_reconnect());
        let controller = Arc::new(controller);
        let subscriptions = Arc::new(SubscriptionManager::new(controller.clone(), events));

        let results = match &config.cache.persist_dir {
            Some(dir) => TtlCache::persistent(config.cache.ttl(), config.cache.max_entries, dir),
            None => TtlCache::new(config.cache.ttl(), config.cache.max_entries),
        };

        Self {
            executor,
            controller,
            subscriptions,
            window: Arc::new(RollingWindowCache::new(config.cache.window())),
            results,
            window_minutes: (config.cache.window_minutes as u32).clamp(1, MAX_HISTORY_MINUTES),
            last_failed: Mutex::new(None),
        }
    }

    /// Latest reading for a device, or `None` when it has never reported.
    pub async fn fetch_current(&self, device: &DeviceId) -> Result<Option<Reading>> {
        let key = format!("current_{device}");
        if let Some(QueryData::Readings(readings)) = self.results.get(&key) {
            return Ok(readings.into_iter().next());
        }

        let data = self
            .query(
                &key,
                "current",
                QueryOperation::CurrentReading {
                    device_id: device.clone(),
                },
                FetchTarget::Current(device.clone()),
            )
            .await?;
        match data {
            QueryData::Readings(readings) => Ok(readings.into_iter().next()),
            QueryData::Stats(_) => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Readings for the trailing `window_minutes`, oldest first.
    pub async fn fetch_history(
        &self,
        device: &DeviceId,
        window_minutes: u32,
    ) -> Result<Vec<Reading>> {
        if window_minutes == 0 || window_minutes > MAX_HISTORY_MINUTES {
            return Err(ClientError::Validation(format!(
                "window must be 1..={MAX_HISTORY_MINUTES} minutes, got {window_minutes}"
            )));
        }

        let key = format!("history_{device}_{window_minutes}");
        if let Some(QueryData::Readings(readings)) = self.results.get(&key) {
            return Ok(readings);
        }

        let start = Timestamp::now()
            .checked_sub(SignedDuration::from_secs(i64::from(window_minutes) * 60))
            .unwrap_or(Timestamp::MIN);
        let data = self
            .query(
                &key,
                "history",
                QueryOperation::History {
                    device_id: device.clone(),
                    start,
                },
                FetchTarget::History(device.clone(), window_minutes),
            )
            .await?;
        match data {
            QueryData::Readings(mut readings) => {
                readings.sort_by_key(|r| r.timestamp);
                Ok(readings)
            }
            QueryData::Stats(_) => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Aggregate statistics for the period, or `None` when the service
    /// has no samples for it.
    pub async fn fetch_stats(
        &self,
        device: &DeviceId,
        period: StatsPeriod,
    ) -> Result<Option<StatSummary>> {
        let key = format!("stats_{device}_{period}");
        if let Some(QueryData::Stats(stats)) = self.results.get(&key) {
            return Ok(stats.into_iter().next().filter(|s| !s.is_empty()));
        }

        let data = self
            .query(
                &key,
                "stats",
                QueryOperation::Stats {
                    device_id: device.clone(),
                    period,
                },
                FetchTarget::Stats(device.clone(), period),
            )
            .await?;
        match data {
            QueryData::Stats(stats) => Ok(stats.into_iter().next().filter(|s| !s.is_empty())),
            QueryData::Readings(_) => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Start live observation of a device: seed its rolling window from
    /// history, then keep merging pushed readings into it, invoking the
    /// callback with the updated window after each one.
    pub async fn observe(
        &self,
        device: &DeviceId,
        callback: ObserveCallback,
    ) -> Result<ObserveGuard> {
        let mut seed = self.fetch_history(device, self.window_minutes).await?;
        if let Some(current) = self.fetch_current(device).await? {
            seed.push(current);
        }
        self.window.seed(device, seed);
        callback(ObserveUpdate::Window(self.window.snapshot(device)));

        let window = self.window.clone();
        let token = self
            .subscriptions
            .subscribe(
                device,
                Arc::new(move |event| match event {
                    ReadingEvent::Reading(reading) => {
                        callback(ObserveUpdate::Window(window.merge(reading)));
                    }
                    ReadingEvent::ConnectionLost => callback(ObserveUpdate::ConnectionLost),
                }),
            )
            .await?;

        Ok(ObserveGuard {
            device: device.clone(),
            token,
            subscriptions: self.subscriptions.clone(),
            window: self.window.clone(),
        })
    }

    /// Point-in-time health derived from the connection state and the
    /// spent reconnect budget.
    pub fn health_check(&self) -> HealthReport {
        let connection = self.controller.state();
        let reconnect_attempts = self.controller.reconnect_attempts();
        HealthReport {
            status: health_status(connection, reconnect_attempts),
            connection,
            reconnect_attempts,
            active_subscriptions: self.subscriptions.active_count(),
        }
    }

    /// Recover after failures: clears the reconnect budget so the
    /// connection tries again, and replays the most recent failed fetch
    /// if there was one.
    pub async fn retry(&self) -> Result<()> {
        self.controller.reset_reconnect_attempts();

        let target = self.last_failed.lock().unwrap_or_else(|e| e.into_inner()).clone();
        match target {
            None => Ok(()),
            Some(FetchTarget::Current(device)) => self.fetch_current(&device).await.map(|_| ()),
            Some(FetchTarget::History(device, minutes)) => {
                self.fetch_history(&device, minutes).await.map(|_| ())
            }
            Some(FetchTarget::Stats(device, period)) => {
                self.fetch_stats(&device, period).await.map(|_| ())
            }
        }
    }

    /// Tear down the push connection. Queries keep working afterwards.
    pub async fn disconnect(&self) {
        self.controller.disconnect().await;
    }

    async fn query(
        &self,
        cache_key: &str,
        limit_key: &str,
        operation: QueryOperation,
        target: FetchTarget,
    ) -> Result<QueryData> {
        match self.executor.execute(limit_key, operation).await {
            Ok(data) => {
                self.results.insert(cache_key, data.clone());
                *self.last_failed.lock().unwrap_or_else(|e| e.into_inner()) = None;
                Ok(data)
            }
            Err(err) => {
                debug!(key = cache_key, error = %err, "fetch failed, remembered for retry");
                *self.last_failed.lock().unwrap_or_else(|e| e.into_inner()) = Some(target);
                Err(err)
            }
        }
    }
}

fn health_status(connection: ConnectionState, reconnect_attempts: u32) -> HealthStatus {
    match connection {
        ConnectionState::Connected if reconnect_attempts == 0 => HealthStatus::Healthy,
        ConnectionState::Connected | ConnectionState::Reconnecting => HealthStatus::Degraded,
        ConnectionState::Connecting if reconnect_attempts > 0 => HealthStatus::Degraded,
        _ => HealthStatus::Unhealthy,
    }
}
