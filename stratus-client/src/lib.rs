//! Resilient client for the stratus telemetry service: retried and
//! rate-limited queries against the data gateway, plus a supervised push
//! connection delivering live readings into per-device rolling windows.

pub mod cache;
pub mod config;
pub mod connection;
pub mod credentials;
pub mod error;
pub mod executor;
pub mod ratelimit;
pub mod retry;
pub mod sign;
pub mod subscription;
pub mod transport;

mod facade;

pub use cache::{RollingWindowCache, TtlCache};
pub use config::{ClientConfig, ConfigError};
pub use connection::{ConnectionController, ConnectionError, ConnectionEvent};
pub use credentials::{CredentialCache, CredentialError, IdentityProvider, Session, SigningCredentials};
pub use error::{ClientError, ErrorKind, Result, TransportError};
pub use executor::RequestExecutor;
pub use facade::{
    HealthReport, HealthStatus, ObserveCallback, ObserveGuard, ObserveUpdate, TelemetryClient,
};
pub use ratelimit::RateLimiter;
pub use retry::{ErrorClass, RetryPolicy};
pub use subscription::{ReadingCallback, ReadingEvent, SubscriptionManager, SubscriptionToken};

pub use stratus_core::{
    ConnectionState, DeviceId, MetricStats, Reading, ReadingQuality, StatSummary, StatsPeriod,
};
