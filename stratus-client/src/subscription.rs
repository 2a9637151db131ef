//! Fan-out of live readings to per-device subscriber callbacks.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};
use ulid::Ulid;

use stratus_core::{DeviceId, Reading};

use crate::connection::{ConnectionController, ConnectionEvent};
use crate::error::Result;

/// What a subscriber callback receives.
#[derive(Debug, Clone)]
pub enum ReadingEvent {
    Reading(Reading),
    /// The connection gave up reconnecting. Delivered once per active
    /// subscription so consumers can fall back to polling.
    ConnectionLost,
}

pub type ReadingCallback = Arc<dyn Fn(ReadingEvent) + Send + Sync>;

/// Proof of a subscription, needed to unsubscribe. A token from a
/// replaced subscription is stale and unsubscribing with it is a no-op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionToken {
    device: DeviceId,
    id: Ulid,
}

struct Entry {
    id: Ulid,
    callback: ReadingCallback,
}

type SubscriptionMap = Arc<DashMap<DeviceId, Entry>>;

/// Tracks at most one subscription per device and routes inbound
/// messages to the matching callback.
pub struct SubscriptionManager {
    controller: Arc<ConnectionController>,
    subscriptions: SubscriptionMap,
}

impl SubscriptionManager {
    /// Wire the manager to a controller and start the dispatcher task
    /// that drains its event stream.
    pub fn new(
        controller: Arc<ConnectionController>,
        mut events: tokio::sync::mpsc::Receiver<ConnectionEvent>,
    ) -> Self {
        let subscriptions: SubscriptionMap = Arc::new(DashMap::new());

        let subs = subscriptions.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                dispatch(&subs, event);
            }
            debug!("subscription dispatcher stopped");
        });

        Self {
            controller,
            subscriptions,
        }
    }

    /// Subscribe to a device's live readings. A second subscription for
    /// the same device replaces the first; the broker-side subscription
    /// is reused.
    pub async fn subscribe(
        &self,
        device: &DeviceId,
        callback: ReadingCallback,
    ) -> Result<SubscriptionToken> {
        let id = Ulid::new();
        let replaced = self
            .subscriptions
            .insert(device.clone(), Entry { id, callback })
            .is_some();

        if replaced {
            debug!(device = %device, "replaced existing subscription");
        } else if let Err(e) = self.controller.subscribe(&device_topic(device)).await {
            self.subscriptions.remove(device);
            return Err(e.into());
        }

        Ok(SubscriptionToken {
            device: device.clone(),
            id,
        })
    }

    /// Tear down the subscription the token belongs to.
    pub async fn unsubscribe(&self, token: &SubscriptionToken) -> Result<()> {
        let removed = self
            .subscriptions
            .remove_if(&token.device, |_, entry| entry.id == token.id)
            .is_some();
        if !removed {
            debug!(device = %token.device, "stale unsubscribe ignored");
            return Ok(());
        }
        self.controller
            .unsubscribe(&device_topic(&token.device))
            .await?;
        Ok(())
    }

    pub fn active_count(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_subscribed(&self, device: &DeviceId) -> bool {
        self.subscriptions.contains_key(device)
    }
}

fn device_topic(device: &DeviceId) -> String {
    format!("telemetry/{device}/readings")
}

fn device_from_topic(topic: &str) -> Option<DeviceId> {
    topic
        .strip_prefix("telemetry/")?
        .strip_suffix("/readings")?
        .parse()
        .ok()
}

fn dispatch(subs: &DashMap<DeviceId, Entry>, event: ConnectionEvent) {
    match event {
        ConnectionEvent::Message { topic, payload } => {
            let Some(device) = device_from_topic(&topic) else {
                warn!(%topic, "message on unrecognized topic");
                return;
            };
            let Some(entry) = subs.get(&device) else {
                debug!(device = %device, "message for inactive subscription");
                return;
            };
            match serde_json::from_value::<Reading>(payload) {
                Ok(reading) => (entry.callback)(ReadingEvent::Reading(reading)),
                Err(e) => warn!(device = %device, error = %e, "dropping malformed reading"),
            }
        }
        ConnectionEvent::GaveUp => {
            for entry in subs.iter() {
                (entry.callback)(ReadingEvent::ConnectionLost);
            }
        }
    }
}
