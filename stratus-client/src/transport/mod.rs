//! Wire abstractions for the two ways the client talks to the service:
//! request/response queries against the data gateway, and the persistent
//! push channel fed by the broker.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use stratus_core::{DeviceId, Reading, StatSummary, StatsPeriod};

use crate::credentials::Session;
use crate::error::TransportError;

pub mod gateway;
pub mod socket;

pub use gateway::HttpGatewayTransport;
pub use socket::{SignedSocketTransport, SocketChannel};

/// One query the client can issue against the data service.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum QueryOperation {
    CurrentReading {
        device_id: DeviceId,
    },
    History {
        device_id: DeviceId,
        /// Inclusive lower bound on reading timestamps.
        start: jiff::Timestamp,
    },
    Stats {
        device_id: DeviceId,
        period: StatsPeriod,
    },
}

/// Payload of a successful query, shaped by the operation that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryData {
    Readings(Vec<Reading>),
    Stats(Vec<StatSummary>),
}

/// The gateway's response envelope: data and service-level errors can
/// coexist, and an error-bearing envelope takes precedence.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope<T> {
    pub data: Option<T>,
    #[serde(default)]
    pub errors: Vec<ServiceError>,
}

/// An application-level error carried inside an otherwise successful
/// response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceError {
    #[serde(rename = "errorType")]
    pub error_type: Option<Box<str>>,
    pub message: Box<str>,
}

impl<T> Envelope<T> {
    /// Collapse the envelope into its payload, promoting the first
    /// service error to a [`TransportError`] so it flows through the same
    /// classification as transport-level failures.
    pub fn into_data(self) -> Result<T, TransportError> {
        if let Some(err) = self.errors.into_iter().next() {
            return Err(match err.error_type {
                Some(code) => TransportError::service(code, err.message),
                None => TransportError::message(err.message),
            });
        }
        self.data
            .ok_or_else(|| TransportError::message("response carried neither data nor errors"))
    }
}

/// Request/response transport against the data gateway.
#[async_trait]
pub trait QueryTransport: Send + Sync {
    async fn execute(
        &self,
        operation: QueryOperation,
        session: &Session,
    ) -> Result<Envelope<QueryData>, TransportError>;
}

/// Something a push channel delivered.
#[derive(Debug)]
pub enum ChannelEvent {
    /// A data frame for a subscribed topic.
    Message {
        topic: Box<str>,
        payload: serde_json::Value,
    },
    /// A frame-level or stream-level failure. The channel may still be
    /// usable afterwards.
    Error(TransportError),
    /// The peer closed the stream or it failed irrecoverably.
    Closed,
}

/// An established push connection. One instance per (re)connect.
#[async_trait]
pub trait PushChannel: Send {
    async fn subscribe(&mut self, topic: &str) -> Result<(), TransportError>;
    async fn unsubscribe(&mut self, topic: &str) -> Result<(), TransportError>;
    /// Wait for the next event. After `Closed` is returned the channel
    /// must not be polled again.
    async fn next_event(&mut self) -> ChannelEvent;
}

/// Factory for push channels: each call performs a fresh handshake.
#[async_trait]
pub trait PushTransport: Send + Sync {
    type Channel: PushChannel;

    async fn connect(&self, session: &Session) -> Result<Self::Channel, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_errors_take_precedence_over_data() {
        let envelope: Envelope<QueryData> = serde_json::from_str(
            r#"{
                "data": {"readings": []},
                "errors": [{"errorType": "UNAUTHORIZED", "message": "token expired"}]
            }"#,
        )
        .unwrap();

        let err = envelope.into_data().unwrap_err();
        assert_eq!(err.code.as_deref(), Some("UNAUTHORIZED"));
    }

    #[test]
    fn empty_envelope_is_an_error() {
        let envelope: Envelope<QueryData> = serde_json::from_str(r#"{"data": null}"#).unwrap();
        assert!(envelope.into_data().is_err());
    }

    #[test]
    fn operations_serialize_with_snake_case_tags() {
        let op = QueryOperation::Stats {
            device_id: "M-02".parse().unwrap(),
            period: StatsPeriod::Day,
        };
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["operation"], "stats");
        assert_eq!(json["period"], "DAY");
        assert_eq!(json["device_id"], "M-02");
    }

    #[test]
    fn readings_payload_deserializes() {
        let envelope: Envelope<QueryData> = serde_json::from_str(
            r#"{
                "data": {
                    "readings": [{
                        "deviceId": "A-B-123",
                        "timestamp": "2024-06-01T12:00:00Z",
                        "temperature": 25.5
                    }]
                }
            }"#,
        )
        .unwrap();

        match envelope.into_data().unwrap() {
            QueryData::Readings(readings) => {
                assert_eq!(readings.len(), 1);
                assert_eq!(
                    readings[0].temperature.map(|t| t.into_inner()),
                    Some(25.5)
                );
            }
            QueryData::Stats(_) => panic!("expected readings"),
        }
    }
}
