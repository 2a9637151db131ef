//! HTTP query transport against the data gateway.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::credentials::Session;
use crate::error::TransportError;

use super::{Envelope, QueryData, QueryOperation, QueryTransport};

/// Executes queries as JSON POSTs against a single gateway endpoint,
/// authenticated with the session's bearer token.
pub struct HttpGatewayTransport {
    http: reqwest::Client,
    endpoint: Box<str>,
}

impl HttpGatewayTransport {
    pub fn new(endpoint: impl Into<Box<str>>) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl QueryTransport for HttpGatewayTransport {
    async fn execute(
        &self,
        operation: QueryOperation,
        session: &Session,
    ) -> Result<Envelope<QueryData>, TransportError> {
        debug!(?operation, "issuing gateway query");

        let response = self
            .http
            .post(&*self.endpoint)
            .bearer_auth(&session.token)
            .json(&operation)
            .send()
            .await?;

        let status = response.status();
        let body = response.bytes().await?;

        if !status.is_success() {
            let message = String::from_utf8_lossy(&body);
            return Err(TransportError::status(
                status.as_u16(),
                format!("gateway returned {status}: {message}"),
            ));
        }

        Ok(serde_json::from_slice(&body)?)
    }
}
