//! Supervision of the persistent push connection.
//!
//! A spawned supervisor task owns the broker channel and walks a small
//! phase machine: connect, serve, back off, retry. Callers talk to it
//! through commands; state changes are published on a watch channel and
//! inbound data flows out as [`ConnectionEvent`]s.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use stratus_core::ConnectionState;

use crate::credentials::{CredentialCache, CredentialError};
use crate::error::TransportError;
use crate::retry::{ErrorClass, RetryPolicy};
use crate::transport::{ChannelEvent, PushChannel, PushTransport};

const COMMAND_BUFFER: usize = 32;
const EVENT_BUFFER: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection controller is shut down")]
    Closed,
    #[error("subscription rejected: {0}")]
    Rejected(#[source] TransportError),
}

/// What the supervisor reports upward.
#[derive(Debug)]
pub enum ConnectionEvent {
    Message {
        topic: Box<str>,
        payload: serde_json::Value,
    },
    /// The reconnect budget is spent (or credentials were rejected). No
    /// further attempts happen until [`ConnectionController::reset_reconnect_attempts`].
    GaveUp,
}

enum Command {
    Subscribe {
        topic: Box<str>,
        ack: oneshot::Sender<Result<(), ConnectionError>>,
    },
    Unsubscribe {
        topic: Box<str>,
        ack: oneshot::Sender<Result<(), ConnectionError>>,
    },
    Reconnect,
    Disconnect {
        ack: oneshot::Sender<()>,
    },
}

/// Handle to the supervisor task.
pub struct ConnectionController {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
    attempts: Arc<AtomicU32>,
    cancel: CancellationToken,
}

impl ConnectionController {
    /// Spawn the supervisor. The returned receiver carries every event the
    /// connection produces; dropping it shuts the supervisor down.
    pub fn spawn<P>(
        transport: Arc<P>,
        credentials: Arc<CredentialCache>,
        policy: RetryPolicy,
    ) -> (Self, mpsc::Receiver<ConnectionEvent>)
    where
        P: PushTransport + 'static,
        P::Channel: Send + 'static,
    {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let attempts = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let supervisor = Supervisor {
            transport,
            credentials,
            policy,
            commands: command_rx,
            events: event_tx,
            state: state_tx,
            attempts: attempts.clone(),
            cancel: cancel.clone(),
            topics: Vec::new(),
            gave_up: false,
        };
        tokio::spawn(supervisor.run());

        (
            Self {
                commands: command_tx,
                state: state_rx,
                attempts,
                cancel,
            },
            event_rx,
        )
    }

    /// Register interest in a topic. Connects lazily on the first
    /// subscription; once the supervisor accepts the topic it survives
    /// reconnects.
    pub async fn subscribe(&self, topic: &str) -> Result<(), ConnectionError> {
        self.command_acked(|ack| Command::Subscribe {
            topic: topic.into(),
            ack,
        })
        .await?
    }

    pub async fn unsubscribe(&self, topic: &str) -> Result<(), ConnectionError> {
        self.command_acked(|ack| Command::Unsubscribe {
            topic: topic.into(),
            ack,
        })
        .await?
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Reconnect failures since the last successful connect.
    pub fn reconnect_attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Clear the spent reconnect budget and nudge the supervisor to try
    /// again immediately.
    pub fn reset_reconnect_attempts(&self) {
        self.attempts.store(0, Ordering::SeqCst);
        match self.commands.try_send(Command::Reconnect) {
            Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
            Err(mpsc::error::TrySendError::Full(cmd)) => {
                // The nudge must not be lost or a parked supervisor stays
                // parked; hand it off once the buffer drains.
                warn!("command buffer full, queueing reconnect");
                let commands = self.commands.clone();
                tokio::spawn(async move {
                    let _ = commands.send(cmd).await;
                });
            }
        }
    }

    /// Tear the connection down. By the time this returns the supervisor
    /// has stopped, so no events are delivered afterwards.
    pub async fn disconnect(&self) {
        let (ack, done) = oneshot::channel();
        if self.commands.send(Command::Disconnect { ack }).await.is_ok() {
            let _ = done.await;
        }
        self.cancel.cancel();
    }

    async fn command_acked<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ConnectionError> {
        let (ack, done) = oneshot::channel();
        self.commands
            .send(build(ack))
            .await
            .map_err(|_| ConnectionError::Closed)?;
        done.await.map_err(|_| ConnectionError::Closed)
    }
}

enum Phase {
    /// No connection and none wanted: before the first subscription,
    /// after giving up, or after a deliberate disconnect.
    Parked,
    Connect,
    Sleep(Duration),
}

struct Supervisor<P: PushTransport> {
    transport: Arc<P>,
    credentials: Arc<CredentialCache>,
    policy: RetryPolicy,
    commands: mpsc::Receiver<Command>,
    events: mpsc::Sender<ConnectionEvent>,
    state: watch::Sender<ConnectionState>,
    attempts: Arc<AtomicU32>,
    cancel: CancellationToken,
    topics: Vec<Box<str>>,
    gave_up: bool,
}

impl<P> Supervisor<P>
where
    P: PushTransport,
    P::Channel: Send,
{
    async fn run(mut self) {
        let mut phase = Phase::Parked;
        loop {
            phase = match phase {
                Phase::Parked => {
                    let Some(next) = self.parked().await else { break };
                    next
                }
                Phase::Sleep(delay) => {
                    let Some(next) = self.sleep(delay).await else { break };
                    next
                }
                Phase::Connect => match self.connect().await {
                    Ok(channel) => {
                        let Some(next) = self.serve(channel).await else { break };
                        next
                    }
                    Err(next) => {
                        let Some(next) = next else { break };
                        next
                    }
                },
            };
        }
        let _ = self.state.send(ConnectionState::Disconnected);
        debug!("connection supervisor stopped");
    }

    async fn parked(&mut self) -> Option<Phase> {
        let _ = self.state.send(ConnectionState::Disconnected);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                cmd = self.commands.recv() => match cmd? {
                    Command::Subscribe { topic, ack } => {
                        self.remember_topic(topic);
                        let _ = ack.send(Ok(()));
                        // A fresh subscription wakes a never-connected
                        // supervisor, but not one that gave up.
                        if !self.gave_up {
                            return Some(Phase::Connect);
                        }
                    }
                    Command::Unsubscribe { topic, ack } => {
                        self.topics.retain(|t| *t != topic);
                        let _ = ack.send(Ok(()));
                    }
                    Command::Reconnect => {
                        self.gave_up = false;
                        if !self.topics.is_empty() {
                            return Some(Phase::Connect);
                        }
                    }
                    Command::Disconnect { ack } => {
                        let _ = ack.send(());
                        return None;
                    }
                },
            }
        }
    }

    async fn sleep(&mut self, delay: Duration) -> Option<Phase> {
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            _ = tokio::time::sleep(delay) => Some(Phase::Connect),
            cmd = self.commands.recv() => match cmd? {
                Command::Subscribe { topic, ack } => {
                    self.remember_topic(topic);
                    let _ = ack.send(Ok(()));
                    Some(Phase::Sleep(delay))
                }
                Command::Unsubscribe { topic, ack } => {
                    self.topics.retain(|t| *t != topic);
                    let _ = ack.send(Ok(()));
                    Some(Phase::Sleep(delay))
                }
                Command::Reconnect => {
                    self.gave_up = false;
                    Some(Phase::Connect)
                }
                Command::Disconnect { ack } => {
                    let _ = ack.send(());
                    None
                }
            },
        }
    }

    /// Establish a channel and replay the subscription set.
    /// `Err` carries the phase to fall back to.
    async fn connect(&mut self) -> Result<P::Channel, Option<Phase>> {
        let reconnecting = self.attempts.load(Ordering::SeqCst) > 0;
        let _ = self.state.send(if reconnecting {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Connecting
        });

        let session = match self.credentials.session().await {
            Ok(session) => session,
            Err(e @ CredentialError::Denied) => {
                error!(error = %e, "credentials rejected, giving up");
                return Err(self.give_up().await);
            }
            Err(e) => {
                warn!(error = %e, "credential fetch failed");
                return Err(self.failure().await);
            }
        };

        let mut channel = match self.transport.connect(&session).await {
            Ok(channel) => channel,
            Err(e) => {
                if RetryPolicy::classify(&e) == ErrorClass::Auth {
                    error!(error = %e, "broker rejected credentials, giving up");
                    return Err(self.give_up().await);
                }
                warn!(error = %e, "connect failed");
                return Err(self.failure().await);
            }
        };

        for topic in &self.topics {
            if let Err(e) = channel.subscribe(topic).await {
                warn!(%topic, error = %e, "resubscribe failed");
                return Err(self.failure().await);
            }
        }

        self.attempts.store(0, Ordering::SeqCst);
        let _ = self.state.send(ConnectionState::Connected);
        info!(topics = self.topics.len(), "connected");
        Ok(channel)
    }

    /// Pump the established channel until it closes or a command ends it.
    async fn serve(&mut self, mut channel: P::Channel) -> Option<Phase> {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                event = channel.next_event() => match event {
                    ChannelEvent::Message { topic, payload } => {
                        if self
                            .events
                            .send(ConnectionEvent::Message { topic, payload })
                            .await
                            .is_err()
                        {
                            return None;
                        }
                    }
                    ChannelEvent::Error(e) => {
                        warn!(error = %e, "channel error");
                    }
                    ChannelEvent::Closed => {
                        warn!("connection lost");
                        return self.failure().await;
                    }
                },
                cmd = self.commands.recv() => match cmd? {
                    Command::Subscribe { topic, ack } => {
                        match channel.subscribe(&topic).await {
                            Ok(()) => {
                                self.remember_topic(topic);
                                let _ = ack.send(Ok(()));
                            }
                            Err(e) => {
                                let _ = ack.send(Err(ConnectionError::Rejected(e)));
                            }
                        }
                    }
                    Command::Unsubscribe { topic, ack } => {
                        self.topics.retain(|t| *t != topic);
                        // A broken unsubscribe only matters if the stream
                        // is dying, which surfaces as Closed on its own.
                        if let Err(e) = channel.unsubscribe(&topic).await {
                            debug!(%topic, error = %e, "unsubscribe failed");
                        }
                        let _ = ack.send(Ok(()));
                    }
                    Command::Reconnect => {}
                    Command::Disconnect { ack } => {
                        let _ = self.state.send(ConnectionState::Disconnected);
                        let _ = ack.send(());
                        return None;
                    }
                },
            }
        }
    }

    fn remember_topic(&mut self, topic: Box<str>) {
        if !self.topics.contains(&topic) {
            self.topics.push(topic);
        }
    }

    /// Record one failed attempt and pick the next phase.
    async fn failure(&mut self) -> Option<Phase> {
        let spent = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if spent > self.policy.max_attempts {
            warn!(attempts = spent - 1, "reconnect budget exhausted, giving up");
            return self.give_up().await;
        }
        let delay = self.policy.jittered_delay(spent - 1);
        info!(attempt = spent, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
        // Publish before sleeping so a lost connection is visible for the
        // whole backoff window, not only once the next attempt starts.
        let _ = self.state.send(ConnectionState::Reconnecting);
        Some(Phase::Sleep(delay))
    }

    async fn give_up(&mut self) -> Option<Phase> {
        self.gave_up = true;
        let _ = self.state.send(ConnectionState::Disconnected);
        if self.events.send(ConnectionEvent::GaveUp).await.is_err() {
            return None;
        }
        Some(Phase::Parked)
    }
}
