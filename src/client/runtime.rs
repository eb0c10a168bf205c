//! Client runtime: one task owning the transport, driving [`ClientStateMachine`].
//!
//! Timers are plain deadlines polled with `tokio::time`, so they vanish with the task and
//! tests can run on paused time.

use std::collections::VecDeque;
use std::future::pending;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::invalidation::{InvalidationMapper, PendingInvalidations, QueryCache};
use super::state::{ClientEvent, ClientStateMachine, ConnectionState, Effect};
use super::transport::{Connector, Transport};
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::models::{EntityId, Envelope, EnvelopeType, UserId};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);
/// Envelopes a lagging subscriber may fall behind before it starts missing some.
const ENVELOPE_BUFFER: usize = 256;

enum Command {
    Reconnect,
    Send(Envelope, oneshot::Sender<Result<(), ClientError>>),
    RecordOptimistic(EnvelopeType, Option<EntityId>),
}

/// Entry point for starting a sync client.
pub struct SyncClient;

impl SyncClient {
    /// Start connecting in the background. The returned handle controls the instance.
    pub fn spawn(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        cache: Arc<dyn QueryCache>,
    ) -> SyncHandle {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (envelopes, _) = broadcast::channel(ENVELOPE_BUFFER);
        let cancel = CancellationToken::new();

        let driver = Driver {
            user_id: config.user_id,
            machine: ClientStateMachine::new(config.backoff),
            mapper: InvalidationMapper::new(config.user_id)
                .with_echo_suppression(config.suppress_echoes),
            pending: PendingInvalidations::default(),
            connector,
            cache,
            state_tx,
            envelopes: envelopes.clone(),
            cancel: cancel.clone(),
            commands: commands_rx,
            transport: None,
            retry_at: None,
            next_ping: None,
            last_inbound: Instant::now(),
            heartbeat_interval: config.heartbeat_interval,
            heartbeat_timeout: config.heartbeat_timeout(),
        };
        let task = tokio::spawn(driver.run());

        SyncHandle {
            commands: commands_tx,
            state: state_rx,
            envelopes,
            cancel,
            task,
        }
    }
}

/// Control surface of a running client. Dropping it tears the client down.
pub struct SyncHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    envelopes: broadcast::Sender<Envelope>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SyncHandle {
    /// Subscribe to connectivity changes.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Subscribe to inbound domain envelopes in wire order, e.g. to show a toast.
    /// Control frames (`ping`, `pong`, `init`) and unknown types are not published.
    pub fn envelopes(&self) -> broadcast::Receiver<Envelope> {
        self.envelopes.subscribe()
    }

    /// Connect now instead of waiting out the backoff delay.
    pub fn reconnect(&self) -> Result<(), ClientError> {
        self.commands
            .send(Command::Reconnect)
            .map_err(|_| ClientError::Closed)
    }

    /// Send an envelope on the live transport.
    pub async fn send(&self, envelope: Envelope) -> Result<(), ClientError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Send(envelope, tx))
            .map_err(|_| ClientError::Closed)?;
        rx.await.map_err(|_| ClientError::Closed)?
    }

    /// Register a mutation already applied to the local cache (see echo suppression).
    /// For `notification-read`, `entity_id` is the notification id.
    pub fn record_optimistic(
        &self,
        kind: EnvelopeType,
        entity_id: Option<EntityId>,
    ) -> Result<(), ClientError> {
        self.commands
            .send(Command::RecordOptimistic(kind, entity_id))
            .map_err(|_| ClientError::Closed)
    }

    /// Tear down: cancel timers, close the transport, and wait for the task to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "sync client task ended abnormally");
        }
    }
}

struct Driver {
    user_id: UserId,
    machine: ClientStateMachine,
    mapper: InvalidationMapper,
    pending: PendingInvalidations,
    connector: Arc<dyn Connector>,
    cache: Arc<dyn QueryCache>,
    state_tx: watch::Sender<ConnectionState>,
    envelopes: broadcast::Sender<Envelope>,
    cancel: CancellationToken,
    commands: mpsc::UnboundedReceiver<Command>,
    transport: Option<Box<dyn Transport>>,
    retry_at: Option<Instant>,
    next_ping: Option<Instant>,
    last_inbound: Instant,
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
}

impl Driver {
    async fn run(mut self) {
        let mut events = VecDeque::from([ClientEvent::Start]);
        loop {
            while let Some(event) = events.pop_front() {
                for effect in self.machine.handle(event) {
                    if let Some(next) = self.apply(effect).await {
                        events.push_back(next);
                    }
                }
            }
            if self.machine.is_torn_down() {
                break;
            }
            if let Some(event) = self.next_event().await {
                events.push_back(event);
            }
        }
        info!(user_id = self.user_id, "sync client stopped");
    }

    async fn apply(&mut self, effect: Effect) -> Option<ClientEvent> {
        match effect {
            Effect::Publish(state) => {
                self.state_tx.send_replace(state);
                None
            }
            Effect::OpenTransport => {
                let attempt = tokio::select! {
                    _ = self.cancel.cancelled() => return Some(ClientEvent::Teardown),
                    result = self.connector.connect() => result,
                };
                match attempt {
                    Ok(transport) => {
                        let now = Instant::now();
                        self.transport = Some(transport);
                        self.last_inbound = now;
                        self.next_ping = Some(now + self.heartbeat_interval);
                        info!(user_id = self.user_id, "connected");
                        Some(ClientEvent::Connected)
                    }
                    Err(e) => {
                        warn!(user_id = self.user_id, error = %e, "connect attempt failed");
                        Some(ClientEvent::ConnectFailed)
                    }
                }
            }
            Effect::SendInit => match self.send_envelope(&Envelope::init_request()).await {
                Ok(()) => None,
                Err(e) => {
                    warn!(error = %e, "failed to send init");
                    Some(ClientEvent::TransportLost)
                }
            },
            Effect::ScheduleRetry(delay) => {
                info!(
                    user_id = self.user_id,
                    delay_ms = delay.as_millis() as u64,
                    retry_count = self.machine.retry_count(),
                    "reconnect scheduled"
                );
                self.retry_at = Some(Instant::now() + delay);
                None
            }
            Effect::CancelRetry => {
                self.retry_at = None;
                None
            }
            Effect::CloseTransport => {
                self.next_ping = None;
                if let Some(mut transport) = self.transport.take() {
                    if timeout(CLOSE_TIMEOUT, transport.close()).await.is_err() {
                        debug!("transport close timed out");
                    }
                }
                None
            }
        }
    }

    async fn next_event(&mut self) -> Option<ClientEvent> {
        tokio::select! {
            _ = self.cancel.cancelled() => Some(ClientEvent::Teardown),
            _ = sleep_until_opt(self.retry_at) => {
                self.retry_at = None;
                Some(ClientEvent::RetryElapsed)
            }
            _ = sleep_until_opt(self.next_ping) => self.heartbeat().await,
            command = self.commands.recv() => match command {
                Some(command) => self.on_command(command).await,
                None => Some(ClientEvent::Teardown),
            },
            frame = recv_opt(&mut self.transport) => self.on_frame(frame),
        }
    }

    async fn heartbeat(&mut self) -> Option<ClientEvent> {
        let now = Instant::now();
        if now.saturating_duration_since(self.last_inbound) >= self.heartbeat_timeout {
            warn!(user_id = self.user_id, "server silent past heartbeat timeout");
            return Some(ClientEvent::TransportLost);
        }
        self.next_ping = Some(now + self.heartbeat_interval);
        match self.send_envelope(&Envelope::ping()).await {
            Ok(()) => None,
            Err(e) => {
                warn!(error = %e, "ping failed");
                Some(ClientEvent::TransportLost)
            }
        }
    }

    async fn on_command(&mut self, command: Command) -> Option<ClientEvent> {
        match command {
            Command::Reconnect => Some(ClientEvent::Start),
            Command::RecordOptimistic(kind, entity_id) => {
                self.mapper.record_optimistic(kind, entity_id);
                None
            }
            Command::Send(envelope, reply) => {
                let result = self.send_envelope(&envelope).await;
                let lost = matches!(result, Err(ClientError::Transport(_)));
                let _ = reply.send(result);
                lost.then_some(ClientEvent::TransportLost)
            }
        }
    }

    fn on_frame(&mut self, frame: Option<Result<String, ClientError>>) -> Option<ClientEvent> {
        match frame {
            None => {
                info!(user_id = self.user_id, "server closed the connection");
                Some(ClientEvent::TransportLost)
            }
            Some(Err(e)) => {
                warn!(user_id = self.user_id, error = %e, "transport error");
                Some(ClientEvent::TransportLost)
            }
            Some(Ok(text)) => {
                self.last_inbound = Instant::now();
                self.on_text(&text);
                None
            }
        }
    }

    fn on_text(&mut self, text: &str) {
        let envelope = match Envelope::parse(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "dropping malformed frame");
                return;
            }
        };
        let publish = match envelope.kind {
            EnvelopeType::Ping | EnvelopeType::Pong => false,
            EnvelopeType::Unknown => {
                debug!("ignoring envelope of unknown type");
                false
            }
            EnvelopeType::Init => {
                self.mapper.reconcile(&mut self.pending);
                false
            }
            _ => {
                self.mapper.apply(&envelope, &mut self.pending);
                true
            }
        };
        if !self.pending.is_empty() {
            let flushed = self.pending.flush(self.cache.as_ref());
            debug!(kind = ?envelope.kind, flushed, "cache keys invalidated");
        }
        // No subscribers is fine.
        if publish {
            let _ = self.envelopes.send(envelope);
        }
    }

    async fn send_envelope(&mut self, envelope: &Envelope) -> Result<(), ClientError> {
        let transport = self.transport.as_mut().ok_or(ClientError::NotConnected)?;
        let frame = serde_json::to_string(envelope)?;
        transport.send(frame).await
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

async fn recv_opt(transport: &mut Option<Box<dyn Transport>>) -> Option<Result<String, ClientError>> {
    match transport {
        Some(transport) => transport.recv().await,
        None => pending().await,
    }
}
