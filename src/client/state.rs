//! Client connection state machine.
//!
//! Pure: feed it [`ClientEvent`]s and execute the [`Effect`]s it returns. Timers and the
//! transport belong to the runtime, so every transition is testable without either.

use serde::Serialize;
use std::time::Duration;
use tracing::{debug, trace};

use super::backoff::Backoff;

/// Connectivity as shown to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Inputs to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEvent {
    /// Initial start or an explicit reconnect request.
    Start,
    /// Handshake completed.
    Connected,
    /// Handshake failed or transport errored before reaching `connected`.
    ConnectFailed,
    /// Live transport closed or errored unexpectedly.
    TransportLost,
    /// The scheduled reconnect delay elapsed.
    RetryElapsed,
    /// Owning client instance is being torn down.
    Teardown,
}

/// Side effects the runtime must perform, in order. `Publish` always comes first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    OpenTransport,
    SendInit,
    ScheduleRetry(Duration),
    CancelRetry,
    CloseTransport,
    Publish(ConnectionState),
}

#[derive(Debug, Clone)]
pub struct ClientStateMachine {
    state: ConnectionState,
    retry_count: u32,
    torn_down: bool,
    backoff: Backoff,
}

impl ClientStateMachine {
    pub fn new(backoff: Backoff) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            retry_count: 0,
            torn_down: false,
            backoff,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    pub fn handle(&mut self, event: ClientEvent) -> Vec<Effect> {
        if self.torn_down {
            trace!(?event, "event after teardown ignored");
            return Vec::new();
        }

        use ClientEvent as E;
        use ConnectionState as S;
        match (self.state, event) {
            (_, E::Teardown) => {
                self.torn_down = true;
                self.enter(S::Disconnected, vec![Effect::CancelRetry, Effect::CloseTransport])
            }
            (S::Disconnected, E::Start) => self.enter(S::Connecting, vec![Effect::OpenTransport]),
            (S::Reconnecting, E::Start) => {
                self.enter(S::Connecting, vec![Effect::CancelRetry, Effect::OpenTransport])
            }
            (S::Reconnecting, E::RetryElapsed) => {
                self.enter(S::Connecting, vec![Effect::OpenTransport])
            }
            (S::Connecting, E::Connected) => {
                self.retry_count = 0;
                self.enter(S::Connected, vec![Effect::SendInit])
            }
            (S::Connecting, E::ConnectFailed | E::TransportLost)
            | (S::Connected, E::TransportLost | E::ConnectFailed) => {
                let delay = self.backoff.delay(self.retry_count);
                self.retry_count = (self.retry_count + 1).min(self.backoff.ceiling);
                self.enter(
                    S::Reconnecting,
                    vec![Effect::CloseTransport, Effect::ScheduleRetry(delay)],
                )
            }
            (state, event) => {
                trace!(?state, ?event, "event ignored in current state");
                Vec::new()
            }
        }
    }

    fn enter(&mut self, next: ConnectionState, mut effects: Vec<Effect>) -> Vec<Effect> {
        debug!(from = ?self.state, to = ?next, retry_count = self.retry_count, "client state");
        self.state = next;
        effects.insert(0, Effect::Publish(next));
        effects
    }
}
