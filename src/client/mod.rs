//! Client side of the sync protocol.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `state` | Pure connection state machine |
//! | `backoff` | Reconnect delay formula |
//! | `invalidation` | Envelope → stale cache keys |
//! | `transport` | Connector/transport seam, WebSocket implementation |
//! | `runtime` | Task that owns the transport and executes state machine effects |

pub mod backoff;
pub mod invalidation;
pub mod runtime;
pub mod state;
pub mod transport;

pub use backoff::Backoff;
pub use invalidation::{CacheKey, InvalidationMapper, PendingInvalidations, QueryCache};
pub use runtime::{SyncClient, SyncHandle};
pub use state::{ClientEvent, ClientStateMachine, ConnectionState, Effect};
pub use transport::{Connector, Transport, WsConnector};
