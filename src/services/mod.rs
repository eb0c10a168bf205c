//! Server-side hub: connection registry, dispatch routing, heartbeat sweeping, collaborators.

pub mod heartbeat;
pub mod registry;
pub mod router;
pub mod store;

pub use heartbeat::HeartbeatMonitor;
pub use registry::{ConnectionHandle, ConnectionId, ConnectionRegistry};
pub use router::{DispatchReport, DispatchRouter};
pub use store::{MemoryStore, NotificationStore, UserDirectory};
