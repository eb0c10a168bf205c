//! Data models for envelopes, audiences, and notifications.

pub mod audience;
pub mod envelope;
pub mod notification;

pub use audience::*;
pub use envelope::*;
pub use notification::*;
