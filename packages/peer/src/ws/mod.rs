//! WebSocket sessions
//!
//! Three ways to attach a socket to the relay:
//! - [`Session`]: one chat over the pub/sub bus
//! - [`DiffSession`]: a replaceable watch-set of chats, read-only
//! - [`QueueSession`]: one chat served by the polling message manager

mod context;
mod diff_session;
mod outbound;
mod presence;
mod protocol;
mod queue_session;
mod session;

#[cfg(test)]
mod e2e_tests;

pub use context::{RejectReason, RelayContext, SessionOutcome};
pub use diff_session::DiffSession;
pub use protocol::DIFF_WELCOME;
pub use queue_session::QueueSession;
pub use session::Session;
