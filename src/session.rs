//! Session-id correlation: every command carries a session id chosen by the sender, and the
//!  matching response echoes it. The [MessageQueue] buffers incoming messages per session id so
//!  a sender can block (with a timeout) until the answer for its id arrives.

pub mod queue;

pub use queue::MessageQueue;

use std::fmt::{Debug, Formatter};

/// A process-scoped, monotonically increasing correlation id. `0` is reserved as the invalid
///  sentinel and is never produced by [MessageQueue::unique_id].
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SessionId(pub u32);

impl SessionId {
    pub const INVALID: SessionId = SessionId(0);

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl Debug for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}
