//! The textual control protocol: a client sends commands over the reliable control connection,
//!  the server answers each command with exactly one response frame that echoes the client's
//!  session id. Frames are ASCII text, optionally NUL-terminated:
//!
//! ```ascii
//! frame      := ("command:" | "response:") body "," "id:" session_id
//! body       := message ["-" value]
//! session_id := unsigned decimal integer, 0 is reserved as invalid
//! ```
//!
//! The codec is pure and stateless; it is safe to call from any number of tasks without
//!  synchronization.

pub mod frame;
pub mod tokens;

pub use frame::{build_command, build_response, Frame, ParseError};
pub use tokens::Command;
