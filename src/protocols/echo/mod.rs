//! Echo protocol implementation.
//!
//! Unstructured byte-stream echo: every byte a client sends is written
//! back on the same connection, in order, with no framing.
//!
//! ## Use Cases
//!
//! 1. **Connectivity checks**: confirm a path to the host is open and that
//!    data survives the round trip unchanged.
//!
//! 2. **Idle liveness**: with alive announcements enabled, a client that
//!    sends nothing still receives `alive\n` periodically, which keeps
//!    middleboxes from dropping the session and shows the server is up.
//!
//! ## Wire Format
//!
//! ```text
//! Client:  hello
//! Server:  hello
//!
//! With announcements (every 5s by default):
//! Server:  alive\n
//! ```
//!
//! Each read is echoed in full before the next read is issued, so the
//! announcement can only land between two echoed chunks.

pub mod announcer;
pub mod handler;

pub use handler::EchoHandler;
