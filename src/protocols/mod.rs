//! Protocol implementations.
//!
//! - `echo`: byte-stream echo with optional alive announcements

pub mod echo;
