//! # Wireline
//!
//! The line-oriented wire protocol spoken between archive clients, the
//! server, and slave connectors. One message per line:
//!
//! ```text
//! client → server:  <id> <name> <key>=<value> <key>=<value> …
//! server → client:  <id> <complete 0|1> <errorCode> <key>=<value> …
//! ```
//!
//! Values are shell-style quoted when they contain spaces or special
//! characters; bare tokens otherwise. `errorCode=0` means success.
//! Multi-row results stream `complete=0` rows followed by one terminal
//! `complete=1` row.
//!
//! This crate owns interfaces only: frame parsing/formatting, the typed
//! argument map, and the wire error-code table. Policy (authorization,
//! routing, retries) belongs to the peers.

pub mod code;
pub mod frame;
pub mod value;

pub use code::WireCode;
pub use frame::{CommandFrame, ResultFrame};
pub use value::{ValueError, ValueMap};
