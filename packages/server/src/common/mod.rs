// Shared types used across layers - no business logic here.

pub mod auth;
pub mod error;
pub mod types;

pub use error::{ServerError, ServerResult};
pub use types::{ArchiveType, ServerMode, TlsMode, PROTOCOL_VERSION_MAJOR, PROTOCOL_VERSION_MINOR};
