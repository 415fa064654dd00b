// Backup archiver server - core library
//
// A long-running daemon that accepts client connections, executes
// backup/restore jobs (locally or delegated to slave nodes), enforces
// retention policies, and maintains a queryable index of archives.
//
// Layers: domains/ holds the business model, kernel/ the infrastructure and
// long-running services, server/ the line-protocol network surface.

pub mod common;
pub mod config;
pub mod domains;
pub mod kernel;
pub mod server;

pub use config::*;
