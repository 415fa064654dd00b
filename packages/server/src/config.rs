use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;

use crate::common::types::ServerMode;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub tls_port: Option<u16>,
    pub mode: ServerMode,
    pub jobs_directory: PathBuf,
    pub config_file: PathBuf,
    pub pairing_file: PathBuf,
    pub machine_id: String,
}

pub const DEFAULT_PORT: u16 = 38523;

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let base_dir = env::var("SERVER_BASE_DIR").unwrap_or_else(|_| "/var/lib/barserver".to_string());
        let base = PathBuf::from(&base_dir);

        Ok(Self {
            port: env::var("SERVER_PORT")
                .unwrap_or_else(|_| DEFAULT_PORT.to_string())
                .parse()
                .context("SERVER_PORT must be a valid port number")?,
            tls_port: env::var("SERVER_TLS_PORT")
                .ok()
                .map(|p| p.parse().context("SERVER_TLS_PORT must be a valid port number"))
                .transpose()?,
            mode: env::var("SERVER_MODE")
                .unwrap_or_else(|_| "MASTER".to_string())
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))?,
            jobs_directory: env::var("SERVER_JOBS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| base.join("jobs")),
            config_file: env::var("SERVER_CONFIG_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| base.join("server.conf")),
            pairing_file: env::var("SERVER_PAIRING_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| base.join("pairing")),
            machine_id: machine_id(),
        })
    }
}

/// Stable machine identity used in the master pairing hash.
pub fn machine_id() -> String {
    if let Ok(id) = fs::read_to_string("/etc/machine-id") {
        let id = id.trim();
        if !id.is_empty() {
            return id.to_string();
        }
    }
    // Fall back to the hostname when no machine-id is available.
    env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_machine_id_is_nonempty() {
        assert!(!machine_id().is_empty());
    }
}
