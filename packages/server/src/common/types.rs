//! Shared types used across layers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Protocol version advertised by `version` and checked against slaves.
pub const PROTOCOL_VERSION_MAJOR: u32 = 8;
pub const PROTOCOL_VERSION_MINOR: u32 = 0;

/// Process role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ServerMode {
    /// Drives remote slaves, accepts regular clients.
    #[default]
    Master,
    /// Accepts commands from exactly one paired master.
    Slave,
}

impl fmt::Display for ServerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerMode::Master => write!(f, "MASTER"),
            ServerMode::Slave => write!(f, "SLAVE"),
        }
    }
}

impl FromStr for ServerMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "MASTER" => Ok(ServerMode::Master),
            "SLAVE" => Ok(ServerMode::Slave),
            other => Err(format!("unknown server mode '{other}'")),
        }
    }
}

/// Archive classes a job run can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ArchiveType {
    #[default]
    Normal,
    Full,
    Incremental,
    Differential,
    /// Low-latency class reacting to a change log rather than a fixed time.
    Continuous,
}

impl ArchiveType {
    pub const ALL: [ArchiveType; 5] = [
        ArchiveType::Normal,
        ArchiveType::Full,
        ArchiveType::Incremental,
        ArchiveType::Differential,
        ArchiveType::Continuous,
    ];
}

impl fmt::Display for ArchiveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ArchiveType::Normal => "NORMAL",
            ArchiveType::Full => "FULL",
            ArchiveType::Incremental => "INCREMENTAL",
            ArchiveType::Differential => "DIFFERENTIAL",
            ArchiveType::Continuous => "CONTINUOUS",
        };
        write!(f, "{text}")
    }
}

impl FromStr for ArchiveType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NORMAL" => Ok(ArchiveType::Normal),
            "FULL" => Ok(ArchiveType::Full),
            "INCREMENTAL" => Ok(ArchiveType::Incremental),
            "DIFFERENTIAL" => Ok(ArchiveType::Differential),
            "CONTINUOUS" => Ok(ArchiveType::Continuous),
            other => Err(format!("unknown archive type '{other}'")),
        }
    }
}

/// TLS behavior for a slave connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum TlsMode {
    /// Plain TCP.
    None,
    /// Upgrade via startTLS when the peer offers it.
    #[default]
    Try,
    /// Refuse to talk without TLS.
    Force,
}

impl fmt::Display for TlsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TlsMode::None => "NONE",
            TlsMode::Try => "TRY",
            TlsMode::Force => "FORCE",
        };
        write!(f, "{text}")
    }
}

impl FromStr for TlsMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NONE" => Ok(TlsMode::None),
            "TRY" => Ok(TlsMode::Try),
            "FORCE" => Ok(TlsMode::Force),
            other => Err(format!("unknown TLS mode '{other}'")),
        }
    }
}

/// Observed state of a configured slave, in derivation priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SlaveState {
    #[default]
    Offline,
    /// Connected, not yet authorized.
    Online,
    /// Authorized but the peer is not running in slave mode.
    WrongMode,
    /// Authorized but the protocol major version differs.
    WrongProtocolVersion,
    Paired,
}

impl fmt::Display for SlaveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SlaveState::Offline => "OFFLINE",
            SlaveState::Online => "ONLINE",
            SlaveState::WrongMode => "WRONG_MODE",
            SlaveState::WrongProtocolVersion => "WRONG_PROTOCOL_VERSION",
            SlaveState::Paired => "PAIRED",
        };
        write!(f, "{text}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_archive_type_round_trip() {
        for ty in ArchiveType::ALL {
            assert_eq!(ty.to_string().parse::<ArchiveType>().unwrap(), ty);
        }
    }

    #[test]
    fn test_server_mode_parse_is_case_insensitive() {
        assert_eq!("slave".parse::<ServerMode>().unwrap(), ServerMode::Slave);
        assert!("proxy".parse::<ServerMode>().is_err());
    }
}
