//! Master pairing coordinator (slave mode).
//!
//! At most one master is paired at any time, and pairing is the only way
//! the persisted master record is set. A pairing request is either started
//! manually (`masterPairingStart`) or automatically: on slave startup with
//! no paired master, or by dropping the pairing file.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::clients::ClientRegistry;
use super::delay::{delay, DelayOutcome, Trigger};
use super::options::ServerOptions;
use super::service_host::Service;
use crate::common::auth::MasterRecord;
use crate::common::error::ServerResult;
use crate::common::types::ServerMode;

/// Default timeout of a pairing request.
pub const DEFAULT_PAIRING_MASTER_TIMEOUT: Duration = Duration::from_secs(600);

const WATCH_PERIOD: Duration = Duration::from_secs(5);

/// Pairing request mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PairingMode {
    #[default]
    None,
    /// Completed automatically by the next authorize carrying a UUID.
    Auto,
    /// Requires an explicit `masterPairingStop pair=yes`.
    Manual,
}

#[derive(Debug, Default)]
struct PairingState {
    mode: PairingMode,
    new_name: String,
    new_uuid_hash: String,
    deadline: Option<DateTime<Utc>>,
}

/// Single-instance pairing state.
pub struct PairingCoordinator {
    state: Mutex<PairingState>,
    options: Arc<ServerOptions>,
    clients: Arc<ClientRegistry>,
    trigger: Arc<Trigger>,
    server_mode: ServerMode,
}

impl PairingCoordinator {
    pub fn new(
        options: Arc<ServerOptions>,
        clients: Arc<ClientRegistry>,
        trigger: Arc<Trigger>,
        server_mode: ServerMode,
    ) -> Self {
        Self {
            state: Mutex::new(PairingState::default()),
            options,
            clients,
            trigger,
            server_mode,
        }
    }

    pub fn mode(&self) -> PairingMode {
        self.state.lock().unwrap().mode
    }

    /// A pairing request is active while its deadline lies in the future.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        let state = self.state.lock().unwrap();
        state.mode != PairingMode::None && state.deadline.is_some_and(|d| d > now)
    }

    /// Candidate master captured by an authorize during pairing.
    pub fn candidate(&self) -> Option<(String, String)> {
        let state = self.state.lock().unwrap();
        if state.mode == PairingMode::None || state.new_name.is_empty() {
            None
        } else {
            Some((state.new_name.clone(), state.new_uuid_hash.clone()))
        }
    }

    /// Begin a pairing request. No-op while one is already active.
    pub fn begin(&self, timeout: Duration, mode: PairingMode, now: DateTime<Utc>) {
        {
            let mut state = self.state.lock().unwrap();
            if state.mode != PairingMode::None {
                return;
            }
            state.mode = mode;
            state.new_name.clear();
            state.new_uuid_hash.clear();
            state.deadline = now
                .checked_add_signed(chrono::Duration::from_std(timeout).unwrap_or_default());
            info!(target: "pairing", ?mode, timeout_s = timeout.as_secs(), "pairing started");
        }

        // Re-pairing a slave that already has a master: force the connected
        // masters to re-authorize against the new record.
        if self.server_mode == ServerMode::Slave && self.options.master().is_some() {
            let disconnected = self.clients.disconnect_masters();
            if disconnected > 0 {
                info!(target: "pairing", disconnected, "disconnected paired masters for re-pairing");
            }
        }
        self.trigger.signal();
    }

    /// Record the candidate identity observed during an authorize.
    pub fn observe(&self, name: &str, uuid_hash: &str) {
        let mut state = self.state.lock().unwrap();
        if state.mode != PairingMode::None {
            state.new_name = name.to_string();
            state.new_uuid_hash = uuid_hash.to_string();
        }
    }

    /// Complete pairing: persist the master record and clear the request.
    /// An empty name clears the request without pairing. Any persistence
    /// error leaves the previous record untouched.
    pub fn end(&self, name: &str, uuid_hash: &str) -> ServerResult<()> {
        if !name.is_empty() {
            self.options.set_master(MasterRecord {
                name: name.to_string(),
                uuid_hash: uuid_hash.to_string(),
            })?;
            info!(target: "pairing", master = name, "paired with master");
        }

        let mut state = self.state.lock().unwrap();
        *state = PairingState::default();
        self.trigger.signal();
        Ok(())
    }

    /// Abort an in-flight pairing request.
    pub fn abort(&self) {
        let mut state = self.state.lock().unwrap();
        if state.mode != PairingMode::None {
            info!(target: "pairing", "pairing aborted");
            *state = PairingState::default();
        }
    }

    /// Drop the persisted master record and disconnect master sessions.
    pub fn clear_paired(&self) -> ServerResult<()> {
        self.options.clear_master()?;
        let disconnected = self.clients.disconnect_masters();
        info!(target: "pairing", disconnected, "cleared paired master");
        Ok(())
    }

    /// Abort the request when its deadline passed.
    pub fn expire(&self, now: DateTime<Utc>) {
        let expired = {
            let state = self.state.lock().unwrap();
            state.mode != PairingMode::None && state.deadline.is_some_and(|d| d <= now)
        };
        if expired {
            self.abort();
        }
    }
}

/// Watches the pairing state and the pairing file.
///
/// File contents `clear` request un-pairing; anything else requests pairing
/// with the default timeout counted from the file's mtime.
pub struct PairingWatcher {
    pub coordinator: Arc<PairingCoordinator>,
    pub pairing_file: std::path::PathBuf,
    pub trigger: Arc<Trigger>,
    pub server_mode: ServerMode,
    pub options: Arc<ServerOptions>,
}

impl PairingWatcher {
    fn check_pairing_file(&self) {
        let Ok(meta) = std::fs::metadata(&self.pairing_file) else {
            return;
        };
        let contents = std::fs::read_to_string(&self.pairing_file).unwrap_or_default();
        if let Err(err) = std::fs::remove_file(&self.pairing_file) {
            warn!(target: "pairing", error = %err, "cannot remove pairing file");
        }

        if contents.trim() == "clear" {
            if let Err(err) = self.coordinator.clear_paired() {
                warn!(target: "pairing", error = %err, "un-pairing via pairing file failed");
            }
            return;
        }

        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .and_then(|d| Utc.timestamp_opt(d.as_secs() as i64, 0).single())
            .unwrap_or_else(Utc::now);
        let deadline = mtime
            + chrono::Duration::from_std(DEFAULT_PAIRING_MASTER_TIMEOUT).unwrap_or_default();
        if deadline <= Utc::now() {
            debug!(target: "pairing", "stale pairing file ignored");
            return;
        }

        let remaining = (deadline - Utc::now()).to_std().unwrap_or_default();
        self.coordinator
            .begin(remaining, PairingMode::Auto, Utc::now());
    }
}

#[async_trait::async_trait]
impl Service for PairingWatcher {
    fn name(&self) -> &'static str {
        "pairing"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        loop {
            let now = Utc::now();
            self.coordinator.expire(now);

            // A slave without a paired master keeps an automatic pairing
            // request open so the first master can adopt it.
            if self.server_mode == ServerMode::Slave
                && self.options.master().is_none()
                && self.coordinator.mode() == PairingMode::None
            {
                self.coordinator
                    .begin(DEFAULT_PAIRING_MASTER_TIMEOUT, PairingMode::Auto, now);
            }

            self.check_pairing_file();

            if delay(WATCH_PERIOD, Some(&self.trigger), &shutdown).await == DelayOutcome::Quit {
                return Ok(());
            }
        }
    }
}
