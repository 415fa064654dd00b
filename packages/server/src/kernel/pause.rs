//! Process-wide pause/suspend flags.
//!
//! `pause` stops selected activities until a deadline; `suspend` stops all
//! of them until `continue`. The watcher service clears expired pauses.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};

/// Selectable pause modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseMode {
    Create,
    Storage,
    Restore,
    IndexUpdate,
    IndexMaintenance,
}

impl PauseMode {
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim().to_ascii_uppercase().as_str() {
            "CREATE" => Some(PauseMode::Create),
            "STORAGE" => Some(PauseMode::Storage),
            "RESTORE" => Some(PauseMode::Restore),
            "INDEX_UPDATE" => Some(PauseMode::IndexUpdate),
            "INDEX_MAINTENANCE" => Some(PauseMode::IndexMaintenance),
            _ => None,
        }
    }

    pub const ALL: [PauseMode; 5] = [
        PauseMode::Create,
        PauseMode::Storage,
        PauseMode::Restore,
        PauseMode::IndexUpdate,
        PauseMode::IndexMaintenance,
    ];
}

/// Shared pause state.
#[derive(Default)]
pub struct PauseFlags {
    create: AtomicBool,
    storage: AtomicBool,
    restore: AtomicBool,
    index_update: AtomicBool,
    index_maintenance: AtomicBool,
    suspended: AtomicBool,
    pause_end: Mutex<Option<DateTime<Utc>>>,
}

impl PauseFlags {
    pub fn new() -> Self {
        Self::default()
    }

    fn flag(&self, mode: PauseMode) -> &AtomicBool {
        match mode {
            PauseMode::Create => &self.create,
            PauseMode::Storage => &self.storage,
            PauseMode::Restore => &self.restore,
            PauseMode::IndexUpdate => &self.index_update,
            PauseMode::IndexMaintenance => &self.index_maintenance,
        }
    }

    /// Pause the given modes until `end`.
    pub fn pause(&self, modes: &[PauseMode], end: DateTime<Utc>) {
        for mode in modes {
            self.flag(*mode).store(true, Ordering::SeqCst);
        }
        *self.pause_end.lock().unwrap() = Some(end);
    }

    /// Suspend everything until `continue_all`.
    pub fn suspend(&self) {
        self.suspended.store(true, Ordering::SeqCst);
        for mode in PauseMode::ALL {
            self.flag(mode).store(true, Ordering::SeqCst);
        }
    }

    /// Clear every pause and suspension.
    pub fn continue_all(&self) {
        self.suspended.store(false, Ordering::SeqCst);
        for mode in PauseMode::ALL {
            self.flag(mode).store(false, Ordering::SeqCst);
        }
        *self.pause_end.lock().unwrap() = None;
    }

    /// Clear expired pauses; returns true when something was cleared.
    pub fn expire(&self, now: DateTime<Utc>) -> bool {
        if self.suspended.load(Ordering::SeqCst) {
            return false;
        }
        let mut end = self.pause_end.lock().unwrap();
        match *end {
            Some(deadline) if now >= deadline => {
                *end = None;
                drop(end);
                for mode in PauseMode::ALL {
                    self.flag(mode).store(false, Ordering::SeqCst);
                }
                true
            }
            _ => false,
        }
    }

    pub fn is_paused(&self, mode: PauseMode) -> bool {
        self.flag(mode).load(Ordering::SeqCst)
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    pub fn pause_end(&self) -> Option<DateTime<Utc>> {
        *self.pause_end.lock().unwrap()
    }
}

/// The pause watcher service: clears expired pauses, purges connections
/// stuck in authorization, and prunes the authorization fail history.
pub struct PauseWatcher {
    pub kernel: std::sync::Arc<super::deps::ServerKernel>,
}

#[async_trait::async_trait]
impl super::service_host::Service for PauseWatcher {
    fn name(&self) -> &'static str {
        "pause-watcher"
    }

    async fn run(
        self: Box<Self>,
        shutdown: tokio_util::sync::CancellationToken,
    ) -> anyhow::Result<()> {
        use super::delay::{delay, DelayOutcome};

        loop {
            let now = Utc::now();
            if self.kernel.pause.expire(now) {
                tracing::info!("pause expired, resuming");
            }
            self.kernel.clients.purge_unauthorized(now);
            self.kernel
                .auth
                .prune(now, &self.kernel.clients.live_names());

            if delay(std::time::Duration::from_secs(10), None, &shutdown).await
                == DelayOutcome::Quit
            {
                return Ok(());
            }
        }
    }
}
