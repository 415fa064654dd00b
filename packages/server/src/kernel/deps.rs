// ServerKernel - core infrastructure with all dependencies
//
// The ServerKernel holds the five global singletons (job list, client list,
// authorization registry, pairing record, pause flags), the capability
// handles to the external collaborators, and the per-service triggers.
// Handles are passed through the component graph instead of reaching for
// globals.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::clients::ClientRegistry;
use super::delay::Trigger;
use super::options::ServerOptions;
use super::pairing::PairingCoordinator;
use super::pause::PauseFlags;
use super::slaves::SlaveRegistry;
use super::traits::{Archiver, ContinuousLog, Index, MountManager, ScriptRunner, Storage};
use crate::common::auth::AuthorizationRegistry;
use crate::config::Config;
use crate::domains::job::store::JobStore;
use crate::domains::job::JobList;

/// Wakeup triggers, one per long-running service.
pub struct Triggers {
    pub scheduler: Arc<Trigger>,
    pub pairing: Arc<Trigger>,
    pub update_index: Arc<Trigger>,
    pub auto_index: Arc<Trigger>,
    pub persistence: Arc<Trigger>,
    pub slaves: Arc<Trigger>,
}

impl Default for Triggers {
    fn default() -> Self {
        Self {
            scheduler: Arc::new(Trigger::new()),
            pairing: Arc::new(Trigger::new()),
            update_index: Arc::new(Trigger::new()),
            auto_index: Arc::new(Trigger::new()),
            persistence: Arc::new(Trigger::new()),
            slaves: Arc::new(Trigger::new()),
        }
    }
}

impl Triggers {
    /// Broadcast every trigger, used at shutdown so all sleepers wake.
    pub fn signal_all(&self) {
        self.scheduler.signal();
        self.pairing.signal();
        self.update_index.signal();
        self.auto_index.signal();
        self.persistence.signal();
        self.slaves.signal();
    }
}

/// External collaborator handles.
pub struct Capabilities {
    pub index: Arc<dyn Index>,
    pub storage: Arc<dyn Storage>,
    pub archiver: Arc<dyn Archiver>,
    pub continuous: Arc<dyn ContinuousLog>,
    pub scripts: Arc<dyn ScriptRunner>,
    pub mounts: Arc<dyn MountManager>,
}

/// ServerKernel holds all server dependencies
pub struct ServerKernel {
    pub config: Config,
    pub jobs: Arc<JobList>,
    pub job_store: Arc<JobStore>,
    pub clients: Arc<ClientRegistry>,
    pub auth: Arc<AuthorizationRegistry>,
    pub pause: Arc<PauseFlags>,
    pub options: Arc<ServerOptions>,
    pub pairing: Arc<PairingCoordinator>,
    pub slaves: Arc<SlaveRegistry>,
    pub index: Arc<dyn Index>,
    pub storage: Arc<dyn Storage>,
    pub archiver: Arc<dyn Archiver>,
    pub continuous: Arc<dyn ContinuousLog>,
    pub scripts: Arc<dyn ScriptRunner>,
    pub mounts: Arc<dyn MountManager>,
    pub triggers: Triggers,
    pub quit: CancellationToken,
}

impl ServerKernel {
    /// Wire the kernel from a configuration and capability set.
    pub fn build(config: Config, capabilities: Capabilities) -> crate::common::ServerResult<Arc<Self>> {
        let options = Arc::new(ServerOptions::load(&config.config_file)?);
        let clients = Arc::new(ClientRegistry::new());
        let triggers = Triggers::default();

        let pairing = Arc::new(PairingCoordinator::new(
            options.clone(),
            clients.clone(),
            triggers.pairing.clone(),
            config.mode,
        ));
        let slaves = SlaveRegistry::new(options.clone(), config.machine_id.clone());

        Ok(Arc::new(Self {
            jobs: JobList::new().into_shared(),
            job_store: Arc::new(JobStore::new(&config.jobs_directory)),
            clients,
            auth: Arc::new(AuthorizationRegistry::new()),
            pause: Arc::new(PauseFlags::new()),
            options,
            pairing,
            slaves,
            index: capabilities.index,
            storage: capabilities.storage,
            archiver: capabilities.archiver,
            continuous: capabilities.continuous,
            scripts: capabilities.scripts,
            mounts: capabilities.mounts,
            triggers,
            quit: CancellationToken::new(),
            config,
        }))
    }

    /// Request process shutdown: cancel the quit token and wake every
    /// sleeping service.
    pub fn request_quit(&self) {
        self.quit.cancel();
        self.triggers.signal_all();
        self.jobs.signal_modified();
    }
}
