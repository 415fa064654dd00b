// Kernel - core infrastructure with dependency injection
//
// The ServerKernel holds all server dependencies (job list, client list,
// authorization, pairing, pause flags, capability handles) and the
// long-running services that drive them.
//
// IMPORTANT: Kernel is for INFRASTRUCTURE only, not business logic.
// Business logic belongs in domains/.

pub mod aggregate;
pub mod clients;
pub mod delay;
pub mod deps;
pub mod index_workers;
pub mod options;
pub mod pairing;
pub mod pause;
pub mod persistence;
pub mod runner;
pub mod scheduler;
pub mod scripts;
pub mod service_host;
pub mod slaves;
pub mod test_dependencies;
pub mod tls;
pub mod traits;

pub use clients::{Authorization, ClientRegistry};
pub use delay::{delay, DelayOutcome, Trigger};
pub use deps::{Capabilities, ServerKernel, Triggers};
pub use options::ServerOptions;
pub use pairing::{PairingCoordinator, PairingMode};
pub use pause::{PauseFlags, PauseMode};
pub use service_host::{Service, ServiceHost};
pub use test_dependencies::{
    MemoryContinuousLog, MemoryIndex, MemoryStorage, RecordingMountManager,
    RecordingScriptRunner, SimulatedArchiver, TestDependencies,
};
pub use traits::*;
