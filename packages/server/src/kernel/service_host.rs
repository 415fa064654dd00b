//! Named long-running services and their host.
//!
//! Every background loop (scheduler, runner, persistence, index workers,
//! pairing, slaves) implements [`Service`]; the host spawns them, funnels
//! one shutdown token to all of them, and waits for each to drain.

use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// A named long-running background service.
#[async_trait::async_trait]
pub trait Service: Send + 'static {
    fn name(&self) -> &'static str;

    /// Run until the shutdown token fires.
    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()>;
}

/// Spawns services and awaits graceful shutdown.
pub struct ServiceHost {
    shutdown: CancellationToken,
    handles: Vec<(&'static str, JoinHandle<Result<()>>)>,
    drain_timeout: Duration,
}

impl ServiceHost {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            shutdown,
            handles: Vec::new(),
            drain_timeout: Duration::from_secs(120),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Spawn a service immediately.
    pub fn spawn(&mut self, service: impl Service) {
        let name = service.name();
        let shutdown = self.shutdown.clone();
        info!(service = name, "starting service");
        let handle = tokio::spawn(async move {
            let result = Box::new(service).run(shutdown).await;
            match &result {
                Ok(()) => info!(service = name, "service stopped"),
                Err(e) => error!(service = name, error = %e, "service failed"),
            }
            result
        });
        self.handles.push((name, handle));
    }

    /// Signal shutdown and wait for every service to drain.
    pub async fn shutdown_and_wait(self) {
        self.shutdown.cancel();
        for (name, handle) in self.handles {
            match tokio::time::timeout(self.drain_timeout, handle).await {
                Ok(Ok(_)) => {}
                Ok(Err(join_error)) => {
                    error!(service = name, error = %join_error, "service panicked")
                }
                Err(_) => warn!(service = name, "service did not stop in time"),
            }
        }
    }

    /// Wait until the shutdown token fires, then drain.
    pub async fn run_until_shutdown(self) {
        self.shutdown.cancelled().await;
        self.shutdown_and_wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct TickService {
        stopped: Arc<AtomicBool>,
    }

    #[async_trait::async_trait]
    impl Service for TickService {
        fn name(&self) -> &'static str {
            "tick"
        }

        async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
            shutdown.cancelled().await;
            self.stopped.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_host_stops_services_on_shutdown() {
        let stopped = Arc::new(AtomicBool::new(false));
        let mut host = ServiceHost::new(CancellationToken::new());
        host.spawn(TickService {
            stopped: stopped.clone(),
        });

        host.shutdown_and_wait().await;
        assert!(stopped.load(Ordering::SeqCst));
    }
}
