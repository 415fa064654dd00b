//! Application setup: initial job load, background services, listeners.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

use super::dispatcher::Dispatcher;
use super::session::run_network_session;
use crate::common::types::ServerMode;
use crate::kernel::index_workers::{AutoIndexWorker, IndexUpdateWorker};
use crate::kernel::pairing::PairingWatcher;
use crate::kernel::pause::PauseWatcher;
use crate::kernel::persistence::PersistenceEngine;
use crate::kernel::runner::JobRunner;
use crate::kernel::scheduler::Scheduler;
use crate::kernel::slaves::SlaveReconciler;
use crate::kernel::{ServerKernel, ServiceHost};

/// Load the configured jobs into the job list and pull their aggregate
/// statistics from the index.
pub async fn load_jobs(kernel: &Arc<ServerKernel>) -> Result<usize> {
    let jobs = kernel
        .job_store
        .load_all(Utc::now())
        .context("cannot read jobs directory")?;
    let count = jobs.len();
    *kernel.jobs.write().await.map_err(anyhow::Error::from)? = jobs;
    kernel.jobs.signal_modified();

    if kernel.index.is_initialized() {
        if let Ok(handle) = kernel.index.open_handle().await {
            if let Err(err) = crate::kernel::aggregate::refresh_all(kernel, &handle).await {
                warn!(error = %err, "aggregate preload failed");
            }
            kernel.index.close_handle(handle).await;
        }
    }
    Ok(count)
}

/// Spawn every background service for this server mode.
pub fn start_services(kernel: &Arc<ServerKernel>) -> ServiceHost {
    let mut host = ServiceHost::new(kernel.quit.clone());

    host.spawn(Scheduler::new(kernel.clone()));
    host.spawn(JobRunner::new(kernel.clone()));
    host.spawn(PersistenceEngine::new(kernel.clone()));
    host.spawn(IndexUpdateWorker::new(kernel.clone()));
    host.spawn(AutoIndexWorker::new(kernel.clone()));
    host.spawn(PauseWatcher {
        kernel: kernel.clone(),
    });

    match kernel.config.mode {
        ServerMode::Master => {
            host.spawn(SlaveReconciler {
                registry: kernel.slaves.clone(),
                jobs: kernel.jobs.clone(),
                trigger: kernel.triggers.slaves.clone(),
            });
        }
        ServerMode::Slave => {
            host.spawn(PairingWatcher {
                coordinator: kernel.pairing.clone(),
                pairing_file: kernel.config.pairing_file.clone(),
                trigger: kernel.triggers.pairing.clone(),
                server_mode: kernel.config.mode,
                options: kernel.options.clone(),
            });
        }
    }
    host
}

async fn accept_loop(
    kernel: Arc<ServerKernel>,
    dispatcher: Arc<Dispatcher>,
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
) {
    loop {
        let accepted = tokio::select! {
            _ = kernel.quit.cancelled() => return,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(error = %err, "accept failed");
                continue;
            }
        };

        // Under the cap, stuck authorizations are purged to make room.
        let max_connections = kernel.options.with(|o| o.max_connections);
        if !kernel.clients.has_capacity(max_connections) {
            kernel.clients.purge_unauthorized(Utc::now());
            if !kernel.clients.has_capacity(max_connections) {
                warn!(peer = %peer, "connection refused, server full");
                continue;
            }
        }

        info!(peer = %peer, tls = tls.is_some(), "client connected");
        tokio::spawn(run_network_session(
            kernel.clone(),
            dispatcher.clone(),
            stream,
            peer,
            tls.clone(),
        ));
    }
}

/// Run the server: services, listeners, graceful shutdown.
pub async fn run_server(kernel: Arc<ServerKernel>) -> Result<()> {
    let count = load_jobs(&kernel).await?;
    info!(jobs = count, "jobs loaded");

    let dispatcher = Dispatcher::new().into_shared();
    let host = start_services(&kernel);

    let addr = format!("0.0.0.0:{}", kernel.config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("cannot bind {addr}"))?;
    info!(%addr, mode = %kernel.config.mode, "server listening");
    let mut accept_tasks = vec![tokio::spawn(accept_loop(
        kernel.clone(),
        dispatcher.clone(),
        listener,
        None,
    ))];

    if let Some(tls_port) = kernel.config.tls_port {
        match crate::kernel::tls::build_acceptor(&kernel.options) {
            Ok(acceptor) => {
                let addr = format!("0.0.0.0:{tls_port}");
                let listener = TcpListener::bind(&addr)
                    .await
                    .with_context(|| format!("cannot bind {addr}"))?;
                info!(%addr, "TLS listener ready");
                accept_tasks.push(tokio::spawn(accept_loop(
                    kernel.clone(),
                    dispatcher.clone(),
                    listener,
                    Some(acceptor),
                )));
            }
            Err(err) => warn!(error = %err, "TLS listener disabled"),
        }
    }

    // Run until a shutdown signal arrives.
    tokio::select! {
        _ = kernel.quit.cancelled() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
            kernel.request_quit();
        }
    }

    for task in accept_tasks {
        task.abort();
    }
    host.shutdown_and_wait().await;
    info!("server stopped");
    Ok(())
}

/// Run in batch mode: execute commands from stdin synchronously.
pub async fn run_batch(kernel: Arc<ServerKernel>) -> Result<()> {
    let count = load_jobs(&kernel).await?;
    info!(jobs = count, "jobs loaded");

    let dispatcher = Dispatcher::new().into_shared();
    super::session::run_batch_session(kernel, dispatcher)
        .await
        .map_err(anyhow::Error::from)
}
