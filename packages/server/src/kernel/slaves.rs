//! Slave registry and connector pool (master mode).
//!
//! One connector exists per distinct `(host, port, tlsMode)` referenced by
//! any remote job. A reconcile loop connects, authorizes, verifies protocol
//! version and mode, derives the slave state, and propagates it to every
//! job bound to that slave.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wireline::{CommandFrame, ResultFrame, ValueMap};

use super::delay::{delay, DelayOutcome, Trigger};
use super::options::ServerOptions;
use super::service_host::Service;
use crate::common::auth::crypto::SessionKey;
use crate::common::error::{ServerError, ServerResult};
use crate::common::types::{ServerMode, SlaveState, TlsMode, PROTOCOL_VERSION_MAJOR};
use crate::domains::job::model::SlaveBinding;
use crate::domains::job::JobList;

/// Time limit for authorizing against a slave.
pub const AUTHORIZE_TIMEOUT: Duration = Duration::from_secs(30);

/// Reconcile period while every slave is healthy.
const RECONCILE_PERIOD: Duration = Duration::from_secs(60);

/// Short sleep while any slave is offline or unpaired.
const RETRY_PERIOD: Duration = Duration::from_secs(30);

/// Derive the slave state, in priority order.
pub fn derive_slave_state(
    connected: bool,
    authorized: bool,
    peer_mode: Option<ServerMode>,
    peer_major: Option<u32>,
) -> SlaveState {
    if !connected {
        SlaveState::Offline
    } else if !authorized {
        SlaveState::Online
    } else if peer_mode != Some(ServerMode::Slave) {
        SlaveState::WrongMode
    } else if peer_major != Some(PROTOCOL_VERSION_MAJOR) {
        SlaveState::WrongProtocolVersion
    } else {
        SlaveState::Paired
    }
}

// ============================================================================
// Connection
// ============================================================================

enum SlaveStream {
    Plain(BufStream<TcpStream>),
    Tls(Box<BufStream<tokio_rustls::client::TlsStream<TcpStream>>>),
}

impl SlaveStream {
    async fn send_line(&mut self, line: &str) -> ServerResult<()> {
        let write = async {
            match self {
                SlaveStream::Plain(stream) => {
                    stream.write_all(line.as_bytes()).await?;
                    stream.write_all(b"\n").await?;
                    stream.flush().await
                }
                SlaveStream::Tls(stream) => {
                    stream.write_all(line.as_bytes()).await?;
                    stream.write_all(b"\n").await?;
                    stream.flush().await
                }
            }
        };
        write
            .await
            .map_err(|e: std::io::Error| ServerError::ConnectFail(e.to_string()))
    }

    async fn read_line(&mut self) -> ServerResult<String> {
        let mut line = String::new();
        let read = match self {
            SlaveStream::Plain(stream) => stream.read_line(&mut line).await,
            SlaveStream::Tls(stream) => stream.read_line(&mut line).await,
        };
        match read {
            Ok(0) => Err(ServerError::ConnectFail("connection closed".to_string())),
            Ok(_) => Ok(line),
            Err(e) => Err(ServerError::ConnectFail(e.to_string())),
        }
    }
}

/// One live protocol connection to a slave.
pub struct Connection {
    stream: SlaveStream,
    next_id: u32,
    /// Peer session key from the greeting, for RSA credential transport.
    peer_key: Option<(String, String)>,
}

impl Connection {
    /// Connect and consume the session greeting.
    pub async fn connect(host: &str, port: u16) -> ServerResult<Self> {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| ServerError::ConnectFail(format!("{host}:{port}: {e}")))?;
        let mut connection = Self {
            stream: SlaveStream::Plain(BufStream::new(stream)),
            next_id: 0,
            peer_key: None,
        };
        connection.read_greeting().await?;
        Ok(connection)
    }

    async fn read_greeting(&mut self) -> ServerResult<()> {
        let line = self.stream.read_line().await?;
        let mut tokens = line.split_whitespace();
        if tokens.next() != Some("SESSION") {
            return Err(ServerError::ConnectFail("missing session greeting".to_string()));
        }
        let mut modulus = None;
        let mut exponent = None;
        for token in tokens {
            if let Some((key, value)) = token.split_once('=') {
                match key {
                    "n" => modulus = Some(value.to_string()),
                    "e" => exponent = Some(value.to_string()),
                    _ => {}
                }
            }
        }
        if let (Some(n), Some(e)) = (modulus, exponent) {
            self.peer_key = Some((n, e));
        }
        Ok(())
    }

    pub fn peer_key(&self) -> Option<&(String, String)> {
        self.peer_key.as_ref()
    }

    /// Ask the peer to switch to TLS. The connection stays usable (plain)
    /// when the peer refuses.
    pub async fn request_start_tls(&mut self) -> ServerResult<()> {
        self.execute("startTLS", ValueMap::new(), |_| {}).await?;
        Ok(())
    }

    /// Perform the TLS handshake after an accepted `startTLS`.
    pub async fn into_tls(self, tls: &TlsConnector, server_name: &str) -> ServerResult<Self> {
        let SlaveStream::Plain(buffered) = self.stream else {
            return Err(ServerError::Failure("connection already uses TLS".to_string()));
        };
        let tcp = buffered.into_inner();
        let name = rustls::pki_types::ServerName::try_from(server_name.to_string())
            .map_err(|_| ServerError::ConnectFail(format!("bad server name '{server_name}'")))?;
        let stream = tls
            .connect(name, tcp)
            .await
            .map_err(|e| ServerError::ConnectFail(format!("TLS handshake: {e}")))?;

        Ok(Self {
            stream: SlaveStream::Tls(Box::new(BufStream::new(stream))),
            next_id: self.next_id,
            peer_key: self.peer_key,
        })
    }

    /// Send one command and stream result rows to `on_row` until the
    /// terminal frame; returns its data or the peer's error.
    pub async fn execute(
        &mut self,
        name: &str,
        args: ValueMap,
        mut on_row: impl FnMut(&ResultFrame),
    ) -> ServerResult<ValueMap> {
        self.next_id += 1;
        let id = self.next_id;
        let frame = CommandFrame::with_args(id, name, args);
        self.stream.send_line(&frame.format()).await?;

        loop {
            let line = self.stream.read_line().await?;
            let result = match ResultFrame::parse(&line) {
                Ok(result) => result,
                Err(err) => {
                    debug!(error = %err, "discarding unparseable result line");
                    continue;
                }
            };
            if result.id != id {
                continue;
            }
            if !result.complete {
                on_row(&result);
                continue;
            }
            if result.code.is_ok() {
                return Ok(result.data);
            }
            let message = result.data.get_str_or("message", "").to_string();
            return Err(ServerError::from_wire(result.code, message));
        }
    }
}

// ============================================================================
// Connector
// ============================================================================

#[derive(Default)]
struct ConnectorState {
    connection: Option<Connection>,
    authorized: bool,
    shutdown_requested: bool,
    peer_mode: Option<ServerMode>,
    peer_major: Option<u32>,
}

/// Connector to one configured slave host.
pub struct SlaveConnector {
    pub binding: SlaveBinding,
    state: tokio::sync::Mutex<ConnectorState>,
    /// Held while a remote job run uses this connector.
    locked: AtomicBool,
    slave_state: Mutex<SlaveState>,
}

impl SlaveConnector {
    pub fn new(binding: SlaveBinding) -> Arc<Self> {
        Arc::new(Self {
            binding,
            state: tokio::sync::Mutex::new(ConnectorState::default()),
            locked: AtomicBool::new(false),
            slave_state: Mutex::new(SlaveState::Offline),
        })
    }

    pub fn slave_state(&self) -> SlaveState {
        *self.slave_state.lock().unwrap()
    }

    pub fn is_paired(&self) -> bool {
        self.slave_state() == SlaveState::Paired
    }

    pub fn lock(&self) -> bool {
        !self.locked.swap(true, Ordering::SeqCst)
    }

    pub fn unlock(&self) {
        self.locked.store(false, Ordering::SeqCst);
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    pub async fn request_shutdown(&self) {
        self.state.lock().await.shutdown_requested = true;
    }

    /// Disconnect and reset. Returns whether the connector was authorized.
    pub async fn disconnect(&self) -> bool {
        let mut state = self.state.lock().await;
        let was_authorized = state.authorized;
        *state = ConnectorState::default();
        *self.slave_state.lock().unwrap() = SlaveState::Offline;
        was_authorized
    }

    async fn upgrade_tls(
        &self,
        mut connection: Connection,
        tls: Option<&TlsConnector>,
    ) -> ServerResult<Connection> {
        match (self.binding.tls_mode, tls) {
            (TlsMode::None, _) | (TlsMode::Try, None) => Ok(connection),
            (TlsMode::Force, None) => Err(ServerError::NoTlsCertificate),
            (TlsMode::Try, Some(tls)) => match connection.request_start_tls().await {
                Ok(()) => connection.into_tls(tls, &self.binding.host).await,
                // Peer cannot or will not: stay plain.
                Err(ServerError::FunctionNotSupported) | Err(ServerError::NoTlsCertificate) => {
                    Ok(connection)
                }
                Err(err) => Err(err),
            },
            (TlsMode::Force, Some(tls)) => {
                connection.request_start_tls().await?;
                connection.into_tls(tls, &self.binding.host).await
            }
        }
    }

    /// One reconcile step: connect, authorize, verify; update slave state.
    pub async fn reconcile(
        &self,
        own_name: &str,
        server_uuid: &str,
        tls: Option<&TlsConnector>,
    ) -> SlaveState {
        let mut state = self.state.lock().await;

        if state.shutdown_requested {
            let was_authorized = state.authorized;
            *state = ConnectorState::default();
            if was_authorized {
                info!(host = %self.binding.host, "slave disconnected");
            }
        }

        if state.connection.is_none() {
            match Connection::connect(&self.binding.host, self.binding.port).await {
                Ok(connection) => {
                    match self.upgrade_tls(connection, tls).await {
                        Ok(connection) => {
                            state.connection = Some(connection);
                            state.authorized = false;
                        }
                        Err(err) => {
                            warn!(host = %self.binding.host, error = %err, "slave TLS upgrade failed");
                        }
                    }
                }
                Err(err) => {
                    // Connect failures are routine while a slave is down.
                    debug!(host = %self.binding.host, error = %err, "slave connect failed");
                }
            }
        }

        if state.connection.is_some() && !state.authorized {
            match tokio::time::timeout(
                AUTHORIZE_TIMEOUT,
                authorize_and_verify(state.connection.as_mut().unwrap(), own_name, server_uuid),
            )
            .await
            {
                Ok(Ok((mode, major))) => {
                    state.authorized = true;
                    state.peer_mode = Some(mode);
                    state.peer_major = Some(major);
                    info!(host = %self.binding.host, %mode, major, "slave authorized");
                }
                Ok(Err(err)) => {
                    warn!(host = %self.binding.host, error = %err, "slave authorize failed");
                    state.connection = None;
                }
                Err(_) => {
                    warn!(host = %self.binding.host, "slave authorize timed out");
                    state.connection = None;
                }
            }
        }

        let derived = derive_slave_state(
            state.connection.is_some(),
            state.authorized,
            state.peer_mode,
            state.peer_major,
        );
        *self.slave_state.lock().unwrap() = derived;
        derived
    }

    /// Forward one command over this connector.
    pub async fn execute(
        &self,
        name: &str,
        args: ValueMap,
        on_row: impl FnMut(&ResultFrame),
    ) -> ServerResult<ValueMap> {
        let mut state = self.state.lock().await;
        if !state.authorized {
            return Err(ServerError::SlaveDisconnected(self.binding.host.clone()));
        }
        let connection = state
            .connection
            .as_mut()
            .ok_or_else(|| ServerError::SlaveDisconnected(self.binding.host.clone()))?;
        let result = connection.execute(name, args, on_row).await;
        if matches!(result, Err(ServerError::ConnectFail(_))) {
            state.connection = None;
            state.authorized = false;
            *self.slave_state.lock().unwrap() = SlaveState::Offline;
            return Err(ServerError::SlaveDisconnected(self.binding.host.clone()));
        }
        result
    }
}

async fn authorize_and_verify(
    connection: &mut Connection,
    own_name: &str,
    server_uuid: &str,
) -> ServerResult<(ServerMode, u32)> {
    let (encrypt_type, blob) = match connection.peer_key() {
        Some((n, e)) => ("RSA", SessionKey::encrypt_for(n, e, server_uuid)?),
        None => {
            use base64::prelude::{Engine as _, BASE64_STANDARD};
            ("NONE", BASE64_STANDARD.encode(server_uuid))
        }
    };

    connection
        .execute(
            "authorize",
            ValueMap::new()
                .with("encryptType", encrypt_type)
                .with("name", own_name)
                .with("encryptedUUID", blob),
            |_| {},
        )
        .await?;

    let version = connection.execute("version", ValueMap::new(), |_| {}).await?;
    let major: u32 = version.get_or("major", 0).unwrap_or(0);
    let mode: ServerMode = version
        .get_str_or("mode", "MASTER")
        .parse()
        .unwrap_or(ServerMode::Master);
    Ok((mode, major))
}

// ============================================================================
// Registry
// ============================================================================

/// The connector pool plus its reconcile service.
pub struct SlaveRegistry {
    connectors: Mutex<Vec<Arc<SlaveConnector>>>,
    options: Arc<ServerOptions>,
    own_name: String,
}

impl SlaveRegistry {
    pub fn new(options: Arc<ServerOptions>, own_name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            connectors: Mutex::new(Vec::new()),
            options,
            own_name: own_name.into(),
        })
    }

    pub fn connector_for(&self, binding: &SlaveBinding) -> Option<Arc<SlaveConnector>> {
        self.connectors
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.binding == *binding)
            .cloned()
    }

    pub fn connectors(&self) -> Vec<Arc<SlaveConnector>> {
        self.connectors.lock().unwrap().clone()
    }

    /// Reconcile the connector list against the set of referenced bindings:
    /// add missing connectors, drop unreferenced ones unless locked.
    pub fn sync_with_bindings(&self, bindings: &HashSet<SlaveBinding>) {
        let mut connectors = self.connectors.lock().unwrap();

        for binding in bindings {
            if !connectors.iter().any(|c| c.binding == *binding) {
                debug!(host = %binding.host, port = binding.port, "adding slave connector");
                connectors.push(SlaveConnector::new(binding.clone()));
            }
        }

        connectors.retain(|connector| {
            bindings.contains(&connector.binding) || connector.is_locked()
        });
    }
}

/// The reconcile loop, run in master mode only.
pub struct SlaveReconciler {
    pub registry: Arc<SlaveRegistry>,
    pub jobs: Arc<JobList>,
    pub trigger: Arc<Trigger>,
}

impl SlaveReconciler {
    async fn iteration(&self) -> ServerResult<bool> {
        // Snapshot the referenced bindings without holding the lock long.
        let bindings: HashSet<SlaveBinding> = {
            let jobs = self.jobs.read().await?;
            jobs.iter().filter_map(|j| j.slave.clone()).collect()
        };
        self.registry.sync_with_bindings(&bindings);

        let server_uuid = self.registry.options.server_uuid()?;
        let tls = super::tls::build_connector(&self.registry.options).ok();
        let mut any_unhealthy = false;
        for connector in self.registry.connectors() {
            let state = connector
                .reconcile(&self.registry.own_name, &server_uuid, tls.as_ref())
                .await;
            if state != SlaveState::Paired {
                any_unhealthy = true;
            }
        }

        // Propagate the derived states to the bound jobs.
        {
            let mut jobs = self.jobs.write().await?;
            for job in jobs.iter_mut() {
                if let Some(binding) = &job.slave {
                    if let Some(connector) = self.registry.connector_for(binding) {
                        job.slave_state = connector.slave_state();
                    } else {
                        job.slave_state = SlaveState::Offline;
                    }
                }
            }
        }
        self.jobs.signal_modified();

        Ok(any_unhealthy)
    }
}

#[async_trait::async_trait]
impl Service for SlaveReconciler {
    fn name(&self) -> &'static str {
        "slaves"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        loop {
            let any_unhealthy = match self.iteration().await {
                Ok(any_unhealthy) => any_unhealthy,
                Err(err) => {
                    warn!(error = %err, "slave reconcile failed");
                    true
                }
            };

            let period = if any_unhealthy {
                RETRY_PERIOD
            } else {
                RECONCILE_PERIOD
            };
            if delay(period, Some(&self.trigger), &shutdown).await == DelayOutcome::Quit {
                for connector in self.registry.connectors() {
                    connector.disconnect().await;
                }
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(host: &str) -> SlaveBinding {
        SlaveBinding {
            host: host.to_string(),
            port: 38523,
            tls_mode: TlsMode::Try,
        }
    }

    #[test]
    fn test_derive_state_priority_order() {
        assert_eq!(
            derive_slave_state(false, false, None, None),
            SlaveState::Offline
        );
        assert_eq!(
            derive_slave_state(true, false, None, None),
            SlaveState::Online
        );
        assert_eq!(
            derive_slave_state(true, true, Some(ServerMode::Master), Some(PROTOCOL_VERSION_MAJOR)),
            SlaveState::WrongMode
        );
        assert_eq!(
            derive_slave_state(true, true, Some(ServerMode::Slave), Some(99)),
            SlaveState::WrongProtocolVersion
        );
        assert_eq!(
            derive_slave_state(true, true, Some(ServerMode::Slave), Some(PROTOCOL_VERSION_MAJOR)),
            SlaveState::Paired
        );
    }

    #[test]
    fn test_sync_adds_and_drops_connectors() {
        let dir = tempfile::tempdir().unwrap();
        let options = Arc::new(ServerOptions::load(dir.path().join("server.conf")).unwrap());
        let registry = SlaveRegistry::new(options, "master-1");

        let mut bindings = HashSet::new();
        bindings.insert(binding("s1"));
        bindings.insert(binding("s2"));
        registry.sync_with_bindings(&bindings);
        assert_eq!(registry.connectors().len(), 2);

        // s2 no longer referenced: dropped.
        bindings.remove(&binding("s2"));
        registry.sync_with_bindings(&bindings);
        assert_eq!(registry.connectors().len(), 1);
        assert!(registry.connector_for(&binding("s1")).is_some());
    }

    #[test]
    fn test_sync_keeps_locked_connector() {
        let dir = tempfile::tempdir().unwrap();
        let options = Arc::new(ServerOptions::load(dir.path().join("server.conf")).unwrap());
        let registry = SlaveRegistry::new(options, "master-1");

        let mut bindings = HashSet::new();
        bindings.insert(binding("s1"));
        registry.sync_with_bindings(&bindings);
        let connector = registry.connector_for(&binding("s1")).unwrap();
        assert!(connector.lock());

        registry.sync_with_bindings(&HashSet::new());
        assert_eq!(registry.connectors().len(), 1);

        connector.unlock();
        registry.sync_with_bindings(&HashSet::new());
        assert!(registry.connectors().is_empty());
    }

    #[tokio::test]
    async fn test_execute_requires_authorized_connection() {
        let connector = SlaveConnector::new(binding("s1"));
        let err = connector
            .execute("status", ValueMap::new(), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::SlaveDisconnected(_)));
    }
}
