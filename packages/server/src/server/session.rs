//! Client sessions.
//!
//! A session owns one I/O channel (network socket, optionally TLS, or the
//! batch stdio of a CLI peer), its transient selections, and a fixed-size
//! worker pool. The session loop reads command lines, executes the few
//! connection-level commands inline (`startTLS`, `authorize`, `quit`,
//! `abort`), and queues everything else to the workers; result frames from
//! the workers funnel back through one channel so writes never interleave.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::Utc;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf, ReadHalf,
    WriteHalf,
};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};
use wireline::{CommandFrame, ResultFrame, ValueMap, WireCode};

use super::dispatcher::Dispatcher;
use crate::common::auth::SessionKey;
use crate::common::error::{ServerError, ServerResult};
use crate::domains::job::model::EntryType;
use crate::kernel::clients::{Authorization, ClientHandle};
use crate::kernel::traits::IndexHandle;
use crate::kernel::ServerKernel;

/// Workers per network client.
pub const SESSION_WORKERS: usize = 3;

/// Bounded command queue per session.
const QUEUE_DEPTH: usize = 32;

/// Capacity of the aborted-command-id ring buffer.
const ABORT_RING_CAPACITY: usize = 64;

/// TLS handshake time limit.
pub const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Session state
// ============================================================================

/// Ring buffer of aborted command ids.
#[derive(Default)]
pub struct AbortRing {
    ids: VecDeque<u32>,
}

impl AbortRing {
    pub fn push(&mut self, id: u32) {
        if self.ids.len() == ABORT_RING_CAPACITY {
            self.ids.pop_front();
        }
        self.ids.push_back(id);
    }

    pub fn contains(&self, id: u32) -> bool {
        self.ids.contains(&id)
    }
}

/// Per-session transient selections used by restore and the list commands.
#[derive(Default)]
pub struct Selections {
    pub includes: Vec<(EntryType, String)>,
    pub excludes: Vec<String>,
    pub job_option_overrides: HashMap<String, String>,
    pub selected_index_ids: Vec<i64>,
    pub selected_entry_ids: Vec<i64>,
    pub directory_info_cache: HashMap<String, (u64, u64)>,
}

/// Per-session password wallet.
#[derive(Default)]
pub struct PasswordWallet {
    pub decrypt: Vec<String>,
    pub ftp: Option<String>,
    pub ssh: Option<String>,
    pub webdav: Option<String>,
    pub crypt: Option<String>,
}

impl PasswordWallet {
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Shared state of one client session.
pub struct SessionState {
    pub handle: Arc<ClientHandle>,
    pub session_key: SessionKey,
    pub peer: String,
    pub is_batch: bool,
    pub tls_active: AtomicBool,
    pub abort_ring: Mutex<AbortRing>,
    pub selections: Mutex<Selections>,
    pub passwords: Mutex<PasswordWallet>,
    /// Index handles of in-flight commands, for `abort commandId=N`.
    pub command_handles: Mutex<HashMap<u32, IndexHandle>>,
    /// Pending server-initiated prompts awaiting `actionResult`.
    pub pending_actions: Mutex<HashMap<u32, oneshot::Sender<ValueMap>>>,
    pub quit_requested: AtomicBool,
}

impl SessionState {
    pub fn new(
        handle: Arc<ClientHandle>,
        peer: impl Into<String>,
        is_batch: bool,
    ) -> ServerResult<Arc<Self>> {
        Ok(Arc::new(Self {
            handle,
            session_key: SessionKey::generate()?,
            peer: peer.into(),
            is_batch,
            tls_active: AtomicBool::new(false),
            abort_ring: Mutex::new(AbortRing::default()),
            selections: Mutex::new(Selections::default()),
            passwords: Mutex::new(PasswordWallet::default()),
            command_handles: Mutex::new(HashMap::new()),
            pending_actions: Mutex::new(HashMap::new()),
            quit_requested: AtomicBool::new(false),
        }))
    }

    pub fn authorization(&self) -> Authorization {
        self.handle.authorization()
    }

    pub fn is_aborted(&self, command_id: u32) -> bool {
        self.abort_ring.lock().unwrap().contains(command_id)
    }

    /// Register a command's index handle so `abort` can interrupt it.
    pub fn register_handle(&self, command_id: u32, handle: IndexHandle) {
        self.command_handles
            .lock()
            .unwrap()
            .insert(command_id, handle);
    }

    pub fn unregister_handle(&self, command_id: u32) {
        self.command_handles.lock().unwrap().remove(&command_id);
    }

    /// Resolve a pending prompt with the client's `actionResult` fields.
    pub fn resolve_action(&self, command_id: u32, fields: ValueMap) -> bool {
        match self.pending_actions.lock().unwrap().remove(&command_id) {
            Some(tx) => tx.send(fields).is_ok(),
            None => false,
        }
    }
}

/// Sends intermediate result rows of one command.
#[derive(Clone)]
pub struct ResultSink {
    pub command_id: u32,
    tx: mpsc::UnboundedSender<ResultFrame>,
}

impl ResultSink {
    pub fn new(command_id: u32, tx: mpsc::UnboundedSender<ResultFrame>) -> Self {
        Self { command_id, tx }
    }

    /// Stream one `complete=0` row.
    pub fn row(&self, data: ValueMap) {
        let _ = self.tx.send(ResultFrame::row(self.command_id, data));
    }

    /// Send a prompt row and wait for the matching `actionResult`.
    pub async fn prompt(
        &self,
        session: &SessionState,
        data: ValueMap,
        timeout: Duration,
    ) -> ServerResult<ValueMap> {
        let (tx, rx) = oneshot::channel();
        session
            .pending_actions
            .lock()
            .unwrap()
            .insert(self.command_id, tx);
        self.row(data);

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(fields)) => Ok(fields),
            Ok(Err(_)) | Err(_) => {
                session
                    .pending_actions
                    .lock()
                    .unwrap()
                    .remove(&self.command_id);
                Err(ServerError::Aborted)
            }
        }
    }
}

// ============================================================================
// Streams
// ============================================================================

/// The session transport: plain TCP or TLS.
pub enum SessionStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
}

impl AsyncRead for SessionStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SessionStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            SessionStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for SessionStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            SessionStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            SessionStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SessionStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            SessionStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SessionStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            SessionStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

// ============================================================================
// Network session
// ============================================================================

enum IoPhase {
    Closed,
    /// `startTLS` accepted: the caller upgrades the returned stream.
    Upgrade,
}

enum WriteCommand {
    Frame(ResultFrame),
    Stop,
}

/// Run one network client session to completion.
pub async fn run_network_session(
    kernel: Arc<ServerKernel>,
    dispatcher: Arc<Dispatcher>,
    stream: TcpStream,
    peer: SocketAddr,
    direct_tls: Option<TlsAcceptor>,
) {
    let client = kernel.clients.register(peer.ip().to_string(), Utc::now());
    let client_id = client.id;

    let result = drive_session(
        kernel.clone(),
        dispatcher,
        client.clone(),
        stream,
        peer,
        direct_tls,
    )
    .await;
    if let Err(err) = result {
        debug!(peer = %peer, error = %err, "session ended with error");
    }

    kernel.clients.unregister(client_id);
    info!(peer = %peer, "client disconnected");
}

async fn drive_session(
    kernel: Arc<ServerKernel>,
    dispatcher: Arc<Dispatcher>,
    client: Arc<ClientHandle>,
    tcp: TcpStream,
    peer: SocketAddr,
    direct_tls: Option<TlsAcceptor>,
) -> ServerResult<()> {
    let session = SessionState::new(client, peer.to_string(), false)?;

    // A TLS listen port accepts TLS directly, without startTLS.
    let mut stream = match direct_tls {
        Some(acceptor) => {
            let tls = tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(tcp))
                .await
                .map_err(|_| ServerError::ConnectFail("TLS handshake timeout".to_string()))?
                .map_err(|e| ServerError::ConnectFail(format!("TLS handshake: {e}")))?;
            session.tls_active.store(true, Ordering::SeqCst);
            SessionStream::Tls(Box::new(tls))
        }
        None => SessionStream::Plain(tcp),
    };

    // Session greeting with the advertised session key.
    write_line(
        &mut stream,
        &format!(
            "SESSION encryptTypes=RSA,NONE n={} e={}",
            session.session_key.modulus_hex(),
            session.session_key.exponent_hex()
        ),
    )
    .await?;

    // Worker pool and result funnel live across TLS upgrades.
    let (result_tx, mut result_rx) = mpsc::unbounded_channel::<ResultFrame>();
    let (work_tx, work_rx) = mpsc::channel::<CommandFrame>(QUEUE_DEPTH);
    let work_rx = Arc::new(tokio::sync::Mutex::new(work_rx));

    let mut workers = Vec::with_capacity(SESSION_WORKERS);
    for _ in 0..SESSION_WORKERS {
        let dispatcher = dispatcher.clone();
        let kernel = kernel.clone();
        let session = session.clone();
        let result_tx = result_tx.clone();
        let work_rx = work_rx.clone();
        workers.push(tokio::spawn(async move {
            loop {
                let frame = {
                    let mut rx = work_rx.lock().await;
                    rx.recv().await
                };
                let Some(frame) = frame else { break };
                let terminal = dispatcher
                    .execute(kernel.clone(), session.clone(), frame, result_tx.clone())
                    .await;
                if result_tx.send(terminal).is_err() {
                    break;
                }
            }
        }));
    }

    let outcome = loop {
        let (phase, returned) = io_phase(
            &kernel,
            &dispatcher,
            &session,
            stream,
            &mut result_rx,
            &work_tx,
        )
        .await;
        match returned {
            Some(returned) => stream = returned,
            None => break phase.map(|_| ()),
        }

        match phase {
            Ok(IoPhase::Closed) => break Ok(()),
            Ok(IoPhase::Upgrade) => {
                let acceptor = crate::kernel::tls::build_acceptor(&kernel.options)?;
                let SessionStream::Plain(tcp) = stream else {
                    break Err(ServerError::Failure("TLS already active".to_string()));
                };
                let tls = tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(tcp))
                    .await
                    .map_err(|_| {
                        ServerError::ConnectFail("TLS handshake timeout".to_string())
                    })?
                    .map_err(|e| ServerError::ConnectFail(format!("TLS handshake: {e}")))?;
                session.tls_active.store(true, Ordering::SeqCst);
                debug!(peer = %session.peer, "TLS established");
                stream = SessionStream::Tls(Box::new(tls));
            }
            Err(err) => break Err(err),
        }
    };

    drop(work_tx);
    for worker in workers {
        worker.abort();
    }
    outcome
}

/// One I/O phase over a fixed transport. Returns the stream so `startTLS`
/// can upgrade it.
async fn io_phase(
    kernel: &Arc<ServerKernel>,
    dispatcher: &Arc<Dispatcher>,
    session: &Arc<SessionState>,
    stream: SessionStream,
    result_rx: &mut mpsc::UnboundedReceiver<ResultFrame>,
    work_tx: &mpsc::Sender<CommandFrame>,
) -> (ServerResult<IoPhase>, Option<SessionStream>) {
    let (read_half, write_half) = tokio::io::split(stream);
    let mut lines = BufReader::new(read_half).lines();

    let (write_tx, mut write_rx) = mpsc::channel::<WriteCommand>(QUEUE_DEPTH);
    let writer: tokio::task::JoinHandle<WriteHalf<SessionStream>> =
        tokio::spawn(async move {
            let mut write_half = write_half;
            while let Some(command) = write_rx.recv().await {
                match command {
                    WriteCommand::Frame(frame) => {
                        if write_line(&mut write_half, &frame.format()).await.is_err() {
                            break;
                        }
                    }
                    WriteCommand::Stop => break,
                }
            }
            write_half
        });

    let disconnect = session.handle.disconnect.clone();
    let phase: ServerResult<IoPhase> = loop {
        tokio::select! {
            _ = disconnect.cancelled() => break Ok(IoPhase::Closed),
            _ = kernel.quit.cancelled() => break Ok(IoPhase::Closed),
            frame = result_rx.recv() => {
                let Some(frame) = frame else { break Ok(IoPhase::Closed) };
                if write_tx.send(WriteCommand::Frame(frame)).await.is_err() {
                    break Ok(IoPhase::Closed);
                }
                if session.quit_requested.load(Ordering::SeqCst) {
                    break Ok(IoPhase::Closed);
                }
            }
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break Ok(IoPhase::Closed),
                    Err(err) => break Err(err.into()),
                };
                if line.trim().is_empty() {
                    continue;
                }
                let frame = match CommandFrame::parse(&line) {
                    Ok(frame) => frame,
                    Err(err) => {
                        let reply =
                            ResultFrame::error(0, WireCode::ExpectedParameter, err);
                        let _ = write_tx.send(WriteCommand::Frame(reply)).await;
                        continue;
                    }
                };

                if frame.name == "startTLS" {
                    match start_tls_precheck(kernel, session) {
                        Ok(()) => {
                            let _ = write_tx
                                .send(WriteCommand::Frame(ResultFrame::ok(
                                    frame.id,
                                    ValueMap::new(),
                                )))
                                .await;
                            break Ok(IoPhase::Upgrade);
                        }
                        Err(err) => {
                            let reply =
                                ResultFrame::error(frame.id, err.wire_code(), &err);
                            let _ = write_tx.send(WriteCommand::Frame(reply)).await;
                            continue;
                        }
                    }
                }

                if let Some(reply) = dispatcher.try_inline(kernel, session, &frame).await {
                    let quit = session.quit_requested.load(Ordering::SeqCst);
                    let _ = write_tx.send(WriteCommand::Frame(reply)).await;
                    if quit {
                        break Ok(IoPhase::Closed);
                    }
                    continue;
                }

                if work_tx.send(frame).await.is_err() {
                    break Ok(IoPhase::Closed);
                }
            }
        }
    };

    // Stop the writer and reunite the halves for a possible TLS upgrade.
    let _ = write_tx.send(WriteCommand::Stop).await;
    drop(write_tx);
    let write_half = match writer.await {
        Ok(write_half) => write_half,
        Err(join_error) => {
            return (
                Err(ServerError::Failure(format!("writer task: {join_error}"))),
                None,
            );
        }
    };
    let read_half: ReadHalf<SessionStream> = lines.into_inner().into_inner();
    (phase, Some(read_half.unsplit(write_half)))
}

fn start_tls_precheck(kernel: &ServerKernel, session: &SessionState) -> ServerResult<()> {
    if session.tls_active.load(Ordering::SeqCst) {
        return Err(ServerError::FunctionNotSupported);
    }
    // Validate the certificate configuration before accepting.
    crate::kernel::tls::build_acceptor(&kernel.options).map(|_| ())
}

// ============================================================================
// Batch session (stdio)
// ============================================================================

/// Run a batch session over stdio: commands execute synchronously on this
/// task, as CLI peers expect.
pub async fn run_batch_session(
    kernel: Arc<ServerKernel>,
    dispatcher: Arc<Dispatcher>,
) -> ServerResult<()> {
    let client = kernel.clients.register("batch", Utc::now());
    // Batch peers are local and trusted like an authorized client.
    client.set_authorization(Authorization::Client);
    let session = SessionState::new(client.clone(), "batch", true)?;

    let stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(stdin).lines();

    let (result_tx, mut result_rx) = mpsc::unbounded_channel::<ResultFrame>();
    while let Some(line) = lines.next_line().await.map_err(ServerError::from)? {
        if line.trim().is_empty() {
            continue;
        }
        let frame = match CommandFrame::parse(&line) {
            Ok(frame) => frame,
            Err(err) => {
                let reply = ResultFrame::error(0, WireCode::ExpectedParameter, err);
                stdout
                    .write_all(format!("{}\n", reply.format()).as_bytes())
                    .await?;
                continue;
            }
        };

        let terminal = dispatcher
            .execute(kernel.clone(), session.clone(), frame, result_tx.clone())
            .await;
        // Flush streamed rows first, then the terminal frame.
        while let Ok(row) = result_rx.try_recv() {
            stdout
                .write_all(format!("{}\n", row.format()).as_bytes())
                .await?;
        }
        stdout
            .write_all(format!("{}\n", terminal.format()).as_bytes())
            .await?;
        stdout.flush().await?;

        if session.quit_requested.load(Ordering::SeqCst) {
            break;
        }
    }

    kernel.clients.unregister(client.id);
    Ok(())
}
