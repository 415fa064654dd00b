//! Command dispatcher.
//!
//! Routes every incoming command through its authorization mask, forwards
//! commands on remote jobs to the bound slave connector, and otherwise runs
//! the registered handler. Every accepted command id produces exactly one
//! terminal result frame.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;
use wireline::{CommandFrame, ResultFrame, ValueMap};

use super::commands;
use super::session::{ResultSink, SessionState};
use crate::common::error::{ServerError, ServerResult};
use crate::kernel::clients::Authorization;
use crate::kernel::traits::IndexHandle;
use crate::kernel::ServerKernel;

/// Authorization mask bits.
pub mod auth {
    pub const WAITING: u8 = 1;
    pub const CLIENT: u8 = 2;
    pub const MASTER: u8 = 4;
    /// Any authorized session.
    pub const AUTHORIZED: u8 = CLIENT | MASTER;
    /// Any session state.
    pub const ANY: u8 = WAITING | CLIENT | MASTER;
}

/// Commands executed on the session loop instead of the worker pool: they
/// mutate connection-level state or must never queue behind busy workers.
const INLINE_COMMANDS: [&str; 4] = ["authorize", "quit", "abort", "actionResult"];

/// Everything a handler needs.
pub struct CommandContext {
    pub kernel: Arc<ServerKernel>,
    pub session: Arc<SessionState>,
    pub id: u32,
    pub args: ValueMap,
    pub sink: ResultSink,
}

impl CommandContext {
    /// Open an index handle registered for `abort commandId=N`.
    pub async fn open_index(&self) -> ServerResult<IndexHandle> {
        if !self.kernel.index.is_initialized() {
            return Err(ServerError::DatabaseIndexNotFound);
        }
        let handle = self.kernel.index.open_handle().await?;
        self.session.register_handle(self.id, handle.clone());
        Ok(handle)
    }

    pub async fn close_index(&self, handle: IndexHandle) {
        self.session.unregister_handle(self.id);
        self.kernel.index.close_handle(handle).await;
    }

    /// Cooperative abort check for long-running handlers.
    pub fn check_aborted(&self) -> ServerResult<()> {
        if self.session.is_aborted(self.id) {
            Err(ServerError::Aborted)
        } else {
            Ok(())
        }
    }
}

pub type HandlerFuture =
    std::pin::Pin<Box<dyn std::future::Future<Output = ServerResult<ValueMap>> + Send>>;
pub type Handler = fn(Arc<CommandContext>) -> HandlerFuture;

/// One dispatch table entry.
pub struct CommandDef {
    pub auth_mask: u8,
    pub handler: Handler,
    /// Forward to the slave connector when the target job is remote.
    pub forward_remote: bool,
}

/// The command dispatcher.
pub struct Dispatcher {
    table: HashMap<&'static str, CommandDef>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            table: commands::table(),
        }
    }

    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn is_known(&self, name: &str) -> bool {
        self.table.contains_key(name)
    }

    fn auth_bit(authorization: Authorization) -> u8 {
        match authorization {
            Authorization::Waiting => auth::WAITING,
            Authorization::Client => auth::CLIENT,
            Authorization::Master => auth::MASTER,
            Authorization::Fail => 0,
        }
    }

    /// Execute one command to its terminal frame.
    pub async fn execute(
        &self,
        kernel: Arc<ServerKernel>,
        session: Arc<SessionState>,
        frame: CommandFrame,
        result_tx: mpsc::UnboundedSender<ResultFrame>,
    ) -> ResultFrame {
        let id = frame.id;
        let Some(def) = self.table.get(frame.name.as_str()) else {
            return ResultFrame::error(
                id,
                wireline::WireCode::UnknownCommand,
                format!("unknown command '{}'", frame.name),
            );
        };

        if Self::auth_bit(session.authorization()) & def.auth_mask == 0 {
            return ResultFrame::error(
                id,
                wireline::WireCode::NotAuthorized,
                "not authorized for this command",
            );
        }

        // A command on a remote job goes to its slave, result frames are
        // proxied back unchanged.
        if def.forward_remote {
            if let Some(reply) = self
                .try_forward(&kernel, &frame, result_tx.clone())
                .await
            {
                return reply;
            }
        }

        let ctx = Arc::new(CommandContext {
            kernel,
            session: session.clone(),
            id,
            args: frame.args,
            sink: ResultSink::new(id, result_tx),
        });

        let result = (def.handler)(ctx).await;
        session.unregister_handle(id);

        match result {
            Ok(data) => ResultFrame::ok(id, data),
            Err(err) => {
                debug!(command = %frame.name, error = %err, "command failed");
                ResultFrame::error(id, err.wire_code(), err)
            }
        }
    }

    /// Forward to the slave connector when the command addresses a remote
    /// job with an authorized connector. `None` means "execute locally".
    async fn try_forward(
        &self,
        kernel: &Arc<ServerKernel>,
        frame: &CommandFrame,
        result_tx: mpsc::UnboundedSender<ResultFrame>,
    ) -> Option<ResultFrame> {
        let job_uuid: Uuid = frame.args.get_opt("jobUUID").ok()??;
        let binding = kernel
            .jobs
            .with_job(job_uuid, |job| job.slave.clone())
            .await
            .ok()??;
        let connector = kernel.slaves.connector_for(&binding)?;
        if !connector.is_paired() {
            return Some(ResultFrame::error(
                frame.id,
                wireline::WireCode::SlaveDisconnected,
                format!("slave {} not connected", binding.host),
            ));
        }

        let id = frame.id;
        let result = connector
            .execute(&frame.name, frame.args.clone(), |row| {
                let mut proxied = row.clone();
                proxied.id = id;
                let _ = result_tx.send(proxied);
            })
            .await;

        Some(match result {
            Ok(data) => ResultFrame::ok(id, data),
            Err(err) => ResultFrame::error(id, err.wire_code(), err),
        })
    }

    /// Execute connection-level commands on the session loop. Returns
    /// `None` for commands that belong on the worker pool.
    pub async fn try_inline(
        &self,
        kernel: &Arc<ServerKernel>,
        session: &Arc<SessionState>,
        frame: &CommandFrame,
    ) -> Option<ResultFrame> {
        if !INLINE_COMMANDS.contains(&frame.name.as_str()) {
            return None;
        }
        // Inline commands stream no rows; a throwaway channel absorbs any.
        let (result_tx, _result_rx) = mpsc::unbounded_channel();
        let reply = self
            .execute(kernel.clone(), session.clone(), frame.clone(), result_tx)
            .await;

        // A failed authorize ends the session right after the reply.
        if frame.name == "authorize" && session.authorization() == Authorization::Fail {
            session.handle.disconnect.cancel();
        }
        Some(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::ServerMode;
    use crate::kernel::test_dependencies::TestDependencies;
    use chrono::Utc;

    async fn session_with(
        deps: &TestDependencies,
        authorization: Authorization,
    ) -> Arc<SessionState> {
        let handle = deps.kernel.clients.register("test", Utc::now());
        handle.set_authorization(authorization);
        SessionState::new(handle, "test", false).unwrap()
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let deps = TestDependencies::new(ServerMode::Master);
        let dispatcher = Dispatcher::new();
        let session = session_with(&deps, Authorization::Client).await;
        let (tx, _rx) = mpsc::unbounded_channel();

        let reply = dispatcher
            .execute(
                deps.kernel.clone(),
                session,
                CommandFrame::new(1, "flubber"),
                tx,
            )
            .await;
        assert_eq!(reply.code, wireline::WireCode::UnknownCommand);
        assert!(reply.complete);
    }

    #[tokio::test]
    async fn test_waiting_session_rejected_for_job_commands() {
        let deps = TestDependencies::new(ServerMode::Master);
        let dispatcher = Dispatcher::new();
        let session = session_with(&deps, Authorization::Waiting).await;
        let (tx, _rx) = mpsc::unbounded_channel();

        let reply = dispatcher
            .execute(
                deps.kernel.clone(),
                session,
                CommandFrame::new(2, "jobList"),
                tx,
            )
            .await;
        assert_eq!(reply.code, wireline::WireCode::NotAuthorized);
    }

    #[tokio::test]
    async fn test_version_allowed_while_waiting() {
        let deps = TestDependencies::new(ServerMode::Master);
        let dispatcher = Dispatcher::new();
        let session = session_with(&deps, Authorization::Waiting).await;
        let (tx, _rx) = mpsc::unbounded_channel();

        let reply = dispatcher
            .execute(
                deps.kernel.clone(),
                session,
                CommandFrame::new(3, "version"),
                tx,
            )
            .await;
        assert!(reply.code.is_ok());
        assert_eq!(
            reply.data.get::<u32>("major").unwrap(),
            crate::common::types::PROTOCOL_VERSION_MAJOR
        );
    }

    #[tokio::test]
    async fn test_every_command_produces_exactly_one_terminal_frame() {
        let deps = TestDependencies::new(ServerMode::Master);
        let dispatcher = Dispatcher::new();
        let session = session_with(&deps, Authorization::Client).await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let reply = dispatcher
            .execute(
                deps.kernel.clone(),
                session,
                CommandFrame::new(4, "jobList"),
                tx,
            )
            .await;
        assert!(reply.complete, "terminal frame must carry complete=1");
        // Any streamed rows are non-terminal.
        while let Ok(row) = rx.try_recv() {
            assert!(!row.complete);
        }
    }
}
