//! Session-level commands: authorization, version, abort, prompts.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};
use wireline::{ValueMap, WireCode};

use crate::common::auth::registry::{AuthContext, Classification, Credentials};
use crate::common::error::{ServerError, ServerResult};
use crate::common::types::{PROTOCOL_VERSION_MAJOR, PROTOCOL_VERSION_MINOR};
use crate::kernel::clients::Authorization;
use crate::kernel::PairingMode;
use crate::server::dispatcher::CommandContext;

/// `startTLS` is intercepted on the session loop; reaching the handler
/// means the transport cannot be upgraded (batch stdio).
pub async fn start_tls(_ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    Err(ServerError::FunctionNotSupported)
}

/// `authorize encryptType=… encryptedPassword=…` or
/// `authorize encryptType=… name=… encryptedUUID=…`.
pub async fn authorize(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let now = Utc::now();
    let client_name = ctx
        .args
        .get_raw("name")
        .map(str::to_string)
        .unwrap_or_else(|| ctx.session.handle.name());

    // Back-off gate: failed attempts cost a quadratic penalty.
    let penalty = ctx.kernel.auth.wait_penalty(&client_name, now);
    if !penalty.is_zero() {
        tokio::time::sleep(penalty).await;
    }

    let credentials = Credentials {
        encrypt_type: ctx.args.get_opt("encryptType")?,
        encrypted_password: ctx.args.get_raw("encryptedPassword").map(str::to_string),
        name: ctx.args.get_raw("name").map(str::to_string),
        encrypted_uuid: ctx.args.get_raw("encryptedUUID").map(str::to_string),
    };

    let stored_password_hash = ctx.kernel.options.with(|o| o.password_hash.clone());
    let paired_master = ctx.kernel.options.master();
    let pairing_active = ctx.kernel.pairing.is_active(Utc::now());
    let auth_context = AuthContext {
        session_key: &ctx.session.session_key,
        stored_password_hash: stored_password_hash.as_deref(),
        machine_id: &ctx.kernel.config.machine_id,
        paired_master: paired_master.as_ref(),
        mode: ctx.kernel.config.mode,
        pairing_active,
    };

    match ctx.kernel.auth.classify(&credentials, &auth_context) {
        Ok(Classification::Client) => {
            ctx.session.handle.set_name(&client_name);
            ctx.session
                .handle
                .set_authorization(Authorization::Client);
            ctx.kernel.auth.on_success(&client_name);
            info!(client = %client_name, "client authorized");
            Ok(ValueMap::new())
        }
        Ok(Classification::Master { name, uuid_hash }) => {
            if pairing_active {
                match ctx.kernel.pairing.mode() {
                    // Auto pairing completes on the first UUID authorize.
                    PairingMode::Auto => ctx.kernel.pairing.end(&name, &uuid_hash)?,
                    // Manual pairing records the candidate and waits for
                    // an explicit masterPairingStop pair=yes.
                    PairingMode::Manual => ctx.kernel.pairing.observe(&name, &uuid_hash),
                    PairingMode::None => {}
                }
            }
            ctx.session.handle.set_name(&name);
            ctx.session
                .handle
                .set_authorization(Authorization::Master);
            ctx.kernel.auth.on_success(&name);
            info!(master = %name, "master authorized");
            Ok(ValueMap::new())
        }
        Err(err) => {
            ctx.session.handle.set_authorization(Authorization::Fail);
            ctx.kernel.auth.on_failure(&client_name, now);
            warn!(client = %client_name, error = %err, "authorization failed");
            Err(err)
        }
    }
}

/// `version` — protocol version and server mode.
pub async fn version(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    Ok(ValueMap::new()
        .with("major", PROTOCOL_VERSION_MAJOR)
        .with("minor", PROTOCOL_VERSION_MINOR)
        .with("mode", ctx.kernel.config.mode))
}

/// `errorInfo errorCode=N` — human text for a wire code.
pub async fn error_info(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let code: u32 = ctx.args.get("errorCode")?;
    let wire = WireCode::from_code(code);
    let text = if wire.is_ok() {
        "none".to_string()
    } else {
        ServerError::from_wire(wire, "").to_string()
    };
    Ok(ValueMap::new().with("errorCode", code).with("text", text))
}

/// `quit` — close this session.
pub async fn quit(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    ctx.session.quit_requested.store(true, Ordering::SeqCst);
    Ok(ValueMap::new())
}

/// `actionResult id=N …` — answer a server-initiated prompt.
pub async fn action_result(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let id: u32 = ctx.args.get("id")?;
    if ctx.session.resolve_action(id, ctx.args.clone()) {
        Ok(ValueMap::new())
    } else {
        Err(ServerError::EntryNotFound(format!("no pending action {id}")))
    }
}

/// `abort commandId=N` — interrupt one running command.
pub async fn abort(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let command_id: u32 = ctx.args.get("commandId")?;
    ctx.session.abort_ring.lock().unwrap().push(command_id);

    // An index-bound command is interrupted through its handle.
    let handle = ctx
        .session
        .command_handles
        .lock()
        .unwrap()
        .get(&command_id)
        .cloned();
    if let Some(handle) = handle {
        ctx.kernel.index.interrupt(&handle);
    }
    Ok(ValueMap::new())
}
