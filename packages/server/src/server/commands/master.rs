//! Master pairing commands (slave mode).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use wireline::ValueMap;

use crate::common::error::{ServerError, ServerResult};
use crate::common::types::ServerMode;
use crate::kernel::PairingMode;
use crate::server::dispatcher::CommandContext;

fn require_slave(ctx: &CommandContext) -> ServerResult<()> {
    if ctx.kernel.config.mode != ServerMode::Slave {
        return Err(ServerError::NotASlave);
    }
    Ok(())
}

/// `masterGet` — the paired master, if any.
pub async fn master_get(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    require_slave(&ctx)?;
    let name = ctx
        .kernel
        .options
        .master()
        .map(|m| m.name)
        .unwrap_or_default();
    Ok(ValueMap::new().with("name", name))
}

/// `masterClear` — drop the paired master and disconnect its sessions.
pub async fn master_clear(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    require_slave(&ctx)?;
    ctx.kernel.pairing.clear_paired()?;
    Ok(ValueMap::new())
}

/// `masterPairingStart timeout=<s>` — begin manual pairing.
pub async fn pairing_start(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    require_slave(&ctx)?;
    let timeout: u64 = ctx.args.get_or("timeout", 600)?;
    ctx.kernel
        .pairing
        .begin(Duration::from_secs(timeout), PairingMode::Manual, Utc::now());
    Ok(ValueMap::new())
}

/// `masterPairingStop pair=yes|no` — complete or abort manual pairing.
pub async fn pairing_stop(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    require_slave(&ctx)?;
    if ctx.args.get_bool_or("pair", false)? {
        let (name, uuid_hash) = ctx
            .kernel
            .pairing
            .candidate()
            .ok_or(ServerError::NotPaired)?;
        ctx.kernel.pairing.end(&name, &uuid_hash)?;
        Ok(ValueMap::new().with("name", name))
    } else {
        ctx.kernel.pairing.abort();
        Ok(ValueMap::new())
    }
}

/// `masterPairingStatus` — current pairing state.
pub async fn pairing_status(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    require_slave(&ctx)?;
    let mode = match ctx.kernel.pairing.mode() {
        PairingMode::None => "NONE",
        PairingMode::Auto => "AUTO",
        PairingMode::Manual => "MANUAL",
    };
    let (name, _) = ctx.kernel.pairing.candidate().unwrap_or_default();
    Ok(ValueMap::new().with("pairingMode", mode).with("name", name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::auth::MasterRecord;
    use crate::kernel::clients::Authorization;
    use crate::kernel::test_dependencies::TestDependencies;
    use crate::server::dispatcher::Dispatcher;
    use crate::server::session::SessionState;
    use tokio::sync::mpsc;
    use wireline::{CommandFrame, WireCode};

    async fn run(
        deps: &TestDependencies,
        name: &str,
        args: ValueMap,
    ) -> wireline::ResultFrame {
        let handle = deps.kernel.clients.register("c", Utc::now());
        handle.set_authorization(Authorization::Client);
        let session = SessionState::new(handle, "c", false).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        Dispatcher::new()
            .execute(
                deps.kernel.clone(),
                session,
                CommandFrame::with_args(1, name, args),
                tx,
            )
            .await
    }

    #[tokio::test]
    async fn test_pairing_commands_require_slave_mode() {
        let deps = TestDependencies::new(ServerMode::Master);
        let reply = run(&deps, "masterPairingStart", ValueMap::new()).await;
        assert_eq!(reply.code, WireCode::NotASlave);
    }

    #[tokio::test]
    async fn test_manual_pairing_flow() {
        let deps = TestDependencies::new(ServerMode::Slave);

        let reply = run(
            &deps,
            "masterPairingStart",
            ValueMap::new().with("timeout", 300),
        )
        .await;
        assert!(reply.code.is_ok());
        assert_eq!(deps.kernel.pairing.mode(), PairingMode::Manual);

        // A master identity was observed during authorize.
        deps.kernel.pairing.observe("M1", "hash-1");

        let reply = run(&deps, "masterPairingStop", ValueMap::new().with("pair", "yes")).await;
        assert!(reply.code.is_ok());
        assert_eq!(
            deps.kernel.options.master(),
            Some(MasterRecord {
                name: "M1".to_string(),
                uuid_hash: "hash-1".to_string()
            })
        );
        assert_eq!(deps.kernel.pairing.mode(), PairingMode::None);
    }

    #[tokio::test]
    async fn test_pairing_stop_without_candidate() {
        let deps = TestDependencies::new(ServerMode::Slave);
        let reply = run(&deps, "masterPairingStop", ValueMap::new().with("pair", "yes")).await;
        assert_eq!(reply.code, WireCode::NotPaired);
    }

    #[tokio::test]
    async fn test_master_get_and_clear() {
        let deps = TestDependencies::new(ServerMode::Slave);
        deps.kernel
            .options
            .set_master(MasterRecord {
                name: "M9".to_string(),
                uuid_hash: "h9".to_string(),
            })
            .unwrap();

        let reply = run(&deps, "masterGet", ValueMap::new()).await;
        assert_eq!(reply.data.get_str("name").unwrap(), "M9");

        let reply = run(&deps, "masterClear", ValueMap::new()).await;
        assert!(reply.code.is_ok());
        assert!(deps.kernel.options.master().is_none());
    }
}
