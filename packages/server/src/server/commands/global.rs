//! Global server commands: status, pause control, maintenance windows,
//! server options.

use std::sync::Arc;

use chrono::Utc;
use tracing::info;
use wireline::ValueMap;

use crate::common::error::{ServerError, ServerResult};
use crate::domains::job::schedule::{ScheduleDate, WeekDaySet};
use crate::kernel::options::MaintenanceWindow;
use crate::kernel::PauseMode;
use crate::server::dispatcher::CommandContext;

/// `status` — overall server state.
pub async fn status(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let state = if ctx.kernel.pause.is_suspended() {
        "suspended"
    } else if PauseMode::ALL
        .iter()
        .any(|mode| ctx.kernel.pause.is_paused(*mode))
    {
        "pause"
    } else {
        "running"
    };

    let mut data = ValueMap::new()
        .with("state", state)
        .with("mode", ctx.kernel.config.mode)
        .with("connectedClients", ctx.kernel.clients.len());
    if let Some(end) = ctx.kernel.pause.pause_end() {
        data.set("pauseEndTime", end.timestamp());
    }
    Ok(data)
}

/// `pause time=<s> modeMask=CREATE,STORAGE,…` — pause selected activities.
pub async fn pause(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let seconds: i64 = ctx.args.get_or("time", 3600)?;
    let modes = match ctx.args.get_raw("modeMask") {
        None | Some("ALL") => PauseMode::ALL.to_vec(),
        Some(mask) => {
            let mut modes = Vec::new();
            for token in mask.split(',') {
                let mode = PauseMode::parse(token).ok_or_else(|| {
                    ServerError::InvalidValue {
                        name: "modeMask".to_string(),
                        value: token.to_string(),
                    }
                })?;
                modes.push(mode);
            }
            modes
        }
    };

    let end = Utc::now() + chrono::Duration::seconds(seconds);
    ctx.kernel.pause.pause(&modes, end);
    info!(until = %end, "paused");
    Ok(ValueMap::new())
}

/// `suspend` — pause everything until `continue`.
pub async fn suspend(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    ctx.kernel.pause.suspend();
    info!("suspended");
    Ok(ValueMap::new())
}

/// `continue` — clear pauses and suspension.
pub async fn continue_(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    ctx.kernel.pause.continue_all();
    info!("continued");
    Ok(ValueMap::new())
}

/// `maintenanceList` — stream the configured windows.
pub async fn maintenance_list(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    for window in ctx.kernel.options.maintenance_list() {
        ctx.sink.row(
            ValueMap::new()
                .with("id", window.id)
                .with("date", window.date.format())
                .with("weekDays", window.week_days.format())
                .with(
                    "beginTime",
                    format!("{:02}:{:02}", window.begin_hour, window.begin_minute),
                )
                .with(
                    "endTime",
                    format!("{:02}:{:02}", window.end_hour, window.end_minute),
                ),
        );
    }
    Ok(ValueMap::new())
}

/// `maintenanceAdd date=… weekDays=… beginTime=… endTime=…`.
pub async fn maintenance_add(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let date = ScheduleDate::parse(ctx.args.get_str_or("date", "*-*-*"))?;
    let week_days = WeekDaySet::parse(ctx.args.get_str_or("weekDays", "*"))?;
    let (begin_hour, begin_minute) =
        MaintenanceWindow::parse_time(ctx.args.get_str_or("beginTime", "00:00"))?;
    let (end_hour, end_minute) =
        MaintenanceWindow::parse_time(ctx.args.get_str_or("endTime", "23:59"))?;

    let id = ctx.kernel.options.maintenance_add(MaintenanceWindow {
        id: 0,
        date,
        week_days,
        begin_hour,
        begin_minute,
        end_hour,
        end_minute,
    });
    ctx.kernel.options.flush()?;
    Ok(ValueMap::new().with("id", id))
}

/// `maintenanceRemove id=N`.
pub async fn maintenance_remove(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let id: u32 = ctx.args.get("id")?;
    ctx.kernel.options.maintenance_remove(id)?;
    ctx.kernel.options.flush()?;
    Ok(ValueMap::new())
}

/// `serverOptionGet name=…`.
pub async fn server_option_get(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let name = ctx.args.get_str("name")?;
    let value = ctx.kernel.options.option_get(name)?;
    Ok(ValueMap::new().with("value", value))
}

/// `serverOptionSet name=… value=…`.
pub async fn server_option_set(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let name = ctx.args.get_str("name")?;
    let value = ctx.args.get_str("value")?;
    ctx.kernel.options.option_set(name, value)?;
    Ok(ValueMap::new())
}

/// `serverOptionFlush` — persist the global config file.
pub async fn server_option_flush(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    ctx.kernel.options.flush()?;
    Ok(ValueMap::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::ServerMode;
    use crate::kernel::clients::Authorization;
    use crate::kernel::test_dependencies::TestDependencies;
    use crate::server::dispatcher::Dispatcher;
    use crate::server::session::SessionState;
    use tokio::sync::mpsc;
    use wireline::CommandFrame;

    async fn client_session(deps: &TestDependencies) -> Arc<SessionState> {
        let handle = deps.kernel.clients.register("c", Utc::now());
        handle.set_authorization(Authorization::Client);
        SessionState::new(handle, "c", false).unwrap()
    }

    #[tokio::test]
    async fn test_option_set_get_round_trip() {
        let deps = TestDependencies::new(ServerMode::Master);
        let dispatcher = Dispatcher::new();
        let session = client_session(&deps).await;
        let (tx, _rx) = mpsc::unbounded_channel();

        let reply = dispatcher
            .execute(
                deps.kernel.clone(),
                session.clone(),
                CommandFrame::with_args(
                    1,
                    "serverOptionSet",
                    ValueMap::new()
                        .with("name", "max-connections")
                        .with("value", "12"),
                ),
                tx.clone(),
            )
            .await;
        assert!(reply.code.is_ok());

        let reply = dispatcher
            .execute(
                deps.kernel.clone(),
                session,
                CommandFrame::with_args(
                    2,
                    "serverOptionGet",
                    ValueMap::new().with("name", "max-connections"),
                ),
                tx,
            )
            .await;
        assert_eq!(reply.data.get_str("value").unwrap(), "12");
    }

    #[tokio::test]
    async fn test_pause_and_continue() {
        let deps = TestDependencies::new(ServerMode::Master);
        let dispatcher = Dispatcher::new();
        let session = client_session(&deps).await;
        let (tx, _rx) = mpsc::unbounded_channel();

        let reply = dispatcher
            .execute(
                deps.kernel.clone(),
                session.clone(),
                CommandFrame::with_args(
                    1,
                    "pause",
                    ValueMap::new().with("time", 60).with("modeMask", "CREATE,STORAGE"),
                ),
                tx.clone(),
            )
            .await;
        assert!(reply.code.is_ok());
        assert!(deps.kernel.pause.is_paused(PauseMode::Create));
        assert!(!deps.kernel.pause.is_paused(PauseMode::Restore));

        let reply = dispatcher
            .execute(
                deps.kernel.clone(),
                session,
                CommandFrame::new(2, "continue"),
                tx,
            )
            .await;
        assert!(reply.code.is_ok());
        assert!(!deps.kernel.pause.is_paused(PauseMode::Create));
    }

    #[tokio::test]
    async fn test_maintenance_add_remove() {
        let deps = TestDependencies::new(ServerMode::Master);
        let dispatcher = Dispatcher::new();
        let session = client_session(&deps).await;
        let (tx, _rx) = mpsc::unbounded_channel();

        let reply = dispatcher
            .execute(
                deps.kernel.clone(),
                session.clone(),
                CommandFrame::with_args(
                    1,
                    "maintenanceAdd",
                    ValueMap::new()
                        .with("weekDays", "Sat,Sun")
                        .with("beginTime", "22:00")
                        .with("endTime", "06:00"),
                ),
                tx.clone(),
            )
            .await;
        assert!(reply.code.is_ok());
        let id: u32 = reply.data.get("id").unwrap();

        let reply = dispatcher
            .execute(
                deps.kernel.clone(),
                session,
                CommandFrame::with_args(
                    2,
                    "maintenanceRemove",
                    ValueMap::new().with("id", id),
                ),
                tx,
            )
            .await;
        assert!(reply.code.is_ok());
        assert!(deps.kernel.options.maintenance_list().is_empty());
    }
}
