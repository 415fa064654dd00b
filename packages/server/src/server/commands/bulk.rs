//! Bulk operations: entity moves, storage tests and deletes, restore, and
//! the slave-side remote create.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::info;
use uuid::Uuid;
use wireline::ValueMap;

use crate::common::error::{ServerError, ServerResult};
use crate::common::types::ArchiveType;
use crate::kernel::pause::PauseMode;
use crate::kernel::traits::{
    CreateRequest, IndexHandle, RestoreRequest, RunEvents, StorageFilter,
};
use crate::domains::job::running::{ProgressCounters, VolumeResult};
use crate::server::dispatcher::CommandContext;
use crate::server::session::{ResultSink, SessionState};

/// Callback bridge for command-driven create/restore: progress streams as
/// result rows, aborts come from `abort commandId=N` or a disconnect.
struct CommandRunEvents {
    session: Arc<SessionState>,
    sink: ResultSink,
    command_id: u32,
    pause: Arc<crate::kernel::pause::PauseFlags>,
    crypt_password: Option<String>,
}

#[async_trait]
impl RunEvents for CommandRunEvents {
    fn crypt_password(&self) -> Option<String> {
        self.crypt_password
            .clone()
            .or_else(|| self.session.passwords.lock().unwrap().crypt.clone())
    }

    fn progress(&self, progress: ProgressCounters, current_entry: &str) {
        self.sink.row(
            ValueMap::new()
                .with("doneCount", progress.done_count)
                .with("doneSize", progress.done_size)
                .with("totalCount", progress.total_count)
                .with("totalSize", progress.total_size)
                .with("storageDoneSize", progress.storage_done_size)
                .with("storageTotalSize", progress.storage_total_size)
                .with("entryName", current_entry),
        );
    }

    async fn request_volume(&self, volume_number: u32, message: &str) -> VolumeResult {
        // Command-driven runs prompt the issuing client directly.
        let answer = self
            .sink
            .prompt(
                &self.session,
                ValueMap::new()
                    .with("action", "volumeRequest")
                    .with("volumeNumber", volume_number)
                    .with("message", message),
                Duration::from_secs(60),
            )
            .await;
        match answer {
            Ok(fields) => match fields.get_opt::<u32>("volumeNumber") {
                Ok(Some(n)) => VolumeResult::Ok(n),
                _ => VolumeResult::Unload,
            },
            Err(_) => VolumeResult::Aborted,
        }
    }

    fn is_pause_create(&self) -> bool {
        self.pause.is_paused(PauseMode::Create)
    }

    fn is_pause_storage(&self) -> bool {
        self.pause.is_paused(PauseMode::Storage)
    }

    fn is_pause_restore(&self) -> bool {
        self.pause.is_paused(PauseMode::Restore)
    }

    fn is_aborted(&self) -> bool {
        self.session.is_aborted(self.command_id)
            || self.session.handle.disconnect.is_cancelled()
    }
}

fn events_for(ctx: &CommandContext) -> Arc<dyn RunEvents> {
    Arc::new(CommandRunEvents {
        session: ctx.session.clone(),
        sink: ctx.sink.clone(),
        command_id: ctx.id,
        pause: ctx.kernel.pause.clone(),
        crypt_password: None,
    })
}

/// `entityMoveTo entityId=… moveTo=<uri>` — move every storage of an
/// entity to a new location, renaming on conflicts.
pub async fn entity_move_to(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let handle = ctx.open_index().await?;
    let result = entity_move_to_inner(&ctx, &handle).await;
    ctx.close_index(handle).await;
    result
}

async fn entity_move_to_inner(
    ctx: &CommandContext,
    handle: &IndexHandle,
) -> ServerResult<ValueMap> {
    let entity_id: i64 = ctx.args.get("entityId")?;
    let move_to = ctx.args.get_str("moveTo")?.trim_end_matches('/').to_string();

    ctx.kernel
        .index
        .entity_by_id(handle, entity_id)
        .await?
        .ok_or_else(|| ServerError::DatabaseEntryNotFound(entity_id.to_string()))?;

    let storages = ctx
        .kernel
        .index
        .storages(
            handle,
            StorageFilter {
                entity_id: Some(entity_id),
                ..Default::default()
            },
        )
        .await?;

    let mut moved = 0u64;
    for storage in storages {
        ctx.check_aborted()?;
        let current_dir = storage
            .name
            .rsplit_once('/')
            .map(|(dir, _)| dir)
            .unwrap_or("");
        if current_dir == move_to {
            continue;
        }
        let file_name = storage
            .name
            .rsplit_once('/')
            .map(|(_, file)| file)
            .unwrap_or(storage.name.as_str());

        let mut destination = format!("{move_to}/{file_name}");
        let mut suffix = 0u32;
        while ctx.kernel.storage.exists(&destination).await? {
            destination = format!("{move_to}/{file_name}-{suffix}");
            suffix += 1;
        }

        ctx.kernel.storage.copy(&storage.name, &destination).await?;
        let mut updated = storage.clone();
        updated.name = destination;
        ctx.kernel.index.update_storage(handle, &updated).await?;
        ctx.kernel.storage.delete(&storage.name).await?;

        moved += 1;
        ctx.sink.row(
            ValueMap::new()
                .with("storageId", storage.id)
                .with("name", &updated.name)
                .with("doneCount", moved),
        );
    }
    Ok(ValueMap::new().with("count", moved))
}

/// `storageTest storageId=…|name=…` — verify an archive is readable.
pub async fn storage_test(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let handle = ctx.open_index().await?;
    let result = storage_test_inner(&ctx, &handle).await;
    ctx.close_index(handle).await;
    result
}

async fn storage_test_inner(ctx: &CommandContext, handle: &IndexHandle) -> ServerResult<ValueMap> {
    let name = match ctx.args.get_opt::<i64>("storageId")? {
        Some(storage_id) => {
            ctx.kernel
                .index
                .storage_by_id(handle, storage_id)
                .await?
                .ok_or_else(|| ServerError::DatabaseEntryNotFound(storage_id.to_string()))?
                .name
        }
        None => ctx.args.get_str("name")?.to_string(),
    };

    let crypt = ctx.session.passwords.lock().unwrap().crypt.clone();
    ctx.kernel.storage.read_test(&name, crypt.as_deref()).await?;
    Ok(ValueMap::new().with("name", name))
}

/// `storageDelete storageId=…` — delete the artifact and its index row.
pub async fn storage_delete(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let handle = ctx.open_index().await?;
    let result = storage_delete_inner(&ctx, &handle).await;
    ctx.close_index(handle).await;
    result
}

async fn storage_delete_inner(
    ctx: &CommandContext,
    handle: &IndexHandle,
) -> ServerResult<ValueMap> {
    let storage_id: i64 = ctx.args.get("storageId")?;
    let storage = ctx
        .kernel
        .index
        .storage_by_id(handle, storage_id)
        .await?
        .ok_or_else(|| ServerError::DatabaseEntryNotFound(storage_id.to_string()))?;

    if let Err(err) = ctx.kernel.storage.delete(&storage.name).await {
        // A missing artifact must not keep the row alive.
        tracing::debug!(storage = %storage.name, error = %err, "artifact delete failed");
    }
    ctx.kernel.index.delete_storage(handle, storage_id).await?;
    info!(target: "index", storage = %storage.name, "storage deleted");
    Ok(ValueMap::new())
}

/// `restore destination=… [directoryContent=yes]` — restore the selected
/// storages/entries, streaming progress rows.
pub async fn restore(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let handle = ctx.open_index().await?;
    let result = restore_inner(&ctx, &handle).await;
    ctx.close_index(handle).await;
    result
}

async fn restore_inner(ctx: &CommandContext, handle: &IndexHandle) -> ServerResult<ValueMap> {
    let destination = ctx.args.get_str("destination")?.to_string();
    let directory_content = ctx.args.get_bool_or("directoryContent", false)?;

    let (storage_ids, entry_ids) = {
        let selections = ctx.session.selections.lock().unwrap();
        (
            selections.selected_index_ids.clone(),
            selections.selected_entry_ids.clone(),
        )
    };

    let mut storage_names = Vec::new();
    for id in storage_ids {
        if let Some(storage) = ctx.kernel.index.storage_by_id(handle, id).await? {
            storage_names.push(storage.name);
        }
    }
    let mut entry_names = Vec::new();
    for id in entry_ids {
        if let Some(entry) = ctx.kernel.index.entry_by_id(handle, id).await? {
            entry_names.push(entry.name);
        }
    }
    if storage_names.is_empty() && entry_names.is_empty() {
        return Err(ServerError::EntryNotFound(
            "nothing selected for restore".to_string(),
        ));
    }

    ctx.kernel
        .archiver
        .restore(
            RestoreRequest {
                storage_names,
                entry_names,
                destination,
                directory_content,
            },
            events_for(ctx),
        )
        .await?;
    Ok(ValueMap::new())
}

/// `create jobUUID=… entityUUID=… storageName=… archiveType=…` — remote
/// create driven by a master over the control channel. Progress streams
/// back as result rows; the terminal frame carries the summary.
pub async fn create(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let job_uuid: Uuid = ctx.args.get_uuid("jobUUID")?;
    let entity_uuid: Uuid = ctx.args.get_uuid("entityUUID")?;
    let storage_name = ctx.args.get_str("storageName")?.to_string();
    let archive_type: ArchiveType = ctx.args.get_or("archiveType", ArchiveType::Normal)?;
    let dry_run = ctx.args.get_bool_or("dryRun", false)?;
    let no_storage = ctx.args.get_bool_or("noStorage", false)?;

    info!(target: "jobs", %job_uuid, storage = %storage_name, "remote create started");
    let started = Utc::now();

    let summary = ctx
        .kernel
        .archiver
        .create(
            CreateRequest {
                job_uuid,
                entity_uuid,
                archive_type,
                storage_name,
                includes: Vec::new(),
                excludes: Vec::new(),
                crypt: Default::default(),
                custom_text: String::new(),
                dry_run,
                no_storage,
            },
            events_for(&ctx),
        )
        .await?;

    info!(
        target: "jobs",
        %job_uuid,
        duration = %crate::kernel::runner::format_duration(
            (Utc::now() - started).num_seconds().max(0) as u64
        ),
        "remote create done"
    );
    Ok(ValueMap::new()
        .with("totalEntryCount", summary.total_entry_count)
        .with("totalEntrySize", summary.total_entry_size)
        .with("storageSize", summary.storage_size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::ServerMode;
    use crate::kernel::clients::Authorization;
    use crate::kernel::test_dependencies::TestDependencies;
    use crate::kernel::traits::{Index, NewEntity, NewStorage, Storage};
    use crate::domains::index::model::{IndexMode, IndexState};
    use crate::server::dispatcher::Dispatcher;
    use crate::server::session::SessionState;
    use tokio::sync::mpsc;
    use wireline::{CommandFrame, ResultFrame, WireCode};

    struct Harness {
        deps: TestDependencies,
        dispatcher: Dispatcher,
        session: Arc<SessionState>,
    }

    impl Harness {
        fn new() -> Self {
            let deps = TestDependencies::new(ServerMode::Master);
            let handle = deps.kernel.clients.register("c", Utc::now());
            handle.set_authorization(Authorization::Client);
            let session = SessionState::new(handle, "c", false).unwrap();
            Self {
                deps,
                dispatcher: Dispatcher::new(),
                session,
            }
        }

        async fn run_id(
            &self,
            id: u32,
            name: &str,
            args: ValueMap,
        ) -> (ResultFrame, Vec<ResultFrame>) {
            let (tx, mut rx) = mpsc::unbounded_channel();
            let terminal = self
                .dispatcher
                .execute(
                    self.deps.kernel.clone(),
                    self.session.clone(),
                    CommandFrame::with_args(id, name, args),
                    tx,
                )
                .await;
            let mut rows = Vec::new();
            while let Ok(row) = rx.try_recv() {
                rows.push(row);
            }
            (terminal, rows)
        }

        async fn seed_storage(&self, name: &str) -> i64 {
            let handle = self.deps.index.open_handle().await.unwrap();
            let entity_id = self
                .deps
                .index
                .add_entity(
                    &handle,
                    NewEntity {
                        uuid: Uuid::new_v4(),
                        job_uuid: Uuid::new_v4(),
                        schedule_uuid: None,
                        created_at: Utc::now(),
                        archive_type: ArchiveType::Full,
                    },
                )
                .await
                .unwrap();
            let storage_id = self
                .deps
                .index
                .add_storage(
                    &handle,
                    NewStorage {
                        entity_id: Some(entity_id),
                        name: name.to_string(),
                        created_at: Utc::now(),
                        size: 512,
                        index_state: IndexState::Ok,
                        index_mode: IndexMode::Manual,
                    },
                )
                .await
                .unwrap();
            self.deps.storage.put_file(name, 512, Utc::now());
            storage_id
        }
    }

    #[tokio::test]
    async fn test_storage_test_ok_and_missing() {
        let h = Harness::new();
        let storage_id = h.seed_storage("/archive/a.bar").await;

        let (terminal, _) = h
            .run_id(1, "storageTest", ValueMap::new().with("storageId", storage_id))
            .await;
        assert!(terminal.code.is_ok());

        let (terminal, _) = h
            .run_id(
                2,
                "storageTest",
                ValueMap::new().with("name", "/archive/missing.bar"),
            )
            .await;
        assert_eq!(terminal.code, WireCode::EntryNotFound);
    }

    #[tokio::test]
    async fn test_storage_delete_removes_artifact_and_row() {
        let h = Harness::new();
        let storage_id = h.seed_storage("/archive/b.bar").await;

        let (terminal, _) = h
            .run_id(
                1,
                "storageDelete",
                ValueMap::new().with("storageId", storage_id),
            )
            .await;
        assert!(terminal.code.is_ok());
        assert!(!h.deps.storage.exists("/archive/b.bar").await.unwrap());
    }

    #[tokio::test]
    async fn test_restore_requires_selection() {
        let h = Harness::new();
        let (terminal, _) = h
            .run_id(
                1,
                "restore",
                ValueMap::new().with("destination", "/restore/here"),
            )
            .await;
        assert_eq!(terminal.code, WireCode::EntryNotFound);
    }

    #[tokio::test]
    async fn test_restore_streams_progress() {
        let h = Harness::new();
        let storage_id = h.seed_storage("/archive/c.bar").await;
        h.run_id(
            1,
            "indexStorageListAdd",
            ValueMap::new().with("storageIds", storage_id),
        )
        .await;

        let (terminal, rows) = h
            .run_id(
                2,
                "restore",
                ValueMap::new().with("destination", "/restore/here"),
            )
            .await;
        assert!(terminal.code.is_ok(), "got {terminal:?}");
        assert!(!rows.is_empty(), "progress rows streamed");
        assert!(rows.iter().all(|r| !r.complete));
    }

    #[tokio::test]
    async fn test_abort_during_restore() {
        // S5: a pre-recorded abort makes the restore observe isAborted and
        // return the Aborted code, with no further progress frames after.
        let h = Harness::new();
        let storage_id = h.seed_storage("/archive/d.bar").await;
        h.run_id(
            1,
            "indexStorageListAdd",
            ValueMap::new().with("storageIds", storage_id),
        )
        .await;

        // The abort lands before the restore command is processed.
        h.session.abort_ring.lock().unwrap().push(42);

        let (terminal, rows) = h
            .run_id(
                42,
                "restore",
                ValueMap::new().with("destination", "/restore/here"),
            )
            .await;
        assert_eq!(terminal.code, WireCode::Aborted);
        assert!(rows.is_empty(), "no progress frames after the abort");
    }

    #[tokio::test]
    async fn test_entity_move_to_renames_on_conflict() {
        let h = Harness::new();
        h.seed_storage("/archive/hot/x.bar").await;
        h.deps.storage.put_file("/archive/cold/x.bar", 1, Utc::now());

        let (terminal, _) = h
            .run_id(
                1,
                "entityMoveTo",
                ValueMap::new().with("entityId", 1).with("moveTo", "/archive/cold"),
            )
            .await;
        assert!(terminal.code.is_ok(), "got {terminal:?}");
        assert!(h.deps.storage.exists("/archive/cold/x.bar-0").await.unwrap());
        assert!(!h.deps.storage.exists("/archive/hot/x.bar").await.unwrap());
    }
}
