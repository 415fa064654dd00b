//! Archive index commands: queries over entities, storages, entries and
//! history, plus the per-session storage/entry selections used by restore.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use uuid::Uuid;
use wireline::ValueMap;

use crate::common::error::{ServerError, ServerResult};
use crate::common::types::ArchiveType;
use crate::domains::index::model::{IndexMode, IndexState};
use crate::kernel::traits::{IndexHandle, NewEntity, NewStorage, StorageFilter};
use crate::server::dispatcher::CommandContext;

/// Parse a comma-separated id list; malformed ids are a distinct error.
fn parse_ids(text: &str) -> ServerResult<Vec<i64>> {
    text.split(',')
        .map(|token| {
            token
                .trim()
                .parse()
                .map_err(|_| ServerError::DatabaseParseId(token.to_string()))
        })
        .collect()
}

fn storage_row(storage: &crate::domains::index::model::StorageRecord) -> ValueMap {
    let mut row = ValueMap::new()
        .with("storageId", storage.id)
        .with("name", &storage.name)
        .with("size", storage.size)
        .with("dateTime", storage.created_at.timestamp())
        .with("indexState", storage.index_state)
        .with("indexMode", storage.index_mode)
        .with("totalEntryCount", storage.total_entry_count)
        .with("totalEntrySize", storage.total_entry_size);
    if let Some(entity_id) = storage.entity_id {
        row.set("entityId", entity_id);
    }
    if let Some(checked) = storage.last_checked {
        row.set("lastCheckedDateTime", checked.timestamp());
    }
    if !storage.error_message.is_empty() {
        row.set("errorMessage", &storage.error_message);
    }
    row
}

// ============================================================================
// Queries
// ============================================================================

/// `archiveList name=<storageName>` — entries of one archive.
pub async fn archive_list(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let handle = ctx.open_index().await?;
    let result = archive_list_inner(&ctx, &handle).await;
    ctx.close_index(handle).await;
    result
}

async fn archive_list_inner(
    ctx: &CommandContext,
    handle: &IndexHandle,
) -> ServerResult<ValueMap> {
    let name = ctx.args.get_str("name")?;
    let storage = ctx
        .kernel
        .index
        .storage_by_name(handle, name)
        .await?
        .ok_or_else(|| ServerError::DatabaseEntryNotFound(name.to_string()))?;

    for entry in ctx
        .kernel
        .index
        .entries(handle, Some(storage.id), None)
        .await?
    {
        ctx.check_aborted()?;
        let mut row = ValueMap::new()
            .with("entryId", entry.id)
            .with("name", &entry.name)
            .with("entryType", &entry.entry_kind)
            .with("size", entry.size);
        if let Some(modified) = entry.modified_at {
            row.set("dateTime", modified.timestamp());
        }
        ctx.sink.row(row);
    }
    Ok(ValueMap::new())
}

/// `indexInfo` — aggregate index statistics.
pub async fn index_info(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let handle = ctx.open_index().await?;
    let result = index_info_inner(&ctx, &handle).await;
    ctx.close_index(handle).await;
    result
}

async fn index_info_inner(ctx: &CommandContext, handle: &IndexHandle) -> ServerResult<ValueMap> {
    let entities = ctx.kernel.index.entities(handle).await?;
    let storages = ctx
        .kernel
        .index
        .storages(handle, StorageFilter::default())
        .await?;

    Ok(ValueMap::new()
        .with("totalEntityCount", entities.len())
        .with(
            "totalEntryCount",
            entities.iter().map(|e| e.total_entry_count).sum::<u64>(),
        )
        .with(
            "totalEntrySize",
            entities.iter().map(|e| e.total_entry_size).sum::<u64>(),
        )
        .with("totalStorageCount", storages.len())
        .with(
            "totalStorageSize",
            storages.iter().map(|s| s.size).sum::<u64>(),
        ))
}

/// `indexUUIDList` — job UUIDs present in the index.
pub async fn index_uuid_list(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let handle = ctx.open_index().await?;
    let result = index_uuid_list_inner(&ctx, &handle).await;
    ctx.close_index(handle).await;
    result
}

async fn index_uuid_list_inner(
    ctx: &CommandContext,
    handle: &IndexHandle,
) -> ServerResult<ValueMap> {
    for job_uuid in ctx.kernel.index.job_uuids(handle).await? {
        ctx.check_aborted()?;
        let aggregate = ctx.kernel.index.aggregate_for_job(handle, job_uuid).await?;
        let mut row = ValueMap::new()
            .with("jobUUID", job_uuid)
            .with("totalEntityCount", aggregate.total_entity_count())
            .with("totalEntrySize", aggregate.total_entry_size());
        if let Some(last) = aggregate.last_executed {
            row.set("lastExecutedDateTime", last.timestamp());
        }
        ctx.sink.row(row);
    }
    Ok(ValueMap::new())
}

/// `indexEntityList [jobUUID=…]`.
pub async fn index_entity_list(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let handle = ctx.open_index().await?;
    let result = index_entity_list_inner(&ctx, &handle).await;
    ctx.close_index(handle).await;
    result
}

async fn index_entity_list_inner(
    ctx: &CommandContext,
    handle: &IndexHandle,
) -> ServerResult<ValueMap> {
    let job_uuid: Option<Uuid> = ctx.args.get_opt("jobUUID")?;
    for entity in ctx.kernel.index.entities(handle).await? {
        ctx.check_aborted()?;
        if job_uuid.is_some_and(|uuid| entity.job_uuid != uuid) {
            continue;
        }
        let mut row = ValueMap::new()
            .with("entityId", entity.id)
            .with("entityUUID", entity.uuid)
            .with("jobUUID", entity.job_uuid)
            .with("archiveType", entity.archive_type)
            .with("createdDateTime", entity.created_at.timestamp())
            .with("totalEntryCount", entity.total_entry_count)
            .with("totalEntrySize", entity.total_entry_size)
            .with("locked", if entity.locked { "yes" } else { "no" });
        if let Some(schedule_uuid) = entity.schedule_uuid {
            row.set("scheduleUUID", schedule_uuid);
        }
        ctx.sink.row(row);
    }
    Ok(ValueMap::new())
}

/// `indexEntityAdd jobUUID=… [archiveType=…] [createdDateTime=…]`.
pub async fn index_entity_add(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let handle = ctx.open_index().await?;
    let result = index_entity_add_inner(&ctx, &handle).await;
    ctx.close_index(handle).await;
    result
}

async fn index_entity_add_inner(
    ctx: &CommandContext,
    handle: &IndexHandle,
) -> ServerResult<ValueMap> {
    let job_uuid: Uuid = ctx.args.get_uuid("jobUUID")?;
    let archive_type: ArchiveType = ctx.args.get_or("archiveType", ArchiveType::Normal)?;
    let created_at = match ctx.args.get_opt::<i64>("createdDateTime")? {
        Some(seconds) => Utc
            .timestamp_opt(seconds, 0)
            .single()
            .ok_or_else(|| ServerError::InvalidValue {
                name: "createdDateTime".to_string(),
                value: seconds.to_string(),
            })?,
        None => Utc::now(),
    };

    let entity_id = ctx
        .kernel
        .index
        .add_entity(
            handle,
            NewEntity {
                uuid: Uuid::new_v4(),
                job_uuid,
                schedule_uuid: ctx.args.get_opt("scheduleUUID")?,
                created_at,
                archive_type,
            },
        )
        .await?;
    Ok(ValueMap::new().with("entityId", entity_id))
}

/// `indexStorageList [name=…] [indexState=…]`.
pub async fn index_storage_list(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let handle = ctx.open_index().await?;
    let result = index_storage_list_inner(&ctx, &handle).await;
    ctx.close_index(handle).await;
    result
}

async fn index_storage_list_inner(
    ctx: &CommandContext,
    handle: &IndexHandle,
) -> ServerResult<ValueMap> {
    let filter = StorageFilter {
        entity_id: ctx.args.get_opt("entityId")?,
        index_state: ctx.args.get_opt("indexState")?,
        index_mode: ctx.args.get_opt("indexMode")?,
        name_contains: ctx.args.get_raw("name").map(str::to_string),
    };
    for storage in ctx.kernel.index.storages(handle, filter).await? {
        ctx.check_aborted()?;
        ctx.sink.row(storage_row(&storage));
    }
    Ok(ValueMap::new())
}

/// `indexStorageInfo storageId=…`.
pub async fn index_storage_info(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let handle = ctx.open_index().await?;
    let result = index_storage_info_inner(&ctx, &handle).await;
    ctx.close_index(handle).await;
    result
}

async fn index_storage_info_inner(
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
    Ok(storage_row(&storage))
}

/// `indexStorageAdd name=… [patternType]` — register an archive for
/// indexing.
pub async fn index_storage_add(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let handle = ctx.open_index().await?;
    let result = index_storage_add_inner(&ctx, &handle).await;
    ctx.close_index(handle).await;
    result
}

async fn index_storage_add_inner(
    ctx: &CommandContext,
    handle: &IndexHandle,
) -> ServerResult<ValueMap> {
    let name = ctx.args.get_str("name")?.to_string();
    let storage_id = ctx
        .kernel
        .index
        .add_storage(
            handle,
            NewStorage {
                entity_id: None,
                name,
                created_at: Utc::now(),
                size: 0,
                index_state: IndexState::UpdateRequested,
                index_mode: IndexMode::Manual,
            },
        )
        .await?;
    ctx.kernel.triggers.update_index.signal();
    Ok(ValueMap::new().with("storageId", storage_id))
}

/// `indexStorageRemove storageId=…` — drop the index row, not the artifact.
pub async fn index_storage_remove(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let handle = ctx.open_index().await?;
    let result = async {
        let storage_id: i64 = ctx.args.get("storageId")?;
        ctx.kernel.index.delete_storage(&handle, storage_id).await?;
        Ok(ValueMap::new())
    }
    .await;
    ctx.close_index(handle).await;
    result
}

// ============================================================================
// Storage / entry selections (restore scope)
// ============================================================================

/// `indexStorageListAdd storageIds=1,2,…` — extend the session selection.
pub async fn index_storage_list_add(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let ids = parse_ids(ctx.args.get_str("storageIds")?)?;
    let mut selections = ctx.session.selections.lock().unwrap();
    for id in ids {
        if !selections.selected_index_ids.contains(&id) {
            selections.selected_index_ids.push(id);
        }
    }
    Ok(ValueMap::new())
}

/// `indexStorageListRemove storageIds=…`.
pub async fn index_storage_list_remove(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let ids = parse_ids(ctx.args.get_str("storageIds")?)?;
    let mut selections = ctx.session.selections.lock().unwrap();
    selections.selected_index_ids.retain(|id| !ids.contains(id));
    Ok(ValueMap::new())
}

/// `indexStorageListClear`.
pub async fn index_storage_list_clear(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    ctx.session
        .selections
        .lock()
        .unwrap()
        .selected_index_ids
        .clear();
    Ok(ValueMap::new())
}

/// `indexStorageListInfo` — totals over the selection.
pub async fn index_storage_list_info(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let handle = ctx.open_index().await?;
    let result = async {
        let ids = ctx
            .session
            .selections
            .lock()
            .unwrap()
            .selected_index_ids
            .clone();
        let mut count = 0u64;
        let mut size = 0u64;
        for id in ids {
            if let Some(storage) = ctx.kernel.index.storage_by_id(&handle, id).await? {
                count += 1;
                size += storage.size;
            }
        }
        Ok(ValueMap::new().with("count", count).with("size", size))
    }
    .await;
    ctx.close_index(handle).await;
    result
}

/// `indexEntryList [name=…] [storageId=…]`.
pub async fn index_entry_list(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let handle = ctx.open_index().await?;
    let result = index_entry_list_inner(&ctx, &handle).await;
    ctx.close_index(handle).await;
    result
}

async fn index_entry_list_inner(
    ctx: &CommandContext,
    handle: &IndexHandle,
) -> ServerResult<ValueMap> {
    let storage_id: Option<i64> = ctx.args.get_opt("storageId")?;
    let name_filter = ctx.args.get_raw("name");
    for entry in ctx
        .kernel
        .index
        .entries(handle, storage_id, name_filter)
        .await?
    {
        ctx.check_aborted()?;
        let mut row = ValueMap::new()
            .with("entryId", entry.id)
            .with("storageId", entry.storage_id)
            .with("name", &entry.name)
            .with("entryType", &entry.entry_kind)
            .with("size", entry.size);
        if let Some(modified) = entry.modified_at {
            row.set("dateTime", modified.timestamp());
        }
        ctx.sink.row(row);
    }
    Ok(ValueMap::new())
}

/// `indexEntryListAdd entryIds=…`.
pub async fn index_entry_list_add(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let ids = parse_ids(ctx.args.get_str("entryIds")?)?;
    let mut selections = ctx.session.selections.lock().unwrap();
    for id in ids {
        if !selections.selected_entry_ids.contains(&id) {
            selections.selected_entry_ids.push(id);
        }
    }
    Ok(ValueMap::new())
}

/// `indexEntryListRemove entryIds=…`.
pub async fn index_entry_list_remove(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let ids = parse_ids(ctx.args.get_str("entryIds")?)?;
    let mut selections = ctx.session.selections.lock().unwrap();
    selections.selected_entry_ids.retain(|id| !ids.contains(id));
    Ok(ValueMap::new())
}

/// `indexEntryListClear`.
pub async fn index_entry_list_clear(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    ctx.session
        .selections
        .lock()
        .unwrap()
        .selected_entry_ids
        .clear();
    Ok(ValueMap::new())
}

/// `indexEntryListInfo` — totals over the entry selection.
pub async fn index_entry_list_info(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let handle = ctx.open_index().await?;
    let result = async {
        let ids = ctx
            .session
            .selections
            .lock()
            .unwrap()
            .selected_entry_ids
            .clone();
        let mut count = 0u64;
        let mut size = 0u64;
        for id in ids {
            if let Some(entry) = ctx.kernel.index.entry_by_id(&handle, id).await? {
                count += 1;
                size += entry.size;
            }
        }
        Ok(ValueMap::new().with("count", count).with("size", size))
    }
    .await;
    ctx.close_index(handle).await;
    result
}

/// `indexEntryFragmentList entryId=…`.
pub async fn index_entry_fragment_list(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let handle = ctx.open_index().await?;
    let result = async {
        let entry_id: i64 = ctx.args.get("entryId")?;
        for fragment in ctx.kernel.index.entry_fragments(&handle, entry_id).await? {
            ctx.sink.row(
                ValueMap::new()
                    .with("offset", fragment.offset)
                    .with("size", fragment.size),
            );
        }
        Ok(ValueMap::new())
    }
    .await;
    ctx.close_index(handle).await;
    result
}

/// `indexHistoryList [jobUUID=…]`.
pub async fn index_history_list(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let handle = ctx.open_index().await?;
    let result = async {
        let job_uuid: Option<Uuid> = ctx.args.get_opt("jobUUID")?;
        for row in ctx.kernel.index.history(&handle, job_uuid).await? {
            ctx.check_aborted()?;
            let mut data = ValueMap::new()
                .with("historyId", row.id)
                .with("jobUUID", row.job_uuid)
                .with("createdDateTime", row.created_at.timestamp())
                .with("errorCode", row.error_code)
                .with("duration", row.duration_seconds)
                .with("totalEntryCount", row.total_entry_count)
                .with("totalEntrySize", row.total_entry_size);
            if !row.error_data.is_empty() {
                data.set("errorMessage", &row.error_data);
            }
            if let Some(schedule_uuid) = row.schedule_uuid {
                data.set("scheduleUUID", schedule_uuid);
            }
            ctx.sink.row(data);
        }
        Ok(ValueMap::new())
    }
    .await;
    ctx.close_index(handle).await;
    result
}

// ============================================================================
// Mutations
// ============================================================================

/// `indexAssign entityId=… toEntityId=… [toJobUUID=…]` — move the content
/// of one entity to another entity or job.
pub async fn index_assign(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let handle = ctx.open_index().await?;
    let result = async {
        let from: i64 = ctx.args.get("entityId")?;
        let to: i64 = ctx.args.get("toEntityId")?;
        let to_job: Option<Uuid> = ctx.args.get_opt("toJobUUID")?;
        ctx.kernel.index.assign_entity(&handle, from, to, to_job).await?;
        Ok(ValueMap::new())
    }
    .await;
    ctx.close_index(handle).await;
    result
}

/// `indexRefresh [storageId=…|name=…|indexState=…]` — request re-indexing.
pub async fn index_refresh(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let handle = ctx.open_index().await?;
    let result = index_refresh_inner(&ctx, &handle).await;
    ctx.close_index(handle).await;
    result
}

async fn index_refresh_inner(
    ctx: &CommandContext,
    handle: &IndexHandle,
) -> ServerResult<ValueMap> {
    let mut refreshed = 0u64;

    let storages = if let Some(storage_id) = ctx.args.get_opt::<i64>("storageId")? {
        ctx.kernel
            .index
            .storage_by_id(handle, storage_id)
            .await?
            .into_iter()
            .collect()
    } else {
        let filter = StorageFilter {
            index_state: ctx.args.get_opt("indexState")?,
            name_contains: ctx.args.get_raw("name").map(str::to_string),
            ..Default::default()
        };
        ctx.kernel.index.storages(handle, filter).await?
    };

    for mut storage in storages {
        storage.index_state = IndexState::UpdateRequested;
        ctx.kernel.index.update_storage(handle, &storage).await?;
        refreshed += 1;
    }
    if refreshed > 0 {
        ctx.kernel.triggers.update_index.signal();
    }
    Ok(ValueMap::new().with("count", refreshed))
}

/// `indexRemove entityId=…` — remove an entity's index rows. The archive
/// artifacts stay; a locked entity is reported as missing.
pub async fn index_remove(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let handle = ctx.open_index().await?;
    let result = index_remove_inner(&ctx, &handle).await;
    ctx.close_index(handle).await;
    result
}

async fn index_remove_inner(ctx: &CommandContext, handle: &IndexHandle) -> ServerResult<ValueMap> {
    let entity_id: i64 = ctx.args.get("entityId")?;
    let entity = ctx
        .kernel
        .index
        .entity_by_id(handle, entity_id)
        .await?
        .ok_or_else(|| ServerError::DatabaseEntryNotFound(entity_id.to_string()))?;
    if entity.locked {
        return Err(ServerError::DatabaseEntryNotFound(entity_id.to_string()));
    }

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
    for storage in storages {
        ctx.kernel.index.delete_storage(handle, storage.id).await?;
    }
    ctx.kernel.index.delete_entity(handle, entity_id).await?;
    Ok(ValueMap::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::ServerMode;
    use crate::kernel::clients::Authorization;
    use crate::kernel::test_dependencies::TestDependencies;
    use crate::kernel::traits::Index;
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

        async fn run(&self, name: &str, args: ValueMap) -> (ResultFrame, Vec<ResultFrame>) {
            let (tx, mut rx) = mpsc::unbounded_channel();
            let terminal = self
                .dispatcher
                .execute(
                    self.deps.kernel.clone(),
                    self.session.clone(),
                    CommandFrame::with_args(1, name, args),
                    tx,
                )
                .await;
            let mut rows = Vec::new();
            while let Ok(row) = rx.try_recv() {
                rows.push(row);
            }
            (terminal, rows)
        }

        async fn seed_entity(&self, job_uuid: Uuid, locked: bool) -> i64 {
            let handle = self.deps.index.open_handle().await.unwrap();
            let entity_id = self
                .deps
                .index
                .add_entity(
                    &handle,
                    NewEntity {
                        uuid: Uuid::new_v4(),
                        job_uuid,
                        schedule_uuid: None,
                        created_at: Utc::now(),
                        archive_type: ArchiveType::Full,
                    },
                )
                .await
                .unwrap();
            if locked {
                self.deps
                    .index
                    .set_entity_locked(&handle, entity_id, true)
                    .await
                    .unwrap();
            }
            self.deps
                .index
                .add_storage(
                    &handle,
                    NewStorage {
                        entity_id: Some(entity_id),
                        name: format!("/archive/e{entity_id}.bar"),
                        created_at: Utc::now(),
                        size: 1024,
                        index_state: IndexState::Ok,
                        index_mode: IndexMode::Manual,
                    },
                )
                .await
                .unwrap();
            entity_id
        }
    }

    #[tokio::test]
    async fn test_entity_list_filters_by_job() {
        let h = Harness::new();
        let job_a = Uuid::new_v4();
        let job_b = Uuid::new_v4();
        h.seed_entity(job_a, false).await;
        h.seed_entity(job_b, false).await;

        let (terminal, rows) = h
            .run("indexEntityList", ValueMap::new().with("jobUUID", job_a))
            .await;
        assert!(terminal.code.is_ok());
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].data.get_str("jobUUID").unwrap(), job_a.to_string());
    }

    #[tokio::test]
    async fn test_index_remove_locked_entity_fails() {
        let h = Harness::new();
        let entity_id = h.seed_entity(Uuid::new_v4(), true).await;

        let (terminal, _) = h
            .run("indexRemove", ValueMap::new().with("entityId", entity_id))
            .await;
        assert_eq!(terminal.code, WireCode::DatabaseEntryNotFound);
    }

    #[tokio::test]
    async fn test_index_remove_drops_rows() {
        let h = Harness::new();
        let entity_id = h.seed_entity(Uuid::new_v4(), false).await;

        let (terminal, _) = h
            .run("indexRemove", ValueMap::new().with("entityId", entity_id))
            .await;
        assert!(terminal.code.is_ok());

        let (_, rows) = h.run("indexEntityList", ValueMap::new()).await;
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_storage_selection_round_trip() {
        let h = Harness::new();
        let entity_id = h.seed_entity(Uuid::new_v4(), false).await;
        let (_, rows) = h
            .run(
                "indexStorageList",
                ValueMap::new().with("entityId", entity_id),
            )
            .await;
        let storage_id: i64 = rows[0].data.get("storageId").unwrap();

        let (terminal, _) = h
            .run(
                "indexStorageListAdd",
                ValueMap::new().with("storageIds", storage_id),
            )
            .await;
        assert!(terminal.code.is_ok());

        let (info, _) = h.run("indexStorageListInfo", ValueMap::new()).await;
        assert_eq!(info.data.get::<u64>("count").unwrap(), 1);
        assert_eq!(info.data.get::<u64>("size").unwrap(), 1024);

        let (terminal, _) = h.run("indexStorageListClear", ValueMap::new()).await;
        assert!(terminal.code.is_ok());
        let (info, _) = h.run("indexStorageListInfo", ValueMap::new()).await;
        assert_eq!(info.data.get::<u64>("count").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_malformed_id_list() {
        let h = Harness::new();
        let (terminal, _) = h
            .run(
                "indexStorageListAdd",
                ValueMap::new().with("storageIds", "1,x,3"),
            )
            .await;
        assert_eq!(terminal.code, WireCode::DatabaseParseId);
    }

    #[tokio::test]
    async fn test_index_refresh_marks_update_requested() {
        let h = Harness::new();
        let entity_id = h.seed_entity(Uuid::new_v4(), false).await;

        let (terminal, _) = h.run("indexRefresh", ValueMap::new()).await;
        assert!(terminal.code.is_ok());
        assert!(terminal.data.get::<u64>("count").unwrap() >= 1);

        let (_, rows) = h
            .run(
                "indexStorageList",
                ValueMap::new().with("entityId", entity_id),
            )
            .await;
        assert_eq!(
            rows[0].data.get_str("indexState").unwrap(),
            "UPDATE_REQUESTED"
        );
    }
}
