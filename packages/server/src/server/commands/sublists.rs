//! Job sub-list commands: includes, excludes, mounts, delta sources,
//! schedules and persistence rules.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;
use wireline::ValueMap;

use super::jobs::job_uuid_arg;
use crate::common::error::{ServerError, ServerResult};
use crate::common::types::ArchiveType;
use crate::domains::job::model::{
    DeltaSource, EntryType, ExcludePattern, IncludeEntry, Mount, PatternType, StartRequest,
};
use crate::domains::job::persistence::{AgeLimit, KeepLimit, PersistenceRule};
use crate::domains::job::schedule::{
    next_due_at, Schedule, ScheduleDate, ScheduleTime, WeekDaySet,
};
use crate::server::dispatcher::CommandContext;

// ============================================================================
// Includes
// ============================================================================

/// `includeList jobUUID=…`.
pub async fn include_list(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let uuid = job_uuid_arg(&ctx)?;
    let rows = ctx
        .kernel
        .jobs
        .with_job(uuid, |job| {
            job.includes
                .iter()
                .map(|entry| {
                    ValueMap::new()
                        .with("id", entry.id)
                        .with("entryType", entry.entry_type)
                        .with("patternType", entry.pattern_type)
                        .with("pattern", &entry.pattern)
                })
                .collect::<Vec<_>>()
        })
        .await?;
    for row in rows {
        ctx.sink.row(row);
    }
    Ok(ValueMap::new())
}

/// `includeListAdd jobUUID=… entryType=… patternType=… pattern=…`.
pub async fn include_list_add(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let uuid = job_uuid_arg(&ctx)?;
    let entry_type: EntryType = ctx.args.get_or("entryType", EntryType::File)?;
    let pattern_type: PatternType = ctx.args.get_or("patternType", PatternType::Glob)?;
    let pattern = ctx.args.get_str("pattern")?.to_string();

    let id = ctx
        .kernel
        .jobs
        .with_job_mut(uuid, move |job| {
            let id = job.next_entry_id();
            job.includes.push(IncludeEntry {
                id,
                entry_type,
                pattern_type,
                pattern,
            });
            job.modified = true;
            id
        })
        .await?;
    Ok(ValueMap::new().with("id", id))
}

/// `includeListUpdate jobUUID=… id=… …`.
pub async fn include_list_update(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let uuid = job_uuid_arg(&ctx)?;
    let id: u32 = ctx.args.get("id")?;
    let entry_type: Option<EntryType> = ctx.args.get_opt("entryType")?;
    let pattern_type: Option<PatternType> = ctx.args.get_opt("patternType")?;
    let pattern = ctx.args.get_raw("pattern").map(str::to_string);

    ctx.kernel
        .jobs
        .with_job_mut(uuid, move |job| -> ServerResult<()> {
            let entry = job
                .includes
                .iter_mut()
                .find(|e| e.id == id)
                .ok_or(ServerError::PatternIdNotFound(id))?;
            if let Some(entry_type) = entry_type {
                entry.entry_type = entry_type;
            }
            if let Some(pattern_type) = pattern_type {
                entry.pattern_type = pattern_type;
            }
            if let Some(pattern) = pattern {
                entry.pattern = pattern;
            }
            job.modified = true;
            Ok(())
        })
        .await??;
    Ok(ValueMap::new())
}

/// `includeListRemove jobUUID=… id=…`.
pub async fn include_list_remove(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let uuid = job_uuid_arg(&ctx)?;
    let id: u32 = ctx.args.get("id")?;
    ctx.kernel
        .jobs
        .with_job_mut(uuid, move |job| {
            let before = job.includes.len();
            job.includes.retain(|e| e.id != id);
            if job.includes.len() == before {
                return Err(ServerError::PatternIdNotFound(id));
            }
            job.modified = true;
            Ok(())
        })
        .await??;
    Ok(ValueMap::new())
}

/// `includeListClear jobUUID=…`.
pub async fn include_list_clear(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let uuid = job_uuid_arg(&ctx)?;
    ctx.kernel
        .jobs
        .with_job_mut(uuid, |job| {
            job.includes.clear();
            job.modified = true;
        })
        .await?;
    Ok(ValueMap::new())
}

// ============================================================================
// Excludes (shared by exclude and excludeCompress)
// ============================================================================

enum ExcludeKind {
    Exclude,
    Compress,
}

fn exclude_vec<'a>(job: &'a mut crate::domains::job::Job, kind: &ExcludeKind) -> &'a mut Vec<ExcludePattern> {
    match kind {
        ExcludeKind::Exclude => &mut job.excludes,
        ExcludeKind::Compress => &mut job.compress_excludes,
    }
}

async fn exclude_list_impl(ctx: Arc<CommandContext>, kind: ExcludeKind) -> ServerResult<ValueMap> {
    let uuid = job_uuid_arg(&ctx)?;
    let rows = ctx
        .kernel
        .jobs
        .with_job(uuid, |job| {
            let list = match kind {
                ExcludeKind::Exclude => &job.excludes,
                ExcludeKind::Compress => &job.compress_excludes,
            };
            list.iter()
                .map(|entry| {
                    ValueMap::new()
                        .with("id", entry.id)
                        .with("patternType", entry.pattern_type)
                        .with("pattern", &entry.pattern)
                })
                .collect::<Vec<_>>()
        })
        .await?;
    for row in rows {
        ctx.sink.row(row);
    }
    Ok(ValueMap::new())
}

async fn exclude_add_impl(ctx: Arc<CommandContext>, kind: ExcludeKind) -> ServerResult<ValueMap> {
    let uuid = job_uuid_arg(&ctx)?;
    let pattern_type: PatternType = ctx.args.get_or("patternType", PatternType::Glob)?;
    let pattern = ctx.args.get_str("pattern")?.to_string();

    let id = ctx
        .kernel
        .jobs
        .with_job_mut(uuid, move |job| {
            let id = job.next_entry_id();
            exclude_vec(job, &kind).push(ExcludePattern {
                id,
                pattern_type,
                pattern,
            });
            job.modified = true;
            id
        })
        .await?;
    Ok(ValueMap::new().with("id", id))
}

async fn exclude_update_impl(
    ctx: Arc<CommandContext>,
    kind: ExcludeKind,
) -> ServerResult<ValueMap> {
    let uuid = job_uuid_arg(&ctx)?;
    let id: u32 = ctx.args.get("id")?;
    let pattern_type: Option<PatternType> = ctx.args.get_opt("patternType")?;
    let pattern = ctx.args.get_raw("pattern").map(str::to_string);

    ctx.kernel
        .jobs
        .with_job_mut(uuid, move |job| -> ServerResult<()> {
            let entry = exclude_vec(job, &kind)
                .iter_mut()
                .find(|e| e.id == id)
                .ok_or(ServerError::PatternIdNotFound(id))?;
            if let Some(pattern_type) = pattern_type {
                entry.pattern_type = pattern_type;
            }
            if let Some(pattern) = pattern {
                entry.pattern = pattern;
            }
            job.modified = true;
            Ok(())
        })
        .await??;
    Ok(ValueMap::new())
}

async fn exclude_remove_impl(
    ctx: Arc<CommandContext>,
    kind: ExcludeKind,
) -> ServerResult<ValueMap> {
    let uuid = job_uuid_arg(&ctx)?;
    let id: u32 = ctx.args.get("id")?;
    ctx.kernel
        .jobs
        .with_job_mut(uuid, move |job| {
            let list = exclude_vec(job, &kind);
            let before = list.len();
            list.retain(|e| e.id != id);
            if list.len() == before {
                return Err(ServerError::PatternIdNotFound(id));
            }
            job.modified = true;
            Ok(())
        })
        .await??;
    Ok(ValueMap::new())
}

async fn exclude_clear_impl(
    ctx: Arc<CommandContext>,
    kind: ExcludeKind,
) -> ServerResult<ValueMap> {
    let uuid = job_uuid_arg(&ctx)?;
    ctx.kernel
        .jobs
        .with_job_mut(uuid, move |job| {
            exclude_vec(job, &kind).clear();
            job.modified = true;
        })
        .await?;
    Ok(ValueMap::new())
}

pub async fn exclude_list(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    exclude_list_impl(ctx, ExcludeKind::Exclude).await
}
pub async fn exclude_list_add(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    exclude_add_impl(ctx, ExcludeKind::Exclude).await
}
pub async fn exclude_list_update(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    exclude_update_impl(ctx, ExcludeKind::Exclude).await
}
pub async fn exclude_list_remove(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    exclude_remove_impl(ctx, ExcludeKind::Exclude).await
}
pub async fn exclude_list_clear(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    exclude_clear_impl(ctx, ExcludeKind::Exclude).await
}
pub async fn exclude_compress_list(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    exclude_list_impl(ctx, ExcludeKind::Compress).await
}
pub async fn exclude_compress_list_add(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    exclude_add_impl(ctx, ExcludeKind::Compress).await
}
pub async fn exclude_compress_list_update(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    exclude_update_impl(ctx, ExcludeKind::Compress).await
}
pub async fn exclude_compress_list_remove(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    exclude_remove_impl(ctx, ExcludeKind::Compress).await
}
pub async fn exclude_compress_list_clear(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    exclude_clear_impl(ctx, ExcludeKind::Compress).await
}

// ============================================================================
// Mounts
// ============================================================================

pub async fn mount_list(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let uuid = job_uuid_arg(&ctx)?;
    let rows = ctx
        .kernel
        .jobs
        .with_job(uuid, |job| {
            job.mounts
                .iter()
                .map(|mount| {
                    ValueMap::new()
                        .with("id", mount.id)
                        .with("name", &mount.name)
                        .with("device", &mount.device)
                })
                .collect::<Vec<_>>()
        })
        .await?;
    for row in rows {
        ctx.sink.row(row);
    }
    Ok(ValueMap::new())
}

pub async fn mount_list_add(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let uuid = job_uuid_arg(&ctx)?;
    let name = ctx.args.get_str("name")?.to_string();
    let device = ctx.args.get_str_or("device", "").to_string();

    let id = ctx
        .kernel
        .jobs
        .with_job_mut(uuid, move |job| {
            let id = job.next_entry_id();
            job.mounts.push(Mount { id, name, device });
            job.modified = true;
            id
        })
        .await?;
    Ok(ValueMap::new().with("id", id))
}

pub async fn mount_list_update(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let uuid = job_uuid_arg(&ctx)?;
    let id: u32 = ctx.args.get("id")?;
    let name = ctx.args.get_raw("name").map(str::to_string);
    let device = ctx.args.get_raw("device").map(str::to_string);

    ctx.kernel
        .jobs
        .with_job_mut(uuid, move |job| -> ServerResult<()> {
            let mount = job
                .mounts
                .iter_mut()
                .find(|m| m.id == id)
                .ok_or(ServerError::MountIdNotFound(id))?;
            if let Some(name) = name {
                mount.name = name;
            }
            if let Some(device) = device {
                mount.device = device;
            }
            job.modified = true;
            Ok(())
        })
        .await??;
    Ok(ValueMap::new())
}

pub async fn mount_list_remove(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let uuid = job_uuid_arg(&ctx)?;
    let id: u32 = ctx.args.get("id")?;
    ctx.kernel
        .jobs
        .with_job_mut(uuid, move |job| {
            let before = job.mounts.len();
            job.mounts.retain(|m| m.id != id);
            if job.mounts.len() == before {
                return Err(ServerError::MountIdNotFound(id));
            }
            job.modified = true;
            Ok(())
        })
        .await??;
    Ok(ValueMap::new())
}

pub async fn mount_list_clear(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let uuid = job_uuid_arg(&ctx)?;
    ctx.kernel
        .jobs
        .with_job_mut(uuid, |job| {
            job.mounts.clear();
            job.modified = true;
        })
        .await?;
    Ok(ValueMap::new())
}

// ============================================================================
// Delta sources
// ============================================================================

pub async fn source_list(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let uuid = job_uuid_arg(&ctx)?;
    let rows = ctx
        .kernel
        .jobs
        .with_job(uuid, |job| {
            job.delta_sources
                .iter()
                .map(|source| {
                    ValueMap::new()
                        .with("id", source.id)
                        .with("storageName", &source.storage_name)
                })
                .collect::<Vec<_>>()
        })
        .await?;
    for row in rows {
        ctx.sink.row(row);
    }
    Ok(ValueMap::new())
}

pub async fn source_list_add(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let uuid = job_uuid_arg(&ctx)?;
    let storage_name = ctx.args.get_str("storageName")?.to_string();

    let id = ctx
        .kernel
        .jobs
        .with_job_mut(uuid, move |job| {
            let id = job.next_entry_id();
            job.delta_sources.push(DeltaSource { id, storage_name });
            job.modified = true;
            id
        })
        .await?;
    Ok(ValueMap::new().with("id", id))
}

pub async fn source_list_update(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let uuid = job_uuid_arg(&ctx)?;
    let id: u32 = ctx.args.get("id")?;
    let storage_name = ctx.args.get_str("storageName")?.to_string();

    ctx.kernel
        .jobs
        .with_job_mut(uuid, move |job| -> ServerResult<()> {
            let source = job
                .delta_sources
                .iter_mut()
                .find(|s| s.id == id)
                .ok_or(ServerError::DeltaSourceIdNotFound(id))?;
            source.storage_name = storage_name;
            job.modified = true;
            Ok(())
        })
        .await??;
    Ok(ValueMap::new())
}

pub async fn source_list_remove(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let uuid = job_uuid_arg(&ctx)?;
    let id: u32 = ctx.args.get("id")?;
    ctx.kernel
        .jobs
        .with_job_mut(uuid, move |job| {
            let before = job.delta_sources.len();
            job.delta_sources.retain(|s| s.id != id);
            if job.delta_sources.len() == before {
                return Err(ServerError::DeltaSourceIdNotFound(id));
            }
            job.modified = true;
            Ok(())
        })
        .await??;
    Ok(ValueMap::new())
}

pub async fn source_list_clear(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let uuid = job_uuid_arg(&ctx)?;
    ctx.kernel
        .jobs
        .with_job_mut(uuid, |job| {
            job.delta_sources.clear();
            job.modified = true;
        })
        .await?;
    Ok(ValueMap::new())
}

// ============================================================================
// Schedules
// ============================================================================

/// `scheduleList jobUUID=…`.
pub async fn schedule_list(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let uuid = job_uuid_arg(&ctx)?;
    let now = Utc::now();
    let rows = ctx
        .kernel
        .jobs
        .with_job(uuid, |job| {
            job.schedules
                .iter()
                .map(|schedule| {
                    let mut row = ValueMap::new()
                        .with("scheduleUUID", schedule.uuid)
                        .with("date", schedule.date.format())
                        .with("weekDays", schedule.week_days.format())
                        .with("time", schedule.time.format())
                        .with("archiveType", schedule.archive_type)
                        .with("interval", schedule.interval_minutes)
                        .with("customText", &schedule.custom_text)
                        .with("noStorage", if schedule.no_storage { "yes" } else { "no" })
                        .with("enabled", if schedule.enabled { "yes" } else { "no" });
                    if let Some(last) = schedule.last_executed {
                        row.set("lastExecutedDateTime", last.timestamp());
                    }
                    if let Some(next) = next_due_at(schedule, now) {
                        row.set("nextExecutedDateTime", next.timestamp());
                    }
                    if let Some(aggregate) = job.schedule_aggregates.get(&schedule.uuid) {
                        row.set("totalEntityCount", aggregate.total_entity_count);
                        row.set("totalEntryCount", aggregate.total_entry_count);
                        row.set("totalEntrySize", aggregate.total_entry_size);
                    }
                    row
                })
                .collect::<Vec<_>>()
        })
        .await?;
    for row in rows {
        ctx.sink.row(row);
    }
    Ok(ValueMap::new())
}

fn schedule_from_args(args: &ValueMap) -> ServerResult<Schedule> {
    let archive_type: ArchiveType = args.get_or("archiveType", ArchiveType::Normal)?;
    let mut schedule = Schedule::new(archive_type);
    apply_schedule_args(&mut schedule, args)?;
    Ok(schedule)
}

fn apply_schedule_args(schedule: &mut Schedule, args: &ValueMap) -> ServerResult<()> {
    if let Some(date) = args.get_raw("date") {
        schedule.date = ScheduleDate::parse(date)?;
    }
    if let Some(week_days) = args.get_raw("weekDays") {
        schedule.week_days = WeekDaySet::parse(week_days)?;
    }
    if let Some(time) = args.get_raw("time") {
        schedule.time = ScheduleTime::parse(time)?;
    }
    if let Some(archive_type) = args.get_opt::<ArchiveType>("archiveType")? {
        schedule.archive_type = archive_type;
    }
    schedule.interval_minutes = args.get_or("interval", schedule.interval_minutes)?;
    if let Some(text) = args.get_raw("customText") {
        schedule.custom_text = text.to_string();
    }
    schedule.no_storage = args.get_bool_or("noStorage", schedule.no_storage)?;
    schedule.enabled = args.get_bool_or("enabled", schedule.enabled)?;
    schedule.test_created = args.get_bool_or("testCreated", schedule.test_created)?;
    Ok(())
}

/// `scheduleListAdd jobUUID=… date=… weekDays=… time=… archiveType=…`.
pub async fn schedule_list_add(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let uuid = job_uuid_arg(&ctx)?;
    let schedule = schedule_from_args(&ctx.args)?;
    let schedule_uuid = schedule.uuid;

    ctx.kernel
        .jobs
        .with_job_mut(uuid, move |job| {
            job.schedules.push(schedule);
            job.modified = true;
        })
        .await?;
    ctx.kernel.triggers.scheduler.signal();
    Ok(ValueMap::new().with("scheduleUUID", schedule_uuid))
}

/// `scheduleListUpdate jobUUID=… scheduleUUID=… …`.
pub async fn schedule_list_update(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let uuid = job_uuid_arg(&ctx)?;
    let schedule_uuid: Uuid = ctx.args.get_uuid("scheduleUUID")?;
    let args = ctx.args.clone();

    ctx.kernel
        .jobs
        .with_job_mut(uuid, move |job| -> ServerResult<()> {
            let schedule = job
                .schedule_mut(schedule_uuid)
                .ok_or_else(|| ServerError::ScheduleNotFound(schedule_uuid.to_string()))?;
            apply_schedule_args(schedule, &args)?;
            job.modified = true;
            Ok(())
        })
        .await??;
    ctx.kernel.triggers.scheduler.signal();
    Ok(ValueMap::new())
}

/// `scheduleListRemove jobUUID=… scheduleUUID=…`.
pub async fn schedule_list_remove(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let uuid = job_uuid_arg(&ctx)?;
    let schedule_uuid: Uuid = ctx.args.get_uuid("scheduleUUID")?;
    ctx.kernel
        .jobs
        .with_job_mut(uuid, move |job| {
            let before = job.schedules.len();
            job.schedules.retain(|s| s.uuid != schedule_uuid);
            if job.schedules.len() == before {
                return Err(ServerError::ScheduleNotFound(schedule_uuid.to_string()));
            }
            job.modified = true;
            Ok(())
        })
        .await??;
    Ok(ValueMap::new())
}

/// `scheduleListClear jobUUID=…`.
pub async fn schedule_list_clear(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let uuid = job_uuid_arg(&ctx)?;
    ctx.kernel
        .jobs
        .with_job_mut(uuid, |job| {
            job.schedules.clear();
            job.modified = true;
        })
        .await?;
    Ok(ValueMap::new())
}

/// `scheduleOptionGet jobUUID=… scheduleUUID=… name=…`.
pub async fn schedule_option_get(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let uuid = job_uuid_arg(&ctx)?;
    let schedule_uuid: Uuid = ctx.args.get_uuid("scheduleUUID")?;
    let name = ctx.args.get_str("name")?.to_string();

    let value = ctx
        .kernel
        .jobs
        .with_job(uuid, move |job| {
            let schedule = job
                .schedule(schedule_uuid)
                .ok_or_else(|| ServerError::ScheduleNotFound(schedule_uuid.to_string()))?;
            let value = match name.as_str() {
                "date" => schedule.date.format(),
                "weekdays" => schedule.week_days.format(),
                "time" => schedule.time.format(),
                "archive-type" => schedule.archive_type.to_string(),
                "interval" => schedule.interval_minutes.to_string(),
                "text" => schedule.custom_text.clone(),
                "no-storage" => if schedule.no_storage { "yes" } else { "no" }.to_string(),
                "enabled" => if schedule.enabled { "yes" } else { "no" }.to_string(),
                _ => return Err(ServerError::UnknownValue(name.clone())),
            };
            Ok(value)
        })
        .await??;
    Ok(ValueMap::new().with("value", value))
}

/// `scheduleOptionSet jobUUID=… scheduleUUID=… name=… value=…`.
pub async fn schedule_option_set(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let uuid = job_uuid_arg(&ctx)?;
    let schedule_uuid: Uuid = ctx.args.get_uuid("scheduleUUID")?;
    let name = ctx.args.get_str("name")?.to_string();
    let value = ctx.args.get_str("value")?.to_string();

    ctx.kernel
        .jobs
        .with_job_mut(uuid, move |job| {
            let schedule = job
                .schedule_mut(schedule_uuid)
                .ok_or_else(|| ServerError::ScheduleNotFound(schedule_uuid.to_string()))?;
            match name.as_str() {
                "date" => schedule.date = ScheduleDate::parse(&value)?,
                "weekdays" => schedule.week_days = WeekDaySet::parse(&value)?,
                "time" => schedule.time = ScheduleTime::parse(&value)?,
                "archive-type" => {
                    schedule.archive_type =
                        value.parse().map_err(|_| ServerError::InvalidValue {
                            name: name.clone(),
                            value: value.clone(),
                        })?
                }
                "interval" => {
                    schedule.interval_minutes =
                        value.parse().map_err(|_| ServerError::InvalidValue {
                            name: name.clone(),
                            value: value.clone(),
                        })?
                }
                "text" => schedule.custom_text = value,
                "no-storage" => schedule.no_storage = value == "yes",
                "enabled" => schedule.enabled = value == "yes",
                _ => return Err(ServerError::UnknownValue(name.clone())),
            }
            job.modified = true;
            Ok(())
        })
        .await??;
    ctx.kernel.triggers.scheduler.signal();
    Ok(ValueMap::new())
}

/// `scheduleTrigger jobUUID=… scheduleUUID=…` — run a schedule now.
pub async fn schedule_trigger(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let uuid = job_uuid_arg(&ctx)?;
    let schedule_uuid: Uuid = ctx.args.get_uuid("scheduleUUID")?;
    let actor = ctx.session.handle.name();
    let now = crate::domains::job::schedule::floor_to_minute(Utc::now());

    let triggered = ctx
        .kernel
        .jobs
        .with_job_mut(uuid, move |job| -> ServerResult<bool> {
            let schedule = job
                .schedule(schedule_uuid)
                .ok_or_else(|| ServerError::ScheduleNotFound(schedule_uuid.to_string()))?
                .clone();
            Ok(job.trigger(StartRequest {
                archive_type: schedule.archive_type,
                schedule_uuid: Some(schedule.uuid),
                custom_text: schedule.custom_text,
                test_created: schedule.test_created,
                no_storage: schedule.no_storage,
                dry_run: false,
                due_at: now,
                actor,
            }))
        })
        .await??;
    if !triggered {
        return Err(ServerError::JobRunning(uuid.to_string()));
    }
    ctx.kernel.triggers.persistence.signal();
    Ok(ValueMap::new())
}

// ============================================================================
// Persistence rules
// ============================================================================

/// `persistenceList jobUUID=…`.
pub async fn persistence_list(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let uuid = job_uuid_arg(&ctx)?;
    let rows = ctx
        .kernel
        .jobs
        .with_job(uuid, |job| {
            job.persistence
                .iter()
                .map(|rule| {
                    let mut row = ValueMap::new()
                        .with("id", rule.id)
                        .with("archiveType", rule.archive_type)
                        .with("minKeep", rule.min_keep)
                        .with("maxKeep", rule.max_keep)
                        .with("maxAge", rule.max_age);
                    if let Some(move_to) = &rule.move_to {
                        row.set("moveTo", move_to);
                    }
                    row
                })
                .collect::<Vec<_>>()
        })
        .await?;
    for row in rows {
        ctx.sink.row(row);
    }
    Ok(ValueMap::new())
}

/// `persistenceListAdd jobUUID=… archiveType=… minKeep=… maxKeep=…
/// maxAge=… [moveTo=…]` — an exact duplicate returns the existing id.
pub async fn persistence_list_add(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let uuid = job_uuid_arg(&ctx)?;
    let archive_type: ArchiveType = ctx.args.get("archiveType")?;
    let min_keep: KeepLimit = ctx.args.get_or("minKeep", KeepLimit::Unlimited)?;
    let max_keep: KeepLimit = ctx.args.get_or("maxKeep", KeepLimit::Unlimited)?;
    let max_age: AgeLimit = ctx.args.get_or("maxAge", AgeLimit::Forever)?;
    let move_to = ctx
        .args
        .get_raw("moveTo")
        .filter(|v| !v.is_empty())
        .map(str::to_string);
    let now = Utc::now();

    let id = ctx
        .kernel
        .jobs
        .with_job_mut(uuid, move |job| {
            let id = job
                .persistence
                .add(archive_type, min_keep, max_keep, max_age, move_to, now);
            job.modified = true;
            id
        })
        .await?;
    Ok(ValueMap::new().with("id", id))
}

/// `persistenceListUpdate jobUUID=… id=… …`.
pub async fn persistence_list_update(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let uuid = job_uuid_arg(&ctx)?;
    let id: u32 = ctx.args.get("id")?;
    let args = ctx.args.clone();
    let now = Utc::now();

    ctx.kernel
        .jobs
        .with_job_mut(uuid, move |job| -> ServerResult<()> {
            let existing = job
                .persistence
                .get(id)
                .ok_or(ServerError::PersistenceIdNotFound(id))?
                .clone();
            let updated = PersistenceRule {
                id,
                archive_type: args.get_or("archiveType", existing.archive_type)?,
                min_keep: args.get_or("minKeep", existing.min_keep)?,
                max_keep: args.get_or("maxKeep", existing.max_keep)?,
                max_age: args.get_or("maxAge", existing.max_age)?,
                move_to: match args.get_raw("moveTo") {
                    Some("") => None,
                    Some(value) => Some(value.to_string()),
                    None => existing.move_to,
                },
            };
            job.persistence.update(updated, now);
            job.modified = true;
            Ok(())
        })
        .await??;
    Ok(ValueMap::new())
}

/// `persistenceListRemove jobUUID=… id=…`.
pub async fn persistence_list_remove(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let uuid = job_uuid_arg(&ctx)?;
    let id: u32 = ctx.args.get("id")?;
    let now = Utc::now();
    ctx.kernel
        .jobs
        .with_job_mut(uuid, move |job| {
            if !job.persistence.remove(id, now) {
                return Err(ServerError::PersistenceIdNotFound(id));
            }
            job.modified = true;
            Ok(())
        })
        .await??;
    Ok(ValueMap::new())
}

/// `persistenceListClear jobUUID=…`.
pub async fn persistence_list_clear(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let uuid = job_uuid_arg(&ctx)?;
    let now = Utc::now();
    ctx.kernel
        .jobs
        .with_job_mut(uuid, move |job| {
            job.persistence.clear(now);
            job.modified = true;
        })
        .await?;
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
    use wireline::{CommandFrame, ResultFrame, WireCode};

    struct Harness {
        deps: TestDependencies,
        dispatcher: Dispatcher,
        session: Arc<SessionState>,
        job_uuid: String,
    }

    impl Harness {
        async fn new() -> Self {
            let deps = TestDependencies::new(ServerMode::Master);
            let handle = deps.kernel.clients.register("c", Utc::now());
            handle.set_authorization(Authorization::Client);
            let session = SessionState::new(handle, "c", false).unwrap();
            let mut harness = Self {
                deps,
                dispatcher: Dispatcher::new(),
                session,
                job_uuid: String::new(),
            };
            let reply = harness
                .run("jobNew", ValueMap::new().with("name", "j"))
                .await;
            harness.job_uuid = reply.data.get_str("jobUUID").unwrap().to_string();
            harness
        }

        async fn run(&self, name: &str, args: ValueMap) -> ResultFrame {
            let (tx, _rx) = mpsc::unbounded_channel();
            self.dispatcher
                .execute(
                    self.deps.kernel.clone(),
                    self.session.clone(),
                    CommandFrame::with_args(1, name, args),
                    tx,
                )
                .await
        }

        async fn run_rows(&self, name: &str, args: ValueMap) -> (ResultFrame, Vec<ResultFrame>) {
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

        fn job_args(&self) -> ValueMap {
            ValueMap::new().with("jobUUID", &self.job_uuid)
        }
    }

    #[tokio::test]
    async fn test_include_add_list_remove() {
        let h = Harness::new().await;

        let reply = h
            .run(
                "includeListAdd",
                h.job_args()
                    .with("entryType", "FILE")
                    .with("pattern", "/home/*"),
            )
            .await;
        assert!(reply.code.is_ok());
        let id: u32 = reply.data.get("id").unwrap();

        let (terminal, rows) = h.run_rows("includeList", h.job_args()).await;
        assert!(terminal.code.is_ok());
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].data.get_str("pattern").unwrap(), "/home/*");

        let reply = h
            .run("includeListRemove", h.job_args().with("id", id))
            .await;
        assert!(reply.code.is_ok());
        let reply = h
            .run("includeListRemove", h.job_args().with("id", id))
            .await;
        assert_eq!(reply.code, WireCode::PatternIdNotFound);
    }

    #[tokio::test]
    async fn test_schedule_add_and_option_round_trip() {
        let h = Harness::new().await;

        let reply = h
            .run(
                "scheduleListAdd",
                h.job_args()
                    .with("date", "*-*-*")
                    .with("weekDays", "Mon,Fri")
                    .with("time", "03:30")
                    .with("archiveType", "FULL"),
            )
            .await;
        assert!(reply.code.is_ok());
        let schedule_uuid = reply.data.get_str("scheduleUUID").unwrap().to_string();

        let reply = h
            .run(
                "scheduleOptionGet",
                h.job_args()
                    .with("scheduleUUID", &schedule_uuid)
                    .with("name", "time"),
            )
            .await;
        assert_eq!(reply.data.get_str("value").unwrap(), "03:30");

        let reply = h
            .run(
                "scheduleOptionSet",
                h.job_args()
                    .with("scheduleUUID", &schedule_uuid)
                    .with("name", "enabled")
                    .with("value", "no"),
            )
            .await;
        assert!(reply.code.is_ok());

        let reply = h
            .run(
                "scheduleOptionGet",
                h.job_args()
                    .with("scheduleUUID", &schedule_uuid)
                    .with("name", "enabled"),
            )
            .await;
        assert_eq!(reply.data.get_str("value").unwrap(), "no");
    }

    #[tokio::test]
    async fn test_schedule_add_rejects_bad_date() {
        let h = Harness::new().await;
        let reply = h
            .run("scheduleListAdd", h.job_args().with("date", "2024-99-01"))
            .await;
        assert_eq!(reply.code, WireCode::ParseDate);
    }

    #[tokio::test]
    async fn test_persistence_duplicate_add_is_noop() {
        let h = Harness::new().await;
        let args = || {
            h.job_args()
                .with("archiveType", "FULL")
                .with("minKeep", "2")
                .with("maxKeep", "3")
                .with("maxAge", "forever")
        };

        let first = h.run("persistenceListAdd", args()).await;
        let second = h.run("persistenceListAdd", args()).await;
        assert_eq!(
            first.data.get::<u32>("id").unwrap(),
            second.data.get::<u32>("id").unwrap()
        );

        let (_, rows) = h.run_rows("persistenceList", h.job_args()).await;
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_schedule_trigger_runs_job() {
        let h = Harness::new().await;
        let reply = h
            .run(
                "scheduleListAdd",
                h.job_args().with("archiveType", "INCREMENTAL"),
            )
            .await;
        let schedule_uuid = reply.data.get_str("scheduleUUID").unwrap().to_string();

        let reply = h
            .run(
                "scheduleTrigger",
                h.job_args().with("scheduleUUID", &schedule_uuid),
            )
            .await;
        assert!(reply.code.is_ok());

        let uuid: Uuid = h.job_uuid.parse().unwrap();
        let request = h
            .deps
            .kernel
            .jobs
            .with_job(uuid, |j| j.start_request.clone())
            .await
            .unwrap()
            .expect("triggered");
        assert_eq!(request.archive_type, ArchiveType::Incremental);
        assert_eq!(request.schedule_uuid, Some(schedule_uuid.parse().unwrap()));
    }

    #[tokio::test]
    async fn test_mount_and_source_crud() {
        let h = Harness::new().await;

        let reply = h
            .run(
                "mountListAdd",
                h.job_args().with("name", "/mnt/b").with("device", "/dev/sdb1"),
            )
            .await;
        let mount_id: u32 = reply.data.get("id").unwrap();
        let reply = h
            .run("mountListRemove", h.job_args().with("id", mount_id))
            .await;
        assert!(reply.code.is_ok());

        let reply = h
            .run(
                "sourceListAdd",
                h.job_args().with("storageName", "/old/full.bar"),
            )
            .await;
        assert!(reply.code.is_ok());
        let reply = h
            .run("sourceListRemove", h.job_args().with("id", 99))
            .await;
        assert_eq!(reply.code, WireCode::DeltaSourceIdNotFound);
    }
}
