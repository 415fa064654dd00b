//! Persistence (retention) engine.
//!
//! Periodically walks all entities, assigns each to its job's persistence
//! rule, and expires surplus or over-age entities. Entities at the boundary
//! between two persistence periods are in transit and protected from purge.
//! The purge path is a pluggable strategy; the dry-run variant only records
//! the ids that would be purged.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::delay::{delay, DelayOutcome};
use super::deps::ServerKernel;
use super::service_host::Service;
use super::traits::{Index, IndexHandle, MountManager, Storage, StorageFilter};
use crate::common::error::{ServerError, ServerResult};
use crate::domains::index::model::{EntityRecord, IndexState};
use crate::domains::job::model::Mount;
use crate::domains::job::persistence::{PersistenceList, PersistenceRule};

/// Engine period.
const PERSISTENCE_PERIOD: Duration = Duration::from_secs(600);

/// Grace after the last rule modification before expiring anything.
fn modification_grace() -> chrono::Duration {
    chrono::Duration::minutes(10)
}

// ============================================================================
// Pure decision core
// ============================================================================

/// An entity with its assigned persistence rule.
#[derive(Debug, Clone)]
pub struct AnnotatedEntity {
    pub entity: EntityRecord,
    pub rule_id: Option<u32>,
}

/// Days between creation and now, rounded down.
fn age_days(entity: &EntityRecord, now: DateTime<Utc>) -> i64 {
    (now - entity.created_at).num_days()
}

/// Annotate one job's entities (ordered newest first) with their persistence
/// rule: the rule whose age window contains the entity's age, the `forever`
/// rule, or the last rule of the archive type so no entity is orphaned.
pub fn assign_rules(
    entities: &[EntityRecord],
    rules: &PersistenceList,
    now: DateTime<Utc>,
) -> Vec<AnnotatedEntity> {
    entities
        .iter()
        .map(|entity| {
            let age = age_days(entity, now);
            let type_rules = rules.rules_for(entity.archive_type);
            let mut assigned = None;
            for rule in &type_rules {
                match rule.max_age.days() {
                    None => {
                        assigned = Some(rule.id);
                        break;
                    }
                    Some(max_age) if age <= max_age as i64 => {
                        assigned = Some(rule.id);
                        break;
                    }
                    Some(_) => {}
                }
            }
            let rule_id = assigned.or_else(|| type_rules.last().map(|r| r.id));
            AnnotatedEntity {
                entity: entity.clone(),
                rule_id,
            }
        })
        .collect()
}

/// An entity is in transit when the next newer entity of the same archive
/// type belongs to a different persistence rule: it sits at the boundary
/// between two periods and is protected from purge.
pub fn is_in_transit(annotated: &[AnnotatedEntity], index: usize) -> bool {
    let this = &annotated[index];
    annotated[..index]
        .iter()
        .rev()
        .find(|other| other.entity.archive_type == this.entity.archive_type)
        .is_some_and(|newer| newer.rule_id != this.rule_id)
}

/// A purge decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expiry {
    pub entity_id: i64,
    pub reason: String,
}

/// Find the first expired-or-surplus entity of one job.
///
/// `blocked` carries entity ids that must not be purged this iteration:
/// locked entities, entities with a storage in `Update` state, and entities
/// already processed.
pub fn find_expired(
    annotated: &[AnnotatedEntity],
    rules: &PersistenceList,
    now: DateTime<Utc>,
    blocked: &HashSet<i64>,
) -> Option<Expiry> {
    let eligible = |index: usize| {
        let candidate = &annotated[index];
        !candidate.entity.locked
            && candidate.rule_id.is_some()
            && rules.has_rules_for(candidate.entity.archive_type)
            && !is_in_transit(annotated, index)
            && !blocked.contains(&candidate.entity.id)
    };

    for index in 0..annotated.len() {
        if !eligible(index) {
            continue;
        }
        let this = &annotated[index];
        let rule = rules.get(this.rule_id?)?;

        // Entities of the same rule form one period.
        let period: Vec<usize> = (0..annotated.len())
            .filter(|&i| {
                annotated[i].rule_id == this.rule_id
                    && annotated[i].entity.archive_type == this.entity.archive_type
            })
            .collect();
        let count = period.len() as u32;
        let min_keep = rule.min_keep.limit().unwrap_or(0);

        if let Some(max_keep) = rule.max_keep.limit() {
            if count > max_keep && count > min_keep {
                // Oldest entity in the period that is not protected. The
                // triggering entity itself is never the victim: a surplus
                // must not cost the newest backup.
                if let Some(&victim) =
                    period.iter().rev().find(|&&i| i != index && eligible(i))
                {
                    return Some(Expiry {
                        entity_id: annotated[victim].entity.id,
                        reason: format!("max. keep limit reached ({max_keep})"),
                    });
                }
            }
        }

        if let Some(max_age) = rule.max_age.days() {
            if age_days(&this.entity, now) > max_age as i64 && count > min_keep {
                return Some(Expiry {
                    entity_id: this.entity.id,
                    reason: format!("max. age reached ({max_age} days)"),
                });
            }
        }
    }
    None
}

// ============================================================================
// Purge strategies
// ============================================================================

/// Context handed to a purge strategy.
pub struct PurgeContext<'a> {
    pub index: &'a dyn Index,
    pub storage: &'a dyn Storage,
    pub mounts: &'a dyn MountManager,
    pub handle: &'a IndexHandle,
}

/// How expired entities are disposed of.
#[async_trait]
pub trait PurgeStrategy: Send + Sync {
    async fn purge(
        &self,
        ctx: &PurgeContext<'_>,
        entity: &EntityRecord,
        mounts: &[Mount],
        reason: &str,
    ) -> ServerResult<()>;
}

/// The real thing: lock entity → mount → delete storages → delete entity →
/// unmount → unlock, releasing everything on every exit path.
pub struct DeletePurge;

#[async_trait]
impl PurgeStrategy for DeletePurge {
    async fn purge(
        &self,
        ctx: &PurgeContext<'_>,
        entity: &EntityRecord,
        mounts: &[Mount],
        reason: &str,
    ) -> ServerResult<()> {
        ctx.index
            .set_entity_locked(ctx.handle, entity.id, true)
            .await?;

        let mut mounted: Vec<&Mount> = Vec::new();
        let result = async {
            for mount in mounts {
                ctx.mounts.mount(&mount.name, &mount.device).await?;
                mounted.push(mount);
            }

            let storages = ctx
                .index
                .storages(
                    ctx.handle,
                    StorageFilter {
                        entity_id: Some(entity.id),
                        ..Default::default()
                    },
                )
                .await?;
            for storage in &storages {
                if let Err(err) = ctx.storage.delete(&storage.name).await {
                    // A vanished artifact must not keep its index row alive.
                    debug!(storage = %storage.name, error = %err, "storage delete failed");
                }
                ctx.index.delete_storage(ctx.handle, storage.id).await?;
            }
            ctx.index.delete_entity(ctx.handle, entity.id).await?;
            Ok::<_, ServerError>(())
        }
        .await;

        for mount in mounted.iter().rev() {
            let _ = ctx.mounts.unmount(&mount.name).await;
        }
        if result.is_err() {
            // The entity still exists; release its lock.
            let _ = ctx
                .index
                .set_entity_locked(ctx.handle, entity.id, false)
                .await;
        }
        result?;

        info!(target: "index", entity = %entity.uuid, reason, "Purged expired entity");
        Ok(())
    }
}

/// Records what would be purged without touching anything.
#[derive(Default)]
pub struct DryRunPurge {
    pub purged: Mutex<Vec<(i64, String)>>,
}

impl DryRunPurge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn purged_ids(&self) -> Vec<i64> {
        self.purged.lock().unwrap().iter().map(|(id, _)| *id).collect()
    }
}

#[async_trait]
impl PurgeStrategy for DryRunPurge {
    async fn purge(
        &self,
        _ctx: &PurgeContext<'_>,
        entity: &EntityRecord,
        _mounts: &[Mount],
        reason: &str,
    ) -> ServerResult<()> {
        self.purged
            .lock()
            .unwrap()
            .push((entity.id, reason.to_string()));
        Ok(())
    }
}

// ============================================================================
// Engine
// ============================================================================

struct JobRetention {
    rules: PersistenceList,
    mounts: Vec<Mount>,
}

/// The persistence engine service.
pub struct PersistenceEngine {
    kernel: Arc<ServerKernel>,
    strategy: Arc<dyn PurgeStrategy>,
}

impl PersistenceEngine {
    pub fn new(kernel: Arc<ServerKernel>) -> Self {
        Self {
            kernel,
            strategy: Arc::new(DeletePurge),
        }
    }

    pub fn with_strategy(kernel: Arc<ServerKernel>, strategy: Arc<dyn PurgeStrategy>) -> Self {
        Self { kernel, strategy }
    }

    /// One engine iteration. `immediate` skips the modification grace (used
    /// when a new archive is about to be created).
    pub async fn run_once(&self, now: DateTime<Utc>, immediate: bool) -> ServerResult<()> {
        if !self.kernel.index.is_initialized() {
            return Ok(());
        }
        let handle = self.kernel.index.open_handle().await?;
        let result = self.expire_all(&handle, now, immediate).await;
        let move_result = self.move_all(&handle).await;
        self.kernel.index.close_handle(handle).await;
        result?;
        move_result
    }

    async fn job_retention(&self) -> ServerResult<HashMap<Uuid, JobRetention>> {
        let jobs = self.kernel.jobs.read().await?;
        Ok(jobs
            .iter()
            .map(|job| {
                (
                    job.uuid,
                    JobRetention {
                        rules: job.persistence.clone(),
                        mounts: job.mounts.clone(),
                    },
                )
            })
            .collect())
    }

    async fn expire_all(
        &self,
        handle: &IndexHandle,
        now: DateTime<Utc>,
        immediate: bool,
    ) -> ServerResult<()> {
        let mut blocked: HashSet<i64> = HashSet::new();

        // Repeat from a fresh entity list until nothing more expires.
        loop {
            if self.kernel.quit.is_cancelled() {
                return Ok(());
            }

            let entities = self.kernel.index.entities(handle).await?;
            debug_assert!(
                entities.windows(2).all(|w| w[0].created_at >= w[1].created_at),
                "index must return entities newest first"
            );

            // Entities with a storage mid-update hold an index lock.
            for entity in &entities {
                let storages = self
                    .kernel
                    .index
                    .storages(
                        handle,
                        StorageFilter {
                            entity_id: Some(entity.id),
                            index_state: Some(IndexState::Update),
                            ..Default::default()
                        },
                    )
                    .await?;
                if !storages.is_empty() {
                    blocked.insert(entity.id);
                }
            }

            let retention = self.job_retention().await?;
            let mut expired = None;
            for (job_uuid, retention) in &retention {
                if retention.rules.is_empty() {
                    continue;
                }
                if !immediate {
                    let grace_passed = retention
                        .rules
                        .last_modified
                        .is_none_or(|t| now > t + modification_grace());
                    if !grace_passed {
                        continue;
                    }
                }

                let job_entities: Vec<EntityRecord> = entities
                    .iter()
                    .filter(|e| e.job_uuid == *job_uuid)
                    .cloned()
                    .collect();
                let annotated = assign_rules(&job_entities, &retention.rules, now);
                if let Some(found) = find_expired(&annotated, &retention.rules, now, &blocked) {
                    let entity = job_entities
                        .iter()
                        .find(|e| e.id == found.entity_id)
                        .cloned();
                    if let Some(entity) = entity {
                        expired = Some((entity, retention.mounts.clone(), found.reason));
                        break;
                    }
                }
            }

            let Some((entity, mounts, reason)) = expired else {
                return Ok(());
            };

            blocked.insert(entity.id);
            let ctx = PurgeContext {
                index: self.kernel.index.as_ref(),
                storage: self.kernel.storage.as_ref(),
                mounts: self.kernel.mounts.as_ref(),
                handle,
            };
            if let Err(err) = self.strategy.purge(&ctx, &entity, &mounts, &reason).await {
                warn!(target: "index", entity = %entity.uuid, error = %err, "purge failed");
            }
        }
    }

    /// Move storages of entities whose rule carries a `moveTo` URI.
    async fn move_all(&self, handle: &IndexHandle) -> ServerResult<()> {
        let now = Utc::now();
        let retention = self.job_retention().await?;
        let entities = self.kernel.index.entities(handle).await?;

        for (job_uuid, retention) in &retention {
            let job_entities: Vec<EntityRecord> = entities
                .iter()
                .filter(|e| e.job_uuid == *job_uuid)
                .cloned()
                .collect();
            let annotated = assign_rules(&job_entities, &retention.rules, now);

            for item in &annotated {
                let Some(rule) = item.rule_id.and_then(|id| retention.rules.get(id)) else {
                    continue;
                };
                let Some(move_to) = &rule.move_to else { continue };

                self.move_entity_storages(handle, &item.entity, rule, move_to)
                    .await?;
            }
        }
        Ok(())
    }

    async fn move_entity_storages(
        &self,
        handle: &IndexHandle,
        entity: &EntityRecord,
        _rule: &PersistenceRule,
        move_to: &str,
    ) -> ServerResult<()> {
        let storages = self
            .kernel
            .index
            .storages(
                handle,
                StorageFilter {
                    entity_id: Some(entity.id),
                    ..Default::default()
                },
            )
            .await?;
        let destination_dir = move_to.trim_end_matches('/');

        let total_count = storages.len() as u64;
        let total_size: u64 = storages.iter().map(|s| s.size).sum();
        let mut done_count = 0u64;
        let mut done_size = 0u64;

        for storage in storages {
            let current_dir = storage
                .name
                .rsplit_once('/')
                .map(|(dir, _)| dir)
                .unwrap_or("");
            if current_dir == destination_dir {
                continue;
            }
            let file_name = storage
                .name
                .rsplit_once('/')
                .map(|(_, file)| file)
                .unwrap_or(storage.name.as_str());

            // Find a free destination name: plain, then -0, -1, ….
            let mut destination = format!("{destination_dir}/{file_name}");
            let mut suffix = 0u32;
            while self.kernel.storage.exists(&destination).await? {
                destination = format!("{destination_dir}/{file_name}-{suffix}");
                suffix += 1;
            }

            info!(
                target: "index",
                storage = %storage.name,
                destination = %destination,
                "moving storage"
            );
            self.kernel.storage.copy(&storage.name, &destination).await?;

            let mut updated = storage.clone();
            updated.name = destination.clone();
            if let Err(err) = self.kernel.index.update_storage(handle, &updated).await {
                // Revert: destination copy is dropped, row marked broken.
                let _ = self.kernel.storage.delete(&destination).await;
                let mut reverted = storage.clone();
                reverted.index_state = IndexState::Error;
                reverted.error_message = format!("move failed: {err}");
                let _ = self.kernel.index.update_storage(handle, &reverted).await;
                continue;
            }
            if let Err(err) = self.kernel.storage.delete(&storage.name).await {
                debug!(storage = %storage.name, error = %err, "source delete after move failed");
            }

            done_count += 1;
            done_size += storage.size;
            debug!(
                target: "index",
                storage_id = storage.id,
                done_count,
                done_size,
                total_count,
                total_size,
                "move progress"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl Service for PersistenceEngine {
    fn name(&self) -> &'static str {
        "persistence"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        let mut immediate = false;
        loop {
            if let Err(err) = self.run_once(Utc::now(), immediate).await {
                if err.is_transient() {
                    debug!(error = %err, "persistence iteration failed");
                } else {
                    warn!(error = %err, "persistence iteration failed");
                }
            }

            match delay(
                PERSISTENCE_PERIOD,
                Some(&self.kernel.triggers.persistence),
                &shutdown,
            )
            .await
            {
                DelayOutcome::Quit => return Ok(()),
                // A trigger means an archive is about to be created: run
                // without the modification grace.
                DelayOutcome::Triggered => immediate = true,
                DelayOutcome::Elapsed => immediate = false,
            }
        }
    }
}
