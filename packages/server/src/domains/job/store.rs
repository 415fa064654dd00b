//! Job config-file store.
//!
//! One human-readable `key = value` file per job under the jobs directory,
//! with `[schedule <uuid>]` and `[persistence <id>]` sections. Files are
//! written atomically via a temp file and rename. A sibling `.<jobName>`
//! state file keeps the per-schedule last-executed timestamps so re-editing
//! the job file never resets them.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use chrono::{DateTime, TimeZone, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use super::model::{
    DeltaSource, EntryType, ExcludePattern, IncludeEntry, Job, Mount, PatternType, SlaveBinding,
};
use super::persistence::{AgeLimit, KeepLimit, PersistenceRule};
use super::schedule::{Schedule, ScheduleDate, ScheduleTime, WeekDaySet};
use crate::common::error::{ServerError, ServerResult};
use crate::common::types::TlsMode;

/// Store over one jobs directory.
pub struct JobStore {
    directory: PathBuf,
    mtimes: Mutex<HashMap<String, SystemTime>>,
}

/// Result of a directory rescan.
#[derive(Debug, Default)]
pub struct RescanOutcome {
    pub added: Vec<Job>,
    pub updated: Vec<Job>,
    pub removed: Vec<String>,
}

impl JobStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            mtimes: Mutex::new(HashMap::new()),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn job_path(&self, name: &str) -> PathBuf {
        self.directory.join(name)
    }

    fn state_path(&self, name: &str) -> PathBuf {
        self.directory.join(format!(".{name}"))
    }

    /// Load every job file in the directory.
    pub fn load_all(&self, now: DateTime<Utc>) -> ServerResult<Vec<Job>> {
        let mut jobs = Vec::new();
        let mut mtimes = self.mtimes.lock().unwrap();
        mtimes.clear();

        let entries = match fs::read_dir(&self.directory) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(jobs),
            Err(err) => return Err(err.into()),
        };

        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || !entry.file_type()?.is_file() {
                continue;
            }

            match self.load_job(&name, now) {
                Ok(job) => {
                    if let Ok(meta) = entry.metadata() {
                        if let Ok(mtime) = meta.modified() {
                            mtimes.insert(name.clone(), mtime);
                        }
                    }
                    jobs.push(job);
                }
                Err(err) => {
                    warn!(job = %name, error = %err, "skipping unreadable job file");
                }
            }
        }
        Ok(jobs)
    }

    /// Load one job plus its state file.
    pub fn load_job(&self, name: &str, now: DateTime<Utc>) -> ServerResult<Job> {
        let text = fs::read_to_string(self.job_path(name))?;
        let mut job = parse_job(name, &text, now)?;
        self.apply_state(&mut job);
        Ok(job)
    }

    fn apply_state(&self, job: &mut Job) {
        let Ok(text) = fs::read_to_string(self.state_path(&job.name)) else {
            return;
        };
        for line in text.lines() {
            let mut parts = line.split_whitespace();
            let (Some(uuid_text), Some(ts_text)) = (parts.next(), parts.next()) else {
                continue;
            };
            let (Ok(uuid), Ok(ts)) = (uuid_text.parse::<Uuid>(), ts_text.parse::<i64>()) else {
                continue;
            };
            if let Some(schedule) = job.schedule_mut(uuid) {
                schedule.last_executed = Utc.timestamp_opt(ts, 0).single();
            }
        }
    }

    /// Write a job file atomically via temp file and rename.
    pub fn write_job(&self, job: &Job) -> ServerResult<()> {
        fs::create_dir_all(&self.directory)?;
        let path = self.job_path(&job.name);
        let tmp = self.directory.join(format!(".{}.tmp", job.name));

        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(serialize_job(job).as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;

        if let Ok(meta) = fs::metadata(&path) {
            if let Ok(mtime) = meta.modified() {
                self.mtimes.lock().unwrap().insert(job.name.clone(), mtime);
            }
        }
        Ok(())
    }

    /// Write the per-schedule state file.
    pub fn write_state(&self, job: &Job) -> ServerResult<()> {
        let mut text = String::new();
        for schedule in &job.schedules {
            if let Some(last) = schedule.last_executed {
                text.push_str(&format!("{} {}\n", schedule.uuid, last.timestamp()));
            }
        }
        fs::create_dir_all(&self.directory)?;
        fs::write(self.state_path(&job.name), text)?;
        Ok(())
    }

    /// Delete a job file and its state file.
    pub fn delete_job(&self, name: &str) -> ServerResult<()> {
        let _ = fs::remove_file(self.state_path(name));
        fs::remove_file(self.job_path(name))?;
        self.mtimes.lock().unwrap().remove(name);
        Ok(())
    }

    /// Rename the on-disk files of a job.
    pub fn rename_job(&self, old_name: &str, new_name: &str) -> ServerResult<()> {
        fs::rename(self.job_path(old_name), self.job_path(new_name))?;
        let _ = fs::rename(self.state_path(old_name), self.state_path(new_name));
        let mut mtimes = self.mtimes.lock().unwrap();
        if let Some(mtime) = mtimes.remove(old_name) {
            mtimes.insert(new_name.to_string(), mtime);
        }
        Ok(())
    }

    /// Compare the directory against the known set of jobs: load new files,
    /// reload changed ones, report vanished ones.
    pub fn rescan(&self, known: &[String], now: DateTime<Utc>) -> ServerResult<RescanOutcome> {
        let mut outcome = RescanOutcome::default();
        let mut seen = Vec::new();

        let entries = match fs::read_dir(&self.directory) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                outcome.removed = known.to_vec();
                return Ok(outcome);
            }
            Err(err) => return Err(err.into()),
        };

        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || !entry.file_type()?.is_file() {
                continue;
            }
            seen.push(name.clone());

            let mtime = entry.metadata().and_then(|m| m.modified()).ok();
            let previous = self.mtimes.lock().unwrap().get(&name).copied();
            let is_known = known.contains(&name);

            if is_known && mtime == previous {
                continue;
            }

            match self.load_job(&name, now) {
                Ok(job) => {
                    if let Some(mtime) = mtime {
                        self.mtimes.lock().unwrap().insert(name.clone(), mtime);
                    }
                    if is_known {
                        debug!(job = %name, "job file changed, reloading");
                        outcome.updated.push(job);
                    } else {
                        debug!(job = %name, "new job file found");
                        outcome.added.push(job);
                    }
                }
                Err(err) => warn!(job = %name, error = %err, "skipping unreadable job file"),
            }
        }

        for name in known {
            if !seen.contains(name) {
                outcome.removed.push(name.clone());
                self.mtimes.lock().unwrap().remove(name);
            }
        }
        Ok(outcome)
    }
}

// ============================================================================
// Serialization
// ============================================================================

fn bool_text(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

fn push_line(out: &mut String, key: &str, value: &str) {
    if !value.is_empty() {
        out.push_str(&format!("{key} = {value}\n"));
    }
}

/// Render a job as its config-file text.
pub fn serialize_job(job: &Job) -> String {
    let mut out = String::new();

    push_line(&mut out, "uuid", &job.uuid.to_string());
    push_line(&mut out, "archive-name", &job.storage_name);
    push_line(&mut out, "comment", &job.comment);
    push_line(&mut out, "crypt-algorithm", &job.crypt.algorithm);
    push_line(
        &mut out,
        "crypt-password",
        job.crypt.password.as_deref().unwrap_or(""),
    );
    push_line(
        &mut out,
        "crypt-public-key",
        job.crypt.public_key.as_deref().unwrap_or(""),
    );
    push_line(
        &mut out,
        "pre-command",
        job.pre_command.as_deref().unwrap_or(""),
    );
    push_line(
        &mut out,
        "post-command",
        job.post_command.as_deref().unwrap_or(""),
    );
    if let Some(slave) = &job.slave {
        push_line(&mut out, "slave-host-name", &slave.host);
        push_line(&mut out, "slave-host-port", &slave.port.to_string());
        push_line(&mut out, "slave-tls-mode", &slave.tls_mode.to_string());
    }

    for include in &job.includes {
        push_line(
            &mut out,
            "include",
            &format!(
                "{} {} {}",
                include.entry_type, include.pattern_type, include.pattern
            ),
        );
    }
    for exclude in &job.excludes {
        push_line(
            &mut out,
            "exclude",
            &format!("{} {}", exclude.pattern_type, exclude.pattern),
        );
    }
    for exclude in &job.compress_excludes {
        push_line(
            &mut out,
            "compress-exclude",
            &format!("{} {}", exclude.pattern_type, exclude.pattern),
        );
    }
    for mount in &job.mounts {
        push_line(&mut out, "mount", &format!("{} {}", mount.name, mount.device));
    }
    for source in &job.delta_sources {
        push_line(&mut out, "delta-source", &source.storage_name);
    }

    for schedule in &job.schedules {
        out.push_str(&format!("\n[schedule {}]\n", schedule.uuid));
        out.push_str(&format!("date = {}\n", schedule.date.format()));
        out.push_str(&format!("weekdays = {}\n", schedule.week_days.format()));
        out.push_str(&format!("time = {}\n", schedule.time.format()));
        out.push_str(&format!("archive-type = {}\n", schedule.archive_type));
        out.push_str(&format!("interval = {}\n", schedule.interval_minutes));
        if !schedule.custom_text.is_empty() {
            out.push_str(&format!("text = {}\n", schedule.custom_text));
        }
        out.push_str(&format!("no-storage = {}\n", bool_text(schedule.no_storage)));
        out.push_str(&format!("enabled = {}\n", bool_text(schedule.enabled)));
    }

    for rule in job.persistence.iter() {
        out.push_str(&format!("\n[persistence {}]\n", rule.id));
        out.push_str(&format!("archive-type = {}\n", rule.archive_type));
        out.push_str(&format!("min-keep = {}\n", rule.min_keep));
        out.push_str(&format!("max-keep = {}\n", rule.max_keep));
        out.push_str(&format!("max-age = {}\n", rule.max_age));
        if let Some(move_to) = &rule.move_to {
            out.push_str(&format!("move-to = {move_to}\n"));
        }
    }

    out
}

// ============================================================================
// Parsing
// ============================================================================

enum Section {
    Top,
    Schedule(Schedule),
    Persistence(PersistenceRule),
}

/// Parse a job config file.
pub fn parse_job(name: &str, text: &str, now: DateTime<Utc>) -> ServerResult<Job> {
    let mut job = Job::new(name, now);
    let mut section = Section::Top;

    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(header) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            finish_section(&mut job, std::mem::replace(&mut section, Section::Top));
            section = open_section(header)?;
            continue;
        }

        let (key, value) = line
            .split_once('=')
            .map(|(k, v)| (k.trim(), v.trim()))
            .ok_or_else(|| ServerError::InvalidValue {
                name: line.to_string(),
                value: String::new(),
            })?;

        match &mut section {
            Section::Top => parse_top_line(&mut job, key, value)?,
            Section::Schedule(schedule) => parse_schedule_line(schedule, key, value)?,
            Section::Persistence(rule) => parse_persistence_line(rule, key, value)?,
        }
    }
    finish_section(&mut job, section);

    Ok(job)
}

fn open_section(header: &str) -> ServerResult<Section> {
    let mut parts = header.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("schedule"), uuid_text) => {
            let mut schedule = Schedule::new(Default::default());
            if let Some(uuid_text) = uuid_text {
                schedule.uuid = uuid_text
                    .parse()
                    .map_err(|_| ServerError::ParseSchedule(header.to_string()))?;
            }
            Ok(Section::Schedule(schedule))
        }
        (Some("persistence"), id_text) => {
            let id = match id_text {
                Some(id_text) => id_text
                    .parse()
                    .map_err(|_| ServerError::InvalidValue {
                        name: "persistence".to_string(),
                        value: id_text.to_string(),
                    })?,
                None => 0,
            };
            Ok(Section::Persistence(PersistenceRule {
                id,
                archive_type: Default::default(),
                min_keep: KeepLimit::Unlimited,
                max_keep: KeepLimit::Unlimited,
                max_age: AgeLimit::Forever,
                move_to: None,
            }))
        }
        _ => Err(ServerError::UnknownValue(header.to_string())),
    }
}

fn finish_section(job: &mut Job, section: Section) {
    match section {
        Section::Top => {}
        Section::Schedule(schedule) => job.schedules.push(schedule),
        Section::Persistence(mut rule) => {
            if rule.id == 0 {
                rule.id = job.next_entry_id();
            } else {
                job.observe_entry_id(rule.id);
            }
            job.persistence.restore(rule);
        }
    }
}

fn parse_top_line(job: &mut Job, key: &str, value: &str) -> ServerResult<()> {
    let invalid = || ServerError::InvalidValue {
        name: key.to_string(),
        value: value.to_string(),
    };

    match key {
        "uuid" => job.uuid = value.parse().map_err(|_| invalid())?,
        "archive-name" => job.storage_name = value.to_string(),
        "comment" => job.comment = value.to_string(),
        "crypt-algorithm" => job.crypt.algorithm = value.to_string(),
        "crypt-password" => job.crypt.password = Some(value.to_string()),
        "crypt-public-key" => job.crypt.public_key = Some(value.to_string()),
        "pre-command" => job.pre_command = Some(value.to_string()),
        "post-command" => job.post_command = Some(value.to_string()),
        "slave-host-name" => {
            let binding = job.slave.get_or_insert(SlaveBinding {
                host: String::new(),
                port: super::model::DEFAULT_SLAVE_PORT,
                tls_mode: TlsMode::Try,
            });
            binding.host = value.to_string();
        }
        "slave-host-port" => {
            if let Some(binding) = &mut job.slave {
                binding.port = value.parse().map_err(|_| invalid())?;
            }
        }
        "slave-tls-mode" => {
            if let Some(binding) = &mut job.slave {
                binding.tls_mode = value.parse().map_err(|_| invalid())?;
            }
        }
        "include" => {
            let mut parts = value.splitn(3, ' ');
            let entry_type: EntryType = parts
                .next()
                .ok_or_else(invalid)?
                .parse()
                .map_err(|_| invalid())?;
            let pattern_type: PatternType = parts
                .next()
                .ok_or_else(invalid)?
                .parse()
                .map_err(|_| invalid())?;
            let pattern = parts.next().ok_or_else(invalid)?.to_string();
            let id = job.next_entry_id();
            job.includes.push(IncludeEntry {
                id,
                entry_type,
                pattern_type,
                pattern,
            });
        }
        "exclude" | "compress-exclude" => {
            let (pattern_type_text, pattern) = value.split_once(' ').ok_or_else(invalid)?;
            let pattern_type: PatternType =
                pattern_type_text.parse().map_err(|_| invalid())?;
            let id = job.next_entry_id();
            let entry = ExcludePattern {
                id,
                pattern_type,
                pattern: pattern.to_string(),
            };
            if key == "exclude" {
                job.excludes.push(entry);
            } else {
                job.compress_excludes.push(entry);
            }
        }
        "mount" => {
            let (mount_name, device) = value.split_once(' ').ok_or_else(invalid)?;
            let id = job.next_entry_id();
            job.mounts.push(Mount {
                id,
                name: mount_name.to_string(),
                device: device.to_string(),
            });
        }
        "delta-source" => {
            let id = job.next_entry_id();
            job.delta_sources.push(DeltaSource {
                id,
                storage_name: value.to_string(),
            });
        }
        _ => {
            debug!(key, "ignoring unknown job file entry");
        }
    }
    Ok(())
}

fn parse_schedule_line(schedule: &mut Schedule, key: &str, value: &str) -> ServerResult<()> {
    match key {
        "date" => schedule.date = ScheduleDate::parse(value)?,
        "weekdays" => schedule.week_days = WeekDaySet::parse(value)?,
        "time" => schedule.time = ScheduleTime::parse(value)?,
        "archive-type" => {
            schedule.archive_type = value
                .parse()
                .map_err(|_| ServerError::ParseSchedule(value.to_string()))?
        }
        "interval" => {
            schedule.interval_minutes = value
                .parse()
                .map_err(|_| ServerError::ParseSchedule(value.to_string()))?
        }
        "text" => schedule.custom_text = value.to_string(),
        "no-storage" => schedule.no_storage = parse_bool(value)?,
        "enabled" => schedule.enabled = parse_bool(value)?,
        _ => debug!(key, "ignoring unknown schedule entry"),
    }
    Ok(())
}

fn parse_persistence_line(rule: &mut PersistenceRule, key: &str, value: &str) -> ServerResult<()> {
    let invalid = || ServerError::InvalidValue {
        name: key.to_string(),
        value: value.to_string(),
    };
    match key {
        "archive-type" => rule.archive_type = value.parse().map_err(|_| invalid())?,
        "min-keep" => rule.min_keep = value.parse().map_err(|_| invalid())?,
        "max-keep" => rule.max_keep = value.parse().map_err(|_| invalid())?,
        "max-age" => rule.max_age = value.parse().map_err(|_| invalid())?,
        "move-to" => rule.move_to = Some(value.to_string()),
        _ => debug!(key, "ignoring unknown persistence entry"),
    }
    Ok(())
}

fn parse_bool(value: &str) -> ServerResult<bool> {
    match value.to_ascii_lowercase().as_str() {
        "yes" | "true" | "1" => Ok(true),
        "no" | "false" | "0" => Ok(false),
        _ => Err(ServerError::InvalidValue {
            name: "boolean".to_string(),
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::ArchiveType;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn sample_job() -> Job {
        let mut job = Job::new("backup-home", now());
        job.storage_name = "sftp://backup@host/archives/home-%type-%T.bar".to_string();
        job.comment = "home directories".to_string();
        job.crypt.algorithm = "aes256".to_string();
        job.pre_command = Some("snapshot create".to_string());

        let id = job.next_entry_id();
        job.includes.push(IncludeEntry {
            id,
            entry_type: EntryType::File,
            pattern_type: PatternType::Glob,
            pattern: "/home/*".to_string(),
        });
        let id = job.next_entry_id();
        job.excludes.push(ExcludePattern {
            id,
            pattern_type: PatternType::Glob,
            pattern: "*.cache".to_string(),
        });
        let id = job.next_entry_id();
        job.mounts.push(Mount {
            id,
            name: "/mnt/backup".to_string(),
            device: "/dev/sdb1".to_string(),
        });

        let mut schedule = Schedule::new(ArchiveType::Full);
        schedule.time = ScheduleTime {
            hour: Some(3),
            minute: Some(30),
        };
        job.schedules.push(schedule);

        job.persistence.add(
            ArchiveType::Full,
            KeepLimit::Count(2),
            KeepLimit::Count(4),
            AgeLimit::Days(30),
            None,
            now(),
        );
        job
    }

    #[test]
    fn test_serialize_parse_round_trip() {
        let job = sample_job();
        let text = serialize_job(&job);
        let parsed = parse_job("backup-home", &text, now()).unwrap();

        assert_eq!(parsed.uuid, job.uuid);
        assert_eq!(parsed.storage_name, job.storage_name);
        assert_eq!(parsed.comment, job.comment);
        assert_eq!(parsed.includes.len(), 1);
        assert_eq!(parsed.includes[0].pattern, "/home/*");
        assert_eq!(parsed.excludes.len(), 1);
        assert_eq!(parsed.mounts[0].device, "/dev/sdb1");
        assert_eq!(parsed.schedules.len(), 1);
        assert_eq!(parsed.schedules[0].uuid, job.schedules[0].uuid);
        assert_eq!(parsed.schedules[0].time.format(), "03:30");
        assert_eq!(parsed.persistence.len(), 1);
        let rule = parsed.persistence.iter().next().unwrap();
        assert_eq!(rule.max_keep, KeepLimit::Count(4));
        assert_eq!(rule.max_age, AgeLimit::Days(30));
    }

    #[test]
    fn test_parse_rejects_bad_schedule_date() {
        let text = "[schedule]\ndate = 2024-99-01\n";
        assert!(matches!(
            parse_job("j", text, now()),
            Err(ServerError::ParseDate(_))
        ));
    }

    #[test]
    fn test_store_write_load_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(dir.path());
        let job = sample_job();

        store.write_job(&job).unwrap();
        let loaded = store.load_job("backup-home", now()).unwrap();
        assert_eq!(loaded.uuid, job.uuid);

        store.delete_job("backup-home").unwrap();
        assert!(store.load_job("backup-home", now()).is_err());
    }

    #[test]
    fn test_state_file_preserves_last_executed() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(dir.path());
        let mut job = sample_job();
        let executed = Utc.timestamp_opt(1_700_100_000, 0).unwrap();
        job.schedules[0].last_executed = Some(executed);

        store.write_job(&job).unwrap();
        store.write_state(&job).unwrap();

        let loaded = store.load_job("backup-home", now()).unwrap();
        assert_eq!(loaded.schedules[0].last_executed, Some(executed));
    }

    #[test]
    fn test_rescan_detects_added_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(dir.path());
        let job = sample_job();
        store.write_job(&job).unwrap();

        let outcome = store
            .rescan(&["vanished-job".to_string()], now())
            .unwrap();
        assert_eq!(outcome.added.len(), 1);
        assert_eq!(outcome.added[0].name, "backup-home");
        assert_eq!(outcome.removed, vec!["vanished-job".to_string()]);

        // A second rescan with the job known and unchanged reports nothing.
        let outcome = store.rescan(&["backup-home".to_string()], now()).unwrap();
        assert!(outcome.added.is_empty());
        assert!(outcome.updated.is_empty());
        assert!(outcome.removed.is_empty());
    }

    #[test]
    fn test_load_all_skips_dotfiles() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(dir.path());
        store.write_job(&sample_job()).unwrap();
        std::fs::write(dir.path().join(".hidden"), "not a job").unwrap();

        let jobs = store.load_all(now()).unwrap();
        assert_eq!(jobs.len(), 1);
    }
}
