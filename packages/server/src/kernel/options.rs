//! Global server options, maintenance windows and the paired-master record,
//! persisted in the global config file.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Datelike, Timelike, Utc};
use tracing::debug;

use crate::common::auth::MasterRecord;
use crate::common::error::{ServerError, ServerResult};
use crate::domains::job::schedule::{ScheduleDate, WeekDaySet};

/// One maintenance window. Index maintenance only runs inside a window
/// (or at any time when none is configured).
#[derive(Debug, Clone, PartialEq)]
pub struct MaintenanceWindow {
    pub id: u32,
    pub date: ScheduleDate,
    pub week_days: WeekDaySet,
    pub begin_hour: u32,
    pub begin_minute: u32,
    pub end_hour: u32,
    pub end_minute: u32,
}

impl MaintenanceWindow {
    /// Parse `HH:MM` with a maintenance-specific error.
    pub fn parse_time(text: &str) -> ServerResult<(u32, u32)> {
        let (hour_text, minute_text) = text
            .split_once(':')
            .ok_or_else(|| ServerError::ParseMaintenance(text.to_string()))?;
        let hour: u32 = hour_text
            .parse()
            .map_err(|_| ServerError::ParseMaintenance(text.to_string()))?;
        let minute: u32 = minute_text
            .parse()
            .map_err(|_| ServerError::ParseMaintenance(text.to_string()))?;
        if hour > 23 || minute > 59 {
            return Err(ServerError::ParseMaintenance(text.to_string()));
        }
        Ok((hour, minute))
    }

    fn contains(&self, now: DateTime<Utc>) -> bool {
        if !(self.date.year.is_none_or(|y| y == now.year())
            && self.date.month.is_none_or(|m| m == now.month())
            && self.date.day.is_none_or(|d| d == now.day())
            && self.week_days.contains(now.weekday()))
        {
            return false;
        }

        let minute_of_day = now.hour() * 60 + now.minute();
        let begin = self.begin_hour * 60 + self.begin_minute;
        let end = self.end_hour * 60 + self.end_minute;
        if begin <= end {
            begin <= minute_of_day && minute_of_day <= end
        } else {
            // Window spans midnight.
            minute_of_day >= begin || minute_of_day <= end
        }
    }
}

/// The mutable global option set.
#[derive(Debug, Clone, Default)]
pub struct GlobalOptions {
    pub password_hash: Option<String>,
    pub max_connections: u32,
    pub tls_ca_file: Option<PathBuf>,
    pub tls_cert_file: Option<PathBuf>,
    pub tls_key_file: Option<PathBuf>,
    pub crypt_password: Option<String>,
    /// Keep time for auto-mode index rows, seconds.
    pub index_auto_keep_seconds: u64,
    /// This server's own identity, sent when authorizing against slaves.
    pub server_uuid: Option<String>,
    pub maintenance: Vec<MaintenanceWindow>,
    pub master: Option<MasterRecord>,
    next_maintenance_id: u32,
}

pub const DEFAULT_MAX_CONNECTIONS: u32 = 8;
pub const DEFAULT_INDEX_AUTO_KEEP_SECONDS: u64 = 30 * 24 * 3600;

impl GlobalOptions {
    fn with_defaults() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            index_auto_keep_seconds: DEFAULT_INDEX_AUTO_KEEP_SECONDS,
            ..Self::default()
        }
    }
}

/// Lock-protected options plus their backing file.
pub struct ServerOptions {
    path: PathBuf,
    state: Mutex<GlobalOptions>,
}

impl ServerOptions {
    /// Load from the config file; missing file yields defaults.
    pub fn load(path: impl Into<PathBuf>) -> ServerResult<Self> {
        let path = path.into();
        let state = match fs::read_to_string(&path) {
            Ok(text) => parse_options(&text)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                GlobalOptions::with_defaults()
            }
            Err(err) => return Err(err.into()),
        };
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run a closure over the options under the lock.
    pub fn with<T>(&self, f: impl FnOnce(&GlobalOptions) -> T) -> T {
        f(&self.state.lock().unwrap())
    }

    /// Mutate the options under the lock.
    pub fn update<T>(&self, f: impl FnOnce(&mut GlobalOptions) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    /// Write the config file atomically.
    pub fn flush(&self) -> ServerResult<()> {
        let text = self.with(serialize_options);
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(text.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Master record
    // ------------------------------------------------------------------

    pub fn master(&self) -> Option<MasterRecord> {
        self.with(|o| o.master.clone())
    }

    /// Atomically replace the persisted master record.
    pub fn set_master(&self, record: MasterRecord) -> ServerResult<()> {
        self.update(|o| o.master = Some(record));
        self.flush()
    }

    pub fn clear_master(&self) -> ServerResult<()> {
        self.update(|o| o.master = None);
        self.flush()
    }

    /// This server's own identity UUID, generated and persisted on first use.
    pub fn server_uuid(&self) -> ServerResult<String> {
        if let Some(uuid) = self.with(|o| o.server_uuid.clone()) {
            return Ok(uuid);
        }
        let uuid = uuid::Uuid::new_v4().to_string();
        self.update(|o| o.server_uuid = Some(uuid.clone()));
        self.flush()?;
        Ok(uuid)
    }

    // ------------------------------------------------------------------
    // Maintenance windows
    // ------------------------------------------------------------------

    pub fn maintenance_add(&self, mut window: MaintenanceWindow) -> u32 {
        self.update(|o| {
            o.next_maintenance_id += 1;
            window.id = o.next_maintenance_id;
            let id = window.id;
            o.maintenance.push(window);
            id
        })
    }

    pub fn maintenance_remove(&self, id: u32) -> ServerResult<()> {
        self.update(|o| {
            let before = o.maintenance.len();
            o.maintenance.retain(|w| w.id != id);
            if o.maintenance.len() == before {
                Err(ServerError::MaintenanceIdNotFound(id))
            } else {
                Ok(())
            }
        })
    }

    pub fn maintenance_list(&self) -> Vec<MaintenanceWindow> {
        self.with(|o| o.maintenance.clone())
    }

    /// True when index maintenance may run at `now`: inside any configured
    /// window, or always when none is configured.
    pub fn is_maintenance_time(&self, now: DateTime<Utc>) -> bool {
        self.with(|o| {
            o.maintenance.is_empty() || o.maintenance.iter().any(|w| w.contains(now))
        })
    }

    // ------------------------------------------------------------------
    // Typed option table for serverOptionGet/Set
    // ------------------------------------------------------------------

    pub fn option_get(&self, name: &str) -> ServerResult<String> {
        self.with(|o| {
            let value = match name {
                "password-hash" => o.password_hash.clone().unwrap_or_default(),
                "max-connections" => o.max_connections.to_string(),
                "tls-ca-file" => path_text(&o.tls_ca_file),
                "tls-cert-file" => path_text(&o.tls_cert_file),
                "tls-key-file" => path_text(&o.tls_key_file),
                "crypt-password" => o.crypt_password.clone().unwrap_or_default(),
                "index-auto-keep-time" => o.index_auto_keep_seconds.to_string(),
                "remote-port" => {
                    return Err(ServerError::DeprecatedOrIgnoredValue(name.to_string()))
                }
                _ => return Err(ServerError::UnknownValue(name.to_string())),
            };
            Ok(value)
        })
    }

    pub fn option_set(&self, name: &str, value: &str) -> ServerResult<()> {
        let invalid = || ServerError::InvalidValue {
            name: name.to_string(),
            value: value.to_string(),
        };
        self.update(|o| {
            match name {
                "password-hash" => {
                    o.password_hash = (!value.is_empty()).then(|| value.to_string())
                }
                "max-connections" => {
                    let parsed: u32 = value.parse().map_err(|_| invalid())?;
                    if parsed == 0 {
                        return Err(invalid());
                    }
                    o.max_connections = parsed;
                }
                "tls-ca-file" => o.tls_ca_file = path_value(value),
                "tls-cert-file" => o.tls_cert_file = path_value(value),
                "tls-key-file" => o.tls_key_file = path_value(value),
                "crypt-password" => {
                    o.crypt_password = (!value.is_empty()).then(|| value.to_string())
                }
                "index-auto-keep-time" => {
                    o.index_auto_keep_seconds = value.parse().map_err(|_| invalid())?
                }
                "remote-port" => {
                    return Err(ServerError::DeprecatedOrIgnoredValue(name.to_string()))
                }
                _ => return Err(ServerError::UnknownValue(name.to_string())),
            }
            Ok(())
        })
    }
}

fn path_text(path: &Option<PathBuf>) -> String {
    path.as_ref()
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn path_value(value: &str) -> Option<PathBuf> {
    (!value.is_empty()).then(|| PathBuf::from(value))
}

// ============================================================================
// Persistence
// ============================================================================

fn serialize_options(options: &GlobalOptions) -> String {
    let mut out = String::new();
    let mut line = |key: &str, value: String| {
        if !value.is_empty() {
            out.push_str(&format!("{key} = {value}\n"));
        }
    };

    line(
        "password-hash",
        options.password_hash.clone().unwrap_or_default(),
    );
    line("max-connections", options.max_connections.to_string());
    line("tls-ca-file", path_text(&options.tls_ca_file));
    line("tls-cert-file", path_text(&options.tls_cert_file));
    line("tls-key-file", path_text(&options.tls_key_file));
    line(
        "crypt-password",
        options.crypt_password.clone().unwrap_or_default(),
    );
    line(
        "index-auto-keep-time",
        options.index_auto_keep_seconds.to_string(),
    );
    line(
        "server-uuid",
        options.server_uuid.clone().unwrap_or_default(),
    );
    if let Some(master) = &options.master {
        line("master-name", master.name.clone());
        line("master-uuid-hash", master.uuid_hash.clone());
    }
    drop(line);

    for window in &options.maintenance {
        out.push_str(&format!("\n[maintenance {}]\n", window.id));
        out.push_str(&format!("date = {}\n", window.date.format()));
        out.push_str(&format!("weekdays = {}\n", window.week_days.format()));
        out.push_str(&format!(
            "begin = {:02}:{:02}\n",
            window.begin_hour, window.begin_minute
        ));
        out.push_str(&format!(
            "end = {:02}:{:02}\n",
            window.end_hour, window.end_minute
        ));
    }
    out
}

fn parse_options(text: &str) -> ServerResult<GlobalOptions> {
    let mut options = GlobalOptions::with_defaults();
    let mut window: Option<MaintenanceWindow> = None;
    let mut master_name = String::new();
    let mut master_hash = String::new();

    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(header) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            if let Some(window) = window.take() {
                options.next_maintenance_id = options.next_maintenance_id.max(window.id);
                options.maintenance.push(window);
            }
            let mut parts = header.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some("maintenance"), id_text) => {
                    let id = id_text
                        .map(|t| {
                            t.parse()
                                .map_err(|_| ServerError::ParseMaintenance(header.to_string()))
                        })
                        .transpose()?
                        .unwrap_or(0);
                    window = Some(MaintenanceWindow {
                        id,
                        date: ScheduleDate::ANY,
                        week_days: WeekDaySet::ANY,
                        begin_hour: 0,
                        begin_minute: 0,
                        end_hour: 23,
                        end_minute: 59,
                    });
                }
                _ => return Err(ServerError::UnknownValue(header.to_string())),
            }
            continue;
        }

        let (key, value) = line
            .split_once('=')
            .map(|(k, v)| (k.trim(), v.trim()))
            .ok_or_else(|| ServerError::InvalidValue {
                name: line.to_string(),
                value: String::new(),
            })?;

        if let Some(window) = &mut window {
            match key {
                "date" => window.date = ScheduleDate::parse(value)?,
                "weekdays" => window.week_days = WeekDaySet::parse(value)?,
                "begin" => {
                    (window.begin_hour, window.begin_minute) =
                        MaintenanceWindow::parse_time(value)?
                }
                "end" => {
                    (window.end_hour, window.end_minute) = MaintenanceWindow::parse_time(value)?
                }
                _ => debug!(key, "ignoring unknown maintenance entry"),
            }
            continue;
        }

        match key {
            "password-hash" => options.password_hash = Some(value.to_string()),
            "max-connections" => {
                options.max_connections = value.parse().map_err(|_| ServerError::InvalidValue {
                    name: key.to_string(),
                    value: value.to_string(),
                })?
            }
            "tls-ca-file" => options.tls_ca_file = path_value(value),
            "tls-cert-file" => options.tls_cert_file = path_value(value),
            "tls-key-file" => options.tls_key_file = path_value(value),
            "crypt-password" => options.crypt_password = Some(value.to_string()),
            "index-auto-keep-time" => {
                options.index_auto_keep_seconds =
                    value.parse().map_err(|_| ServerError::InvalidValue {
                        name: key.to_string(),
                        value: value.to_string(),
                    })?
            }
            "server-uuid" => options.server_uuid = Some(value.to_string()),
            "master-name" => master_name = value.to_string(),
            "master-uuid-hash" => master_hash = value.to_string(),
            _ => debug!(key, "ignoring unknown server option"),
        }
    }

    if let Some(window) = window.take() {
        options.next_maintenance_id = options.next_maintenance_id.max(window.id);
        options.maintenance.push(window);
    }
    if !master_name.is_empty() && !master_hash.is_empty() {
        options.master = Some(MasterRecord {
            name: master_name,
            uuid_hash: master_hash,
        });
    }
    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn temp_options() -> (tempfile::TempDir, ServerOptions) {
        let dir = tempfile::tempdir().unwrap();
        let options = ServerOptions::load(dir.path().join("server.conf")).unwrap();
        (dir, options)
    }

    #[test]
    fn test_flush_and_reload_round_trip() {
        let (dir, options) = temp_options();
        options.option_set("max-connections", "16").unwrap();
        options.option_set("crypt-password", "s3cret").unwrap();
        options
            .set_master(MasterRecord {
                name: "M1".to_string(),
                uuid_hash: "abc123".to_string(),
            })
            .unwrap();
        options.maintenance_add(MaintenanceWindow {
            id: 0,
            date: ScheduleDate::ANY,
            week_days: WeekDaySet::parse("Sat,Sun").unwrap(),
            begin_hour: 22,
            begin_minute: 0,
            end_hour: 6,
            end_minute: 0,
        });
        options.flush().unwrap();

        let reloaded = ServerOptions::load(dir.path().join("server.conf")).unwrap();
        assert_eq!(reloaded.option_get("max-connections").unwrap(), "16");
        assert_eq!(reloaded.option_get("crypt-password").unwrap(), "s3cret");
        assert_eq!(reloaded.master().unwrap().name, "M1");
        assert_eq!(reloaded.maintenance_list().len(), 1);
    }

    #[test]
    fn test_option_unknown_and_deprecated() {
        let (_dir, options) = temp_options();
        assert!(matches!(
            options.option_get("bogus"),
            Err(ServerError::UnknownValue(_))
        ));
        assert!(matches!(
            options.option_set("remote-port", "9999"),
            Err(ServerError::DeprecatedOrIgnoredValue(_))
        ));
    }

    #[test]
    fn test_option_rejects_zero_connections() {
        let (_dir, options) = temp_options();
        assert!(options.option_set("max-connections", "0").is_err());
    }

    #[test]
    fn test_maintenance_time_no_windows_means_always() {
        let (_dir, options) = temp_options();
        assert!(options.is_maintenance_time(utc(2024, 6, 1, 12, 0)));
    }

    #[test]
    fn test_maintenance_window_spanning_midnight() {
        let (_dir, options) = temp_options();
        options.maintenance_add(MaintenanceWindow {
            id: 0,
            date: ScheduleDate::ANY,
            week_days: WeekDaySet::ANY,
            begin_hour: 22,
            begin_minute: 0,
            end_hour: 6,
            end_minute: 0,
        });

        assert!(options.is_maintenance_time(utc(2024, 6, 1, 23, 30)));
        assert!(options.is_maintenance_time(utc(2024, 6, 2, 5, 59)));
        assert!(!options.is_maintenance_time(utc(2024, 6, 1, 12, 0)));
    }

    #[test]
    fn test_clear_master() {
        let (_dir, options) = temp_options();
        options
            .set_master(MasterRecord {
                name: "M1".to_string(),
                uuid_hash: "h".to_string(),
            })
            .unwrap();
        assert!(options.master().is_some());
        options.clear_master().unwrap();
        assert!(options.master().is_none());
    }

    #[test]
    fn test_maintenance_remove_unknown_id() {
        let (_dir, options) = temp_options();
        assert!(matches!(
            options.maintenance_remove(42),
            Err(ServerError::MaintenanceIdNotFound(42))
        ));
    }
}
