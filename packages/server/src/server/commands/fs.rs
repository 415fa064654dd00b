//! Filesystem browsing commands.
//!
//! With a `jobUUID` of a remote job these are forwarded to the slave by the
//! dispatcher; the handlers below always operate on the local filesystem.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use wireline::ValueMap;

use crate::common::error::{ServerError, ServerResult};
use crate::server::dispatcher::CommandContext;

const NO_BACKUP_MARKER: &str = ".nobackup";

fn timestamp(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn file_type_name(meta: &std::fs::Metadata) -> &'static str {
    if meta.is_dir() {
        "DIRECTORY"
    } else if meta.is_symlink() {
        "LINK"
    } else if meta.is_file() {
        "FILE"
    } else {
        "SPECIAL"
    }
}

/// `deviceList` — mounted devices.
pub async fn device_list(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let mounts = tokio::fs::read_to_string("/proc/mounts")
        .await
        .unwrap_or_default();
    for line in mounts.lines() {
        let mut parts = line.split_whitespace();
        let (Some(device), Some(mount_point)) = (parts.next(), parts.next()) else {
            continue;
        };
        if !device.starts_with("/dev/") {
            continue;
        }
        ctx.sink.row(
            ValueMap::new()
                .with("name", device)
                .with("mountPoint", mount_point)
                .with("mounted", "yes"),
        );
    }
    Ok(ValueMap::new())
}

/// `rootList` — filesystem roots.
pub async fn root_list(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    ctx.sink.row(ValueMap::new().with("name", "/"));
    Ok(ValueMap::new())
}

/// `fileInfo name=<path>`.
pub async fn file_info(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let name = ctx.args.get_str("name")?;
    let meta = tokio::fs::symlink_metadata(name)
        .await
        .map_err(|_| ServerError::EntryNotFound(name.to_string()))?;

    let no_backup = Path::new(name)
        .parent()
        .map(|dir| dir.join(NO_BACKUP_MARKER).exists())
        .unwrap_or(false);

    Ok(ValueMap::new()
        .with("fileType", file_type_name(&meta))
        .with("name", name)
        .with("size", meta.len())
        .with("dateTime", timestamp(&meta))
        .with("noBackup", if no_backup { "yes" } else { "no" })
        .with("noDump", "no"))
}

/// `fileList directory=<path>` — stream directory entries.
pub async fn file_list(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let directory = ctx.args.get_str("directory")?;
    let mut entries = tokio::fs::read_dir(directory)
        .await
        .map_err(|_| ServerError::EntryNotFound(directory.to_string()))?;

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(ServerError::from)?
    {
        ctx.check_aborted()?;
        let Ok(meta) = entry.metadata().await else {
            continue;
        };
        ctx.sink.row(
            ValueMap::new()
                .with("fileType", file_type_name(&meta))
                .with("name", entry.path().to_string_lossy())
                .with("size", meta.len())
                .with("dateTime", timestamp(&meta)),
        );
    }
    Ok(ValueMap::new())
}

fn attribute_marker(ctx: &CommandContext) -> ServerResult<(String, PathBuf)> {
    let name = ctx.args.get_str("name")?.to_string();
    let attribute = ctx.args.get_str("attribute")?.to_ascii_uppercase();
    match attribute.as_str() {
        "NOBACKUP" => {
            let path = Path::new(&name);
            let dir = if path.is_dir() {
                path.to_path_buf()
            } else {
                path.parent().map(Path::to_path_buf).unwrap_or_default()
            };
            Ok((name, dir.join(NO_BACKUP_MARKER)))
        }
        // The no-dump file attribute needs chattr support.
        "NODUMP" => Err(ServerError::FunctionNotSupported),
        _ => Err(ServerError::UnknownValue(attribute.clone())),
    }
}

/// `fileAttributeGet name=<path> attribute=NOBACKUP|NODUMP`.
pub async fn file_attribute_get(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let (_, marker) = attribute_marker(&ctx)?;
    Ok(ValueMap::new().with("value", if marker.exists() { "yes" } else { "no" }))
}

/// `fileAttributeSet name=<path> attribute=…`.
pub async fn file_attribute_set(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let (_, marker) = attribute_marker(&ctx)?;
    tokio::fs::write(&marker, b"")
        .await
        .map_err(ServerError::from)?;
    Ok(ValueMap::new())
}

/// `fileAttributeClear name=<path> attribute=…`.
pub async fn file_attribute_clear(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let (_, marker) = attribute_marker(&ctx)?;
    match tokio::fs::remove_file(&marker).await {
        Ok(()) => Ok(ValueMap::new()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(ValueMap::new()),
        Err(err) => Err(err.into()),
    }
}

/// `fileMkdir name=<path>`.
pub async fn file_mkdir(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let name = ctx.args.get_str("name")?;
    tokio::fs::create_dir_all(name)
        .await
        .map_err(ServerError::from)?;
    Ok(ValueMap::new())
}

/// `fileDelete name=<path>`.
pub async fn file_delete(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let name = ctx.args.get_str("name")?;
    let meta = tokio::fs::symlink_metadata(name)
        .await
        .map_err(|_| ServerError::EntryNotFound(name.to_string()))?;
    if meta.is_dir() {
        tokio::fs::remove_dir_all(name).await.map_err(ServerError::from)?;
    } else {
        tokio::fs::remove_file(name).await.map_err(ServerError::from)?;
    }
    Ok(ValueMap::new())
}

/// `directoryInfo name=<path> timeout=<s>` — cumulative count and size,
/// cached per session, bounded by the timeout.
pub async fn directory_info(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let name = ctx.args.get_str("name")?.to_string();
    let timeout: u64 = ctx.args.get_or("timeout", 5)?;

    if let Some((count, size)) = ctx
        .session
        .selections
        .lock()
        .unwrap()
        .directory_info_cache
        .get(&name)
        .copied()
    {
        return Ok(ValueMap::new()
            .with("count", count)
            .with("size", size)
            .with("timedOut", "no"));
    }

    let deadline = Instant::now() + Duration::from_secs(timeout);
    let mut count: u64 = 0;
    let mut size: u64 = 0;
    let mut timed_out = false;
    let mut pending = vec![PathBuf::from(&name)];

    while let Some(dir) = pending.pop() {
        if Instant::now() >= deadline {
            timed_out = true;
            break;
        }
        ctx.check_aborted()?;

        let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
            continue;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            count += 1;
            if meta.is_dir() {
                pending.push(entry.path());
            } else {
                size += meta.len();
            }
        }
    }

    if !timed_out {
        ctx.session
            .selections
            .lock()
            .unwrap()
            .directory_info_cache
            .insert(name, (count, size));
    }
    Ok(ValueMap::new()
        .with("count", count)
        .with("size", size)
        .with("timedOut", if timed_out { "yes" } else { "no" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::ServerMode;
    use crate::kernel::clients::Authorization;
    use crate::kernel::test_dependencies::TestDependencies;
    use crate::server::dispatcher::Dispatcher;
    use crate::server::session::SessionState;
    use chrono::Utc;
    use tokio::sync::mpsc;
    use wireline::{CommandFrame, ResultFrame};

    async fn run_collect(
        deps: &TestDependencies,
        name: &str,
        args: ValueMap,
    ) -> (ResultFrame, Vec<ResultFrame>) {
        let handle = deps.kernel.clients.register("c", Utc::now());
        handle.set_authorization(Authorization::Client);
        let session = SessionState::new(handle, "c", false).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let terminal = Dispatcher::new()
            .execute(
                deps.kernel.clone(),
                session,
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

    #[tokio::test]
    async fn test_file_list_and_info() {
        let deps = TestDependencies::new(ServerMode::Master);
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let (terminal, rows) = run_collect(
            &deps,
            "fileList",
            ValueMap::new().with("directory", dir.path().to_string_lossy()),
        )
        .await;
        assert!(terminal.code.is_ok());
        assert_eq!(rows.len(), 2);

        let (info, _) = run_collect(
            &deps,
            "fileInfo",
            ValueMap::new().with("name", dir.path().join("a.txt").to_string_lossy()),
        )
        .await;
        assert!(info.code.is_ok());
        assert_eq!(info.data.get_str("fileType").unwrap(), "FILE");
        assert_eq!(info.data.get::<u64>("size").unwrap(), 5);
    }

    #[tokio::test]
    async fn test_no_backup_attribute_round_trip() {
        let deps = TestDependencies::new(ServerMode::Master);
        let dir = tempfile::tempdir().unwrap();
        let args = || {
            ValueMap::new()
                .with("name", dir.path().to_string_lossy())
                .with("attribute", "NOBACKUP")
        };

        let (reply, _) = run_collect(&deps, "fileAttributeGet", args()).await;
        assert_eq!(reply.data.get_str("value").unwrap(), "no");

        let (reply, _) = run_collect(&deps, "fileAttributeSet", args()).await;
        assert!(reply.code.is_ok());
        let (reply, _) = run_collect(&deps, "fileAttributeGet", args()).await;
        assert_eq!(reply.data.get_str("value").unwrap(), "yes");

        let (reply, _) = run_collect(&deps, "fileAttributeClear", args()).await;
        assert!(reply.code.is_ok());
        let (reply, _) = run_collect(&deps, "fileAttributeGet", args()).await;
        assert_eq!(reply.data.get_str("value").unwrap(), "no");
    }

    #[tokio::test]
    async fn test_mkdir_delete() {
        let deps = TestDependencies::new(ServerMode::Master);
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("x/y");

        let (reply, _) = run_collect(
            &deps,
            "fileMkdir",
            ValueMap::new().with("name", target.to_string_lossy()),
        )
        .await;
        assert!(reply.code.is_ok());
        assert!(target.is_dir());

        let (reply, _) = run_collect(
            &deps,
            "fileDelete",
            ValueMap::new().with("name", target.to_string_lossy()),
        )
        .await;
        assert!(reply.code.is_ok());
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn test_directory_info_counts() {
        let deps = TestDependencies::new(ServerMode::Master);
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"12345").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/b"), b"123").unwrap();

        let (reply, _) = run_collect(
            &deps,
            "directoryInfo",
            ValueMap::new()
                .with("name", dir.path().to_string_lossy())
                .with("timeout", 10),
        )
        .await;
        assert!(reply.code.is_ok());
        assert_eq!(reply.data.get::<u64>("count").unwrap(), 3);
        assert_eq!(reply.data.get::<u64>("size").unwrap(), 8);
    }
}
