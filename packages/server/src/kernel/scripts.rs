//! Shell execution of pre/post scripts and mount handling.

use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::traits::{MountManager, ScriptRunner};
use crate::common::error::{ServerError, ServerResult};
use crate::kernel::runner::expand_text;

/// Runs scripts through `sh -c` after macro expansion.
pub struct ShellScriptRunner;

#[async_trait]
impl ScriptRunner for ShellScriptRunner {
    async fn run(&self, script: &str, macros: &HashMap<String, String>) -> ServerResult<()> {
        let expanded = expand_text(script, macros);
        debug!(script = %expanded, "running script");

        let status = Command::new("sh")
            .arg("-c")
            .arg(&expanded)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .status()
            .await
            .map_err(|e| ServerError::Failure(format!("cannot run script: {e}")))?;

        if status.success() {
            Ok(())
        } else {
            Err(ServerError::Failure(format!(
                "script exited with {}",
                status.code().unwrap_or(-1)
            )))
        }
    }
}

/// Mounts devices through the system `mount`/`umount` binaries.
pub struct SystemMountManager;

#[async_trait]
impl MountManager for SystemMountManager {
    async fn mount(&self, name: &str, device: &str) -> ServerResult<()> {
        let status = Command::new("mount")
            .arg(device)
            .arg(name)
            .status()
            .await
            .map_err(|e| ServerError::Failure(format!("cannot run mount: {e}")))?;
        if status.success() {
            Ok(())
        } else {
            Err(ServerError::Failure(format!(
                "mount {device} {name} failed"
            )))
        }
    }

    async fn unmount(&self, name: &str) -> ServerResult<()> {
        let status = Command::new("umount")
            .arg(name)
            .status()
            .await
            .map_err(|e| ServerError::Failure(format!("cannot run umount: {e}")))?;
        if status.success() {
            Ok(())
        } else {
            Err(ServerError::Failure(format!("umount {name} failed")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shell_runner_success_and_failure() {
        let runner = ShellScriptRunner;
        let macros = HashMap::new();
        assert!(runner.run("true", &macros).await.is_ok());
        assert!(runner.run("exit 3", &macros).await.is_err());
    }

    #[tokio::test]
    async fn test_shell_runner_expands_macros() {
        let runner = ShellScriptRunner;
        let mut macros = HashMap::new();
        macros.insert("name".to_string(), "ok".to_string());
        // `test` exits zero only when the expansion happened.
        assert!(runner.run("test %name = ok", &macros).await.is_ok());
    }
}
