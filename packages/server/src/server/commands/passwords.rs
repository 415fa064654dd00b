//! Password wallet and volume commands.

use std::sync::Arc;

use wireline::ValueMap;

use crate::common::auth::EncryptType;
use crate::common::error::{ServerError, ServerResult};
use crate::domains::job::running::VolumeRequest;
use crate::server::dispatcher::CommandContext;

fn decrypt_arg(ctx: &CommandContext, key: &str) -> ServerResult<String> {
    let encrypt_type: EncryptType = ctx.args.get("encryptType")?;
    let blob = ctx.args.get_str(key)?;
    ctx.session.session_key.decrypt(encrypt_type, blob)
}

/// `decryptPasswordAdd encryptType=… encryptedPassword=…` — add a candidate
/// password for archive decryption.
pub async fn decrypt_password_add(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let password = decrypt_arg(&ctx, "encryptedPassword")?;
    let mut wallet = ctx.session.passwords.lock().unwrap();
    if !wallet.decrypt.contains(&password) {
        wallet.decrypt.push(password);
    }
    Ok(ValueMap::new())
}

/// `ftpPassword encryptType=… encryptedPassword=…`.
pub async fn ftp_password(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let password = decrypt_arg(&ctx, "encryptedPassword")
        .map_err(|_| ServerError::InvalidFtpPassword)?;
    ctx.session.passwords.lock().unwrap().ftp = Some(password);
    Ok(ValueMap::new())
}

/// `sshPassword encryptType=… encryptedPassword=…`.
pub async fn ssh_password(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let password = decrypt_arg(&ctx, "encryptedPassword")
        .map_err(|_| ServerError::InvalidSshPassword)?;
    ctx.session.passwords.lock().unwrap().ssh = Some(password);
    Ok(ValueMap::new())
}

/// `webdavPassword encryptType=… encryptedPassword=…`.
pub async fn webdav_password(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let password = decrypt_arg(&ctx, "encryptedPassword")
        .map_err(|_| ServerError::InvalidWebdavPassword)?;
    ctx.session.passwords.lock().unwrap().webdav = Some(password);
    Ok(ValueMap::new())
}

/// `cryptPassword encryptType=… encryptedPassword=…`.
pub async fn crypt_password(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let password = decrypt_arg(&ctx, "encryptedPassword")
        .map_err(|_| ServerError::InvalidCryptPassword)?;
    ctx.session.passwords.lock().unwrap().crypt = Some(password);
    Ok(ValueMap::new())
}

/// `passwordsClear` — drop every session password.
pub async fn passwords_clear(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    ctx.session.passwords.lock().unwrap().clear();
    Ok(ValueMap::new())
}

/// `volumeLoad jobUUID=… volumeNumber=N` — answer a volume request.
pub async fn volume_load(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let uuid = super::jobs::job_uuid_arg(&ctx)?;
    let volume_number: u32 = ctx.args.get("volumeNumber")?;
    ctx.kernel
        .jobs
        .with_job_mut(uuid, move |job| {
            job.running_info.volume_request = VolumeRequest::Loaded { volume_number };
        })
        .await?;
    Ok(ValueMap::new())
}

/// `volumeUnload jobUUID=…`.
pub async fn volume_unload(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let uuid = super::jobs::job_uuid_arg(&ctx)?;
    ctx.kernel
        .jobs
        .with_job_mut(uuid, |job| {
            job.running_info.volume_request = VolumeRequest::Unload;
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
    use base64::prelude::{Engine as _, BASE64_STANDARD};
    use chrono::Utc;
    use tokio::sync::mpsc;
    use wireline::CommandFrame;

    #[tokio::test]
    async fn test_decrypt_password_add_deduplicates() {
        let deps = TestDependencies::new(ServerMode::Master);
        let handle = deps.kernel.clients.register("c", Utc::now());
        handle.set_authorization(Authorization::Client);
        let session = SessionState::new(handle, "c", false).unwrap();
        let dispatcher = Dispatcher::new();
        let (tx, _rx) = mpsc::unbounded_channel();

        for _ in 0..2 {
            let reply = dispatcher
                .execute(
                    deps.kernel.clone(),
                    session.clone(),
                    CommandFrame::with_args(
                        1,
                        "decryptPasswordAdd",
                        ValueMap::new()
                            .with("encryptType", "NONE")
                            .with("encryptedPassword", BASE64_STANDARD.encode("pw1")),
                    ),
                    tx.clone(),
                )
                .await;
            assert!(reply.code.is_ok());
        }
        assert_eq!(session.passwords.lock().unwrap().decrypt, vec!["pw1"]);
    }

    #[tokio::test]
    async fn test_volume_load_answers_request() {
        let deps = TestDependencies::new(ServerMode::Master);
        let handle = deps.kernel.clients.register("c", Utc::now());
        handle.set_authorization(Authorization::Client);
        let session = SessionState::new(handle, "c", false).unwrap();
        let dispatcher = Dispatcher::new();
        let (tx, _rx) = mpsc::unbounded_channel();

        let job = crate::domains::job::Job::new("j", Utc::now());
        let uuid = job.uuid;
        deps.kernel.jobs.write().await.unwrap().push(job);
        deps.kernel
            .jobs
            .with_job_mut(uuid, |j| {
                j.running_info.volume_request = VolumeRequest::Requested {
                    volume_number: 2,
                    message: "insert volume 2".to_string(),
                };
            })
            .await
            .unwrap();

        let reply = dispatcher
            .execute(
                deps.kernel.clone(),
                session,
                CommandFrame::with_args(
                    1,
                    "volumeLoad",
                    ValueMap::new().with("jobUUID", uuid).with("volumeNumber", 2),
                ),
                tx,
            )
            .await;
        assert!(reply.code.is_ok());

        let result = deps
            .kernel
            .jobs
            .with_job(uuid, |j| j.running_info.volume_result())
            .await
            .unwrap();
        assert_eq!(
            result,
            crate::domains::job::running::VolumeResult::Ok(2)
        );
    }
}
