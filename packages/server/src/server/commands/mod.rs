//! Command handlers, grouped by area, and the dispatch table binding every
//! wire command name to its authorization mask and handler.

pub mod bulk;
pub mod fs;
pub mod global;
pub mod index;
pub mod jobs;
pub mod master;
pub mod passwords;
pub mod session;
pub mod sublists;

use std::collections::HashMap;

use super::dispatcher::{auth, CommandDef};

macro_rules! cmd {
    ($table:ident, $name:literal, $mask:expr, $handler:path) => {
        $table.insert(
            $name,
            CommandDef {
                auth_mask: $mask,
                handler: |ctx| Box::pin($handler(ctx)),
                forward_remote: false,
            },
        );
    };
    ($table:ident, $name:literal, $mask:expr, $handler:path, forward) => {
        $table.insert(
            $name,
            CommandDef {
                auth_mask: $mask,
                handler: |ctx| Box::pin($handler(ctx)),
                forward_remote: true,
            },
        );
    };
}

/// Build the full dispatch table.
pub fn table() -> HashMap<&'static str, CommandDef> {
    let mut t: HashMap<&'static str, CommandDef> = HashMap::new();

    // Session
    cmd!(t, "startTLS", auth::ANY, session::start_tls);
    cmd!(t, "authorize", auth::ANY, session::authorize);
    cmd!(t, "version", auth::ANY, session::version);
    cmd!(t, "errorInfo", auth::ANY, session::error_info);
    cmd!(t, "quit", auth::AUTHORIZED, session::quit);
    cmd!(t, "actionResult", auth::AUTHORIZED, session::action_result);
    cmd!(t, "abort", auth::AUTHORIZED, session::abort);

    // Global
    cmd!(t, "status", auth::AUTHORIZED, global::status);
    cmd!(t, "pause", auth::AUTHORIZED, global::pause);
    cmd!(t, "suspend", auth::AUTHORIZED, global::suspend);
    cmd!(t, "continue", auth::AUTHORIZED, global::continue_);
    cmd!(t, "maintenanceList", auth::AUTHORIZED, global::maintenance_list);
    cmd!(t, "maintenanceAdd", auth::AUTHORIZED, global::maintenance_add);
    cmd!(t, "maintenanceRemove", auth::AUTHORIZED, global::maintenance_remove);
    cmd!(t, "serverOptionGet", auth::AUTHORIZED, global::server_option_get);
    cmd!(t, "serverOptionSet", auth::AUTHORIZED, global::server_option_set);
    cmd!(t, "serverOptionFlush", auth::AUTHORIZED, global::server_option_flush);

    // Master / pairing
    cmd!(t, "masterGet", auth::AUTHORIZED, master::master_get);
    cmd!(t, "masterClear", auth::AUTHORIZED, master::master_clear);
    cmd!(t, "masterPairingStart", auth::AUTHORIZED, master::pairing_start);
    cmd!(t, "masterPairingStop", auth::AUTHORIZED, master::pairing_stop);
    cmd!(t, "masterPairingStatus", auth::AUTHORIZED, master::pairing_status);

    // Filesystem
    cmd!(t, "deviceList", auth::AUTHORIZED, fs::device_list, forward);
    cmd!(t, "rootList", auth::AUTHORIZED, fs::root_list, forward);
    cmd!(t, "fileInfo", auth::AUTHORIZED, fs::file_info, forward);
    cmd!(t, "fileList", auth::AUTHORIZED, fs::file_list, forward);
    cmd!(t, "fileAttributeGet", auth::AUTHORIZED, fs::file_attribute_get, forward);
    cmd!(t, "fileAttributeSet", auth::AUTHORIZED, fs::file_attribute_set, forward);
    cmd!(t, "fileAttributeClear", auth::AUTHORIZED, fs::file_attribute_clear, forward);
    cmd!(t, "fileMkdir", auth::AUTHORIZED, fs::file_mkdir, forward);
    cmd!(t, "fileDelete", auth::AUTHORIZED, fs::file_delete, forward);
    cmd!(t, "directoryInfo", auth::AUTHORIZED, fs::directory_info, forward);

    // Jobs
    cmd!(t, "jobList", auth::AUTHORIZED, jobs::job_list);
    cmd!(t, "jobInfo", auth::AUTHORIZED, jobs::job_info);
    cmd!(t, "jobNew", auth::AUTHORIZED, jobs::job_new);
    cmd!(t, "jobClone", auth::AUTHORIZED, jobs::job_clone);
    cmd!(t, "jobRename", auth::AUTHORIZED, jobs::job_rename);
    cmd!(t, "jobDelete", auth::AUTHORIZED, jobs::job_delete);
    cmd!(t, "jobFlush", auth::AUTHORIZED, jobs::job_flush);
    cmd!(t, "jobStart", auth::AUTHORIZED, jobs::job_start);
    cmd!(t, "jobAbort", auth::AUTHORIZED, jobs::job_abort);
    cmd!(t, "jobReset", auth::AUTHORIZED, jobs::job_reset);
    cmd!(t, "jobStatus", auth::AUTHORIZED, jobs::job_status);
    cmd!(t, "jobOptionGet", auth::AUTHORIZED, jobs::job_option_get);
    cmd!(t, "jobOptionSet", auth::AUTHORIZED, jobs::job_option_set);
    cmd!(t, "jobOptionDelete", auth::AUTHORIZED, jobs::job_option_delete);

    // Job sub-lists
    cmd!(t, "includeList", auth::AUTHORIZED, sublists::include_list);
    cmd!(t, "includeListAdd", auth::AUTHORIZED, sublists::include_list_add);
    cmd!(t, "includeListUpdate", auth::AUTHORIZED, sublists::include_list_update);
    cmd!(t, "includeListRemove", auth::AUTHORIZED, sublists::include_list_remove);
    cmd!(t, "includeListClear", auth::AUTHORIZED, sublists::include_list_clear);
    cmd!(t, "excludeList", auth::AUTHORIZED, sublists::exclude_list);
    cmd!(t, "excludeListAdd", auth::AUTHORIZED, sublists::exclude_list_add);
    cmd!(t, "excludeListUpdate", auth::AUTHORIZED, sublists::exclude_list_update);
    cmd!(t, "excludeListRemove", auth::AUTHORIZED, sublists::exclude_list_remove);
    cmd!(t, "excludeListClear", auth::AUTHORIZED, sublists::exclude_list_clear);
    cmd!(t, "excludeCompressList", auth::AUTHORIZED, sublists::exclude_compress_list);
    cmd!(t, "excludeCompressListAdd", auth::AUTHORIZED, sublists::exclude_compress_list_add);
    cmd!(t, "excludeCompressListUpdate", auth::AUTHORIZED, sublists::exclude_compress_list_update);
    cmd!(t, "excludeCompressListRemove", auth::AUTHORIZED, sublists::exclude_compress_list_remove);
    cmd!(t, "excludeCompressListClear", auth::AUTHORIZED, sublists::exclude_compress_list_clear);
    cmd!(t, "mountList", auth::AUTHORIZED, sublists::mount_list);
    cmd!(t, "mountListAdd", auth::AUTHORIZED, sublists::mount_list_add);
    cmd!(t, "mountListUpdate", auth::AUTHORIZED, sublists::mount_list_update);
    cmd!(t, "mountListRemove", auth::AUTHORIZED, sublists::mount_list_remove);
    cmd!(t, "mountListClear", auth::AUTHORIZED, sublists::mount_list_clear);
    cmd!(t, "sourceList", auth::AUTHORIZED, sublists::source_list);
    cmd!(t, "sourceListAdd", auth::AUTHORIZED, sublists::source_list_add);
    cmd!(t, "sourceListUpdate", auth::AUTHORIZED, sublists::source_list_update);
    cmd!(t, "sourceListRemove", auth::AUTHORIZED, sublists::source_list_remove);
    cmd!(t, "sourceListClear", auth::AUTHORIZED, sublists::source_list_clear);
    cmd!(t, "scheduleList", auth::AUTHORIZED, sublists::schedule_list);
    cmd!(t, "scheduleListAdd", auth::AUTHORIZED, sublists::schedule_list_add);
    cmd!(t, "scheduleListUpdate", auth::AUTHORIZED, sublists::schedule_list_update);
    cmd!(t, "scheduleListRemove", auth::AUTHORIZED, sublists::schedule_list_remove);
    cmd!(t, "scheduleListClear", auth::AUTHORIZED, sublists::schedule_list_clear);
    cmd!(t, "scheduleOptionGet", auth::AUTHORIZED, sublists::schedule_option_get);
    cmd!(t, "scheduleOptionSet", auth::AUTHORIZED, sublists::schedule_option_set);
    cmd!(t, "scheduleTrigger", auth::AUTHORIZED, sublists::schedule_trigger);
    cmd!(t, "persistenceList", auth::AUTHORIZED, sublists::persistence_list);
    cmd!(t, "persistenceListAdd", auth::AUTHORIZED, sublists::persistence_list_add);
    cmd!(t, "persistenceListUpdate", auth::AUTHORIZED, sublists::persistence_list_update);
    cmd!(t, "persistenceListRemove", auth::AUTHORIZED, sublists::persistence_list_remove);
    cmd!(t, "persistenceListClear", auth::AUTHORIZED, sublists::persistence_list_clear);

    // Passwords & volumes
    cmd!(t, "decryptPasswordAdd", auth::AUTHORIZED, passwords::decrypt_password_add);
    cmd!(t, "ftpPassword", auth::AUTHORIZED, passwords::ftp_password);
    cmd!(t, "sshPassword", auth::AUTHORIZED, passwords::ssh_password);
    cmd!(t, "webdavPassword", auth::AUTHORIZED, passwords::webdav_password);
    cmd!(t, "cryptPassword", auth::AUTHORIZED, passwords::crypt_password);
    cmd!(t, "passwordsClear", auth::AUTHORIZED, passwords::passwords_clear);
    cmd!(t, "volumeLoad", auth::AUTHORIZED, passwords::volume_load);
    cmd!(t, "volumeUnload", auth::AUTHORIZED, passwords::volume_unload);

    // Archive / index
    cmd!(t, "archiveList", auth::AUTHORIZED, index::archive_list);
    cmd!(t, "indexInfo", auth::AUTHORIZED, index::index_info);
    cmd!(t, "indexUUIDList", auth::AUTHORIZED, index::index_uuid_list);
    cmd!(t, "indexEntityList", auth::AUTHORIZED, index::index_entity_list);
    cmd!(t, "indexEntityAdd", auth::AUTHORIZED, index::index_entity_add);
    cmd!(t, "indexStorageList", auth::AUTHORIZED, index::index_storage_list);
    cmd!(t, "indexStorageListAdd", auth::AUTHORIZED, index::index_storage_list_add);
    cmd!(t, "indexStorageListRemove", auth::AUTHORIZED, index::index_storage_list_remove);
    cmd!(t, "indexStorageListClear", auth::AUTHORIZED, index::index_storage_list_clear);
    cmd!(t, "indexStorageListInfo", auth::AUTHORIZED, index::index_storage_list_info);
    cmd!(t, "indexStorageInfo", auth::AUTHORIZED, index::index_storage_info);
    cmd!(t, "indexStorageAdd", auth::AUTHORIZED, index::index_storage_add);
    cmd!(t, "indexStorageRemove", auth::AUTHORIZED, index::index_storage_remove);
    cmd!(t, "indexEntryList", auth::AUTHORIZED, index::index_entry_list);
    cmd!(t, "indexEntryListAdd", auth::AUTHORIZED, index::index_entry_list_add);
    cmd!(t, "indexEntryListRemove", auth::AUTHORIZED, index::index_entry_list_remove);
    cmd!(t, "indexEntryListClear", auth::AUTHORIZED, index::index_entry_list_clear);
    cmd!(t, "indexEntryListInfo", auth::AUTHORIZED, index::index_entry_list_info);
    cmd!(t, "indexEntryFragmentList", auth::AUTHORIZED, index::index_entry_fragment_list);
    cmd!(t, "indexHistoryList", auth::AUTHORIZED, index::index_history_list);
    cmd!(t, "indexAssign", auth::AUTHORIZED, index::index_assign);
    cmd!(t, "indexRefresh", auth::AUTHORIZED, index::index_refresh);
    cmd!(t, "indexRemove", auth::AUTHORIZED, index::index_remove);

    // Bulk operations
    cmd!(t, "entityMoveTo", auth::AUTHORIZED, bulk::entity_move_to);
    cmd!(t, "storageTest", auth::AUTHORIZED, bulk::storage_test);
    cmd!(t, "storageDelete", auth::AUTHORIZED, bulk::storage_delete);
    cmd!(t, "restore", auth::AUTHORIZED, bulk::restore);
    // Remote create, driven by a master over the control channel.
    cmd!(t, "create", auth::MASTER, bulk::create);

    t
}
