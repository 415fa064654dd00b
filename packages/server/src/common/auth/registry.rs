//! Authorization registry: classification plus per-client fail history.
//!
//! Failed attempts cost the client a quadratic penalty before the next
//! attempt is served: `min(count² · basePenalty, maxPenalty)`. Records age
//! out after a keep time, and the list is capped; the oldest record without
//! a live session is evicted first.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::crypto::{self, EncryptType, SessionKey};
use super::MasterRecord;
use crate::common::error::{ServerError, ServerResult};
use crate::common::types::ServerMode;

const BASE_PENALTY_MS: u64 = 500;
const MAX_PENALTY_MS: u64 = 30_000;
const MAX_HISTORY_KEEP_MS: i64 = 3_600_000;
const MAX_RECORDS: usize = 64;

/// Result of a successful classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// Password authorization: a regular client.
    Client,
    /// UUID authorization: a master. Carries the computed identity hash so
    /// pairing can capture it.
    Master { name: String, uuid_hash: String },
}

/// Credentials presented by `authorize`.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub encrypt_type: Option<EncryptType>,
    pub encrypted_password: Option<String>,
    pub name: Option<String>,
    pub encrypted_uuid: Option<String>,
}

/// Server-side context needed to verify credentials.
pub struct AuthContext<'a> {
    pub session_key: &'a SessionKey,
    pub stored_password_hash: Option<&'a str>,
    pub machine_id: &'a str,
    pub paired_master: Option<&'a MasterRecord>,
    pub mode: ServerMode,
    /// When a pairing request is in flight the identity hash is captured
    /// instead of verified.
    pub pairing_active: bool,
}

#[derive(Debug, Clone)]
struct FailRecord {
    client_name: String,
    count: u32,
    last_fail: DateTime<Utc>,
}

/// Per-client fail history with quadratic back-off.
#[derive(Default)]
pub struct AuthorizationRegistry {
    records: Mutex<Vec<FailRecord>>,
}

impl AuthorizationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Verify the presented credentials.
    ///
    /// Does not touch the fail history; callers record the outcome with
    /// [`on_success`](Self::on_success) / [`on_failure`](Self::on_failure).
    pub fn classify(
        &self,
        creds: &Credentials,
        ctx: &AuthContext<'_>,
    ) -> ServerResult<Classification> {
        let encrypt_type = creds
            .encrypt_type
            .ok_or_else(|| ServerError::ExpectedParameter("encryptType".to_string()))?;

        if let Some(encrypted_uuid) = &creds.encrypted_uuid {
            // Master identity: only a slave accepts masters.
            if ctx.mode != ServerMode::Slave {
                return Err(ServerError::NotASlave);
            }
            let name = creds
                .name
                .clone()
                .ok_or_else(|| ServerError::ExpectedParameter("name".to_string()))?;

            let master_uuid = ctx.session_key.decrypt(encrypt_type, encrypted_uuid)?;
            let uuid_hash = crypto::master_uuid_hash(ctx.machine_id, &master_uuid);

            if ctx.pairing_active {
                return Ok(Classification::Master { name, uuid_hash });
            }

            match ctx.paired_master {
                Some(master) if master.uuid_hash == uuid_hash => {
                    Ok(Classification::Master { name, uuid_hash })
                }
                _ => Err(ServerError::NotPaired),
            }
        } else if let Some(encrypted_password) = &creds.encrypted_password {
            let stored = ctx
                .stored_password_hash
                .ok_or(ServerError::InvalidPassword)?;
            let password = ctx.session_key.decrypt(encrypt_type, encrypted_password)?;
            if crypto::password_hash(&password) == stored {
                Ok(Classification::Client)
            } else {
                Err(ServerError::InvalidPassword)
            }
        } else {
            Err(ServerError::ExpectedParameter("encryptedPassword".to_string()))
        }
    }

    /// Clear the fail record for a client after successful authorization.
    pub fn on_success(&self, client_name: &str) {
        let mut records = self.records.lock().unwrap();
        records.retain(|r| r.client_name != client_name);
    }

    /// Record a failed attempt at `now`.
    pub fn on_failure(&self, client_name: &str, now: DateTime<Utc>) {
        let mut records = self.records.lock().unwrap();
        if let Some(record) = records.iter_mut().find(|r| r.client_name == client_name) {
            record.count += 1;
            record.last_fail = now;
        } else {
            records.push(FailRecord {
                client_name: client_name.to_string(),
                count: 1,
                last_fail: now,
            });
        }
    }

    /// Remaining back-off before a client may be served again. Zero when
    /// there is no fail history or the penalty already elapsed.
    pub fn wait_penalty(&self, client_name: &str, now: DateTime<Utc>) -> Duration {
        let records = self.records.lock().unwrap();
        let Some(record) = records.iter().find(|r| r.client_name == client_name) else {
            return Duration::ZERO;
        };

        let penalty_ms = penalty_ms(record.count);
        let elapsed_ms = (now - record.last_fail).num_milliseconds().max(0) as u64;
        Duration::from_millis(penalty_ms.saturating_sub(elapsed_ms))
    }

    /// Drop records idle past the keep time (unless the client still has a
    /// live session) and enforce the capacity cap.
    pub fn prune(&self, now: DateTime<Utc>, live_clients: &HashSet<String>) {
        let mut records = self.records.lock().unwrap();
        records.retain(|r| {
            live_clients.contains(&r.client_name)
                || (now - r.last_fail).num_milliseconds() < MAX_HISTORY_KEEP_MS
        });

        while records.len() > MAX_RECORDS {
            // Evict the oldest record with no live session; when every
            // record has a session, the oldest overall goes.
            let victim = records
                .iter()
                .enumerate()
                .filter(|(_, r)| !live_clients.contains(&r.client_name))
                .min_by_key(|(_, r)| r.last_fail)
                .map(|(i, _)| i)
                .or_else(|| {
                    records
                        .iter()
                        .enumerate()
                        .min_by_key(|(_, r)| r.last_fail)
                        .map(|(i, _)| i)
                });
            match victim {
                Some(index) => {
                    records.remove(index);
                }
                None => break,
            }
        }
    }

    /// Number of tracked fail records.
    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn penalty_ms(count: u32) -> u64 {
    let quadratic = (count as u64).saturating_mul(count as u64) * BASE_PENALTY_MS;
    quadratic.min(MAX_PENALTY_MS)
}
