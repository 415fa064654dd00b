// Authorization - session classification, fail history and back-off
//
// classify() decides Client/Master/Fail from the credentials a peer
// presents; the registry tracks per-client failure history and the
// quadratic penalty gating new attempts.

pub mod crypto;
pub mod registry;

use serde::{Deserialize, Serialize};

pub use crypto::{EncryptType, SessionKey};
pub use registry::{AuthorizationRegistry, Classification};

/// The persisted identity of the paired master (slave mode).
///
/// `uuid_hash` is `SHA-256(machineId || masterUUID)`; pairing is the only
/// way this record is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterRecord {
    pub name: String,
    pub uuid_hash: String,
}
