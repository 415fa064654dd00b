//! Credential crypto: password hashing, master identity hashing, and the
//! per-session RSA key used for `encryptType=RSA` authorization.

use std::fmt;
use std::str::FromStr;

use base64::prelude::{Engine as _, BASE64_STANDARD};
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

use crate::common::error::{ServerError, ServerResult};

/// How a credential blob on the wire is protected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptType {
    /// Base64 of the plain credential. Only acceptable over TLS.
    None,
    /// PKCS#1 v1.5 encryption against the advertised session key.
    Rsa,
}

impl fmt::Display for EncryptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncryptType::None => write!(f, "NONE"),
            EncryptType::Rsa => write!(f, "RSA"),
        }
    }
}

impl FromStr for EncryptType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NONE" => Ok(EncryptType::None),
            "RSA" => Ok(EncryptType::Rsa),
            other => Err(format!("unknown encrypt type '{other}'")),
        }
    }
}

/// Hex SHA-256 of a password, the stored form compared at authorize time.
pub fn password_hash(password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    hex(&hasher.finalize())
}

/// Master identity hash: `SHA-256(machineId || masterUUID)`.
pub fn master_uuid_hash(machine_id: &str, master_uuid: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(machine_id.as_bytes());
    hasher.update(master_uuid.as_bytes());
    hex(&hasher.finalize())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// The per-session RSA keypair advertised to connecting peers.
pub struct SessionKey {
    private: RsaPrivateKey,
    public: RsaPublicKey,
}

const SESSION_KEY_BITS: usize = 2048;

impl SessionKey {
    /// Generate a fresh keypair. Done once per client session.
    pub fn generate() -> ServerResult<Self> {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, SESSION_KEY_BITS)
            .map_err(|_| ServerError::InsufficientMemory)?;
        let public = RsaPublicKey::from(&private);
        Ok(Self { private, public })
    }

    /// Hex modulus for the session greeting.
    pub fn modulus_hex(&self) -> String {
        use rsa::traits::PublicKeyParts;
        format!("{:x}", self.public.n())
    }

    /// Hex public exponent for the session greeting.
    pub fn exponent_hex(&self) -> String {
        use rsa::traits::PublicKeyParts;
        format!("{:x}", self.public.e())
    }

    /// Decode a credential blob: base64-unwrap, then RSA-decrypt when the
    /// peer chose `encryptType=RSA`.
    pub fn decrypt(&self, encrypt_type: EncryptType, blob: &str) -> ServerResult<String> {
        let raw = BASE64_STANDARD
            .decode(blob.trim())
            .map_err(|_| ServerError::InvalidPassword)?;

        let plain = match encrypt_type {
            EncryptType::None => raw,
            EncryptType::Rsa => self
                .private
                .decrypt(Pkcs1v15Encrypt, &raw)
                .map_err(|_| ServerError::InvalidPassword)?,
        };

        String::from_utf8(plain).map_err(|_| ServerError::InvalidPassword)
    }

    /// Encrypt a credential toward a peer key (used by the slave connector
    /// when authorizing against a remote server).
    pub fn encrypt_for(
        modulus_hex: &str,
        exponent_hex: &str,
        plain: &str,
    ) -> ServerResult<String> {
        use rsa::BigUint;

        let n = BigUint::parse_bytes(modulus_hex.as_bytes(), 16)
            .ok_or(ServerError::InvalidPassword)?;
        let e = BigUint::parse_bytes(exponent_hex.as_bytes(), 16)
            .ok_or(ServerError::InvalidPassword)?;
        let public = RsaPublicKey::new(n, e).map_err(|_| ServerError::InvalidPassword)?;

        let mut rng = rand::thread_rng();
        let cipher = public
            .encrypt(&mut rng, Pkcs1v15Encrypt, plain.as_bytes())
            .map_err(|_| ServerError::InvalidPassword)?;
        Ok(BASE64_STANDARD.encode(cipher))
    }
}
