use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Fixed prefix on every minted secret so operators can recognise one in a paste buffer.
pub const SECRET_PREFIX: &str = "llmc_";

/// Random bytes behind each secret (256 bits).
const SECRET_BYTES: usize = 32;

/// Length of the non-secret slice kept for listings.
const DISPLAY_PREFIX_LEN: usize = 12;

/// One issued secret, as held by the settings store. The raw secret is never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    pub secret_hash: String,
    #[serde(default)]
    pub secret_prefix: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

fn default_active() -> bool {
    true
}

impl Credential {
    /// Mint a new credential. Returns the record to store and the raw secret,
    /// which must be shown to the operator once and then discarded.
    pub fn issue(display_name: &str, expires_at: Option<DateTime<Utc>>) -> (Self, String) {
        let raw = generate_secret();
        let credential = Self {
            id: Uuid::new_v4().to_string(),
            display_name: display_name.to_string(),
            secret_hash: hash_secret(&raw),
            secret_prefix: raw[..DISPLAY_PREFIX_LEN].to_string(),
            created_at: Utc::now(),
            active: true,
            expires_at,
        };
        (credential, raw)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(expiry) if expiry < now)
    }
}

/// SHA-256 hex digest of a raw secret. Used both for storage and for keying
/// audit records of failed attempts.
pub fn hash_secret(raw: &str) -> String {
    format!("{:x}", Sha256::digest(raw.as_bytes()))
}

/// `llmc_` followed by 64 lowercase hex chars from the thread CSPRNG.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    rand::rng().fill(&mut bytes);
    let body: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    format!("{SECRET_PREFIX}{body}")
}

/// Whether `value` has the shape of a stored digest (64 lowercase hex chars).
pub fn is_valid_hash(value: &str) -> bool {
    value.len() == 64 && value.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
