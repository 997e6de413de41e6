//! # Shared Cache Types
//!
//! Core data types shared by both storage tiers: the on-disk envelope, the
//! TTL status reported to callers, and millisecond time helpers.
//!
//! ## Design Principles
//!
//! 1. **Absolute Expiry**: Entries carry an absolute `expires_at` timestamp in
//!    milliseconds since the epoch; "no expiry" is the absence of a value,
//!    never zero.
//! 2. **Raw Value Pass-Through**: The envelope stores the user value as raw
//!    JSON so the single encoding produced at write time is spliced into the
//!    disk record and recovered verbatim on read.
//! 3. **Redis TTL Semantics**: `TtlStatus` mirrors the -2/-1/n sentinel
//!    convention without losing sub-second precision internally.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// Returns the current wall-clock time in milliseconds since the epoch.
pub fn now_ms() -> u64 {
    system_time_ms(SystemTime::now())
}

/// Converts a `SystemTime` to milliseconds since the epoch.
///
/// Times before the epoch clamp to zero.
pub fn system_time_ms(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

/// Returns true when `expires_at` names a deadline at or before `now`.
pub fn is_expired(expires_at: Option<u64>, now: u64) -> bool {
    matches!(expires_at, Some(at) if at <= now)
}

/// TTL state for a key, mirroring Redis `TTL` semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlStatus {
    /// Key is missing or already expired.
    Missing,
    /// Key exists without expiration.
    NoExpiry,
    /// Key expires after the provided duration.
    ExpiresIn(Duration),
}

impl TtlStatus {
    /// Classifies an absolute expiry relative to `now`.
    pub fn from_expiry(expires_at: Option<u64>, now: u64) -> TtlStatus {
        match expires_at {
            None => TtlStatus::NoExpiry,
            Some(at) if at <= now => TtlStatus::Missing,
            Some(at) => TtlStatus::ExpiresIn(Duration::from_millis(at - now)),
        }
    }

    /// Renders the status in the Redis integer convention: `-2` missing,
    /// `-1` no expiry, otherwise seconds remaining rounded up.
    pub fn as_secs_i64(&self) -> i64 {
        match self {
            TtlStatus::Missing => -2,
            TtlStatus::NoExpiry => -1,
            TtlStatus::ExpiresIn(left) => left.as_millis().div_ceil(1000) as i64,
        }
    }
}

/// On-disk record for a single cache entry.
///
/// Serialized as a JSON object `{key, value, expires_at}` where `value` is the
/// already-encoded user value and `expires_at` is milliseconds or null.
/// Decoding an envelope always yields back the original key, value bytes, and
/// expiry.
#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope {
    /// Full (possibly namespaced) key the record was written under.
    pub key: String,
    /// User value as raw JSON, opaque to the storage tiers.
    pub value: Box<RawValue>,
    /// Absolute expiry in milliseconds, or `None` for no expiry.
    pub expires_at: Option<u64>,
}

impl Envelope {
    /// Builds an envelope around an already-encoded JSON value.
    ///
    /// Fails when `value_json` is not valid JSON.
    pub fn from_parts(
        key: &str,
        value_json: String,
        expires_at: Option<u64>,
    ) -> Result<Self, serde_json::Error> {
        Ok(Envelope {
            key: key.to_string(),
            value: RawValue::from_string(value_json)?,
            expires_at,
        })
    }

    /// Parses an envelope from its serialized form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Serializes the envelope for disk storage.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Returns the raw JSON text of the stored value.
    pub fn value_json(&self) -> &str {
        self.value.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_roundtrip_preserves_all_fields() {
        let envelope = Envelope::from_parts("user:1", "{\"name\":\"ada\"}".to_string(), Some(42))
            .expect("valid json");
        let bytes = envelope.to_bytes().expect("serialize");
        let decoded = Envelope::from_bytes(&bytes).expect("parse");

        assert_eq!(decoded.key, "user:1");
        assert_eq!(decoded.value_json(), "{\"name\":\"ada\"}");
        assert_eq!(decoded.expires_at, Some(42));
    }

    #[test]
    fn envelope_serializes_missing_expiry_as_null() {
        let envelope = Envelope::from_parts("k", "1".to_string(), None).expect("valid json");
        let text = String::from_utf8(envelope.to_bytes().expect("serialize")).expect("utf8");
        assert!(text.contains("\"expires_at\":null"));
    }

    #[test]
    fn envelope_rejects_invalid_value_json() {
        assert!(Envelope::from_parts("k", "{not json".to_string(), None).is_err());
    }

    #[test]
    fn ttl_status_sentinels() {
        assert_eq!(TtlStatus::from_expiry(None, 100).as_secs_i64(), -1);
        assert_eq!(TtlStatus::from_expiry(Some(50), 100).as_secs_i64(), -2);
        assert_eq!(TtlStatus::from_expiry(Some(100), 100), TtlStatus::Missing);

        let remaining = TtlStatus::from_expiry(Some(2_500), 1_000);
        assert_eq!(remaining, TtlStatus::ExpiresIn(Duration::from_millis(1_500)));
        assert_eq!(remaining.as_secs_i64(), 2);
    }

    #[test]
    fn expiry_check_treats_deadline_as_inclusive() {
        assert!(!is_expired(None, u64::MAX));
        assert!(!is_expired(Some(101), 100));
        assert!(is_expired(Some(100), 100));
        assert!(is_expired(Some(99), 100));
    }
}
