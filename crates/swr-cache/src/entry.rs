//! Stored entries and their freshness.

use std::fmt;
use std::time::Duration;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::clock::Timestamp;

/// The unit of storage: a value stamped with the time it was written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    /// Caller-chosen key.
    pub key: String,
    /// Cached payload.
    pub value: T,
    /// When the entry was written.
    pub stored_at: Timestamp,
    /// Freshness TTL the writer had in mind. Informational only.
    #[serde(
        rename = "ttl_ms",
        default,
        skip_serializing_if = "Option::is_none",
        with = "opt_millis"
    )]
    pub ttl: Option<Duration>,
}

impl<T> CacheEntry<T> {
    /// Create an entry.
    pub fn new(key: impl Into<String>, value: T, stored_at: Timestamp) -> Self {
        Self {
            key: key.into(),
            value,
            stored_at,
            ttl: None,
        }
    }

    /// Record the writer's TTL.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Age of the entry at `now`.
    pub fn age(&self, now: Timestamp) -> Duration {
        now.saturating_since(self.stored_at)
    }

    /// Classify the entry at `now`.
    pub fn freshness(&self, now: Timestamp, fresh_ttl: Duration, stale_ttl: Duration) -> Freshness {
        Freshness::classify(self.age(now), fresh_ttl, stale_ttl)
    }
}

impl<T: Serialize> CacheEntry<T> {
    /// Serialize to the stored byte form.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

impl<T: DeserializeOwned> CacheEntry<T> {
    /// Parse the stored byte form.
    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Age-based classification of an entry relative to caller TTLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Freshness {
    /// Within the fresh TTL.
    Fresh,
    /// Past the fresh TTL but within the stale TTL.
    Stale,
    /// Past the stale TTL; treated as absent.
    Expired,
}

impl Freshness {
    /// Classify an age.
    ///
    /// `fresh_ttl` must not exceed `stale_ttl`.
    pub fn classify(age: Duration, fresh_ttl: Duration, stale_ttl: Duration) -> Self {
        debug_assert!(
            fresh_ttl <= stale_ttl,
            "fresh_ttl ({fresh_ttl:?}) exceeds stale_ttl ({stale_ttl:?})"
        );
        if age <= fresh_ttl {
            Self::Fresh
        } else if age <= stale_ttl {
            Self::Stale
        } else {
            Self::Expired
        }
    }
}

impl fmt::Display for Freshness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fresh => write!(f, "fresh"),
            Self::Stale => write!(f, "stale"),
            Self::Expired => write!(f, "expired"),
        }
    }
}

/// Metadata about a stored entry, independent of its value type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryInfo {
    /// The entry key.
    pub key: String,
    /// When it was written.
    pub stored_at: Timestamp,
    /// Age at inspection time.
    pub age: Duration,
    /// TTL recorded by the writer.
    pub ttl: Option<Duration>,
    /// Size of the stored bytes.
    pub size_bytes: usize,
}

/// Metadata-only view used by sweeps and inspection.
#[derive(Deserialize)]
pub(crate) struct EntryHeader {
    pub key: String,
    pub stored_at: Timestamp,
    #[serde(rename = "ttl_ms", default, with = "opt_millis")]
    pub ttl: Option<Duration>,
}

impl EntryHeader {
    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

mod opt_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    use crate::clock::duration_millis;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&duration_millis(*d)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
