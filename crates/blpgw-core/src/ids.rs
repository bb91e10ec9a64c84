//! Identifier types.
//!
//! [`CorrelationId`] is the integer tag carried by every upstream event; it is
//! allocated from a process-wide monotonic counter and never reused while the
//! allocator lives. String identities ([`ClientKey`], [`ConnectionId`]) are
//! branded newtypes so a client key cannot be passed where a connection id is
//! expected.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Integer tag correlating an upstream request or subscription with its events.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(u64);

impl CorrelationId {
    /// Wrap a raw value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// The raw integer value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for CorrelationId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Monotonic correlation id source.
///
/// Ids are handed out in increasing order starting at zero. Because the
/// counter only moves forward, an id is never reused while anything that
/// received it is still registered.
#[derive(Debug, Default)]
pub struct CorrelationIdAllocator {
    next: AtomicU64,
}

impl CorrelationIdAllocator {
    /// Create an allocator starting at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next id.
    pub fn next_id(&self) -> CorrelationId {
        CorrelationId(self.next.fetch_add(1, Ordering::Relaxed))
    }

    /// Number of ids handed out so far.
    pub fn allocated(&self) -> u64 {
        self.next.load(Ordering::Relaxed)
    }
}

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident, $prefix:expr) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new random ID (prefixed UUID v7, time-ordered).
            #[must_use]
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            /// Return the inner string as a slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

branded_id! {
    /// Identity of one API client (the key its `ApiSession` is stored under).
    ClientKey, "client"
}

branded_id! {
    /// Identifier of one WebSocket connection.
    ConnectionId, "conn"
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocator_starts_at_zero_and_increments() {
        let alloc = CorrelationIdAllocator::new();
        assert_eq!(alloc.next_id(), CorrelationId::new(0));
        assert_eq!(alloc.next_id(), CorrelationId::new(1));
        assert_eq!(alloc.next_id(), CorrelationId::new(2));
        assert_eq!(alloc.allocated(), 3);
    }

    #[test]
    fn allocator_is_monotonic_across_threads() {
        let alloc = std::sync::Arc::new(CorrelationIdAllocator::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let alloc = alloc.clone();
                std::thread::spawn(move || (0..250).map(|_| alloc.next_id()).collect::<Vec<_>>())
            })
            .collect();
        let mut all: Vec<CorrelationId> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 1000, "ids must never repeat");
    }

    #[test]
    fn correlation_id_display() {
        assert_eq!(CorrelationId::new(42).to_string(), "42");
    }

    #[test]
    fn correlation_id_serializes_as_number() {
        let json = serde_json::to_string(&CorrelationId::new(7)).unwrap();
        assert_eq!(json, "7");
        let back: CorrelationId = serde_json::from_str("7").unwrap();
        assert_eq!(back.value(), 7);
    }

    #[test]
    fn client_key_from_str() {
        let key = ClientKey::from("fingerprint-abc");
        assert_eq!(key.as_str(), "fingerprint-abc");
        assert_eq!(format!("{key}"), "fingerprint-abc");
    }

    #[test]
    fn connection_id_has_prefix() {
        let id = ConnectionId::new();
        assert!(id.as_str().starts_with("conn_"), "got: {id}");
    }

    #[test]
    fn connection_ids_are_unique() {
        assert_ne!(ConnectionId::new(), ConnectionId::new());
    }

    #[test]
    fn client_key_hash_and_eq() {
        use std::collections::HashSet;
        let mut set = HashSet::new();
        let _ = set.insert(ClientKey::from("same"));
        let _ = set.insert(ClientKey::from("same"));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn into_inner() {
        let key = ClientKey::from("inner");
        assert_eq!(key.into_inner(), "inner");
    }
}
