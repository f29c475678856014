//! Correlation registry and replay protection.
//!
//! The correlation registry maps outstanding request IDs to the IdP they
//! were sent to. An entry is consumed — atomically removed — exactly
//! once when a response's InResponseTo is validated, which is what makes
//! response acceptance at-most-once per issued request.
//!
//! The consumed-assertion set remembers the N most recent accepted
//! assertion IDs and rejects any repeat. Both structures are bounded:
//! correctness only requires entries to outlive the IdP's expected
//! response latency, not to live forever.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

use crate::config::ReplayConfig;

/// An outstanding request awaiting its response.
#[derive(Debug, Clone)]
pub struct CorrelationEntry {
    pub idp_entity_id: String,
    pub created_at: DateTime<Utc>,
}

/// Outstanding request IDs, bounded by age and count.
pub struct CorrelationRegistry {
    entries: DashMap<String, CorrelationEntry>,
    max_entries: usize,
    ttl: Duration,
}

impl CorrelationRegistry {
    pub fn new(config: &ReplayConfig) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: config.max_outstanding_requests,
            ttl: Duration::seconds(config.request_ttl_secs as i64),
        }
    }

    /// Register a freshly built request. Must happen before the message
    /// can leave the process, or its response could race validation.
    pub fn register(&self, request_id: &str, idp_entity_id: &str) {
        self.purge_expired();
        while self.entries.len() >= self.max_entries {
            self.evict_oldest();
        }
        self.entries.insert(
            request_id.to_owned(),
            CorrelationEntry {
                idp_entity_id: idp_entity_id.to_owned(),
                created_at: Utc::now(),
            },
        );
    }

    /// Consume an entry, atomically. At most one caller gets the entity
    /// ID back; every later call sees `None`.
    pub fn consume(&self, request_id: &str) -> Option<String> {
        self.entries
            .remove(request_id)
            .map(|(_, entry)| entry.idp_entity_id)
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.entries.contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn purge_expired(&self) {
        let cutoff = Utc::now() - self.ttl;
        self.entries.retain(|_, entry| entry.created_at >= cutoff);
    }

    fn evict_oldest(&self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.value().created_at)
            .map(|entry| entry.key().clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
            tracing::debug!(request_id = %key, "correlation registry full, evicted oldest entry");
        }
    }
}

/// The N most recently consumed assertion IDs.
pub struct ConsumedAssertionSet {
    entries: DashMap<String, DateTime<Utc>>,
    capacity: usize,
}

impl ConsumedAssertionSet {
    pub fn new(config: &ReplayConfig) -> Self {
        Self {
            entries: DashMap::new(),
            capacity: config.consumed_capacity,
        }
    }

    pub fn is_replay(&self, assertion_id: &str) -> bool {
        self.entries.contains_key(assertion_id)
    }

    /// Record an assertion ID as consumed. Returns `false` when the ID
    /// was already present — the atomic form of `is_replay` +
    /// `mark_consumed` for callers that must not race.
    pub fn mark_consumed(&self, assertion_id: &str) -> bool {
        let fresh = match self.entries.entry(assertion_id.to_owned()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(Utc::now());
                true
            }
        };
        if fresh {
            while self.entries.len() > self.capacity {
                self.evict_oldest();
            }
        }
        fresh
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_oldest(&self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|entry| *entry.value())
            .map(|entry| entry.key().clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
        }
    }
}
