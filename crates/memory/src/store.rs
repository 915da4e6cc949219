//! Partitioned memory store.

use crate::merge::{LastWriterWins, MergePolicy};
use crate::query::{MemoryQuery, MemoryStats};
use chrono::Utc;
use hivemind_core::{
    AccessLevel, Accessor, CoordinationError, CoordinationEvent, EventBus, MemoryEntry, Result,
    Time,
};
use parking_lot::RwLock;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Namespace used when a caller does not pick one.
pub const DEFAULT_NAMESPACE: &str = "default";

type Slot = (String, String);

/// A write request.
#[derive(Debug, Clone)]
pub struct PutRequest {
    /// Namespace
    pub namespace: String,
    /// Key
    pub key: String,
    /// Value
    pub value: serde_json::Value,
    /// Visibility
    pub access_level: AccessLevel,
    /// Time to live
    pub ttl: Option<Duration>,
    /// Tags
    pub tags: BTreeSet<String>,
}

impl PutRequest {
    /// Swarm-visible write without TTL.
    pub fn new(
        namespace: impl Into<String>,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            key: key.into(),
            value,
            access_level: AccessLevel::Swarm,
            ttl: None,
            tags: BTreeSet::new(),
        }
    }

    /// Set the access level.
    pub fn with_access(mut self, level: AccessLevel) -> Self {
        self.access_level = level;
        self
    }

    /// Expire after `ttl`.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Add a tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }
}

/// Namespaced key/value store shared by agents.
pub struct MemoryStore {
    partitions: Vec<RwLock<HashMap<Slot, MemoryEntry>>>,
    policy: Arc<dyn MergePolicy>,
    bus: EventBus,
}

impl MemoryStore {
    /// Create a store with `partitions` shards and last-writer-wins merging.
    pub fn new(partitions: usize, bus: EventBus) -> Self {
        Self::with_policy(partitions, bus, Arc::new(LastWriterWins))
    }

    /// Create a store with a custom merge policy.
    pub fn with_policy(partitions: usize, bus: EventBus, policy: Arc<dyn MergePolicy>) -> Self {
        let partitions = (0..partitions.max(1))
            .map(|_| RwLock::new(HashMap::new()))
            .collect();
        Self {
            partitions,
            policy,
            bus,
        }
    }

    /// Name of the active merge policy.
    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    fn partition(&self, namespace: &str, key: &str) -> &RwLock<HashMap<Slot, MemoryEntry>> {
        let mut hasher = DefaultHasher::new();
        namespace.hash(&mut hasher);
        key.hash(&mut hasher);
        let idx = (hasher.finish() % self.partitions.len() as u64) as usize;
        &self.partitions[idx]
    }

    fn reconcile(&self, current: &MemoryEntry, incoming: &MemoryEntry) -> MemoryEntry {
        match self.policy.merge(current, incoming) {
            Ok(merged) => merged,
            Err(e) => {
                warn!(
                    policy = self.policy.name(),
                    namespace = %incoming.namespace,
                    key = %incoming.key,
                    error = %e,
                    "Merge policy failed, falling back to last-writer-wins"
                );
                LastWriterWins::pick(current, incoming)
            }
        }
    }

    /// Write a value. The new entry's version is one past the stored one.
    pub fn put(&self, accessor: &Accessor, request: PutRequest) -> Result<MemoryEntry> {
        self.put_at(accessor, request, Utc::now())
    }

    /// [`MemoryStore::put`] with an explicit clock.
    pub fn put_at(&self, accessor: &Accessor, request: PutRequest, now: Time) -> Result<MemoryEntry> {
        if request.key.is_empty() || request.namespace.is_empty() {
            return Err(CoordinationError::InvalidSpec(
                "memory key and namespace must not be empty".to_string(),
            ));
        }
        let denied = || CoordinationError::MemoryAccessDenied {
            key: request.key.clone(),
            namespace: request.namespace.clone(),
        };
        if !accessor.can_write_level(request.access_level) {
            return Err(denied());
        }

        let slot = (request.namespace.clone(), request.key.clone());
        let mut expired = false;
        let stored = {
            let mut partition = self.partition(&slot.0, &slot.1).write();

            if partition.get(&slot).is_some_and(|e| e.is_expired(now)) {
                partition.remove(&slot);
                expired = true;
            }

            let current = partition.get(&slot);
            if let Some(current) = current {
                if !accessor.can_read(current) {
                    return Err(denied());
                }
            }

            let ttl = request
                .ttl
                .and_then(|d| chrono::Duration::from_std(d).ok());
            let candidate = MemoryEntry {
                key: request.key.clone(),
                namespace: request.namespace.clone(),
                value: request.value,
                owner: accessor.agent_id(),
                owner_team: accessor.team().map(String::from),
                access_level: request.access_level,
                version: current.map(|c| c.version + 1).unwrap_or(1),
                written_at: now,
                expires_at: ttl.map(|d| now + d),
                tags: request.tags,
            };

            let stored = match current {
                Some(current) => self.reconcile(current, &candidate),
                None => candidate,
            };
            partition.insert(slot, stored.clone());
            stored
        };

        if expired {
            self.bus.publish(CoordinationEvent::MemoryExpired {
                namespace: stored.namespace.clone(),
                key: stored.key.clone(),
            });
        }
        debug!(namespace = %stored.namespace, key = %stored.key, version = stored.version, "Memory write");
        self.bus.publish(CoordinationEvent::MemoryWritten {
            namespace: stored.namespace.clone(),
            key: stored.key.clone(),
            version: stored.version,
        });
        Ok(stored)
    }

    /// Read a value visible to `accessor`. Expired entries are removed on read.
    pub fn get(&self, accessor: &Accessor, namespace: &str, key: &str) -> Result<Option<MemoryEntry>> {
        self.get_at(accessor, namespace, key, Utc::now())
    }

    /// [`MemoryStore::get`] with an explicit clock.
    pub fn get_at(
        &self,
        accessor: &Accessor,
        namespace: &str,
        key: &str,
        now: Time,
    ) -> Result<Option<MemoryEntry>> {
        let slot = (namespace.to_string(), key.to_string());
        let partition = self.partition(namespace, key);

        let entry = partition.read().get(&slot).cloned();
        let Some(entry) = entry else {
            return Ok(None);
        };

        if entry.is_expired(now) {
            let removed = {
                let mut guard = partition.write();
                match guard.get(&slot) {
                    Some(e) if e.is_expired(now) => guard.remove(&slot).is_some(),
                    _ => false,
                }
            };
            if removed {
                self.bus.publish(CoordinationEvent::MemoryExpired {
                    namespace: slot.0,
                    key: slot.1,
                });
            }
            return Ok(None);
        }

        if !accessor.can_read(&entry) {
            return Err(CoordinationError::MemoryAccessDenied {
                key: key.to_string(),
                namespace: namespace.to_string(),
            });
        }
        Ok(Some(entry))
    }

    /// Remove an entry. Only its owner or the coordinator may delete.
    pub fn delete(&self, accessor: &Accessor, namespace: &str, key: &str) -> Result<bool> {
        let slot = (namespace.to_string(), key.to_string());
        let removed = {
            let mut partition = self.partition(namespace, key).write();
            let Some(entry) = partition.get(&slot) else {
                return Ok(false);
            };
            let allowed = *accessor == Accessor::System
                || (entry.owner.is_some() && entry.owner == accessor.agent_id());
            if !allowed {
                return Err(CoordinationError::MemoryAccessDenied {
                    key: key.to_string(),
                    namespace: namespace.to_string(),
                });
            }
            partition.remove(&slot).is_some()
        };
        if removed {
            self.bus.publish(CoordinationEvent::MemoryDeleted {
                namespace: slot.0,
                key: slot.1,
            });
        }
        Ok(removed)
    }

    /// Entries visible to `accessor` matching `query`, ordered by namespace then key.
    pub fn query(&self, accessor: &Accessor, query: &MemoryQuery) -> Result<Vec<MemoryEntry>> {
        self.query_at(accessor, query, Utc::now())
    }

    /// [`MemoryStore::query`] with an explicit clock.
    pub fn query_at(
        &self,
        accessor: &Accessor,
        query: &MemoryQuery,
        now: Time,
    ) -> Result<Vec<MemoryEntry>> {
        let compiled = query.compile()?;
        let mut results: Vec<MemoryEntry> = self
            .partitions
            .iter()
            .flat_map(|p| {
                p.read()
                    .values()
                    .filter(|e| !e.is_expired(now) && accessor.can_read(e) && compiled.matches(e))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        results.sort_by(|a, b| (&a.namespace, &a.key).cmp(&(&b.namespace, &b.key)));
        if let Some(limit) = compiled.limit() {
            results.truncate(limit);
        }
        Ok(results)
    }

    /// Fold entries from another replica into this one.
    ///
    /// Returns how many stored entries changed.
    pub fn merge_remote(&self, entries: impl IntoIterator<Item = MemoryEntry>) -> usize {
        self.merge_remote_at(entries, Utc::now())
    }

    /// [`MemoryStore::merge_remote`] with an explicit clock.
    pub fn merge_remote_at(&self, entries: impl IntoIterator<Item = MemoryEntry>, now: Time) -> usize {
        let mut changed = 0;
        for incoming in entries {
            if incoming.is_expired(now) {
                continue;
            }
            let slot = (incoming.namespace.clone(), incoming.key.clone());
            let stored = {
                let mut partition = self.partition(&slot.0, &slot.1).write();
                let merged = match partition.get(&slot) {
                    Some(current) => {
                        let merged = self.reconcile(current, &incoming);
                        if &merged == current {
                            continue;
                        }
                        merged
                    }
                    None => incoming,
                };
                partition.insert(slot, merged.clone());
                merged
            };
            changed += 1;
            self.bus.publish(CoordinationEvent::MemoryWritten {
                namespace: stored.namespace,
                key: stored.key,
                version: stored.version,
            });
        }
        changed
    }

    /// Remove every entry expired at `now`, emitting `memory:expired` for each.
    pub fn sweep_expired(&self, now: Time) -> usize {
        let mut expired = Vec::new();
        for partition in &self.partitions {
            let mut guard = partition.write();
            guard.retain(|slot, entry| {
                if entry.is_expired(now) {
                    expired.push(slot.clone());
                    false
                } else {
                    true
                }
            });
        }
        for (namespace, key) in &expired {
            self.bus.publish(CoordinationEvent::MemoryExpired {
                namespace: namespace.clone(),
                key: key.clone(),
            });
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "Swept expired memory entries");
        }
        expired.len()
    }

    /// Counters at `now`.
    pub fn stats(&self, now: Time) -> MemoryStats {
        let mut stats = MemoryStats::default();
        for partition in &self.partitions {
            for entry in partition.read().values() {
                if entry.is_expired(now) {
                    stats.expired_pending += 1;
                } else {
                    stats.total_entries += 1;
                    *stats.by_namespace.entry(entry.namespace.clone()).or_insert(0) += 1;
                }
            }
        }
        stats
    }

    /// Every stored entry, for snapshots.
    pub fn entries(&self) -> Vec<MemoryEntry> {
        let mut all: Vec<MemoryEntry> = self
            .partitions
            .iter()
            .flat_map(|p| p.read().values().cloned().collect::<Vec<_>>())
            .collect();
        all.sort_by(|a, b| (&a.namespace, &a.key).cmp(&(&b.namespace, &b.key)));
        all
    }

    /// Replace the contents with `entries`, as loaded from a snapshot.
    pub fn restore(&self, entries: Vec<MemoryEntry>) {
        for partition in &self.partitions {
            partition.write().clear();
        }
        for entry in entries {
            let slot = (entry.namespace.clone(), entry.key.clone());
            self.partition(&slot.0, &slot.1).write().insert(slot, entry);
        }
    }

    /// Sweep on a fixed interval until `shutdown` fires.
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration, mut shutdown: broadcast::Receiver<()>) {
        info!(interval_ms = interval.as_millis() as u64, "Memory sweeper started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep_expired(Utc::now());
                }
                _ = shutdown.recv() => {
                    info!("Memory sweeper shutting down");
                    break;
                }
            }
        }
    }
}
