//! Shared memory model - entries agents exchange through the memory store.

use crate::id::AgentId;
use crate::Time;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;

/// Visibility scope of a memory entry, narrowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    /// Owner only
    Private,
    /// Agents on the owner's team
    Team,
    /// Any agent in the swarm
    Swarm,
    /// Anyone, including external observers
    Public,
    /// The coordinator only
    System,
}

impl std::fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Private => "private",
            Self::Team => "team",
            Self::Swarm => "swarm",
            Self::Public => "public",
            Self::System => "system",
        };
        f.write_str(s)
    }
}

/// Who is performing a memory operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Accessor {
    /// The coordinator itself
    System,
    /// A registered agent
    Agent {
        /// Agent id
        id: AgentId,
        /// Agent team
        team: String,
    },
    /// An observer outside the swarm (dashboards, tools)
    External,
}

impl Accessor {
    /// Accessor for an agent.
    pub fn agent(id: AgentId, team: impl Into<String>) -> Self {
        Self::Agent {
            id,
            team: team.into(),
        }
    }

    /// The agent id, if any.
    pub fn agent_id(&self) -> Option<AgentId> {
        match self {
            Self::Agent { id, .. } => Some(*id),
            _ => None,
        }
    }

    /// The team, if any.
    pub fn team(&self) -> Option<&str> {
        match self {
            Self::Agent { team, .. } => Some(team),
            _ => None,
        }
    }

    /// Whether this accessor may read `entry`.
    pub fn can_read(&self, entry: &MemoryEntry) -> bool {
        if *self == Accessor::System {
            return true;
        }
        match entry.access_level {
            AccessLevel::Public => true,
            AccessLevel::System => false,
            AccessLevel::Swarm => matches!(self, Accessor::Agent { .. }),
            AccessLevel::Team => match self {
                Accessor::Agent { id, team } => {
                    entry.owner == Some(*id) || entry.owner_team.as_deref() == Some(team.as_str())
                }
                _ => false,
            },
            AccessLevel::Private => self.agent_id().is_some() && self.agent_id() == entry.owner,
        }
    }

    /// Whether this accessor may create an entry at `level`.
    pub fn can_write_level(&self, level: AccessLevel) -> bool {
        match level {
            AccessLevel::System => *self == Accessor::System,
            AccessLevel::Private | AccessLevel::Team => !matches!(self, Accessor::External),
            AccessLevel::Swarm | AccessLevel::Public => true,
        }
    }
}

/// A versioned value in the memory store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    /// Key, unique within its namespace
    pub key: String,
    /// Namespace
    pub namespace: String,
    /// Opaque value
    pub value: serde_json::Value,
    /// Writing agent; `None` means the coordinator or an external writer
    pub owner: Option<AgentId>,
    /// Team of the writing agent
    pub owner_team: Option<String>,
    /// Visibility
    pub access_level: AccessLevel,
    /// Per-key monotonic counter
    pub version: u64,
    /// Wall-clock time of the write
    pub written_at: Time,
    /// Absolute expiry
    pub expires_at: Option<Time>,
    /// Free-form tags for querying
    pub tags: BTreeSet<String>,
}

impl MemoryEntry {
    /// Whether the entry has expired at `now`.
    pub fn is_expired(&self, now: Time) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }

    /// Total last-writer-wins order: version, then wall clock, then writer
    /// id, then content. Two replicas holding different writes with the same
    /// stamp therefore pick the same winner.
    pub fn lww_cmp(&self, other: &Self) -> Ordering {
        self.version
            .cmp(&other.version)
            .then_with(|| self.written_at.cmp(&other.written_at))
            .then_with(|| self.owner.cmp(&other.owner))
            .then_with(|| self.value.to_string().cmp(&other.value.to_string()))
            .then_with(|| content_key(self).cmp(&content_key(other)))
    }

    /// Whether this entry wins over `other` under last-writer-wins.
    pub fn supersedes(&self, other: &Self) -> bool {
        self.lww_cmp(other) == Ordering::Greater
    }
}

/// Canonical text of the whole entry, used as the last tie-break.
fn content_key(entry: &MemoryEntry) -> String {
    serde_json::to_string(entry).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn entry(level: AccessLevel, owner: Option<AgentId>, team: Option<&str>) -> MemoryEntry {
        MemoryEntry {
            key: "k".into(),
            namespace: "default".into(),
            value: serde_json::json!(1),
            owner,
            owner_team: team.map(String::from),
            access_level: level,
            version: 1,
            written_at: Utc::now(),
            expires_at: None,
            tags: BTreeSet::new(),
        }
    }

    #[test]
    fn test_private_readable_only_by_owner() {
        let owner = AgentId::new();
        let e = entry(AccessLevel::Private, Some(owner), Some("coder"));
        assert!(Accessor::agent(owner, "coder").can_read(&e));
        assert!(!Accessor::agent(AgentId::new(), "coder").can_read(&e));
        assert!(!Accessor::External.can_read(&e));
        assert!(Accessor::System.can_read(&e));
    }

    #[test]
    fn test_team_and_swarm_levels_widen() {
        let owner = AgentId::new();
        let team = entry(AccessLevel::Team, Some(owner), Some("coder"));
        assert!(Accessor::agent(AgentId::new(), "coder").can_read(&team));
        assert!(!Accessor::agent(AgentId::new(), "tester").can_read(&team));

        let swarm = entry(AccessLevel::Swarm, Some(owner), Some("coder"));
        assert!(Accessor::agent(AgentId::new(), "tester").can_read(&swarm));
        assert!(!Accessor::External.can_read(&swarm));

        let public = entry(AccessLevel::Public, Some(owner), Some("coder"));
        assert!(Accessor::External.can_read(&public));
    }

    #[test]
    fn test_system_level_reserved() {
        let e = entry(AccessLevel::System, None, None);
        assert!(!Accessor::agent(AgentId::new(), "coder").can_read(&e));
        assert!(Accessor::System.can_read(&e));
        assert!(!Accessor::External.can_write_level(AccessLevel::System));
    }

    #[test]
    fn test_lww_order_breaks_ties() {
        let now = Utc::now();
        let mut a = entry(AccessLevel::Public, Some(AgentId::new()), None);
        let mut b = a.clone();
        a.written_at = now;
        b.written_at = now + Duration::milliseconds(1);
        assert!(b.supersedes(&a));

        b.version = 0;
        assert!(a.supersedes(&b));
    }

    #[test]
    fn test_lww_order_decides_between_same_stamp_writes() {
        let now = Utc::now();
        let mut a = entry(AccessLevel::System, None, None);
        a.written_at = now;
        a.value = serde_json::json!("from-a");
        let mut b = a.clone();
        b.value = serde_json::json!("from-b");

        assert_ne!(a.lww_cmp(&b), Ordering::Equal);
        assert_eq!(a.lww_cmp(&b), b.lww_cmp(&a).reverse());
        assert!(b.supersedes(&a));
        assert!(!a.supersedes(&b));

        let mut tagged = a.clone();
        tagged.tags.insert("hot".into());
        assert!(tagged.supersedes(&a) != a.supersedes(&tagged));
        assert_eq!(a.lww_cmp(&a.clone()), Ordering::Equal);
    }

    #[test]
    fn test_expiry() {
        let now = Utc::now();
        let mut e = entry(AccessLevel::Public, None, None);
        assert!(!e.is_expired(now));
        e.expires_at = Some(now);
        assert!(e.is_expired(now));
    }
}
