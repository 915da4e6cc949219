//! Memory queries and statistics.

use hivemind_core::{AgentId, CoordinationError, MemoryEntry, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Search over memory entries. Every set field must match.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryQuery {
    /// Restrict to one namespace
    pub namespace: Option<String>,
    /// Key starts with
    pub key_prefix: Option<String>,
    /// Key matches this regular expression
    pub key_pattern: Option<String>,
    /// Entry carries all of these tags
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Written by this agent
    pub owner: Option<AgentId>,
    /// Maximum results
    pub limit: Option<usize>,
}

impl MemoryQuery {
    /// Query everything in `namespace`.
    pub fn namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            ..Default::default()
        }
    }

    /// Restrict to keys starting with `prefix`.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    /// Restrict to keys matching `pattern`.
    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.key_pattern = Some(pattern.into());
        self
    }

    /// Require a tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Cap the result count.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Compile into a matcher.
    pub(crate) fn compile(&self) -> Result<CompiledQuery<'_>> {
        let pattern = match &self.key_pattern {
            Some(p) => Some(Regex::new(p).map_err(|e| {
                CoordinationError::InvalidSpec(format!("bad key pattern '{p}': {e}"))
            })?),
            None => None,
        };
        Ok(CompiledQuery {
            query: self,
            pattern,
        })
    }
}

pub(crate) struct CompiledQuery<'a> {
    query: &'a MemoryQuery,
    pattern: Option<Regex>,
}

impl CompiledQuery<'_> {
    pub(crate) fn matches(&self, entry: &MemoryEntry) -> bool {
        let q = self.query;
        if let Some(ns) = &q.namespace {
            if &entry.namespace != ns {
                return false;
            }
        }
        if let Some(prefix) = &q.key_prefix {
            if !entry.key.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if let Some(re) = &self.pattern {
            if !re.is_match(&entry.key) {
                return false;
            }
        }
        if !q.tags.is_subset(&entry.tags) {
            return false;
        }
        if let Some(owner) = q.owner {
            if entry.owner != Some(owner) {
                return false;
            }
        }
        true
    }

    pub(crate) fn limit(&self) -> Option<usize> {
        self.query.limit
    }
}

/// Store-wide counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryStats {
    /// Live entries
    pub total_entries: usize,
    /// Live entries per namespace
    pub by_namespace: BTreeMap<String, usize>,
    /// Entries past their TTL that the sweep has not removed yet
    pub expired_pending: usize,
}
