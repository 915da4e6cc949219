//! Built-in agent kinds.
//!
//! The table is immutable and resolved once at startup; registration only
//! needs `{kind, capabilities}` from it.

use std::collections::{BTreeSet, HashMap};

/// Defaults for one agent kind.
#[derive(Debug, Clone, Copy)]
pub struct AgentProfile {
    /// Kind name
    pub kind: &'static str,
    /// Capabilities every agent of this kind has
    pub capabilities: &'static [&'static str],
    /// Default concurrency
    pub max_concurrent_tasks: u32,
}

const BUILTIN_PROFILES: &[AgentProfile] = &[
    AgentProfile {
        kind: "coordinator",
        capabilities: &["coordination", "planning", "delegation"],
        max_concurrent_tasks: 5,
    },
    AgentProfile {
        kind: "researcher",
        capabilities: &["research", "analysis", "web-search", "documentation"],
        max_concurrent_tasks: 3,
    },
    AgentProfile {
        kind: "coder",
        capabilities: &["code-generation", "refactoring", "debugging", "file-system"],
        max_concurrent_tasks: 2,
    },
    AgentProfile {
        kind: "analyst",
        capabilities: &["analysis", "data-processing", "statistics", "visualization"],
        max_concurrent_tasks: 3,
    },
    AgentProfile {
        kind: "architect",
        capabilities: &["system-design", "planning", "documentation"],
        max_concurrent_tasks: 2,
    },
    AgentProfile {
        kind: "tester",
        capabilities: &["testing", "validation", "debugging"],
        max_concurrent_tasks: 3,
    },
    AgentProfile {
        kind: "reviewer",
        capabilities: &["code-review", "analysis", "documentation"],
        max_concurrent_tasks: 3,
    },
    AgentProfile {
        kind: "optimizer",
        capabilities: &["performance-analysis", "refactoring", "profiling"],
        max_concurrent_tasks: 2,
    },
    AgentProfile {
        kind: "documenter",
        capabilities: &["documentation", "writing"],
        max_concurrent_tasks: 3,
    },
    AgentProfile {
        kind: "monitor",
        capabilities: &["monitoring", "alerting", "analysis"],
        max_concurrent_tasks: 5,
    },
    AgentProfile {
        kind: "specialist",
        capabilities: &[],
        max_concurrent_tasks: 1,
    },
];

/// Lookup table from kind to profile.
#[derive(Debug, Clone)]
pub struct AgentCatalog {
    profiles: HashMap<&'static str, AgentProfile>,
    fallback_max_concurrent: u32,
}

impl AgentCatalog {
    /// The built-in catalog.
    pub fn builtin() -> Self {
        Self {
            profiles: BUILTIN_PROFILES.iter().map(|p| (p.kind, *p)).collect(),
            fallback_max_concurrent: 1,
        }
    }

    /// Profile for `kind`.
    pub fn lookup(&self, kind: &str) -> Option<&AgentProfile> {
        self.profiles.get(kind)
    }

    /// Kind defaults merged with `extra` capabilities.
    pub fn resolve_capabilities(&self, kind: &str, extra: &BTreeSet<String>) -> BTreeSet<String> {
        let mut caps: BTreeSet<String> = self
            .lookup(kind)
            .map(|p| p.capabilities.iter().map(|c| c.to_string()).collect())
            .unwrap_or_default();
        caps.extend(extra.iter().cloned());
        caps
    }

    /// Concurrency for `kind`, honoring an explicit override.
    pub fn resolve_max_concurrent(&self, kind: &str, requested: Option<u32>) -> u32 {
        requested
            .or_else(|| self.lookup(kind).map(|p| p.max_concurrent_tasks))
            .unwrap_or(self.fallback_max_concurrent)
            .max(1)
    }

    /// All known kinds, sorted.
    pub fn kinds(&self) -> Vec<&'static str> {
        let mut kinds: Vec<_> = self.profiles.keys().copied().collect();
        kinds.sort_unstable();
        kinds
    }
}

impl Default for AgentCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}
