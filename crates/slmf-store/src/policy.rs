// SPDX-License-Identifier: MIT OR Apache-2.0
//! Topic-to-storage policy.
//!
//! The broker consults this when teeing envelopes into the store. Matching
//! is longest-prefix; topics matching no rule are not persisted, which
//! keeps high-frequency conversational traffic out of the database by
//! default.

use slmf_protocol::Envelope;
use std::sync::Arc;

/// Storage behavior for a topic family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persistence {
    /// Persist every matching envelope.
    Always,
    /// Persist only while debug persistence is enabled.
    Conditional,
    /// Never persist.
    Never,
    /// Persist when the injected probe says so.
    ///
    /// Used for the log family, where only records at WARNING and above
    /// are kept; the probe is supplied by the composition root so this
    /// crate never interprets payload bytes itself.
    Probed,
}

/// Decides, per envelope, whether the probe-gated rule fires.
pub type PersistenceProbe = Arc<dyn Fn(&Envelope) -> bool + Send + Sync>;

struct Rule {
    prefix: String,
    persistence: Persistence,
}

/// Longest-prefix-match persistence policy.
pub struct PersistencePolicy {
    rules: Vec<Rule>,
    debug_enabled: bool,
    probe: Option<PersistenceProbe>,
}

impl PersistencePolicy {
    /// An empty policy that persists nothing.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            rules: Vec::new(),
            debug_enabled: false,
            probe: None,
        }
    }

    /// The standard fabric policy.
    ///
    /// Security, audit and admin-action topics are always kept; log topics
    /// go through the probe; telemetry is kept only in debug; emotion
    /// state and typing indicators are explicitly never kept.
    #[must_use]
    pub fn standard() -> Self {
        Self::empty()
            .with_rule("system/security/", Persistence::Always)
            .with_rule("control/admin/", Persistence::Always)
            .with_rule("logs/", Persistence::Probed)
            .with_rule("telemetry/", Persistence::Conditional)
            .with_rule("emotion/", Persistence::Never)
            .with_rule("ui/typing/", Persistence::Never)
    }

    /// Add a prefix rule. The empty prefix matches everything.
    #[must_use]
    pub fn with_rule(mut self, prefix: impl Into<String>, persistence: Persistence) -> Self {
        self.rules.push(Rule {
            prefix: prefix.into(),
            persistence,
        });
        self
    }

    /// Enable or disable the debug flag gating `Conditional` rules.
    #[must_use]
    pub fn with_debug_persistence(mut self, enabled: bool) -> Self {
        self.debug_enabled = enabled;
        self
    }

    /// Install the probe consulted by `Probed` rules.
    #[must_use]
    pub fn with_probe(mut self, probe: PersistenceProbe) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Whether `envelope` should be persisted.
    #[must_use]
    pub fn decide(&self, envelope: &Envelope) -> bool {
        let topic = envelope.topic.as_str();
        let matched = self
            .rules
            .iter()
            .filter(|r| topic.starts_with(&r.prefix))
            .max_by_key(|r| r.prefix.len());
        match matched {
            None => false,
            Some(rule) => match rule.persistence {
                Persistence::Always => true,
                Persistence::Never => false,
                Persistence::Conditional => self.debug_enabled,
                Persistence::Probed => {
                    self.probe.as_ref().map(|p| p(envelope)).unwrap_or(false)
                }
            },
        }
    }
}

impl std::fmt::Debug for PersistencePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistencePolicy")
            .field("rules", &self.rules.len())
            .field("debug_enabled", &self.debug_enabled)
            .field("probed", &self.probe.is_some())
            .finish()
    }
}
