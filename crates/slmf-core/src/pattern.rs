// SPDX-License-Identifier: MIT OR Apache-2.0
//! Subscription patterns and the two-stage matching contract.
//!
//! Dispatch happens in two stages. The transport delivers every message
//! whose topic starts with a subscriber's declared byte prefix; the client
//! runtime then re-checks the concrete topic against the pattern the caller
//! originally asked for. [`Pattern::transport_prefix`] yields the first
//! stage, [`Pattern::matches`] the second.

use crate::topic::{Topic, TopicError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A subscription pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Pattern {
    /// Matches every topic. Written as `""`, `*` or `**`.
    All,
    /// Matches any topic whose canonical form starts with the stored
    /// prefix, which always ends in `/`.
    Prefix(String),
    /// Matches exactly one topic.
    Exact(Topic),
}

impl Pattern {
    /// Parse a pattern string.
    ///
    /// `""`, `*` and `**` all mean "everything". A string ending in `/` is a
    /// prefix pattern; anything else must be a full canonical topic.
    ///
    /// # Errors
    ///
    /// Returns a [`TopicError`] when a prefix or literal pattern violates
    /// canonical topic form.
    pub fn parse(raw: &str) -> Result<Self, TopicError> {
        match raw {
            "" | "*" | "**" => Ok(Self::All),
            _ if raw.ends_with('/') => {
                // Validate the prefix as a topic without its trailing slash.
                let without = &raw[..raw.len() - 1];
                Topic::parse(without)?;
                Ok(Self::Prefix(raw.to_owned()))
            }
            _ => Ok(Self::Exact(Topic::parse(raw)?)),
        }
    }

    /// Second-stage application-level match against a concrete topic.
    #[must_use]
    pub fn matches(&self, topic: &Topic) -> bool {
        match self {
            Self::All => true,
            Self::Prefix(prefix) => topic.has_prefix(prefix),
            Self::Exact(exact) => exact == topic,
        }
    }

    /// First-stage byte prefix installed at the transport.
    ///
    /// The empty prefix matches everything. Note that an exact pattern's
    /// prefix over-delivers (`a/b` also passes `a/bc` through the
    /// transport); [`Pattern::matches`] culls those.
    #[must_use]
    pub fn transport_prefix(&self) -> &[u8] {
        match self {
            Self::All => b"",
            Self::Prefix(prefix) => prefix.as_bytes(),
            Self::Exact(topic) => topic.as_bytes(),
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("**"),
            Self::Prefix(prefix) => f.write_str(prefix),
            Self::Exact(topic) => f.write_str(topic.as_str()),
        }
    }
}

impl TryFrom<String> for Pattern {
    type Error = TopicError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Pattern::parse(&value)
    }
}

impl From<Pattern> for String {
    fn from(value: Pattern) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topic(raw: &str) -> Topic {
        Topic::parse(raw).unwrap()
    }

    #[test]
    fn star_and_empty_match_everything() {
        for raw in ["", "*", "**"] {
            let pattern = Pattern::parse(raw).unwrap();
            assert_eq!(pattern, Pattern::All);
            assert!(pattern.matches(&topic("anything/at/all")));
            assert!(pattern.transport_prefix().is_empty());
        }
    }

    #[test]
    fn prefix_pattern_matches_subtree() {
        let pattern = Pattern::parse("conversation/").unwrap();
        assert!(pattern.matches(&topic("conversation/user/input/v1")));
        assert!(!pattern.matches(&topic("memory/store/request")));
        assert_eq!(pattern.transport_prefix(), b"conversation/");
    }

    #[test]
    fn prefix_pattern_does_not_match_bare_prefix_topic() {
        // "conversation/" means "below conversation", not conversation itself.
        let pattern = Pattern::parse("conversation/").unwrap();
        assert!(!pattern.matches(&topic("conversation")));
    }

    #[test]
    fn exact_pattern_matches_only_itself() {
        let pattern = Pattern::parse("system/health").unwrap();
        assert!(pattern.matches(&topic("system/health")));
        assert!(!pattern.matches(&topic("system/health/extended")));
    }

    #[test]
    fn exact_transport_prefix_over_delivers() {
        // The transport stage alone would pass a/bc for pattern a/b; the
        // application matcher is what rejects it.
        let pattern = Pattern::parse("a/b").unwrap();
        let t = topic("a/bc");
        assert!(t.has_prefix(std::str::from_utf8(pattern.transport_prefix()).unwrap()));
        assert!(!pattern.matches(&t));
    }

    #[test]
    fn invalid_prefix_is_rejected() {
        assert!(Pattern::parse("Conversation/").is_err());
        assert!(Pattern::parse("a//").is_err());
    }

    #[test]
    fn serde_roundtrip() {
        for raw in ["**", "conversation/", "system/health"] {
            let pattern = Pattern::parse(raw).unwrap();
            let json = serde_json::to_string(&pattern).unwrap();
            let back: Pattern = serde_json::from_str(&json).unwrap();
            assert_eq!(back, pattern);
        }
    }
}
