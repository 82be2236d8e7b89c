// SPDX-License-Identifier: MIT OR Apache-2.0
//! Canonical hierarchical topics.
//!
//! A topic is a non-empty UTF-8 string of `/`-separated segments, all
//! lowercase, with no empty segment and no trailing slash. Canonical form is
//! enforced at publish and subscribe boundaries; the wire format only ever
//! carries canonical topics.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Violations of the canonical topic form.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopicError {
    /// The topic string was empty.
    #[error("topic is empty")]
    Empty,
    /// The topic ended with a `/`.
    #[error("topic has a trailing slash: {0}")]
    TrailingSlash(String),
    /// Two slashes in a row, or a leading slash.
    #[error("topic has an empty segment: {0}")]
    EmptySegment(String),
    /// A segment contained an uppercase character.
    #[error("topic is not lowercase: {0}")]
    NotLowercase(String),
    /// A segment contained whitespace or a control character.
    #[error("topic contains an invalid character: {0}")]
    InvalidCharacter(String),
}

/// A validated, canonical topic.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Topic(String);

impl Topic {
    /// Parse a string already expected to be in canonical form.
    ///
    /// # Errors
    ///
    /// Returns a [`TopicError`] describing the first violation found.
    pub fn parse(raw: &str) -> Result<Self, TopicError> {
        if raw.is_empty() {
            return Err(TopicError::Empty);
        }
        if raw.ends_with('/') {
            return Err(TopicError::TrailingSlash(raw.to_owned()));
        }
        for segment in raw.split('/') {
            if segment.is_empty() {
                return Err(TopicError::EmptySegment(raw.to_owned()));
            }
            for ch in segment.chars() {
                if ch.is_uppercase() {
                    return Err(TopicError::NotLowercase(raw.to_owned()));
                }
                if ch.is_whitespace() || ch.is_control() {
                    return Err(TopicError::InvalidCharacter(raw.to_owned()));
                }
            }
        }
        Ok(Self(raw.to_owned()))
    }

    /// View the topic as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// View the topic as raw bytes, as used by transport prefix filters.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Iterate the `/`-separated segments.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    /// Byte-prefix test, the transport-level filter primitive.
    ///
    /// The empty prefix matches every topic.
    #[must_use]
    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.0.as_bytes().starts_with(prefix.as_bytes())
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Topic {
    type Error = TopicError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Topic::parse(&value)
    }
}

impl From<Topic> for String {
    fn from(value: Topic) -> Self {
        value.0
    }
}

/// Convert a raw topic string into canonical form.
///
/// Accepts the legacy dot notation (`a.b.c`) still used by a few older
/// collaborators and rewrites it to slash form at this boundary; the wire
/// format never carries the dot form. No other repair happens: a
/// mixed-case topic stays an error rather than being silently rewritten,
/// so the publisher hears about it.
///
/// # Errors
///
/// Returns a [`TopicError`] when the rewritten string violates canonical
/// form (empty, uppercase, trailing slash, empty segment).
pub fn canonicalize(raw: &str) -> Result<Topic, TopicError> {
    let slashed = if raw.contains('/') {
        raw.to_owned()
    } else {
        raw.replace('.', "/")
    };
    Topic::parse(&slashed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_canonical_topics() {
        for raw in [
            "conversation/user/input/v1",
            "logs/scheduler/admission",
            "system/health",
            "a",
        ] {
            let topic = Topic::parse(raw).unwrap();
            assert_eq!(topic.as_str(), raw);
        }
    }

    #[test]
    fn rejects_empty() {
        assert_eq!(Topic::parse(""), Err(TopicError::Empty));
    }

    #[test]
    fn rejects_trailing_slash() {
        assert!(matches!(
            Topic::parse("conversation/"),
            Err(TopicError::TrailingSlash(_))
        ));
    }

    #[test]
    fn rejects_empty_segments() {
        assert!(matches!(Topic::parse("a//b"), Err(TopicError::EmptySegment(_))));
        assert!(matches!(Topic::parse("/a/b"), Err(TopicError::EmptySegment(_))));
    }

    #[test]
    fn rejects_mixed_case() {
        assert!(matches!(
            Topic::parse("Conversation/User"),
            Err(TopicError::NotLowercase(_))
        ));
    }

    #[test]
    fn rejects_whitespace() {
        assert!(matches!(
            Topic::parse("conversation/user input"),
            Err(TopicError::InvalidCharacter(_))
        ));
    }

    #[test]
    fn segments_iterates_in_order() {
        let topic = Topic::parse("a/b/c").unwrap();
        let segments: Vec<_> = topic.segments().collect();
        assert_eq!(segments, ["a", "b", "c"]);
    }

    #[test]
    fn prefix_matching_is_byte_based() {
        let topic = Topic::parse("conversation/user/input/v1").unwrap();
        assert!(topic.has_prefix(""));
        assert!(topic.has_prefix("conversation/"));
        assert!(topic.has_prefix("conversation/user"));
        assert!(!topic.has_prefix("memory/"));
    }

    #[test]
    fn canonicalize_rewrites_dot_notation() {
        let topic = canonicalize("emotion.state.update").unwrap();
        assert_eq!(topic.as_str(), "emotion/state/update");
    }

    #[test]
    fn canonicalize_rejects_mixed_case() {
        assert!(matches!(
            canonicalize("Conversation/User"),
            Err(TopicError::NotLowercase(_))
        ));
    }

    #[test]
    fn canonicalize_keeps_dots_inside_slashed_topics() {
        // Mixed input already in slash form keeps interior dots verbatim.
        let topic = canonicalize("tasks/demo.flaky/status").unwrap();
        assert_eq!(topic.as_str(), "tasks/demo.flaky/status");
    }

    #[test]
    fn serde_roundtrip() {
        let topic = Topic::parse("ui/state/update").unwrap();
        let json = serde_json::to_string(&topic).unwrap();
        let back: Topic = serde_json::from_str(&json).unwrap();
        assert_eq!(back, topic);
    }

    #[test]
    fn serde_rejects_non_canonical() {
        let err = serde_json::from_str::<Topic>("\"Bad/Topic\"");
        assert!(err.is_err());
    }
}
