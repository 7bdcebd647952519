//! MQTT topic filters and request-topic validation.
//!
//! Implements wildcard-aware superset comparison between topic filters and
//! the validation rules applied to subscribe/publish topics, including the
//! Basic Ingest (`$aws/rules/<rule>/...`) prefix exemption.

use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

/// Maximum number of forward slashes allowed in a request topic, excluding
/// the mandatory Basic Ingest segments.
pub const MAX_NUMBER_OF_FORWARD_SLASHES: usize = 7;
/// Maximum topic size in bytes of UTF-8, excluding the mandatory Basic
/// Ingest segments.
pub const MAX_LENGTH_OF_TOPIC: usize = 256;

const MULTI_LEVEL_WILDCARD: &str = "#";
const SINGLE_LEVEL_WILDCARD: &str = "+";

fn reserved_topic() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\$aws/rules/\S+/\S+$").unwrap())
}

fn reserved_topic_prefix() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\$aws/rules/\S+?/").unwrap())
}

/// Validation errors for subscribe/publish topics.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TopicError {
    #[error("topic must not be empty")]
    Empty,
    #[error("publish topic must not contain wildcard characters '#' or '+'")]
    WildcardInPublishTopic,
    #[error(
        "topic must have no more than {MAX_NUMBER_OF_FORWARD_SLASHES} forward slashes \
         (excluding the mandatory Basic Ingest segments)"
    )]
    TooManySlashes,
    #[error(
        "topic must be no longer than {MAX_LENGTH_OF_TOPIC} bytes of UTF-8 \
         (excluding the mandatory Basic Ingest segments)"
    )]
    TooLong,
    #[error("'#' is only allowed as the final topic level")]
    MultiLevelWildcardNotLast,
    #[error("wildcards must occupy a whole topic level")]
    WildcardNotWholeLevel,
}

/// An MQTT topic pattern: `/`-delimited levels where a level may be a
/// literal, `+` (single level) or `#` (remaining levels, terminal only).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicFilter(String);

impl TopicFilter {
    pub fn new(topic: impl Into<String>) -> Self {
        TopicFilter(topic.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True iff every concrete topic matched by `other` is matched by `self`.
    pub fn is_superset_of(&self, other: &TopicFilter) -> bool {
        topic_is_superset_of(&self.0, &other.0)
    }

    /// True iff this filter matches the given concrete topic.
    pub fn matches_topic(&self, topic: &str) -> bool {
        topic_is_superset_of(&self.0, topic)
    }
}

impl std::fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Level-by-level superset walk. `a` absorbs the remaining levels of `b`
/// once it reaches `#`; a `+` in `a` accepts any single level of `b`
/// (including `+` itself); everything else must match literally.
pub fn topic_is_superset_of(a: &str, b: &str) -> bool {
    let ours: Vec<&str> = a.split('/').collect();
    let theirs: Vec<&str> = b.split('/').collect();

    for i in 0.. {
        match (ours.get(i), theirs.get(i)) {
            (Some(&MULTI_LEVEL_WILDCARD), _) => return true,
            (Some(_), Some(&MULTI_LEVEL_WILDCARD)) => return false,
            (Some(&SINGLE_LEVEL_WILDCARD), Some(_)) => {}
            (Some(ours), Some(theirs)) if ours != theirs => return false,
            (Some(_), Some(_)) => {}
            (None, None) => return true,
            // Length mismatch without a '#' to absorb it.
            _ => return false,
        }
    }
    unreachable!("level walk always terminates")
}

/// Validate a topic filter for a subscribe request.
pub fn validate_subscribe_topic(topic: &str) -> Result<(), TopicError> {
    for (i, level) in topic.split('/').enumerate() {
        let is_last = i == topic.split('/').count() - 1;
        if level.contains('#') && (level != MULTI_LEVEL_WILDCARD || !is_last) {
            return if level == MULTI_LEVEL_WILDCARD {
                Err(TopicError::MultiLevelWildcardNotLast)
            } else {
                Err(TopicError::WildcardNotWholeLevel)
            };
        }
        if level.contains('+') && level != SINGLE_LEVEL_WILDCARD {
            return Err(TopicError::WildcardNotWholeLevel);
        }
    }
    validate_request_topic(topic)
}

/// Validate a topic for a publish request. Wildcards are never allowed.
pub fn validate_publish_topic(topic: &str) -> Result<(), TopicError> {
    if topic.contains('#') || topic.contains('+') {
        return Err(TopicError::WildcardInPublishTopic);
    }
    validate_request_topic(topic)
}

/// Shared slash-count and length limits. Basic Ingest topics have the
/// mandatory `$aws/rules/<rule>/` segments stripped before the checks.
fn validate_request_topic(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::Empty);
    }

    let lowered = topic.to_lowercase();
    let effective = if reserved_topic().is_match(&lowered) {
        reserved_topic_prefix()
            .splitn(&lowered, 2)
            .nth(1)
            .unwrap_or("")
            .to_string()
    } else {
        lowered
    };

    if effective.chars().filter(|c| *c == '/').count() > MAX_NUMBER_OF_FORWARD_SLASHES {
        return Err(TopicError::TooManySlashes);
    }
    if effective.len() > MAX_LENGTH_OF_TOPIC {
        return Err(TopicError::TooLong);
    }
    Ok(())
}
