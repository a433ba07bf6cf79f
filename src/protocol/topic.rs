//! Topic names, topic filters and wildcard matching
//!
//! Topics are `/`-separated level strings. Filters may use `+` to match exactly one
//! level and `#` (last level only) to match any remaining levels, including none.
//! Topics starting with `$` are only matched by filters that name the `$` level
//! explicitly.

use thiserror::Error;

pub const SINGLE_LEVEL_WILDCARD: &str = "+";
pub const MULTI_LEVEL_WILDCARD: &str = "#";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TopicError {
    #[error("Topic must not be empty")]
    Empty,

    #[error("Topic name must not contain wildcards: {0}")]
    WildcardInName(String),

    #[error("Wildcard must occupy a whole level, '#' must be last: {0}")]
    MisplacedWildcard(String),

    #[error("Topic contains a NUL character")]
    NulCharacter,
}

/// Validates a topic name used for publishing
pub fn validate_topic_name(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::Empty);
    }
    if topic.contains('\0') {
        return Err(TopicError::NulCharacter);
    }
    if topic.contains(['+', '#']) {
        return Err(TopicError::WildcardInName(topic.to_string()));
    }
    Ok(())
}

/// Validates a topic filter used for subscribing
pub fn validate_topic_filter(filter: &str) -> Result<(), TopicError> {
    if filter.is_empty() {
        return Err(TopicError::Empty);
    }
    if filter.contains('\0') {
        return Err(TopicError::NulCharacter);
    }

    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;

    for (idx, level) in levels.iter().enumerate() {
        let has_wildcard = level.contains(['+', '#']);
        if !has_wildcard {
            continue;
        }

        let whole_level = *level == SINGLE_LEVEL_WILDCARD || *level == MULTI_LEVEL_WILDCARD;
        if !whole_level || (*level == MULTI_LEVEL_WILDCARD && idx != last) {
            return Err(TopicError::MisplacedWildcard(filter.to_string()));
        }
    }

    Ok(())
}

/// Checks whether a (valid) filter matches a (valid) topic name
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    // leading wildcards never match $-topics
    if topic.starts_with('$') {
        if let Some(first) = filter.split('/').next() {
            if first == SINGLE_LEVEL_WILDCARD || first == MULTI_LEVEL_WILDCARD {
                return false;
            }
        }
    }

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some(MULTI_LEVEL_WILDCARD), _) => return true,
            (Some(SINGLE_LEVEL_WILDCARD), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
