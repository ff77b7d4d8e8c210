//! Topic name/filter validation and wildcard matching
//!
//! Implements the MQTT v3.1.1 topic rules: `/` separates levels, `+` matches
//! exactly one level, `#` matches the parent level and any number of child
//! levels and must be last. Topics starting with `$` are not matched by a
//! wildcard in the first level.

use thiserror::Error;

/// Longest topic the 16-bit length prefix can carry
pub const MAX_TOPIC_LEN: usize = 65_535;

pub fn validate_topic_name(topic: &str) -> Result<(), TopicError> {
    check_common(topic)?;
    if topic.contains(['+', '#']) {
        return Err(TopicError::WildcardInTopicName(topic.to_string()));
    }
    Ok(())
}

pub fn validate_topic_filter(filter: &str) -> Result<(), TopicError> {
    check_common(filter)?;

    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;
    for (index, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || index != last) {
            return Err(TopicError::InvalidMultiLevelWildcard(filter.to_string()));
        }
        if level.contains('+') && *level != "+" {
            return Err(TopicError::InvalidSingleLevelWildcard(filter.to_string()));
        }
    }
    Ok(())
}

fn check_common(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::Empty);
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err(TopicError::TooLong(topic.len()));
    }
    if topic.contains('\u{0}') {
        return Err(TopicError::NullCharacter);
    }
    Ok(())
}

/// Whether `topic` matches `filter`
///
/// Both arguments are assumed valid; an invalid filter simply fails to match.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TopicError {
    #[error("Topic cannot be empty")]
    Empty,
    #[error("Topic of {0} bytes exceeds 65535")]
    TooLong(usize),
    #[error("Topic contains U+0000")]
    NullCharacter,
    #[error("Topic name must not contain wildcards: '{0}'")]
    WildcardInTopicName(String),
    #[error("'#' must occupy the whole last level: '{0}'")]
    InvalidMultiLevelWildcard(String),
    #[error("'+' must occupy a whole level: '{0}'")]
    InvalidSingleLevelWildcard(String),
}
