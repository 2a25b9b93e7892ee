//! Topic filters
//!
//! A `TopicFilter` is a validated subscription pattern. Plain filters use the
//! usual hierarchical wildcards (`+` for one level, `#` for the remaining
//! levels). Shared filters carry a `$share/<group>/` prefix naming the
//! consumer group the broker balances across; matching always uses the
//! suffix after the group name.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::utils::error::Error;

const SHARE_PREFIX: &str = "$share/";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TopicFilter {
    raw: String,
    group: Option<String>,
}

impl TopicFilter {
    pub fn parse(raw: &str) -> Result<Self, Error> {
        let (filter, group) = match raw.strip_prefix(SHARE_PREFIX) {
            Some(rest) => {
                let (group, filter) = rest.split_once('/').ok_or_else(|| {
                    Error::InvalidTopicFilter(format!("'{raw}' has no filter after the group"))
                })?;
                if group.is_empty() || group.contains(['+', '#']) {
                    return Err(Error::InvalidTopicFilter(format!(
                        "'{raw}' has an invalid share group name"
                    )));
                }
                (filter, Some(group.to_string()))
            }
            None => (raw, None),
        };

        validate_filter(filter).map_err(|reason| {
            Error::InvalidTopicFilter(format!("'{raw}': {reason}"))
        })?;

        Ok(Self {
            raw: raw.to_string(),
            group,
        })
    }

    /// The filter exactly as subscribed, including any share prefix.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn share_group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    pub fn is_shared(&self) -> bool {
        self.group.is_some()
    }

    /// The part of the filter used for matching topic names.
    pub fn effective(&self) -> &str {
        match &self.group {
            Some(group) => &self.raw[SHARE_PREFIX.len() + group.len() + 1..],
            None => &self.raw,
        }
    }

    pub fn matches(&self, topic: &str) -> bool {
        topic_matches(self.effective(), topic)
    }
}

impl fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl TryFrom<String> for TopicFilter {
    type Error = Error;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        TopicFilter::parse(&raw)
    }
}

impl From<TopicFilter> for String {
    fn from(filter: TopicFilter) -> Self {
        filter.raw
    }
}

fn validate_filter(filter: &str) -> Result<(), &'static str> {
    if filter.is_empty() {
        return Err("filter is empty");
    }
    let levels: Vec<&str> = filter.split('/').collect();
    for (i, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || i != levels.len() - 1) {
            return Err("'#' must be a whole level and the last one");
        }
        if level.contains('+') && *level != "+" {
            return Err("'+' must occupy a whole level");
        }
    }
    Ok(())
}

/// Validates a topic name used for publishing.
pub fn validate_topic_name(topic: &str) -> Result<(), Error> {
    if topic.is_empty() {
        return Err(Error::InvalidTopicName("topic is empty".to_string()));
    }
    if topic.contains(['+', '#']) {
        return Err(Error::InvalidTopicName(format!(
            "'{topic}' contains wildcard characters"
        )));
    }
    Ok(())
}

/// Hierarchical matching of a topic name against a (non-shared) filter.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    // wildcards at the first level never match system topics
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
