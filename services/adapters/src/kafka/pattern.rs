//! Topic pattern resolution
//!
//! `>`, `*` and `#` select every topic; any other pattern containing `*` is a
//! glob over the whole topic name; everything else names one topic.

use mq_types::{BrokerError, BrokerResult};
use regex::Regex;

#[derive(Debug, Clone)]
pub enum TopicMatcher {
    All,
    Glob(Regex),
    Exact(String),
}

impl TopicMatcher {
    pub fn new(pattern: &str) -> BrokerResult<Self> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return Err(BrokerError::subscription_failed("empty topic pattern"));
        }
        match pattern {
            ">" | "*" | "#" => Ok(Self::All),
            glob if glob.contains('*') => {
                let source = format!("^{}$", regex::escape(glob).replace(r"\*", ".*"));
                Regex::new(&source).map(Self::Glob).map_err(|e| {
                    BrokerError::subscription_failed(format!("bad topic pattern '{}': {}", glob, e))
                })
            }
            exact => Ok(Self::Exact(exact.to_string())),
        }
    }

    pub fn matches(&self, topic: &str) -> bool {
        match self {
            Self::All => true,
            Self::Glob(regex) => regex.is_match(topic),
            Self::Exact(name) => name == topic,
        }
    }

    /// Topics from `known` this matcher selects; an exact name is selected
    /// even before the topic shows up in metadata
    pub fn select<'a>(&'a self, known: &'a [String]) -> Vec<&'a str> {
        match self {
            Self::Exact(name) => vec![name.as_str()],
            _ => known
                .iter()
                .filter(|t| self.matches(t))
                .map(String::as_str)
                .collect(),
        }
    }
}
