//! Topic Routing Key
//!
//! A topic is the opaque, immutable string that identifies one logical
//! stream on the venue (for example `btcusdt@aggTrade`). It is the only
//! key the multiplexer routes on.

use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

use serde::{Serialize, Serializer};

/// Immutable topic name, cheap to clone.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Topic(Arc<str>);

impl Topic {
    /// Create a topic from any string-like value.
    #[must_use]
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self(name.into())
    }

    /// Get the topic name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Topic({})", &self.0)
    }
}

impl From<&str> for Topic {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for Topic {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

impl From<&Self> for Topic {
    fn from(topic: &Self) -> Self {
        topic.clone()
    }
}

impl Borrow<str> for Topic {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl Serialize for Topic {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn topic_equality_is_by_name() {
        let a = Topic::from("btcusdt@aggTrade");
        let b = Topic::from("btcusdt@aggTrade".to_string());
        assert_eq!(a, b);
        assert_ne!(a, Topic::from("ethusdt@aggTrade"));
    }

    #[test]
    fn topic_lookup_by_str() {
        let mut map = HashMap::new();
        map.insert(Topic::from("btcusdt@depth"), 1);
        assert_eq!(map.get("btcusdt@depth"), Some(&1));
    }

    #[test]
    fn topic_display_and_serialize() {
        let topic = Topic::from("btcusdt@depth");
        assert_eq!(topic.to_string(), "btcusdt@depth");
        assert_eq!(
            serde_json::to_string(&topic).unwrap(),
            "\"btcusdt@depth\""
        );
    }
}
