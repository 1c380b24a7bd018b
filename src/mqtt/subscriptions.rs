use std::collections::BTreeSet;

/// Topics replayed after every (re)connect.
///
/// A topic enters the set when a subscribe is requested, whether or not the
/// live request succeeds, and leaves it only through an explicit unsubscribe.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionSet {
    topics: BTreeSet<String>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the topic was not recorded yet.
    pub fn insert(&mut self, topic: &str) -> bool {
        self.topics.insert(topic.to_string())
    }

    pub fn remove(&mut self, topic: &str) -> bool {
        self.topics.remove(topic)
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.topics.contains(topic)
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.topics.iter().map(String::as_str)
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.topics.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicates_collapse_and_removal_is_explicit() {
        let mut set = SubscriptionSet::new();
        assert!(set.insert("a/set"));
        assert!(!set.insert("a/set"));
        assert!(set.insert("b/set"));
        assert_eq!(set.len(), 2);

        assert!(set.remove("a/set"));
        assert!(!set.contains("a/set"));
        assert_eq!(set.to_vec(), vec!["b/set".to_string()]);
    }
}
