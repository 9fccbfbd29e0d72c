/// Insertion-ordered set of topic filters, stored without the prefix.
///
/// Sets are small (a handful of sonde serials at most), so membership is a
/// linear scan and iteration order is the order filters were added.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicSet {
    filters: Vec<String>,
}

impl TopicSet {
    pub fn new() -> Self {
        Self {
            filters: Vec::new(),
        }
    }

    /// Builds a set from `filters`, dropping duplicates and keeping the first
    /// occurrence.
    pub fn from_filters<I, S>(filters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = Self::new();
        for filter in filters {
            set.insert(filter.into());
        }
        set
    }

    /// Returns `false` if the filter was already present.
    pub fn insert(&mut self, filter: String) -> bool {
        if self.contains(&filter) {
            return false;
        }
        self.filters.push(filter);
        true
    }

    /// Returns `false` if the filter was not present.
    pub fn remove(&mut self, filter: &str) -> bool {
        match self.filters.iter().position(|f| f == filter) {
            Some(idx) => {
                self.filters.remove(idx);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, filter: &str) -> bool {
        self.filters.iter().any(|f| f == filter)
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn clear(&mut self) {
        self.filters.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.filters.iter().map(String::as_str)
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.filters.clone()
    }

    /// Every filter joined onto `prefix`, as the broker sees them.
    pub fn full_topics(&self, prefix: &str) -> Vec<String> {
        self.iter().map(|f| full_topic(prefix, f)).collect()
    }
}

/// Joins `filter` onto `prefix` with a single `/`. An empty prefix leaves
/// the filter untouched.
pub fn full_topic(prefix: &str, filter: &str) -> String {
    if prefix.is_empty() {
        filter.to_string()
    } else {
        format!(
            "{}/{}",
            prefix.trim_end_matches('/'),
            filter.trim_start_matches('/')
        )
    }
}

/// Inverse of [`full_topic`]; topics outside the prefix are returned as is.
pub fn strip_prefix<'a>(prefix: &str, topic: &'a str) -> &'a str {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return topic;
    }
    topic
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('/'))
        .unwrap_or(topic)
}
