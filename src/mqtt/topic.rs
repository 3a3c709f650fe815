//! MQTT topic matching with wildcards
//!
//! Supports single-level (`+`) and multi-level (`#`) wildcards over
//! `/`-delimited levels, and a first-match rule table built on top of it.

/// Topic matcher for MQTT topic filters
#[derive(Debug, Clone, Copy, Default)]
pub struct TopicMatcher;

impl TopicMatcher {
    pub fn new() -> Self {
        Self
    }

    /// Check if a topic matches a topic filter
    ///
    /// * `+` matches exactly one topic level, including an empty one
    /// * `#` matches zero or more trailing levels (must be last)
    ///
    /// # Examples
    /// ```
    /// use tenant_mqtt_gateway::mqtt::TopicMatcher;
    ///
    /// let matcher = TopicMatcher::new();
    /// assert!(matcher.matches("sweet-home/a1/d/s", "sweet-home/+/d/s"));
    /// assert!(matcher.matches("sweet-home/a1/d/s/set", "sweet-home/#"));
    /// assert!(!matcher.matches("sweet-home/a1/r/s1", "sweet-home/+/d/s"));
    /// ```
    pub fn matches(&self, topic: &str, filter: &str) -> bool {
        let topic_levels: Vec<&str> = topic.split('/').collect();
        let filter_levels: Vec<&str> = filter.split('/').collect();

        match_levels(&topic_levels, &filter_levels)
    }

    /// Check if a topic filter is valid
    ///
    /// * `#` must be the last level and alone in it
    /// * `+` must be alone in its level
    pub fn is_valid_filter(&self, filter: &str) -> bool {
        if filter.is_empty() {
            return false;
        }

        let levels: Vec<&str> = filter.split('/').collect();

        levels.iter().enumerate().all(|(i, level)| {
            let hash_ok = !level.contains('#') || (*level == "#" && i == levels.len() - 1);
            let plus_ok = !level.contains('+') || *level == "+";
            hash_ok && plus_ok
        })
    }

    /// Check if a topic name is valid (no wildcards allowed)
    pub fn is_valid_topic(&self, topic: &str) -> bool {
        !topic.is_empty() && !topic.contains('+') && !topic.contains('#')
    }

    /// Check if a topic is a broker diagnostics topic
    pub fn is_system_topic(&self, topic: &str) -> bool {
        topic.starts_with("$SYS/")
    }
}

fn match_levels(topic: &[&str], filter: &[&str]) -> bool {
    let mut t_idx = 0;

    for (f_idx, f_level) in filter.iter().enumerate() {
        match *f_level {
            // # matches everything remaining
            "#" => return f_idx == filter.len() - 1,
            "+" => {
                if t_idx >= topic.len() {
                    return false;
                }
            }
            exact => {
                if t_idx >= topic.len() || topic[t_idx] != exact {
                    return false;
                }
            }
        }
        t_idx += 1;
    }

    t_idx == topic.len()
}

/// Ordered pattern → rule registry.
///
/// Lookups return the rule of the first registered pattern that matches a
/// concrete topic. Registering an existing pattern again replaces its rule
/// in place.
#[derive(Debug, Clone)]
pub struct RuleTable<R> {
    entries: Vec<(String, R)>,
    matcher: TopicMatcher,
}

impl<R> RuleTable<R> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            matcher: TopicMatcher::new(),
        }
    }

    /// Register a rule for a pattern
    pub fn insert(&mut self, pattern: impl Into<String>, rule: R) {
        let pattern = pattern.into();
        match self.entries.iter_mut().find(|(p, _)| *p == pattern) {
            Some(entry) => entry.1 = rule,
            None => self.entries.push((pattern, rule)),
        }
    }

    /// First rule whose pattern matches `topic`
    pub fn first_match(&self, topic: &str) -> Option<&R> {
        self.entries
            .iter()
            .find(|(pattern, _)| self.matcher.matches(topic, pattern))
            .map(|(_, rule)| rule)
    }

    /// Rule registered under exactly this pattern
    pub fn get(&self, pattern: &str) -> Option<&R> {
        self.entries
            .iter()
            .find(|(p, _)| p == pattern)
            .map(|(_, rule)| rule)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &R)> {
        self.entries.iter().map(|(p, r)| (p.as_str(), r))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<R> Default for RuleTable<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R, P: Into<String>> FromIterator<(P, R)> for RuleTable<R> {
    fn from_iter<I: IntoIterator<Item = (P, R)>>(iter: I) -> Self {
        let mut table = Self::new();
        for (pattern, rule) in iter {
            table.insert(pattern, rule);
        }
        table
    }
}

impl<R, P: Into<String>> Extend<(P, R)> for RuleTable<R> {
    fn extend<I: IntoIterator<Item = (P, R)>>(&mut self, iter: I) {
        for (pattern, rule) in iter {
            self.insert(pattern, rule);
        }
    }
}
