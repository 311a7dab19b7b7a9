use std::collections::HashMap;

/// Tracks every prefix of the registered function names together with the
/// number of names sharing it. The scanner asks "could the candidate still
/// become a known name" after each appended character, which makes
/// longest-match recognition possible in a single pass without re-scanning.
///
/// A hash map of prefix counts outperformed trie variants for the short
/// names a function catalog holds, so the simple structure stays.
#[derive(Clone, Debug, Default)]
pub struct PrefixIndex {
    counts: HashMap<String, usize>,
}

impl PrefixIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increments the reference count of every non-empty prefix of `name`.
    pub fn add(&mut self, name: &str) {
        let mut prefix = String::with_capacity(name.len());
        for c in name.chars() {
            prefix.push(c);
            *self.counts.entry(prefix.clone()).or_insert(0) += 1;
        }
    }

    /// Decrements the count of every prefix of `name` and drops prefixes
    /// whose count reaches zero. Prefixes shared with other names survive.
    pub fn remove(&mut self, name: &str) {
        let mut prefix = String::with_capacity(name.len());
        for c in name.chars() {
            prefix.push(c);
            if let Some(count) = self.counts.get_mut(&prefix) {
                if *count == 1 {
                    self.counts.remove(&prefix);
                } else {
                    *count -= 1;
                }
            }
        }
    }

    /// Whether `prefix` is a prefix of at least one registered name.
    pub fn contains(&self, prefix: &str) -> bool {
        self.counts.contains_key(prefix)
    }

    pub fn clear(&mut self) {
        self.counts.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_prefixes_survive_removal() {
        let mut idx = PrefixIndex::new();
        idx.add("sin");
        idx.add("sinh");
        assert!(idx.contains("s"));
        assert!(idx.contains("sin"));
        assert!(idx.contains("sinh"));
        idx.remove("sinh");
        assert!(idx.contains("sin"));
        assert!(!idx.contains("sinh"));
        idx.remove("sin");
        assert!(!idx.contains("s"));
    }

    #[test]
    fn test_membership_is_prefix_membership() {
        let mut idx = PrefixIndex::new();
        idx.add("sqrt");
        assert!(idx.contains("sq"));
        assert!(!idx.contains("qr"));
        assert!(!idx.contains(""));
        idx.clear();
        assert!(!idx.contains("s"));
    }
}
