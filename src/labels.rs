use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh64::Xxh64;

const SEP: u8 = 0xff;

/// A set of labels keyed by name. The underlying map is ordered, so iteration
/// and hashing are canonical regardless of insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Labels(BTreeMap<String, String>);

impl Labels {
    pub fn new() -> Self {
        Labels(BTreeMap::new())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn del(&mut self, name: &str) -> Option<String> {
        self.0.remove(name)
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&str, &str) -> bool) {
        self.0.retain(|name, value| keep(name, value));
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Stable hash over the full label set.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = Xxh64::new(0);
        for (name, value) in &self.0 {
            hasher.update(name.as_bytes());
            hasher.update(&[SEP]);
            hasher.update(value.as_bytes());
            hasher.update(&[SEP]);
        }
        Fingerprint(hasher.digest())
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (name, value)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}=\"{}\"", name, value)?;
        }
        write!(f, "}}")
    }
}

impl FromIterator<(String, String)> for Labels {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Labels(iter.into_iter().collect())
    }
}

impl<'a> FromIterator<(&'a str, &'a str)> for Labels {
    fn from_iter<T: IntoIterator<Item = (&'a str, &'a str)>>(iter: T) -> Self {
        Labels(
            iter.into_iter()
                .map(|(n, v)| (n.to_string(), v.to_string()))
                .collect(),
        )
    }
}

/// Identity of a final label set within one source partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(u64);

impl Fingerprint {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_insertion_order_independent() {
        let mut a = Labels::new();
        a.set("job", "node");
        a.set("__address__", "localhost:9100");

        let mut b = Labels::new();
        b.set("__address__", "localhost:9100");
        b.set("job", "node");

        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_differs_on_value_change() {
        let a = Labels::from_iter([("job", "node")]);
        let b = Labels::from_iter([("job", "blackbox")]);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn set_overwrites_existing_value() {
        let mut labels = Labels::from_iter([("job", "node")]);
        labels.set("job", "other");
        assert_eq!(labels.get("job"), Some("other"));
        assert_eq!(labels.len(), 1);
    }

    #[test]
    fn display_renders_sorted_pairs() {
        let labels = Labels::from_iter([("b", "2"), ("a", "1")]);
        assert_eq!(labels.to_string(), r#"{a="1", b="2"}"#);
    }
}
