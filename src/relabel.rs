//! Rule-driven transformation of target label sets. A rule chain may rewrite
//! labels or drop the target altogether.

use regex::Regex;
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh64::xxh64;

use crate::error::{Error, Result};
use crate::labels::Labels;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelabelAction {
    /// Overwrite the target label with the expanded replacement on match.
    Replace,
    /// Drop the target unless the concatenated source values match.
    Keep,
    /// Drop the target if the concatenated source values match.
    Drop,
    /// Set the target label to the hash of the source values modulo `modulus`.
    HashMod,
    /// Copy values of all labels whose name matches to names derived from the
    /// replacement template.
    LabelMap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelabelConfig {
    pub source_labels: Vec<String>,
    pub separator: String,
    pub regex: String,
    pub modulus: u64,
    pub target_label: String,
    pub replacement: String,
    pub action: RelabelAction,
}

impl Default for RelabelConfig {
    fn default() -> Self {
        RelabelConfig {
            source_labels: Vec::new(),
            separator: ";".to_string(),
            regex: "(.*)".to_string(),
            modulus: 0,
            target_label: String::new(),
            replacement: "$1".to_string(),
            action: RelabelAction::Replace,
        }
    }
}

/// Runs `labels` through the rule chain. `None` means the target was dropped.
pub fn process(labels: Labels, configs: &[RelabelConfig]) -> Result<Option<Labels>> {
    let mut labels = labels;
    for config in configs {
        match relabel(labels, config)? {
            Some(next) => labels = next,
            None => return Ok(None),
        }
    }
    Ok(Some(labels))
}

fn relabel(mut labels: Labels, config: &RelabelConfig) -> Result<Option<Labels>> {
    let regex = anchored(&config.regex)?;
    let value = config
        .source_labels
        .iter()
        .map(|name| labels.get(name).unwrap_or(""))
        .collect::<Vec<_>>()
        .join(&config.separator);

    match config.action {
        RelabelAction::Replace => {
            // No replacement takes place if the regex does not match.
            if let Some(caps) = regex.captures(&value) {
                let mut expanded = String::new();
                caps.expand(&config.replacement, &mut expanded);
                if expanded.is_empty() {
                    labels.del(&config.target_label);
                } else {
                    labels.set(config.target_label.clone(), expanded);
                }
            }
        }
        RelabelAction::Keep => {
            if !regex.is_match(&value) {
                return Ok(None);
            }
        }
        RelabelAction::Drop => {
            if regex.is_match(&value) {
                return Ok(None);
            }
        }
        RelabelAction::HashMod => {
            if config.modulus == 0 {
                return Err(Error::InvalidRelabelRule(
                    "hashmod action requires a non-zero modulus".to_string(),
                ));
            }
            let hashed = xxh64(value.as_bytes(), 0) % config.modulus;
            labels.set(config.target_label.clone(), hashed.to_string());
        }
        RelabelAction::LabelMap => {
            let mapped: Vec<(String, String)> = labels
                .iter()
                .filter_map(|(name, value)| {
                    regex.captures(name).map(|caps| {
                        let mut expanded = String::new();
                        caps.expand(&config.replacement, &mut expanded);
                        (expanded, value.to_string())
                    })
                })
                .collect();
            for (name, value) in mapped {
                if !name.is_empty() {
                    labels.set(name, value);
                }
            }
        }
    }
    Ok(Some(labels))
}

// Rule patterns always match against the full value.
fn anchored(pattern: &str) -> Result<Regex> {
    Regex::new(&format!("^(?:{})$", pattern)).map_err(|source| Error::InvalidRelabelPattern {
        pattern: pattern.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels() -> Labels {
        Labels::from_iter([("job", "node"), ("__address__", "localhost:9100")])
    }

    #[test]
    fn replace_sets_target_label_from_captures() {
        let config = RelabelConfig {
            source_labels: vec!["__address__".to_string()],
            regex: "([^:]+):(\\d+)".to_string(),
            target_label: "host".to_string(),
            replacement: "$1".to_string(),
            ..Default::default()
        };
        let out = process(labels(), &[config]).unwrap().unwrap();
        assert_eq!(out.get("host"), Some("localhost"));
    }

    #[test]
    fn replace_without_match_is_a_noop() {
        let config = RelabelConfig {
            source_labels: vec!["job".to_string()],
            regex: "blackbox".to_string(),
            target_label: "job".to_string(),
            replacement: "replaced".to_string(),
            ..Default::default()
        };
        let out = process(labels(), &[config]).unwrap().unwrap();
        assert_eq!(out.get("job"), Some("node"));
    }

    #[test]
    fn empty_replacement_deletes_the_target_label() {
        let config = RelabelConfig {
            source_labels: vec!["job".to_string()],
            regex: "node".to_string(),
            target_label: "job".to_string(),
            replacement: "".to_string(),
            ..Default::default()
        };
        let out = process(labels(), &[config]).unwrap().unwrap();
        assert_eq!(out.get("job"), None);
    }

    #[test]
    fn drop_matches_full_value_only() {
        let config = RelabelConfig {
            source_labels: vec!["job".to_string()],
            regex: "no".to_string(),
            action: RelabelAction::Drop,
            ..Default::default()
        };
        // "no" does not match the full value "node", so the target stays.
        assert!(process(labels(), &[config]).unwrap().is_some());

        let config = RelabelConfig {
            source_labels: vec!["job".to_string()],
            regex: "node".to_string(),
            action: RelabelAction::Drop,
            ..Default::default()
        };
        assert!(process(labels(), &[config]).unwrap().is_none());
    }

    #[test]
    fn keep_drops_non_matching_targets() {
        let config = RelabelConfig {
            source_labels: vec!["job".to_string()],
            regex: "blackbox".to_string(),
            action: RelabelAction::Keep,
            ..Default::default()
        };
        assert!(process(labels(), &[config]).unwrap().is_none());
    }

    #[test]
    fn missing_source_labels_concatenate_as_empty() {
        let config = RelabelConfig {
            source_labels: vec!["job".to_string(), "missing".to_string()],
            regex: "node;".to_string(),
            action: RelabelAction::Keep,
            ..Default::default()
        };
        assert!(process(labels(), &[config]).unwrap().is_some());
    }

    #[test]
    fn hashmod_assigns_a_bucket() {
        let config = RelabelConfig {
            source_labels: vec!["__address__".to_string()],
            modulus: 4,
            target_label: "__tmp_shard".to_string(),
            action: RelabelAction::HashMod,
            ..Default::default()
        };
        let out = process(labels(), &[config]).unwrap().unwrap();
        let shard: u64 = out.get("__tmp_shard").unwrap().parse().unwrap();
        assert!(shard < 4);
    }

    #[test]
    fn hashmod_requires_modulus() {
        let config = RelabelConfig {
            action: RelabelAction::HashMod,
            target_label: "shard".to_string(),
            ..Default::default()
        };
        assert!(process(labels(), &[config]).is_err());
    }

    #[test]
    fn labelmap_copies_matching_labels() {
        let mut input = labels();
        input.set("__meta_dc", "west");
        let config = RelabelConfig {
            regex: "__meta_(.+)".to_string(),
            replacement: "$1".to_string(),
            action: RelabelAction::LabelMap,
            ..Default::default()
        };
        let out = process(input, &[config]).unwrap().unwrap();
        assert_eq!(out.get("dc"), Some("west"));
        // The source label is left in place for later meta stripping.
        assert_eq!(out.get("__meta_dc"), Some("west"));
    }

    #[test]
    fn invalid_pattern_surfaces_an_error() {
        let config = RelabelConfig {
            regex: "(".to_string(),
            ..Default::default()
        };
        assert!(process(labels(), &[config]).is_err());
    }

    #[test]
    fn chain_stops_at_first_drop() {
        let drop_all = RelabelConfig {
            source_labels: vec!["job".to_string()],
            action: RelabelAction::Drop,
            ..Default::default()
        };
        let rename = RelabelConfig {
            source_labels: vec!["job".to_string()],
            target_label: "renamed".to_string(),
            ..Default::default()
        };
        assert!(process(labels(), &[drop_all, rename]).unwrap().is_none());
    }
}
