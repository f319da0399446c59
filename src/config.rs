use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::labels::Labels;
use crate::relabel::RelabelConfig;

/// Configuration for one scrape job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrapeConfig {
    pub job_name: String,
    pub scheme: String,
    pub metrics_path: String,
    /// URL parameters appended to every scrape request. Only the first value
    /// of each parameter is propagated into the target label set.
    pub params: HashMap<String, Vec<String>>,
    pub scrape_interval: Duration,
    pub scrape_timeout: Duration,
    pub relabel_configs: Vec<RelabelConfig>,
    pub static_configs: Vec<StaticConfig>,
    pub file_sd_configs: Vec<FileSdConfig>,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        ScrapeConfig {
            job_name: String::new(),
            scheme: "http".to_string(),
            metrics_path: "/metrics".to_string(),
            params: HashMap::new(),
            scrape_interval: Duration::from_secs(15),
            scrape_timeout: Duration::from_secs(10),
            relabel_configs: Vec::new(),
            static_configs: Vec::new(),
            file_sd_configs: Vec::new(),
        }
    }
}

/// A literally-configured group of targets sharing one set of labels.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StaticConfig {
    pub targets: Vec<String>,
    pub labels: Labels,
}

/// Target groups read from JSON files, re-read on a fixed cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileSdConfig {
    pub files: Vec<PathBuf>,
    pub refresh_interval: Duration,
}

impl Default for FileSdConfig {
    fn default() -> Self {
        FileSdConfig {
            files: Vec::new(),
            refresh_interval: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scrape_config_defaults() {
        let cfg = ScrapeConfig::default();
        assert_eq!(cfg.scheme, "http");
        assert_eq!(cfg.metrics_path, "/metrics");
        assert_eq!(cfg.scrape_interval, Duration::from_secs(15));
    }

    #[test]
    fn partial_config_deserializes_with_defaults() {
        let cfg: ScrapeConfig =
            serde_json::from_str(r#"{"job_name": "node", "scheme": "https"}"#).unwrap();
        assert_eq!(cfg.job_name, "node");
        assert_eq!(cfg.scheme, "https");
        assert_eq!(cfg.metrics_path, "/metrics");
        assert!(cfg.static_configs.is_empty());
    }
}
