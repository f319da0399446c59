//! Target discovery. A provider watches one discovery mechanism and emits
//! batches of target groups; the factory assembles the provider cohort for a
//! scrape job.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::ScrapeConfig;
use crate::labels::Labels;

pub mod file;
pub mod static_targets;

/// A bundle of targets sharing a stable source identifier and group labels.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetGroup {
    /// Uniquely identifies this group within its provider.
    pub source: String,
    pub targets: Vec<Labels>,
    pub labels: Labels,
}

/// A discovery mechanism emitting a stream of target-group batches.
///
/// Contract: the first message carries the full currently-known set; every
/// subsequent change produces a new message; `tx` is closed (dropped) when no
/// more messages will be sent; `run` returns promptly once `token` is
/// cancelled.
#[async_trait]
pub trait TargetProvider: Send + 'static {
    async fn run(self: Box<Self>, token: CancellationToken, tx: mpsc::Sender<Vec<TargetGroup>>);
}

/// Builds the provider cohort for one scrape job, keyed by a synthetic
/// `{mechanism}/{ordinal}` name unique within the job.
pub fn providers_from_config(config: &ScrapeConfig) -> HashMap<String, Box<dyn TargetProvider>> {
    let mut providers: HashMap<String, Box<dyn TargetProvider>> = HashMap::new();
    for (i, file_config) in config.file_sd_configs.iter().enumerate() {
        providers.insert(
            format!("file/{}", i),
            Box::new(file::FileProvider::new(file_config.clone())),
        );
    }
    providers.insert(
        "static/0".to_string(),
        Box::new(static_targets::StaticProvider::new(&config.static_configs)),
    );
    providers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FileSdConfig, StaticConfig};

    #[test]
    fn cohort_names_are_unique_per_mechanism() {
        let config = ScrapeConfig {
            job_name: "node".to_string(),
            static_configs: vec![StaticConfig::default()],
            file_sd_configs: vec![FileSdConfig::default(), FileSdConfig::default()],
            ..Default::default()
        };
        let providers = providers_from_config(&config);
        let mut names: Vec<_> = providers.keys().cloned().collect();
        names.sort();
        assert_eq!(names, vec!["file/0", "file/1", "static/0"]);
    }

    #[test]
    fn static_provider_is_always_installed() {
        let providers = providers_from_config(&ScrapeConfig::default());
        assert!(providers.contains_key("static/0"));
    }
}
