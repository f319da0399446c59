use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::StaticConfig;
use crate::discover::{TargetGroup, TargetProvider};
use crate::labels::Labels;
use crate::scrape::target::ADDRESS_LABEL;

/// Provider for literally-configured target groups. Emits its full set once,
/// then closes the channel.
pub struct StaticProvider {
    groups: Vec<TargetGroup>,
}

impl StaticProvider {
    pub fn new(configs: &[StaticConfig]) -> Self {
        let groups = configs
            .iter()
            .enumerate()
            .map(|(i, config)| {
                let targets = config
                    .targets
                    .iter()
                    .map(|address| {
                        let mut labels = Labels::new();
                        labels.set(ADDRESS_LABEL, address.clone());
                        labels
                    })
                    .collect();
                TargetGroup {
                    // Ordinal sources keep group identity stable across emits.
                    source: i.to_string(),
                    targets,
                    labels: config.labels.clone(),
                }
            })
            .collect();
        StaticProvider { groups }
    }
}

#[async_trait]
impl TargetProvider for StaticProvider {
    async fn run(self: Box<Self>, token: CancellationToken, tx: mpsc::Sender<Vec<TargetGroup>>) {
        tokio::select! {
            _ = token.cancelled() => {}
            _ = tx.send(self.groups) => {}
        }
    }
}
