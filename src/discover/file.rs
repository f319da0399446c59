use std::fs;
use std::path::Path;

use async_trait::async_trait;
use log::warn;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::config::FileSdConfig;
use crate::discover::{TargetGroup, TargetProvider};
use crate::error::{Error, Result};
use crate::labels::Labels;
use crate::scrape::target::ADDRESS_LABEL;

/// Provider reading target groups from JSON files, re-read every refresh
/// interval. A file holds a list of `{"targets": [...], "labels": {...}}`
/// entries.
pub struct FileProvider {
    config: FileSdConfig,
}

#[derive(Debug, Deserialize)]
struct FileGroup {
    targets: Vec<String>,
    #[serde(default)]
    labels: Labels,
}

impl FileProvider {
    pub fn new(config: FileSdConfig) -> Self {
        FileProvider { config }
    }

    fn refresh(&self) -> Vec<TargetGroup> {
        let mut groups = Vec::new();
        for path in &self.config.files {
            match read_file(path) {
                Ok(file_groups) => groups.extend(file_groups),
                Err(err) => warn!("refreshing target groups failed: {}", err),
            }
        }
        groups
    }
}

fn read_file(path: &Path) -> Result<Vec<TargetGroup>> {
    let raw = fs::read(path).map_err(|source| Error::GroupFileRead {
        path: path.to_path_buf(),
        source,
    })?;
    let file_groups: Vec<FileGroup> =
        serde_json::from_slice(&raw).map_err(|source| Error::GroupFileFormat {
            path: path.to_path_buf(),
            source,
        })?;

    Ok(file_groups
        .into_iter()
        .enumerate()
        .map(|(i, group)| {
            let targets = group
                .targets
                .iter()
                .map(|address| {
                    let mut labels = Labels::new();
                    labels.set(ADDRESS_LABEL, address.clone());
                    labels
                })
                .collect();
            TargetGroup {
                // The path disambiguates groups across files of one provider.
                source: format!("{}:{}", path.display(), i),
                targets,
                labels: group.labels,
            }
        })
        .collect())
}

#[async_trait]
impl TargetProvider for FileProvider {
    async fn run(self: Box<Self>, token: CancellationToken, tx: mpsc::Sender<Vec<TargetGroup>>) {
        loop {
            let groups = self.refresh();
            tokio::select! {
                _ = token.cancelled() => return,
                sent = tx.send(groups) => {
                    if sent.is_err() {
                        return;
                    }
                }
            }
            tokio::select! {
                _ = token.cancelled() => return,
                _ = time::sleep(self.config.refresh_interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    fn write_temp(name: &str, contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("scrape-agent-test-{}-{}", std::process::id(), name));
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn reads_groups_with_path_scoped_sources() {
        let path = write_temp(
            "groups.json",
            r#"[
                {"targets": ["a:80", "b:80"], "labels": {"dc": "west"}},
                {"targets": ["c:80"]}
            ]"#,
        );

        let groups = read_file(&path).unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].source, format!("{}:0", path.display()));
        assert_eq!(groups[1].source, format!("{}:1", path.display()));
        assert_eq!(groups[0].targets[1].get(ADDRESS_LABEL), Some("b:80"));
        assert_eq!(groups[0].labels.get("dc"), Some("west"));
        assert!(groups[1].labels.is_empty());

        fs::remove_file(path).unwrap();
    }

    #[test]
    fn unreadable_files_are_skipped() {
        let good = write_temp("good.json", r#"[{"targets": ["a:80"]}]"#);
        let provider = FileProvider::new(FileSdConfig {
            files: vec!["/nonexistent/groups.json".into(), good.clone()],
            ..Default::default()
        });

        let groups = provider.refresh();
        assert_eq!(groups.len(), 1);

        fs::remove_file(good).unwrap();
    }

    #[test]
    fn malformed_json_is_an_error() {
        let path = write_temp("bad.json", "not json");
        assert!(read_file(&path).is_err());
        fs::remove_file(path).unwrap();
    }
}
