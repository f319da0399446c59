use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use log::debug;
use tokio::sync::RwLock;

use crate::appender::Appendable;
use crate::labels::Fingerprint;
use crate::scrape::target::Target;

/// Running targets partitioned by source, keyed by fingerprint within each
/// partition.
pub type TargetsBySource = HashMap<String, HashMap<Fingerprint, Arc<Target>>>;

/// Owns the running scrape loops of one job and reconciles them against a
/// desired set.
pub struct ScrapePool {
    appendable: Arc<dyn Appendable>,
    targets: RwLock<TargetsBySource>,
}

impl ScrapePool {
    pub fn new(appendable: Arc<dyn Appendable>) -> Self {
        ScrapePool {
            appendable,
            targets: RwLock::new(HashMap::new()),
        }
    }

    /// Replaces the running set with `desired`. Targets whose fingerprint is
    /// already running under the same source keep their in-flight scraper;
    /// new ones are started; stale ones are stopped. Returns only once every
    /// stop has completed, so a replacement scraper can never overlap storage
    /// writes with its predecessor. The running-set lock is held throughout,
    /// serializing reconciliations.
    pub async fn sync(&self, desired: TargetsBySource) {
        let mut running = self.targets.write().await;
        debug!("syncing {} target sources", desired.len());

        let mut next: TargetsBySource = HashMap::with_capacity(desired.len());
        let mut stopping: Vec<Arc<Target>> = Vec::new();

        for (source, desired_targets) in desired {
            let old = running.get(&source);
            let mut kept = HashMap::with_capacity(desired_targets.len());

            for (fp, target) in desired_targets {
                match old.and_then(|targets| targets.get(&fp)) {
                    // The freshly built duplicate is discarded in favor of the
                    // scraper already in flight.
                    Some(existing) => {
                        kept.insert(fp, Arc::clone(existing));
                    }
                    None => {
                        Arc::clone(&target).start(self.appendable.appender());
                        kept.insert(fp, target);
                    }
                }
            }

            if let Some(old) = old {
                for (fp, target) in old {
                    if !kept.contains_key(fp) {
                        stopping.push(Arc::clone(target));
                    }
                }
            }
            next.insert(source, kept);
        }

        // Sources that vanished entirely take all their targets with them.
        for (source, old) in running.iter() {
            if !next.contains_key(source) {
                stopping.extend(old.values().cloned());
            }
        }

        if !stopping.is_empty() {
            debug!("stopping {} stale scrapers", stopping.len());
            join_all(stopping.iter().map(|target| target.stop())).await;
        }
        *running = next;
    }

    /// Stops every running target and waits for all of them.
    pub async fn stop(&self) {
        let mut running = self.targets.write().await;
        let all: Vec<Arc<Target>> = running
            .values()
            .flat_map(|targets| targets.values().cloned())
            .collect();
        join_all(all.iter().map(|target| target.stop())).await;
        running.clear();
    }

    /// Snapshot of the currently-running targets.
    pub async fn targets(&self) -> Vec<Arc<Target>> {
        self.targets
            .read()
            .await
            .values()
            .flat_map(|targets| targets.values().cloned())
            .collect()
    }
}
