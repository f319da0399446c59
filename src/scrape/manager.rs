use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use log::{debug, info};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::appender::Appendable;
use crate::config::ScrapeConfig;
use crate::discover::providers_from_config;
use crate::scrape::target::{Target, JOB_LABEL};
use crate::scrape::target_set::TargetSet;

/// Top-level coordinator owning one [`TargetSet`] per configured scrape job.
#[derive(Clone)]
pub struct TargetManager {
    appendable: Arc<dyn Appendable>,
    inner: Arc<RwLock<Inner>>,
}

#[derive(Default)]
struct Inner {
    scrape_configs: Vec<Arc<ScrapeConfig>>,
    target_sets: HashMap<String, Arc<TargetSet>>,
    cancel: Option<CancellationToken>,
    tracker: Option<TaskTracker>,
    running: bool,
}

impl TargetManager {
    pub fn new(appendable: Arc<dyn Appendable>) -> Self {
        TargetManager {
            appendable,
            inner: Arc::new(RwLock::new(Inner::default())),
        }
    }

    /// Replaces the scrape-config list. A running manager is stopped first,
    /// awaiting full quiescence, and restarted with the new configuration in
    /// a background task once the swap is done.
    pub async fn apply_config(&self, configs: Vec<ScrapeConfig>) -> bool {
        let running = self.inner.read().await.running;
        if running {
            self.stop().await;
        }

        self.inner.write().await.scrape_configs = configs.into_iter().map(Arc::new).collect();

        if running {
            let manager = self.clone();
            tokio::spawn(async move { manager.run().await });
        }
        true
    }

    /// Starts discovery and scraping for every configured job and blocks
    /// until every reconciliation loop has exited. Target sets survive
    /// restarts as long as their job name stays configured.
    pub async fn run(&self) {
        info!("starting target manager");

        // Only quick state transitions happen under the lock: the provider
        // installs below can each block for the full initial-set window.
        let (token, tracker, pending) = {
            let mut inner = self.inner.write().await;
            let token = CancellationToken::new();
            let tracker = TaskTracker::new();
            inner.cancel = Some(token.clone());
            inner.tracker = Some(tracker.clone());
            inner.running = true;

            let configs = inner.scrape_configs.clone();
            let mut previous = std::mem::take(&mut inner.target_sets);
            let mut pending = Vec::with_capacity(configs.len());

            for config in configs {
                let set = match previous.remove(&config.job_name) {
                    Some(set) => {
                        set.reload(Arc::clone(&config));
                        set
                    }
                    None => Arc::new(TargetSet::new(
                        Arc::clone(&config),
                        Arc::clone(&self.appendable),
                    )),
                };

                let loop_set = Arc::clone(&set);
                let loop_token = token.clone();
                tracker.spawn(async move { loop_set.run(loop_token).await });
                pending.push((config, set));
            }

            // Sets whose job disappeared are dropped here; their loops were
            // already torn down when the previous run stopped.
            (token, tracker, pending)
        };

        join_all(pending.iter().map(|(config, set)| {
            Arc::clone(set).run_providers(&token, providers_from_config(config))
        }))
        .await;

        {
            let mut inner = self.inner.write().await;
            inner.target_sets = pending
                .into_iter()
                .map(|(config, set)| (config.job_name.clone(), set))
                .collect();
        }
        tracker.close();

        tracker.wait().await;
        debug!("target manager stopped");
    }

    /// Cancels the base scope and waits for every reconciliation loop, and
    /// with them every in-flight scrape write, to finish.
    pub async fn stop(&self) {
        info!("stopping target manager");

        let (cancel, tracker) = {
            let mut inner = self.inner.write().await;
            inner.running = false;
            (inner.cancel.take(), inner.tracker.take())
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        if let Some(tracker) = tracker {
            tracker.wait().await;
        }
    }

    /// Snapshot of all running targets, grouped by their `job` label. The
    /// label usually matches the owning job's name but can diverge under
    /// relabeling; the view honors the label.
    pub async fn pools(&self) -> HashMap<String, Vec<Arc<Target>>> {
        let target_sets: Vec<Arc<TargetSet>> =
            self.inner.read().await.target_sets.values().cloned().collect();

        let mut pools: HashMap<String, Vec<Arc<Target>>> = HashMap::new();
        for set in target_sets {
            for target in set.targets().await {
                let job = target.labels().get(JOB_LABEL).unwrap_or_default().to_string();
                pools.entry(job).or_default().push(target);
            }
        }
        pools
    }
}
