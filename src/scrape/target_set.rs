use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::appender::Appendable;
use crate::config::ScrapeConfig;
use crate::discover::{TargetGroup, TargetProvider};
use crate::error::Result;
use crate::labels::Fingerprint;
use crate::scrape::pool::{ScrapePool, TargetsBySource};
use crate::scrape::target::{targets_from_group, Target};

/// Reconciliations are throttled to once per window so bursts of provider
/// churn collapse into a single diff.
const THROTTLE_INTERVAL: Duration = Duration::from_secs(5);

/// How long to wait for a provider's initial target set before treating it as
/// empty.
const INITIAL_SET_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-job unit tying the discovery providers of a scrape job to its
/// [`ScrapePool`]. Provider updates are folded into a desired map keyed by
/// `{provider name}/{group source}` and applied on a throttled cadence.
pub struct TargetSet {
    config: Mutex<Arc<ScrapeConfig>>,
    tgroups: RwLock<TargetsBySource>,
    scrape_pool: ScrapePool,
    sync_tx: mpsc::Sender<()>,
    sync_rx: tokio::sync::Mutex<mpsc::Receiver<()>>,
    cancel_providers: Mutex<Option<CancellationToken>>,
}

impl TargetSet {
    pub fn new(config: Arc<ScrapeConfig>, appendable: Arc<dyn Appendable>) -> Self {
        // A single-slot channel: a pending signal coalesces arbitrarily many
        // updates into the next reconciliation.
        let (sync_tx, sync_rx) = mpsc::channel(1);
        TargetSet {
            config: Mutex::new(config),
            tgroups: RwLock::new(HashMap::new()),
            scrape_pool: ScrapePool::new(appendable),
            sync_tx,
            sync_rx: tokio::sync::Mutex::new(sync_rx),
            cancel_providers: Mutex::new(None),
        }
    }

    /// Installs a new job configuration. Takes effect for subsequently built
    /// targets; the manager re-runs the providers afterwards.
    pub(crate) fn reload(&self, config: Arc<ScrapeConfig>) {
        *self.config.lock().unwrap() = config;
    }

    fn config(&self) -> Arc<ScrapeConfig> {
        self.config.lock().unwrap().clone()
    }

    /// The throttled reconciliation loop. Exits on cancellation, stopping the
    /// scrape pool so that no storage write happens afterwards.
    pub async fn run(&self, token: CancellationToken) {
        let mut sync_rx = self.sync_rx.lock().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = time::sleep(THROTTLE_INTERVAL) => {}
            }
            tokio::select! {
                _ = token.cancelled() => break,
                signal = sync_rx.recv() => match signal {
                    Some(()) => self.sync().await,
                    None => break,
                },
            }
        }
        self.scrape_pool.stop().await;
    }

    async fn sync(&self) {
        let snapshot = self.tgroups.read().await.clone();
        self.scrape_pool.sync(snapshot).await;
    }

    /// Swaps in a fresh provider cohort. The desired map is locked for the
    /// whole swap, which may block incoming updates for up to the initial-set
    /// window; the initial reconciliation happens immediately, outside the
    /// throttle.
    pub async fn run_providers(
        self: Arc<Self>,
        token: &CancellationToken,
        providers: HashMap<String, Box<dyn TargetProvider>>,
    ) {
        let mut tgroups = self.tgroups.write().await;

        let provider_token = {
            let mut cancel = self.cancel_providers.lock().unwrap();
            if let Some(previous) = cancel.take() {
                previous.cancel();
            }
            let child = token.child_token();
            *cancel = Some(child.clone());
            child
        };

        // The cohort re-delivers everything, so starting from an empty map
        // cannot lose targets.
        tgroups.clear();

        let mut initial = Vec::with_capacity(providers.len());
        for (name, provider) in providers {
            let (updates_tx, updates_rx) = mpsc::channel(1);
            let (initial_tx, initial_rx) = oneshot::channel();
            initial.push(initial_rx);

            debug!("starting provider {}", name);
            tokio::spawn(provider.run(provider_token.clone(), updates_tx));

            let set = Arc::clone(&self);
            let consumer_token = provider_token.clone();
            tokio::spawn(async move {
                set.consume_updates(name, updates_rx, consumer_token, initial_tx)
                    .await
            });
        }

        // First-sync barrier: every provider has either delivered its initial
        // set or timed out once all the oneshots resolve.
        for initial_rx in initial {
            if let Ok(entries) = initial_rx.await {
                for (key, targets) in entries {
                    tgroups.insert(key, targets);
                }
            }
        }
        drop(tgroups);

        self.sync().await;
    }

    async fn consume_updates(
        self: Arc<Self>,
        name: String,
        mut updates: mpsc::Receiver<Vec<TargetGroup>>,
        token: CancellationToken,
        initial_tx: oneshot::Sender<Vec<(String, HashMap<Fingerprint, Arc<Target>>)>>,
    ) {
        let config = self.config();
        let mut entries = Vec::new();

        tokio::select! {
            _ = token.cancelled() => {}
            batch = updates.recv() => {
                if let Some(batch) = batch {
                    for tgroup in &batch {
                        match targets_from_group(tgroup, &config) {
                            Ok(targets) => {
                                entries.push((format!("{}/{}", name, tgroup.source), targets));
                            }
                            Err(err) => {
                                error!("target update for group {:?} failed: {}", tgroup.source, err);
                            }
                        }
                    }
                }
            }
            _ = time::sleep(INITIAL_SET_TIMEOUT) => {
                // The initial set did not arrive in time. Act as if it were
                // empty and pick it up as a regular update later.
            }
        }
        let _ = initial_tx.send(entries);

        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                batch = updates.recv() => match batch {
                    Some(batch) => {
                        for tgroup in &batch {
                            if let Err(err) = self.update(&name, tgroup).await {
                                error!("target update for group {:?} failed: {}", tgroup.source, err);
                            }
                        }
                    }
                    // The provider exited and closed its channel.
                    None => return,
                },
            }
        }
    }

    /// Rebuilds the targets of one group and stages them in the desired map.
    async fn update(&self, name: &str, tgroup: &TargetGroup) -> Result<()> {
        let config = self.config();
        let targets = targets_from_group(tgroup, &config)?;
        self.tgroups
            .write()
            .await
            .insert(format!("{}/{}", name, tgroup.source), targets);

        // Non-blocking: a signal that is already pending covers this update
        // too, since the loop snapshots the newest state.
        let _ = self.sync_tx.try_send(());
        Ok(())
    }

    /// Snapshot of the targets currently running in this set's pool.
    pub async fn targets(&self) -> Vec<Arc<Target>> {
        self.scrape_pool.targets().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex as StdMutex;

    use crate::appender::{Appender, Appendable, RawSample};
    use crate::labels::Labels;
    use crate::scrape::target::ADDRESS_LABEL;

    #[derive(Clone, Default)]
    struct NullStorage(Arc<StdMutex<Vec<RawSample>>>);

    impl Appender for NullStorage {
        fn append(&self, _labels: &Labels, sample: RawSample) -> crate::Result<()> {
            self.0.lock().unwrap().push(sample);
            Ok(())
        }
    }

    impl Appendable for NullStorage {
        fn appender(&self) -> Arc<dyn Appender> {
            Arc::new(self.clone())
        }
    }

    fn target_set(job: &str) -> Arc<TargetSet> {
        let config = Arc::new(ScrapeConfig {
            job_name: job.to_string(),
            ..Default::default()
        });
        Arc::new(TargetSet::new(config, Arc::new(NullStorage::default())))
    }

    fn tgroup(source: &str, addresses: &[&str]) -> TargetGroup {
        TargetGroup {
            source: source.to_string(),
            targets: addresses
                .iter()
                .map(|address| Labels::from_iter([(ADDRESS_LABEL, *address)]))
                .collect(),
            labels: Labels::new(),
        }
    }

    #[tokio::test]
    async fn update_stages_under_the_composite_key() {
        let set = target_set("node");

        set.update("static/0", &tgroup("0", &["127.0.0.1:1"]))
            .await
            .unwrap();
        set.update("file/0", &tgroup("0", &["127.0.0.1:2"]))
            .await
            .unwrap();

        let tgroups = set.tgroups.read().await;
        assert_eq!(tgroups.len(), 2);
        assert!(tgroups.contains_key("static/0/0"));
        assert!(tgroups.contains_key("file/0/0"));
    }

    #[tokio::test]
    async fn update_signals_are_coalesced() {
        let set = target_set("node");

        for i in 0..10 {
            set.update("static/0", &tgroup("0", &[&format!("127.0.0.1:{}", i + 1)]))
                .await
                .unwrap();
        }

        // Exactly one signal is pending regardless of the burst size.
        let mut sync_rx = set.sync_rx.lock().await;
        assert!(sync_rx.try_recv().is_ok());
        assert!(sync_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn failing_group_leaves_previous_state_unchanged() {
        let set = target_set("node");

        set.update("static/0", &tgroup("0", &["127.0.0.1:1"]))
            .await
            .unwrap();
        // The second instance has no address, so the whole group is rejected.
        let bad = TargetGroup {
            source: "0".to_string(),
            targets: vec![Labels::from_iter([("dc", "west")])],
            labels: Labels::new(),
        };
        assert!(set.update("static/0", &bad).await.is_err());

        let tgroups = set.tgroups.read().await;
        assert_eq!(tgroups["static/0/0"].len(), 1);
    }
}
