use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::{debug, error, warn};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::appender::{Appender, RawSample};
use crate::config::ScrapeConfig;
use crate::discover::TargetGroup;
use crate::error::{Error, Result};
use crate::labels::{Fingerprint, Labels};
use crate::relabel;

pub const ADDRESS_LABEL: &str = "__address__";
pub const SCHEME_LABEL: &str = "__scheme__";
pub const METRICS_PATH_LABEL: &str = "__metrics_path__";
pub const JOB_LABEL: &str = "job";
pub const INSTANCE_LABEL: &str = "instance";
pub const PARAM_LABEL_PREFIX: &str = "__param_";
pub const META_LABEL_PREFIX: &str = "__meta_";
pub const RESERVED_LABEL_PREFIX: &str = "__";

// TargetHealth describes the health state of a target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TargetHealth {
    #[default]
    Unknown,
    Good,
    Bad,
}

#[derive(Debug, Clone, Default)]
pub struct TargetStatus {
    pub health: TargetHealth,
    pub last_error: Option<String>,
    pub last_scrape: Option<SystemTime>,
    pub last_scrape_duration: Duration,
}

struct Scraper {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// One HTTP or HTTPS endpoint scraped on its own loop.
pub struct Target {
    labels: Labels,
    discovered_labels: Labels,
    fingerprint: Fingerprint,
    config: Arc<ScrapeConfig>,
    scrape_url: Url,

    scraper: Mutex<Option<Scraper>>,
    status: RwLock<TargetStatus>,
}

impl Target {
    pub fn new(labels: Labels, discovered_labels: Labels, config: Arc<ScrapeConfig>) -> Result<Self> {
        let fingerprint = labels.fingerprint();
        let scrape_url = url_from_target(&labels, &config.params)?;
        Ok(Target {
            labels,
            discovered_labels,
            fingerprint,
            config,
            scrape_url,
            scraper: Mutex::new(None),
            status: RwLock::new(TargetStatus::default()),
        })
    }

    /// The label set after relabeling, identifying this target.
    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    /// The label set as produced by discovery, before relabeling.
    pub fn discovered_labels(&self) -> &Labels {
        &self.discovered_labels
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    pub fn scrape_url(&self) -> &Url {
        &self.scrape_url
    }

    pub fn status(&self) -> TargetStatus {
        self.status.read().unwrap().clone()
    }

    pub fn is_running(&self) -> bool {
        self.scraper.lock().unwrap().is_some()
    }

    /// Launches the scrape loop, writing samples through `appender`.
    pub fn start(self: Arc<Self>, appender: Arc<dyn Appender>) {
        let token = CancellationToken::new();
        let target = Arc::clone(&self);
        let loop_token = token.clone();
        let handle = tokio::spawn(async move { target.scrape_loop(appender, loop_token).await });
        *self.scraper.lock().unwrap() = Some(Scraper { token, handle });
    }

    /// Stops the scrape loop and waits for it to exit. A write that is already
    /// in flight completes before this returns.
    pub async fn stop(&self) {
        let scraper = self.scraper.lock().unwrap().take();
        if let Some(scraper) = scraper {
            scraper.token.cancel();
            if let Err(err) = scraper.handle.await {
                if !err.is_cancelled() {
                    error!("scrape loop for {} terminated abnormally: {}", self.scrape_url, err);
                }
            }
        }
    }

    async fn scrape_loop(self: Arc<Self>, appender: Arc<dyn Appender>, token: CancellationToken) {
        let client = match reqwest::Client::builder()
            .timeout(self.config.scrape_timeout)
            .build()
        {
            Ok(client) => client,
            Err(err) => {
                error!("building scrape client for {} failed: {}", self.scrape_url, err);
                return;
            }
        };

        // Spread the scrapes of a job across the interval.
        tokio::select! {
            _ = token.cancelled() => return,
            _ = time::sleep(self.scrape_offset(self.config.scrape_interval)) => {}
        }

        let mut ticker = time::interval(self.config.scrape_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => {}
            }
            self.scrape(&client, appender.as_ref()).await;
        }
    }

    async fn scrape(&self, client: &reqwest::Client, appender: &dyn Appender) {
        let started_at = SystemTime::now();
        let started = Instant::now();

        let outcome = match self.fetch(client).await {
            Ok(body) => appender
                .append(&self.labels, RawSample { raw_metrics: body })
                .map_err(|err| {
                    warn!("appending sample from {} failed: {}", self.scrape_url, err);
                    err.to_string()
                }),
            Err(err) => {
                debug!("scraping {} failed: {}", self.scrape_url, err);
                Err(err.to_string())
            }
        };

        let mut status = self.status.write().unwrap();
        status.health = if outcome.is_ok() {
            TargetHealth::Good
        } else {
            TargetHealth::Bad
        };
        status.last_error = outcome.err();
        status.last_scrape = Some(started_at);
        status.last_scrape_duration = started.elapsed();
    }

    async fn fetch(&self, client: &reqwest::Client) -> Result<Vec<u8>, reqwest::Error> {
        let response = client
            .get(self.scrape_url.clone())
            .send()
            .await?
            .error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }

    fn scrape_offset(&self, interval: Duration) -> Duration {
        let interval_ns = interval.as_nanos() as u64;
        if interval_ns == 0 {
            return Duration::ZERO;
        }
        let now_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        let base = now_ns % interval_ns;
        let offset = self.fingerprint.as_u64() % interval_ns;
        let next = base + offset;
        if next > interval_ns {
            Duration::from_nanos(next - interval_ns)
        } else {
            Duration::from_nanos(next)
        }
    }
}

impl std::fmt::Debug for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Target")
            .field("labels", &self.labels)
            .field("url", &self.scrape_url.as_str())
            .finish()
    }
}

fn url_from_target(labels: &Labels, params: &HashMap<String, Vec<String>>) -> Result<Url> {
    let mut query: BTreeMap<String, Vec<String>> =
        params.iter().map(|(k, v)| (k.clone(), v.clone())).collect();

    for (name, value) in labels.iter() {
        if let Some(key) = name.strip_prefix(PARAM_LABEL_PREFIX) {
            let values = query.entry(key.to_string()).or_default();
            if values.is_empty() {
                values.push(value.to_string());
            } else {
                values[0] = value.to_string();
            }
        }
    }

    let scheme = labels.get(SCHEME_LABEL).unwrap_or("http");
    let address = labels.get(ADDRESS_LABEL).unwrap_or_default();
    let path = labels.get(METRICS_PATH_LABEL).unwrap_or("/metrics");

    let mut url = Url::parse(&format!("{}://{}{}", scheme, address, path))?;
    if !query.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (key, values) in &query {
            for value in values {
                pairs.append_pair(key, value);
            }
        }
        drop(pairs);
    }
    Ok(url)
}

fn check_target_address(address: &str) -> Result<()> {
    if address.contains('/') {
        return Err(Error::InvalidAddress {
            address: address.to_string(),
            reason: "not a valid hostname".to_string(),
        });
    }
    if let Some((host, port)) = address.rsplit_once(':') {
        if host.is_empty() {
            return Err(Error::InvalidAddress {
                address: address.to_string(),
                reason: "missing host".to_string(),
            });
        }
        if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::InvalidAddress {
                address: address.to_string(),
                reason: "invalid port".to_string(),
            });
        }
    }
    Ok(())
}

/// Builds the targets of one group, keyed by fingerprint. Label sets that the
/// relabel chain drops are skipped; any hard error discards the whole group.
pub fn targets_from_group(
    tgroup: &TargetGroup,
    config: &Arc<ScrapeConfig>,
) -> Result<HashMap<Fingerprint, Arc<Target>>> {
    let mut targets = HashMap::with_capacity(tgroup.targets.len());

    for (i, tlset) in tgroup.targets.iter().enumerate() {
        let mut labels = tlset.clone();

        for (key, values) in &config.params {
            if let Some(value) = values.first() {
                labels.set(format!("{}{}", PARAM_LABEL_PREFIX, key), value.clone());
            }
        }

        // Defaults, lowest precedence first: group labels, then the per-job
        // scheme, path and job name. Existing labels are never overwritten.
        for (name, value) in tgroup.labels.iter() {
            if labels.get(name).is_none() {
                labels.set(name.to_string(), value.to_string());
            }
        }
        for (name, value) in [
            (SCHEME_LABEL, config.scheme.as_str()),
            (METRICS_PATH_LABEL, config.metrics_path.as_str()),
            (JOB_LABEL, config.job_name.as_str()),
        ] {
            if labels.get(name).is_none() {
                labels.set(name, value);
            }
        }

        if labels.get(ADDRESS_LABEL).is_none() {
            return Err(Error::NoAddress {
                instance: i,
                group: tgroup.source.clone(),
            });
        }

        let discovered = labels.clone();

        let Some(mut labels) = relabel::process(labels, &config.relabel_configs)? else {
            continue;
        };

        // If no port was provided, infer it from the scheme.
        let mut address = labels.get(ADDRESS_LABEL).unwrap_or_default().to_string();
        if !address.contains(':') {
            match labels.get(SCHEME_LABEL).unwrap_or_default() {
                "http" | "" => address.push_str(":80"),
                "https" => address.push_str(":443"),
                scheme => panic!("targets_from_group: invalid scheme {:?}", scheme),
            }
            labels.set(ADDRESS_LABEL, address.clone());
        }
        check_target_address(&address)?;

        labels.retain(|name, _| !name.starts_with(META_LABEL_PREFIX));

        let target = Target::new(labels, discovered, Arc::clone(config))?;
        targets.insert(target.fingerprint(), Arc::new(target));
    }

    Ok(targets)
}
