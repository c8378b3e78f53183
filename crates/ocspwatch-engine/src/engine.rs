//! Directory sync and worker lifecycle.
//!
//! `OcspProbe` is the supervisor: it owns the worker table, the
//! certificate store, and the HTTP client. Each sync cycle it diffs
//! the resolver's endpoint set against the active workers by key,
//! stops pollers whose targets disappeared, and stagger-launches
//! pollers for new targets so handshake and HTTP bursts spread across
//! the interval instead of firing at once. Sync never runs
//! concurrently with itself — there is exactly one supervisor task.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use ocspwatch_core::{
    ConfigError, Endpoint, MetricEvent, OcspCodec, ProbeConfig, ProbeOptions, TargetResolver,
};

use crate::certs::{CertFetcher, CertStore, TlsCertFetcher};
use crate::poller::TargetPoller;

/// A live worker: its task handle plus the only means of stopping it.
struct WorkerSlot {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// The embedded OCSP monitoring engine.
pub struct OcspProbe {
    name: String,
    opts: ProbeOptions,
    resolver: Arc<dyn TargetResolver>,
    codec: Arc<dyn OcspCodec>,
    certs: Arc<CertStore>,
    client: reqwest::Client,
    /// Active workers by target key. Owned exclusively by the
    /// supervisor; at most one live worker per key.
    workers: HashMap<String, WorkerSlot>,
}

impl std::fmt::Debug for OcspProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OcspProbe")
            .field("name", &self.name)
            .field("opts", &self.opts)
            .finish_non_exhaustive()
    }
}

impl OcspProbe {
    /// Validate the configuration and construct the engine. The only
    /// operation that returns an error to the host.
    pub fn init(
        name: impl Into<String>,
        config: &ProbeConfig,
        resolver: Arc<dyn TargetResolver>,
        codec: Arc<dyn OcspCodec>,
    ) -> Result<Self, ConfigError> {
        let opts = config.build()?;
        let client = build_http_client(&opts)?;
        let fetcher = TlsCertFetcher::new(opts.timeout, opts.source_ip, client.clone());

        Ok(Self {
            name: name.into(),
            certs: Arc::new(CertStore::new(Box::new(fetcher))),
            opts,
            resolver,
            codec,
            client,
            workers: HashMap::new(),
        })
    }

    /// Replace the certificate fetcher (tests, or hosts that already
    /// hold the certificates).
    pub fn with_cert_fetcher(mut self, fetcher: Box<dyn CertFetcher>) -> Self {
        self.certs = Arc::new(CertStore::new(fetcher));
        self
    }

    /// Target keys with a live worker, sorted.
    pub fn active_targets(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.workers.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Run until `shutdown` signals, then stop every worker and wait
    /// for each to exit before returning.
    pub async fn run(
        mut self,
        mut shutdown: watch::Receiver<bool>,
        sink: mpsc::Sender<MetricEvent>,
    ) {
        if *shutdown.borrow() {
            return;
        }
        info!(
            probe = %self.name,
            interval_ms = self.opts.interval.as_millis() as u64,
            export_every_ticks = self.opts.export_every_ticks,
            "ocsp probe starting"
        );

        // Initial pass so workers have certificates from the start.
        let endpoints = self.resolve();
        if !endpoints.is_empty() {
            self.certs.refresh(&endpoints).await;
        }
        self.sync_targets(&sink).await;

        let mut targets_ticker = tokio::time::interval(self.opts.targets_update_interval);
        targets_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        targets_ticker.tick().await;

        let mut certs_ticker = tokio::time::interval(self.opts.cert_refresh_interval);
        certs_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        certs_ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = targets_ticker.tick() => {
                    self.sync_targets(&sink).await;
                }
                _ = certs_ticker.tick() => {
                    let endpoints = self.resolve();
                    if endpoints.is_empty() {
                        debug!(probe = %self.name, "no targets, skipping certificate refresh");
                    } else {
                        self.certs.refresh(&endpoints).await;
                    }
                }
            }
        }

        self.stop_all().await;
        info!(probe = %self.name, "ocsp probe stopped");
    }

    fn resolve(&self) -> Vec<Endpoint> {
        match self.resolver.list_endpoints() {
            Ok(endpoints) => endpoints,
            Err(e) => {
                warn!(probe = %self.name, error = %e, "target discovery failed, retrying next cycle");
                Vec::new()
            }
        }
    }

    /// One sync cycle: diff the resolved set against active workers,
    /// stop the removed, stagger-launch the new. An empty resolver
    /// result keeps the current set — expected at startup, retried on
    /// the next tick.
    async fn sync_targets(&mut self, sink: &mpsc::Sender<MetricEvent>) {
        let endpoints = self.resolve();
        if endpoints.is_empty() {
            debug!(probe = %self.name, "resolver returned no targets, keeping current worker set");
            return;
        }

        let live: HashSet<String> = endpoints.iter().map(|e| e.key()).collect();
        let removed: Vec<String> = self
            .workers
            .keys()
            .filter(|key| !live.contains(*key))
            .cloned()
            .collect();
        for key in removed {
            self.stop_worker(&key).await;
            info!(probe = %self.name, target = %key, "poller stopped (target removed)");
        }

        let gap = self.gap_between_targets(endpoints.len());
        let mut launch_index = 0usize;
        for endpoint in endpoints {
            let key = endpoint.key();
            if self.workers.contains_key(&key) {
                continue;
            }

            let delay = launch_delay(launch_index, gap);
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let poller = TargetPoller::new(
                self.name.clone(),
                endpoint,
                &self.opts,
                self.certs.clone(),
                self.codec.clone(),
                self.client.clone(),
                sink.clone(),
            );
            let handle = tokio::spawn(poller.run(shutdown_rx, delay));

            self.workers.insert(
                key.clone(),
                WorkerSlot {
                    handle,
                    shutdown_tx,
                },
            );
            info!(
                probe = %self.name,
                target = %key,
                delay_ms = delay.as_millis() as u64,
                "poller started"
            );
            launch_index += 1;
        }
    }

    /// Signal one worker and wait for it to exit.
    async fn stop_worker(&mut self, key: &str) {
        if let Some(slot) = self.workers.remove(key) {
            let _ = slot.shutdown_tx.send(true);
            if let Err(e) = slot.handle.await {
                warn!(target = %key, error = %e, "poller task failed");
            }
        }
    }

    /// Stop every worker and wait for all of them. After this returns
    /// no worker is left running.
    async fn stop_all(&mut self) {
        let keys: Vec<String> = self.workers.keys().cloned().collect();
        for key in keys {
            self.stop_worker(&key).await;
        }
        debug!(probe = %self.name, "all pollers stopped");
    }

    /// Spacing between worker launches: configured, or 1/10th of the
    /// poll interval spread across the target count.
    fn gap_between_targets(&self, target_count: usize) -> Duration {
        if let Some(gap) = self.opts.interval_between_targets {
            return gap;
        }
        self.opts.interval / (10 * target_count.max(1)) as u32
    }
}

/// Stagger slot for the `index`-th newly launched worker:
/// `index * gap` plus a random jitter in `[0, gap/10)`.
fn launch_delay(index: usize, gap: Duration) -> Duration {
    let base = gap * index as u32;
    let spread = (gap.as_nanos() / 10) as u64;
    if spread == 0 {
        return base;
    }
    base + Duration::from_nanos(rand::thread_rng().gen_range(0..spread))
}

fn build_http_client(opts: &ProbeOptions) -> Result<reqwest::Client, ConfigError> {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(opts.timeout)
        .pool_max_idle_per_host(256);

    if let Some(ip) = opts.source_ip {
        builder = builder.local_address(ip);
    }
    if let Some(url) = &opts.proxy_url {
        let proxy = reqwest::Proxy::all(url.as_str()).map_err(|e| ConfigError::InvalidProxy {
            url: url.clone(),
            reason: e.to_string(),
        })?;
        builder = builder.proxy(proxy);
    }

    builder
        .build()
        .map_err(|e| ConfigError::HttpClient(e.to_string()))
}
