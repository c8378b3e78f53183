//! Per-target polling loop.
//!
//! One `TargetPoller` task per active target, created by the
//! supervisor and terminated only through its shutdown channel. Every
//! tick re-derives the responder requests from the current cached
//! pair, issues one call per responder, and folds the outcomes into
//! per-responder counters. Every N ticks the cumulative counters are
//! exported; the sink send may block, which deliberately backpressures
//! this loop and nothing else.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use ocspwatch_core::{Endpoint, MetricEvent, OcspCodec, ProbeOptions};

use crate::certs::CertStore;
use crate::prober::{issue_call, PollResult, ProbeOutcome};
use crate::request::{derive_requests, DerivedProbe};

pub(crate) struct TargetPoller {
    probe_name: String,
    endpoint: Endpoint,
    interval: Duration,
    timeout: Duration,
    export_every_ticks: u64,
    labels: Vec<(String, String)>,
    certs: Arc<CertStore>,
    codec: Arc<dyn OcspCodec>,
    client: reqwest::Client,
    sink: mpsc::Sender<MetricEvent>,
    /// Lazily created per responder on the first completed probe.
    results: HashMap<String, PollResult>,
    run_cnt: u64,
}

impl TargetPoller {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        probe_name: String,
        endpoint: Endpoint,
        opts: &ProbeOptions,
        certs: Arc<CertStore>,
        codec: Arc<dyn OcspCodec>,
        client: reqwest::Client,
        sink: mpsc::Sender<MetricEvent>,
    ) -> Self {
        Self {
            probe_name,
            endpoint,
            interval: opts.interval,
            timeout: opts.timeout,
            export_every_ticks: opts.export_every_ticks,
            labels: opts.labels.clone(),
            certs,
            codec,
            client,
            sink,
            results: HashMap::new(),
            run_cnt: 0,
        }
    }

    /// Poll until shutdown. `initial_delay` is this worker's stagger
    /// slot; the first probe fires one interval after that.
    pub(crate) async fn run(mut self, mut shutdown: watch::Receiver<bool>, initial_delay: Duration) {
        if *shutdown.borrow() {
            return;
        }
        debug!(target = %self.endpoint.key(), delay_ms = initial_delay.as_millis() as u64, "poller starting");

        tokio::select! {
            _ = tokio::time::sleep(initial_delay) => {}
            _ = shutdown.changed() => {
                debug!(target = %self.endpoint.key(), "poller cancelled before first tick");
                return;
            }
        }

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // tokio's first interval tick completes immediately; swallow it
        // so the first probe lands one interval in.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    self.tick().await;
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!(target = %self.endpoint.key(), "poller stopped");
    }

    /// One poll round: derive, probe every responder, maybe export.
    async fn tick(&mut self) {
        if let Some(derived) = self.derive().await {
            for request in &derived.requests {
                let outcome = issue_call(
                    &self.client,
                    request,
                    &derived.issuer_der,
                    self.codec.as_ref(),
                    self.timeout,
                )
                .await;

                match &outcome {
                    ProbeOutcome::Timeout => {
                        warn!(target = %self.endpoint.key(), url = %request.url, "probe timed out");
                    }
                    ProbeOutcome::Transport(e) => {
                        warn!(target = %self.endpoint.key(), url = %request.url, error = %e, "probe transport error");
                    }
                    _ => {}
                }

                self.results
                    .entry(request.responder_host.clone())
                    .or_default()
                    .record(&outcome);
            }
        }

        self.run_cnt += 1;
        if self.run_cnt % self.export_every_ticks == 0 {
            self.export().await;
        }
    }

    /// Re-derive responder requests from the current cached pair.
    /// Missing pair or responders skips this tick; the next refresh
    /// cycle may bring them back.
    async fn derive(&self) -> Option<DerivedProbe> {
        let key = self.endpoint.key();
        let Some(pair) = self.certs.pair(&key).await else {
            debug!(target = %key, "no cached certificate pair, skipping tick");
            return None;
        };
        match derive_requests(&key, &pair, self.codec.as_ref()) {
            Ok(derived) => Some(derived),
            Err(e) => {
                debug!(target = %key, error = %e, "cannot derive responder requests, skipping tick");
                None
            }
        }
    }

    /// Emit one event per responder with the cumulative counters.
    async fn export(&self) {
        let timestamp = SystemTime::now();
        for (responder, result) in &self.results {
            let event = result.to_event(
                timestamp,
                &self.probe_name,
                responder,
                &self.endpoint,
                &self.labels,
            );
            if self.sink.send(event).await.is_err() {
                warn!(target = %self.endpoint.key(), "metric sink closed, dropping export");
                return;
            }
        }
    }
}
