//! Probe issuance and outcome classification.
//!
//! `issue_call` performs one POST to one responder and classifies the
//! result in priority order: transport timeout, other transport error,
//! non-200 HTTP status, 200 with an unclassifiable body, success.
//! `PollResult` turns outcomes into the cumulative per-responder
//! counters that get exported.

use std::time::{Duration, SystemTime};

use reqwest::header::{ACCEPT, CONTENT_TYPE};
use tokio::time::Instant;

use ocspwatch_core::{
    CodeMap, Endpoint, LatencyDist, MetricEvent, MetricValue, OcspCodec, OcspStatus,
};

use crate::request::ResponderRequest;

/// Classified result of one call to one responder.
#[derive(Debug, Clone)]
pub enum ProbeOutcome {
    /// The call exceeded the per-call timeout.
    Timeout,
    /// Any other transport-level failure.
    Transport(String),
    /// The responder answered with a non-200 status.
    HttpError { status: u16, elapsed: Duration },
    /// 200, but the body failed OCSP structural/signature validation.
    InvalidResponse {
        status: u16,
        elapsed: Duration,
        reason: String,
    },
    /// 200 with a valid response.
    Success {
        status: u16,
        ocsp_status: OcspStatus,
        elapsed: Duration,
    },
}

/// Issue one OCSP call. The timeout caps the whole call including the
/// body read, so one slow responder cannot starve the next tick.
pub async fn issue_call(
    client: &reqwest::Client,
    request: &ResponderRequest,
    issuer_der: &[u8],
    codec: &dyn OcspCodec,
    timeout: Duration,
) -> ProbeOutcome {
    let start = Instant::now();

    let response = client
        .post(&request.url)
        .header(CONTENT_TYPE, "application/ocsp-request")
        .header(ACCEPT, "application/ocsp-response")
        .timeout(timeout)
        .body(request.body.clone())
        .send()
        .await;

    let response = match response {
        Ok(r) => r,
        Err(e) if e.is_timeout() => return ProbeOutcome::Timeout,
        Err(e) => return ProbeOutcome::Transport(e.to_string()),
    };

    let status = response.status().as_u16();
    if status != 200 {
        return ProbeOutcome::HttpError {
            status,
            elapsed: start.elapsed(),
        };
    }

    let body = match response.bytes().await {
        Ok(b) => b,
        Err(e) if e.is_timeout() => return ProbeOutcome::Timeout,
        Err(e) => return ProbeOutcome::Transport(e.to_string()),
    };
    let elapsed = start.elapsed();

    match codec.decode_response(&body, issuer_der) {
        Ok(ocsp_status) => ProbeOutcome::Success {
            status,
            ocsp_status,
            elapsed,
        },
        Err(e) => ProbeOutcome::InvalidResponse {
            status,
            elapsed,
            reason: e.to_string(),
        },
    }
}

/// Cumulative counters for one (target, responder) pair. Mutated only
/// by the owning worker; exported counters are never reset.
#[derive(Debug, Default)]
pub struct PollResult {
    pub total: u64,
    pub success: u64,
    pub timeouts: u64,
    pub resp_codes: CodeMap,
    pub ocsp_codes: CodeMap,
    pub latency: LatencyDist,
}

impl PollResult {
    /// Fold one outcome into the counters. Every attempt counts toward
    /// `total`; only a validated 200 counts toward `success`.
    pub fn record(&mut self, outcome: &ProbeOutcome) {
        self.total += 1;
        match outcome {
            ProbeOutcome::Timeout => {
                self.timeouts += 1;
            }
            ProbeOutcome::Transport(_) => {}
            ProbeOutcome::HttpError { status, .. } => {
                self.resp_codes.inc(*status as i64);
            }
            ProbeOutcome::InvalidResponse { status, .. } => {
                self.resp_codes.inc(*status as i64);
                self.ocsp_codes.inc(OcspStatus::ServerFailed.code());
            }
            ProbeOutcome::Success {
                status,
                ocsp_status,
                elapsed,
            } => {
                self.success += 1;
                self.resp_codes.inc(*status as i64);
                self.ocsp_codes.inc(ocsp_status.code());
                self.latency.observe(*elapsed);
            }
        }
    }

    /// Build the export event for this responder.
    pub fn to_event(
        &self,
        timestamp: SystemTime,
        probe_name: &str,
        responder: &str,
        target: &Endpoint,
        extra_labels: &[(String, String)],
    ) -> MetricEvent {
        let mut event = MetricEvent::new(timestamp)
            .add_label("ptype", "ocsp")
            .add_label("probe", probe_name)
            .add_label("ocsp-server", responder)
            .add_label("dst", &target.name)
            .add_metric("total", MetricValue::Int(self.total as i64))
            .add_metric("success", MetricValue::Int(self.success as i64))
            .add_metric("timeouts", MetricValue::Int(self.timeouts as i64))
            .add_metric("latency", MetricValue::Dist(self.latency.clone()))
            .add_metric("resp-code", MetricValue::Map(self.resp_codes.clone()))
            .add_metric("ocsp-code", MetricValue::Map(self.ocsp_codes.clone()));
        for (k, v) in extra_labels {
            event = event.add_label(k, v);
        }
        for (k, v) in &target.labels {
            event = event.add_label(k, v);
        }
        event
    }
}
