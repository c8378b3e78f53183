//! Probe configuration.
//!
//! `ProbeConfig` is the serde-facing shape the host deserializes from
//! its config file; durations are human-readable strings ("10s",
//! "500ms"). `ProbeConfig::build` validates it into `ProbeOptions`,
//! the resolved form the engine actually runs on. Validation failures
//! are the only errors the engine returns to the caller.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Floor for how often targets are re-listed; actual interval is
/// `max(DEFAULT_TARGETS_UPDATE_INTERVAL, poll interval)`.
pub const DEFAULT_TARGETS_UPDATE_INTERVAL: Duration = Duration::from_secs(10);

/// Default certificate refresh cycle, floored at the poll interval.
pub const DEFAULT_CERT_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Probe configuration as supplied by the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Poll interval per target (e.g. "10s").
    pub interval: String,
    /// Timeout for each outbound call (e.g. "5s").
    pub timeout: String,
    /// How often cumulative stats are exported (e.g. "60s").
    pub stats_export_interval: String,
    /// Spacing between worker launches; derived from the interval and
    /// target count when unset.
    pub interval_between_targets: Option<String>,
    /// Certificate refresh cycle; defaults to 60s, never faster than
    /// the poll interval.
    pub cert_refresh_interval: Option<String>,
    /// Outbound HTTP proxy for responder calls and issuer fetches.
    pub proxy_url: Option<String>,
    /// Source address for outbound dials.
    pub source_ip: Option<String>,
    /// Labels attached to every exported metric event.
    pub labels: HashMap<String, String>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            interval: "10s".to_string(),
            timeout: "5s".to_string(),
            stats_export_interval: "60s".to_string(),
            interval_between_targets: None,
            cert_refresh_interval: None,
            proxy_url: None,
            source_ip: None,
            labels: HashMap::new(),
        }
    }
}

/// Validated, resolved options the engine runs on.
#[derive(Debug, Clone)]
pub struct ProbeOptions {
    pub interval: Duration,
    pub timeout: Duration,
    pub stats_export_interval: Duration,
    /// Stats are exported every this many ticks (at least 1).
    pub export_every_ticks: u64,
    pub interval_between_targets: Option<Duration>,
    pub cert_refresh_interval: Duration,
    pub targets_update_interval: Duration,
    pub proxy_url: Option<String>,
    pub source_ip: Option<IpAddr>,
    /// Sorted for deterministic label ordering on events.
    pub labels: Vec<(String, String)>,
}

impl ProbeConfig {
    /// Validate and resolve into `ProbeOptions`.
    pub fn build(&self) -> Result<ProbeOptions, ConfigError> {
        let interval = parse_field("interval", &self.interval)?;
        let timeout = parse_field("timeout", &self.timeout)?;
        let stats_export_interval =
            parse_field("stats_export_interval", &self.stats_export_interval)?;

        let interval_between_targets = self
            .interval_between_targets
            .as_deref()
            .map(|s| parse_field("interval_between_targets", s))
            .transpose()?;

        let cert_refresh_interval = self
            .cert_refresh_interval
            .as_deref()
            .map(|s| parse_field("cert_refresh_interval", s))
            .transpose()?
            .unwrap_or(DEFAULT_CERT_REFRESH_INTERVAL)
            .max(interval);

        let export_every_ticks =
            (stats_export_interval.as_nanos() / interval.as_nanos()).max(1) as u64;

        let source_ip = self
            .source_ip
            .as_deref()
            .map(|s| {
                s.parse::<IpAddr>()
                    .map_err(|_| ConfigError::InvalidSourceIp(s.to_string()))
            })
            .transpose()?;

        let mut labels: Vec<(String, String)> = self
            .labels
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        labels.sort();

        Ok(ProbeOptions {
            interval,
            timeout,
            stats_export_interval,
            export_every_ticks,
            interval_between_targets,
            cert_refresh_interval,
            targets_update_interval: DEFAULT_TARGETS_UPDATE_INTERVAL.max(interval),
            proxy_url: self.proxy_url.clone(),
            source_ip,
            labels,
        })
    }
}

fn parse_field(field: &'static str, value: &str) -> Result<Duration, ConfigError> {
    let d = parse_duration(value).ok_or(ConfigError::InvalidDuration {
        field,
        value: value.to_string(),
    })?;
    if d.is_zero() {
        return Err(ConfigError::ZeroDuration { field });
    }
    Ok(d)
}

/// Parse a duration string like "5s", "500ms", "1m". A bare number is
/// taken as seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(rest) = s.strip_suffix("ms") {
        rest.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(rest) = s.strip_suffix('s') {
        rest.parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(rest) = s.strip_suffix('m') {
        rest.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("5s"), Some(Duration::from_secs(5)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("10"), Some(Duration::from_secs(10)));
        assert_eq!(parse_duration("abc"), None);
        assert_eq!(parse_duration(""), None);
    }

    #[test]
    fn defaults_build() {
        let opts = ProbeConfig::default().build().unwrap();
        assert_eq!(opts.interval, Duration::from_secs(10));
        assert_eq!(opts.timeout, Duration::from_secs(5));
        assert_eq!(opts.export_every_ticks, 6);
        assert_eq!(opts.targets_update_interval, Duration::from_secs(10));
        assert_eq!(opts.cert_refresh_interval, Duration::from_secs(60));
        assert!(opts.interval_between_targets.is_none());
    }

    #[test]
    fn export_frequency_floors_at_one() {
        let config = ProbeConfig {
            interval: "60s".to_string(),
            stats_export_interval: "10s".to_string(),
            ..Default::default()
        };
        assert_eq!(config.build().unwrap().export_every_ticks, 1);
    }

    #[test]
    fn targets_update_interval_floored_by_poll_interval() {
        let config = ProbeConfig {
            interval: "30s".to_string(),
            ..Default::default()
        };
        let opts = config.build().unwrap();
        assert_eq!(opts.targets_update_interval, Duration::from_secs(30));
    }

    #[test]
    fn cert_refresh_never_faster_than_interval() {
        let config = ProbeConfig {
            interval: "5m".to_string(),
            cert_refresh_interval: Some("30s".to_string()),
            ..Default::default()
        };
        let opts = config.build().unwrap();
        assert_eq!(opts.cert_refresh_interval, Duration::from_secs(300));
    }

    #[test]
    fn zero_interval_rejected() {
        let config = ProbeConfig {
            interval: "0s".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            config.build(),
            Err(ConfigError::ZeroDuration { field: "interval" })
        ));
    }

    #[test]
    fn malformed_duration_rejected() {
        let config = ProbeConfig {
            timeout: "soon".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            config.build(),
            Err(ConfigError::InvalidDuration { field: "timeout", .. })
        ));
    }

    #[test]
    fn bad_source_ip_rejected() {
        let config = ProbeConfig {
            source_ip: Some("not-an-ip".to_string()),
            ..Default::default()
        };
        assert!(matches!(config.build(), Err(ConfigError::InvalidSourceIp(_))));
    }

    #[test]
    fn labels_sorted_for_determinism() {
        let mut labels = HashMap::new();
        labels.insert("zone".to_string(), "b".to_string());
        labels.insert("env".to_string(), "prod".to_string());
        let config = ProbeConfig {
            labels,
            ..Default::default()
        };
        let opts = config.build().unwrap();
        assert_eq!(opts.labels[0].0, "env");
        assert_eq!(opts.labels[1].0, "zone");
    }

    #[test]
    fn deserializes_with_defaults() {
        let config: ProbeConfig =
            serde_json::from_str(r#"{"interval": "15s"}"#).unwrap();
        assert_eq!(config.interval, "15s");
        assert_eq!(config.timeout, "5s");
    }
}
