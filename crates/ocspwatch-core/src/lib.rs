//! ocspwatch-core — shared model for the OCSP monitoring engine.
//!
//! Holds everything the engine and its host agree on: the probe
//! configuration and its validated options, the endpoint/target model,
//! the error taxonomy, the metric event model, and the two seams the
//! host plugs into — `TargetResolver` (where targets come from) and
//! `OcspCodec` (how OCSP request/response bytes are encoded).
//!
//! The engine itself lives in `ocspwatch-engine`.

pub mod codec;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod metrics;

pub use codec::{OcspCodec, OcspStatus};
pub use config::{ProbeConfig, ProbeOptions};
pub use endpoint::{Endpoint, TargetResolver};
pub use error::{
    CertFetchError, CodecError, ConfigError, DiscoveryError, RequestBuildError,
};
pub use metrics::{CodeMap, LatencyDist, MetricEvent, MetricValue};
