//! Error taxonomy for the OCSP monitoring engine.
//!
//! Only `ConfigError` ever crosses the engine boundary as a returned
//! error. Every other class is absorbed where it occurs: discovery and
//! certificate failures are logged and retried on the next cycle,
//! request-build failures skip the affected responder or tick, and probe
//! failures surface purely as counters.

use thiserror::Error;

/// Invalid configuration, rejected at `init` time.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid duration for {field}: {value:?}")]
    InvalidDuration { field: &'static str, value: String },

    #[error("{field} must be greater than zero")]
    ZeroDuration { field: &'static str },

    #[error("invalid proxy URL {url:?}: {reason}")]
    InvalidProxy { url: String, reason: String },

    #[error("invalid source IP {0:?}")]
    InvalidSourceIp(String),

    #[error("cannot build HTTP client: {0}")]
    HttpClient(String),
}

/// Target discovery failed; the current worker set is kept and the
/// cycle is retried on the next tick.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("target resolver unavailable: {0}")]
    Unavailable(String),
}

/// A certificate pair could not be (re)fetched for one target. The
/// previously cached pair, if any, stays in place.
#[derive(Debug, Error)]
pub enum CertFetchError {
    #[error("dial {0} failed: {1}")]
    Dial(String, String),

    #[error("TLS handshake with {0} failed: {1}")]
    Tls(String, String),

    #[error("{0} presented an empty peer certificate chain")]
    EmptyPeerChain(String),

    #[error("cannot parse leaf certificate from {0}: {1}")]
    LeafParse(String, String),

    #[error("leaf certificate of {0} declares no issuer URL")]
    NoIssuerUrl(String),

    #[error("no issuer certificate fetchable for {0}")]
    IssuerUnavailable(String),

    #[error("issuer fetch from {0} failed: {1}")]
    IssuerFetch(String, String),

    #[error("issuer from {0} is neither PEM nor DER: {1}")]
    IssuerParse(String, String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Responder requests could not be derived for a target this tick.
#[derive(Debug, Error)]
pub enum RequestBuildError {
    #[error("no cached certificate pair for target {0}")]
    NoCertificate(String),

    #[error("no OCSP responders declared for target {0}")]
    NoResponders(String),

    #[error("no usable responder URL for target {0}")]
    NoUsableResponders(String),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Failure inside the black-box OCSP codec.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct CodecError(pub String);
