//! ocspwatch-engine — continuous OCSP monitoring for a dynamic target set.
//!
//! For every endpoint the host's resolver reports, the engine fetches
//! the presented leaf certificate and its issuer, derives one request
//! per declared OCSP responder, and polls those responders on a fixed
//! interval, accumulating per-responder outcome counters that are
//! periodically exported as metric events.
//!
//! # Architecture
//!
//! ```text
//! OcspProbe (supervisor)
//!   ├── directory sync: resolve targets, diff by key,
//!   │   stop removed pollers, stagger-launch new ones
//!   ├── CertStore: {leaf, issuer} pair per target,
//!   │   refreshed on its own cycle under one lock
//!   └── Per-target TargetPoller task
//!       ├── re-derives responder requests each tick
//!       ├── issue_call() → ProbeOutcome per responder
//!       ├── PollResult: cumulative per-responder counters
//!       └── exports MetricEvents every N ticks
//! ```
//!
//! The engine is embedded, not a service: the host supplies a
//! `TargetResolver`, an `OcspCodec`, and a metric sink channel, and
//! signals shutdown through a watch channel. `OcspProbe::run` returns
//! only after every poller has observed shutdown and exited.

pub mod certs;
pub mod engine;
pub mod poller;
pub mod prober;
pub mod request;

pub use certs::{CertFetcher, CertPair, CertStore, TlsCertFetcher};
pub use engine::OcspProbe;
pub use prober::{PollResult, ProbeOutcome};
pub use request::{DerivedProbe, ResponderRequest};
