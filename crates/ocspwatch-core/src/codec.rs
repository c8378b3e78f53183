//! The black-box OCSP codec seam.
//!
//! The engine never looks inside OCSP bytes itself: the host supplies
//! an `OcspCodec` that encodes one request per certificate pair and
//! classifies response bodies. Status codes follow the conventional
//! OCSP numbering so they aggregate cleanly in histograms.

use crate::error::CodecError;

/// Parsed OCSP certificate status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OcspStatus {
    Good,
    Revoked,
    Unknown,
    /// Sentinel used before (or instead of) successful classification.
    ServerFailed,
}

impl OcspStatus {
    /// Numeric code used as the OCSP histogram key.
    pub fn code(self) -> i64 {
        match self {
            OcspStatus::Good => 0,
            OcspStatus::Revoked => 1,
            OcspStatus::Unknown => 2,
            OcspStatus::ServerFailed => 3,
        }
    }
}

/// Encodes OCSP requests and decodes responses. Supplied by the host.
pub trait OcspCodec: Send + Sync {
    /// Build one request body for the given leaf/issuer pair.
    fn encode_request(&self, leaf_der: &[u8], issuer_der: &[u8]) -> Result<Vec<u8>, CodecError>;

    /// Structurally and cryptographically validate a response body
    /// against the issuer, returning the certificate status.
    fn decode_response(&self, body: &[u8], issuer_der: &[u8]) -> Result<OcspStatus, CodecError>;
}
