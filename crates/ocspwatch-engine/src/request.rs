//! Per-responder request derivation.
//!
//! Requests are re-derived from the cached certificate pair on every
//! poll tick, trading a little recomputation for the guarantee that a
//! worker always probes with the freshest pair.

use bytes::Bytes;
use tracing::warn;

use ocspwatch_core::{OcspCodec, RequestBuildError};

use crate::certs::CertPair;

/// One prepared call to a single responder.
#[derive(Debug, Clone)]
pub struct ResponderRequest {
    /// Responder host (with port when declared), used as the metric key.
    pub responder_host: String,
    pub url: String,
    pub body: Bytes,
}

/// Everything a worker needs for one round of calls.
#[derive(Debug, Clone)]
pub struct DerivedProbe {
    pub issuer_der: Bytes,
    pub requests: Vec<ResponderRequest>,
}

/// Derive one request per responder declared in the leaf. A malformed
/// responder URL is skipped with a warning; the target keeps going
/// with the rest.
pub fn derive_requests(
    key: &str,
    pair: &CertPair,
    codec: &dyn OcspCodec,
) -> Result<DerivedProbe, RequestBuildError> {
    if pair.responders.is_empty() {
        return Err(RequestBuildError::NoResponders(key.to_string()));
    }

    let body = Bytes::from(codec.encode_request(&pair.leaf_der, &pair.issuer_der)?);

    let mut requests = Vec::with_capacity(pair.responders.len());
    for responder in &pair.responders {
        let host = match reqwest::Url::parse(responder) {
            Ok(url) => match (url.host_str(), url.port()) {
                (Some(host), Some(port)) => format!("{host}:{port}"),
                (Some(host), None) => host.to_string(),
                (None, _) => {
                    warn!(target = %key, %responder, "skipping responder URL without host");
                    continue;
                }
            },
            Err(e) => {
                warn!(target = %key, %responder, error = %e, "skipping malformed responder URL");
                continue;
            }
        };
        requests.push(ResponderRequest {
            responder_host: host,
            url: responder.clone(),
            body: body.clone(),
        });
    }

    if requests.is_empty() {
        return Err(RequestBuildError::NoUsableResponders(key.to_string()));
    }

    Ok(DerivedProbe {
        issuer_der: pair.issuer_der.clone(),
        requests,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::certs::tests::canned_pair;
    use ocspwatch_core::CodecError;

    pub(crate) struct StaticCodec;

    impl OcspCodec for StaticCodec {
        fn encode_request(&self, _leaf: &[u8], _issuer: &[u8]) -> Result<Vec<u8>, CodecError> {
            Ok(b"REQ".to_vec())
        }

        fn decode_response(
            &self,
            _body: &[u8],
            _issuer: &[u8],
        ) -> Result<ocspwatch_core::OcspStatus, CodecError> {
            Ok(ocspwatch_core::OcspStatus::Good)
        }
    }

    struct BrokenCodec;

    impl OcspCodec for BrokenCodec {
        fn encode_request(&self, _leaf: &[u8], _issuer: &[u8]) -> Result<Vec<u8>, CodecError> {
            Err(CodecError("bad key material".to_string()))
        }

        fn decode_response(
            &self,
            _body: &[u8],
            _issuer: &[u8],
        ) -> Result<ocspwatch_core::OcspStatus, CodecError> {
            Err(CodecError("unreachable".to_string()))
        }
    }

    #[test]
    fn one_request_per_responder() {
        let pair = canned_pair(&["http://ocsp1.example.com", "http://ocsp2.example.com:8080/path"]);
        let derived = derive_requests("t:443", &pair, &StaticCodec).unwrap();
        assert_eq!(derived.requests.len(), 2);
        assert_eq!(derived.requests[0].responder_host, "ocsp1.example.com");
        assert_eq!(derived.requests[1].responder_host, "ocsp2.example.com:8080");
        // All responders share the same encoded body.
        assert_eq!(derived.requests[0].body, derived.requests[1].body);
        assert_eq!(&derived.requests[0].body[..], b"REQ");
    }

    #[test]
    fn malformed_responder_skipped() {
        let pair = canned_pair(&["::::nonsense", "http://ocsp.example.com"]);
        let derived = derive_requests("t:443", &pair, &StaticCodec).unwrap();
        assert_eq!(derived.requests.len(), 1);
        assert_eq!(derived.requests[0].responder_host, "ocsp.example.com");
    }

    #[test]
    fn no_responders_is_an_error() {
        let pair = canned_pair(&[]);
        assert!(matches!(
            derive_requests("t:443", &pair, &StaticCodec),
            Err(RequestBuildError::NoResponders(_))
        ));
    }

    #[test]
    fn only_malformed_responders_is_an_error() {
        let pair = canned_pair(&["::::nonsense"]);
        assert!(matches!(
            derive_requests("t:443", &pair, &StaticCodec),
            Err(RequestBuildError::NoUsableResponders(_))
        ));
    }

    #[test]
    fn codec_failure_propagates() {
        let pair = canned_pair(&["http://ocsp.example.com"]);
        assert!(matches!(
            derive_requests("t:443", &pair, &BrokenCodec),
            Err(RequestBuildError::Codec(_))
        ));
    }
}
