//! Certificate cache.
//!
//! `CertStore` owns one `{leaf, issuer}` pair per target key. Pairs are
//! written only by `refresh` and replaced wholesale under a single lock,
//! so a reader never sees a leaf from one generation paired with an
//! issuer from another. A failed refresh for one target keeps its
//! previous pair and never stops the cycle for the others.
//!
//! `TlsCertFetcher` is the production fetcher: it opens a TLS
//! connection with peer verification disabled — the point is to observe
//! whatever certificate the endpoint presents, not to validate trust —
//! takes the first peer certificate as the leaf, reads the responder
//! and issuer URLs from its Authority Info Access extension, and
//! follows the issuer URLs in order, accepting the first body that
//! parses as PEM or DER.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use x509_parser::oid_registry::{
    OID_PKIX_ACCESS_DESCRIPTOR_CA_ISSUERS, OID_PKIX_ACCESS_DESCRIPTOR_OCSP,
};
use x509_parser::prelude::*;

use ocspwatch_core::{CertFetchError, Endpoint};

/// Leaf and issuer certificates for one target, plus the responder
/// URLs extracted from the leaf at fetch time. Replaced wholesale on
/// refresh, never merged.
#[derive(Debug, Clone)]
pub struct CertPair {
    pub leaf_der: Bytes,
    pub issuer_der: Bytes,
    pub responders: Vec<String>,
}

type FetchFuture = Pin<Box<dyn Future<Output = Result<CertPair, CertFetchError>> + Send>>;

/// Fetches a certificate pair for one endpoint. Trait seam so tests
/// can substitute canned pairs for live TLS connections.
pub trait CertFetcher: Send + Sync {
    fn fetch_pair(&self, endpoint: &Endpoint) -> FetchFuture;
}

/// The shared certificate cache.
pub struct CertStore {
    pairs: Mutex<HashMap<String, CertPair>>,
    fetcher: Box<dyn CertFetcher>,
}

impl CertStore {
    pub fn new(fetcher: Box<dyn CertFetcher>) -> Self {
        Self {
            pairs: Mutex::new(HashMap::new()),
            fetcher,
        }
    }

    /// Refresh pairs for the given endpoints. Each success swaps the
    /// stored pair atomically; each failure logs, keeps the previous
    /// pair, and moves on. Pairs for keys no longer in the endpoint
    /// list are dropped.
    pub async fn refresh(&self, endpoints: &[Endpoint]) {
        debug!(targets = endpoints.len(), "refreshing certificates");

        for endpoint in endpoints {
            let key = endpoint.key();
            match self.fetcher.fetch_pair(endpoint).await {
                Ok(pair) => {
                    let mut pairs = self.pairs.lock().await;
                    pairs.insert(key.clone(), pair);
                    debug!(target = %key, "certificate pair refreshed");
                }
                Err(e) => {
                    warn!(target = %key, error = %e, "certificate refresh failed, keeping previous pair");
                }
            }
        }

        let live: HashSet<String> = endpoints.iter().map(|e| e.key()).collect();
        let mut pairs = self.pairs.lock().await;
        pairs.retain(|key, _| live.contains(key));
    }

    /// Snapshot of the current pair for a key, taken under the cache
    /// lock so it is internally consistent.
    pub async fn pair(&self, key: &str) -> Option<CertPair> {
        self.pairs.lock().await.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.pairs.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pairs.lock().await.is_empty()
    }
}

/// Production fetcher: TLS handshake for the leaf, HTTP for the issuer.
pub struct TlsCertFetcher {
    timeout: Duration,
    source_ip: Option<IpAddr>,
    tls: Arc<rustls::ClientConfig>,
    http: reqwest::Client,
}

impl TlsCertFetcher {
    pub fn new(timeout: Duration, source_ip: Option<IpAddr>, http: reqwest::Client) -> Self {
        let tls = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
            .with_no_client_auth();
        Self {
            timeout,
            source_ip,
            tls: Arc::new(tls),
            http,
        }
    }
}

impl CertFetcher for TlsCertFetcher {
    fn fetch_pair(&self, endpoint: &Endpoint) -> FetchFuture {
        let timeout = self.timeout;
        let source_ip = self.source_ip;
        let tls = self.tls.clone();
        let http = self.http.clone();
        let host = endpoint.name.clone();
        let addr = endpoint.dial_addr();

        Box::pin(async move {
            let leaf = download_leaf(tls, timeout, source_ip, &host, &addr).await?;
            let meta = leaf_metadata(&addr, &leaf)?;
            if meta.issuer_urls.is_empty() {
                return Err(CertFetchError::NoIssuerUrl(addr));
            }

            let mut issuer = None;
            for url in &meta.issuer_urls {
                match fetch_issuer(&http, url).await {
                    Ok(der) => {
                        issuer = Some(der);
                        break;
                    }
                    Err(e) => debug!(%url, error = %e, "issuer fetch failed, trying next URL"),
                }
            }
            let issuer = issuer.ok_or(CertFetchError::IssuerUnavailable(addr))?;

            Ok(CertPair {
                leaf_der: Bytes::from(leaf),
                issuer_der: Bytes::from(issuer),
                responders: meta.responders,
            })
        })
    }
}

/// Handshake with the endpoint and return the presented leaf in DER.
async fn download_leaf(
    tls: Arc<rustls::ClientConfig>,
    timeout: Duration,
    source_ip: Option<IpAddr>,
    host: &str,
    addr: &str,
) -> Result<Vec<u8>, CertFetchError> {
    let connect = async {
        let tcp = connect_tcp(addr, source_ip)
            .await
            .map_err(|e| CertFetchError::Dial(addr.to_string(), e.to_string()))?;

        let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
            .map_err(|e| CertFetchError::Tls(addr.to_string(), e.to_string()))?;

        let stream = tokio_rustls::TlsConnector::from(tls)
            .connect(server_name, tcp)
            .await
            .map_err(|e| CertFetchError::Tls(addr.to_string(), e.to_string()))?;

        let (_, session) = stream.get_ref();
        match session.peer_certificates() {
            Some(certs) if !certs.is_empty() => Ok(certs[0].as_ref().to_vec()),
            _ => Err(CertFetchError::EmptyPeerChain(addr.to_string())),
        }
    };

    tokio::time::timeout(timeout, connect)
        .await
        .map_err(|_| CertFetchError::Dial(addr.to_string(), "handshake timed out".to_string()))?
}

/// Dial, binding the configured source address when one is set.
async fn connect_tcp(addr: &str, source_ip: Option<IpAddr>) -> io::Result<TcpStream> {
    let Some(ip) = source_ip else {
        return TcpStream::connect(addr).await;
    };

    let mut last_err = None;
    for remote in tokio::net::lookup_host(addr).await? {
        if remote.is_ipv4() != ip.is_ipv4() {
            continue;
        }
        let socket = if remote.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.bind(SocketAddr::new(ip, 0))?;
        match socket.connect(remote).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::AddrNotAvailable, "no address family matches source IP")
    }))
}

#[derive(Debug)]
pub(crate) struct LeafMetadata {
    pub responders: Vec<String>,
    pub issuer_urls: Vec<String>,
}

/// Read responder and issuer URLs from the leaf's AIA extension.
pub(crate) fn leaf_metadata(addr: &str, leaf_der: &[u8]) -> Result<LeafMetadata, CertFetchError> {
    let (_, cert) = X509Certificate::from_der(leaf_der)
        .map_err(|e| CertFetchError::LeafParse(addr.to_string(), e.to_string()))?;

    let mut meta = LeafMetadata {
        responders: Vec::new(),
        issuer_urls: Vec::new(),
    };
    for ext in cert.extensions() {
        if let ParsedExtension::AuthorityInfoAccess(aia) = ext.parsed_extension() {
            for desc in &aia.accessdescs {
                let GeneralName::URI(uri) = &desc.access_location else {
                    continue;
                };
                if desc.access_method == OID_PKIX_ACCESS_DESCRIPTOR_OCSP {
                    meta.responders.push(uri.to_string());
                } else if desc.access_method == OID_PKIX_ACCESS_DESCRIPTOR_CA_ISSUERS {
                    meta.issuer_urls.push(uri.to_string());
                }
            }
        }
    }
    Ok(meta)
}

/// Fetch one issuer candidate and normalize it to DER.
async fn fetch_issuer(client: &reqwest::Client, url: &str) -> Result<Vec<u8>, CertFetchError> {
    let resp = client
        .get(url)
        .send()
        .await
        .map_err(|e| CertFetchError::IssuerFetch(url.to_string(), e.to_string()))?;

    if !resp.status().is_success() {
        return Err(CertFetchError::IssuerFetch(
            url.to_string(),
            format!("status {}", resp.status()),
        ));
    }

    let body = resp
        .bytes()
        .await
        .map_err(|e| CertFetchError::IssuerFetch(url.to_string(), e.to_string()))?;

    parse_certificate(url, &body)
}

/// Accept a certificate body in either PEM or DER form, returning DER.
pub(crate) fn parse_certificate(origin: &str, input: &[u8]) -> Result<Vec<u8>, CertFetchError> {
    if let Ok((_, pem)) = x509_parser::pem::parse_x509_pem(input) {
        X509Certificate::from_der(&pem.contents)
            .map_err(|e| CertFetchError::IssuerParse(origin.to_string(), e.to_string()))?;
        return Ok(pem.contents);
    }

    X509Certificate::from_der(input)
        .map_err(|e| CertFetchError::IssuerParse(origin.to_string(), e.to_string()))?;
    Ok(input.to_vec())
}

/// Verifier that accepts any peer certificate. Observation only: the
/// engine records what the endpoint presents and makes no trust
/// decisions.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// DER-encode one AccessDescription. `method_tail` is the last arc
    /// of the 1.3.6.1.5.5.7.48.x access method OID (1 = OCSP, 2 = CA
    /// issuers).
    fn access_description(method_tail: u8, uri: &str) -> Vec<u8> {
        let mut inner = vec![0x06, 0x08, 0x2b, 0x06, 0x01, 0x05, 0x05, 0x07, 0x30, method_tail];
        inner.push(0x86); // GeneralName uniformResourceIdentifier
        inner.push(uri.len() as u8);
        inner.extend_from_slice(uri.as_bytes());

        let mut seq = vec![0x30, inner.len() as u8];
        seq.extend(inner);
        seq
    }

    /// Mint a self-signed certificate carrying an AIA extension with
    /// the given responder and issuer URLs.
    pub(crate) fn cert_with_aia(responders: &[&str], issuer_urls: &[&str]) -> Vec<u8> {
        let mut body = Vec::new();
        for r in responders {
            body.extend(access_description(1, r));
        }
        for u in issuer_urls {
            body.extend(access_description(2, u));
        }
        let mut aia = vec![0x30, body.len() as u8];
        aia.extend(body);

        let mut params = rcgen::CertificateParams::default();
        params
            .custom_extensions
            .push(rcgen::CustomExtension::from_oid_content(
                &[1, 3, 6, 1, 5, 5, 7, 1, 1],
                aia,
            ));
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        cert.der().as_ref().to_vec()
    }

    /// Self-signed certificate with no AIA extension, in DER and PEM.
    pub(crate) fn plain_cert() -> (Vec<u8>, String) {
        let params = rcgen::CertificateParams::default();
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        (cert.der().as_ref().to_vec(), cert.pem())
    }

    pub(crate) fn canned_pair(responders: &[&str]) -> CertPair {
        let leaf = cert_with_aia(responders, &["http://ca.example.com/ca.der"]);
        let (issuer, _) = plain_cert();
        CertPair {
            leaf_der: Bytes::from(leaf),
            issuer_der: Bytes::from(issuer),
            responders: responders.iter().map(|r| r.to_string()).collect(),
        }
    }

    /// Test fetcher driven by a closure.
    pub(crate) struct FakeFetcher<F>(pub F);

    impl<F> CertFetcher for FakeFetcher<F>
    where
        F: Fn(&Endpoint) -> Result<CertPair, CertFetchError> + Send + Sync,
    {
        fn fetch_pair(&self, endpoint: &Endpoint) -> FetchFuture {
            let result = (self.0)(endpoint);
            Box::pin(async move { result })
        }
    }

    #[test]
    fn metadata_extracted_from_aia() {
        let der = cert_with_aia(
            &["http://ocsp.example.com", "http://ocsp2.example.com"],
            &["http://ca.example.com/ca.der"],
        );
        let meta = leaf_metadata("example.com:443", &der).unwrap();
        assert_eq!(
            meta.responders,
            vec!["http://ocsp.example.com", "http://ocsp2.example.com"]
        );
        assert_eq!(meta.issuer_urls, vec!["http://ca.example.com/ca.der"]);
    }

    #[test]
    fn metadata_empty_without_aia() {
        let (der, _) = plain_cert();
        let meta = leaf_metadata("example.com:443", &der).unwrap();
        assert!(meta.responders.is_empty());
        assert!(meta.issuer_urls.is_empty());
    }

    #[test]
    fn metadata_rejects_garbage() {
        let err = leaf_metadata("example.com:443", b"not a certificate").unwrap_err();
        assert!(matches!(err, CertFetchError::LeafParse(..)));
    }

    #[test]
    fn parse_certificate_accepts_der_and_pem() {
        let (der, pem) = plain_cert();
        assert_eq!(parse_certificate("x", &der).unwrap(), der);
        assert_eq!(parse_certificate("x", pem.as_bytes()).unwrap(), der);
    }

    #[test]
    fn parse_certificate_rejects_garbage() {
        let err = parse_certificate("http://ca.example.com", b"junk").unwrap_err();
        assert!(matches!(err, CertFetchError::IssuerParse(..)));
    }

    #[tokio::test]
    async fn refresh_swaps_pairs_wholesale() {
        let store = CertStore::new(Box::new(FakeFetcher(|ep: &Endpoint| {
            Ok(canned_pair(&[&format!("http://ocsp.{}", ep.name)]))
        })));
        let targets = vec![Endpoint::new("a.example.com"), Endpoint::new("b.example.com")];

        store.refresh(&targets).await;
        assert_eq!(store.len().await, 2);
        let pair = store.pair("a.example.com:443").await.unwrap();
        assert_eq!(pair.responders, vec!["http://ocsp.a.example.com"]);
    }

    #[tokio::test]
    async fn refresh_failure_keeps_previous_pair_and_continues() {
        // First cycle: both targets succeed.
        let store = CertStore::new(Box::new(FakeFetcher(|ep: &Endpoint| {
            if ep.name == "a.example.com" {
                Err(CertFetchError::EmptyPeerChain(ep.dial_addr()))
            } else {
                Ok(canned_pair(&["http://ocsp.example.com"]))
            }
        })));
        let targets = vec![Endpoint::new("a.example.com"), Endpoint::new("b.example.com")];

        // Seed target A manually to simulate an earlier good cycle.
        store
            .pairs
            .lock()
            .await
            .insert("a.example.com:443".to_string(), canned_pair(&["http://old.example.com"]));

        store.refresh(&targets).await;

        // A's failure kept its old pair; B was refreshed regardless.
        let a = store.pair("a.example.com:443").await.unwrap();
        assert_eq!(a.responders, vec!["http://old.example.com"]);
        let b = store.pair("b.example.com:443").await.unwrap();
        assert_eq!(b.responders, vec!["http://ocsp.example.com"]);
    }

    #[tokio::test]
    async fn refresh_prunes_vanished_targets() {
        let store = CertStore::new(Box::new(FakeFetcher(|_: &Endpoint| {
            Ok(canned_pair(&["http://ocsp.example.com"]))
        })));

        store
            .refresh(&[Endpoint::new("a.example.com"), Endpoint::new("b.example.com")])
            .await;
        assert_eq!(store.len().await, 2);

        store.refresh(&[Endpoint::new("b.example.com")]).await;
        assert!(store.pair("a.example.com:443").await.is_none());
        assert!(store.pair("b.example.com:443").await.is_some());
    }

    #[tokio::test]
    async fn missing_pair_reads_as_none() {
        let store = CertStore::new(Box::new(FakeFetcher(|_: &Endpoint| {
            Ok(canned_pair(&[]))
        })));
        assert!(store.pair("nope:443").await.is_none());
        assert!(store.is_empty().await);
    }
}
