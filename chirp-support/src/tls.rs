//! The TLS integration contract: the engine only ever sees an opaque byte transform with two
//! buffer pairs (plaintext in/out, ciphertext in/out). Chirp delegates the handshake and record
//! layer entirely to a real TLS library; this trait's shape — feed bytes in, drain bytes out,
//! report readiness — is an augmented reader/writer interface that keeps the engine oblivious
//! to which TLS implementation backs it.

use rustls::server::AllowAnyAuthenticatedClient;
use rustls::{
    Certificate, ClientConfig, ClientConnection, PrivateKey, RootCertStore, ServerConfig,
    ServerConnection, ServerName,
};
use std::fmt;
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::Arc;

#[derive(Debug)]
pub enum TlsError {
    Io(io::Error),
    NoCertificate,
    NoPrivateKey,
    InvalidServerName,
    Rustls(rustls::Error),
}

impl fmt::Display for TlsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsError::Io(err) => write!(f, "tls io error: {}", err),
            TlsError::NoCertificate => write!(f, "no certificate found in CERT_CHAIN_PEM"),
            TlsError::NoPrivateKey => write!(f, "no private key found in CERT_CHAIN_PEM"),
            TlsError::InvalidServerName => write!(f, "address is not a valid TLS server name"),
            TlsError::Rustls(err) => write!(f, "tls error: {}", err),
        }
    }
}

impl std::error::Error for TlsError {}

impl From<io::Error> for TlsError {
    fn from(err: io::Error) -> TlsError {
        TlsError::Io(err)
    }
}

impl From<rustls::Error> for TlsError {
    fn from(err: rustls::Error) -> TlsError {
        TlsError::Rustls(err)
    }
}

/// Opaque byte transform the engine drives without knowing which TLS library (or whether any
/// TLS library at all) sits behind it.
pub trait TlsEngine: Send {
    /// Hand the engine bytes that arrived off the wire.
    fn feed_ciphertext(&mut self, data: &[u8]) -> Result<usize, TlsError>;
    /// Pull any plaintext the engine has produced so far, appending to `out`.
    fn drain_plaintext(&mut self, out: &mut Vec<u8>) -> Result<usize, TlsError>;
    /// Hand the engine plaintext the reader/writer wants to send.
    fn feed_plaintext(&mut self, data: &[u8]) -> Result<usize, TlsError>;
    /// Pull any ciphertext the engine wants written to the socket, appending to `out`.
    fn drain_ciphertext(&mut self, out: &mut Vec<u8>) -> Result<usize, TlsError>;
    /// True once the handshake sub-state can be left and plaintext delivered upward.
    fn handshake_complete(&self) -> bool;
}

/// Identity transform used by unit/integration tests so the reader/writer state machines can
/// be exercised without a certificate on disk. Ciphertext and plaintext are the same bytes.
#[derive(Default)]
pub struct PassThroughEngine {
    inbound: Vec<u8>,
    outbound: Vec<u8>,
}

impl PassThroughEngine {
    pub fn new() -> PassThroughEngine {
        PassThroughEngine::default()
    }
}

impl TlsEngine for PassThroughEngine {
    fn feed_ciphertext(&mut self, data: &[u8]) -> Result<usize, TlsError> {
        self.inbound.extend_from_slice(data);
        Ok(data.len())
    }

    fn drain_plaintext(&mut self, out: &mut Vec<u8>) -> Result<usize, TlsError> {
        let n = self.inbound.len();
        out.append(&mut self.inbound);
        Ok(n)
    }

    fn feed_plaintext(&mut self, data: &[u8]) -> Result<usize, TlsError> {
        self.outbound.extend_from_slice(data);
        Ok(data.len())
    }

    fn drain_ciphertext(&mut self, out: &mut Vec<u8>) -> Result<usize, TlsError> {
        let n = self.outbound.len();
        out.append(&mut self.outbound);
        Ok(n)
    }

    fn handshake_complete(&self) -> bool {
        true
    }
}

enum Side {
    Server(ServerConnection),
    Client(ClientConnection),
}

/// `rustls`-backed implementation. Every node in a Chirp cluster is provisioned with the same
/// `CERT_CHAIN_PEM` — a self-signed certificate plus its private key — and trusts exactly that
/// certificate from every peer, giving mutual TLS without a CA hierarchy, rather than handing
/// every node a public CA bundle.
pub struct RustlsEngine {
    side: Side,
}

impl RustlsEngine {
    /// Build the engine for an inbound (accepted) connection.
    pub fn server(cert_chain_pem: &Path) -> Result<RustlsEngine, TlsError> {
        let (certs, key) = load_identity(cert_chain_pem)?;
        let roots = pinned_roots(&certs)?;

        let verifier = AllowAnyAuthenticatedClient::new(roots);
        let config = ServerConfig::builder()
            .with_safe_defaults()
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)?;

        let conn = ServerConnection::new(Arc::new(config))?;
        Ok(RustlsEngine { side: Side::Server(conn) })
    }

    /// Build the engine for an outbound (dialed) connection. `server_name` is the address
    /// being dialed; since the certificate is pinned rather than CA-issued, it is used only to
    /// satisfy the SNI extension, not for hostname validation.
    pub fn client(cert_chain_pem: &Path, server_name: &str) -> Result<RustlsEngine, TlsError> {
        let (certs, key) = load_identity(cert_chain_pem)?;
        let roots = pinned_roots(&certs)?;

        let config = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(roots)
            .with_client_auth_cert(certs, key)
            .map_err(TlsError::Rustls)?;

        let name = ServerName::try_from(server_name).map_err(|_| TlsError::InvalidServerName)?;
        let conn = ClientConnection::new(Arc::new(config), name)?;
        Ok(RustlsEngine { side: Side::Client(conn) })
    }
}

impl TlsEngine for RustlsEngine {
    fn feed_ciphertext(&mut self, mut data: &[u8]) -> Result<usize, TlsError> {
        let n = match &mut self.side {
            Side::Server(conn) => conn.read_tls(&mut data)?,
            Side::Client(conn) => conn.read_tls(&mut data)?,
        };

        match &mut self.side {
            Side::Server(conn) => conn.process_new_packets().map_err(TlsError::Rustls)?,
            Side::Client(conn) => conn.process_new_packets().map_err(TlsError::Rustls)?,
        };

        Ok(n)
    }

    fn drain_plaintext(&mut self, out: &mut Vec<u8>) -> Result<usize, TlsError> {
        let mut buf = [0u8; 4096];
        let mut total = 0;

        loop {
            let read = match &mut self.side {
                Side::Server(conn) => conn.reader().read(&mut buf),
                Side::Client(conn) => conn.reader().read(&mut buf),
            };

            match read {
                Ok(0) => break,
                Ok(n) => {
                    out.extend_from_slice(&buf[..n]);
                    total += n;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(TlsError::Io(err)),
            }
        }

        Ok(total)
    }

    fn feed_plaintext(&mut self, data: &[u8]) -> Result<usize, TlsError> {
        let n = match &mut self.side {
            Side::Server(conn) => conn.writer().write(data)?,
            Side::Client(conn) => conn.writer().write(data)?,
        };
        Ok(n)
    }

    fn drain_ciphertext(&mut self, out: &mut Vec<u8>) -> Result<usize, TlsError> {
        let mut buf = [0u8; 4096];
        let mut total = 0;

        loop {
            let mut cursor = &mut buf[..];
            let written = match &mut self.side {
                Side::Server(conn) => conn.write_tls(&mut cursor),
                Side::Client(conn) => conn.write_tls(&mut cursor),
            };

            match written {
                Ok(0) => break,
                Ok(n) => {
                    out.extend_from_slice(&buf[..n]);
                    total += n;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(TlsError::Io(err)),
            }
        }

        Ok(total)
    }

    fn handshake_complete(&self) -> bool {
        match &self.side {
            Side::Server(conn) => !conn.is_handshaking(),
            Side::Client(conn) => !conn.is_handshaking(),
        }
    }
}

fn load_identity(cert_chain_pem: &Path) -> Result<(Vec<Certificate>, PrivateKey), TlsError> {
    let mut reader = io::BufReader::new(std::fs::File::open(cert_chain_pem)?);

    let certs: Vec<Certificate> = rustls_pemfile::certs(&mut reader)?
        .into_iter()
        .map(Certificate)
        .collect();

    if certs.is_empty() {
        return Err(TlsError::NoCertificate);
    }

    // The private key shares the same PEM file as the certificate in Chirp's deployment model.
    let mut reader = io::BufReader::new(std::fs::File::open(cert_chain_pem)?);
    let key = rustls_pemfile::pkcs8_private_keys(&mut reader)?
        .into_iter()
        .next()
        .map(PrivateKey)
        .ok_or(TlsError::NoPrivateKey)?;

    Ok((certs, key))
}

fn pinned_roots(certs: &[Certificate]) -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();

    for cert in certs {
        // The pinned certificate is self-signed, so it is its own trust anchor. `add` parses
        // the DER certificate and derives the subject/SPKI trust-anchor fields itself, rather
        // than us having to reconstruct them by hand.
        roots.add(cert)?;
    }

    Ok(roots)
}
