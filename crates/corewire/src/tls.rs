//! TLS as an [`Adapter`]: the socket layer drives the same handshake loop
//! for plain and TLS connections, this module just fills in what
//! `after_create`/`after_accept`/`read`/`write` mean when there's a
//! `rustls` session in between.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;
use std::sync::Arc;

use mio::net::TcpStream;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, ClientConnection, ServerConfig, ServerConnection};

use crate::socket::{Adapter, AdapterStatus};

enum Side {
    Client(ClientConnection),
    Server(ServerConnection),
}

/// Wraps either side of a `rustls` session behind the [`Adapter`] seam.
pub struct TlsAdapter {
    side: Side,
}

impl TlsAdapter {
    pub fn client(config: Arc<ClientConfig>, server_name: ServerName<'static>) -> io::Result<Self> {
        let conn = ClientConnection::new(config, server_name).map_err(io::Error::other)?;
        Ok(Self { side: Side::Client(conn) })
    }

    pub fn server(config: Arc<ServerConfig>) -> io::Result<Self> {
        let conn = ServerConnection::new(config).map_err(io::Error::other)?;
        Ok(Self { side: Side::Server(conn) })
    }

    fn is_handshaking(&self) -> bool {
        match &self.side {
            Side::Client(c) => c.is_handshaking(),
            Side::Server(c) => c.is_handshaking(),
        }
    }

    fn wants_read(&self) -> bool {
        match &self.side {
            Side::Client(c) => c.wants_read(),
            Side::Server(c) => c.wants_read(),
        }
    }

    fn wants_write(&self) -> bool {
        match &self.side {
            Side::Client(c) => c.wants_write(),
            Side::Server(c) => c.wants_write(),
        }
    }

    fn pull_records(&mut self, stream: &mut TcpStream) -> io::Result<bool> {
        match match &mut self.side {
            Side::Client(c) => c.read_tls(stream),
            Side::Server(c) => c.read_tls(stream),
        } {
            Ok(0) => Ok(false),
            Ok(_) => {
                let result = match &mut self.side {
                    Side::Client(c) => c.process_new_packets().map(|_| ()),
                    Side::Server(c) => c.process_new_packets().map(|_| ()),
                };
                result.map_err(io::Error::other)?;
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    fn push_records(&mut self, stream: &mut TcpStream) -> io::Result<()> {
        match &mut self.side {
            Side::Client(c) => c.write_tls(stream),
            Side::Server(c) => c.write_tls(stream),
        }
        .map(|_| ())
    }

    /// One step of handshake: flush any pending outbound records, then try
    /// to pull and unwrap one batch of inbound ones. Called repeatedly
    /// (`AdapterStatus::Retry`) until the session stops handshaking.
    fn pump_handshake(&mut self, stream: &mut TcpStream) -> io::Result<AdapterStatus> {
        if self.wants_write() {
            match self.push_records(stream) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(AdapterStatus::NeedsWrite),
                Err(e) => return Err(e),
            }
        }
        if self.wants_read() {
            match self.pull_records(stream) {
                Ok(true) => {}
                Ok(false) => return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "tls peer closed mid-handshake")),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(AdapterStatus::NeedsRead),
                Err(e) => return Err(e),
            }
        }
        Ok(if self.is_handshaking() { AdapterStatus::Retry } else { AdapterStatus::Ready })
    }
}

impl Adapter for TlsAdapter {
    fn after_create(&mut self, stream: &mut TcpStream) -> io::Result<AdapterStatus> {
        self.pump_handshake(stream)
    }

    fn after_accept(&mut self, stream: &mut TcpStream) -> io::Result<AdapterStatus> {
        self.pump_handshake(stream)
    }

    fn read(&mut self, stream: &mut TcpStream, buf: &mut [u8]) -> io::Result<(usize, AdapterStatus)> {
        if self.wants_read() {
            match self.pull_records(stream) {
                Ok(false) => return Ok((0, AdapterStatus::Ready)),
                Ok(true) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
        }
        let plaintext = match &mut self.side {
            Side::Client(c) => c.reader().read(buf),
            Side::Server(c) => c.reader().read(buf),
        };
        match plaintext {
            Ok(0) => Ok((0, AdapterStatus::NeedsRead)),
            Ok(n) => Ok((n, AdapterStatus::Ready)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok((0, AdapterStatus::NeedsRead)),
            Err(e) => Err(e),
        }
    }

    fn write(&mut self, stream: &mut TcpStream, buf: &[u8]) -> io::Result<(usize, AdapterStatus)> {
        let n = match &mut self.side {
            Side::Client(c) => c.writer().write(buf)?,
            Side::Server(c) => c.writer().write(buf)?,
        };
        if self.wants_write() {
            match self.push_records(stream) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok((n, AdapterStatus::NeedsWrite)),
                Err(e) => return Err(e),
            }
        }
        Ok((n, AdapterStatus::Ready))
    }
}

/// Builds a server TLS config from a PEM certificate chain and private key
/// on disk, for one listening socket shared across every accepted
/// connection (`Arc`-cloned into a fresh [`TlsAdapter::server`] per
/// connection).
pub fn server_config(cert_path: &Path, key_path: &Path) -> io::Result<Arc<ServerConfig>> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;
    let config = ServerConfig::builder().with_no_client_auth().with_single_cert(certs, key).map_err(io::Error::other)?;
    Ok(Arc::new(config))
}

/// Builds a client TLS config trusting either a CA bundle on disk or, if
/// `ca_path` is `None`, the OS's native trust store.
pub fn client_config(ca_path: Option<&Path>) -> io::Result<Arc<ClientConfig>> {
    let mut roots = rustls::RootCertStore::empty();
    match ca_path {
        Some(path) => {
            for cert in load_certs(path)? {
                roots.add(cert).map_err(io::Error::other)?;
            }
        }
        None => {
            let native = rustls_native_certs::load_native_certs();
            for err in &native.errors {
                tracing::warn!(%err, "skipping unreadable native CA certificate");
            }
            for cert in native.certs {
                roots.add(cert).map_err(io::Error::other)?;
            }
        }
    }
    let config = ClientConfig::builder().with_root_certificates(roots).with_no_client_auth();
    Ok(Arc::new(config))
}

pub fn server_name(host: &str) -> io::Result<ServerName<'static>> {
    ServerName::try_from(host.to_string()).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid TLS server name"))
}

fn load_certs(path: &Path) -> io::Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::certs(&mut reader).collect::<io::Result<Vec<_>>>()
}

fn load_private_key(path: &Path) -> io::Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, format!("no private key found in {}", path.display())))
}
