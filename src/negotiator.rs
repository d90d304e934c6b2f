//! Connection negotiation: bring a raw TCP socket to an HTTP/2-ready byte
//! stream.
//!
//! Variants: plaintext (prior knowledge), TLS via rustls with ALPN `h2`, and
//! HTTP/1.1 Upgrade to h2c. The negotiator returns split read/write halves
//! plus a handle used to shut the socket down from the writer thread, which
//! is what unblocks the reader during teardown.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;

use parking_lot::Mutex;
use rustls::pki_types::ServerName;
use tracing::warn;

/// Errors from strict authority parsing.
///
/// Unusual host forms are rejected outright rather than falling back to the
/// raw string; the TLS server name must be something the verifier can
/// actually check.
#[derive(Debug, thiserror::Error)]
pub enum AuthorityError {
    #[error("authority is empty")]
    Empty,
    #[error("invalid authority: {0}")]
    InvalidHost(String),
    #[error("invalid port in authority: {0}")]
    InvalidPort(String),
}

/// Extract the host from an `authority` string (`host`, `host:port`, or
/// `[v6]:port`).
pub fn authority_host(authority: &str) -> Result<&str, AuthorityError> {
    if authority.is_empty() {
        return Err(AuthorityError::Empty);
    }
    let host = if let Some(rest) = authority.strip_prefix('[') {
        match rest.find(']') {
            Some(end) => &rest[..end],
            None => return Err(AuthorityError::InvalidHost(authority.to_string())),
        }
    } else if let Some((host, port)) = authority.rsplit_once(':') {
        if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
            return Err(AuthorityError::InvalidPort(authority.to_string()));
        }
        host
    } else {
        authority
    };
    if host.is_empty()
        || host
            .bytes()
            .any(|b| b.is_ascii_whitespace() || b == b'/' || b == b'@')
    {
        return Err(AuthorityError::InvalidHost(authority.to_string()));
    }
    Ok(host)
}

/// Extract the port from an `authority` string, or `default` if absent.
pub fn authority_port(authority: &str, default: u16) -> Result<u16, AuthorityError> {
    let port_part = if let Some(rest) = authority.strip_prefix('[') {
        match rest.find(']') {
            Some(end) => {
                let after = &rest[end + 1..];
                after.strip_prefix(':')
            }
            None => return Err(AuthorityError::InvalidHost(authority.to_string())),
        }
    } else {
        authority.rsplit_once(':').map(|(_, port)| port)
    };
    match port_part {
        None => Ok(default),
        Some(port) => port
            .parse()
            .map_err(|_| AuthorityError::InvalidPort(authority.to_string())),
    }
}

/// Handle for shutting the socket down out of band.
pub trait SocketHandle: Send + Sync {
    fn close(&self) -> io::Result<()>;
}

impl SocketHandle for TcpStream {
    fn close(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }
}

/// A negotiated, HTTP/2-ready byte stream.
pub struct Negotiated {
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
    pub socket: Box<dyn SocketHandle>,
}

impl std::fmt::Debug for Negotiated {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Negotiated").finish_non_exhaustive()
    }
}

/// Transforms an established TCP socket into an HTTP/2-ready byte stream.
///
/// A failure here is transport-fatal: it propagates straight through the
/// connect path and becomes the transport's terminal status.
pub trait Negotiator: Send + Sync {
    fn negotiate(&self, socket: TcpStream, authority: &str) -> io::Result<Negotiated>;

    /// The `:scheme` pseudo-header value for requests on this connection.
    fn scheme(&self) -> &'static str;
}

fn split_tcp(socket: TcpStream) -> io::Result<Negotiated> {
    let reader = socket.try_clone()?;
    let writer = socket.try_clone()?;
    Ok(Negotiated {
        reader: Box::new(reader),
        writer: Box::new(writer),
        socket: Box::new(socket),
    })
}

/// Direct plaintext HTTP/2 (prior knowledge).
pub struct PlaintextNegotiator;

impl Negotiator for PlaintextNegotiator {
    fn negotiate(&self, socket: TcpStream, _authority: &str) -> io::Result<Negotiated> {
        split_tcp(socket)
    }

    fn scheme(&self) -> &'static str {
        "http"
    }
}

/// TLS negotiation via rustls, with ALPN `h2` and the server name taken
/// from the authority.
pub struct TlsNegotiator {
    config: Arc<rustls::ClientConfig>,
}

impl TlsNegotiator {
    /// Build with the webpki root set and ALPN `h2`.
    pub fn new() -> Self {
        let roots = rustls::RootCertStore::from_iter(
            webpki_roots::TLS_SERVER_ROOTS.iter().cloned(),
        );
        let mut config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        config.alpn_protocols = vec![b"h2".to_vec()];
        Self {
            config: Arc::new(config),
        }
    }

    /// Build from a caller-supplied rustls config (custom roots, ciphers,
    /// client auth).
    pub fn with_config(config: Arc<rustls::ClientConfig>) -> Self {
        Self { config }
    }
}

impl Default for TlsNegotiator {
    fn default() -> Self {
        Self::new()
    }
}

impl Negotiator for TlsNegotiator {
    fn negotiate(&self, socket: TcpStream, authority: &str) -> io::Result<Negotiated> {
        let host = authority_host(authority)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let mut conn = rustls::ClientConnection::new(self.config.clone(), server_name)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let mut socket = socket;
        while conn.is_handshaking() {
            conn.complete_io(&mut socket)?;
        }
        match conn.alpn_protocol() {
            Some(proto) if proto == b"h2" => {}
            other => warn!(?other, "peer did not negotiate h2 via ALPN"),
        }

        let conn = Arc::new(Mutex::new(conn));
        let read_socket = socket.try_clone()?;
        let write_socket = socket.try_clone()?;
        Ok(Negotiated {
            reader: Box::new(TlsReadHalf {
                conn: conn.clone(),
                socket: read_socket,
            }),
            writer: Box::new(TlsWriteHalf {
                conn,
                socket: write_socket,
            }),
            socket: Box::new(socket),
        })
    }

    fn scheme(&self) -> &'static str {
        "https"
    }
}

/// Read half of a TLS stream. The blocking socket read happens outside the
/// session lock so the write half stays usable while we wait for records.
struct TlsReadHalf {
    conn: Arc<Mutex<rustls::ClientConnection>>,
    socket: TcpStream,
}

impl Read for TlsReadHalf {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            {
                let mut conn = self.conn.lock();
                match conn.reader().read(buf) {
                    Ok(n) => return Ok(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(e),
                }
            }

            let mut raw = [0u8; 16 * 1024];
            let n = self.socket.read(&mut raw)?;
            if n == 0 {
                return Ok(0);
            }
            let mut conn = self.conn.lock();
            let mut cursor = &raw[..n];
            while !cursor.is_empty() {
                let consumed = conn.read_tls(&mut cursor)?;
                conn.process_new_packets()
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                if consumed == 0 {
                    break;
                }
            }
        }
    }
}

/// Write half of a TLS stream. Records are serialized under the session
/// lock into a local buffer and pushed to the socket after releasing it.
struct TlsWriteHalf {
    conn: Arc<Mutex<rustls::ClientConnection>>,
    socket: TcpStream,
}

impl TlsWriteHalf {
    fn pump(&mut self, pending: &mut Vec<u8>) -> io::Result<()> {
        {
            let mut conn = self.conn.lock();
            while conn.wants_write() {
                conn.write_tls(pending)?;
            }
        }
        self.socket.write_all(pending)
    }
}

impl Write for TlsWriteHalf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.conn.lock().writer().write(buf)?;
        let mut pending = Vec::new();
        self.pump(&mut pending)?;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut pending = Vec::new();
        self.pump(&mut pending)?;
        self.socket.flush()
    }
}

/// HTTP/1.1 Upgrade to h2c: OPTIONS with `Upgrade: h2c`, requiring a 101
/// before HTTP/2 framing starts. Stream 1 stays reserved for the upgrade
/// response, which is why client stream ids start at 3.
pub struct UpgradeNegotiator;

impl Negotiator for UpgradeNegotiator {
    fn negotiate(&self, socket: TcpStream, authority: &str) -> io::Result<Negotiated> {
        let mut socket = socket;
        let request = format!(
            "OPTIONS * HTTP/1.1\r\nHost: {}\r\nConnection: Upgrade, HTTP2-Settings\r\nUpgrade: h2c\r\nHTTP2-Settings: \r\n\r\n",
            authority
        );
        socket.write_all(request.as_bytes())?;
        socket.flush()?;

        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            if socket.read(&mut byte)? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed during HTTP/1.1 upgrade",
                ));
            }
            head.push(byte[0]);
            if head.len() > 16 * 1024 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "oversized HTTP/1.1 upgrade response",
                ));
            }
        }

        let head = String::from_utf8_lossy(&head);
        let status_line = head.lines().next().unwrap_or_default();
        let upgraded = status_line.starts_with("HTTP/1.1 101");
        if !upgraded {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("HTTP/1.1 upgrade refused: {}", status_line),
            ));
        }
        split_tcp(socket)
    }

    fn scheme(&self) -> &'static str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn authority_host_forms() {
        assert_eq!(authority_host("example.com").unwrap(), "example.com");
        assert_eq!(authority_host("example.com:443").unwrap(), "example.com");
        assert_eq!(authority_host("[::1]:50051").unwrap(), "::1");
        assert_eq!(authority_host("10.0.0.1:80").unwrap(), "10.0.0.1");
    }

    #[test]
    fn authority_host_rejects_garbage() {
        assert!(matches!(authority_host(""), Err(AuthorityError::Empty)));
        assert!(authority_host("example.com:http").is_err());
        assert!(authority_host("user@example.com").is_err());
        assert!(authority_host("host name:80").is_err());
        assert!(authority_host("[::1").is_err());
        assert!(authority_host(":443").is_err());
    }

    #[test]
    fn authority_port_forms() {
        assert_eq!(authority_port("example.com", 443).unwrap(), 443);
        assert_eq!(authority_port("example.com:50051", 443).unwrap(), 50051);
        assert_eq!(authority_port("[::1]:50051", 443).unwrap(), 50051);
        assert_eq!(authority_port("[::1]", 443).unwrap(), 443);
        assert!(authority_port("example.com:zzz", 443).is_err());
    }

    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = thread::spawn(move || listener.accept().unwrap().0);
        let client = TcpStream::connect(addr).unwrap();
        (client, accept.join().unwrap())
    }

    #[test]
    fn plaintext_split_halves_share_the_socket() {
        let (client, mut server) = socket_pair();
        let negotiated = PlaintextNegotiator
            .negotiate(client, "example.com")
            .unwrap();
        let mut reader = negotiated.reader;
        let mut writer = negotiated.writer;

        writer.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");

        server.write_all(b"pong").unwrap();
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[test]
    fn upgrade_accepts_101() {
        let (client, mut server) = socket_pair();
        let server_thread = thread::spawn(move || {
            let mut request = Vec::new();
            let mut byte = [0u8; 1];
            while !request.ends_with(b"\r\n\r\n") {
                server.read_exact(&mut byte).unwrap();
                request.push(byte[0]);
            }
            let request = String::from_utf8(request).unwrap();
            assert!(request.contains("Upgrade: h2c"));
            server
                .write_all(b"HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: h2c\r\n\r\n")
                .unwrap();
        });

        let negotiated = UpgradeNegotiator.negotiate(client, "example.com:80");
        server_thread.join().unwrap();
        assert!(negotiated.is_ok());
    }

    #[test]
    fn upgrade_rejects_non_101() {
        let (client, mut server) = socket_pair();
        let server_thread = thread::spawn(move || {
            let mut request = Vec::new();
            let mut byte = [0u8; 1];
            while !request.ends_with(b"\r\n\r\n") {
                server.read_exact(&mut byte).unwrap();
                request.push(byte[0]);
            }
            server
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
                .unwrap();
        });

        let err = UpgradeNegotiator
            .negotiate(client, "example.com:80")
            .unwrap_err();
        server_thread.join().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }

    #[test]
    fn schemes() {
        assert_eq!(PlaintextNegotiator.scheme(), "http");
        assert_eq!(UpgradeNegotiator.scheme(), "http");
        assert_eq!(TlsNegotiator::new().scheme(), "https");
    }
}
