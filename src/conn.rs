//! Connection helpers
//!
//! Timeout-bound TCP/UDP dialing, the rustls client handshake, and the
//! bounded banner read shared by the scan modules.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{self, ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use crate::error::{GrabError, Result};
use crate::grab::ScanTarget;
use crate::module::{BaseFlags, TlsFlags};

/// Grace period after the first chunk arrives: how long we keep reading
/// before deciding the wire has gone quiet.
const READ_GRACE: Duration = Duration::from_millis(150);

fn dial_port(target: &ScanTarget, flags: &BaseFlags) -> u16 {
    // A per-target port overrides the module flag.
    target.port.unwrap_or(flags.port())
}

/// Open a TCP connection to the target within the module timeout.
pub async fn open_tcp(target: &ScanTarget, flags: &BaseFlags) -> Result<TcpStream> {
    let host = target.host();
    let port = dial_port(target, flags);
    let address = (host.as_str(), port);

    match timeout(flags.timeout(), TcpStream::connect(address)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
            Err(GrabError::connection_refused(format!("{}:{}", host, port)))
        }
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(GrabError::connection_timeout(format!("{}:{}", host, port))),
    }
}

/// Open a TCP connection and complete the TLS handshake on it.
pub async fn open_tls(
    target: &ScanTarget,
    flags: &BaseFlags,
    tls: &TlsFlags,
) -> Result<TlsStream<TcpStream>> {
    let stream = open_tcp(target, flags).await?;
    let host = tls
        .tls_server_name
        .clone()
        .or_else(|| target.domain.clone())
        .unwrap_or_else(|| target.host());
    tls_handshake(stream, &host, flags, tls).await
}

/// Complete a TLS handshake on an established stream.
pub async fn tls_handshake(
    stream: TcpStream,
    host: &str,
    flags: &BaseFlags,
    tls: &TlsFlags,
) -> Result<TlsStream<TcpStream>> {
    let connector = TlsConnector::from(Arc::new(client_config(tls)));
    let name = ServerName::try_from(host.to_string())
        .map_err(|e| GrabError::protocol(format!("bad TLS server name {:?}: {}", host, e)))?;

    match timeout(flags.timeout(), connector.connect(name, stream)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(GrabError::protocol(format!("TLS handshake failed: {}", e))),
        Err(_) => Err(GrabError::connection_timeout("TLS handshake")),
    }
}

fn client_config(tls: &TlsFlags) -> ClientConfig {
    if tls.tls_skip_verify {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureCertificateVerifier))
            .with_no_client_auth()
    } else {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    }
}

/// Accepts any certificate. Installed by `--tls-skip-verify`.
#[derive(Debug)]
struct InsecureCertificateVerifier;

impl rustls::client::danger::ServerCertVerifier for InsecureCertificateVerifier {
    fn verify_server_cert(
        &self,
        _: &CertificateDer<'_>,
        _: &[CertificateDer<'_>],
        _: &ServerName<'_>,
        _: &[u8],
        _: UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _: &[u8],
        _: &CertificateDer<'_>,
        _: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _: &[u8],
        _: &CertificateDer<'_>,
        _: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Open a connected UDP socket to the target.
pub async fn open_udp(target: &ScanTarget, flags: &BaseFlags) -> Result<UdpSocket> {
    let host = target.host();
    let port = dial_port(target, flags);
    let bind_addr = match target.ip {
        Some(ip) if ip.is_ipv6() => "[::]:0",
        _ => "0.0.0.0:0",
    };
    let socket = UdpSocket::bind(bind_addr).await?;
    socket.connect((host.as_str(), port)).await?;
    Ok(socket)
}

/// Read whatever the remote sends, bounded by `max_size` bytes and by
/// time: `first_timeout` for the first byte, a short grace period for
/// followers. EOF and the size ceiling end the read normally; a timeout
/// before any byte arrived is a timeout error.
pub async fn read_available<S: AsyncRead + Unpin>(
    stream: &mut S,
    max_size: usize,
    first_timeout: Duration,
) -> io::Result<Vec<u8>> {
    let mut data = Vec::new();
    let mut buf = [0u8; 4096];
    let mut wait = first_timeout;

    loop {
        match timeout(wait, stream.read(&mut buf)).await {
            Ok(Ok(0)) => return Ok(data),
            Ok(Ok(n)) => {
                data.extend_from_slice(&buf[..n]);
                if data.len() >= max_size {
                    data.truncate(max_size);
                    return Ok(data);
                }
                wait = READ_GRACE;
            }
            Ok(Err(e)) => {
                if data.is_empty() {
                    return Err(e);
                }
                return Ok(data);
            }
            Err(_) => {
                if data.is_empty() {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out"));
                }
                return Ok(data);
            }
        }
    }
}

/// Receive a single UDP datagram within the deadline.
pub async fn recv_datagram(
    socket: &UdpSocket,
    max_size: usize,
    deadline: Duration,
) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; max_size.max(1)];
    match timeout(deadline, socket.recv(&mut buf)).await {
        Ok(Ok(n)) => {
            buf.truncate(n);
            Ok(buf)
        }
        Ok(Err(e)) => Err(e),
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "recv timed out")),
    }
}
