use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::rustls::{
    Certificate, ClientConfig, OwnedTrustAnchor, PrivateKey, RootCertStore, ServerConfig,
    ServerName,
};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::errors::WsError;

/// server certificate and key material
#[derive(Clone)]
pub struct TlsIdentity {
    certs: Vec<Certificate>,
    key: PrivateKey,
}

impl std::fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsIdentity")
            .field("certs", &self.certs.len())
            .finish()
    }
}

impl TlsIdentity {
    /// take a DER chain and key directly
    pub fn from_der(certs: Vec<Vec<u8>>, key: Vec<u8>) -> Self {
        Self {
            certs: certs.into_iter().map(Certificate).collect(),
            key: PrivateKey(key),
        }
    }

    /// discover `<folder>/<port>.cer` and `<folder>/<port>.key` (DER)
    pub fn from_der_files(folder: impl AsRef<Path>, port: u16) -> Result<Self, WsError> {
        let folder = folder.as_ref();
        let cert_path = folder.join(format!("{port}.cer"));
        let key_path = folder.join(format!("{port}.key"));
        let cert = read_file(&cert_path)?;
        let key = read_file(&key_path)?;
        Ok(Self::from_der(vec![cert], key))
    }

    /// load a PEM bundle carrying the chain and a pkcs8 or rsa key
    pub fn from_pem_file(path: impl AsRef<Path>) -> Result<Self, WsError> {
        let path = path.as_ref();
        let data = read_file(path)?;
        let mut reader = BufReader::new(&data[..]);
        let certs: Vec<Certificate> = rustls_pemfile::certs(&mut reader)
            .map_err(|e| WsError::LoadCertFailed(e.to_string()))?
            .into_iter()
            .map(Certificate)
            .collect();
        if certs.is_empty() {
            return Err(WsError::LoadCertFailed(format!(
                "no certificates in {}",
                path.display()
            )));
        }
        let mut reader = BufReader::new(&data[..]);
        let mut keys = rustls_pemfile::pkcs8_private_keys(&mut reader)
            .map_err(|e| WsError::LoadCertFailed(e.to_string()))?;
        if keys.is_empty() {
            let mut reader = BufReader::new(&data[..]);
            keys = rustls_pemfile::rsa_private_keys(&mut reader)
                .map_err(|e| WsError::LoadCertFailed(e.to_string()))?;
        }
        let key = keys
            .into_iter()
            .next()
            .ok_or_else(|| WsError::LoadCertFailed(format!("no key in {}", path.display())))?;
        Ok(Self {
            certs,
            key: PrivateKey(key),
        })
    }

    /// build the acceptor for the listener side
    pub fn into_acceptor(self) -> Result<TlsAcceptor, WsError> {
        let config = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(self.certs, self.key)
            .map_err(|e| WsError::LoadCertFailed(e.to_string()))?;
        Ok(TlsAcceptor::from(Arc::new(config)))
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>, WsError> {
    std::fs::read(path).map_err(|_| WsError::CertFileNotFound(path.display().to_string()))
}

/// wrap a client stream in TLS, trusting the webpki roots plus any
/// extra DER certificates
pub async fn wrap_client(
    stream: TcpStream,
    host: &str,
    extra_roots: &[PathBuf],
) -> Result<tokio_rustls::client::TlsStream<TcpStream>, WsError> {
    let mut roots = RootCertStore::empty();
    roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.0.iter().map(|ta| {
        OwnedTrustAnchor::from_subject_spki_name_constraints(
            ta.subject,
            ta.spki,
            ta.name_constraints,
        )
    }));
    for path in extra_roots {
        let der = read_file(path)?;
        roots
            .add(&Certificate(der))
            .map_err(|e| WsError::LoadCertFailed(e.to_string()))?;
    }
    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));
    let domain =
        ServerName::try_from(host).map_err(|e| WsError::TlsDnsFailed(e.to_string()))?;
    let tls_stream = connector
        .connect(domain, stream)
        .await
        .map_err(|e| WsError::ConnectionFailed(e.to_string()))?;
    tracing::debug!(host, "tls connection established");
    Ok(tls_stream)
}

/// a transport that is either plain TCP or TLS on one side of the
/// handshake
#[derive(Debug)]
pub enum MaybeTlsStream<S> {
    /// no TLS
    Plain(S),
    /// accepted side TLS
    ServerTls(tokio_rustls::server::TlsStream<S>),
    /// connecting side TLS
    ClientTls(tokio_rustls::client::TlsStream<S>),
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for MaybeTlsStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            MaybeTlsStream::ServerTls(s) => Pin::new(s).poll_read(cx, buf),
            MaybeTlsStream::ClientTls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for MaybeTlsStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            MaybeTlsStream::ServerTls(s) => Pin::new(s).poll_write(cx, buf),
            MaybeTlsStream::ClientTls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_flush(cx),
            MaybeTlsStream::ServerTls(s) => Pin::new(s).poll_flush(cx),
            MaybeTlsStream::ClientTls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            MaybeTlsStream::ServerTls(s) => Pin::new(s).poll_shutdown(cx),
            MaybeTlsStream::ClientTls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}
