//! A client stream that may or may not be TLS-encrypted, so the connection
//! logic has a single code path for both.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use crate::store::StoreError;

pub enum MaybeSecureStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl MaybeSecureStream {
    /// Connect to `host:port`, negotiating TLS against the system web-PKI
    /// roots when requested.
    pub async fn connect(host: &str, port: u16, tls: bool) -> Result<Self, StoreError> {
        let tcp = TcpStream::connect((host, port)).await?;
        tcp.set_nodelay(true)?;

        if !tls {
            return Ok(MaybeSecureStream::Plain(tcp));
        }

        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| StoreError::Protocol(format!("invalid TLS server name: {host}")))?;

        let connector = TlsConnector::from(Arc::new(config));
        let stream = connector.connect(server_name, tcp).await?;
        Ok(MaybeSecureStream::Tls(Box::new(stream)))
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, MaybeSecureStream::Tls(_))
    }
}

impl AsyncRead for MaybeSecureStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeSecureStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            MaybeSecureStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeSecureStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            MaybeSecureStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            MaybeSecureStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeSecureStream::Plain(s) => Pin::new(s).poll_flush(cx),
            MaybeSecureStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeSecureStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            MaybeSecureStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}
