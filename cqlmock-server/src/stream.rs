//! Client sockets, plain or TLS.

use pin_project_lite::pin_project;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream as ServerTlsStream;

pin_project! {
    /// An accepted client socket.
    #[project = MaybeStreamProj]
    pub enum MaybeTlsStream {
        Plain { #[pin] stream: TcpStream },
        Tls { #[pin] stream: ServerTlsStream<TcpStream> },
    }
}

impl MaybeTlsStream {
    pub fn is_tls(&self) -> bool {
        matches!(self, MaybeTlsStream::Tls { .. })
    }

    /// The TCP socket underneath any TLS session.
    pub fn tcp(&self) -> &TcpStream {
        match self {
            MaybeTlsStream::Plain { stream } => stream,
            MaybeTlsStream::Tls { stream } => stream.get_ref().0,
        }
    }

    /// Disables Nagle so small response frames go out at once.
    pub fn set_nodelay(&self) -> io::Result<()> {
        self.tcp().set_nodelay(true)
    }
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            MaybeStreamProj::Plain { stream } => stream.poll_read(cx, buf),
            MaybeStreamProj::Tls { stream } => stream.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            MaybeStreamProj::Plain { stream } => stream.poll_write(cx, buf),
            MaybeStreamProj::Tls { stream } => stream.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            MaybeStreamProj::Plain { stream } => stream.poll_flush(cx),
            MaybeStreamProj::Tls { stream } => stream.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            MaybeStreamProj::Plain { stream } => stream.poll_shutdown(cx),
            MaybeStreamProj::Tls { stream } => stream.poll_shutdown(cx),
        }
    }
}
