//! Pluggable transport establishment.
//!
//! The pool asks a [`Connector`] for a new transport given a
//! [`RequestKey`]. TLS handshakes, proxies and protocol negotiation (ALPN)
//! are a connector's business; the pool only cares about the resulting
//! byte stream and the negotiated protocol version.

use crate::Error;
use crate::RequestKey;
use crate::{AsyncRead, AsyncWrite};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead as TokioAsyncRead, AsyncWrite as TokioAsyncWrite, ReadBuf};

/// Protocol version negotiated for a connection. HTTP/1 connections carry
/// one exchange at a time and are returned to the pool between exchanges;
/// HTTP/2 connections multiplex and are never individually returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    /// HTTP/1.x, one exchange at a time.
    Http1,
    /// HTTP/2, multiplexed.
    Http2,
}

/// Transport trait alias used by the pool.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

/// A connector-produced transport, type-erased.
pub type BoxedIo = Box<dyn Io>;

/// An established transport plus what was negotiated on it.
pub struct Established {
    /// The transport itself.
    pub io: BoxedIo,
    /// Negotiated protocol version.
    pub version: HttpVersion,
}

impl std::fmt::Debug for Established {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Established {{ version: {:?} }}", self.version)
    }
}

/// Produces a transport for a pool key.
pub trait Connector: Send + Sync + 'static {
    /// Establish a transport to the key's destination.
    fn connect(&self, key: &RequestKey) -> BoxFuture<'static, Result<Established, Error>>;
}

/// Plaintext TCP connector.
///
/// Secure keys are rejected; TLS is a different connector's concern.
#[derive(Debug, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect(&self, key: &RequestKey) -> BoxFuture<'static, Result<Established, Error>> {
        if key.is_secure() {
            let key = key.clone();
            return async move {
                Err(Error::User(format!(
                    "TcpConnector cannot connect securely to: {}",
                    key
                )))
            }
            .boxed();
        }

        let authority = key.authority();

        async move {
            let tcp = tokio::net::TcpStream::connect(authority.as_str()).await?;
            tcp.set_nodelay(true)?;

            Ok(Established {
                io: Box::new(from_tokio(tcp)) as BoxedIo,
                version: HttpVersion::Http1,
            })
        }
        .boxed()
    }
}

/// Adapt a tokio IO type to the futures-io traits the codec drives.
pub fn from_tokio<Z>(adapted: Z) -> TokioAdapter<Z>
where
    Z: TokioAsyncRead + TokioAsyncWrite + Unpin,
{
    TokioAdapter { adapted }
}

/// See [`from_tokio`].
#[derive(Debug)]
pub struct TokioAdapter<Z> {
    adapted: Z,
}

impl<Z: TokioAsyncRead + Unpin> AsyncRead for TokioAdapter<Z> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let mut read_buf = ReadBuf::new(buf);

        match Pin::new(&mut self.get_mut().adapted).poll_read(cx, &mut read_buf) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(e)) => Err(e).into(),
            Poll::Ready(Ok(())) => Ok(read_buf.filled().len()).into(),
        }
    }
}

impl<Z: TokioAsyncWrite + Unpin> AsyncWrite for TokioAdapter<Z> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        Pin::new(&mut self.get_mut().adapted).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Result<(), io::Error>> {
        Pin::new(&mut self.get_mut().adapted).poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Result<(), io::Error>> {
        Pin::new(&mut self.get_mut().adapted).poll_shutdown(cx)
    }
}
