#![warn(missing_docs, missing_debug_implementations)]
#![warn(clippy::all)]

//! An asynchronous, connection-pooled HTTP/1.1 (and 1.0) client.
//!
//! This library dispatches requests over pooled TCP (or connector-provided)
//! transports with keep-alive reuse, and moves request and response bodies
//! without unbounded buffering: bodies are either fully available or
//! streamed with credit-based flow control, where the socket is only read
//! while the consumer holds outstanding demand.
//!
//! ## In scope
//!
//! * Connection pooling per (host, port, secure) with demand-driven
//!   resizing, acquire timeouts and idle expiry.
//! * `Content-Length` and `Transfer-Encoding: chunked` body framing, both
//!   directions, plus HTTP/1.0 close-delineated response bodies.
//! * `Connection: keep-alive`/`close` reuse decisions, tainting of broken
//!   connections, exactly-once release of pooled connections.
//! * `Expect: 100-continue` request flows.
//! * Small responses arrive fully buffered; larger or slower ones devolve
//!   to a backpressure-aware stream mid-receive without reordering.
//!
//! ## Out of scope
//!
//! Application level logic: redirects, cookies, content encodings, mime
//! types, serialization, and TLS itself (a [`Connector`] implementation's
//! job). HTTP/2 framing is not implemented here; the pool accounts for
//! multiplexed connections (they are never individually returned) so an
//! HTTP/2 transport can plug in at the connector seam.
//!
//! # Entry points
//!
//! [`Client`] is the facade: [`Client::exchange`] buffers the whole
//! response, [`Client::stream`] exposes headers and then a demand-driven
//! body, [`Client::proxy`] is `stream` without error-status conversion.
//! Cancellation is dropping the returned future; pooled connections are
//! released correctly on every path.

#[macro_use]
extern crate tracing;

mod body;
mod bufio;
mod chunked;
mod client;
mod config;
mod conn;
mod connector;
mod error;
mod http11;
mod key;
mod limit;
mod manager;
mod pool;
mod resize;

#[cfg(test)]
pub(crate) mod testio;

pub(crate) use futures_io::{AsyncRead, AsyncWrite};

pub use body::{Body, RecvStream, SendStream};
pub use client::{Client, ClientBuilder};
pub use config::PoolConfig;
pub use conn::ResponseFuture;
pub use connector::{from_tokio, BoxedIo, Connector, Established, HttpVersion, Io, TcpConnector};
pub use error::Error;
pub use key::RequestKey;

pub(crate) fn err_closed<T>() -> Result<T, Error> {
    use std::io;
    Err(io::Error::new(io::ErrorKind::NotConnected, "Connection is closed").into())
}
