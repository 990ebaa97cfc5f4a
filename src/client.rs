//! Client facade: exchange, stream, proxy.
//!
//! # Example
//!
//! ```rust, no_run
//! use hpool::{Body, Client};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), hpool::Error> {
//!     let client = Client::new();
//!
//!     let req = http::Request::get("http://example.com/hello")
//!         .body(Body::empty())?;
//!
//!     let res = client.exchange(req).await?;
//!
//!     println!("{} {:?}", res.status(), res.body());
//!
//!     Ok(())
//! }
//! ```

use crate::body::Body;
use crate::config::PoolConfig;
use crate::connector::{Connector, TcpConnector};
use crate::key::RequestKey;
use crate::manager::ConnectionManager;
use crate::Error;
use std::sync::Arc;

/// An asynchronous, connection-pooled HTTP/1.x client.
///
/// Cheap to clone; clones share the pools. Dropping the last clone (or
/// calling [`close`]) shuts the pools down.
///
/// [`close`]: Client::close
#[derive(Clone, Debug)]
pub struct Client {
    manager: Arc<ConnectionManager>,
    cfg: PoolConfig,
}

impl Client {
    /// A client with default pooling over plaintext TCP.
    pub fn new() -> Client {
        Client::builder().build()
    }

    /// Start configuring a client.
    pub fn builder() -> ClientBuilder {
        ClientBuilder {
            connector: None,
            cfg: PoolConfig::default(),
        }
    }

    /// Send a request and buffer the entire response body.
    ///
    /// 4xx/5xx statuses become [`Error::Status`]. Bodies larger than the
    /// configured `max_body_size` fail with [`Error::BodyTooLarge`].
    /// Dropping the returned future cancels the exchange; the connection
    /// is still accounted for correctly.
    pub async fn exchange(&self, req: http::Request<Body>) -> Result<http::Response<Vec<u8>>, Error> {
        let res = self.request(req, true, false).await?;

        let (parts, body) = res.into_parts();
        let body = body.collect(self.cfg.max_body_size).await?;

        Ok(http::Response::from_parts(parts, body))
    }

    /// Send a request and expose the response body as it arrives: headers
    /// once, then body chunks with demand-driven flow control.
    ///
    /// 4xx/5xx statuses become [`Error::Status`].
    pub async fn stream(&self, req: http::Request<Body>) -> Result<http::Response<Body>, Error> {
        self.request(req, true, true).await
    }

    /// Like [`stream`], but the upstream status is preserved verbatim: a
    /// 404 or 500 is a response, not an error.
    ///
    /// [`stream`]: Client::stream
    pub async fn proxy(&self, req: http::Request<Body>) -> Result<http::Response<Body>, Error> {
        self.request(req, false, true).await
    }

    async fn request(
        &self,
        req: http::Request<Body>,
        error_status: bool,
        for_stream: bool,
    ) -> Result<http::Response<Body>, Error> {
        let key = RequestKey::from_uri(req.uri())?;

        let (mut parts, body) = req.into_parts();

        // the framing decision is the caller's, via headers. fill in the
        // obvious default when neither is present.
        let framed = parts.headers.contains_key("content-length")
            || parts.headers.contains_key("transfer-encoding");

        if !framed {
            match &body {
                Body::Available(data) if !data.is_empty() => {
                    parts
                        .headers
                        .insert("content-length", data.len().to_string().parse().unwrap());
                }
                Body::Available(_) => {
                    // no body, no framing.
                }
                Body::Streaming(_) => {
                    parts
                        .headers
                        .insert("transfer-encoding", "chunked".parse().unwrap());
                }
            }
        }

        let wire = http::Request::from_parts(parts, ());

        let handle = if for_stream {
            self.manager.acquire_for_stream(&key).await?
        } else {
            self.manager.acquire_for_exchange(&key).await?
        };

        debug!("{} {} via {:?}", wire.method(), wire.uri(), handle);

        let fut = handle.send_request(wire, body)?;
        let res = fut.await?;

        if error_status && (res.status().is_client_error() || res.status().is_server_error()) {
            return Err(Error::Status(Box::new(res)));
        }

        Ok(res)
    }

    /// Shut down all pools. Waiting acquires fail, idle connections close,
    /// in-flight exchanges wind down with their connections.
    pub fn close(&self) {
        self.manager.shutdown();
    }
}

impl Default for Client {
    fn default() -> Self {
        Client::new()
    }
}

/// Configures and builds a [`Client`].
pub struct ClientBuilder {
    connector: Option<Arc<dyn Connector>>,
    cfg: PoolConfig,
}

impl std::fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "ClientBuilder {{ cfg: {:?} }}", self.cfg)
    }
}

impl ClientBuilder {
    /// Use a custom connector (TLS, proxies, in-memory transports).
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Pool configuration for every pool this client creates.
    pub fn config(mut self, cfg: PoolConfig) -> Self {
        self.cfg = cfg;
        self
    }

    /// Build the client.
    pub fn build(self) -> Client {
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(TcpConnector::default()));

        Client {
            manager: Arc::new(ConnectionManager::new(connector, self.cfg.clone())),
            cfg: self.cfg,
        }
    }
}
