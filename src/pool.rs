//! Per-key connection pool: checkout, release, lifecycle.
//!
//! A `Pool` owns the live connections for one [`RequestKey`]: an idle list
//! with parking timestamps, the queue of waiting acquires, and the
//! [`Resizer`] that keeps connection supply aligned with demand. Checkout
//! produces a [`PooledHandle`]; the release decision (return vs close) is
//! made by the connection codec at the end of the response lifecycle and
//! arrives through the [`Lease`], exactly once.

use crate::config::PoolConfig;
use crate::conn::{self, ConnConfig, ResponseFuture, SendRequest};
use crate::connector::{Connector, Established, HttpVersion};
use crate::key::RequestKey;
use crate::resize::{OpenConnections, ResizeLimits, Resizer};
use crate::Body;
use crate::Error;
use futures_channel::oneshot;
use std::collections::{HashMap, VecDeque};
use std::mem;
use std::sync::{Arc, Mutex};
use std::time::Instant;

pub(crate) struct Pool {
    key: RequestKey,
    cfg: PoolConfig,
    connector: Arc<dyn Connector>,
    resizer: Resizer,
    inner: Mutex<PoolInner>,
}

struct PoolInner {
    next_conn_id: u64,
    next_waiter_id: u64,
    conns: HashMap<u64, ConnEntry>,
    idle: VecDeque<IdleEntry>,
    waiting: VecDeque<Waiter>,
    shutdown: bool,
}

struct ConnEntry {
    send: SendRequest,
    version: HttpVersion,
    leased: bool,
}

struct IdleEntry {
    id: u64,
    since: Instant,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<PooledHandle>,
}

impl Pool {
    pub fn new(key: RequestKey, cfg: PoolConfig, connector: Arc<dyn Connector>) -> Self {
        let limits = ResizeLimits {
            max_http1_connections: cfg.max_http1_connections,
            max_http2_connections: cfg.max_http2_connections,
            max_pending_connections: cfg.max_pending_connections,
        };

        Pool {
            key,
            cfg,
            connector,
            resizer: Resizer::new(limits),
            inner: Mutex::new(PoolInner {
                next_conn_id: 0,
                next_waiter_id: 0,
                conns: HashMap::new(),
                idle: VecDeque::new(),
                waiting: VecDeque::new(),
                shutdown: false,
            }),
        }
    }

    /// Check out a connection, reusing an idle one when possible and
    /// otherwise waiting (and signalling demand) until one is handed over
    /// or the acquire timeout fires.
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledHandle, Error> {
        let (tx, rx) = oneshot::channel();

        // checkout and waiter enqueue happen under one lock so a
        // connection parked in between cannot be missed.
        let waiter_id = {
            let mut inner = self.inner.lock().unwrap();

            if inner.shutdown {
                return Err(Error::User("Client is closed".into()));
            }

            // fast path: a live, unexpired idle connection.
            while let Some(entry) = inner.idle.pop_front() {
                let alive = inner
                    .conns
                    .get(&entry.id)
                    .map(|e| !e.send.is_closed())
                    .unwrap_or(false);

                if !alive {
                    trace!("Skipping dead idle connection ({})", entry.id);
                    continue;
                }

                if entry.since.elapsed() > self.cfg.idle_timeout {
                    trace!("Closing expired idle connection ({})", entry.id);
                    inner.conns.remove(&entry.id);
                    continue;
                }

                trace!("Reusing pooled connection ({})", entry.id);
                return Ok(make_handle(self, &mut inner, entry.id));
            }

            // slow path: queue up.
            if inner.waiting.len() >= self.cfg.max_pending_acquires {
                return Err(Error::PoolExhausted);
            }

            let id = inner.next_waiter_id;
            inner.next_waiter_id += 1;
            inner.waiting.push_back(Waiter { id, tx });
            id
        };

        self.resizer.on_pending_request_change(1, self);

        match tokio::time::timeout(self.cfg.acquire_timeout, rx).await {
            Ok(Ok(handle)) => Ok(handle),
            Ok(Err(_)) => Err(Error::User("Client is closed".into())),
            Err(_elapsed) => {
                let removed = {
                    let mut inner = self.inner.lock().unwrap();
                    let pos = inner.waiting.iter().position(|w| w.id == waiter_id);
                    if let Some(pos) = pos {
                        inner.waiting.remove(pos);
                        true
                    } else {
                        false
                    }
                };

                if removed {
                    // this acquire stops counting as demand.
                    self.resizer.on_pending_request_change(-1, self);
                }

                Err(Error::AcquireTimeout(self.cfg.acquire_timeout))
            }
        }
    }

    /// Codec verdict at the end of an exchange: return the connection or
    /// close it.
    pub(crate) fn exchange_finished(self: &Arc<Self>, id: u64, reusable: bool) {
        if reusable {
            {
                let mut inner = self.inner.lock().unwrap();
                match inner.conns.get_mut(&id) {
                    Some(e) => e.leased = false,
                    None => return,
                }
            }
            self.dispatch(id);
        } else {
            trace!("Discarding connection ({})", id);
            let mut inner = self.inner.lock().unwrap();
            inner.conns.remove(&id);
            inner.idle.retain(|e| e.id != id);
        }
    }

    /// A connection attempt produced a live transport.
    fn connection_ready(self: &Arc<Self>, est: Established) {
        let version = est.version;

        self.resizer.on_connection_established(version, self);

        let conn_cfg = ConnConfig {
            read_timeout: self.cfg.read_timeout,
            buffer_body_limit: self.cfg.buffer_body_limit,
        };

        let (send, conn) = conn::handshake(est.io, conn_cfg);

        let id = {
            let mut inner = self.inner.lock().unwrap();

            if inner.shutdown {
                drop(inner);
                self.resizer.on_connection_inactive(version, self);
                return;
            }

            let id = inner.next_conn_id;
            inner.next_conn_id += 1;
            inner.conns.insert(
                id,
                ConnEntry {
                    send,
                    version,
                    leased: false,
                },
            );
            id
        };

        debug!("Connection ({}) established to {}", id, self.key);

        let pool = self.clone();
        tokio::spawn(async move {
            match conn.await {
                Ok(()) => debug!("Connection ({}) closed", id),
                Err(e) => debug!("Connection ({}) failed: {}", id, e),
            }
            pool.connection_closed(id, version);
        });

        self.dispatch(id);
    }

    /// Hand an unleased connection to the oldest waiter, or park it idle.
    fn dispatch(self: &Arc<Self>, id: u64) {
        let mut handed = 0_usize;

        {
            let mut inner = self.inner.lock().unwrap();

            if inner.shutdown {
                inner.conns.remove(&id);
            } else {
                loop {
                    if !inner.conns.contains_key(&id) {
                        break;
                    }

                    if let Some(w) = inner.waiting.pop_front() {
                        let handle = make_handle(self, &mut inner, id);

                        match w.tx.send(handle) {
                            Ok(()) => {
                                handed += 1;
                                break;
                            }
                            Err(mut handle) => {
                                // waiter gave up (timed out). disarm so the
                                // drop below does not re-enter the pool.
                                handle.armed = false;
                                if let Some(e) = inner.conns.get_mut(&id) {
                                    e.leased = false;
                                }
                            }
                        }
                    } else {
                        inner.idle.push_back(IdleEntry {
                            id,
                            since: Instant::now(),
                        });
                        break;
                    }
                }
            }
        }

        for _ in 0..handed {
            self.resizer.on_pending_request_change(-1, self);
        }
    }

    /// Driver exit: the transport is gone for good.
    fn connection_closed(self: &Arc<Self>, id: u64, version: HttpVersion) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.conns.remove(&id);
            inner.idle.retain(|e| e.id != id);
        }

        self.resizer.on_connection_inactive(version, self);
    }

    /// Close everything. Waiting acquires fail, connections stop accepting
    /// requests and wind down.
    pub fn shutdown(self: &Arc<Self>) {
        let conns = {
            let mut inner = self.inner.lock().unwrap();
            inner.shutdown = true;
            inner.waiting.clear();
            inner.idle.clear();
            mem::take(&mut inner.conns)
        };

        // dropping the senders lets each codec wind down, which reports
        // connection_closed per connection.
        drop(conns);
    }

    #[cfg(test)]
    pub(crate) fn idle_count(&self) -> usize {
        self.inner.lock().unwrap().idle.len()
    }

    #[cfg(test)]
    pub(crate) fn conn_count(&self) -> usize {
        self.inner.lock().unwrap().conns.len()
    }
}

impl OpenConnections for Arc<Pool> {
    fn open_connection(&self) {
        let pool = self.clone();

        tokio::spawn(async move {
            let fut = pool.connector.connect(&pool.key);

            match fut.await {
                Ok(est) => pool.connection_ready(est),
                Err(e) => pool.resizer.on_connection_failure(&e, &pool),
            }
        });
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Pool {{ key: {}, {:?} }}", self.key, self.resizer)
    }
}

fn make_handle(pool: &Arc<Pool>, inner: &mut PoolInner, id: u64) -> PooledHandle {
    let entry = inner.conns.get_mut(&id).expect("make_handle without entry");

    // invariant: a connection is leased to one exchange at a time.
    assert!(!entry.leased, "make_handle on leased connection");
    entry.leased = true;

    PooledHandle {
        pool: pool.clone(),
        id,
        send: entry.send.clone(),
        version: entry.version,
        armed: true,
    }
}

/// A checkout ticket for one connection.
///
/// Consumed by [`send_request`], which transfers the release duty to the
/// connection via a [`Lease`]. A handle dropped without sending releases
/// the connection as not-returnable. Either way the release happens
/// exactly once.
///
/// [`send_request`]: PooledHandle::send_request
pub(crate) struct PooledHandle {
    pool: Arc<Pool>,
    id: u64,
    send: SendRequest,
    version: HttpVersion,
    armed: bool,
}

impl PooledHandle {
    /// Whether this connection can go back in the pool at all. HTTP/2
    /// connections multiplex and are never individually returned; a
    /// pool with keep-alive disabled returns nothing.
    pub fn can_return(&self) -> bool {
        self.version == HttpVersion::Http1 && self.pool.cfg.keep_alive
    }

    /// Send a request over the leased connection. The response lifecycle
    /// decides when and how the connection is released.
    pub fn send_request(
        mut self,
        req: http::Request<()>,
        body: Body,
    ) -> Result<ResponseFuture, Error> {
        let lease = Lease {
            inner: Some(LeaseInner {
                pool: self.pool.clone(),
                id: self.id,
                can_return: self.can_return(),
            }),
        };

        // the lease owns the release now, even if the send fails (the
        // codec side drops it, which releases as not-returnable).
        self.armed = false;

        let mut send = self.send.clone();
        send.send_request(req, body, lease)
    }
}

impl Drop for PooledHandle {
    fn drop(&mut self) {
        if self.armed {
            self.pool.clone().exchange_finished(self.id, false);
        }
    }
}

impl std::fmt::Debug for PooledHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "PooledHandle {{ id: {}, version: {:?} }}",
            self.id, self.version
        )
    }
}

/// The release duty for one checked-out connection, held by the codec for
/// the duration of the exchange. Resolves exactly once: explicitly with
/// the codec's reuse verdict, or as not-returnable on drop.
pub(crate) struct Lease {
    inner: Option<LeaseInner>,
}

struct LeaseInner {
    pool: Arc<Pool>,
    id: u64,
    can_return: bool,
}

impl Lease {
    /// Resolve with the codec's verdict. Idempotent with drop.
    pub fn finish(mut self, reusable: bool) {
        if let Some(inner) = self.inner.take() {
            inner
                .pool
                .exchange_finished(inner.id, reusable && inner.can_return);
        }
    }

    /// A lease bound to no pool, for driving a codec directly.
    #[cfg(test)]
    pub fn noop() -> Lease {
        Lease { inner: None }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.pool.exchange_finished(inner.id, false);
        }
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Lease {{ resolved: {} }}", self.inner.is_none())
    }
}
