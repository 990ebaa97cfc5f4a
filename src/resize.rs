//! Lock-free pool sizing controller.
//!
//! Every relevant event (an acquire starting to wait, a connection
//! establishing, failing or going away) recomputes how many new
//! connections to open. The computation and the connection-opening it
//! triggers are serialized by a dirty-flag protocol instead of a mutex:
//! opening connections involves I/O that must never run under a lock other
//! threads block on, and bursts of events coalesce into one pass.

use crate::connector::HttpVersion;
use crate::Error;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

const IDLE: u8 = 0;
const ACTIVE_WITHOUT_PENDING_WORK: u8 = 1;
const ACTIVE_WITH_PENDING_WORK: u8 = 2;

/// Something that can start connection attempts on behalf of the resizer.
///
/// Must not block: attempts run as spawned tasks and report back through
/// `on_connection_established` / `on_connection_failure`.
pub(crate) trait OpenConnections {
    fn open_connection(&self);
}

/// Caps consulted on every resize pass.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ResizeLimits {
    pub max_http1_connections: usize,
    pub max_http2_connections: usize,
    pub max_pending_connections: usize,
}

pub(crate) struct Resizer {
    state: AtomicU8,
    pending_requests: AtomicUsize,
    pending_connections: AtomicUsize,
    http1_connections: AtomicUsize,
    http2_connections: AtomicUsize,
    limits: ResizeLimits,
}

impl Resizer {
    pub fn new(limits: ResizeLimits) -> Self {
        Resizer {
            state: AtomicU8::new(IDLE),
            pending_requests: AtomicUsize::new(0),
            pending_connections: AtomicUsize::new(0),
            http1_connections: AtomicUsize::new(0),
            http2_connections: AtomicUsize::new(0),
            limits,
        }
    }

    /// A request started or stopped waiting for a connection.
    ///
    /// Panics if the counter would go negative: that is a bookkeeping bug,
    /// not a condition to clamp away.
    pub fn on_pending_request_change<O: OpenConnections>(&self, delta: isize, opener: &O) {
        if delta >= 0 {
            self.pending_requests
                .fetch_add(delta as usize, Ordering::AcqRel);
        } else {
            self.pending_requests
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                    v.checked_sub((-delta) as usize)
                })
                .expect("pending request count went negative");
        }

        self.dirty(opener);
    }

    /// A connection attempt succeeded.
    pub fn on_connection_established<O: OpenConnections>(
        &self,
        version: HttpVersion,
        opener: &O,
    ) {
        self.pending_connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1))
            .expect("connection established without a pending attempt");

        self.protocol_counter(version).fetch_add(1, Ordering::AcqRel);

        self.dirty(opener);
    }

    /// An established connection went away.
    pub fn on_connection_inactive<O: OpenConnections>(&self, version: HttpVersion, opener: &O) {
        self.protocol_counter(version)
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1))
            .expect("connection count went negative");

        self.dirty(opener);
    }

    /// A connection attempt failed. A later pass opens a replacement while
    /// demand remains; a waiting acquire only ever fails by timing out.
    // TODO: circuit breaker on repeated connect failures
    pub fn on_connection_failure<O: OpenConnections>(&self, cause: &Error, opener: &O) {
        self.pending_connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1))
            .expect("connection failure without a pending attempt");

        warn!("Failed to open connection: {}", cause);

        self.dirty(opener);
    }

    pub fn pending_requests(&self) -> usize {
        self.pending_requests.load(Ordering::Acquire)
    }

    pub fn pending_connections(&self) -> usize {
        self.pending_connections.load(Ordering::Acquire)
    }

    pub fn connection_count(&self, version: HttpVersion) -> usize {
        self.protocol_counter(version).load(Ordering::Acquire)
    }

    fn protocol_counter(&self, version: HttpVersion) -> &AtomicUsize {
        match version {
            HttpVersion::Http1 => &self.http1_connections,
            HttpVersion::Http2 => &self.http2_connections,
        }
    }

    /// Flag that state changed. The calling thread becomes the worker if
    /// nobody else is; otherwise the current worker picks the change up on
    /// its next loop iteration. Mutations are never lost and exactly one
    /// thread runs `do_some_work` at a time.
    fn dirty<O: OpenConnections>(&self, opener: &O) {
        loop {
            match self.state.compare_exchange(
                IDLE,
                ACTIVE_WITHOUT_PENDING_WORK,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.work_loop(opener);
                    return;
                }
                Err(ACTIVE_WITHOUT_PENDING_WORK) => {
                    if self
                        .state
                        .compare_exchange(
                            ACTIVE_WITHOUT_PENDING_WORK,
                            ACTIVE_WITH_PENDING_WORK,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        return;
                    }
                    // raced with the worker. retry.
                }
                Err(ACTIVE_WITH_PENDING_WORK) => return,
                Err(_) => unreachable!("invalid resizer state"),
            }
        }
    }

    fn work_loop<O: OpenConnections>(&self, opener: &O) {
        loop {
            if self.do_some_work(opener) {
                // opening changed the counters; force a re-evaluation.
                self.state
                    .compare_exchange(
                        ACTIVE_WITHOUT_PENDING_WORK,
                        ACTIVE_WITH_PENDING_WORK,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .ok();
            }

            // downgrade one step. exit only from IDLE.
            if self
                .state
                .compare_exchange(
                    ACTIVE_WITH_PENDING_WORK,
                    ACTIVE_WITHOUT_PENDING_WORK,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                continue;
            }

            if self
                .state
                .compare_exchange(
                    ACTIVE_WITHOUT_PENDING_WORK,
                    IDLE,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return;
            }
        }
    }

    /// One resize pass: open as many connections as unserved demand calls
    /// for, within the pending cap and, once a protocol has been observed
    /// on this pool, the per-protocol cap.
    fn do_some_work<O: OpenConnections>(&self, opener: &O) -> bool {
        let pending_req = self.pending_requests.load(Ordering::Acquire);
        let pending_conn = self.pending_connections.load(Ordering::Acquire);
        let http1 = self.http1_connections.load(Ordering::Acquire);
        let http2 = self.http2_connections.load(Ordering::Acquire);

        let mut to_open = (pending_req as isize - pending_conn as isize)
            .min(self.limits.max_pending_connections as isize - pending_conn as isize);

        if http2 > 0 {
            to_open = to_open.min(self.limits.max_http2_connections as isize - http2 as isize);
        } else if http1 > 0 {
            to_open = to_open.min(self.limits.max_http1_connections as isize - http1 as isize);
        }

        if to_open <= 0 {
            return false;
        }

        let to_open = to_open as usize;

        trace!(
            "resize: opening {} (pending_req: {}, pending_conn: {}, http1: {}, http2: {})",
            to_open,
            pending_req,
            pending_conn,
            http1,
            http2
        );

        self.pending_connections
            .fetch_add(to_open, Ordering::AcqRel);

        for _ in 0..to_open {
            opener.open_connection();
        }

        true
    }
}

impl std::fmt::Debug for Resizer {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Resizer {{ pending_req: {}, pending_conn: {}, http1: {}, http2: {} }}",
            self.pending_requests(),
            self.pending_connections(),
            self.connection_count(HttpVersion::Http1),
            self.connection_count(HttpVersion::Http2),
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[derive(Default)]
    struct CountingOpener {
        opened: AtomicUsize,
    }

    impl OpenConnections for CountingOpener {
        fn open_connection(&self) {
            self.opened.fetch_add(1, Ordering::AcqRel);
        }
    }

    impl OpenConnections for Arc<CountingOpener> {
        fn open_connection(&self) {
            self.opened.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn limits() -> ResizeLimits {
        ResizeLimits {
            max_http1_connections: 64,
            max_http2_connections: 1,
            max_pending_connections: 64,
        }
    }

    #[test]
    fn demand_opens_connections() {
        let opener = CountingOpener::default();
        let resizer = Resizer::new(limits());

        resizer.on_pending_request_change(1, &opener);

        assert_eq!(opener.opened.load(Ordering::Acquire), 1);
        assert_eq!(resizer.pending_connections(), 1);
    }

    #[test]
    fn no_demand_no_connections() {
        let opener = CountingOpener::default();
        let resizer = Resizer::new(limits());

        resizer.on_pending_request_change(1, &opener);
        resizer.on_pending_request_change(-1, &opener);

        // the one attempt from the +1 stands; nothing further.
        assert_eq!(opener.opened.load(Ordering::Acquire), 1);
    }

    #[test]
    fn pending_cap_bounds_attempts() {
        let opener = CountingOpener::default();
        let resizer = Resizer::new(ResizeLimits {
            max_http1_connections: 64,
            max_http2_connections: 1,
            max_pending_connections: 2,
        });

        for _ in 0..10 {
            resizer.on_pending_request_change(1, &opener);
        }

        assert_eq!(opener.opened.load(Ordering::Acquire), 2);
        assert_eq!(resizer.pending_connections(), 2);
    }

    #[test]
    fn protocol_cap_applies_once_observed() {
        let opener = CountingOpener::default();
        let resizer = Resizer::new(ResizeLimits {
            max_http1_connections: 1,
            max_http2_connections: 1,
            max_pending_connections: 8,
        });

        resizer.on_pending_request_change(1, &opener);
        resizer.on_connection_established(HttpVersion::Http1, &opener);
        resizer.on_pending_request_change(-1, &opener);
        assert_eq!(resizer.connection_count(HttpVersion::Http1), 1);

        // more demand, but the protocol cap is reached.
        resizer.on_pending_request_change(1, &opener);
        assert_eq!(opener.opened.load(Ordering::Acquire), 1);

        // the connection going away frees room for the standing demand.
        resizer.on_connection_inactive(HttpVersion::Http1, &opener);
        assert_eq!(opener.opened.load(Ordering::Acquire), 2);
    }

    #[test]
    #[should_panic(expected = "pending request count went negative")]
    fn pending_request_underflow_is_loud() {
        let opener = CountingOpener::default();
        let resizer = Resizer::new(limits());

        resizer.on_pending_request_change(-1, &opener);
    }

    #[test]
    fn failure_is_retried_while_demand_remains() {
        let opener = CountingOpener::default();
        let resizer = Resizer::new(limits());

        resizer.on_pending_request_change(1, &opener);
        assert_eq!(opener.opened.load(Ordering::Acquire), 1);

        // the attempt fails; demand still stands, so a fresh attempt opens.
        resizer.on_connection_failure(&Error::ReadTimeout, &opener);
        assert_eq!(opener.opened.load(Ordering::Acquire), 2);
    }

    #[test]
    fn concurrent_burst_converges_to_exact_demand() {
        let opener = Arc::new(CountingOpener::default());
        let resizer = Arc::new(Resizer::new(ResizeLimits {
            max_http1_connections: 64,
            max_http2_connections: 1,
            max_pending_connections: 64,
        }));

        let threads = 8;
        let per_thread = 4;

        let mut handles = vec![];
        for _ in 0..threads {
            let resizer = resizer.clone();
            let opener = opener.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..per_thread {
                    resizer.on_pending_request_change(1, &opener);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        // every unit of demand opened exactly one attempt, no more, no
        // fewer, regardless of interleaving.
        assert_eq!(
            opener.opened.load(Ordering::Acquire),
            threads * per_thread
        );
        assert_eq!(resizer.pending_connections(), threads * per_thread);
    }
}
