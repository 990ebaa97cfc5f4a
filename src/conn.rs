//! Per-connection request/response state machine.
//!
//! One `Connection` is the driving future for one transport. It writes
//! request heads and bodies gated on socket writability, parses response
//! heads (including interim 1xx messages), and consumes response bodies
//! either fully buffered or devolved to demand-driven streaming. The
//! verdict whether the connection can go back in the pool falls out of the
//! same lifecycle and is reported through the [`Lease`] exactly once.

use crate::body::{self, Body, Demand, RecvStream, StreamBuf};
use crate::bufio::BufIo;
use crate::err_closed;
use crate::http11::{try_parse_res, write_http11_req};
use crate::limit::{allow_reuse, LimitRead, LimitWrite};
use crate::pool::Lease;
use crate::Error;
use crate::{AsyncRead, AsyncWrite};
use futures_channel::{mpsc, oneshot};
use futures_util::ready;
use futures_util::stream::Stream;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::Sleep;

/// Size of buffer reading response body into.
const READ_BUF_INIT_SIZE: usize = 16_384;

/// Largest slice of a fully-available request body written per turn.
const WRITE_CHUNK_SIZE: usize = 16_384;

/// Per-connection tuning, cut down from the pool config.
#[derive(Debug, Clone)]
pub(crate) struct ConnConfig {
    pub read_timeout: Duration,
    pub buffer_body_limit: usize,
}

/// Creates a new HTTP/1 connection over some async `io` transport.
///
/// Returns a handle to send requests and a connection future that must be
/// polled to "drive" the exchange forward.
pub(crate) fn handshake<S>(io: S, cfg: ConnConfig) -> (SendRequest, Connection<S>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (req_tx, req_rx) = mpsc::channel(1);

    let send_req = SendRequest {
        next_seq: 0,
        req_tx,
    };

    let conn = Connection(Codec::new(io, req_rx, cfg));

    (send_req, conn)
}

/// Sender of new requests into the connection.
#[derive(Clone, Debug)]
pub(crate) struct SendRequest {
    next_seq: u64,
    req_tx: mpsc::Sender<ReqHandle>,
}

impl SendRequest {
    /// Send a new request.
    ///
    /// HTTP/1 has no multiplexing; a request sent before the previous
    /// exchange finished is queued. Body framing (content-length vs
    /// chunked) is derived from the request headers. The lease is resolved
    /// by the connection once the full response lifecycle has decided
    /// whether the connection is safe to reuse.
    pub fn send_request(
        &mut self,
        req: http::Request<()>,
        body: Body,
        lease: Lease,
    ) -> Result<ResponseFuture, Error> {
        let seq = self.next_seq;
        self.next_seq += 1;

        let (res_tx, res_rx) = oneshot::channel();

        let expect_continue = req
            .headers()
            .get("expect")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("100-continue"))
            .unwrap_or(false);

        let body = match body {
            Body::Available(data) => BodySource::Full(data),
            Body::Streaming(stream) => BodySource::Streaming(stream),
        };

        let next = ReqHandle {
            seq,
            req,
            body,
            expect_continue,
            res_tx: Some(res_tx),
            lease: Some(lease),
        };

        if self.req_tx.try_send(next).is_err() {
            // errors on full or closed. the pool leases a connection to one
            // exchange at a time, so full means the codec is gone too.
            return err_closed();
        }

        Ok(ResponseFuture(res_rx))
    }

    /// Whether the connection driving side is gone.
    pub fn is_closed(&self) -> bool {
        self.req_tx.is_closed()
    }
}

/// Internal holder of all details for one exchange.
struct ReqHandle {
    seq: u64,
    req: http::Request<()>,
    body: BodySource,
    expect_continue: bool,
    res_tx: Option<oneshot::Sender<Result<http::Response<Body>, Error>>>,
    lease: Option<Lease>,
}

enum BodySource {
    /// Fully available request body, written in slices.
    Full(Vec<u8>),
    /// Streaming request body, pulled one chunk at a time.
    Streaming(RecvStream),
}

/// Future for an `http::Response<Body>`.
///
/// Dropping it cancels the exchange: an unwritten request leaves the
/// connection reusable, a half-done exchange closes it.
pub struct ResponseFuture(oneshot::Receiver<Result<http::Response<Body>, Error>>);

impl Future for ResponseFuture {
    type Output = Result<http::Response<Body>, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let this = self.get_mut();

        let res = ready!(Pin::new(&mut this.0).poll(cx));

        match res {
            Ok(v) => v.into(),
            // sender dropped without a response: the connection died first.
            Err(_) => Err(Error::ClosedBeforeCompletion).into(),
        }
    }
}

impl std::fmt::Debug for ResponseFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "ResponseFuture")
    }
}

/// Future driving one connection. Resolves when the connection closes,
/// cleanly or with the error that killed it.
pub(crate) struct Connection<S>(Codec<S>);

impl<S> Future for Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    type Output = Result<(), Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let this = self.get_mut();
        this.0.poll_drive(cx)
    }
}

struct Codec<S> {
    io: BufIo<S>,
    req_rx: mpsc::Receiver<ReqHandle>,
    to_write: Vec<u8>,
    flush_after: bool,
    state: State,
    read_timeout: Duration,
    buffer_body_limit: usize,
    timeout: Option<Pin<Box<Sleep>>>,
}

enum State {
    /// Waiting for the next request.
    Waiting,
    /// Send request body and receive the response head.
    RecvRes(Bidirect),
    /// Receive the response body.
    RecvBody(BodyRecv),
}

impl std::fmt::Debug for State {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            State::Waiting => write!(f, "Waiting"),
            State::RecvRes(b) => write!(
                f,
                "RecvRes({}) done_req_body: {}, await_continue: {}",
                b.seq, b.done_req_body, b.await_continue
            ),
            State::RecvBody(r) => write!(f, "RecvBody({})", r.seq),
        }
    }
}

/// Bidirectional state: receive response head as well as send request body.
struct Bidirect {
    seq: u64,
    handle: ReqHandle,
    limit_w: LimitWrite,
    is_head: bool,
    /// If we are finished sending the request body.
    done_req_body: bool,
    /// Offset into a fully-available request body.
    body_pos: usize,
    /// Body is withheld until an interim 100 (or the real response) arrives.
    await_continue: bool,
    /// Outstanding one-chunk credit on a streaming request body.
    requested_chunk: bool,
    /// Body of a nonconforming interim response being drained.
    interim_drain: Option<LimitRead>,
}

/// Receiver of a response body.
struct BodyRecv {
    seq: u64,
    res_tx: Option<oneshot::Sender<Result<http::Response<Body>, Error>>>,
    lease: Option<Lease>,
    parts: Option<http::response::Parts>,
    limit: LimitRead,
    /// Keep-alive verdict from the head. The body framing has final say.
    reuse: bool,
    mode: RecvMode,
}

enum RecvMode {
    /// Chunks accumulate unexposed until the body completes in the same
    /// read turn or grows past the buffering limit.
    Buffering { chunks: Vec<Vec<u8>>, total: usize },
    /// Devolved: chunks flow through the shared stream buffer on demand.
    Streaming(StreamBuf),
    /// Consumer gave up. Drain the socket so the connection can be reused
    /// or closed promptly.
    Discarding,
}

impl<S> Codec<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn new(io: S, req_rx: mpsc::Receiver<ReqHandle>, cfg: ConnConfig) -> Self {
        Codec {
            io: BufIo::new(io),
            req_rx,
            to_write: vec![],
            flush_after: false,
            state: State::Waiting,
            read_timeout: cfg.read_timeout,
            buffer_body_limit: cfg.buffer_body_limit,
            timeout: None,
        }
    }

    fn poll_drive(&mut self, cx: &mut Context) -> Poll<Result<(), Error>> {
        loop {
            if let Some(t) = &mut self.timeout {
                if t.as_mut().poll(cx).is_ready() {
                    let e = Error::ReadTimeout;
                    self.fail_exchange(&e);
                    return Err(e).into();
                }
            }

            // first try to write queued outgoing bytes,
            if let Err(e) = self.io.try_write(cx, &mut self.to_write, &mut self.flush_after) {
                let e = Error::from(e);
                self.fail_exchange(&e);
                return Err(e).into();
            }

            // then drive state forward
            match self.drive_state(cx) {
                Poll::Pending => {
                    // a pass can queue outgoing bytes and then park on a
                    // read. flush them before sleeping or nothing wakes
                    // the peer into answering.
                    if let Err(e) =
                        self.io.try_write(cx, &mut self.to_write, &mut self.flush_after)
                    {
                        let e = Error::from(e);
                        self.fail_exchange(&e);
                        return Err(e).into();
                    }
                    return Poll::Pending;
                }

                Poll::Ready(Ok(do_loop)) => {
                    // drive_state() can signal whether we should continue
                    // looping. ending the loop means the connection closes.
                    if !do_loop {
                        break;
                    }
                }

                Poll::Ready(Err(e)) => {
                    self.fail_exchange(&e);
                    return Err(e).into();
                }
            }
        }

        Ok(()).into()
    }

    /// Report a connection-fatal error to whoever is listening for the
    /// current exchange: the response future if the head was not delivered
    /// yet, otherwise the active streaming buffer.
    fn fail_exchange(&mut self, e: &Error) {
        match &mut self.state {
            State::RecvRes(b) => {
                if let Some(res_tx) = b.handle.res_tx.take() {
                    res_tx.send(Err(e.replicate())).ok();
                }
            }
            State::RecvBody(r) => {
                if let Some(res_tx) = r.res_tx.take() {
                    res_tx.send(Err(e.replicate())).ok();
                } else if let RecvMode::Streaming(sbuf) = &r.mode {
                    sbuf.fail(e.replicate());
                }
            }
            State::Waiting => {}
        }
        // leases still held in the state release as not-reusable on drop.
    }

    fn drive_state(&mut self, cx: &mut Context) -> Poll<Result<bool, Error>> {
        trace!("drive_state: {:?}", self.state);

        match &mut self.state {
            State::Waiting => {
                self.timeout = None;

                match Pin::new(&mut self.req_rx).poll_next(cx) {
                    Poll::Ready(Some(mut h)) => {
                        // a request canceled before anything was written
                        // leaves the connection untouched and reusable.
                        if let Some(res_tx) = &mut h.res_tx {
                            if res_tx.poll_canceled(cx).is_ready() {
                                trace!("Request ({}) canceled before send", h.seq);
                                if let Some(lease) = h.lease.take() {
                                    lease.finish(true);
                                }
                                return Ok(true).into();
                            }
                        }

                        // invariant: no bytes should be waiting to be
                        // written between exchanges.
                        assert!(self.to_write.is_empty());

                        if let Err(e) = write_http11_req(&h.req, &mut self.to_write) {
                            return Err(e.into()).into();
                        }
                        self.flush_after = true;

                        let limit_w = LimitWrite::from_headers(h.req.headers());
                        let is_head = h.req.method() == &http::Method::HEAD;
                        let done_req_body = limit_w.is_no_body();
                        let await_continue = h.expect_continue && !done_req_body;
                        let seq = h.seq;

                        arm(&mut self.timeout, self.read_timeout);

                        self.state = State::RecvRes(Bidirect {
                            seq,
                            handle: h,
                            limit_w,
                            is_head,
                            done_req_body,
                            body_pos: 0,
                            await_continue,
                            requested_chunk: false,
                            interim_drain: None,
                        });
                    }

                    Poll::Ready(None) => {
                        // sender has closed, no more requests to come.
                        trace!("Request sender closed");
                        return Ok(false).into();
                    }

                    Poll::Pending => {
                        // watch the parked socket. EOF here is the remote
                        // closing an idle connection, which is fine. early
                        // bytes stay buffered; the next exchange parses
                        // them (and errors if they are garbage).
                        if self.io.buffered().is_empty() {
                            match self.io.poll_fill_more(cx) {
                                Poll::Pending => return Poll::Pending,
                                Poll::Ready(Ok(0)) => {
                                    trace!("Remote closed idle connection");
                                    return Ok(false).into();
                                }
                                Poll::Ready(Ok(amount)) => {
                                    trace!("Buffered {} early bytes while idle", amount);
                                    return Poll::Pending;
                                }
                                Poll::Ready(Err(e)) => return Err(e.into()).into(),
                            }
                        }
                        return Poll::Pending;
                    }
                }
            }

            State::RecvRes(b) => {
                // cancellation mid-exchange: the request head (and possibly
                // part of the body) is on the wire. the connection cannot
                // be handed to anyone else.
                if let Some(res_tx) = &mut b.handle.res_tx {
                    if res_tx.poll_canceled(cx).is_ready() {
                        debug!("Request ({}) canceled mid exchange, closing", b.seq);
                        return Ok(false).into();
                    }
                }

                // a nonconforming interim body is discarded before more
                // heads are parsed.
                if let Some(limit) = &mut b.interim_drain {
                    loop {
                        if limit.is_complete() {
                            break;
                        }

                        let mut buf = vec![0_u8; READ_BUF_INIT_SIZE];

                        match limit.poll_read(cx, &mut self.io, &mut buf) {
                            Poll::Pending => return Poll::Pending,
                            Poll::Ready(Ok(0)) => {
                                if !limit.is_complete() {
                                    return Err(Error::ClosedBeforeCompletion).into();
                                }
                                break;
                            }
                            Poll::Ready(Ok(amount)) => {
                                trace!("Discarded {} interim body bytes", amount);
                                arm(&mut self.timeout, self.read_timeout);
                            }
                            Poll::Ready(Err(e)) => return Err(e.into()).into(),
                        }
                    }
                    b.interim_drain = None;
                }

                // pump the request body, one chunk per writable turn.
                while self.to_write.is_empty() && !b.done_req_body && !b.await_continue {
                    match &mut b.handle.body {
                        BodySource::Full(data) => {
                            if b.body_pos == data.len() {
                                b.limit_w.finish(&mut self.to_write)?;
                                b.done_req_body = true;
                            } else {
                                let end = (b.body_pos + WRITE_CHUNK_SIZE).min(data.len());
                                b.limit_w.write(&data[b.body_pos..end], &mut self.to_write)?;
                                b.body_pos = end;
                            }
                        }

                        BodySource::Streaming(stream) => {
                            if !b.requested_chunk {
                                stream.request(1);
                                b.requested_chunk = true;
                            }

                            match stream.poll_chunk(cx) {
                                Poll::Pending => break,
                                Poll::Ready(Some(Ok(chunk))) => {
                                    b.requested_chunk = false;
                                    b.limit_w.write(&chunk, &mut self.to_write)?;
                                }
                                Poll::Ready(Some(Err(e))) => {
                                    if e.is_closed_before_completion() {
                                        // sender dropped without an explicit
                                        // end. treat as end of body.
                                        b.limit_w.finish(&mut self.to_write)?;
                                        b.done_req_body = true;
                                    } else {
                                        return Err(e).into();
                                    }
                                }
                                Poll::Ready(None) => {
                                    b.limit_w.finish(&mut self.to_write)?;
                                    b.done_req_body = true;
                                }
                            }
                        }
                    }
                }

                // parse response heads off the buffered reader.
                loop {
                    let head = try_parse_res(self.io.buffered())?;

                    let (res, used) = match head {
                        Some(v) => v,
                        None => {
                            match self.io.poll_fill_more(cx) {
                                Poll::Pending => return Poll::Pending,
                                Poll::Ready(Ok(0)) => {
                                    return Err(Error::ClosedBeforeCompletion).into();
                                }
                                Poll::Ready(Ok(_)) => {
                                    arm(&mut self.timeout, self.read_timeout);
                                    continue;
                                }
                                Poll::Ready(Err(e)) => return Err(e.into()).into(),
                            }
                        }
                    };

                    self.io.consume(used);

                    let status = res.status();

                    if status.is_informational() {
                        if status == http::StatusCode::SWITCHING_PROTOCOLS {
                            // upgrades are not supported on pooled
                            // connections.
                            return Err(Error::User(
                                "Unexpected 101 Switching Protocols".into(),
                            ))
                            .into();
                        }

                        if status == http::StatusCode::CONTINUE && b.await_continue {
                            // the single proceed-with-body notification.
                            debug!("Proceed with request body ({})", b.seq);
                            b.await_continue = false;
                        } else {
                            trace!("Ignoring interim response: {}", status);
                        }

                        b.interim_drain = LimitRead::for_interim(res.headers());

                        // back to the top: drain the interim body if any,
                        // and pump the request body now that it may be
                        // released.
                        return Ok(true).into();
                    }

                    // the real response head.
                    let version = res.version();
                    let reuse_headers = allow_reuse(res.headers(), version);
                    let limit = LimitRead::from_res_headers(res.headers(), status, b.is_head);

                    // a response arriving before the request body finished
                    // means the rest of the body is never sent, which makes
                    // the connection unsafe to reuse (unless there was no
                    // body to begin with).
                    let body_unsent = !b.done_req_body;
                    if body_unsent {
                        debug!("Response ({}) arrived before request body finished", b.seq);
                        b.done_req_body = true;
                    }

                    let reuse = reuse_headers && !(body_unsent && !b.limit_w.is_no_body());

                    let seq = b.seq;
                    let res_tx = b.handle.res_tx.take().expect("Missing res_tx");
                    let lease = b.handle.lease.take().expect("Missing lease");
                    let (parts, _) = res.into_parts();

                    if limit.is_no_body() {
                        let res = http::Response::from_parts(parts, Body::empty());

                        if res_tx.send(Ok(res)).is_err() {
                            // response future dropped, client is not
                            // interested. the exchange still completed.
                            trace!("Failed to send http::Response to ResponseFuture");
                        }

                        lease.finish(reuse);

                        self.timeout = None;
                        self.state = State::Waiting;

                        return Ok(reuse).into();
                    }

                    self.state = State::RecvBody(BodyRecv {
                        seq,
                        res_tx: Some(res_tx),
                        lease: Some(lease),
                        parts: Some(parts),
                        limit,
                        reuse,
                        mode: RecvMode::Buffering {
                            chunks: vec![],
                            total: 0,
                        },
                    });

                    return Ok(true).into();
                }
            }

            State::RecvBody(r) => {
                loop {
                    // a streaming consumer signalling discard switches mode
                    // so the socket is drained with unbounded demand.
                    if let RecvMode::Streaming(sbuf) = &r.mode {
                        if sbuf.is_discarded() {
                            trace!("Consumer discarded body ({})", r.seq);
                            r.mode = RecvMode::Discarding;
                        }
                    }

                    if r.limit.is_complete() {
                        let reusable = r.reuse && r.limit.is_reusable();

                        match mem::replace(&mut r.mode, RecvMode::Discarding) {
                            RecvMode::Buffering { chunks, total } => {
                                let mut body = Vec::with_capacity(total);
                                for c in chunks {
                                    body.extend_from_slice(&c);
                                }

                                let parts = r.parts.take().expect("Missing parts");
                                let res = http::Response::from_parts(parts, Body::Available(body));

                                let res_tx = r.res_tx.take().expect("Missing res_tx");
                                if res_tx.send(Ok(res)).is_err() {
                                    trace!("Failed to send http::Response to ResponseFuture");
                                }
                            }
                            RecvMode::Streaming(sbuf) => {
                                sbuf.complete();
                            }
                            RecvMode::Discarding => {}
                        }

                        trace!("Exchange ({}) finished, reusable: {}", r.seq, reusable);

                        let lease = r.lease.take().expect("Missing lease");
                        lease.finish(reusable);

                        self.timeout = None;
                        self.state = State::Waiting;

                        return Ok(reusable).into();
                    }

                    let mut devolve_why = None;

                    match &mut r.mode {
                        RecvMode::Buffering { chunks, total } => {
                            if *total >= self.buffer_body_limit {
                                // too big to keep in memory: devolve.
                                devolve_why = Some("buffer limit reached");
                            } else {
                                let mut buf = vec![0_u8; READ_BUF_INIT_SIZE];

                                match r.limit.poll_read(cx, &mut self.io, &mut buf) {
                                    Poll::Pending => {
                                        // the read turn ended without the
                                        // body completing: devolve.
                                        devolve_why = Some("read turn over");
                                    }
                                    Poll::Ready(Ok(0)) => {
                                        // limiters error on truncation, 0
                                        // means complete. loop to deliver.
                                    }
                                    Poll::Ready(Ok(amount)) => {
                                        arm(&mut self.timeout, self.read_timeout);
                                        buf.truncate(amount);
                                        *total += amount;
                                        chunks.push(buf);
                                    }
                                    Poll::Ready(Err(e)) => return Err(e.into()).into(),
                                }
                            }
                        }

                        RecvMode::Streaming(sbuf) => {
                            match sbuf.poll_demand(cx) {
                                Poll::Pending => {
                                    // no outstanding demand: do not read,
                                    // and a stalled consumer is not a read
                                    // timeout.
                                    self.timeout = None;
                                    return Poll::Pending;
                                }
                                Poll::Ready(Demand::Discard) => {
                                    r.mode = RecvMode::Discarding;
                                    continue;
                                }
                                Poll::Ready(Demand::More) => {}
                            }

                            if self.timeout.is_none() {
                                arm(&mut self.timeout, self.read_timeout);
                            }

                            let mut buf = vec![0_u8; READ_BUF_INIT_SIZE];

                            match r.limit.poll_read(cx, &mut self.io, &mut buf) {
                                Poll::Pending => return Poll::Pending,
                                Poll::Ready(Ok(0)) => {
                                    // complete. loop to finish.
                                }
                                Poll::Ready(Ok(amount)) => {
                                    arm(&mut self.timeout, self.read_timeout);
                                    buf.truncate(amount);
                                    sbuf.push_chunk(buf);
                                }
                                Poll::Ready(Err(e)) => return Err(e.into()).into(),
                            }
                        }

                        RecvMode::Discarding => {
                            let mut buf = vec![0_u8; READ_BUF_INIT_SIZE];

                            match r.limit.poll_read(cx, &mut self.io, &mut buf) {
                                Poll::Pending => return Poll::Pending,
                                Poll::Ready(Ok(0)) => {
                                    // complete. loop to finish.
                                }
                                Poll::Ready(Ok(amount)) => {
                                    arm(&mut self.timeout, self.read_timeout);
                                    trace!("Discarded {} body bytes ({})", amount, r.seq);
                                }
                                Poll::Ready(Err(e)) => return Err(e.into()).into(),
                            }
                        }
                    }

                    if let Some(why) = devolve_why {
                        devolve(r, why);
                    }
                }
            }
        }

        Ok(true).into()
    }
}

/// Switch an in-flight buffered body over to streaming delivery. The
/// accumulated chunks are replayed, in order, ahead of anything still to
/// come, and the response is exposed with a `Streaming` body.
fn devolve(r: &mut BodyRecv, why: &str) {
    let chunks = match &mut r.mode {
        RecvMode::Buffering { chunks, .. } => mem::take(chunks),
        _ => panic!("devolve in non-buffering mode"),
    };

    debug!("Devolve to streaming ({}): {}", r.seq, why);

    let (sbuf, recv) = body::pair();
    sbuf.replay(chunks);

    let parts = r.parts.take().expect("Missing parts");
    let res = http::Response::from_parts(parts, Body::Streaming(recv));

    let res_tx = r.res_tx.take().expect("Missing res_tx");

    if res_tx.send(Ok(res)).is_err() {
        // nobody wants the response. drain the rest off the socket.
        trace!("Failed to send http::Response to ResponseFuture");
        r.mode = RecvMode::Discarding;
        return;
    }

    r.mode = RecvMode::Streaming(sbuf);
}

/// (Re)arm the read timeout.
fn arm(timeout: &mut Option<Pin<Box<Sleep>>>, dur: Duration) {
    let deadline = tokio::time::Instant::now() + dur;

    match timeout {
        Some(t) => t.as_mut().reset(deadline),
        None => *timeout = Some(Box::pin(tokio::time::sleep_until(deadline))),
    }
}
