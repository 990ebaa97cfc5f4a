use crate::Error;
use futures_util::future::poll_fn;
use futures_util::ready;
use futures_util::stream::Stream;
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

/// An HTTP body, either fully available or incrementally streamed.
///
/// A response starts out in one of the two shapes and keeps it: a small
/// body that fits one read turn arrives as `Available`, a larger or slower
/// one as `Streaming`. Request bodies use the same type in the opposite
/// direction (`Body::channel()` for streaming uploads).
///
/// A streaming body must be read to end or dropped (which signals discard)
/// for the underlying connection to become reusable.
pub enum Body {
    /// The whole body, length known.
    Available(Vec<u8>),
    /// A demand-driven stream of body chunks.
    Streaming(RecvStream),
}

impl Body {
    /// An empty, available body.
    pub fn empty() -> Body {
        Body::Available(vec![])
    }

    /// A streaming body fed by the returned sender. Used for request bodies
    /// whose size is not known up front.
    pub fn channel() -> (SendStream, Body) {
        let shared = Arc::new(Mutex::new(Shared::new()));

        let send = SendStream {
            shared: shared.clone(),
            ended: false,
        };

        (send, Body::Streaming(RecvStream::new(shared)))
    }

    /// Whether the body streams in over time.
    pub fn is_streaming(&self) -> bool {
        match self {
            Body::Streaming(_) => true,
            Body::Available(_) => false,
        }
    }

    /// Body length, when fully available.
    pub fn len(&self) -> Option<usize> {
        match self {
            Body::Available(v) => Some(v.len()),
            Body::Streaming(_) => None,
        }
    }

    /// True for an available body with no bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }

    /// Collect the whole body into one buffer, failing with
    /// [`Error::BodyTooLarge`] if it grows beyond `max` bytes.
    pub async fn collect(self, max: usize) -> Result<Vec<u8>, Error> {
        match self {
            Body::Available(v) => {
                if v.len() > max {
                    return Err(Error::BodyTooLarge(max));
                }
                Ok(v)
            }
            Body::Streaming(mut stream) => {
                let mut out = vec![];

                while let Some(chunk) = stream.chunk().await {
                    let chunk = chunk?;

                    if out.len() + chunk.len() > max {
                        stream.discard();
                        return Err(Error::BodyTooLarge(max));
                    }

                    out.extend_from_slice(&chunk);
                }

                Ok(out)
            }
        }
    }
}

impl From<Vec<u8>> for Body {
    fn from(v: Vec<u8>) -> Self {
        Body::Available(v)
    }
}

impl From<&[u8]> for Body {
    fn from(v: &[u8]) -> Self {
        Body::Available(v.to_vec())
    }
}

impl From<&str> for Body {
    fn from(v: &str) -> Self {
        Body::Available(v.as_bytes().to_vec())
    }
}

impl From<String> for Body {
    fn from(v: String) -> Self {
        Body::Available(v.into_bytes())
    }
}

impl From<()> for Body {
    fn from(_: ()) -> Self {
        Body::empty()
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Body::Available(v) => write!(f, "Body::Available({} bytes)", v.len()),
            Body::Streaming(_) => write!(f, "Body::Streaming"),
        }
    }
}

/// What the producing side should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Demand {
    /// Outstanding credit beyond what is queued. Produce another chunk.
    More,
    /// The consumer gave up on the body. Drain and drop.
    Discard,
}

/// State shared between the two ends of a body stream.
///
/// The bound is credit, not capacity: the producer may only produce while
/// the consumer's outstanding demand exceeds what is already queued, and
/// demand is decremented when a chunk is handed over, never before.
struct Shared {
    queue: VecDeque<Vec<u8>>,
    demand: usize,
    ended: bool,
    failed: Option<Error>,
    discard: bool,
    producer_gone: bool,
    consumer_gone: bool,
    producer_waker: Option<Waker>,
    consumer_waker: Option<Waker>,
}

impl Shared {
    fn new() -> Self {
        Shared {
            queue: VecDeque::new(),
            demand: 0,
            ended: false,
            failed: None,
            discard: false,
            producer_gone: false,
            consumer_gone: false,
            producer_waker: None,
            consumer_waker: None,
        }
    }

    fn wake_producer(&mut self) {
        if let Some(w) = self.producer_waker.take() {
            w.wake();
        }
    }

    fn wake_consumer(&mut self) {
        if let Some(w) = self.consumer_waker.take() {
            w.wake();
        }
    }
}

/// Producer half used by the connection codec to feed a streaming
/// response body.
pub(crate) struct StreamBuf {
    shared: Arc<Mutex<Shared>>,
}

/// Create a connected producer/consumer pair.
pub(crate) fn pair() -> (StreamBuf, RecvStream) {
    let shared = Arc::new(Mutex::new(Shared::new()));

    let buf = StreamBuf {
        shared: shared.clone(),
    };

    (buf, RecvStream::new(shared))
}

impl StreamBuf {
    /// Seed the queue with chunks accumulated before the body devolved to
    /// streaming. Replayed chunks are delivered before any new chunk, in
    /// original order, still gated on consumer demand.
    pub fn replay(&self, chunks: Vec<Vec<u8>>) {
        let mut lock = self.shared.lock().unwrap();

        for c in chunks {
            lock.queue.push_back(c);
        }
    }

    /// Hand over one chunk. Dropped silently if the consumer has discarded.
    pub fn push_chunk(&self, chunk: Vec<u8>) {
        let mut lock = self.shared.lock().unwrap();

        if lock.discard || lock.consumer_gone {
            return;
        }

        lock.queue.push_back(chunk);
        lock.wake_consumer();
    }

    /// Mark the body complete.
    pub fn complete(&self) {
        let mut lock = self.shared.lock().unwrap();

        lock.ended = true;
        lock.wake_consumer();
    }

    /// Fail the body. Buffered chunks are released.
    pub fn fail(&self, err: Error) {
        let mut lock = self.shared.lock().unwrap();

        lock.queue.clear();
        lock.failed = Some(err);
        lock.wake_consumer();
    }

    /// Wait for reason to produce. Ready only when the consumer holds
    /// credit beyond what is queued, or has discarded the body.
    pub fn poll_demand(&self, cx: &mut Context) -> Poll<Demand> {
        let mut lock = self.shared.lock().unwrap();

        if lock.discard || lock.consumer_gone {
            return Demand::Discard.into();
        }

        if lock.demand > lock.queue.len() {
            return Demand::More.into();
        }

        lock.producer_waker = Some(cx.waker().clone());
        Poll::Pending
    }

    /// True once the consumer asked to discard or went away.
    pub fn is_discarded(&self) -> bool {
        let lock = self.shared.lock().unwrap();
        lock.discard || lock.consumer_gone
    }
}

impl Drop for StreamBuf {
    fn drop(&mut self) {
        let mut lock = self.shared.lock().unwrap();

        lock.producer_gone = true;
        lock.wake_consumer();
    }
}

/// Receives a body from the remote peer with credit-based flow control.
///
/// A consumer grants credit with [`request`] and receives at most that many
/// chunks. The byte-oriented [`read`]/`AsyncRead` interface and the
/// [`Stream`] impl manage credit themselves, one chunk at a time.
///
/// [`request`]: RecvStream::request
/// [`read`]: RecvStream::read
pub struct RecvStream {
    shared: Arc<Mutex<Shared>>,
    ready: Option<Vec<u8>>,
    index: usize,
}

impl RecvStream {
    fn new(shared: Arc<Mutex<Shared>>) -> Self {
        RecvStream {
            shared,
            ready: None,
            index: 0,
        }
    }

    /// Grant the producer credit for `amount` more chunks.
    pub fn request(&mut self, amount: usize) {
        let mut lock = self.shared.lock().unwrap();

        lock.demand += amount;

        if lock.demand > lock.queue.len() {
            lock.wake_producer();
        }
        if !lock.queue.is_empty() {
            lock.wake_consumer();
        }
    }

    /// Poll for the next chunk. Never delivers without available demand.
    pub fn poll_chunk(&mut self, cx: &mut Context) -> Poll<Option<Result<Vec<u8>, Error>>> {
        self.poll_chunk_inner(cx, false)
    }

    fn poll_chunk_inner(
        &mut self,
        cx: &mut Context,
        auto_demand: bool,
    ) -> Poll<Option<Result<Vec<u8>, Error>>> {
        let mut lock = self.shared.lock().unwrap();

        if let Some(e) = lock.failed.take() {
            lock.ended = true;
            return Some(Err(e)).into();
        }

        if auto_demand && lock.demand == 0 && !(lock.ended && lock.queue.is_empty()) {
            lock.demand = 1;
            lock.wake_producer();
        }

        if !lock.queue.is_empty() {
            if lock.demand == 0 {
                // chunks queued, but the consumer holds no credit. request()
                // will wake us.
                lock.consumer_waker = Some(cx.waker().clone());
                return Poll::Pending;
            }

            // invariant: delivery consumes exactly one credit, after the
            // chunk is handed over.
            let chunk = lock.queue.pop_front().expect("non-empty queue");
            lock.demand -= 1;
            lock.wake_producer();

            return Some(Ok(chunk)).into();
        }

        if lock.ended {
            return None.into();
        }

        if lock.producer_gone {
            lock.ended = true;
            return Some(Err(Error::ClosedBeforeCompletion)).into();
        }

        lock.consumer_waker = Some(cx.waker().clone());
        Poll::Pending
    }

    /// Next chunk, granting one credit if none is outstanding.
    pub async fn chunk(&mut self) -> Option<Result<Vec<u8>, Error>> {
        poll_fn(|cx| self.poll_chunk_inner(cx, true)).await
    }

    /// Give up on the rest of the body. The producing side drains the
    /// remaining bytes off the connection without delivering them.
    /// Idempotent.
    pub fn discard(&mut self) {
        let mut lock = self.shared.lock().unwrap();

        lock.discard = true;
        lock.queue.clear();
        lock.wake_producer();
    }

    /// Read some body data in an async way.
    pub fn poll_read(&mut self, cx: &mut Context, buf: &mut [u8]) -> Poll<io::Result<usize>> {
        loop {
            // First ship out ready data already received.
            if let Some(chunk) = &self.ready {
                let i = self.index;

                let max = buf.len().min(chunk.len() - i);

                buf[0..max].copy_from_slice(&chunk[i..(i + max)]);
                self.index += max;

                if self.index == chunk.len() {
                    // all used up
                    self.ready.take();
                }

                return Ok(max).into();
            }

            match ready!(self.poll_chunk_inner(cx, true)) {
                None => {
                    // end of body.
                    return Ok(0).into();
                }
                Some(Err(e)) => {
                    return Err(io::Error::new(io::ErrorKind::Other, e)).into();
                }
                Some(Ok(chunk)) => {
                    if chunk.is_empty() {
                        continue;
                    }
                    self.ready = Some(chunk);
                    self.index = 0;
                }
            }
        }
    }

    /// Read some body data, suspending until a chunk arrives.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        Ok(poll_fn(move |cx| self.poll_read(cx, buf)).await?)
    }

    /// Read the rest of the body to a vec.
    pub async fn read_to_end(&mut self, out: &mut Vec<u8>) -> Result<usize, Error> {
        let mut total = 0;
        let mut buf = [0_u8; 16_384];

        loop {
            let amount = self.read(&mut buf).await?;
            if amount == 0 {
                return Ok(total);
            }
            out.extend_from_slice(&buf[0..amount]);
            total += amount;
        }
    }
}

impl Stream for RecvStream {
    type Item = Result<Vec<u8>, Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        this.poll_chunk_inner(cx, true)
    }
}

impl crate::AsyncRead for RecvStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        RecvStream::poll_read(this, cx, buf)
    }
}

impl Drop for RecvStream {
    fn drop(&mut self) {
        let mut lock = self.shared.lock().unwrap();

        lock.consumer_gone = true;
        lock.queue.clear();
        lock.wake_producer();
    }
}

impl fmt::Debug for RecvStream {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let lock = self.shared.lock().unwrap();
        write!(
            f,
            "RecvStream {{ queued: {}, demand: {}, ended: {} }}",
            lock.queue.len(),
            lock.demand,
            lock.ended
        )
    }
}

/// Send body data to the remote peer.
///
/// Obtained from [`Body::channel`]. The connection pulls chunks one at a
/// time as the socket accepts them; [`ready`] suspends until the previous
/// chunk has been taken, forming end-to-end flow control.
///
/// [`ready`]: SendStream::ready
pub struct SendStream {
    shared: Arc<Mutex<Shared>>,
    ended: bool,
}

impl SendStream {
    /// Poll for whether the connection is ready to take more data.
    pub fn poll_ready(&mut self, cx: &mut Context) -> Poll<Result<(), Error>> {
        let mut lock = self.shared.lock().unwrap();

        if lock.consumer_gone {
            return Err(aborted()).into();
        }

        if lock.demand > lock.queue.len() {
            return Ok(()).into();
        }

        lock.producer_waker = Some(cx.waker().clone());
        Poll::Pending
    }

    /// Wait until the connection has taken previously provided data. As
    /// such, this can form part of a flow control.
    pub async fn ready(mut self) -> Result<SendStream, Error> {
        poll_fn(|cx| self.poll_ready(cx)).await?;
        Ok(self)
    }

    /// Send some body data.
    ///
    /// The data is enqueued without checking whether the connection has
    /// taken earlier chunks. To avoid holding lots of data in memory, use
    /// `ready()` between sends.
    ///
    /// `end` controls whether this is the last chunk. It's an error to send
    /// more data after `end` is `true`.
    pub fn send_data(&mut self, data: &[u8], end: bool) -> Result<(), Error> {
        if self.ended {
            return Err(Error::User("Body data is not expected".into()));
        }

        let mut lock = self.shared.lock().unwrap();

        if lock.consumer_gone {
            return Err(aborted());
        }

        if !data.is_empty() {
            lock.queue.push_back(data.to_vec());
        }

        if end {
            self.ended = true;
            lock.ended = true;
        }

        lock.wake_consumer();

        Ok(())
    }
}

impl Drop for SendStream {
    fn drop(&mut self) {
        let mut lock = self.shared.lock().unwrap();

        lock.producer_gone = true;
        lock.wake_consumer();
    }
}

impl fmt::Debug for SendStream {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SendStream {{ ended: {} }}", self.ended)
    }
}

fn aborted() -> Error {
    Error::Io(io::Error::new(
        io::ErrorKind::ConnectionAborted,
        "Connection is gone",
    ))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testio::poll_once;

    #[test]
    fn no_chunk_without_demand() {
        let (buf, mut recv) = pair();

        buf.replay(vec![b"one".to_vec(), b"two".to_vec()]);

        // no credit granted: nothing is delivered.
        assert!(poll_once(|cx| recv.poll_chunk(cx)).is_none());

        recv.request(1);
        let c = poll_once(|cx| recv.poll_chunk(cx)).unwrap();
        assert_eq!(c.unwrap().unwrap(), b"one");

        // credit used up again.
        assert!(poll_once(|cx| recv.poll_chunk(cx)).is_none());

        recv.request(1);
        let c = poll_once(|cx| recv.poll_chunk(cx)).unwrap();
        assert_eq!(c.unwrap().unwrap(), b"two");
    }

    #[test]
    fn demand_sums_across_requests() {
        let (buf, mut recv) = pair();

        recv.request(2);
        recv.request(1);

        for i in 0..3 {
            buf.push_chunk(vec![i]);
        }
        buf.complete();

        for i in 0..3_u8 {
            let c = poll_once(|cx| recv.poll_chunk(cx)).unwrap();
            assert_eq!(c.unwrap().unwrap(), vec![i]);
        }

        // complete after all chunks.
        let end = poll_once(|cx| recv.poll_chunk(cx)).unwrap();
        assert!(end.is_none());
    }

    #[test]
    fn producer_gated_on_outstanding_credit() {
        let (buf, mut recv) = pair();

        // no demand: producer must wait.
        assert!(poll_once(|cx| buf.poll_demand(cx)).is_none());

        recv.request(1);
        assert_eq!(poll_once(|cx| buf.poll_demand(cx)), Some(Demand::More));

        // queued chunk satisfies the credit: wait again.
        buf.push_chunk(b"x".to_vec());
        assert!(poll_once(|cx| buf.poll_demand(cx)).is_none());
    }

    #[test]
    fn discard_is_unbounded_demand() {
        let (buf, mut recv) = pair();

        recv.discard();
        recv.discard(); // idempotent

        assert_eq!(poll_once(|cx| buf.poll_demand(cx)), Some(Demand::Discard));
        assert!(buf.is_discarded());

        // pushed chunks are dropped, not queued.
        buf.push_chunk(b"x".to_vec());
        recv.request(1);
        assert!(poll_once(|cx| recv.poll_chunk(cx)).is_none());
    }

    #[test]
    fn dropping_receiver_signals_discard() {
        let (buf, recv) = pair();

        drop(recv);

        assert_eq!(poll_once(|cx| buf.poll_demand(cx)), Some(Demand::Discard));
    }

    #[test]
    fn producer_gone_is_closed_before_completion() {
        let (buf, mut recv) = pair();

        buf.push_chunk(b"partial".to_vec());
        drop(buf);

        recv.request(1);
        let c = poll_once(|cx| recv.poll_chunk(cx)).unwrap();
        assert_eq!(c.unwrap().unwrap(), b"partial");

        let err = poll_once(|cx| recv.poll_chunk(cx)).unwrap().unwrap();
        assert!(err.unwrap_err().is_closed_before_completion());
    }

    #[test]
    fn fail_releases_buffered_chunks() {
        let (buf, mut recv) = pair();

        buf.push_chunk(b"will never arrive".to_vec());
        buf.fail(Error::ReadTimeout);

        recv.request(1);
        let c = poll_once(|cx| recv.poll_chunk(cx)).unwrap().unwrap();
        assert!(matches!(c.unwrap_err(), Error::ReadTimeout));
    }

    #[test]
    fn byte_reads_manage_their_own_credit() {
        let (buf, mut recv) = pair();

        buf.replay(vec![b"hello ".to_vec(), b"world".to_vec()]);
        buf.complete();

        let mut out = vec![];
        loop {
            let mut tmp = [0_u8; 4];
            match poll_once(|cx| recv.poll_read(cx, &mut tmp)) {
                Some(r) => {
                    let n = r.unwrap();
                    if n == 0 {
                        break;
                    }
                    out.extend_from_slice(&tmp[0..n]);
                }
                None => continue,
            }
        }

        assert_eq!(out, b"hello world");
    }

    #[test]
    fn send_stream_respects_consumer_pull() {
        let (mut send, body) = Body::channel();

        let mut recv = match body {
            Body::Streaming(r) => r,
            _ => panic!("channel body should stream"),
        };

        // connection has not pulled yet.
        assert!(poll_once(|cx| send.poll_ready(cx)).is_none());

        recv.request(1);
        assert!(poll_once(|cx| send.poll_ready(cx)).unwrap().is_ok());

        send.send_data(b"chunk", false).unwrap();
        send.send_data(b"", true).unwrap();

        let c = poll_once(|cx| recv.poll_chunk(cx)).unwrap();
        assert_eq!(c.unwrap().unwrap(), b"chunk");

        recv.request(1);
        let end = poll_once(|cx| recv.poll_chunk(cx)).unwrap();
        assert!(end.is_none());

        // sending after end is a user error.
        assert!(send.send_data(b"more", false).is_err());
    }
}
