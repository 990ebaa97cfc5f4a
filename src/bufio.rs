use crate::{AsyncRead, AsyncWrite};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Bytes appended to the read buffer per fill.
const READ_CHUNK_SIZE: usize = 16_384;

/// Buffered reader/writer over the transport.
///
/// The read side accumulates into an internal buffer so the response head
/// parser can retry `httparse` over the bytes seen so far, and body
/// limiters can inspect exact byte runs. The write side drains an external
/// queue opportunistically: a full socket is not an error, the remainder
/// just stays queued (`Pending` never blocks state driving).
#[derive(Debug)]
pub(crate) struct BufIo<S> {
    io: S,
    buf: Vec<u8>,
    pos: usize,
}

impl<S> BufIo<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(io: S) -> Self {
        BufIo {
            io,
            buf: Vec::with_capacity(READ_CHUNK_SIZE),
            pos: 0,
        }
    }

    /// Bytes read but not yet consumed.
    pub fn buffered(&self) -> &[u8] {
        &self.buf[self.pos..]
    }

    /// Mark `amount` buffered bytes as used.
    pub fn consume(&mut self, amount: usize) {
        let new_pos = self.pos + amount;

        // can't consume more than we have.
        assert!(new_pos <= self.buf.len());

        if new_pos == self.buf.len() {
            // all was consumed, reset back to start.
            self.pos = 0;
            self.buf.truncate(0);
        } else {
            self.pos = new_pos;
        }
    }

    /// Read more bytes from the transport into the internal buffer.
    ///
    /// Returns the amount appended. 0 means EOF.
    pub fn poll_fill_more(&mut self, cx: &mut Context) -> Poll<io::Result<usize>> {
        let cur_len = self.buf.len();

        self.buf.resize(cur_len + READ_CHUNK_SIZE, 0);

        let poll = Pin::new(&mut self.io).poll_read(cx, &mut self.buf[cur_len..]);

        match poll {
            Poll::Pending => {
                trace!("fill_more: Pending");
                self.buf.truncate(cur_len);
                Poll::Pending
            }
            Poll::Ready(Err(e)) => {
                trace!("fill_more err: {:?}", e);
                self.buf.truncate(cur_len);
                Err(e).into()
            }
            Poll::Ready(Ok(amount)) => {
                trace!("fill_more: {}", amount);
                self.buf.truncate(cur_len + amount);
                Ok(amount).into()
            }
        }
    }

    /// Read into `out`, serving internally buffered bytes first.
    pub fn poll_read_buf(&mut self, cx: &mut Context, out: &mut [u8]) -> Poll<io::Result<usize>> {
        assert!(!out.is_empty(), "poll_read_buf with empty out");

        let has_amount = self.buf.len() - self.pos;

        if has_amount > 0 {
            let max = out.len().min(has_amount);

            out[0..max].copy_from_slice(&self.buf[self.pos..self.pos + max]);
            self.consume(max);

            return Ok(max).into();
        }

        // once the buffer is used up, read directly from the transport.
        Pin::new(&mut self.io).poll_read(cx, out)
    }

    /// Attempt to drain `to_write` into the transport.
    ///
    /// Writes as much as the socket accepts. `Pending` from the socket is
    /// fine: the remainder stays in `to_write` and downstream progress
    /// continues. Flushes once the queue is empty if `flush_after` is set.
    pub fn try_write(
        &mut self,
        cx: &mut Context,
        to_write: &mut Vec<u8>,
        flush_after: &mut bool,
    ) -> io::Result<()> {
        loop {
            if to_write.is_empty() {
                if *flush_after {
                    match Pin::new(&mut self.io).poll_flush(cx) {
                        Poll::Pending => {
                            trace!("try_write flush: Pending");
                            return Ok(());
                        }
                        Poll::Ready(Ok(_)) => {
                            trace!("try_write flushed");
                            *flush_after = false;
                        }
                        Poll::Ready(Err(e)) => {
                            trace!("try_write flush error: {:?}", e);
                            return Err(e);
                        }
                    }
                }

                return Ok(());
            }

            trace!("try_write left: {}", to_write.len());

            let poll = Pin::new(&mut self.io).poll_write(cx, &to_write);

            match poll {
                Poll::Pending => {
                    // Pending is fine. It means the socket is full upstream,
                    // we can still progress the downstream.
                    trace!("try_write: Poll::Pending");
                    return Ok(());
                }

                Poll::Ready(Ok(amount)) => {
                    trace!("try_write did write: {}", amount);
                    let remain = to_write.split_off(amount);
                    *to_write = remain;
                }

                Poll::Ready(Err(e)) => {
                    trace!("try_write error: {:?}", e);
                    return Err(e);
                }
            }
        }
    }
}
