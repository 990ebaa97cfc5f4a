//! In-memory transports for unit tests.

use crate::{AsyncRead, AsyncWrite};
use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

/// One scripted read result.
#[derive(Debug)]
pub(crate) enum Step {
    /// Serve these bytes (possibly over several poll_read calls).
    Data(Vec<u8>),
    /// Return Pending once, simulating the end of a read turn.
    Pending,
    /// Park the reader for good, simulating a silent peer.
    Hang,
}

/// Transport serving a scripted sequence of reads. Writes are collected.
/// The script running dry means EOF.
#[derive(Debug)]
pub(crate) struct ScriptIo {
    script: VecDeque<Step>,
    #[allow(dead_code)]
    pub written: Vec<u8>,
}

impl ScriptIo {
    pub fn new(script: Vec<Step>) -> Self {
        ScriptIo {
            script: script.into(),
            written: vec![],
        }
    }

    /// Data-only script, one entry per read.
    pub fn reads<T: AsRef<[u8]>>(parts: &[T]) -> Self {
        Self::new(
            parts
                .iter()
                .map(|p| Step::Data(p.as_ref().to_vec()))
                .collect(),
        )
    }
}

impl AsyncRead for ScriptIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        match this.script.pop_front() {
            None => Ok(0).into(),
            Some(Step::Hang) => {
                this.script.push_front(Step::Hang);
                Poll::Pending
            }
            Some(Step::Pending) => {
                // wake so a real executor would poll again.
                cx.waker().wake_by_ref();
                Poll::Pending
            }
            Some(Step::Data(mut data)) => {
                let max = buf.len().min(data.len());
                buf[0..max].copy_from_slice(&data[0..max]);

                if max < data.len() {
                    let rest = data.split_off(max);
                    this.script.push_front(Step::Data(rest));
                }

                Ok(max).into()
            }
        }
    }
}

impl AsyncWrite for ScriptIo {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.written.extend_from_slice(buf);
        Ok(buf.len()).into()
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context) -> Poll<io::Result<()>> {
        Ok(()).into()
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context) -> Poll<io::Result<()>> {
        Ok(()).into()
    }
}

/// Poll a closure once with a noop waker. `None` means Pending.
pub(crate) fn poll_once<T, F>(f: F) -> Option<T>
where
    F: FnOnce(&mut Context) -> Poll<T>,
{
    let waker = futures_util::task::noop_waker();
    let mut cx = Context::from_waker(&waker);

    match f(&mut cx) {
        Poll::Ready(v) => Some(v),
        Poll::Pending => None,
    }
}
