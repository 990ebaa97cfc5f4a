use crate::bufio::BufIo;
use crate::chunked::{ChunkedDecoder, ChunkedEncoder};
use crate::Error;
use crate::{AsyncRead, AsyncWrite};
use futures_util::ready;
use std::fmt;
use std::io;
use std::str::FromStr;
use std::task::{Context, Poll};

/// Limit reading response body data given the response headers.
pub(crate) enum LimitRead {
    /// Read from a chunked decoder. The decoder will know when there is no more
    /// data to be read.
    ChunkedDecoder(ChunkedDecoder),
    /// Body data is limited by a `content-length` header.
    ContentLength(ContentLengthRead),
    /// Read until the connection closes (HTTP/1.0 delineation).
    ReadToEnd(ReadToEnd),
    /// No expected body.
    NoBody,
}

impl LimitRead {
    /// Create an instance from response headers.
    ///
    /// 1. A HEAD response, 204 or 304 never has a body.
    /// 2. If header `transfer-encoding: chunked` use chunked decoder regardless of other headers.
    /// 3. If header `content-length: <number>` use a reader limited by length.
    /// 4. Otherwise the body is delineated by the connection closing.
    pub fn from_res_headers(
        headers: &http::HeaderMap<http::HeaderValue>,
        status: http::StatusCode,
        is_head_request: bool,
    ) -> Self {
        // https://tools.ietf.org/html/rfc7230#page-31
        // If a message is received with both a Transfer-Encoding and a
        // Content-Length header field, the Transfer-Encoding overrides the
        // Content-Length.
        let ret = if is_head_request
            || status == http::StatusCode::NO_CONTENT
            || status == http::StatusCode::NOT_MODIFIED
        {
            LimitRead::NoBody
        } else if is_chunked(headers) {
            LimitRead::ChunkedDecoder(ChunkedDecoder::new())
        } else if let Some(size) = get_as::<u64>(headers, "content-length") {
            LimitRead::ContentLength(ContentLengthRead::new(size))
        } else {
            // https://tools.ietf.org/html/rfc1945#section-7.2.2
            // If a Content-Length header field is present, its value in bytes
            // represents the length of the Entity-Body. Otherwise, the body
            // length is determined by the closing of the connection by the
            // server.
            LimitRead::ReadToEnd(ReadToEnd::new())
        };

        trace!("LimitRead from headers: {:?}", ret);

        ret
    }

    /// Framing of an interim (1xx) message body, if it improperly carries
    /// one. Interim responses are not delineated by connection close, so
    /// absent explicit framing there is nothing to drain.
    pub fn for_interim(headers: &http::HeaderMap<http::HeaderValue>) -> Option<Self> {
        if is_chunked(headers) {
            Some(LimitRead::ChunkedDecoder(ChunkedDecoder::new()))
        } else {
            match get_as::<u64>(headers, "content-length") {
                Some(size) if size > 0 => {
                    Some(LimitRead::ContentLength(ContentLengthRead::new(size)))
                }
                _ => None,
            }
        }
    }

    pub fn is_no_body(&self) -> bool {
        match &self {
            LimitRead::ContentLength(r) => r.limit == 0,
            LimitRead::NoBody => true,
            _ => false,
        }
    }

    pub fn is_complete(&self) -> bool {
        match &self {
            LimitRead::ChunkedDecoder(v) => v.is_end(),
            LimitRead::ContentLength(v) => v.is_end(),
            LimitRead::ReadToEnd(v) => v.is_end(),
            LimitRead::NoBody => true,
        }
    }

    /// Whether the connection can go back in the pool once this body is
    /// done. Close-delineated bodies consume the connection by definition.
    pub fn is_reusable(&self) -> bool {
        self.is_complete() && !self.is_read_to_end()
    }

    fn is_read_to_end(&self) -> bool {
        if let LimitRead::ReadToEnd(_) = self {
            return true;
        }
        false
    }

    /// Try read some body data through the framing.
    ///
    /// Ok(0) means the body is complete, except for `ReadToEnd` where it
    /// means the connection closed (which is completion there).
    pub fn poll_read<S: AsyncRead + AsyncWrite + Unpin>(
        &mut self,
        cx: &mut Context,
        recv: &mut BufIo<S>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        match self {
            LimitRead::ChunkedDecoder(v) => v.poll_read(cx, recv, buf),
            LimitRead::ContentLength(v) => v.poll_read(cx, recv, buf),
            LimitRead::ReadToEnd(v) => v.poll_read(cx, recv, buf),
            LimitRead::NoBody => Ok(0).into(),
        }
    }
}

/// Reader limited by a set length.
#[derive(Debug)]
pub(crate) struct ContentLengthRead {
    limit: u64,
    total: u64,
}

impl ContentLengthRead {
    fn new(limit: u64) -> Self {
        ContentLengthRead { limit, total: 0 }
    }

    fn is_end(&self) -> bool {
        self.total == self.limit
    }

    fn poll_read<S: AsyncRead + AsyncWrite + Unpin>(
        &mut self,
        cx: &mut Context,
        recv: &mut BufIo<S>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        assert!(!buf.is_empty(), "poll_read with len 0 buf");

        let left = (self.limit - self.total).min(usize::max_value() as u64) as usize;

        if left == 0 {
            // Nothing more should be read.
            return Ok(0).into();
        }

        let max = buf.len().min(left);
        let amount = ready!(recv.poll_read_buf(cx, &mut buf[0..max]))?;

        if amount == 0 {
            // https://tools.ietf.org/html/rfc7230#page-32
            // If the sender closes the connection or the recipient
            // times out before the indicated number of octets are
            // received, the recipient MUST consider the message to be
            // incomplete and close the connection.
            let msg = format!(
                "Partial body received {} bytes and expected {}",
                self.total, self.limit
            );
            trace!("{}", msg);
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, msg)).into();
        }

        self.total += amount as u64;

        Ok(amount).into()
    }
}

/// Reader delineated by connection close.
pub(crate) struct ReadToEnd {
    reached_end: bool,
}

impl ReadToEnd {
    fn new() -> Self {
        ReadToEnd { reached_end: false }
    }

    fn is_end(&self) -> bool {
        self.reached_end
    }

    fn poll_read<S: AsyncRead + AsyncWrite + Unpin>(
        &mut self,
        cx: &mut Context,
        recv: &mut BufIo<S>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        assert!(!buf.is_empty(), "poll_read with len 0 buf");

        let amount = ready!(recv.poll_read_buf(cx, buf))?;

        if amount == 0 {
            self.reached_end = true;
        }

        Ok(amount).into()
    }
}

/// Limit writing request body data by a strategy configured from the
/// request headers.
///
/// This is to ensure we don't write more data than "promised" by the
/// header configuration.
pub(crate) enum LimitWrite {
    /// Write data using a chunked encoder.
    ChunkedEncoder,
    /// Limit the write by the `content-length` header.
    ContentLength(ContentLengthWrite),
    /// There should be no body.
    NoBody,
}

impl LimitWrite {
    /// Create an instance from request headers.
    ///
    /// 1. If header `transfer-encoding: chunked` use chunked encoder regardless of other headers.
    /// 2. If header `content-length: <number>` use a writer limited by length.
    /// 3. Otherwise expect no body.
    pub fn from_headers(headers: &http::HeaderMap<http::HeaderValue>) -> Self {
        let ret = if is_chunked(headers) {
            LimitWrite::ChunkedEncoder
        } else if let Some(limit) = get_as::<u64>(headers, "content-length") {
            LimitWrite::ContentLength(ContentLengthWrite::new(limit))
        } else {
            LimitWrite::NoBody
        };

        trace!("LimitWrite from headers: {:?}", ret);

        ret
    }

    pub fn is_no_body(&self) -> bool {
        match self {
            LimitWrite::ContentLength(w) => w.limit == 0,
            LimitWrite::NoBody => true,
            _ => false,
        }
    }

    /// Write some data using this limiter.
    pub fn write(&mut self, data: &[u8], out: &mut Vec<u8>) -> Result<(), Error> {
        match self {
            LimitWrite::ChunkedEncoder => ChunkedEncoder::write_chunk(data, out),
            LimitWrite::ContentLength(v) => v.write(data, out),
            LimitWrite::NoBody => {
                if data.is_empty() {
                    Ok(())
                } else {
                    Err(Error::User("Body data is not expected".into()))
                }
            }
        }
    }

    /// Finish up writing, called once after all `write()` calls are done.
    pub fn finish(&mut self, out: &mut Vec<u8>) -> Result<(), Error> {
        match self {
            LimitWrite::ChunkedEncoder => ChunkedEncoder::write_finish(out),
            LimitWrite::ContentLength(v) => {
                if v.total < v.limit {
                    let m = format!(
                        "Body data shorter than content-length header: {} < {}",
                        v.total, v.limit
                    );
                    return Err(Error::User(m));
                }
                Ok(())
            }
            LimitWrite::NoBody => Ok(()),
        }
    }
}

/// Limit write by length.
#[derive(Debug)]
pub(crate) struct ContentLengthWrite {
    limit: u64,
    total: u64,
}

impl ContentLengthWrite {
    fn new(limit: u64) -> Self {
        ContentLengthWrite { limit, total: 0 }
    }

    fn write(&mut self, data: &[u8], out: &mut Vec<u8>) -> Result<(), Error> {
        if data.is_empty() {
            return Ok(());
        }
        self.total += data.len() as u64;

        if self.total > self.limit {
            let m = format!(
                "Body data longer than content-length header: {} > {}",
                self.total, self.limit
            );
            return Err(Error::User(m));
        }

        out.extend_from_slice(data);

        Ok(())
    }
}

impl fmt::Debug for LimitRead {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self {
            LimitRead::ChunkedDecoder(_) => write!(f, "ChunkedDecoder")?,
            LimitRead::ContentLength(l) => write!(f, "ContentLength({})", l.limit)?,
            LimitRead::ReadToEnd(_) => write!(f, "ReadToEnd")?,
            LimitRead::NoBody => write!(f, "NoBody")?,
        }
        Ok(())
    }
}

impl fmt::Debug for LimitWrite {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LimitWrite::ChunkedEncoder => write!(f, "ChunkedEncoder")?,
            LimitWrite::ContentLength(l) => write!(f, "ContentLength({})", l.limit)?,
            LimitWrite::NoBody => write!(f, "NoBody")?,
        }
        Ok(())
    }
}

fn is_chunked(headers: &http::HeaderMap<http::HeaderValue>) -> bool {
    headers
        .get("transfer-encoding")
        .and_then(|h| h.to_str().ok())
        // https://tools.ietf.org/html/rfc2616#section-4.4
        //
        // If a Transfer-Encoding header field (section 14.41) is present and
        // has any value other than "identity", then the transfer-length is
        // defined by use of the "chunked" transfer-coding
        .map(|h| !h.contains("identity"))
        .unwrap_or(false)
}

/// Whether the response headers and version allow the connection to be
/// returned to the pool. HTTP/1.1 defaults to keep-alive, HTTP/1.0 to close.
pub(crate) fn allow_reuse(
    headers: &http::HeaderMap<http::HeaderValue>,
    version: http::Version,
) -> bool {
    if version == http::Version::HTTP_11 {
        is_keep_alive(headers, true)
    } else {
        is_keep_alive(headers, false)
    }
}

fn is_keep_alive(headers: &http::HeaderMap<http::HeaderValue>, default: bool) -> bool {
    headers
        .get("connection")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| {
            if h == "keep-alive" {
                Some(true)
            } else if h == "close" {
                Some(false)
            } else {
                None
            }
        })
        .unwrap_or(default)
}

fn get_str<'a>(headers: &'a http::HeaderMap, key: &str) -> Option<&'a str> {
    headers.get(key).and_then(|v| v.to_str().ok())
}

fn get_as<T: FromStr>(headers: &http::HeaderMap, key: &str) -> Option<T> {
    get_str(headers, key).and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod test {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> http::HeaderMap {
        let mut h = http::HeaderMap::new();
        for (k, v) in pairs {
            h.insert(
                http::header::HeaderName::from_bytes(k.as_bytes()).unwrap(),
                v.parse().unwrap(),
            );
        }
        h
    }

    #[test]
    fn chunked_takes_precedence() {
        let h = headers(&[("transfer-encoding", "chunked"), ("content-length", "5")]);
        let l = LimitRead::from_res_headers(&h, http::StatusCode::OK, false);
        assert!(matches!(l, LimitRead::ChunkedDecoder(_)));
    }

    #[test]
    fn no_framing_means_read_to_end() {
        let h = headers(&[]);
        let l = LimitRead::from_res_headers(&h, http::StatusCode::OK, false);
        assert!(matches!(l, LimitRead::ReadToEnd(_)));
        assert!(!l.is_reusable());
    }

    #[test]
    fn head_response_has_no_body() {
        let h = headers(&[("content-length", "100")]);
        let l = LimitRead::from_res_headers(&h, http::StatusCode::OK, true);
        assert!(l.is_no_body());
    }

    #[test]
    fn no_content_has_no_body() {
        let h = headers(&[]);
        let l = LimitRead::from_res_headers(&h, http::StatusCode::NO_CONTENT, false);
        assert!(l.is_no_body());
    }

    #[test]
    fn interim_without_framing_drains_nothing() {
        let h = headers(&[]);
        assert!(LimitRead::for_interim(&h).is_none());

        let h = headers(&[("content-length", "0")]);
        assert!(LimitRead::for_interim(&h).is_none());

        let h = headers(&[("content-length", "3")]);
        assert!(LimitRead::for_interim(&h).is_some());
    }

    #[test]
    fn keep_alive_defaults_by_version() {
        let none = headers(&[]);
        assert!(allow_reuse(&none, http::Version::HTTP_11));
        assert!(!allow_reuse(&none, http::Version::HTTP_10));

        let close = headers(&[("connection", "close")]);
        assert!(!allow_reuse(&close, http::Version::HTTP_11));

        let keep = headers(&[("connection", "keep-alive")]);
        assert!(allow_reuse(&keep, http::Version::HTTP_10));
    }

    #[test]
    fn content_length_write_overflow() {
        let mut w = LimitWrite::ContentLength(ContentLengthWrite::new(2));
        let mut out = vec![];
        let err = w.write(b"HELLO", &mut out).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Body data longer than content-length header: 5 > 2"
        );
    }
}
