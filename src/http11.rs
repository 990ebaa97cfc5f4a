use http::header::{HeaderName, HeaderValue};
use std::io;
use std::io::Write;

// Request headers today vary in size from ~200 bytes to over 2KB.
// As applications use more cookies and user agents expand features,
// typical header sizes of 700-800 bytes is common.
// http://dev.chromium.org/spdy/spdy-whitepaper

/// Write an http/1.x request head to a buffer.
#[allow(clippy::write_with_newline)]
pub(crate) fn write_http11_req(req: &http::Request<()>, buf: &mut Vec<u8>) -> io::Result<()> {
    // Path and query
    let pq = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let ver = match req.version() {
        http::Version::HTTP_10 => "1.0",
        http::Version::HTTP_11 => "1.1",
        v => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Unsupported http version: {:?}", v),
            ));
        }
    };

    // Vec<u8> as io::Write appends, which is what we want.
    let w = buf;

    write!(w, "{} {} HTTP/{}\r\n", req.method(), pq, ver)?;

    let mut has_host = false;
    for (name, _) in req.headers() {
        if name.as_str() == "host" {
            has_host = true;
        }
    }

    if !has_host {
        let default_port: u16 = match req.uri().scheme_str() {
            Some("https") => 443,
            Some("http") => 80,
            _ => 0,
        };
        let port = match req.uri().port_u16() {
            Some(p) if p != default_port => p,
            _ => 0,
        };

        // fall back on uri host
        if let Some(h) = req.uri().host() {
            write!(w, "host: {}", h)?;
            if port != 0 {
                write!(w, ":{}", port)?;
            }
            write!(w, "\r\n")?;
        }
    }

    // the rest of the headers.
    for (name, value) in req.headers() {
        write!(w, "{}: ", name)?;
        w.write_all(value.as_bytes())?;
        write!(w, "\r\n")?;
    }
    write!(w, "\r\n")?;

    debug!("write_http11_req: {:?}", String::from_utf8_lossy(w));

    Ok(())
}

fn version_of(v: Option<u8>) -> http::Version {
    match v {
        Some(0) => http::Version::HTTP_10,
        _ => http::Version::HTTP_11,
    }
}

/// Attempt to parse an http/1.x response head.
///
/// `None` means the buffer does not yet hold a complete head. On success
/// the parsed response and the number of bytes the head used are returned.
pub(crate) fn try_parse_res(buf: &[u8]) -> Result<Option<(http::Response<()>, usize)>, io::Error> {
    trace!("try_parse_res: {} bytes", buf.len());

    let mut headers = [httparse::EMPTY_HEADER; 128];
    let mut parser = httparse::Response::new(&mut headers);

    let status = parser
        .parse(&buf)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    if status.is_partial() {
        return Ok(None);
    }

    let mut bld = http::Response::builder().version(version_of(parser.version));

    if let Some(code) = parser.code {
        bld = bld.status(code);
    }

    for head in parser.headers.iter() {
        let name = HeaderName::from_bytes(head.name.as_bytes());
        let value = HeaderValue::from_bytes(head.value);
        match (name, value) {
            (Ok(name), Ok(value)) => bld = bld.header(name, value),
            (Err(e), _) => {
                debug!("Dropping bad header name: {}", e);
            }
            (Ok(name), Err(e)) => {
                debug!("Dropping bad header value ({}): {}", name, e);
            }
        }
    }

    let built = bld
        .body(())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    let len = status.unwrap();

    debug!("try_parse_res success: {:?}", built);

    Ok(Some((built, len)))
}
