use crate::Body;
use std::fmt;
use std::io;
use std::time::Duration;

/// Possible errors from this crate.
#[derive(Debug)]
pub enum Error {
    /// A user/usage problem such as sending more bytes than a content-length header specifies.
    User(String),
    /// A wrapped std::io::Error from the underlying transport (socket).
    Io(io::Error),
    /// HTTP/1.1 parse errors from the `httparse` crate.
    Http11Parser(httparse::Error),
    /// Http errors from the `http` crate.
    Http(http::Error),
    /// No connection could be checked out of the pool before the configured
    /// acquire timeout elapsed.
    AcquireTimeout(Duration),
    /// The pool already holds the configured maximum of pending acquires.
    PoolExhausted,
    /// The remote peer did not produce data within the configured read timeout.
    /// The connection is considered unhealthy and is closed.
    ReadTimeout,
    /// A response body grew beyond the configured limit. Carries the limit.
    BodyTooLarge(usize),
    /// The connection closed after the exchange started but before the
    /// response (or its body) completed. Distinguished from a generic I/O
    /// error so retry logic can tell "never got anything" from "got cut off".
    ClosedBeforeCompletion,
    /// The server answered with a 4xx/5xx status. Produced by `exchange` and
    /// `stream`; `proxy` passes such statuses through instead. The full
    /// response, body included, rides along.
    Status(Box<http::Response<Body>>),
}

impl Error {
    /// True for both timeout kinds (acquire and read).
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::AcquireTimeout(_) | Error::ReadTimeout => true,
            _ => false,
        }
    }

    /// True if the connection died mid-exchange.
    pub fn is_closed_before_completion(&self) -> bool {
        match self {
            Error::ClosedBeforeCompletion => true,
            _ => false,
        }
    }

    /// The error status response, if this is `Error::Status`.
    pub fn into_status_response(self) -> Option<http::Response<Body>> {
        match self {
            Error::Status(res) => Some(*res),
            _ => None,
        }
    }

    /// Make an equivalent error to report the same failure in more than one
    /// place (connection future and response listener). Variants wrapping
    /// non-cloneable types degrade to a message-preserving form.
    pub(crate) fn replicate(&self) -> Error {
        match self {
            Error::User(v) => Error::User(v.clone()),
            Error::Io(v) => Error::Io(io::Error::new(v.kind(), format!("{}", v))),
            Error::Http11Parser(v) => Error::Http11Parser(*v),
            Error::Http(v) => Error::User(format!("http api: {}", v)),
            Error::AcquireTimeout(d) => Error::AcquireTimeout(*d),
            Error::PoolExhausted => Error::PoolExhausted,
            Error::ReadTimeout => Error::ReadTimeout,
            Error::BodyTooLarge(l) => Error::BodyTooLarge(*l),
            Error::ClosedBeforeCompletion => Error::ClosedBeforeCompletion,
            Error::Status(res) => Error::User(format!("Error status: {}", res.status())),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::User(v) => write!(f, "{}", v),
            Error::Io(v) => fmt::Display::fmt(v, f),
            Error::Http11Parser(v) => write!(f, "http11 parser: {}", v),
            Error::Http(v) => write!(f, "http api: {}", v),
            Error::AcquireTimeout(d) => write!(f, "Pool acquire timed out after {:?}", d),
            Error::PoolExhausted => write!(f, "Too many pending pool acquires"),
            Error::ReadTimeout => write!(f, "Read timed out"),
            Error::BodyTooLarge(l) => write!(f, "Body too large, limit is {}", l),
            Error::ClosedBeforeCompletion => {
                write!(f, "Connection closed before response completion")
            }
            Error::Status(res) => write!(f, "Error status: {}", res.status()),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<httparse::Error> for Error {
    fn from(e: httparse::Error) -> Self {
        Error::Http11Parser(e)
    }
}

impl From<http::Error> for Error {
    fn from(e: http::Error) -> Self {
        Error::Http(e)
    }
}
