//! Core value and error types shared by every component of the client.
use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::str::from_utf8;

/// A boxed future carrying a `RedisResult`, used throughout the async API
/// so that trait methods returning futures can be object-safe.
pub type RedisFuture<'a, T> = Pin<Box<dyn Future<Output = RedisResult<T>> + Send + 'a>>;

/// A single RESP value, as read off the wire or written to it.
///
/// The null bulk string and the null array are both represented by `Nil`.
/// The parser only ever produces `Nil` from a `$-1\r\n` or `*-1\r\n` header,
/// so an empty bulk (`$0\r\n\r\n`) and a null bulk remain distinguishable:
/// the former decodes to `Value::Data(vec![])`, the latter to `Value::Nil`.
#[derive(Clone, PartialEq)]
pub enum Value {
    /// A nil response from the server (null bulk or null array).
    Nil,
    /// An integer response.
    Int(i64),
    /// A bulk string, stored as raw bytes since callers may want either
    /// text or binary data out of it.
    Data(Vec<u8>),
    /// A nested array of values.
    Bulk(Vec<Value>),
    /// A status reply (`+OK\r\n` and friends), stored as the original text.
    Status(String),
    /// A successful `+OK` reply, broken out from `Status` because it is by
    /// far the most common one and callers shape it into `bool`/`()`.
    Okay,
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Int(i) => write!(f, "int({i})"),
            Value::Data(d) => match from_utf8(d) {
                Ok(s) => write!(f, "bulk-string('{s}')"),
                Err(_) => write!(f, "binary-data({:?})", d),
            },
            Value::Bulk(v) => write!(f, "bulk({v:?})"),
            Value::Status(s) => write!(f, "status({s})"),
            Value::Okay => write!(f, "ok"),
        }
    }
}

impl Value {
    /// Returns the bytes of a bulk string, if this is one.
    pub fn as_data(&self) -> Option<&[u8]> {
        match self {
            Value::Data(d) => Some(d),
            _ => None,
        }
    }

    /// Returns the elements of an array, if this is one.
    pub fn as_bulk(&self) -> Option<&[Value]> {
        match self {
            Value::Bulk(v) => Some(v),
            _ => None,
        }
    }

    pub fn looks_like_ok(&self) -> bool {
        matches!(self, Value::Okay) || matches!(self, Value::Status(s) if s == "OK")
    }
}

/// The taxonomy of errors the client can raise, mirroring the RESP error
/// prefixes in the wire protocol plus the client-side failure modes.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum ErrorKind {
    /// A response error whose first token did not match any known prefix.
    ResponseError,
    /// The server does not recognize a cached script (`NOSCRIPT`).
    NoScriptError,
    /// `EXECABORT`: a `MULTI`/`EXEC` transaction was aborted server-side.
    ExecAbortError,
    /// `READONLY`: a replica rejected a write.
    ReadOnly,
    /// Authentication was required or the credentials were rejected.
    AuthenticationFailed,
    /// `NOPERM`: the authenticated user lacks permission.
    NoPermission,
    /// The RESP stream could not be parsed.
    TypeError,
    /// A client-side encoding/argument error (unsupported argument type).
    ClientError,
    /// I/O failure establishing or using the socket.
    IoError,
    /// The socket failed during a command and was closed.
    ConnectionDropped,
    /// An operation exceeded its configured timeout.
    Timeout,
    /// `LOADING`: the server is loading its dataset; connection is unusable.
    BusyLoadingError,
    /// `MOVED slot host:port`.
    Moved,
    /// `ASK slot host:port`.
    Ask,
    /// `TRYAGAIN`.
    TryAgain,
    /// `CLUSTERDOWN`.
    ClusterDown,
    /// Keys in one request hash to more than one slot.
    CrossSlot,
    /// A cluster operation exhausted its redirection/retry budget.
    ClusterTopologyExhausted,
    /// `WATCH`ed keys changed before `EXEC`.
    WatchError,
    /// The connection pool could not hand out a connection.
    PoolExhausted,
    /// The connection URL or builder configuration was invalid.
    InvalidClientConfig,
}

/// An error produced by any part of the client.
pub struct RedisError {
    kind: ErrorKind,
    description: &'static str,
    detail: Option<String>,
}

impl RedisError {
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }

    /// True for the errors that mean "the socket is no longer usable" and
    /// therefore pool/pipeline code must close rather than re-idle it.
    pub fn is_connection_dropped(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::IoError
                | ErrorKind::ConnectionDropped
                | ErrorKind::BusyLoadingError
                | ErrorKind::TypeError
                | ErrorKind::Timeout
        )
    }

    pub fn is_io_error(&self) -> bool {
        matches!(self.kind, ErrorKind::IoError | ErrorKind::ConnectionDropped)
    }

    pub fn is_cluster_error(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::Moved
                | ErrorKind::Ask
                | ErrorKind::TryAgain
                | ErrorKind::ClusterDown
                | ErrorKind::CrossSlot
                | ErrorKind::ClusterTopologyExhausted
        )
    }

    /// Parses a `MOVED`/`ASK` detail of the form `"<slot> <host>:<port>"`.
    pub fn redirect_target(&self) -> Option<(u16, String)> {
        if !matches!(self.kind, ErrorKind::Moved | ErrorKind::Ask) {
            return None;
        }
        let detail = self.detail.as_ref()?;
        let mut parts = detail.splitn(2, ' ');
        let slot: u16 = parts.next()?.parse().ok()?;
        let addr = parts.next()?.to_string();
        Some((slot, addr))
    }
}

impl fmt::Debug for RedisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RedisError {{ kind: {:?}, description: {}", self.kind, self.description)?;
        if let Some(d) = &self.detail {
            write!(f, ", detail: {d}")?;
        }
        write!(f, " }}")
    }
}

impl fmt::Display for RedisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{} - {}", self.description, detail),
            None => write!(f, "{}", self.description),
        }
    }
}

impl std::error::Error for RedisError {}

impl From<(ErrorKind, &'static str)> for RedisError {
    fn from((kind, description): (ErrorKind, &'static str)) -> Self {
        RedisError { kind, description, detail: None }
    }
}

impl From<(ErrorKind, &'static str, String)> for RedisError {
    fn from((kind, description, detail): (ErrorKind, &'static str, String)) -> Self {
        RedisError { kind, description, detail: Some(detail) }
    }
}

impl From<io::Error> for RedisError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut => (ErrorKind::Timeout, "operation timed out", err.to_string()).into(),
            _ => (ErrorKind::IoError, "I/O error", err.to_string()).into(),
        }
    }
}

impl From<tokio::time::error::Elapsed> for RedisError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        (ErrorKind::Timeout, "operation timed out").into()
    }
}

impl RedisError {
    /// Clones the bulk of the error for fan-out to multiple waiters
    /// (cluster topology refresh, `ConnectionManager`-style reconnects).
    pub fn clone_mostly(&self, context: Option<&'static str>) -> RedisError {
        RedisError {
            kind: self.kind,
            description: context.unwrap_or(self.description),
            detail: self.detail.clone(),
        }
    }
}

pub type RedisResult<T> = Result<T, RedisError>;

/// Constructs and returns a `RedisError` from a tuple, for use at call
/// sites that would otherwise repeat `return Err(RedisError::from(...))`.
#[macro_export]
macro_rules! fail {
    ($expr:expr) => {
        return Err(::std::convert::From::from($expr))
    };
}
