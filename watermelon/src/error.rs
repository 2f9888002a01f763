//! Error kinds shared across the connection runtime.
//!
//! Individual subsystems (`watermelon-mini`'s `ConnectError`, the command
//! builders' `ClientClosedError`/`TryCommandError`, ...) keep their own
//! narrow error types for their narrow surface. This module exists for the
//! parts of the runtime that don't have a single obvious caller to return a
//! narrow error to: the reconnect loop, the timer wheel, the GC queue and
//! `Client::flush`. It doubles as the enumeration of every error kind a
//! NATS client can produce, for documentation purposes.

use std::fmt;

use tokio::task_local;

/// The classification of an [`Error`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// A network I/O error occurred.
    Io,
    /// The operation could not complete because the connection is closed.
    ConnectionClosed,
    /// No server in the pool could be reached.
    NoServer,
    /// The server stopped responding to `PING`.
    StaleConnection,
    /// The server requires a secure connection.
    SecureRequired,
    /// A secure connection was requested but the server doesn't support one.
    SecureWanted,
    /// Authentication with the server failed.
    AuthFailed,
    /// No server address was provided.
    AddressMissing,
    /// A subject failed to validate.
    InvalidSubject,
    /// An invalid argument was passed to an API.
    InvalidArg,
    /// The subscription is no longer valid.
    InvalidSubscription,
    /// An invalid timeout was provided.
    InvalidTimeout,
    /// The operation isn't valid given the current state.
    IllegalState,
    /// A subscription's pending queue exceeded its configured limits.
    SlowConsumer,
    /// The payload exceeds the server's advertised `max_payload`.
    MaxPayload,
    /// An auto-unsubscribe's message limit was reached.
    MaxDeliveredMsgs,
    /// A bounded buffer (e.g. the reconnect pending buffer) is full.
    InsufficientBuffer,
    /// Memory allocation failed.
    NoMemory,
    /// A generic OS/system-level error occurred.
    SysError,
    /// The operation timed out.
    Timeout,
    /// The runtime failed to initialize.
    FailedToInitialize,
    /// The runtime hasn't been initialized.
    NotInitialized,
    /// The server sent a frame that didn't parse or doesn't fit the protocol.
    ProtocolError,
    /// A line in the wire protocol exceeded the maximum accepted length.
    LineTooLong,
    /// A TLS-level error occurred.
    SslError,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Io => "io error",
            Self::ConnectionClosed => "connection closed",
            Self::NoServer => "no server available",
            Self::StaleConnection => "stale connection",
            Self::SecureRequired => "secure connection required",
            Self::SecureWanted => "secure connection wanted but unsupported",
            Self::AuthFailed => "authentication failed",
            Self::AddressMissing => "server address missing",
            Self::InvalidSubject => "invalid subject",
            Self::InvalidArg => "invalid argument",
            Self::InvalidSubscription => "invalid subscription",
            Self::InvalidTimeout => "invalid timeout",
            Self::IllegalState => "illegal state",
            Self::SlowConsumer => "slow consumer",
            Self::MaxPayload => "maximum payload exceeded",
            Self::MaxDeliveredMsgs => "maximum delivered messages reached",
            Self::InsufficientBuffer => "insufficient buffer",
            Self::NoMemory => "out of memory",
            Self::SysError => "system error",
            Self::Timeout => "timed out",
            Self::FailedToInitialize => "failed to initialize",
            Self::NotInitialized => "not initialized",
            Self::ProtocolError => "protocol error",
            Self::LineTooLong => "line too long",
            Self::SslError => "ssl error",
        };
        f.write_str(text)
    }
}

/// Maximum number of call-chain frames retained per error.
const MAX_FRAMES: usize = 16;

/// A rich error value carrying its [`ErrorKind`] and a bounded call chain.
///
/// This is the preferred way to observe an error: it is returned directly
/// by the fallible operation that produced it. [`last_error`] offers a
/// thread-local (here: task-local) mirror of the most recently observed
/// error for API parity with clients that poll a "last error" slot instead,
/// but it is a best-effort compatibility shim, not the primary mechanism.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    message: Option<&'static str>,
    chain: Vec<&'static str>,
}

impl Error {
    /// Construct a new error of the given kind.
    #[must_use]
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            chain: Vec::new(),
        }
    }

    /// Attach a static message to this error.
    #[must_use]
    pub fn with_message(mut self, message: &'static str) -> Self {
        self.message = Some(message);
        self
    }

    /// Push a call-site frame onto the bounded chain, then store this as the
    /// task-local last error.
    #[must_use]
    pub fn bubble(mut self, frame: &'static str) -> Self {
        if self.chain.len() < MAX_FRAMES {
            self.chain.push(frame);
        }
        LAST_ERROR.try_with(|cell| *cell.borrow_mut() = Some(self.clone())).ok();
        self
    }

    /// The classification of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The bounded call chain recorded as the error propagated.
    #[must_use]
    pub fn chain(&self) -> &[&'static str] {
        &self.chain
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message {
            Some(message) => write!(f, "{}: {message}", self.kind),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for Error {}

impl From<watermelon_mini::ConnectError> for Error {
    fn from(err: watermelon_mini::ConnectError) -> Self {
        let kind = match &err {
            watermelon_mini::ConnectError::Io(_) | watermelon_mini::ConnectError::Connect(_) => {
                ErrorKind::Io
            }
            watermelon_mini::ConnectError::InvalidDnsName(_) => ErrorKind::AddressMissing,
            watermelon_mini::ConnectError::WebsocketUnsupported => ErrorKind::SecureWanted,
            watermelon_mini::ConnectError::UnexpectedServerOp
            | watermelon_mini::ConnectError::Decoder(_) => ErrorKind::ProtocolError,
            watermelon_mini::ConnectError::Authentication(_) => ErrorKind::AuthFailed,
        };
        Self::new(kind).bubble("ClientBuilder::connect")
    }
}

task_local! {
    static LAST_ERROR: std::cell::RefCell<Option<Error>>;
}

/// Run `f` with a fresh task-local "last error" slot, clearing it once `f`
/// returns successfully.
///
/// Connection tasks wrap their whole run loop in this so that
/// [`last_error`] reflects only errors observed on that task.
pub async fn with_last_error_scope<F, T>(f: F) -> T
where
    F: std::future::Future<Output = T>,
{
    LAST_ERROR.scope(std::cell::RefCell::new(None), f).await
}

/// Best-effort read of the most recently observed error on the current task.
///
/// Returns `None` if no error has been recorded, or if called outside of a
/// [`with_last_error_scope`] scope.
#[must_use]
pub fn last_error() -> Option<Error> {
    LAST_ERROR.try_with(|cell| cell.borrow().clone()).ok().flatten()
}
