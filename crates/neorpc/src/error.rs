//! # Error Definitions
//!
//! Two families of failure live here:
//!
//! - [`RpcError`]: the structured error a peer receives in a failed Response.
//!   It crosses the wire, so it is serializable and carries a coarse [`ErrorType`].
//! - [`Error`]: codec failures on this side of the wire (encoding, envelope and
//!   payload decoding). These never cross the wire directly.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// Well-known values for [`RpcError::code`].
pub mod code {
    pub const UNHANDLED_API: &str = "UNHANDLED_API";
    pub const NO_RESPONSE: &str = "NO_RESPONSE";
    pub const SERVER_TIMEOUT: &str = "SERVER_TIMEOUT";
    pub const INPUT_DATA_ERR: &str = "INPUT_DATA_ERR";
    pub const RES_DATA_ERR: &str = "RES_DATA_ERR";
    pub const SERVER_STOPPING: &str = "SERVER_STOPPING";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const SEND_DATA_ERR: &str = "SEND_DATA_ERR";
    pub const INVALID_API: &str = "INVALID_API";
    pub const SHORT_CONNECTION: &str = "SHORT_CONNECTION";
    pub const FLOW_ERROR: &str = "FLOW_ERROR";
}

/// Coarse classification of an [`RpcError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorType {
    /// Business-logic rejection. Safe to show to the caller.
    ApiError,
    /// Transport failure: refused, dropped, timed out or aborted.
    NetworkError,
    /// Handler fault or broken invariant on the serving side.
    ServerError,
    /// Malformed outbound request, caught before it left this process.
    ClientError,
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ApiError => write!(f, "ApiError"),
            Self::NetworkError => write!(f, "NetworkError"),
            Self::ServerError => write!(f, "ServerError"),
            Self::ClientError => write!(f, "ClientError"),
        }
    }
}

/// The structured error of a failed call.
///
/// Wire shape: `{"message": .., "type": .., "code"?: .., "innerErr"?: ..}`.
/// `inner` only ever carries debug detail and is only filled in when the serving
/// side explicitly opts into exposing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: ErrorType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, rename = "innerErr", skip_serializing_if = "Option::is_none")]
    pub inner: Option<String>,
}

impl RpcError {
    pub fn new(kind: ErrorType, message: impl Into<String>) -> Self {
        Self { message: message.into(), kind, code: None, inner: None }
    }

    pub fn api(message: impl Into<String>) -> Self {
        Self::new(ErrorType::ApiError, message)
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::new(ErrorType::ServerError, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorType::NetworkError, message)
    }

    pub fn client(message: impl Into<String>) -> Self {
        Self::new(ErrorType::ClientError, message)
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_inner(mut self, inner: impl Into<String>) -> Self {
        self.inner = Some(inner.into());
        self
    }

    /// True when the failure was a deliberate rejection by the handler rather
    /// than a fault somewhere in the call path.
    pub fn is_business(&self) -> bool {
        self.kind == ErrorType::ApiError
    }

    pub fn has_code(&self, code: &str) -> bool {
        self.code.as_deref() == Some(code)
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "[{}:{}] {}", self.kind, code, self.message),
            None => write!(f, "[{}] {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for RpcError {}

/// How a frame failed to decode.
///
/// Envelope failures and payload failures are different failure domains: an
/// unknown service usually means version skew between peers, a payload that
/// fails its schema usually means a malformed or hostile request.
#[derive(Debug, Clone)]
pub enum DecodeError {
    /// The envelope itself was malformed (truncated, bad kind byte, bad JSON).
    Envelope(String),
    /// The envelope parsed but named a service this registry does not have.
    UnknownService { service: ServiceRef, sn: Option<u64> },
    /// The envelope parsed and resolved, but the body failed its schema.
    Payload { service_id: u32, service_name: String, sn: Option<u64>, reason: String },
}

impl DecodeError {
    /// The sequence number of the request, when the envelope got far enough to read it.
    pub fn sn(&self) -> Option<u64> {
        match self {
            Self::Envelope(_) => None,
            Self::UnknownService { sn, .. } => *sn,
            Self::Payload { sn, .. } => *sn,
        }
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Envelope(msg) => write!(f, "Malformed envelope: {}", msg),
            Self::UnknownService { service, .. } => write!(f, "Unknown service: {}", service),
            Self::Payload { service_name, reason, .. } => {
                write!(f, "Invalid payload for '{}': {}", service_name, reason)
            }
        }
    }
}

/// A reference to a service as it appeared on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceRef {
    Id(u32),
    Name(String),
}

impl fmt::Display for ServiceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "#{}", id),
            Self::Name(name) => write!(f, "'{}'", name),
        }
    }
}

/// Codec failures.
#[derive(Debug, Clone)]
pub enum Error {
    /// The outbound body did not satisfy its schema.
    Encode { service: String, reason: String },
    /// The inbound bytes could not be turned into a frame.
    Decode(DecodeError),
    /// A service was used in the wrong role (e.g. a Message service as an API).
    KindMismatch { service: String, expected: &'static str },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Encode { service, reason } => write!(f, "Encode error for '{}': {}", service, reason),
            Self::Decode(e) => write!(f, "Decode error: {}", e),
            Self::KindMismatch { service, expected } => {
                write!(f, "Service '{}' is not a {} service", service, expected)
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<DecodeError> for Error {
    fn from(e: DecodeError) -> Self {
        Self::Decode(e)
    }
}

/// A specialized Result type for codec operations.
pub type Result<T> = std::result::Result<T, Error>;
