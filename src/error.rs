use std::time::Duration;

use bluest::Uuid;
use thiserror::Error;

/// Why a payload could not be turned into a [`crate::RawReading`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("expected a {expected} byte payload, got {actual} bytes")]
    WrongLength { expected: usize, actual: usize },

    #[error("field `{field}` is not hexadecimal: {text:?}")]
    InvalidHex { field: &'static str, text: String },
}

/// Failures reported by a [`crate::BleTransport`].
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("no Bluetooth adapter available")]
    AdapterUnavailable,

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("the device does not expose characteristic {0}")]
    MissingCharacteristic(Uuid),

    #[error(transparent)]
    Bluetooth(#[from] bluest::Error),

    #[error("{0}")]
    Other(String),
}

/// The coarse failure classes a host reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    ConnectionError,
    Timeout,
    MalformedPayload,
}

/// A failed poll cycle. Every variant is scoped to the one cycle that produced it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PollError {
    /// The link could not be established, or dropped before a payload arrived.
    #[error("connection error: {0}")]
    Connection(String),

    /// No notification arrived within the budget.
    #[error("no notification received within {0:?}")]
    Timeout(Duration),

    #[error("malformed payload: {0}")]
    MalformedPayload(#[from] DecodeError),
}

impl PollError {
    pub fn kind(&self) -> FailureKind {
        match self {
            PollError::Connection(_) => FailureKind::ConnectionError,
            PollError::Timeout(_) => FailureKind::Timeout,
            PollError::MalformedPayload(_) => FailureKind::MalformedPayload,
        }
    }
}

impl From<TransportError> for PollError {
    fn from(err: TransportError) -> Self {
        PollError::Connection(err.to_string())
    }
}

/// Problems loading or validating a [`crate::MonitorConfig`].
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid voltage curve: {0}")]
    InvalidCurve(String),

    #[error("invalid thresholds: {0}")]
    InvalidThresholds(String),

    #[error("invalid status code mapping: {0}")]
    InvalidStatusCode(String),
}

#[test]
fn test_poll_error_kinds() {
    assert_eq!(
        PollError::Connection("gone".into()).kind(),
        FailureKind::ConnectionError
    );
    assert_eq!(
        PollError::Timeout(Duration::from_secs(20)).kind(),
        FailureKind::Timeout
    );
    let err: PollError = DecodeError::WrongLength { expected: 16, actual: 3 }.into();
    assert_eq!(err.kind(), FailureKind::MalformedPayload);
}

#[test]
fn test_transport_error_becomes_connection_error() {
    let err: PollError = TransportError::DeviceNotFound("ZX-1689".into()).into();
    assert_eq!(err, PollError::Connection("device not found: ZX-1689".into()));
}
