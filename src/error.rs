use thiserror::Error;

use crate::messages::response::ErrorResponse;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("invalid message type: {0:?}")]
    InvalidMessageType(u8),
    #[error("invalid message target type: {0:?}")]
    InvalidTargetType(u8),
    #[error("invalid startup packet")]
    InvalidStartupMessage,
    #[error("invalid packet length: {0}")]
    InvalidPacketLength(usize),
    #[error("message of {0} bytes exceeds limit of {1}")]
    MessageTooLarge(usize, usize),
    #[error("unsupported protocol version: {0}.{1}")]
    UnsupportedProtocolVersion(u16, u16),
    #[error("invalid transaction status: {0:?}")]
    InvalidTransactionStatus(u8),
    #[error("no \"user\" in startup parameters")]
    UserNameRequired,
    #[error("message received out of order during {0}")]
    OutOfOrderMessage(&'static str),
    #[error("unsupported SASL mechanism: {0:?}")]
    UnsupportedSaslMechanism(String),
    #[error("malformed SCRAM message: {0:?}")]
    InvalidScramMessage(String),
    #[error("password authentication failed for user {0:?}")]
    AuthenticationFailed(String),
    #[error("channel binding requires an SSL connection")]
    ChannelBindingRequiresSsl,
    #[error("channel binding data mismatch")]
    ChannelBindingMismatch,

    #[error("prepared statement {0:?} not found")]
    StatementNotFound(String),
    #[error("prepared statement {0:?} already exists")]
    DuplicateStatement(String),
    #[error("portal {0:?} not found")]
    PortalNotFound(String),

    #[error("could not connect to backend {endpoint}: {reason}")]
    BackendConnect { endpoint: String, reason: String },
    #[error("no writer endpoints available")]
    NoWritersAvailable,
    #[error("{message}")]
    Backend { code: String, message: String },
    #[error("unexpected backend message during {0}")]
    BackendProtocol(&'static str),
    #[error("query deadline exceeded")]
    DeadlineExceeded,
    #[error("commit diverged across writers: committed on [{committed}], failed on {failed}")]
    CommitDivergence { committed: String, failed: String },

    #[error("configuration error: {0}")]
    Config(String),
}

pub type ProxyResult<T> = Result<T, ProxyError>;

impl ProxyError {
    /// SQLSTATE reported to the client for this error.
    pub fn sqlstate(&self) -> &str {
        match self {
            ProxyError::InvalidMessageType(_)
            | ProxyError::InvalidTargetType(_)
            | ProxyError::InvalidStartupMessage
            | ProxyError::InvalidPacketLength(_)
            | ProxyError::MessageTooLarge(_, _)
            | ProxyError::UnsupportedProtocolVersion(_, _)
            | ProxyError::InvalidTransactionStatus(_)
            | ProxyError::UserNameRequired
            | ProxyError::OutOfOrderMessage(_) => "08P01",

            ProxyError::UnsupportedSaslMechanism(_)
            | ProxyError::InvalidScramMessage(_)
            | ProxyError::AuthenticationFailed(_)
            | ProxyError::ChannelBindingRequiresSsl
            | ProxyError::ChannelBindingMismatch => "28P01",

            ProxyError::StatementNotFound(_) => "26000",
            ProxyError::DuplicateStatement(_) => "42P05",
            ProxyError::PortalNotFound(_) => "34000",

            ProxyError::BackendConnect { .. } | ProxyError::NoWritersAvailable => "08006",
            ProxyError::Backend { code, .. } => code,
            ProxyError::DeadlineExceeded => "57014",

            ProxyError::IoError(_) => "58030",
            _ => "XX000",
        }
    }

    /// Fatal errors terminate the session after the error response is sent.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProxyError::InvalidMessageType(_)
                | ProxyError::InvalidTargetType(_)
                | ProxyError::InvalidStartupMessage
                | ProxyError::InvalidPacketLength(_)
                | ProxyError::MessageTooLarge(_, _)
                | ProxyError::UnsupportedProtocolVersion(_, _)
                | ProxyError::InvalidTransactionStatus(_)
                | ProxyError::UserNameRequired
                | ProxyError::OutOfOrderMessage(_)
                | ProxyError::UnsupportedSaslMechanism(_)
                | ProxyError::InvalidScramMessage(_)
                | ProxyError::AuthenticationFailed(_)
                | ProxyError::ChannelBindingRequiresSsl
                | ProxyError::ChannelBindingMismatch
                | ProxyError::IoError(_)
        )
    }
}

/// Severity, SQLSTATE and message for an `ErrorResponse` or `NoticeResponse`.
#[derive(Debug, new)]
pub struct ErrorInfo {
    pub severity: String,
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn is_fatal(&self) -> bool {
        self.severity == "FATAL"
    }
}

impl From<&ProxyError> for ErrorInfo {
    fn from(e: &ProxyError) -> ErrorInfo {
        let severity = if e.is_fatal() { "FATAL" } else { "ERROR" };
        ErrorInfo::new(severity.to_owned(), e.sqlstate().to_owned(), e.to_string())
    }
}

impl From<ErrorInfo> for ErrorResponse {
    fn from(ei: ErrorInfo) -> ErrorResponse {
        ErrorResponse::new(vec![
            (b'S', ei.severity.clone()),
            (b'V', ei.severity),
            (b'C', ei.code),
            (b'M', ei.message),
        ])
    }
}

impl From<&ErrorResponse> for ProxyError {
    /// Lift a backend `ErrorResponse` into an error that carries the
    /// backend's SQLSTATE through to the client.
    fn from(resp: &ErrorResponse) -> ProxyError {
        let field = |tag: u8| {
            resp.fields
                .iter()
                .find(|(code, _)| *code == tag)
                .map(|(_, value)| value.clone())
        };
        ProxyError::Backend {
            code: field(b'C').unwrap_or_else(|| "XX000".to_owned()),
            message: field(b'M').unwrap_or_else(|| "unknown backend error".to_owned()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_sqlstate_mapping() {
        assert_eq!(ProxyError::NoWritersAvailable.sqlstate(), "08006");
        assert_eq!(ProxyError::DeadlineExceeded.sqlstate(), "57014");
        assert_eq!(
            ProxyError::AuthenticationFailed("bob".to_owned()).sqlstate(),
            "28P01"
        );
        assert_eq!(ProxyError::InvalidMessageType(b'!').sqlstate(), "08P01");
        let backend = ProxyError::Backend {
            code: "23505".to_owned(),
            message: "duplicate key".to_owned(),
        };
        assert_eq!(backend.sqlstate(), "23505");
        assert!(!backend.is_fatal());
    }

    #[test]
    fn test_auth_errors_are_fatal() {
        let e = ProxyError::AuthenticationFailed("alice".to_owned());
        let info = ErrorInfo::from(&e);
        assert_eq!(info.severity, "FATAL");
        assert_eq!(info.code, "28P01");
        assert!(info.is_fatal());
    }

    #[test]
    fn test_backend_error_response_roundtrip() {
        let resp = ErrorResponse::new(vec![
            (b'S', "ERROR".to_owned()),
            (b'C', "42601".to_owned()),
            (b'M', "syntax error at or near \"SELEC\"".to_owned()),
        ]);
        let err = ProxyError::from(&resp);
        assert_eq!(err.sqlstate(), "42601");
        assert!(err.to_string().contains("syntax error"));
    }
}
