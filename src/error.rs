//! Error handling for CamHub

use crate::protocol::codes;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Bad argument / parse failure
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Message requires an authenticated device session
    #[error("Unauthorized")]
    Unauthorized,

    /// Serial already registered by another session
    #[error("Conflict: {0}")]
    Conflict(String),

    /// No registered device with the requested serial
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// No media relay available
    #[error("Service not found")]
    ServiceNotFound,

    /// Cooperative wait expired without a device reply
    #[error("Request timeout")]
    Timeout,

    /// Error number reported by a device reply, propagated verbatim
    #[error("Device error: {0}")]
    Device(i32),

    /// Stream-ID mint / storage failure
    #[error("Internal error: {0}")]
    Internal(String),

    /// Unsupported message type
    #[error("Not implemented")]
    NotImplemented,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Wire error number for the protocol envelope.
    ///
    /// Everything without a dedicated code collapses to CLIENT_BAD_REQUEST,
    /// matching the hub's fallback policy.
    pub fn error_num(&self) -> i32 {
        match self {
            Error::BadRequest(_) => codes::CLIENT_BAD_REQUEST,
            Error::Unauthorized => codes::CLIENT_UNAUTHORIZED,
            Error::Conflict(_) => codes::CONFLICT,
            Error::DeviceNotFound(_) => codes::DEVICE_NOT_FOUND,
            Error::ServiceNotFound => codes::SERVICE_NOT_FOUND,
            Error::Timeout => codes::REQUEST_TIMEOUT,
            Error::Device(code) => *code,
            Error::Internal(_) => codes::SERVER_INTERNAL_ERROR,
            Error::NotImplemented => codes::SERVER_NOT_IMPLEMENTED,
            Error::Io(_) | Error::Serialization(_) => codes::CLIENT_BAD_REQUEST,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_num_mapping_is_total() {
        assert_eq!(
            Error::BadRequest("x".into()).error_num(),
            codes::CLIENT_BAD_REQUEST
        );
        assert_eq!(Error::Unauthorized.error_num(), codes::CLIENT_UNAUTHORIZED);
        assert_eq!(Error::Conflict("s".into()).error_num(), codes::CONFLICT);
        assert_eq!(
            Error::DeviceNotFound("s".into()).error_num(),
            codes::DEVICE_NOT_FOUND
        );
        assert_eq!(Error::ServiceNotFound.error_num(), codes::SERVICE_NOT_FOUND);
        assert_eq!(Error::Timeout.error_num(), codes::REQUEST_TIMEOUT);
        assert_eq!(Error::Device(599).error_num(), 599);
        assert_eq!(
            Error::Internal("x".into()).error_num(),
            codes::SERVER_INTERNAL_ERROR
        );
        assert_eq!(
            Error::NotImplemented.error_num(),
            codes::SERVER_NOT_IMPLEMENTED
        );
    }

    #[test]
    fn io_errors_fall_back_to_bad_request() {
        let err = Error::Io(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        assert_eq!(err.error_num(), codes::CLIENT_BAD_REQUEST);
    }
}
