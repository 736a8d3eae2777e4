//! Chat service error types with HTTP status classification.

/// Error from chat service calls.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceError {
    /// The kind of error
    pub kind: ServiceErrorKind,
    /// HTTP status code, if applicable
    pub status_code: Option<u16>,
    /// Error message
    pub message: String,
}

impl ServiceError {
    fn new(kind: ServiceErrorKind, status_code: Option<u16>, message: String) -> Self {
        Self {
            kind,
            status_code,
            message,
        }
    }

    /// No API key was configured.
    pub fn missing_credential() -> Self {
        Self::new(
            ServiceErrorKind::MissingCredential,
            None,
            "No API key configured".to_string(),
        )
    }

    /// Non-success HTTP response, classified by status.
    pub fn http(status_code: u16, message: String) -> Self {
        Self::new(classify_http_status(status_code), Some(status_code), message)
    }

    /// Create a network error.
    pub fn network_error(message: String) -> Self {
        Self::new(ServiceErrorKind::Network, None, message)
    }

    pub fn timeout(message: String) -> Self {
        Self::new(ServiceErrorKind::Timeout, None, message)
    }

    /// Create a parse error.
    pub fn parse_error(message: String) -> Self {
        Self::new(ServiceErrorKind::Parse, None, message)
    }

    /// Local I/O failure while preparing a request (e.g. reading an upload).
    pub fn io(message: String) -> Self {
        Self::new(ServiceErrorKind::ClientError, None, message)
    }

    /// Whether the credential itself was rejected or absent.
    pub fn is_auth(&self) -> bool {
        matches!(
            self.kind,
            ServiceErrorKind::MissingCredential | ServiceErrorKind::Unauthorized
        )
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ServiceError::timeout(err.to_string())
        } else if err.is_decode() {
            ServiceError::parse_error(err.to_string())
        } else if let Some(status) = err.status() {
            ServiceError::http(status.as_u16(), err.to_string())
        } else {
            ServiceError::network_error(err.to_string())
        }
    }
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status_code {
            Some(code) => write!(f, "{} (HTTP {}): {}", self.kind, code, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for ServiceError {}

/// Classification of chat service errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceErrorKind {
    /// No credential available to send
    MissingCredential,
    /// Credential rejected (401, 403)
    Unauthorized,
    /// Rate limited (429)
    RateLimited,
    /// Other 4xx
    ClientError,
    /// 5xx
    ServerError,
    /// Connection failed
    Network,
    /// Request exceeded its deadline
    Timeout,
    /// Response body did not have the expected shape
    Parse,
}

impl std::fmt::Display for ServiceErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceErrorKind::MissingCredential => write!(f, "Missing credential"),
            ServiceErrorKind::Unauthorized => write!(f, "Unauthorized"),
            ServiceErrorKind::RateLimited => write!(f, "Rate limited"),
            ServiceErrorKind::ClientError => write!(f, "Client error"),
            ServiceErrorKind::ServerError => write!(f, "Server error"),
            ServiceErrorKind::Network => write!(f, "Network error"),
            ServiceErrorKind::Timeout => write!(f, "Timeout"),
            ServiceErrorKind::Parse => write!(f, "Parse error"),
        }
    }
}

/// Parse HTTP status code into error kind.
pub fn classify_http_status(status: u16) -> ServiceErrorKind {
    match status {
        401 | 403 => ServiceErrorKind::Unauthorized,
        408 => ServiceErrorKind::Timeout,
        429 => ServiceErrorKind::RateLimited,
        500 | 502 | 503 | 504 => ServiceErrorKind::ServerError,
        400..=499 => ServiceErrorKind::ClientError,
        _ => ServiceErrorKind::ServerError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_classification() {
        assert_eq!(classify_http_status(401), ServiceErrorKind::Unauthorized);
        assert_eq!(classify_http_status(403), ServiceErrorKind::Unauthorized);
        assert_eq!(classify_http_status(404), ServiceErrorKind::ClientError);
        assert_eq!(classify_http_status(408), ServiceErrorKind::Timeout);
        assert_eq!(classify_http_status(429), ServiceErrorKind::RateLimited);
        assert_eq!(classify_http_status(502), ServiceErrorKind::ServerError);
    }

    #[test]
    fn test_auth_errors() {
        assert!(ServiceError::missing_credential().is_auth());
        assert!(ServiceError::http(401, "bad key".into()).is_auth());
        assert!(!ServiceError::http(500, "boom".into()).is_auth());
    }

    #[test]
    fn test_display_includes_status() {
        let err = ServiceError::http(403, "Invalid API Key".into());
        assert_eq!(err.to_string(), "Unauthorized (HTTP 403): Invalid API Key");
    }
}
