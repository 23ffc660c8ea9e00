//! Error taxonomy for weather fetching and location lookups.

use nimbus_core::ConfigError;

/// Coarse classification of a [`FetchError`], driving retry and fallback decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing or invalid credentials in configuration. Never retried.
    Configuration,
    /// A newer request superseded this one. Never shown, never retried.
    Cancellation,
    /// HTTP 429 or any 5xx. Retried with backoff.
    TransientService,
    /// HTTP 401. Triggers the coordinates to city fallback.
    Authentication,
    /// HTTP 404.
    NotFound,
    /// Any other non-success HTTP status.
    Service,
    /// Connection or transport failure without an HTTP status.
    Network,
    /// The response body did not match the expected schema.
    Parse,
}

/// Weather provider errors.
///
/// `Clone` so one failed request can be handed to every caller that was waiting on it.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FetchError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Request cancelled")]
    Cancelled,

    #[error("{message}")]
    Http { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

impl FetchError {
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::Http {
            status,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Cancelled => ErrorKind::Cancellation,
            Self::Http { status, .. } => match *status {
                401 => ErrorKind::Authentication,
                404 => ErrorKind::NotFound,
                429 => ErrorKind::TransientService,
                s if s >= 500 => ErrorKind::TransientService,
                _ => ErrorKind::Service,
            },
            Self::Network(_) => ErrorKind::Network,
            Self::Parse(_) => ErrorKind::Parse,
        }
    }

    /// HTTP status carried by the failure, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::TransientService
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn is_auth(&self) -> bool {
        self.kind() == ErrorKind::Authentication
    }

    pub fn user_message(&self) -> &'static str {
        match self.kind() {
            ErrorKind::Configuration => "Weather API key is missing. Check your settings.",
            ErrorKind::Cancellation => "Weather update was interrupted. Please try again.",
            ErrorKind::TransientService => {
                "Weather service is busy or unavailable. Please try again later."
            }
            ErrorKind::Authentication => "Weather API key is invalid. Check settings.",
            ErrorKind::NotFound => "Location not found. Check and try again.",
            ErrorKind::Service => "Weather service error. Please try again.",
            ErrorKind::Network => "Unable to connect. Check your internet connection.",
            ErrorKind::Parse => "Received an unexpected response. Please try again.",
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            FetchError::http(status.as_u16(), err.to_string())
        } else if err.is_decode() {
            FetchError::Parse(err.to_string())
        } else {
            FetchError::Network(err.to_string())
        }
    }
}

/// Location service errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LocationError {
    #[error("Location permission denied")]
    PermissionDenied,
    #[error("Location service unavailable")]
    ServiceUnavailable,
    #[error("Location request timed out")]
    Timeout,
    #[error("Location error: {0}")]
    Other(String),
}

impl LocationError {
    pub fn user_message(&self) -> &'static str {
        match self {
            LocationError::PermissionDenied => {
                "Location access was denied. Search for a city instead."
            }
            LocationError::ServiceUnavailable => "Device location is not available.",
            LocationError::Timeout => "Finding your location took too long.",
            LocationError::Other(_) => "Could not determine your location.",
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(FetchError::http(401, "x").kind(), ErrorKind::Authentication);
        assert_eq!(FetchError::http(404, "x").kind(), ErrorKind::NotFound);
        assert_eq!(FetchError::http(429, "x").kind(), ErrorKind::TransientService);
        assert_eq!(FetchError::http(500, "x").kind(), ErrorKind::TransientService);
        assert_eq!(FetchError::http(503, "x").kind(), ErrorKind::TransientService);
        assert_eq!(FetchError::http(400, "x").kind(), ErrorKind::Service);
        assert_eq!(FetchError::http(403, "x").kind(), ErrorKind::Service);
    }

    #[test]
    fn test_non_http_kinds() {
        assert_eq!(FetchError::Cancelled.kind(), ErrorKind::Cancellation);
        assert_eq!(
            FetchError::from(ConfigError::MissingSetting("WEATHER_API_KEY".into())).kind(),
            ErrorKind::Configuration
        );
        assert_eq!(FetchError::Network("reset".into()).kind(), ErrorKind::Network);
        assert!(!FetchError::Network("reset".into()).is_transient());
    }

    #[test]
    fn test_http_display_is_message() {
        let err = FetchError::http(404, "HTTP 404: Not Found city not found");
        assert_eq!(err.to_string(), "HTTP 404: Not Found city not found");
        assert_eq!(err.status(), Some(404));
    }
}
