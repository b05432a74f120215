//! Framechain Error Definitions
//!
//! Defines error types used throughout the crate, plus the
//! transient/fatal classification that drives the retry controller.

use thiserror::Error;

/// How an error should be treated by the retry controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Capacity noise. Retry with exponential backoff.
    Transient,
    /// Will not succeed on retry. Propagate immediately.
    Fatal,
    /// Ambiguous. Gets exactly one verification retry, then fatal.
    Unknown,
}

/// Generation engine error types
#[derive(Error, Debug)]
pub enum GenError {
    // =========================================================================
    // Request Errors
    // =========================================================================
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    // =========================================================================
    // Provider API Errors
    // =========================================================================
    #[error("Authentication failed for {provider}: {message}")]
    Auth { provider: String, message: String },

    #[error("Provider at capacity: {message}")]
    Capacity {
        message: String,
        retry_after: Option<std::time::Duration>,
    },

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Insufficient credits on {provider}")]
    InsufficientCredits { provider: String },

    #[error("Generation failed on {provider}: {reason}")]
    GenerationFailed { provider: String, reason: String },

    #[error("Retries exhausted after {attempts} attempts: {last}")]
    RetryExhausted { attempts: u32, last: Box<GenError> },

    // =========================================================================
    // Artifact Errors
    // =========================================================================
    #[error("Download failed: {0}")]
    Download(String),

    #[error("Job already recorded with different identity: {0}")]
    DuplicateJob(String),

    #[error("Artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("Invalid artifact status transition: {0}")]
    InvalidTransition(String),

    // =========================================================================
    // Frame Extraction Errors
    // =========================================================================
    #[error("Frame extraction failed: {0}")]
    FrameExtraction(String),

    // =========================================================================
    // General Errors
    // =========================================================================
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Generation engine result type
pub type GenResult<T> = Result<T, GenError>;

impl GenError {
    /// Classify for retry purposes.
    ///
    /// Capacity signals (429/502/503/504, timeouts, connection drops) and
    /// download hiccups are transient. Rejections the vendor will repeat
    /// (auth, validation, content policy, exhausted credits) are fatal.
    /// Everything ambiguous is `Unknown` so programming errors are not
    /// masked as capacity noise.
    pub fn class(&self) -> ErrorClass {
        match self {
            GenError::Capacity { .. }
            | GenError::Download(_)
            | GenError::Network(_)
            | GenError::Timeout(_) => ErrorClass::Transient,

            GenError::Validation(_)
            | GenError::UnknownProvider(_)
            | GenError::Auth { .. }
            | GenError::Api { .. }
            | GenError::InsufficientCredits { .. }
            | GenError::GenerationFailed { .. }
            | GenError::RetryExhausted { .. }
            | GenError::DuplicateJob(_)
            | GenError::ArtifactNotFound(_)
            | GenError::InvalidTransition(_)
            | GenError::FrameExtraction(_)
            | GenError::Cancelled => ErrorClass::Fatal,

            GenError::Io(_) | GenError::Json(_) | GenError::Internal(_) => ErrorClass::Unknown,
        }
    }

    /// True when the retry controller may attempt this operation again.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Map an HTTP status plus response body to the right error variant.
    ///
    /// Shared by the vendor clients so classification stays uniform:
    /// 429/502/503/504 are capacity, 401/403 are auth, 400/413 are
    /// validation unless the body names exhausted credits.
    pub fn from_http_status(provider: &str, status: u16, message: String) -> GenError {
        let lowered = message.to_ascii_lowercase();
        match status {
            429 | 502 | 503 | 504 => GenError::Capacity {
                message: format!("{} returned {}: {}", provider, status, message),
                retry_after: None,
            },
            401 | 403 => GenError::Auth {
                provider: provider.to_string(),
                message,
            },
            400 | 413 => {
                // Runway phrases this "You do not have enough credits".
                if lowered.contains("not enough credit")
                    || lowered.contains("enough credits")
                    || lowered.contains("insufficient credit")
                {
                    GenError::InsufficientCredits {
                        provider: provider.to_string(),
                    }
                } else {
                    GenError::Validation(format!("{} rejected request: {}", provider, message))
                }
            }
            _ => GenError::Api { status, message },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_and_download_errors_are_transient() {
        let err = GenError::Capacity {
            message: "503".to_string(),
            retry_after: None,
        };
        assert_eq!(err.class(), ErrorClass::Transient);
        assert!(err.is_retryable());

        let err = GenError::Download("connection reset".to_string());
        assert_eq!(err.class(), ErrorClass::Transient);
    }

    #[test]
    fn auth_validation_and_credits_are_fatal() {
        let err = GenError::Auth {
            provider: "runway".to_string(),
            message: "bad key".to_string(),
        };
        assert_eq!(err.class(), ErrorClass::Fatal);

        let err = GenError::Validation("prompt empty".to_string());
        assert_eq!(err.class(), ErrorClass::Fatal);

        let err = GenError::InsufficientCredits {
            provider: "runway".to_string(),
        };
        assert_eq!(err.class(), ErrorClass::Fatal);
        assert!(!err.is_retryable());
    }

    #[test]
    fn internal_errors_are_unknown() {
        let err = GenError::Internal("unexpected response shape".to_string());
        assert_eq!(err.class(), ErrorClass::Unknown);
    }

    #[test]
    fn http_status_mapping() {
        assert!(matches!(
            GenError::from_http_status("runway", 429, "rate limit".to_string()),
            GenError::Capacity { .. }
        ));
        assert!(matches!(
            GenError::from_http_status("runway", 503, "busy".to_string()),
            GenError::Capacity { .. }
        ));
        assert!(matches!(
            GenError::from_http_status("runway", 401, "invalid key".to_string()),
            GenError::Auth { .. }
        ));
        assert!(matches!(
            GenError::from_http_status("runway", 400, "bad prompt".to_string()),
            GenError::Validation(_)
        ));
        assert!(matches!(
            GenError::from_http_status("runway", 500, "boom".to_string()),
            GenError::Api { status: 500, .. }
        ));
    }

    #[test]
    fn http_400_with_credit_keywords_is_insufficient_credits() {
        let err =
            GenError::from_http_status("runway", 400, "Not enough credits remaining".to_string());
        assert!(matches!(err, GenError::InsufficientCredits { .. }));

        // Runway's actual wording
        let err = GenError::from_http_status(
            "runway",
            400,
            "You do not have enough credits".to_string(),
        );
        assert!(matches!(err, GenError::InsufficientCredits { .. }));

        let err =
            GenError::from_http_status("veo", 400, "Insufficient credits for request".to_string());
        assert!(matches!(err, GenError::InsufficientCredits { .. }));
    }

    #[test]
    fn retry_exhausted_preserves_last_error() {
        let err = GenError::RetryExhausted {
            attempts: 5,
            last: Box::new(GenError::Capacity {
                message: "503".to_string(),
                retry_after: None,
            }),
        };
        assert!(err.to_string().contains("5 attempts"));
        assert!(err.to_string().contains("503"));
    }
}
