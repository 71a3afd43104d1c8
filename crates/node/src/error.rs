use models::ErrorCode;

/// Outcome classification of a failed fetch or processing attempt.
///
/// Retryable errors reschedule the pending message with backoff until
/// `max_retries`; rejections are terminal and recorded in
/// `rejected_messages`.
#[derive(Debug, thiserror::Error)]
pub enum MessageProcessingError {
    #[error("invalid message format: {0}")]
    InvalidFormat(String),

    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("invalid content: {0}")]
    InvalidContent(String),

    /// The content could not be fetched from any source right now.
    #[error("content currently unavailable: {0}")]
    ContentUnavailable(String),

    #[error("file unavailable: {0}")]
    FileUnavailable(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("insufficient balance: required {required}, available {available}")]
    BalanceInsufficient { required: String, available: String },

    /// A dependency check failed with a type-specific error code.
    #[error("{details}")]
    Dependency { code: ErrorCode, details: String },

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl MessageProcessingError {
    /// Transient failures are retried; everything else rejects the message
    /// immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MessageProcessingError::ContentUnavailable(_)
                | MessageProcessingError::FileUnavailable(_)
                | MessageProcessingError::Database(_)
                | MessageProcessingError::Internal(_)
        )
    }

    pub fn error_code(&self) -> ErrorCode {
        match self {
            MessageProcessingError::InvalidFormat(_) => ErrorCode::InvalidFormat,
            MessageProcessingError::InvalidSignature(_) => ErrorCode::InvalidSignature,
            MessageProcessingError::InvalidContent(_) => ErrorCode::InvalidFormat,
            MessageProcessingError::ContentUnavailable(_) => ErrorCode::ContentUnavailable,
            MessageProcessingError::FileUnavailable(_) => ErrorCode::FileUnavailable,
            MessageProcessingError::PermissionDenied(_) => ErrorCode::PermissionDenied,
            MessageProcessingError::BalanceInsufficient { .. } => ErrorCode::BalanceInsufficient,
            MessageProcessingError::Dependency { code, .. } => *code,
            MessageProcessingError::Database(_) | MessageProcessingError::Internal(_) => {
                ErrorCode::InternalError
            }
        }
    }

    /// A traceback is only recorded for internal errors; user-caused
    /// rejections carry their message in `details` instead.
    pub fn traceback(&self) -> Option<String> {
        match self {
            MessageProcessingError::Database(err) => Some(format!("{err:?}")),
            MessageProcessingError::Internal(err) => Some(format!("{err:?}")),
            _ => None,
        }
    }
}

impl From<models::message::AdmissionError> for MessageProcessingError {
    fn from(err: models::message::AdmissionError) -> Self {
        MessageProcessingError::InvalidFormat(err.to_string())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn transient_errors_are_retryable() {
        assert!(MessageProcessingError::ContentUnavailable("x".into()).is_retryable());
        assert!(MessageProcessingError::Internal(anyhow::anyhow!("boom")).is_retryable());
        assert!(!MessageProcessingError::InvalidSignature("x".into()).is_retryable());
        assert!(!MessageProcessingError::PermissionDenied("x".into()).is_retryable());
    }

    #[test]
    fn dependency_errors_keep_their_code() {
        let err = MessageProcessingError::Dependency {
            code: ErrorCode::VmVolumeNotFound,
            details: "volume not found".into(),
        };
        assert_eq!(err.error_code(), ErrorCode::VmVolumeNotFound);
        assert!(err.traceback().is_none());
    }
}
