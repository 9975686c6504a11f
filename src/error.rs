use axum::{
    Json,
    extract::multipart::{MultipartError, MultipartRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use log::{error, warn};

use crate::correlation::InvalidId;
use crate::envelope::Envelope;
use crate::upload::UploadError;

/// Everything a relay endpoint can fail with
///
/// The `Display` text is what the caller sees. Diagnostic detail carried by
/// the processing variants is logged and never sent back.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error("{message}")]
    Multipart { status: StatusCode, message: String },

    #[error("Invalid file ID")]
    InvalidId(#[from] InvalidId),

    #[error("{0}")]
    NotFound(String),

    /// The processor or backend ran and failed; the detail is logged only
    #[error("Failed to process file with backend")]
    Processing(String),

    /// The backend could not be reached at all
    #[error("Backend service unavailable")]
    Unreachable(String),

    #[error("Failed to process file")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Internal(String),
}

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::Upload(_) | RelayError::InvalidId(_) => StatusCode::BAD_REQUEST,
            RelayError::Multipart { status, .. } => *status,
            RelayError::NotFound(_) => StatusCode::NOT_FOUND,
            RelayError::Unreachable(_) => StatusCode::BAD_GATEWAY,
            RelayError::Processing(_) | RelayError::Io(_) | RelayError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<MultipartError> for RelayError {
    fn from(err: MultipartError) -> Self {
        RelayError::Multipart {
            status: err.status(),
            message: err.body_text(),
        }
    }
}

impl From<MultipartRejection> for RelayError {
    fn from(rejection: MultipartRejection) -> Self {
        RelayError::Multipart {
            status: rejection.status(),
            message: rejection.body_text(),
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status();
        match &self {
            RelayError::Processing(detail) => error!("Processing failed: {}", detail),
            RelayError::Unreachable(detail) => error!("Backend unreachable: {}", detail),
            RelayError::Io(e) => error!("I/O error while relaying: {}", e),
            RelayError::Internal(msg) => error!("Internal relay error: {}", msg),
            other => warn!("Rejected request ({}): {}", status.as_u16(), other),
        }
        (status, Json(Envelope::error(self.to_string()))).into_response()
    }
}
