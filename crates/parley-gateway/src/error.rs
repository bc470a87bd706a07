use thiserror::Error;

use parley_types::frames::ServerFrame;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    #[error("invalid username or password")]
    InvalidCredentials,
    #[error("token is invalid or expired")]
    TokenInvalid,
}

/// Every way a single command can fail. None of these are fatal to the
/// server; the dispatcher turns them into a frame for the originating
/// connection and carries on.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("not authenticated")]
    NotAuthenticated,

    #[error("already authenticated")]
    AlreadyAuthenticated,

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    PermissionDenied(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("message has been deleted")]
    AlreadyDeleted,

    #[error("upload is missing {} chunk(s)", missing.len())]
    IncompleteUpload { missing: Vec<u32> },

    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

pub type GatewayResult<T> = Result<T, GatewayError>;

impl GatewayError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Auth(AuthError::InvalidCredentials) => "INVALID_CREDENTIALS",
            Self::Auth(AuthError::TokenInvalid) => "TOKEN_INVALID",
            Self::NotAuthenticated => "NOT_AUTHENTICATED",
            Self::AlreadyAuthenticated => "ALREADY_AUTHENTICATED",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::PermissionDenied(_) => "PERMISSION_DENIED",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::AlreadyDeleted => "ALREADY_DELETED",
            Self::IncompleteUpload { .. } => "INCOMPLETE_UPLOAD",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn to_frame(&self) -> ServerFrame {
        match self {
            Self::IncompleteUpload { missing } => {
                let preview: Vec<String> = missing.iter().take(16).map(u32::to_string).collect();
                ServerFrame::error(
                    self.code(),
                    format!("{} (missing: {})", self, preview.join(",")),
                )
            }
            _ => ServerFrame::error(self.code(), self.to_string()),
        }
    }
}

pub(crate) fn validation(msg: impl Into<String>) -> GatewayError {
    GatewayError::Validation(msg.into())
}

pub(crate) fn denied(msg: impl Into<String>) -> GatewayError {
    GatewayError::PermissionDenied(msg.into())
}

pub(crate) fn not_found(msg: impl Into<String>) -> GatewayError {
    GatewayError::NotFound(msg.into())
}

pub(crate) fn conflict(msg: impl Into<String>) -> GatewayError {
    GatewayError::Conflict(msg.into())
}
