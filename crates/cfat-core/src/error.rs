use thiserror::Error;

pub type CfatResult<T> = Result<T, CfatError>;

#[derive(Debug, Error)]
pub enum CfatError {
    /// The acting user lacks the read, write or admin right the operation needs.
    #[error("permission denied: {op} on {target}")]
    PermissionDenied { op: &'static str, target: String },

    /// Structurally invalid request (unknown id, wrong entry type, duplicate name, ...).
    #[error("illegal operation: {op} on {target}: {reason}")]
    IllegalOperation {
        op: &'static str,
        target: String,
        reason: String,
    },

    /// Unknown user name or wrong password. Never says which.
    #[error("authentication failed")]
    AuthenticationFailure,

    /// Tag mismatch while decrypting, or a malformed/mismatched metadata record.
    #[error("corrupt data: {0}")]
    CorruptData(String),

    #[error("backend error: {0}")]
    Backend(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),
}

impl CfatError {
    pub fn denied(op: &'static str, target: impl std::fmt::Display) -> Self {
        CfatError::PermissionDenied {
            op,
            target: target.to_string(),
        }
    }

    pub fn illegal(
        op: &'static str,
        target: impl std::fmt::Display,
        reason: impl Into<String>,
    ) -> Self {
        CfatError::IllegalOperation {
            op,
            target: target.to_string(),
            reason: reason.into(),
        }
    }

    pub fn is_permission_denied(&self) -> bool {
        matches!(self, CfatError::PermissionDenied { .. })
    }

    pub fn is_illegal(&self) -> bool {
        matches!(self, CfatError::IllegalOperation { .. })
    }

    pub fn is_corrupt(&self) -> bool {
        matches!(self, CfatError::CorruptData(_))
    }
}
