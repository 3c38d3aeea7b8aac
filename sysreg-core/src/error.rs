use thiserror::Error;

#[derive(Error, Debug)]
pub enum SysregError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Connection error to {uri}: {details}")]
    Connection { uri: String, details: String },

    #[error("VM operation '{operation}' failed: {details}")]
    VmOperationFailed { operation: String, details: String },

    #[error("Invalid operation '{operation}': {reason}")]
    InvalidOperation { operation: String, reason: String },

    #[error("Resource not found: {resource}")]
    NotFound { resource: String },

    #[error("Console error: {message}")]
    Console { message: String },

    #[error("Domain description error: {message}")]
    DomainDescription { message: String },

    #[error("Hook command '{command}' failed: {details}")]
    HookFailed { command: String, details: String },

    #[error("Tool '{tool}' failed: {details}")]
    ToolFailed { tool: String, details: String },

    #[error("Operation timed out: {operation} after {duration:?}")]
    Timeout {
        operation: String,
        duration: std::time::Duration,
    },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

pub type SysregResult<T> = std::result::Result<T, SysregError>;

impl SysregError {
    pub fn vm_operation(operation: &str, details: impl Into<String>) -> Self {
        SysregError::VmOperationFailed {
            operation: operation.to_string(),
            details: details.into(),
        }
    }

    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        SysregError::Validation {
            field: field.to_string(),
            message: message.into(),
        }
    }

    /// Whether this error must stop the whole run.
    ///
    /// Every error the run loop sees is fatal; observation timeouts never
    /// surface as errors, they come back as a `Continue` verdict instead.
    /// `Timeout` is kept non-fatal for callers that retry a single
    /// management command.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SysregError::Timeout { .. })
    }
}
