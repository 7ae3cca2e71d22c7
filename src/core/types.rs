use serde::{Deserialize, Serialize};

/// Error category enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCategory {
    ConfigurationError,
    ActionFailure,
    SandboxError,
    ArtifactError,
    TimeoutError,
    IoError,
    SerializationError,
    InternalError,
}

impl ErrorCategory {
    /// Configuration errors abort the run; everything else is contained by the job.
    pub fn is_fatal(self) -> bool {
        matches!(self, ErrorCategory::ConfigurationError)
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Error severity enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Fatal,
    Error,
    Warning,
}
