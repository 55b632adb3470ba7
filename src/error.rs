use std::fmt;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error("Unsupported source: {0}")]
    UnsupportedSource(String),
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },
    #[error("Source error: {0}")]
    Source(String),
    #[error("Transfer failed: {0}")]
    Transfer(String),
    #[error("Remote command `{command}` failed: {stderr}")]
    RemoteCommand { command: String, stderr: String },
    #[error("Checksum mismatch for {file}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        file: String,
        expected: String,
        actual: String,
    },
    #[error("Disk conversion failed: {0}")]
    Conversion(String),
    #[error("Envelope parse error: {0}")]
    Envelope(String),
    #[error("Platform error: {0}")]
    Platform(String),
    #[error("Cleanup failed: {0}")]
    Cleanup(ErrorList),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerdeError(String),
}

impl ImportError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        ImportError::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Errors that will not go away by retrying the same request.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ImportError::Validation(_) | ImportError::UnsupportedSource(_)
        )
    }
}

impl From<toml::de::Error> for ImportError {
    fn from(err: toml::de::Error) -> Self {
        ImportError::SerdeError(err.to_string())
    }
}

impl From<serde_json::Error> for ImportError {
    fn from(err: serde_json::Error) -> Self {
        ImportError::SerdeError(err.to_string())
    }
}

impl From<reqwest::Error> for ImportError {
    fn from(err: reqwest::Error) -> Self {
        ImportError::Transfer(err.to_string())
    }
}

impl From<russh::Error> for ImportError {
    fn from(err: russh::Error) -> Self {
        ImportError::Transfer(format!("ssh: {}", err))
    }
}

impl From<quick_xml::Error> for ImportError {
    fn from(err: quick_xml::Error) -> Self {
        ImportError::Envelope(err.to_string())
    }
}

/// Collects independent failures from best-effort operations.
///
/// Every step is attempted; the list is only turned into an error at the end.
#[derive(Debug, Default)]
pub struct ErrorList {
    errors: Vec<String>,
}

impl ErrorList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, context: &str, err: impl fmt::Display) {
        self.errors.push(format!("{}: {}", context, err));
    }

    /// Record the error of `result`, if any, and keep going.
    pub fn record<T, E: fmt::Display>(&mut self, context: &str, result: std::result::Result<T, E>) {
        if let Err(err) = result {
            self.push(context, err);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn into_result(self) -> crate::Result<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(ImportError::Cleanup(self))
        }
    }
}

impl fmt::Display for ErrorList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.errors.join("; "))
    }
}
