use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Nydus conversion error types
#[derive(Error, Debug)]
pub enum ConvertError {
    /// Named segment is absent from a nydus formatted tar stream
    #[error("Segment not found: {name}")]
    SegmentNotFound { name: String },

    /// Malformed nydus formatted tar stream
    #[error("Invalid nydus tar format at offset {offset}: {reason}")]
    InvalidFormat { offset: u64, reason: String },

    /// Builder exited with a non-zero status
    #[error("Builder {op} failed with exit code {code}")]
    BuilderFailed { op: String, code: i32 },

    /// Builder was terminated by a signal it did not ask for
    #[error("Builder {op} killed by signal {signal}")]
    BuilderKilled { op: String, signal: i32 },

    /// Builder exceeded its deadline and was killed
    #[error("Builder {op} timed out after {timeout:?}")]
    BuilderTimeout { op: String, timeout: Duration },

    /// Builder result file is missing or malformed
    #[error("Invalid builder output {}: {reason}", path.display())]
    BuilderOutput { path: PathBuf, reason: String },

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Content missing from the content store
    #[error("Content not found: {digest}")]
    NotFound { digest: String },

    /// Content already committed to the content store
    #[error("Content already exists: {digest}")]
    AlreadyExists { digest: String },

    /// Content store error
    #[error("Content store error: {0}")]
    ContentError(String),

    /// Manifest, index or config has an unexpected shape
    #[error("Manifest error: {0}")]
    ManifestError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Remote storage backend error
    #[error("Backend error: {0}")]
    BackendError(String),

    /// Operation not available on this platform
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Background task panicked or was cancelled
    #[error("Task error: {0}")]
    TaskError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Error annotated with the operation that produced it
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<ConvertError>,
    },
}

impl ConvertError {
    /// Wrap this error with an operation description.
    pub fn context(self, context: impl Into<String>) -> Self {
        ConvertError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, with all context layers peeled off.
    pub fn root(&self) -> &ConvertError {
        let mut err = self;
        while let ConvertError::Context { source, .. } = err {
            err = source;
        }
        err
    }

    /// Whether the root cause is a builder deadline expiry.
    pub fn is_timeout(&self) -> bool {
        matches!(self.root(), ConvertError::BuilderTimeout { .. })
    }

    pub fn is_not_found(&self) -> bool {
        match self.root() {
            ConvertError::NotFound { .. } | ConvertError::SegmentNotFound { .. } => true,
            ConvertError::IoError(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self.root(), ConvertError::AlreadyExists { .. })
    }

    /// Whether the root cause is a format error of a framed stream.
    pub fn is_format(&self) -> bool {
        matches!(
            self.root(),
            ConvertError::SegmentNotFound { .. } | ConvertError::InvalidFormat { .. }
        )
    }
}

impl From<serde_json::Error> for ConvertError {
    fn from(err: serde_json::Error) -> Self {
        ConvertError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for ConvertError {
    fn from(err: serde_yaml::Error) -> Self {
        ConvertError::SerializationError(err.to_string())
    }
}

/// Result type alias for conversion operations
pub type Result<T> = std::result::Result<T, ConvertError>;

/// Attach operation context to any error convertible into [`ConvertError`].
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;

    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: Into<ConvertError>,
{
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| Into::<ConvertError>::into(e).context(context))
    }

    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C,
    {
        self.map_err(|e| Into::<ConvertError>::into(e).context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_not_found_display() {
        let error = ConvertError::SegmentNotFound {
            name: "image.boot".to_string(),
        };
        assert_eq!(error.to_string(), "Segment not found: image.boot");
    }

    #[test]
    fn test_invalid_format_display() {
        let error = ConvertError::InvalidFormat {
            offset: 1024,
            reason: "declared size exceeds stream".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Invalid nydus tar format at offset 1024: declared size exceeds stream"
        );
    }

    #[test]
    fn test_builder_timeout_display() {
        let error = ConvertError::BuilderTimeout {
            op: "merge".to_string(),
            timeout: Duration::from_secs(3),
        };
        assert_eq!(error.to_string(), "Builder merge timed out after 3s");
    }

    #[test]
    fn test_builder_output_display() {
        let error = ConvertError::BuilderOutput {
            path: PathBuf::from("/tmp/output.json"),
            reason: "missing".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Invalid builder output /tmp/output.json: missing"
        );
    }

    #[test]
    fn test_context_display_chains_messages() {
        let error = ConvertError::ManifestError("no layers".to_string())
            .context("rewrite manifest sha256:abc");
        assert_eq!(
            error.to_string(),
            "rewrite manifest sha256:abc: Manifest error: no layers"
        );
    }

    #[test]
    fn test_root_peels_all_context_layers() {
        let error = ConvertError::BuilderTimeout {
            op: "create".to_string(),
            timeout: Duration::from_millis(10),
        }
        .context("pack")
        .context("convert layer");
        assert!(error.is_timeout());
        assert!(matches!(error.root(), ConvertError::BuilderTimeout { .. }));
    }

    #[test]
    fn test_failed_exit_is_not_timeout() {
        let error = ConvertError::BuilderFailed {
            op: "create".to_string(),
            code: 1,
        };
        assert!(!error.is_timeout());
        let killed = ConvertError::BuilderKilled {
            op: "create".to_string(),
            signal: 9,
        };
        assert!(!killed.is_timeout());
    }

    #[test]
    fn test_not_found_classification() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(ConvertError::from(io).context("open").is_not_found());
        assert!(ConvertError::NotFound {
            digest: "sha256:00".to_string()
        }
        .is_not_found());
        assert!(!ConvertError::ManifestError("x".to_string()).is_not_found());
    }

    #[test]
    fn test_format_classification() {
        let error = ConvertError::SegmentNotFound {
            name: "image.blob".to_string(),
        }
        .context("unpack");
        assert!(error.is_format());
        assert!(!ConvertError::TaskError("x".to_string()).is_format());
    }

    #[test]
    fn test_result_ext_wraps_io_error() {
        let result: std::result::Result<(), std::io::Error> = Err(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "denied",
        ));
        let err = result.context("create work directory").unwrap_err();
        assert!(err.to_string().starts_with("create work directory: I/O error"));
        assert!(matches!(err.root(), ConvertError::IoError(_)));
    }

    #[test]
    fn test_with_context_is_lazy() {
        let ok: std::result::Result<u8, ConvertError> = Ok(1);
        let value = ok
            .with_context(|| -> String { panic!("must not be evaluated") })
            .unwrap();
        assert_eq!(value, 1);
    }

    #[test]
    fn test_serde_json_error_conversion() {
        let result: std::result::Result<serde_json::Value, _> = serde_json::from_str("{ invalid");
        let error: ConvertError = result.unwrap_err().into();
        assert!(matches!(error, ConvertError::SerializationError(_)));
    }

    #[test]
    fn test_already_exists_classification() {
        let error = ConvertError::AlreadyExists {
            digest: "sha256:11".to_string(),
        }
        .context("commit");
        assert!(error.is_already_exists());
    }
}
