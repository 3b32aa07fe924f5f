use std::fmt;

/// Convenient result alias for updater operations.
pub type Result<T> = std::result::Result<T, UpdaterError>;

/// Errors that can occur while performing an update.
#[derive(thiserror::Error, Debug)]
pub enum UpdaterError {
    /// HTTP request to the resource server failed.
    #[error("resource fetch failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The server answered with a non-success status.
    #[error("resource server returned status {0}")]
    Status(u16),
    /// No progress was made within the per-transfer timeout.
    #[error("transfer stalled for longer than the allowed timeout")]
    Timeout,
    /// The manifest document could not be decoded from JSON.
    #[error("manifest decoding failed: {0}")]
    ManifestDecode(#[from] serde_json::Error),
    /// The manifest lists the same path twice.
    #[error("manifest lists path more than once: {0}")]
    DuplicatePath(String),
    /// The downloaded file hash did not match the manifest.
    #[error("file integrity check failed (expected {expected}, got {actual})")]
    IntegrityMismatch {
        /// Expected SHA-256 digest.
        expected: String,
        /// Actual SHA-256 digest.
        actual: String,
    },
    /// A resource URL could not be built.
    #[error("invalid resource URL: {0}")]
    InvalidUrl(String),
    /// Failed to perform an I/O operation.
    #[error("filesystem operation failed: {0}")]
    Io(#[from] std::io::Error),
    /// Generic error.
    #[error("{0}")]
    Other(String),
}

impl UpdaterError {
    /// Helper for wrapping validation failures.
    pub fn validation(msg: impl Into<String>) -> Self {
        UpdaterError::Other(msg.into())
    }

    /// HTTP status carried by this error, if the server produced one.
    pub fn status(&self) -> Option<u16> {
        match self {
            UpdaterError::Status(code) => Some(*code),
            UpdaterError::Http(err) => err.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

/// Stage of the update cycle that failed, as reported to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateErrorKind {
    /// The version descriptor could not be fetched or parsed.
    NoGetVersion,
    /// The remote manifest could not be fetched or parsed.
    NoGetFileList,
    /// A resource file could not be downloaded.
    FileDown,
}

impl fmt::Display for UpdateErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UpdateErrorKind::NoGetVersion => "no-get-version",
            UpdateErrorKind::NoGetFileList => "no-get-file-list",
            UpdateErrorKind::FileDown => "file-down",
        };
        f.write_str(name)
    }
}

/// Failure notification delivered to the host once per failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateFailure {
    pub kind: UpdateErrorKind,
    /// Transport status code, when the server answered at all.
    pub status: Option<u16>,
    pub message: String,
}

impl fmt::Display for UpdateFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} (status {}): {}", self.kind, status, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}
