use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for modelvault
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Manifest error: {0}\n\nTroubleshooting:\n- Check the manifest file: <resource_dir>/manifest.json\n- Every archive entry needs a members list\n- Digests must be 64 hex characters (sha256)")]
    Manifest(#[from] ManifestError),

    #[error("Unknown model '{id}'{}", .suggestion.as_ref().map(|s| format!(". Did you mean '{s}'?")).unwrap_or_default())]
    UnknownModel {
        id: String,
        suggestion: Option<String>,
    },

    #[error("Cannot {action} model '{id}' while it is {phase}")]
    InvalidState {
        id: String,
        phase: String,
        action: &'static str,
    },

    #[error("Download failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("Verification failed: {0}")]
    Verify(#[from] VerifyError),

    #[error("Extraction failed: {0}")]
    Extract(#[from] ExtractError),

    #[error("Operation on model '{0}' was cancelled")]
    Cancelled(String),

    /// Terminal failure recorded by a background operation
    #[error("Model '{id}' failed: {}", .report.describe())]
    Failed { id: String, report: ErrorReport },

    #[error("Config error: {0}\n\nTroubleshooting:\n- Check config file: ~/.config/modelvault/config.toml\n- Timeouts and max_concurrent must be greater than zero\n- Run with RUST_LOG=debug for more details")]
    Config(String),

    #[error("IPC error: {0}\n\nTroubleshooting:\n- Is the daemon running? Start with: modelvault daemon\n- Check socket path: $XDG_RUNTIME_DIR/modelvault.sock")]
    Ipc(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Problems with the digest manifest, fatal at startup
#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("failed to read manifest at {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse manifest: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("duplicate model id '{0}'")]
    DuplicateId(String),

    #[error("models '{first}' and '{second}' share filename '{filename}'")]
    DuplicateFilename {
        first: String,
        second: String,
        filename: String,
    },

    #[error("archive model '{0}' has no members")]
    MissingMembers(String),

    #[error("model '{0}' is not an archive but lists members")]
    UnexpectedMembers(String),

    #[error("model '{id}' lists invalid member path '{path}'")]
    InvalidMemberPath { id: String, path: String },

    #[error("model '{id}' lists member '{path}' more than once")]
    DuplicateMember { id: String, path: String },

    #[error("model '{id}' has invalid sha256 digest '{digest}'")]
    InvalidDigest { id: String, digest: String },

    #[error("model '{0}' contains a placeholder sha256 digest")]
    PlaceholderDigest(String),

    #[error("model '{0}' declares zero size")]
    ZeroSize(String),

    #[error("model '{id}' has invalid field '{field}'")]
    InvalidField { id: String, field: &'static str },
}

/// What went wrong while fetching
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    Timeout,
    Network,
    Http(u16),
    SizeMismatch,
    InsufficientSpace,
    Io,
    Cancelled,
}

/// Content fetch failure, with the number of bytes present in the partial file
#[derive(Error, Debug)]
#[error("{detail} ({bytes_downloaded} bytes staged)")]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub bytes_downloaded: u64,
    pub detail: String,
}

impl FetchError {
    pub fn new(kind: FetchErrorKind, bytes_downloaded: u64, detail: impl Into<String>) -> Self {
        Self {
            kind,
            bytes_downloaded,
            detail: detail.into(),
        }
    }

    /// Whether the staged bytes are still a usable prefix for a later resume
    #[must_use]
    pub const fn keeps_partial(&self) -> bool {
        matches!(
            self.kind,
            FetchErrorKind::Timeout
                | FetchErrorKind::Network
                | FetchErrorKind::Http(_)
                | FetchErrorKind::Io
                | FetchErrorKind::InsufficientSpace
        )
    }
}

/// Integrity check failures
#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("size mismatch for {}: expected {expected} bytes, got {actual}", .path.display())]
    SizeMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    #[error("hash mismatch for {}: expected {expected}, got {actual}", .path.display())]
    DigestMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("unable to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Archive extraction failures. Any of these discards all extracted output.
#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("archive entry escapes the extraction root: {0}")]
    PathTraversal(String),

    #[error("archive entry {entry} has unsupported type {kind}")]
    UnsupportedEntryType { entry: String, kind: String },

    #[error("archive member {member} failed verification: {source}")]
    MemberMismatch {
        member: String,
        #[source]
        source: VerifyError,
    },

    #[error("archive member {0} is listed in the manifest but missing from the archive")]
    MissingMember(String),

    #[error("archive entry {0} is not listed in the manifest")]
    UnexpectedMember(String),

    #[error("archive entry {0} appears more than once")]
    DuplicateEntry(String),

    #[error("extraction cancelled")]
    Cancelled,

    #[error("{context}: {source}")]
    Io {
        context: String,
        source: std::io::Error,
    },
}

impl ExtractError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Stable machine-readable error codes exposed to the request surface
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    ManifestError,
    UnknownModel,
    InvalidState,
    Timeout,
    NetworkError,
    SizeMismatch,
    InsufficientSpace,
    ChecksumMismatch,
    PathTraversal,
    UnsupportedEntryType,
    MemberMismatch,
    Cancelled,
    IoError,
    ConfigError,
    IpcError,
}

/// Structured failure as seen by the UI layer
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ErrorReport {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ModelError {
    /// Classify into a stable error code
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Manifest(_) => ErrorCode::ManifestError,
            Self::UnknownModel { .. } => ErrorCode::UnknownModel,
            Self::InvalidState { .. } => ErrorCode::InvalidState,
            Self::Fetch(e) => match e.kind {
                FetchErrorKind::Timeout => ErrorCode::Timeout,
                FetchErrorKind::Network | FetchErrorKind::Http(_) => ErrorCode::NetworkError,
                FetchErrorKind::SizeMismatch => ErrorCode::SizeMismatch,
                FetchErrorKind::InsufficientSpace => ErrorCode::InsufficientSpace,
                FetchErrorKind::Io => ErrorCode::IoError,
                FetchErrorKind::Cancelled => ErrorCode::Cancelled,
            },
            Self::Verify(e) => match e {
                VerifyError::SizeMismatch { .. } => ErrorCode::SizeMismatch,
                VerifyError::DigestMismatch { .. } => ErrorCode::ChecksumMismatch,
                VerifyError::Io { .. } => ErrorCode::IoError,
            },
            Self::Extract(e) => match e {
                ExtractError::PathTraversal(_) => ErrorCode::PathTraversal,
                ExtractError::UnsupportedEntryType { .. } => ErrorCode::UnsupportedEntryType,
                ExtractError::MemberMismatch { .. }
                | ExtractError::MissingMember(_)
                | ExtractError::UnexpectedMember(_)
                | ExtractError::DuplicateEntry(_) => ErrorCode::MemberMismatch,
                ExtractError::Cancelled => ErrorCode::Cancelled,
                ExtractError::Io { .. } => ErrorCode::IoError,
            },
            Self::Cancelled(_) => ErrorCode::Cancelled,
            Self::Failed { report, .. } => report.code,
            Self::Config(_) => ErrorCode::ConfigError,
            Self::Ipc(_) => ErrorCode::IpcError,
            Self::Io(_) => ErrorCode::IoError,
        }
    }

    /// Whether this failure came from a cancellation request
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self.code(), ErrorCode::Cancelled)
    }

    /// Build the report sent over the request surface
    #[must_use]
    pub fn report(&self) -> ErrorReport {
        if let Self::Failed { report, .. } = self {
            return report.clone();
        }

        let message = match self.code() {
            ErrorCode::ManifestError => "Model manifest is invalid.",
            ErrorCode::UnknownModel => "No such model in the catalog.",
            ErrorCode::InvalidState => "Request does not apply to the model's current state.",
            ErrorCode::Timeout => "Model download stalled and timed out. Please retry.",
            ErrorCode::NetworkError => {
                "Network request for the model failed. Please retry or check connectivity."
            }
            ErrorCode::SizeMismatch => "Downloaded model size did not match the expected value.",
            ErrorCode::InsufficientSpace => "Not enough disk space for the model.",
            ErrorCode::ChecksumMismatch => "Downloaded model failed checksum verification.",
            ErrorCode::PathTraversal | ErrorCode::UnsupportedEntryType => {
                "Model archive failed safety checks during extraction."
            }
            ErrorCode::MemberMismatch => "Extracted model files did not match the manifest.",
            ErrorCode::Cancelled => "Model download was cancelled.",
            ErrorCode::IoError => "A filesystem operation failed.",
            ErrorCode::ConfigError => "Configuration is invalid.",
            ErrorCode::IpcError => "Could not reach the model daemon.",
        };

        ErrorReport {
            code: self.code(),
            message: message.to_string(),
            detail: Some(self.to_string()),
        }
    }
}

impl ErrorReport {
    /// Most specific human-readable text available
    #[must_use]
    pub fn describe(&self) -> &str {
        self.detail.as_deref().unwrap_or(&self.message)
    }
}

pub type Result<T> = std::result::Result<T, ModelError>;
