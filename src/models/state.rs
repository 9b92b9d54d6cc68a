use crate::error::ErrorReport;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Lifecycle phase of one model
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    NotDownloaded,
    Downloading,
    Verifying,
    Extracting,
    Ready,
    Failed,
    Cancelled,
    Deleting,
}

impl Phase {
    /// Whether an operation currently owns the model
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(
            self,
            Self::Downloading | Self::Verifying | Self::Extracting | Self::Cancelled | Self::Deleting
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotDownloaded => "not downloaded",
            Self::Downloading => "downloading",
            Self::Verifying => "verifying",
            Self::Extracting => "extracting",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Cancelled => "cancelling",
            Self::Deleting => "deleting",
        };
        f.write_str(name)
    }
}

/// Snapshot of a model's download state
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DownloadState {
    pub id: String,
    pub phase: Phase,
    pub bytes_downloaded: u64,
    pub bytes_total: u64,
    pub last_error: Option<ErrorReport>,
    pub staging_path: PathBuf,
    pub cancel_requested: bool,
    /// RFC 3339 timestamp of the last transition
    pub updated_at: String,
}

impl DownloadState {
    #[must_use]
    pub fn new(id: &str, bytes_total: u64, staging_path: PathBuf) -> Self {
        Self {
            id: id.to_string(),
            phase: Phase::NotDownloaded,
            bytes_downloaded: 0,
            bytes_total,
            last_error: None,
            staging_path,
            cancel_requested: false,
            updated_at: now(),
        }
    }

    /// Move to `phase`, stamping the transition time
    pub fn transition(&mut self, phase: Phase) {
        self.phase = phase;
        self.updated_at = now();
    }
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Lifecycle notifications broadcast to subscribers
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ModelEvent {
    Progress {
        id: String,
        bytes_downloaded: u64,
        bytes_total: u64,
    },
    PhaseChanged {
        id: String,
        phase: Phase,
    },
    Ready {
        id: String,
    },
    Failed {
        id: String,
        error: ErrorReport,
    },
    Cancelled {
        id: String,
    },
    Deleted {
        id: String,
    },
}

impl ModelEvent {
    /// Model the event refers to
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Progress { id, .. }
            | Self::PhaseChanged { id, .. }
            | Self::Ready { id }
            | Self::Failed { id, .. }
            | Self::Cancelled { id }
            | Self::Deleted { id } => id,
        }
    }
}

/// What a download request did
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RequestOutcome {
    /// A new operation was started
    Started,
    /// An operation for this id was already running
    InFlight,
    /// The model is already ready; nothing was fetched
    AlreadyReady,
}
