pub mod client;
pub mod server;

use crate::error::{ErrorReport, ModelError, Result};
use crate::models::{DownloadState, RequestOutcome};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// IPC Commands, one JSON document per line
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Download(String),
    Cancel(String),
    Delete(String),
    Status(String),
    List,
}

/// IPC Responses
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ok,
    Started(RequestOutcome),
    Status(DownloadState),
    Models(Vec<DownloadState>),
    Error(ErrorReport),
}

/// Get socket path from `XDG_RUNTIME_DIR`
pub fn socket_path() -> Result<PathBuf> {
    let runtime_dir = std::env::var("XDG_RUNTIME_DIR")
        .or_else(|_| -> std::result::Result<String, std::env::VarError> {
            #[cfg(target_os = "linux")]
            {
                let uid = nix::unistd::getuid();
                Ok(format!("/run/user/{uid}"))
            }
            #[cfg(not(target_os = "linux"))]
            {
                Err(std::env::VarError::NotPresent)
            }
        })
        .map_err(|_| ModelError::Ipc("XDG_RUNTIME_DIR not set".to_string()))?;

    Ok(PathBuf::from(runtime_dir).join("modelvault.sock"))
}
