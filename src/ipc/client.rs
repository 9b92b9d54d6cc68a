use crate::error::{ModelError, Result};
use crate::ipc::{Command, Response};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

/// IPC client for sending commands to daemon
pub struct IpcClient {
    socket_path: PathBuf,
}

impl IpcClient {
    /// Create new IPC client
    pub fn new() -> Result<Self> {
        let socket_path = super::socket_path()?;
        Ok(Self { socket_path })
    }

    /// Create client with custom socket path (for testing)
    #[must_use]
    pub const fn with_socket_path(socket_path: PathBuf) -> Self {
        Self { socket_path }
    }

    /// Send command to daemon and receive response
    pub async fn send_command(&self, cmd: &Command) -> Result<Response> {
        let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            ModelError::Ipc(format!(
                "Could not connect to daemon at {}. Is it running? Error: {e}",
                self.socket_path.display()
            ))
        })?;
        let (reader, mut writer) = stream.into_split();

        // Serialize and send command
        let mut cmd_bytes = serde_json::to_vec(cmd)
            .map_err(|e| ModelError::Ipc(format!("Failed to serialize command: {e}")))?;
        cmd_bytes.push(b'\n');

        writer
            .write_all(&cmd_bytes)
            .await
            .map_err(|e| ModelError::Ipc(format!("Failed to send command: {e}")))?;

        // Read response line
        let line = BufReader::new(reader)
            .lines()
            .next_line()
            .await
            .map_err(|e| ModelError::Ipc(format!("Failed to read response: {e}")))?
            .ok_or_else(|| ModelError::Ipc("Connection closed before response".to_string()))?;

        let response: Response = serde_json::from_str(&line)
            .map_err(|e| ModelError::Ipc(format!("Invalid response: {e}")))?;

        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_wire_format() {
        let json = serde_json::to_string(&Command::Download("small".into())).unwrap();
        assert_eq!(json, r#"{"Download":"small"}"#);
        let json = serde_json::to_string(&Command::List).unwrap();
        assert_eq!(json, r#""List""#);
    }

    #[tokio::test]
    async fn test_connect_failure_is_ipc_error() {
        let temp_dir = tempfile::tempdir().unwrap();
        let client = IpcClient::with_socket_path(temp_dir.path().join("missing.sock"));
        let err = client.send_command(&Command::List).await.unwrap_err();
        assert!(matches!(err, ModelError::Ipc(_)));
    }
}
