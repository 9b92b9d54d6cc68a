use crate::error::{ModelError, Result};
use crate::ipc::{Command, Response};
use crate::models::ModelManager;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::oneshot;

/// Unix socket IPC server exposing a [`ModelManager`]
pub struct IpcServer {
    socket_path: PathBuf,
    manager: ModelManager,
    ready_tx: Option<oneshot::Sender<()>>,
}

impl IpcServer {
    /// Create new IPC server at the default socket path
    pub fn new(manager: ModelManager) -> Result<Self> {
        let socket_path = super::socket_path()?;
        Ok(Self {
            socket_path,
            manager,
            ready_tx: None,
        })
    }

    /// Set ready signal channel (for testing)
    #[must_use]
    pub fn with_ready_signal(mut self, ready_tx: oneshot::Sender<()>) -> Self {
        self.ready_tx = Some(ready_tx);
        self
    }

    /// Override socket path (for testing)
    #[must_use]
    pub fn with_socket_path(mut self, socket_path: PathBuf) -> Self {
        self.socket_path = socket_path;
        self
    }

    /// Start IPC server
    ///
    /// Binds to Unix socket and handles incoming connections.
    /// Runs until error or the task is dropped.
    pub async fn start(mut self) -> Result<()> {
        // Remove old socket if exists
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)
                .map_err(|e| ModelError::Ipc(format!("Failed to remove old socket: {e}")))?;
        }

        let listener = UnixListener::bind(&self.socket_path).map_err(|e| {
            ModelError::Ipc(format!(
                "Failed to bind socket at {}: {e}",
                self.socket_path.display()
            ))
        })?;

        tracing::info!("IPC server listening on {:?}", self.socket_path);

        // Signal ready if channel provided (for testing)
        if let Some(ready_tx) = self.ready_tx.take() {
            ready_tx.send(()).ok();
        }

        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let manager = self.manager.clone();
                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_client(stream, manager).await {
                            tracing::error!("Client handler error: {e}");
                        }
                    });
                }
                Err(e) => {
                    tracing::error!("Failed to accept connection: {e}");
                }
            }
        }
    }

    /// Serve commands from one client until it hangs up
    async fn handle_client(stream: UnixStream, manager: ModelManager) -> Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| ModelError::Ipc(format!("Failed to read from client: {e}")))?
        {
            if line.trim().is_empty() {
                continue;
            }

            let response = match serde_json::from_str::<Command>(&line) {
                Ok(cmd) => {
                    tracing::debug!("Received command: {:?}", cmd);
                    Self::dispatch(&manager, cmd).await
                }
                Err(e) => Response::Error(ModelError::Ipc(format!("Invalid command: {e}")).report()),
            };

            let mut response_bytes = serde_json::to_vec(&response)
                .map_err(|e| ModelError::Ipc(format!("Failed to serialize response: {e}")))?;
            response_bytes.push(b'\n');

            writer
                .write_all(&response_bytes)
                .await
                .map_err(|e| ModelError::Ipc(format!("Failed to write response: {e}")))?;
        }

        Ok(())
    }

    async fn dispatch(manager: &ModelManager, cmd: Command) -> Response {
        let result = match cmd {
            Command::Download(id) => manager.request_download(&id).map(Response::Started),
            Command::Cancel(id) => manager.cancel_download(&id).map(|()| Response::Ok),
            Command::Delete(id) => manager.delete_model(&id).await.map(|()| Response::Ok),
            Command::Status(id) => manager.query_status(&id).map(Response::Status),
            Command::List => Ok(Response::Models(manager.list())),
        };

        result.unwrap_or_else(|e| {
            tracing::debug!("Command failed: {e}");
            Response::Error(e.report())
        })
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }
    }
}
