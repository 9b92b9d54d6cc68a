use crate::config::DownloadConfig;
use crate::error::{FetchError, FetchErrorKind, ModelError, Result};
use futures_util::StreamExt;
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::{Response, StatusCode};
use std::path::Path;
use std::time::Duration;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

/// Streams model bytes from the content host into a staging file
#[derive(Debug, Clone)]
pub struct ContentFetcher {
    client: reqwest::Client,
    read_timeout: Duration,
    min_free_bytes: u64,
}

impl ContentFetcher {
    /// Build the HTTP client with explicit connect timeout.
    ///
    /// No total request timeout is set: large models legitimately take a long
    /// time, so stalls are caught per read instead.
    pub fn new(config: &DownloadConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(|e| ModelError::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            read_timeout: config.read_timeout(),
            min_free_bytes: config.min_free_space_mb * 1_024 * 1_024,
        })
    }

    /// Override the per-read timeout (for testing)
    #[must_use]
    pub const fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    /// Fetch `url` into `destination` until it holds exactly `expected_size` bytes.
    ///
    /// With `resume`, an existing shorter file is continued with a range
    /// request; servers that answer with a full body restart from zero.
    /// `progress` receives `(bytes_downloaded, bytes_total)` once per chunk.
    /// On failure the partial file is left in place.
    pub async fn fetch<F>(
        &self,
        url: &str,
        destination: &Path,
        expected_size: u64,
        resume: bool,
        cancel: &CancellationToken,
        mut progress: F,
    ) -> std::result::Result<u64, FetchError>
    where
        F: FnMut(u64, u64) + Send,
    {
        let mut offset = if resume {
            existing_len(destination).await
        } else {
            0
        };

        if offset > expected_size {
            tracing::warn!(
                "Partial file {} is larger than expected ({offset} > {expected_size}), restarting",
                destination.display()
            );
            offset = 0;
        }

        if offset == expected_size {
            tracing::debug!("{} already holds all bytes", destination.display());
            progress(offset, expected_size);
            return Ok(offset);
        }

        if let Some(dir) = destination.parent() {
            check_disk_space(dir, expected_size - offset + self.min_free_bytes, offset)?;
        }

        let (response, offset) = self.open(url, offset, cancel).await?;

        if let Some(len) = response.content_length() {
            if offset + len != expected_size {
                return Err(FetchError::new(
                    FetchErrorKind::SizeMismatch,
                    offset,
                    format!(
                        "server declares {} bytes from offset {offset}, manifest expects {expected_size}",
                        len
                    ),
                ));
            }
        }

        let mut file = if offset > 0 {
            OpenOptions::new().append(true).open(destination).await
        } else {
            File::create(destination).await
        }
        .map_err(|e| {
            FetchError::new(
                FetchErrorKind::Io,
                offset,
                format!("failed to open {}: {e}", destination.display()),
            )
        })?;

        progress(offset, expected_size);
        let result = self
            .stream_body(response, &mut file, offset, expected_size, cancel, &mut progress)
            .await;

        // Persist whatever arrived so a later resume sees the real prefix
        let synced = async {
            file.flush().await?;
            file.sync_all().await
        }
        .await;

        let downloaded = result?;
        synced.map_err(|e| {
            FetchError::new(
                FetchErrorKind::Io,
                downloaded,
                format!("failed to sync {}: {e}", destination.display()),
            )
        })?;

        Ok(downloaded)
    }

    /// Send the request, falling back to a full download when the range is refused
    async fn open(
        &self,
        url: &str,
        offset: u64,
        cancel: &CancellationToken,
    ) -> std::result::Result<(Response, u64), FetchError> {
        let response = self.send(url, offset, cancel).await?;
        let status = response.status();

        if offset > 0 {
            match status {
                StatusCode::PARTIAL_CONTENT => {
                    let start = response
                        .headers()
                        .get(CONTENT_RANGE)
                        .and_then(|v| v.to_str().ok())
                        .and_then(content_range_start);
                    if start == Some(offset) {
                        tracing::debug!("Resuming {url} from byte {offset}");
                        return Ok((response, offset));
                    }
                    tracing::warn!("Unexpected Content-Range {start:?} for offset {offset}, restarting");
                }
                StatusCode::OK => {
                    tracing::info!("Server ignored range request for {url}, restarting from zero");
                    return Ok((response, 0));
                }
                StatusCode::RANGE_NOT_SATISFIABLE => {
                    tracing::info!("Range {offset}- not satisfiable for {url}, restarting from zero");
                }
                other => {
                    return Err(FetchError::new(
                        FetchErrorKind::Http(other.as_u16()),
                        offset,
                        format!("HTTP {other} for {url}"),
                    ))
                }
            }
            let response = self.send(url, 0, cancel).await?;
            return check_status(response, url, offset).map(|r| (r, 0));
        }

        check_status(response, url, offset).map(|r| (r, 0))
    }

    async fn send(
        &self,
        url: &str,
        offset: u64,
        cancel: &CancellationToken,
    ) -> std::result::Result<Response, FetchError> {
        let mut request = self.client.get(url);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(cancelled(offset)),
            sent = tokio::time::timeout(self.read_timeout, request.send()) => match sent {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(e)) => Err(classify(&e, offset, url)),
                Err(_) => Err(FetchError::new(
                    FetchErrorKind::Timeout,
                    offset,
                    format!("no response from {url} within {:?}", self.read_timeout),
                )),
            },
        }
    }

    async fn stream_body<F>(
        &self,
        response: Response,
        file: &mut File,
        offset: u64,
        expected_size: u64,
        cancel: &CancellationToken,
        progress: &mut F,
    ) -> std::result::Result<u64, FetchError>
    where
        F: FnMut(u64, u64) + Send,
    {
        let mut downloaded = offset;
        let mut stream = response.bytes_stream();

        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(cancelled(downloaded)),
                next = tokio::time::timeout(self.read_timeout, stream.next()) => next,
            };

            let chunk = match next {
                Ok(Some(Ok(chunk))) => chunk,
                Ok(Some(Err(e))) => return Err(classify(&e, downloaded, "response body")),
                Ok(None) => break,
                Err(_) => {
                    return Err(FetchError::new(
                        FetchErrorKind::Timeout,
                        downloaded,
                        format!("transfer stalled for {:?}", self.read_timeout),
                    ))
                }
            };

            if downloaded + chunk.len() as u64 > expected_size {
                return Err(FetchError::new(
                    FetchErrorKind::SizeMismatch,
                    downloaded,
                    format!("server sent more than the expected {expected_size} bytes"),
                ));
            }

            file.write_all(&chunk).await.map_err(|e| {
                FetchError::new(FetchErrorKind::Io, downloaded, format!("write failed: {e}"))
            })?;
            downloaded += chunk.len() as u64;
            progress(downloaded, expected_size);
        }

        if downloaded < expected_size {
            return Err(FetchError::new(
                FetchErrorKind::Network,
                downloaded,
                format!("transfer ended early at {downloaded} of {expected_size} bytes"),
            ));
        }

        Ok(downloaded)
    }
}

fn check_status(
    response: Response,
    url: &str,
    offset: u64,
) -> std::result::Result<Response, FetchError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(FetchError::new(
            FetchErrorKind::Http(status.as_u16()),
            offset,
            format!("HTTP {status} for {url}"),
        ))
    }
}

fn classify(error: &reqwest::Error, bytes: u64, what: &str) -> FetchError {
    let kind = if error.is_timeout() {
        FetchErrorKind::Timeout
    } else {
        FetchErrorKind::Network
    };
    FetchError::new(kind, bytes, format!("failed to request {what}: {error}"))
}

fn cancelled(bytes: u64) -> FetchError {
    FetchError::new(FetchErrorKind::Cancelled, bytes, "download cancelled")
}

async fn existing_len(path: &Path) -> u64 {
    fs::metadata(path).await.map_or(0, |m| m.len())
}

/// Parse the first byte position out of `bytes <start>-<end>/<total>`
fn content_range_start(value: &str) -> Option<u64> {
    value
        .strip_prefix("bytes ")?
        .split('-')
        .next()?
        .trim()
        .parse()
        .ok()
}

/// Check if enough disk space is available
fn check_disk_space(dir: &Path, required_bytes: u64, staged: u64) -> std::result::Result<(), FetchError> {
    let stats = nix::sys::statvfs::statvfs(dir).map_err(|e| {
        FetchError::new(
            FetchErrorKind::Io,
            staged,
            format!("Failed to check disk space: {e}"),
        )
    })?;

    #[allow(clippy::useless_conversion)]
    let available_bytes = u64::from(stats.blocks_available()) * u64::from(stats.fragment_size());

    if available_bytes < required_bytes {
        return Err(FetchError::new(
            FetchErrorKind::InsufficientSpace,
            staged,
            format!(
                "Not enough disk space: {} required, {} available",
                format_bytes(required_bytes),
                format_bytes(available_bytes)
            ),
        ));
    }

    Ok(())
}

/// Format bytes as human-readable string
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}
