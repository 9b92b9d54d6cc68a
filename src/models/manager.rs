use crate::config::{Config, DownloadConfig};
use crate::error::{ExtractError, ModelError, Result, VerifyError};
use crate::models::download::ContentFetcher;
use crate::models::extract::{self, ExtractPlan};
use crate::models::layout::{remove_path, ResourceLayout};
use crate::models::manifest::{DigestTable, ModelEntry};
use crate::models::state::{DownloadState, ModelEvent, Phase, RequestOutcome};
use crate::models::verify;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, Semaphore};
use tokio_util::sync::CancellationToken;

/// Buffered events per subscriber before it starts lagging
const EVENT_CAPACITY: usize = 256;

/// Owns the per-model lifecycle: download, verify, extract, promote, delete.
///
/// Cloning is cheap; all clones share the same state table.
#[derive(Clone)]
pub struct ModelManager {
    inner: Arc<Inner>,
}

struct Inner {
    table: DigestTable,
    layout: ResourceLayout,
    fetcher: ContentFetcher,
    slots: Mutex<HashMap<String, Slot>>,
    permits: Semaphore,
    events: broadcast::Sender<ModelEvent>,
}

struct Slot {
    state: DownloadState,
    cancel: Option<CancellationToken>,
}

impl ModelManager {
    /// Load the manifest and resource directory named by `config`
    pub fn new(config: &Config) -> Result<Self> {
        let table = DigestTable::load(&config.manifest_path()?)?;
        let layout = ResourceLayout::new(config.resource_dir()?);
        Self::with_parts(table, layout, &config.download)
    }

    /// Build a manager from an already loaded table.
    ///
    /// Leftovers from a previous process are discarded and every model whose
    /// finished artifact is present starts out `Ready`.
    pub fn with_parts(
        table: DigestTable,
        layout: ResourceLayout,
        download: &DownloadConfig,
    ) -> Result<Self> {
        if download.max_concurrent == 0 {
            return Err(ModelError::Config(
                "download.max_concurrent must be at least 1".into(),
            ));
        }

        layout.ensure()?;
        let swept = layout.sweep_orphans()?;
        if swept > 0 {
            tracing::info!("Discarded {swept} leftover staging entries");
        }

        let fetcher = ContentFetcher::new(download)?;

        let mut slots = HashMap::with_capacity(table.len());
        for entry in table.iter() {
            let mut state =
                DownloadState::new(&entry.id, entry.size_bytes, layout.partial_path(entry));
            if layout.is_installed(entry) {
                state.phase = Phase::Ready;
                state.bytes_downloaded = entry.size_bytes;
            }
            slots.insert(entry.id.clone(), Slot { state, cancel: None });
        }

        tracing::info!(
            "Model manager ready: {} models, resource dir {}",
            table.len(),
            layout.root().display()
        );

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            inner: Arc::new(Inner {
                table,
                layout,
                fetcher,
                slots: Mutex::new(slots),
                permits: Semaphore::new(download.max_concurrent),
                events,
            }),
        })
    }

    /// Start downloading `id` unless it is ready or already in flight.
    ///
    /// Must be called from within a Tokio runtime; the operation runs as a
    /// spawned task and reports through [`ModelManager::subscribe`].
    pub fn request_download(&self, id: &str) -> Result<RequestOutcome> {
        let entry = self.inner.table.lookup(id)?.clone();

        let token = {
            let mut slots = self.inner.slots();
            let slot = self.inner.slot(&mut slots, &entry);
            match slot.state.phase {
                Phase::Ready => return Ok(RequestOutcome::AlreadyReady),
                Phase::Deleting => {
                    return Err(ModelError::InvalidState {
                        id: entry.id,
                        phase: slot.state.phase.to_string(),
                        action: "download",
                    })
                }
                phase if phase.is_active() => return Ok(RequestOutcome::InFlight),
                _ => {}
            }

            let token = CancellationToken::new();
            slot.cancel = Some(token.clone());
            slot.state.cancel_requested = false;
            slot.state.last_error = None;
            slot.state.bytes_downloaded = 0;
            slot.state.transition(Phase::Downloading);
            token
        };

        tracing::info!("Starting download of model '{id}'");
        self.inner.emit(ModelEvent::PhaseChanged {
            id: entry.id.clone(),
            phase: Phase::Downloading,
        });

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let result = inner.execute(&entry, &token).await;
            inner.finish(&entry, result);
        });

        Ok(RequestOutcome::Started)
    }

    /// Ask the running operation for `id` to stop.
    ///
    /// Cleanup happens in the background; the model returns to
    /// `NotDownloaded` and a `Cancelled` event follows.
    pub fn cancel_download(&self, id: &str) -> Result<()> {
        let entry = self.inner.table.lookup(id)?;
        let mut slots = self.inner.slots();
        let slot = self.inner.slot(&mut slots, entry);

        match (slot.state.phase, slot.cancel.as_ref()) {
            (Phase::Cancelled, _) => Ok(()),
            (Phase::Downloading | Phase::Verifying | Phase::Extracting, Some(token)) => {
                tracing::info!("Cancelling model '{id}' during {}", slot.state.phase);
                token.cancel();
                slot.state.cancel_requested = true;
                slot.state.transition(Phase::Cancelled);
                Ok(())
            }
            (phase, _) => Err(ModelError::InvalidState {
                id: id.to_string(),
                phase: phase.to_string(),
                action: "cancel",
            }),
        }
    }

    /// Remove a ready or failed model's files and return it to `NotDownloaded`
    pub async fn delete_model(&self, id: &str) -> Result<()> {
        let entry = self.inner.table.lookup(id)?.clone();
        {
            let mut slots = self.inner.slots();
            let slot = self.inner.slot(&mut slots, &entry);
            if !matches!(slot.state.phase, Phase::Ready | Phase::Failed) {
                return Err(ModelError::InvalidState {
                    id: entry.id,
                    phase: slot.state.phase.to_string(),
                    action: "delete",
                });
            }
            slot.state.transition(Phase::Deleting);
        }
        self.inner.emit(ModelEvent::PhaseChanged {
            id: entry.id.clone(),
            phase: Phase::Deleting,
        });

        let layout = self.inner.layout.clone();
        let target = entry.clone();
        let removed = tokio::task::spawn_blocking(move || remove_artifacts(&layout, &target))
            .await
            .map_err(|e| ModelError::Io(std::io::Error::other(e)))
            .and_then(|r| r.map_err(ModelError::from));

        let mut slots = self.inner.slots();
        let slot = self.inner.slot(&mut slots, &entry);
        if let Err(e) = removed {
            tracing::error!("Failed to delete model '{id}': {e}");
            slot.state.last_error = Some(e.report());
            slot.state.transition(Phase::Failed);
            return Err(e);
        }

        slot.state.bytes_downloaded = 0;
        slot.state.last_error = None;
        slot.state.transition(Phase::NotDownloaded);
        drop(slots);

        tracing::info!("Deleted model '{id}'");
        self.inner.emit(ModelEvent::Deleted { id: entry.id });
        Ok(())
    }

    /// Snapshot of one model's state
    pub fn query_status(&self, id: &str) -> Result<DownloadState> {
        let entry = self.inner.table.lookup(id)?;
        let mut slots = self.inner.slots();
        Ok(self.inner.slot(&mut slots, entry).state.clone())
    }

    /// Snapshots of every catalog model, in manifest order
    #[must_use]
    pub fn list(&self) -> Vec<DownloadState> {
        let mut slots = self.inner.slots();
        self.inner
            .table
            .iter()
            .map(|entry| self.inner.slot(&mut slots, entry).state.clone())
            .collect()
    }

    /// Path a consumer may load, only once the model is ready
    pub fn model_path(&self, id: &str) -> Result<Option<PathBuf>> {
        let entry = self.inner.table.lookup(id)?;
        let mut slots = self.inner.slots();
        let ready = self.inner.slot(&mut slots, entry).state.phase == Phase::Ready;
        Ok(ready.then(|| self.inner.layout.final_path(entry)))
    }

    /// Catalog entry for `id`
    pub fn entry(&self, id: &str) -> Result<&ModelEntry> {
        self.inner.table.lookup(id)
    }

    /// Subscribe to progress and lifecycle events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ModelEvent> {
        self.inner.events.subscribe()
    }

    /// Wait until `id` is no longer owned by a running operation
    pub async fn wait(&self, id: &str) -> Result<DownloadState> {
        let mut events = self.subscribe();
        loop {
            let state = self.query_status(id)?;
            if !state.phase.is_active() {
                return Ok(state);
            }
            match events.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return Ok(state),
            }
        }
    }

    /// Request `id` and wait for the outcome, returning the ready path
    pub async fn download(&self, id: &str) -> Result<PathBuf> {
        self.request_download(id)?;
        let state = self.wait(id).await?;
        match state.phase {
            Phase::Ready => Ok(self.inner.layout.final_path(self.entry(id)?)),
            _ => match state.last_error {
                Some(report) => Err(ModelError::Failed {
                    id: id.to_string(),
                    report,
                }),
                None => Err(ModelError::Cancelled(id.to_string())),
            },
        }
    }

    /// Re-hash a ready model's files against the manifest
    pub async fn verify_installed(&self, id: &str) -> Result<()> {
        let entry = self.inner.table.lookup(id)?.clone();
        let state = self.query_status(id)?;
        if state.phase != Phase::Ready {
            return Err(ModelError::InvalidState {
                id: entry.id,
                phase: state.phase.to_string(),
                action: "verify",
            });
        }

        let path = self.inner.layout.final_path(&entry);
        tokio::task::spawn_blocking(move || -> Result<()> {
            if !entry.archive {
                return verify::verify(&path, &entry).map_err(ModelError::from);
            }
            for member in entry.members() {
                verify::verify_member(&path.join(&member.path), member).map_err(|source| {
                    ExtractError::MemberMismatch {
                        member: member.path.clone(),
                        source,
                    }
                })?;
            }
            Ok(())
        })
        .await
        .map_err(|e| ModelError::Io(std::io::Error::other(e)))?
    }
}

impl Inner {
    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot<'a>(
        &self,
        slots: &'a mut HashMap<String, Slot>,
        entry: &ModelEntry,
    ) -> &'a mut Slot {
        slots.entry(entry.id.clone()).or_insert_with(|| Slot {
            state: DownloadState::new(
                &entry.id,
                entry.size_bytes,
                self.layout.partial_path(entry),
            ),
            cancel: None,
        })
    }

    fn emit(&self, event: ModelEvent) {
        // No subscribers is fine
        self.events.send(event).ok();
    }

    fn set_phase(&self, entry: &ModelEntry, phase: Phase) {
        {
            let mut slots = self.slots();
            let slot = self.slot(&mut slots, entry);
            if slot.state.phase == Phase::Cancelled {
                return;
            }
            slot.state.transition(phase);
        }
        tracing::info!("Model '{}' is {phase}", entry.id);
        self.emit(ModelEvent::PhaseChanged {
            id: entry.id.clone(),
            phase,
        });
    }

    fn progress(&self, entry: &ModelEntry, bytes_downloaded: u64, bytes_total: u64) {
        {
            let mut slots = self.slots();
            self.slot(&mut slots, entry).state.bytes_downloaded = bytes_downloaded;
        }
        self.emit(ModelEvent::Progress {
            id: entry.id.clone(),
            bytes_downloaded,
            bytes_total,
        });
    }

    /// Fetch, verify and promote one model
    async fn execute(&self, entry: &ModelEntry, cancel: &CancellationToken) -> Result<()> {
        let cancelled = || ModelError::Cancelled(entry.id.clone());

        let _permit = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(cancelled()),
            permit = self.permits.acquire() => permit.map_err(|_| cancelled())?,
        };

        let partial = self.layout.partial_path(entry);
        tracing::debug!("Fetching {} into {}", entry.url, partial.display());
        self.fetcher
            .fetch(&entry.url, &partial, entry.size_bytes, true, cancel, |done, total| {
                self.progress(entry, done, total);
            })
            .await?;

        if cancel.is_cancelled() {
            return Err(cancelled());
        }
        self.set_phase(entry, Phase::Verifying);
        verify::verify_blocking(partial.clone(), entry.clone()).await?;

        if cancel.is_cancelled() {
            return Err(cancelled());
        }

        if entry.archive {
            self.set_phase(entry, Phase::Extracting);
            let layout = self.layout.clone();
            let target = entry.clone();
            let token = cancel.clone();
            let archive = partial.clone();
            tokio::task::spawn_blocking(move || {
                let temp_dir = layout.extraction_path(&target);
                let final_dir = layout.final_path(&target);
                let plan = ExtractPlan {
                    members: target.members(),
                    strip_components: target.strip_components,
                    temp_dir: &temp_dir,
                    final_dir: &final_dir,
                };
                extract::extract(&archive, &plan, &token)
            })
            .await
            .map_err(|e| ExtractError::io("extraction task failed", std::io::Error::other(e)))??;

            if let Err(e) = remove_path(&partial) {
                tracing::warn!("Failed to remove staged archive {}: {e}", partial.display());
            }
        } else {
            let final_path = self.layout.final_path(entry);
            tokio::fs::rename(&partial, &final_path).await.map_err(|source| {
                VerifyError::Io {
                    path: final_path.clone(),
                    source,
                }
            })?;
        }

        Ok(())
    }

    /// Record the outcome of [`Inner::execute`] and clean up after failures.
    ///
    /// A failure that lands after a cancel request is treated as the cancel.
    fn finish(&self, entry: &ModelEntry, result: Result<()>) {
        let cancel_requested = {
            let mut slots = self.slots();
            self.slot(&mut slots, entry).state.cancel_requested
        };

        let event = match result {
            Ok(()) => {
                if cancel_requested {
                    tracing::info!("Model '{}' finished before the cancel took effect", entry.id);
                }
                tracing::info!("Model '{}' is ready", entry.id);
                self.update(entry, |state| {
                    state.bytes_downloaded = state.bytes_total;
                    state.last_error = None;
                    state.cancel_requested = false;
                    state.transition(Phase::Ready);
                });
                ModelEvent::Ready {
                    id: entry.id.clone(),
                }
            }
            Err(e) if cancel_requested || e.is_cancelled() => {
                self.discard_staging(entry);
                tracing::info!("Download of model '{}' cancelled", entry.id);
                if !e.is_cancelled() {
                    tracing::debug!("Ignoring error after cancel of '{}': {e}", entry.id);
                }
                self.update(entry, |state| {
                    state.bytes_downloaded = 0;
                    state.cancel_requested = false;
                    state.transition(Phase::NotDownloaded);
                });
                ModelEvent::Cancelled {
                    id: entry.id.clone(),
                }
            }
            Err(e) => {
                let kept = match &e {
                    ModelError::Fetch(fetch) if fetch.keeps_partial() => Some(fetch.bytes_downloaded),
                    _ => None,
                };
                if kept.is_none() {
                    self.discard_staging(entry);
                }
                tracing::error!("Model '{}' failed: {e}", entry.id);

                let report = e.report();
                self.update(entry, |state| {
                    state.bytes_downloaded = kept.unwrap_or(0);
                    state.last_error = Some(report.clone());
                    state.transition(Phase::Failed);
                });
                ModelEvent::Failed {
                    id: entry.id.clone(),
                    error: report,
                }
            }
        };
        self.emit(event);
    }

    fn update(&self, entry: &ModelEntry, apply: impl FnOnce(&mut DownloadState)) {
        let mut slots = self.slots();
        let slot = self.slot(&mut slots, entry);
        slot.cancel = None;
        apply(&mut slot.state);
    }

    fn discard_staging(&self, entry: &ModelEntry) {
        for path in [
            self.layout.partial_path(entry),
            self.layout.extraction_path(entry),
        ] {
            if let Err(e) = remove_path(&path) {
                tracing::warn!("Failed to remove {}: {e}", path.display());
            }
        }
    }
}

/// Take the finished artifact out of the finished area, then remove it
fn remove_artifacts(layout: &ResourceLayout, entry: &ModelEntry) -> std::io::Result<()> {
    let final_path = layout.final_path(entry);
    let trash = layout.trash_path(entry);

    remove_path(&trash)?;
    match std::fs::rename(&final_path, &trash) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    if let Err(e) = remove_path(&trash) {
        // Swept on next start
        tracing::warn!("Failed to remove {}: {e}", trash.display());
    }
    remove_path(&layout.partial_path(entry))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorCode, FetchError, FetchErrorKind};
    use crate::models::manifest::ArchiveMember;
    use std::fs;
    use tempfile::TempDir;

    fn single(id: &str, size: u64) -> ModelEntry {
        ModelEntry {
            id: id.into(),
            name: id.to_uppercase(),
            description: String::new(),
            url: format!("http://127.0.0.1:9/{id}.bin"),
            filename: format!("{id}.bin"),
            archive: false,
            size_bytes: size,
            sha256: "1be3a9b2".repeat(8),
            strip_components: 0,
            members: None,
        }
    }

    fn archive(id: &str) -> ModelEntry {
        ModelEntry {
            archive: true,
            filename: format!("{id}-model"),
            members: Some(vec![ArchiveMember {
                path: "encoder.onnx".into(),
                size_bytes: 3,
                sha256: "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad".into(),
            }]),
            ..single(id, 10)
        }
    }

    fn manager(root: &TempDir, entries: Vec<ModelEntry>) -> ModelManager {
        let table = DigestTable::from_entries(entries).unwrap();
        let download = DownloadConfig {
            min_free_space_mb: 0,
            ..DownloadConfig::default()
        };
        ModelManager::with_parts(table, ResourceLayout::new(root.path()), &download).unwrap()
    }

    #[test]
    fn test_initial_states() {
        let temp_dir = TempDir::new().unwrap();
        let layout = ResourceLayout::new(temp_dir.path());
        layout.ensure().unwrap();
        fs::write(layout.final_path(&single("small", 4)), b"abcd").unwrap();

        let manager = manager(&temp_dir, vec![single("small", 4), single("base", 8)]);
        let states = manager.list();

        assert_eq!(states.len(), 2);
        assert_eq!(states[0].id, "small");
        assert_eq!(states[0].phase, Phase::Ready);
        assert_eq!(states[0].bytes_downloaded, 4);
        assert_eq!(states[1].phase, Phase::NotDownloaded);
    }

    #[test]
    fn test_startup_discards_orphaned_partial() {
        let temp_dir = TempDir::new().unwrap();
        let layout = ResourceLayout::new(temp_dir.path());
        layout.ensure().unwrap();
        let entry = single("small", 4);
        fs::write(layout.partial_path(&entry), b"ab").unwrap();

        let manager = manager(&temp_dir, vec![entry.clone()]);
        assert!(!layout.partial_path(&entry).exists());
        assert_eq!(
            manager.query_status("small").unwrap().phase,
            Phase::NotDownloaded
        );
    }

    #[test]
    fn test_unknown_model_rejected_with_suggestion() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir, vec![single("small", 4)]);

        let err = manager.request_download("smal").unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnknownModel);
        assert!(err.to_string().contains("Did you mean 'small'"));
        assert!(manager.query_status("smal").is_err());
    }

    #[tokio::test]
    async fn test_ready_model_request_is_noop() {
        let temp_dir = TempDir::new().unwrap();
        let layout = ResourceLayout::new(temp_dir.path());
        layout.ensure().unwrap();
        fs::write(layout.final_path(&single("small", 4)), b"abcd").unwrap();

        let manager = manager(&temp_dir, vec![single("small", 4)]);
        assert_eq!(
            manager.request_download("small").unwrap(),
            RequestOutcome::AlreadyReady
        );
        assert_eq!(
            manager.model_path("small").unwrap(),
            Some(layout.final_path(&single("small", 4)))
        );
    }

    #[test]
    fn test_model_path_hidden_until_ready() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir, vec![single("small", 4)]);
        assert_eq!(manager.model_path("small").unwrap(), None);
    }

    #[test]
    fn test_cancel_without_operation_is_invalid() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir, vec![single("small", 4)]);

        let err = manager.cancel_download("small").unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidState);
    }

    #[tokio::test]
    async fn test_delete_not_downloaded_is_invalid() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir, vec![single("small", 4)]);

        let err = manager.delete_model("small").await.unwrap_err();
        assert!(matches!(err, ModelError::InvalidState { action: "delete", .. }));
    }

    #[tokio::test]
    async fn test_delete_ready_archive_removes_tree() {
        let temp_dir = TempDir::new().unwrap();
        let layout = ResourceLayout::new(temp_dir.path());
        layout.ensure().unwrap();
        let entry = archive("parakeet");
        fs::create_dir_all(layout.final_path(&entry)).unwrap();
        fs::write(layout.final_path(&entry).join("encoder.onnx"), b"abc").unwrap();

        let manager = manager(&temp_dir, vec![entry.clone()]);
        let mut events = manager.subscribe();
        manager.verify_installed("parakeet").await.unwrap();
        manager.delete_model("parakeet").await.unwrap();

        assert!(!layout.final_path(&entry).exists());
        assert!(!layout.trash_path(&entry).exists());
        assert_eq!(
            manager.query_status("parakeet").unwrap().phase,
            Phase::NotDownloaded
        );
        assert_eq!(
            events.recv().await.unwrap(),
            ModelEvent::PhaseChanged {
                id: "parakeet".into(),
                phase: Phase::Deleting
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            ModelEvent::Deleted {
                id: "parakeet".into()
            }
        );
    }

    #[tokio::test]
    async fn test_verify_installed_detects_tampering() {
        let temp_dir = TempDir::new().unwrap();
        let layout = ResourceLayout::new(temp_dir.path());
        layout.ensure().unwrap();
        let entry = archive("parakeet");
        fs::create_dir_all(layout.final_path(&entry)).unwrap();
        fs::write(layout.final_path(&entry).join("encoder.onnx"), b"abd").unwrap();

        let manager = manager(&temp_dir, vec![entry]);
        let err = manager.verify_installed("parakeet").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::MemberMismatch);
    }

    #[tokio::test]
    async fn test_verify_requires_ready() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir, vec![single("small", 4)]);
        let err = manager.verify_installed("small").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidState);
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let table = DigestTable::from_entries(vec![single("small", 4)]).unwrap();
        let download = DownloadConfig {
            max_concurrent: 0,
            min_free_space_mb: 0,
            ..DownloadConfig::default()
        };

        let result = ModelManager::with_parts(table, ResourceLayout::new(temp_dir.path()), &download);
        match result {
            Err(e) => assert_eq!(e.code(), ErrorCode::ConfigError),
            Ok(_) => panic!("Expected a config error for max_concurrent = 0"),
        }
    }

    /// Put `id` into the state `cancel_download` leaves behind mid-operation
    fn mark_cancelled(manager: &ModelManager, entry: &ModelEntry) {
        let mut slots = manager.inner.slots();
        let slot = manager.inner.slot(&mut slots, entry);
        slot.cancel = Some(CancellationToken::new());
        slot.state.cancel_requested = true;
        slot.state.transition(Phase::Cancelled);
    }

    #[tokio::test]
    async fn test_network_error_after_cancel_ends_not_downloaded() {
        let temp_dir = TempDir::new().unwrap();
        let entry = single("small", 4);
        let manager = manager(&temp_dir, vec![entry.clone()]);
        let layout = ResourceLayout::new(temp_dir.path());
        fs::write(layout.partial_path(&entry), b"ab").unwrap();

        let mut events = manager.subscribe();
        mark_cancelled(&manager, &entry);
        let error = FetchError::new(FetchErrorKind::Network, 2, "connection reset");
        assert!(error.keeps_partial());
        manager.inner.finish(&entry, Err(ModelError::Fetch(error)));

        let state = manager.query_status("small").unwrap();
        assert_eq!(state.phase, Phase::NotDownloaded);
        assert_eq!(state.bytes_downloaded, 0);
        assert!(!state.cancel_requested);
        assert!(state.last_error.is_none());
        assert!(!layout.partial_path(&entry).exists());
        assert_eq!(
            events.recv().await.unwrap(),
            ModelEvent::Cancelled {
                id: "small".into()
            }
        );
    }

    #[tokio::test]
    async fn test_completion_after_cancel_clears_flag() {
        let temp_dir = TempDir::new().unwrap();
        let entry = single("small", 4);
        let manager = manager(&temp_dir, vec![entry.clone()]);

        let mut events = manager.subscribe();
        mark_cancelled(&manager, &entry);
        manager.inner.finish(&entry, Ok(()));

        let state = manager.query_status("small").unwrap();
        assert_eq!(state.phase, Phase::Ready);
        assert!(!state.cancel_requested);
        assert_eq!(state.bytes_downloaded, 4);
        assert_eq!(
            events.recv().await.unwrap(),
            ModelEvent::Ready {
                id: "small".into()
            }
        );
    }
}
