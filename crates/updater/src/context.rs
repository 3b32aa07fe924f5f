//! State shared by the update state handlers.

use crate::config::UpdaterConfig;
use crate::error::{Result, UpdateErrorKind, UpdateFailure, UpdaterError};
use crate::ledger::{EntryState, RecoveryLedger};
use crate::manifest::{DiffAction, DiffEntry, Manifest};
use crate::orchestrator::{UpdateEvent, UpdateOutcome};
use crate::persist::resource_path;
use crate::tasks::{ReadFileTask, TaskQueue};
use crate::transfer::{EventSink, TransferRequest, TransferSession, TransferStatus};
use crate::transport::Transport;
use crate::version::{RemoteVersion, VersionRecord};
use parking_lot::Mutex;
use reqwest::Url;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc::UnboundedSender;

/// Fields written by transfer callbacks and read by the tick loop.
#[derive(Debug, Default)]
pub(crate) struct SharedState {
    /// Id of the live transfer; callbacks carrying another id are ignored.
    session_id: u64,
    transfer: TransferStatus,
    progress: f32,
    remote: Option<RemoteVersion>,
    bundled_version: Option<Vec<u8>>,
    bundled_manifest: Option<Vec<u8>>,
}

/// Everything an update cycle owns, passed explicitly to each state handler.
pub struct UpdateContext {
    pub(crate) config: UpdaterConfig,
    transport: Arc<dyn Transport>,
    runtime: Handle,
    shared: Arc<Mutex<SharedState>>,
    session: Option<TransferSession>,
    next_session_id: u64,
    pub(crate) tasks: TaskQueue,
    write_dir: Option<PathBuf>,
    pub(crate) local_version: VersionRecord,
    pub(crate) local_manifest: Manifest,
    pub(crate) remote_manifest: Manifest,
    /// Edits of the current cycle, ordered by path.
    pub(crate) plan: Vec<DiffEntry>,
    ledger: Option<RecoveryLedger>,
    pub(crate) outcome: Option<UpdateOutcome>,
    pub(crate) downloaded: usize,
    events: Option<UnboundedSender<UpdateEvent>>,
}

impl UpdateContext {
    pub(crate) fn new(config: UpdaterConfig, transport: Arc<dyn Transport>, runtime: Handle) -> Self {
        Self {
            config,
            transport,
            runtime,
            shared: Arc::new(Mutex::new(SharedState::default())),
            session: None,
            next_session_id: 0,
            tasks: TaskQueue::new(),
            write_dir: None,
            local_version: VersionRecord::default(),
            local_manifest: Manifest::new(),
            remote_manifest: Manifest::new(),
            plan: Vec::new(),
            ledger: None,
            outcome: None,
            downloaded: 0,
            events: None,
        }
    }

    pub(crate) fn set_events(&mut self, events: UnboundedSender<UpdateEvent>) {
        self.events = Some(events);
    }

    pub(crate) fn emit(&self, event: UpdateEvent) {
        if let Some(events) = &self.events {
            // A dropped receiver just means nobody is listening.
            let _ = events.send(event);
        }
    }

    pub(crate) fn report_failure(
        &mut self,
        kind: UpdateErrorKind,
        status: Option<u16>,
        message: impl Into<String>,
    ) {
        self.release_session();
        let failure = UpdateFailure {
            kind,
            status,
            message: message.into(),
        };
        tracing::warn!("update failed: {}", failure);
        self.emit(UpdateEvent::Failed(failure));
    }

    pub(crate) fn report_error(&mut self, kind: UpdateErrorKind, err: &UpdaterError) {
        self.report_failure(kind, err.status(), err.to_string());
    }

    pub(crate) fn progress(&self) -> f32 {
        self.shared.lock().progress
    }

    pub(crate) fn set_progress(&self, progress: f32) {
        self.shared.lock().progress = progress.clamp(0.0, 1.0);
    }

    pub(crate) fn remote(&self) -> Option<RemoteVersion> {
        self.shared.lock().remote.clone()
    }

    pub(crate) fn set_remote(&self, remote: RemoteVersion) {
        self.shared.lock().remote = Some(remote);
    }

    pub(crate) fn write_dir(&self) -> Result<&Path> {
        self.write_dir
            .as_deref()
            .ok_or_else(|| UpdaterError::validation("no writable resource directory"))
    }

    pub(crate) fn ledger_mut(&mut self) -> Result<&mut RecoveryLedger> {
        self.ledger
            .as_mut()
            .ok_or_else(|| UpdaterError::validation("recovery ledger not opened"))
    }

    /// Reset per-cycle state and make sure the write directory exists.
    pub(crate) fn resolve_write_dir(&mut self) -> Option<PathBuf> {
        self.plan.clear();
        self.remote_manifest = Manifest::new();
        self.outcome = None;
        self.downloaded = 0;
        self.shared.lock().remote = None;

        let dir = self.config.write_dir.clone()?;
        if let Err(err) = std::fs::create_dir_all(&dir) {
            tracing::warn!("resource directory {:?} unavailable: {}", dir, err);
            self.write_dir = None;
            return None;
        }
        self.write_dir = Some(dir.clone());
        Some(dir)
    }

    /// Load the committed version, manifest and ledger. Returns whether a
    /// version record was found.
    pub(crate) fn load_local_state(&mut self, dir: &Path) -> bool {
        let record = VersionRecord::load(&self.config.version_path(dir));
        let found = record.is_some();
        self.local_version = record.unwrap_or_default();
        self.local_manifest = Manifest::load(&self.config.manifest_path(dir));
        self.ledger = Some(RecoveryLedger::open(self.config.ledger_path(dir)));
        tracing::debug!(
            "local resources at version {:?}, {} files tracked",
            self.local_version.resource_version,
            self.local_manifest.len()
        );
        found
    }

    /// Queue reads of the baseline shipped in `bundled`.
    pub(crate) fn queue_bundled_reads(&mut self, bundled: &Path) {
        let version_path = self.config.version_path(bundled);
        let manifest_path = self.config.manifest_path(bundled);

        let shared = self.shared.clone();
        self.tasks.push(ReadFileTask::new(version_path, self.runtime.clone(), move |bytes| {
            shared.lock().bundled_version = Some(bytes)
        }));
        let shared = self.shared.clone();
        self.tasks.push(ReadFileTask::new(manifest_path, self.runtime.clone(), move |bytes| {
            shared.lock().bundled_manifest = Some(bytes)
        }));
    }

    /// Use whatever the bundled reads produced as the local baseline.
    pub(crate) fn adopt_bundled_baseline(&mut self) {
        let (version, manifest) = {
            let mut shared = self.shared.lock();
            (shared.bundled_version.take(), shared.bundled_manifest.take())
        };

        if let Some(record) = version.and_then(|b| VersionRecord::parse(&String::from_utf8_lossy(&b))) {
            tracing::info!("using bundled resource version {}", record.resource_version);
            self.local_version = record;
        }
        if let Some(bytes) = manifest {
            match Manifest::parse(&String::from_utf8_lossy(&bytes)) {
                Ok(manifest) => self.local_manifest = manifest,
                Err(err) => tracing::warn!("ignoring bundled manifest: {}", err),
            }
        }
    }

    pub(crate) fn has_session(&self) -> bool {
        self.session.is_some()
    }

    /// Start a transfer, disposing of any predecessor first.
    pub(crate) fn start_transfer(&mut self, request: TransferRequest) {
        self.release_session();
        self.next_session_id += 1;
        let id = self.next_session_id;
        {
            let mut shared = self.shared.lock();
            shared.session_id = id;
            shared.transfer = TransferStatus::default();
        }

        let shared = self.shared.clone();
        let sink: EventSink = Arc::new(move |event| {
            let mut shared = shared.lock();
            if shared.session_id == id {
                shared.transfer.apply(event);
            }
        });
        self.session = Some(TransferSession::start(
            id,
            &self.runtime,
            self.transport.clone(),
            request,
            self.config.limits(),
            sink,
        ));
    }

    pub(crate) fn start_text(&mut self, url: Url) {
        self.start_transfer(TransferRequest::Text { url });
    }

    /// Start (or resume) the download of plan entry `index`.
    pub(crate) fn start_download(&mut self, index: usize) -> Result<()> {
        let entry = self
            .plan
            .get(index)
            .cloned()
            .ok_or_else(|| UpdaterError::validation(format!("no plan entry {index}")))?;
        let dest = resource_path(self.write_dir()?, &entry.path)?;
        let url = self.config.resource_url(&entry.path)?;

        let ledger = self.ledger_mut()?;
        let offset = ledger.offset_for(&entry.path, &dest)?;
        ledger.set_progress(&entry.path, offset)?;

        tracing::info!("downloading {} from byte {}", entry.path, offset);
        let expected_sha256 = self
            .config
            .verify_sha256
            .then(|| entry.expected_hash.clone());
        self.start_transfer(TransferRequest::File {
            url,
            dest,
            offset,
            expected_sha256,
        });
        Ok(())
    }

    /// Snapshot of the live transfer; its terminal result is handed out once.
    pub(crate) fn poll_transfer(&self) -> Option<TransferStatus> {
        let session = self.session.as_ref()?;
        let mut shared = self.shared.lock();
        if shared.session_id != session.id() {
            return None;
        }
        let result = shared.transfer.result.take();
        Some(TransferStatus {
            result,
            ..shared.transfer.clone()
        })
    }

    pub(crate) fn release_session(&mut self) {
        if let Some(session) = self.session.take() {
            session.dispose();
        }
        self.shared.lock().session_id = 0;
    }

    /// Abort the transfer and drop queued tasks.
    pub(crate) fn release(&mut self) {
        self.release_session();
        self.tasks.clear();
    }

    /// Whether plan entry `entry` is already stored under its content hash
    /// and has not been started, so no transfer is needed.
    pub(crate) fn already_present(&self, entry: &DiffEntry) -> bool {
        let Ok(dir) = self.write_dir() else {
            return false;
        };
        let untouched = self
            .ledger
            .as_ref()
            .and_then(|ledger| ledger.get(&entry.path))
            .map_or(true, |e| e.state == EntryState::Pending);
        let stored = resource_path(dir, &entry.expected_hash).is_ok_and(|p| p.is_file());
        let partial = resource_path(dir, &entry.path).is_ok_and(|p| p.exists());
        untouched && stored && !partial
    }

    /// Record `bytes` received for `path` in the ledger.
    pub(crate) fn record_received(&mut self, path: &str, bytes: u64) -> Result<()> {
        self.ledger_mut()?.set_progress(path, bytes)
    }

    pub(crate) fn forget(&mut self, path: &str) -> Result<()> {
        self.ledger_mut()?.remove(path)
    }

    /// Store the plan in the ledger.
    pub(crate) fn persist_plan(&mut self) -> Result<()> {
        let dir = self.write_dir()?.to_path_buf();
        let Some(ledger) = self.ledger.as_mut() else {
            return Err(UpdaterError::validation("recovery ledger not opened"));
        };
        if ledger.record_plan(&self.plan, &dir) {
            ledger.flush()?;
        }
        Ok(())
    }

    /// Drop every ledger entry together with its partial file.
    pub(crate) fn clear_ledger(&mut self) -> Result<()> {
        let dir = self.write_dir()?.to_path_buf();
        self.ledger_mut()?.clear(&dir)
    }

    /// Refuse a manifest that would write over the update's own files.
    pub(crate) fn check_reserved_names(&self, manifest: &Manifest) -> Result<()> {
        let reserved = [
            &self.config.version_file,
            &self.config.manifest_file,
            &self.config.ledger_file,
        ];
        for entry in manifest.entries() {
            for name in [&entry.path, &entry.hash] {
                if reserved.iter().any(|r| r.eq_ignore_ascii_case(name)) {
                    return Err(UpdaterError::validation(format!(
                        "manifest entry {} uses reserved name {}",
                        entry.path, name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Overall progress given `completed` finished downloads plus a fraction
    /// of the current one.
    pub(crate) fn download_progress(&self, completed: usize, current: f32) -> f32 {
        let total = self.plan.iter().filter(|e| e.needs_download()).count();
        if total == 0 {
            return 1.0;
        }
        (completed as f32 + current) / total as f32
    }

    /// Adopt the remote manifest and version once every download is done.
    ///
    /// Order matters for crash safety: files are moved into place and the
    /// manifest is saved before the version record, which gates the next
    /// cycle, is written.
    pub(crate) fn commit_cycle(&mut self) -> Result<UpdateOutcome> {
        let remote = self
            .remote()
            .ok_or_else(|| UpdaterError::validation("remote version unknown"))?;
        let dir = self.write_dir()?.to_path_buf();

        let Some(ledger) = self.ledger.as_mut() else {
            return Err(UpdaterError::validation("recovery ledger not opened"));
        };
        if ledger.apply_removals(&self.plan, &dir, &self.local_manifest, &self.remote_manifest) {
            ledger.flush()?;
        }
        ledger.rename_completed(&dir, &self.remote_manifest)?;

        let manifest = std::mem::take(&mut self.remote_manifest);
        manifest.save(&self.config.manifest_path(&dir))?;
        self.local_manifest = manifest;
        self.local_version
            .commit(&remote, &self.config.version_path(&dir))?;

        let removed = self
            .plan
            .iter()
            .filter(|e| e.action == DiffAction::Remove)
            .count();
        Ok(UpdateOutcome::Updated {
            version: remote.version,
            downloaded: self.downloaded,
            removed,
        })
    }
}
