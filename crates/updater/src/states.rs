//! Handlers for each stage of the update cycle.

use crate::context::UpdateContext;
use crate::error::UpdateErrorKind;
use crate::manifest::Manifest;
use crate::orchestrator::{UpdateEvent, UpdateOutcome};
use crate::transfer::TransferResult;
use crate::version::parse_descriptor;
use std::collections::HashMap;

/// Stages of an update cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateState {
    /// Resolve the write directory and load local state.
    Prepare,
    /// Fetch the version descriptor.
    CheckVersion,
    /// Fetch and diff the remote manifest.
    FetchManifest,
    /// Download changed files one at a time.
    DownloadFiles,
    /// Report the outcome.
    Finish,
    /// Idle.
    End,
}

/// One stage of the machine.
///
/// `tick` returns the state to move to, if any. The orchestrator releases
/// the transfer and task queue between `on_exit` and the next `on_enter`.
pub(crate) trait StateHandler: Send {
    fn on_enter(&mut self, _ctx: &mut UpdateContext) {}

    fn tick(&mut self, ctx: &mut UpdateContext) -> Option<UpdateState>;

    fn on_exit(&mut self, _ctx: &mut UpdateContext) {}
}

pub(crate) fn registry() -> HashMap<UpdateState, Box<dyn StateHandler>> {
    let mut handlers: HashMap<UpdateState, Box<dyn StateHandler>> = HashMap::new();
    handlers.insert(UpdateState::Prepare, Box::<PrepareState>::default());
    handlers.insert(UpdateState::CheckVersion, Box::<CheckVersionState>::default());
    handlers.insert(UpdateState::FetchManifest, Box::<FetchManifestState>::default());
    handlers.insert(UpdateState::DownloadFiles, Box::<DownloadFilesState>::default());
    handlers.insert(UpdateState::Finish, Box::new(FinishState));
    handlers.insert(UpdateState::End, Box::new(EndState));
    handlers
}

#[derive(Default)]
struct PrepareState {
    seeding: bool,
}

impl StateHandler for PrepareState {
    fn on_enter(&mut self, ctx: &mut UpdateContext) {
        self.seeding = false;
        ctx.set_progress(0.0);
    }

    fn tick(&mut self, ctx: &mut UpdateContext) -> Option<UpdateState> {
        if self.seeding {
            if !ctx.tasks.is_empty() {
                return None;
            }
            ctx.adopt_bundled_baseline();
            return Some(UpdateState::CheckVersion);
        }

        let Some(dir) = ctx.resolve_write_dir() else {
            tracing::info!("no writable resource directory, skipping update");
            ctx.outcome = Some(UpdateOutcome::Skipped);
            return Some(UpdateState::Finish);
        };

        let has_record = ctx.load_local_state(&dir);
        if !has_record {
            if let Some(bundled) = ctx.config.bundled_dir.clone() {
                ctx.queue_bundled_reads(&bundled);
                self.seeding = true;
                return None;
            }
        }
        Some(UpdateState::CheckVersion)
    }
}

#[derive(Default)]
struct CheckVersionState {
    parked: bool,
}

impl StateHandler for CheckVersionState {
    fn on_enter(&mut self, _ctx: &mut UpdateContext) {
        self.parked = false;
    }

    fn tick(&mut self, ctx: &mut UpdateContext) -> Option<UpdateState> {
        if self.parked {
            return None;
        }
        if !ctx.has_session() {
            match ctx.config.resource_url(&ctx.config.version_file) {
                Ok(url) => ctx.start_text(url),
                Err(err) => {
                    ctx.report_error(UpdateErrorKind::NoGetVersion, &err);
                    self.parked = true;
                }
            }
            return None;
        }

        let status = ctx.poll_transfer()?;
        let body = match status.result? {
            TransferResult::Text(body) => body,
            TransferResult::Failed { status, message } => {
                ctx.report_failure(UpdateErrorKind::NoGetVersion, status, message);
                self.parked = true;
                return None;
            }
            TransferResult::File { .. } => {
                ctx.report_failure(UpdateErrorKind::NoGetVersion, None, "unexpected file transfer");
                self.parked = true;
                return None;
            }
        };

        let Some(remote) = parse_descriptor(&body) else {
            ctx.report_failure(UpdateErrorKind::NoGetVersion, None, "empty version descriptor");
            self.parked = true;
            return None;
        };

        tracing::info!(
            "server resources at version {} (manifest {})",
            remote.version,
            remote.manifest_hash
        );
        let current = ctx
            .local_version
            .is_fully_current(&remote.version, &remote.manifest_hash);
        ctx.set_remote(remote);

        if current {
            ctx.outcome = Some(UpdateOutcome::UpToDate);
            Some(UpdateState::Finish)
        } else {
            Some(UpdateState::FetchManifest)
        }
    }
}

#[derive(Default)]
struct FetchManifestState {
    parked: bool,
}

impl FetchManifestState {
    fn fail(&mut self, ctx: &mut UpdateContext, status: Option<u16>, message: impl Into<String>) {
        ctx.report_failure(UpdateErrorKind::NoGetFileList, status, message);
        self.parked = true;
    }

    fn adopt(&mut self, ctx: &mut UpdateContext, remote: Manifest) -> Option<UpdateState> {
        if let Err(err) = ctx.check_reserved_names(&remote) {
            ctx.report_error(UpdateErrorKind::NoGetFileList, &err);
            self.parked = true;
            return None;
        }
        ctx.plan = ctx.local_manifest.diff(&remote);
        ctx.remote_manifest = remote;

        if ctx.plan.is_empty() {
            tracing::info!("files already match the server manifest");
            let cleared = ctx.clear_ledger();
            let committed = cleared.and_then(|()| ctx.commit_cycle());
            return match committed {
                Ok(outcome) => {
                    ctx.outcome = Some(outcome);
                    Some(UpdateState::Finish)
                }
                Err(err) => {
                    ctx.report_error(UpdateErrorKind::NoGetFileList, &err);
                    self.parked = true;
                    None
                }
            };
        }

        tracing::info!("{} resource changes to apply", ctx.plan.len());
        if let Err(err) = ctx.persist_plan() {
            ctx.report_error(UpdateErrorKind::NoGetFileList, &err);
            self.parked = true;
            return None;
        }
        Some(UpdateState::DownloadFiles)
    }
}

impl StateHandler for FetchManifestState {
    fn on_enter(&mut self, _ctx: &mut UpdateContext) {
        self.parked = false;
    }

    fn tick(&mut self, ctx: &mut UpdateContext) -> Option<UpdateState> {
        if self.parked {
            return None;
        }
        if !ctx.has_session() {
            match ctx.config.resource_url(&ctx.config.manifest_file) {
                Ok(url) => ctx.start_text(url),
                Err(err) => {
                    ctx.report_error(UpdateErrorKind::NoGetFileList, &err);
                    self.parked = true;
                }
            }
            return None;
        }

        let status = ctx.poll_transfer()?;
        match status.result? {
            TransferResult::Text(body) => match Manifest::parse(&body) {
                Ok(remote) => self.adopt(ctx, remote),
                Err(err) => {
                    self.fail(ctx, None, err.to_string());
                    None
                }
            },
            TransferResult::Failed { status, message } => {
                self.fail(ctx, status, message);
                None
            }
            TransferResult::File { .. } => {
                self.fail(ctx, None, "unexpected file transfer");
                None
            }
        }
    }
}

#[derive(Default)]
struct DownloadFilesState {
    /// Plan entry being worked on.
    index: usize,
    /// Downloads finished in this pass, for progress.
    completed: usize,
    active: bool,
    reported: u64,
    parked: bool,
}

impl DownloadFilesState {
    fn fail(&mut self, ctx: &mut UpdateContext, status: Option<u16>, message: impl Into<String>) {
        ctx.report_failure(UpdateErrorKind::FileDown, status, message);
        self.active = false;
        self.parked = true;
    }

    /// Move to the next entry needing a transfer and start it.
    fn start_next(&mut self, ctx: &mut UpdateContext) -> Option<UpdateState> {
        loop {
            let Some(entry) = ctx.plan.get(self.index).cloned() else {
                return self.commit(ctx);
            };
            if !entry.needs_download() {
                self.index += 1;
                continue;
            }
            if ctx.already_present(&entry) {
                tracing::debug!("{} already stored as {}", entry.path, entry.expected_hash);
                if let Err(err) = ctx.forget(&entry.path) {
                    tracing::warn!("failed to update ledger for {}: {}", entry.path, err);
                }
                self.index += 1;
                self.completed += 1;
                continue;
            }

            match ctx.start_download(self.index) {
                Ok(()) => {
                    self.active = true;
                    self.reported = 0;
                }
                Err(err) => self.fail(ctx, err.status(), err.to_string()),
            }
            return None;
        }
    }

    fn commit(&mut self, ctx: &mut UpdateContext) -> Option<UpdateState> {
        match ctx.commit_cycle() {
            Ok(outcome) => {
                ctx.outcome = Some(outcome);
                Some(UpdateState::Finish)
            }
            Err(err) => {
                self.fail(ctx, None, err.to_string());
                None
            }
        }
    }
}

impl StateHandler for DownloadFilesState {
    fn on_enter(&mut self, _ctx: &mut UpdateContext) {
        *self = Self::default();
    }

    fn tick(&mut self, ctx: &mut UpdateContext) -> Option<UpdateState> {
        if self.parked {
            return None;
        }
        if !self.active {
            return self.start_next(ctx);
        }

        let Some(status) = ctx.poll_transfer() else {
            self.active = false;
            return None;
        };
        let path = ctx.plan.get(self.index)?.path.clone();

        if status.received != self.reported {
            if let Err(err) = ctx.record_received(&path, status.received) {
                tracing::warn!("failed to record progress for {}: {}", path, err);
            }
            self.reported = status.received;
            let fraction = status.fraction().unwrap_or(0.0);
            ctx.set_progress(ctx.download_progress(self.completed, fraction));
            ctx.emit(UpdateEvent::Progress {
                index: self.index,
                path: path.clone(),
                received: status.received,
                done: false,
            });
        }

        match status.result? {
            TransferResult::File { len } => {
                if let Err(err) = ctx.record_received(&path, len) {
                    tracing::warn!("failed to record completion of {}: {}", path, err);
                }
                ctx.release_session();
                ctx.downloaded += 1;
                self.completed += 1;
                ctx.set_progress(ctx.download_progress(self.completed, 0.0));
                ctx.emit(UpdateEvent::Progress {
                    index: self.index,
                    path,
                    received: len,
                    done: true,
                });
                self.index += 1;
                self.active = false;
                None
            }
            TransferResult::Failed { status, message } => {
                self.fail(ctx, status, format!("{path}: {message}"));
                None
            }
            TransferResult::Text(_) => {
                self.fail(ctx, None, format!("{path}: unexpected text transfer"));
                None
            }
        }
    }
}

struct FinishState;

impl StateHandler for FinishState {
    fn tick(&mut self, ctx: &mut UpdateContext) -> Option<UpdateState> {
        let outcome = ctx.outcome.take().unwrap_or(UpdateOutcome::UpToDate);
        ctx.set_progress(1.0);
        tracing::info!("update finished: {:?}", outcome);
        ctx.emit(UpdateEvent::Finished(outcome));
        Some(UpdateState::End)
    }
}

struct EndState;

impl StateHandler for EndState {
    fn tick(&mut self, _ctx: &mut UpdateContext) -> Option<UpdateState> {
        None
    }
}
