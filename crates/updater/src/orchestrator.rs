use crate::config::UpdaterConfig;
use crate::context::UpdateContext;
use crate::error::UpdateFailure;
use crate::manifest::Manifest;
use crate::states::{registry, StateHandler, UpdateState};
use crate::transport::Transport;
use crate::version::{RemoteVersion, VersionRecord};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, UnboundedReceiver};

/// How an update cycle ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// There is no writable directory; nothing was attempted.
    Skipped,
    /// Local resources already match the server.
    UpToDate,
    /// The new resource set was downloaded and committed.
    Updated {
        version: String,
        downloaded: usize,
        removed: usize,
    },
}

/// Notifications delivered to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateEvent {
    /// Bytes received for plan entry `index`; `done` marks its completion.
    Progress {
        index: usize,
        path: String,
        received: u64,
        done: bool,
    },
    /// The cycle stopped; call [`UpdateOrchestrator::start_update`] to retry.
    Failed(UpdateFailure),
    /// The cycle completed. Sent once per cycle.
    Finished(UpdateOutcome),
}

/// Drives incremental resource updates from a host polling loop.
///
/// The host calls [`start_update`](Self::start_update) and then
/// [`tick`](Self::tick) repeatedly, e.g. once per frame. Network work runs on
/// the supplied tokio runtime; `tick` itself never blocks on it.
///
/// ```ignore
/// use res_updater::{HttpTransport, UpdateEvent, UpdateOrchestrator, UpdaterConfig};
///
/// let config = UpdaterConfig::new("http://cdn.example.com/res/", "/var/game/res");
/// let transport = HttpTransport::builder().build()?;
/// let mut updater = UpdateOrchestrator::new(config, transport, runtime.handle().clone());
/// let mut events = updater.subscribe();
///
/// updater.start_update();
/// while updater.is_running() {
///     updater.tick();
///     while let Ok(event) = events.try_recv() {
///         println!("{event:?}");
///     }
/// }
/// ```
pub struct UpdateOrchestrator {
    ctx: UpdateContext,
    handlers: HashMap<UpdateState, Box<dyn StateHandler>>,
    state: UpdateState,
}

impl UpdateOrchestrator {
    /// Create an idle orchestrator.
    pub fn new(config: UpdaterConfig, transport: impl Transport + 'static, runtime: Handle) -> Self {
        Self::with_shared_transport(config, Arc::new(transport), runtime)
    }

    /// Create an idle orchestrator around an already shared transport.
    pub fn with_shared_transport(
        config: UpdaterConfig,
        transport: Arc<dyn Transport>,
        runtime: Handle,
    ) -> Self {
        Self {
            ctx: UpdateContext::new(config, transport, runtime),
            handlers: registry(),
            state: UpdateState::End,
        }
    }

    /// Receive update events. Replaces any earlier subscription.
    pub fn subscribe(&mut self) -> UnboundedReceiver<UpdateEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.ctx.set_events(tx);
        rx
    }

    /// Begin a new cycle, abandoning any cycle in progress.
    ///
    /// A cycle that stopped on a failure resumes from the recovery ledger.
    pub fn start_update(&mut self) {
        self.ctx.set_progress(0.0);
        self.change_state(UpdateState::Prepare);
    }

    /// Abort the transfer in flight and go idle.
    pub fn end_update(&mut self) {
        self.change_state(UpdateState::End);
    }

    /// Advance queued tasks, then the current state.
    pub fn tick(&mut self) {
        self.ctx.tasks.process();

        let next = match self.handlers.get_mut(&self.state) {
            Some(handler) => handler.tick(&mut self.ctx),
            None => None,
        };
        if let Some(next) = next {
            self.change_state(next);
        }
    }

    /// Download progress of the current cycle in `[0, 1]`.
    pub fn progress(&self) -> f32 {
        self.ctx.progress()
    }

    pub fn state(&self) -> UpdateState {
        self.state
    }

    /// Whether a cycle is in progress (including one parked on a failure).
    pub fn is_running(&self) -> bool {
        self.state != UpdateState::End
    }

    /// Version reported by the server during the current cycle.
    pub fn remote_version(&self) -> Option<RemoteVersion> {
        self.ctx.remote()
    }

    /// Last committed local version.
    pub fn local_version(&self) -> &VersionRecord {
        &self.ctx.local_version
    }

    /// Last committed local manifest.
    pub fn local_manifest(&self) -> &Manifest {
        &self.ctx.local_manifest
    }

    fn change_state(&mut self, next: UpdateState) {
        if let Some(handler) = self.handlers.get_mut(&self.state) {
            handler.on_exit(&mut self.ctx);
        }
        self.ctx.release();

        tracing::debug!("update state {:?} -> {:?}", self.state, next);
        self.state = next;
        if let Some(handler) = self.handlers.get_mut(&next) {
            handler.on_enter(&mut self.ctx);
        }
    }
}

impl Drop for UpdateOrchestrator {
    fn drop(&mut self) {
        self.ctx.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Result, UpdateErrorKind, UpdaterError};
    use crate::transport::{ByteStream, FetchResponse};
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::{stream, StreamExt};
    use parking_lot::Mutex;
    use reqwest::Url;
    use std::time::Duration;
    use tempfile::tempdir;

    struct MockTransport {
        entries: HashMap<String, Vec<u8>>,
        requests: Mutex<Vec<(String, u64)>>,
    }

    impl MockTransport {
        fn new() -> Self {
            Self {
                entries: HashMap::new(),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn insert(&mut self, path: &str, data: impl Into<Vec<u8>>) {
            self.entries.insert(path.to_string(), data.into());
        }
    }

    #[async_trait]
    impl Transport for Arc<MockTransport> {
        async fn get(&self, url: &Url, offset: u64) -> Result<FetchResponse> {
            let path = url.path().trim_start_matches('/').to_string();
            self.requests.lock().push((path.clone(), offset));
            let data = self.entries.get(&path).ok_or(UpdaterError::Status(404))?;
            let rest = data[offset as usize..].to_vec();
            let body: ByteStream = stream::iter(vec![Ok(Bytes::from(rest.clone()))]).boxed();
            Ok(FetchResponse {
                offset,
                content_length: Some(rest.len() as u64),
                body,
            })
        }
    }

    async fn run_to_end(
        updater: &mut UpdateOrchestrator,
        events: &mut UnboundedReceiver<UpdateEvent>,
    ) -> Vec<UpdateEvent> {
        let mut seen = Vec::new();
        for _ in 0..2_000 {
            updater.tick();
            while let Ok(event) = events.try_recv() {
                seen.push(event);
            }
            if !updater.is_running() || matches!(seen.last(), Some(UpdateEvent::Failed(_))) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        seen
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn current_server_finishes_after_version_check() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("version.txt"), "res=1.0\r\nfileList=H0").unwrap();

        let mut transport = MockTransport::new();
        transport.insert("version.txt", "res=1.0\r\nfileList=h0");
        let transport = Arc::new(transport);

        let config = UpdaterConfig::new("http://updates.test/", dir.path());
        let mut updater = UpdateOrchestrator::new(config, transport.clone(), Handle::current());
        let mut events = updater.subscribe();

        updater.start_update();
        let seen = run_to_end(&mut updater, &mut events).await;

        assert_eq!(seen, vec![UpdateEvent::Finished(UpdateOutcome::UpToDate)]);
        assert_eq!(
            *transport.requests.lock(),
            vec![("version.txt".to_string(), 0)]
        );
        assert_eq!(updater.progress(), 1.0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_write_dir_is_skipped() {
        let transport = Arc::new(MockTransport::new());
        let mut updater =
            UpdateOrchestrator::new(UpdaterConfig::default(), transport.clone(), Handle::current());
        let mut events = updater.subscribe();

        updater.start_update();
        let seen = run_to_end(&mut updater, &mut events).await;

        assert_eq!(seen, vec![UpdateEvent::Finished(UpdateOutcome::Skipped)]);
        assert!(transport.requests.lock().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn version_failure_parks_the_machine() {
        let dir = tempdir().unwrap();
        let transport = Arc::new(MockTransport::new());
        let config = UpdaterConfig::new("http://updates.test/", dir.path());
        let mut updater = UpdateOrchestrator::new(config, transport, Handle::current());
        let mut events = updater.subscribe();

        updater.start_update();
        let seen = run_to_end(&mut updater, &mut events).await;

        match seen.as_slice() {
            [UpdateEvent::Failed(failure)] => {
                assert_eq!(failure.kind, UpdateErrorKind::NoGetVersion);
                assert_eq!(failure.status, Some(404));
            }
            other => panic!("unexpected events {other:?}"),
        }
        assert_eq!(updater.state(), UpdateState::CheckVersion);

        for _ in 0..5 {
            updater.tick();
        }
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn tick_is_a_no_op_until_started() {
        let transport = Arc::new(MockTransport::new());
        let mut updater =
            UpdateOrchestrator::new(UpdaterConfig::default(), transport.clone(), Handle::current());
        updater.tick();
        updater.tick();
        assert_eq!(updater.state(), UpdateState::End);
        assert!(transport.requests.lock().is_empty());
    }
}
