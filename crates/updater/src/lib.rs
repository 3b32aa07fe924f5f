//! Incremental, crash-safe resource updates for host applications.
//!
//! A host (for example a game client) keeps a directory of versioned asset
//! files. This crate decides whether that directory is stale relative to a
//! resource server, computes the file additions, changes and removals needed,
//! downloads them one at a time with resumable transfers, and only then
//! adopts the new version. Downloaded files are stored under their content
//! hash. A recovery ledger records every in-flight download so that a crash
//! or restart resumes where it left off instead of starting over.
//!
//! The [`UpdateOrchestrator`] is a state machine driven by the host's polling
//! loop through [`UpdateOrchestrator::tick`]:
//!
//! ```text
//! Prepare -> CheckVersion -> FetchManifest -> DownloadFiles -> Finish -> End
//! ```
//!
//! Failures are reported as [`UpdateEvent::Failed`] and leave the machine
//! parked; retrying is up to the host.

mod config;
mod context;
mod error;
mod ledger;
mod manifest;
mod orchestrator;
mod persist;
mod states;
mod tasks;
mod transfer;
mod transport;
mod version;

pub use config::UpdaterConfig;
pub use error::{Result, UpdateErrorKind, UpdateFailure, UpdaterError};
pub use ledger::{EntryState, LedgerEntry, RecoveryLedger};
pub use manifest::{DiffAction, DiffEntry, Manifest, ManifestEntry};
pub use orchestrator::{UpdateEvent, UpdateOrchestrator, UpdateOutcome};
pub use states::UpdateState;
pub use tasks::{ReadFileTask, Task, TaskQueue, TaskStatus};
pub use transfer::{
    EventSink, TransferEvent, TransferLimits, TransferRequest, TransferResult, TransferSession,
    TransferStatus, DEFAULT_CHUNK_SIZE, DEFAULT_TIMEOUT,
};
pub use transport::{ByteStream, FetchResponse, HttpTransport, HttpTransportBuilder, Transport};
pub use version::{compare_ignore_case, parse_descriptor, RemoteVersion, VersionRecord};
