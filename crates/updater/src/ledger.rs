use crate::error::Result;
use crate::manifest::{DiffAction, DiffEntry, Manifest};
use crate::persist::{remove_if_exists, resource_path, write_atomic};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

/// Progress of a file the ledger is tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryState {
    /// Planned, no bytes requested yet.
    Pending,
    /// At least one transfer attempt has started.
    Downloading,
}

/// A file that has not yet been proven complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Server-relative path; the file lives under this name until renamed.
    pub path: String,
    #[serde(rename = "bytes")]
    pub bytes_downloaded: u64,
    pub state: EntryState,
    /// Content hash the partial bytes belong to.
    #[serde(rename = "hash", default)]
    pub expected_hash: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerDocument {
    #[serde(default)]
    entries: Vec<LedgerEntry>,
    #[serde(default)]
    removals: Vec<String>,
}

/// Durable record of in-flight file operations.
///
/// Every mutating call that is not documented as in-memory writes the ledger
/// straight back to disk, so the file always matches what has been received.
/// An empty ledger has no file at all.
#[derive(Debug)]
pub struct RecoveryLedger {
    path: PathBuf,
    entries: BTreeMap<String, LedgerEntry>,
    removals: BTreeSet<String>,
}

impl RecoveryLedger {
    /// Open the ledger stored at `path`, starting empty if there is none.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let document = match fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str::<LedgerDocument>(&text).unwrap_or_else(|err| {
                tracing::warn!("discarding malformed ledger {:?}: {}", path, err);
                LedgerDocument::default()
            }),
            Err(err) => {
                if err.kind() != io::ErrorKind::NotFound {
                    tracing::warn!("failed to read ledger {:?}: {}", path, err);
                }
                LedgerDocument::default()
            }
        };

        let entries = document
            .entries
            .into_iter()
            .map(|entry| (entry.path.clone(), entry))
            .collect();
        Self {
            path,
            entries,
            removals: document.removals.into_iter().collect(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, path: &str) -> Option<&LedgerEntry> {
        self.entries.get(path)
    }

    pub fn entries(&self) -> impl Iterator<Item = &LedgerEntry> {
        self.entries.values()
    }

    /// Paths scheduled for deletion once downloads finish.
    pub fn removals(&self) -> impl Iterator<Item = &str> {
        self.removals.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.removals.is_empty()
    }

    /// Track `path` as pending, keeping any progress already recorded.
    pub fn add(&mut self, path: &str, hash: &str) -> Result<()> {
        if self.insert_pending(path, hash) {
            self.flush()?;
        }
        Ok(())
    }

    pub fn remove(&mut self, path: &str) -> Result<()> {
        if self.entries.remove(path).is_some() {
            self.flush()?;
        }
        Ok(())
    }

    /// Forget everything, deleting the partial files of tracked downloads.
    pub fn clear(&mut self, write_dir: &Path) -> Result<()> {
        for path in std::mem::take(&mut self.entries).into_keys() {
            delete_resource(write_dir, &path);
        }
        self.removals.clear();
        self.flush()
    }

    /// Record that `bytes` of `path` are on disk.
    pub fn set_progress(&mut self, path: &str, bytes: u64) -> Result<()> {
        let entry = self
            .entries
            .entry(path.to_string())
            .or_insert_with(|| LedgerEntry {
                path: path.to_string(),
                bytes_downloaded: 0,
                state: EntryState::Pending,
                expected_hash: String::new(),
            });
        if entry.bytes_downloaded == bytes && entry.state == EntryState::Downloading {
            return Ok(());
        }
        entry.bytes_downloaded = bytes;
        entry.state = EntryState::Downloading;
        self.flush()
    }

    /// Offset to resume `path` from, given the partial file at `file_path`.
    ///
    /// The partial file is truncated to the recorded offset when it holds
    /// more bytes than the ledger vouches for; a shorter file lowers the
    /// offset instead.
    pub fn offset_for(&self, path: &str, file_path: &Path) -> io::Result<u64> {
        let recorded = self.entries.get(path).map_or(0, |e| e.bytes_downloaded);
        let on_disk = match fs::metadata(file_path) {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => 0,
            Err(err) => return Err(err),
        };

        let offset = recorded.min(on_disk);
        if on_disk > offset {
            let file = OpenOptions::new().write(true).open(file_path)?;
            file.set_len(offset)?;
            file.sync_all()?;
        }
        Ok(offset)
    }

    /// Bring the ledger in line with a freshly computed diff. In-memory for
    /// the ledger; the caller flushes when this returns `true`.
    ///
    /// Paths to download become pending. A recorded offset is kept only when
    /// it was recorded for the same content hash; otherwise the partial file
    /// is deleted and the download starts over. Entries that are no longer
    /// part of the plan are dropped along with their partial files, and
    /// removals are remembered.
    pub fn record_plan(&mut self, diff: &[DiffEntry], write_dir: &Path) -> bool {
        let (wanted, removed): (BTreeSet<&str>, BTreeSet<&str>) = {
            let mut wanted = BTreeSet::new();
            let mut removed = BTreeSet::new();
            for entry in diff {
                if entry.needs_download() {
                    wanted.insert(entry.path.as_str());
                } else {
                    removed.insert(entry.path.as_str());
                }
            }
            (wanted, removed)
        };

        let before = self.removals.len();
        self.removals.retain(|path| removed.contains(path.as_str()));
        let mut changed = before != self.removals.len();

        let dropped: Vec<String> = self
            .entries
            .keys()
            .filter(|path| !wanted.contains(path.as_str()))
            .cloned()
            .collect();
        for path in dropped {
            tracing::debug!("dropping {} from the ledger", path);
            self.entries.remove(&path);
            delete_resource(write_dir, &path);
            changed = true;
        }

        for entry in diff {
            changed |= match entry.action {
                DiffAction::Add | DiffAction::Update => {
                    self.restart_if_stale(&entry.path, &entry.expected_hash, write_dir)
                        | self.insert_pending(&entry.path, &entry.expected_hash)
                }
                DiffAction::Remove => self.removals.insert(entry.path.clone()),
            };
        }
        changed
    }

    /// Delete files the new manifest no longer needs. In-memory for the
    /// ledger; the caller flushes when this returns `true`.
    ///
    /// `Remove` edits delete the file stored under the outgoing hash and any
    /// stray partial at the relative path. `Update` edits delete the file
    /// stored under the superseded hash. A hash still referenced by
    /// `incoming` is never deleted. Failed deletions are logged and the
    /// removal stays queued.
    pub fn apply_removals(
        &mut self,
        diff: &[DiffEntry],
        write_dir: &Path,
        outgoing: &Manifest,
        incoming: &Manifest,
    ) -> bool {
        let mut changed = false;

        for entry in diff {
            if entry.action == DiffAction::Add {
                continue;
            }

            let mut ok = true;
            if let Some(old_hash) = outgoing.find_hash(&entry.path) {
                if !incoming.references_hash(old_hash) {
                    ok &= delete_resource(write_dir, old_hash);
                }
            }

            if entry.action != DiffAction::Remove {
                continue;
            }
            ok &= delete_resource(write_dir, &entry.path);

            if ok {
                changed |= self.entries.remove(&entry.path).is_some();
                changed |= self.removals.remove(&entry.path);
            }
        }
        changed
    }

    /// Move every downloaded file to its content-hash name, then forget it.
    ///
    /// Entries whose file is missing are dropped. Entries that fail to rename
    /// stay in the ledger for the next cycle.
    pub fn rename_completed(&mut self, write_dir: &Path, manifest: &Manifest) -> Result<()> {
        let mut failed = BTreeMap::new();

        for (path, entry) in std::mem::take(&mut self.entries) {
            if let Err(err) = rename_one(write_dir, &path, manifest) {
                tracing::warn!("failed to finalize {}: {}", path, err);
                failed.insert(path, entry);
            }
        }

        self.entries = failed;
        self.removals.clear();
        self.flush()
    }

    /// Write the ledger to disk, or delete the file when nothing is tracked.
    pub fn flush(&self) -> Result<()> {
        if self.is_empty() {
            if remove_if_exists(&self.path)? {
                tracing::debug!("ledger {:?} emptied", self.path);
            }
            return Ok(());
        }

        let document = LedgerDocument {
            entries: self.entries.values().cloned().collect(),
            removals: self.removals.iter().cloned().collect(),
        };
        let bytes = serde_json::to_vec(&document)?;
        write_atomic(&self.path, &bytes)
    }

    fn insert_pending(&mut self, path: &str, hash: &str) -> bool {
        if self.entries.contains_key(path) {
            return false;
        }
        self.entries.insert(
            path.to_string(),
            LedgerEntry {
                path: path.to_string(),
                bytes_downloaded: 0,
                state: EntryState::Pending,
                expected_hash: hash.to_string(),
            },
        );
        true
    }

    /// Reset the entry for `path` when its bytes were fetched for another hash.
    fn restart_if_stale(&mut self, path: &str, hash: &str, write_dir: &Path) -> bool {
        let Some(entry) = self.entries.get_mut(path) else {
            return false;
        };
        if entry.expected_hash == hash {
            return false;
        }
        tracing::info!(
            "{} changed from {:?} to {}, restarting its download",
            path,
            entry.expected_hash,
            hash
        );
        entry.bytes_downloaded = 0;
        entry.state = EntryState::Pending;
        entry.expected_hash = hash.to_string();
        delete_resource(write_dir, path);
        true
    }
}

fn delete_resource(write_dir: &Path, name: &str) -> bool {
    let target = match resource_path(write_dir, name) {
        Ok(target) => target,
        Err(err) => {
            tracing::warn!("skipping removal of {}: {}", name, err);
            return true;
        }
    };
    match remove_if_exists(&target) {
        Ok(removed) => {
            if removed {
                tracing::debug!("removed {:?}", target);
                prune_empty_dirs(write_dir, &target);
            }
            true
        }
        Err(err) => {
            tracing::warn!("failed to remove {:?}: {}", target, err);
            false
        }
    }
}

fn rename_one(write_dir: &Path, path: &str, manifest: &Manifest) -> Result<()> {
    let source = resource_path(write_dir, path)?;
    if !source.exists() {
        return Ok(());
    }
    let Some(hash) = manifest.find_hash(path) else {
        return Ok(());
    };

    let target = resource_path(write_dir, hash)?;
    // rename(2) replaces the target atomically; Windows refuses, so clear it first.
    if cfg!(windows) {
        remove_if_exists(&target)?;
    }
    fs::rename(&source, &target)?;
    tracing::debug!("renamed {} to {}", path, hash);
    prune_empty_dirs(write_dir, &source);
    Ok(())
}

/// Remove the directories between `file` and `write_dir` that are now empty.
fn prune_empty_dirs(write_dir: &Path, file: &Path) {
    let mut dir = file.parent();
    while let Some(current) = dir {
        if current == write_dir || !current.starts_with(write_dir) {
            break;
        }
        // Fails on the first directory that still has entries.
        if fs::remove_dir(current).is_err() {
            break;
        }
        dir = current.parent();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn edit(path: &str, action: DiffAction, hash: &str) -> DiffEntry {
        DiffEntry {
            path: path.into(),
            action,
            expected_hash: hash.into(),
        }
    }

    #[test]
    fn mutations_are_flushed_and_empty_ledger_has_no_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("update.txt");
        let mut ledger = RecoveryLedger::open(&path);

        ledger.add("a.bin", "h1").unwrap();
        ledger.set_progress("a.bin", 4096).unwrap();
        assert!(path.exists());

        let reopened = RecoveryLedger::open(&path);
        let entry = reopened.get("a.bin").unwrap();
        assert_eq!(entry.bytes_downloaded, 4096);
        assert_eq!(entry.state, EntryState::Downloading);
        assert_eq!(entry.expected_hash, "h1");

        ledger.remove("a.bin").unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn record_plan_keeps_offsets_and_drops_stale_entries() {
        let dir = tempdir().unwrap();
        let mut ledger = RecoveryLedger::open(dir.path().join("update.txt"));
        ledger.add("a.bin", "h1").unwrap();
        ledger.set_progress("a.bin", 10).unwrap();
        ledger.set_progress("old/x.bin", 5).unwrap();
        fs::write(dir.path().join("a.bin"), vec![0u8; 10]).unwrap();
        fs::create_dir_all(dir.path().join("old")).unwrap();
        fs::write(dir.path().join("old/x.bin"), vec![0u8; 5]).unwrap();

        let changed = ledger.record_plan(
            &[
                edit("a.bin", DiffAction::Update, "h1"),
                edit("b.bin", DiffAction::Add, "h2"),
                edit("c.bin", DiffAction::Remove, ""),
            ],
            dir.path(),
        );

        assert!(changed);
        assert_eq!(ledger.get("a.bin").unwrap().bytes_downloaded, 10);
        assert!(dir.path().join("a.bin").exists());
        assert_eq!(ledger.get("b.bin").unwrap().state, EntryState::Pending);
        assert_eq!(ledger.get("b.bin").unwrap().expected_hash, "h2");
        assert!(ledger.get("old/x.bin").is_none());
        assert!(!dir.path().join("old/x.bin").exists());
        assert!(!dir.path().join("old").exists());
        assert_eq!(ledger.removals().collect::<Vec<_>>(), vec!["c.bin"]);
    }

    #[test]
    fn record_plan_restarts_partials_of_republished_paths() {
        let dir = tempdir().unwrap();
        let mut ledger = RecoveryLedger::open(dir.path().join("update.txt"));
        ledger.add("a.bin", "h1").unwrap();
        ledger.set_progress("a.bin", 4096).unwrap();
        fs::write(dir.path().join("a.bin"), vec![0x11u8; 4096]).unwrap();

        assert!(ledger.record_plan(&[edit("a.bin", DiffAction::Update, "h2")], dir.path()));

        let entry = ledger.get("a.bin").unwrap();
        assert_eq!(entry.bytes_downloaded, 0);
        assert_eq!(entry.state, EntryState::Pending);
        assert_eq!(entry.expected_hash, "h2");
        assert!(!dir.path().join("a.bin").exists());
        assert_eq!(ledger.offset_for("a.bin", &dir.path().join("a.bin")).unwrap(), 0);
    }

    #[test]
    fn entries_without_hash_are_restarted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("update.txt");
        fs::write(&path, r#"{"entries":[{"path":"a.bin","bytes":4096,"state":"downloading"}]}"#)
            .unwrap();
        fs::write(dir.path().join("a.bin"), vec![1u8; 4096]).unwrap();

        let mut ledger = RecoveryLedger::open(&path);
        assert_eq!(ledger.get("a.bin").unwrap().expected_hash, "");
        ledger.record_plan(&[edit("a.bin", DiffAction::Add, "h1")], dir.path());

        assert_eq!(ledger.get("a.bin").unwrap().bytes_downloaded, 0);
        assert!(!dir.path().join("a.bin").exists());
    }

    #[test]
    fn clear_deletes_partial_downloads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("update.txt");
        let mut ledger = RecoveryLedger::open(&path);
        ledger.add("a.bin", "h1").unwrap();
        ledger.set_progress("a.bin", 3).unwrap();
        fs::write(dir.path().join("a.bin"), b"abc").unwrap();
        fs::write(dir.path().join("h1"), b"done").unwrap();

        ledger.clear(dir.path()).unwrap();

        assert!(ledger.is_empty());
        assert!(!path.exists());
        assert!(!dir.path().join("a.bin").exists());
        assert!(dir.path().join("h1").exists());
    }

    #[test]
    fn offset_is_reconciled_with_partial_file() {
        let dir = tempdir().unwrap();
        let mut ledger = RecoveryLedger::open(dir.path().join("update.txt"));
        let partial = dir.path().join("a.bin");

        fs::write(&partial, vec![1u8; 6000]).unwrap();
        ledger.set_progress("a.bin", 4096).unwrap();
        assert_eq!(ledger.offset_for("a.bin", &partial).unwrap(), 4096);
        assert_eq!(fs::metadata(&partial).unwrap().len(), 4096);

        fs::write(&partial, vec![1u8; 100]).unwrap();
        assert_eq!(ledger.offset_for("a.bin", &partial).unwrap(), 100);
        assert_eq!(ledger.offset_for("new.bin", &dir.path().join("new.bin")).unwrap(), 0);
    }

    #[test]
    fn removals_spare_hashes_still_referenced() {
        let dir = tempdir().unwrap();
        let mut ledger = RecoveryLedger::open(dir.path().join("update.txt"));
        fs::write(dir.path().join("hc"), b"c").unwrap();
        fs::write(dir.path().join("shared"), b"s").unwrap();

        let mut outgoing = Manifest::new();
        outgoing.insert("c.bin", "hc");
        outgoing.insert("d.bin", "shared");
        let mut incoming = Manifest::new();
        incoming.insert("e.bin", "shared");

        let diff = vec![
            edit("c.bin", DiffAction::Remove, ""),
            edit("d.bin", DiffAction::Remove, ""),
        ];
        ledger.record_plan(&diff, dir.path());
        assert!(ledger.apply_removals(&diff, dir.path(), &outgoing, &incoming));

        assert!(!dir.path().join("hc").exists());
        assert!(dir.path().join("shared").exists());
        assert!(ledger.is_empty());
    }

    #[test]
    fn rename_completed_moves_files_to_hash_names() {
        let dir = tempdir().unwrap();
        let ledger_path = dir.path().join("update.txt");
        let mut ledger = RecoveryLedger::open(&ledger_path);
        fs::create_dir_all(dir.path().join("maps")).unwrap();
        fs::write(dir.path().join("maps/1.bin"), b"new").unwrap();
        fs::write(dir.path().join("h1"), b"stale").unwrap();
        ledger.set_progress("maps/1.bin", 3).unwrap();
        ledger.add("never-started.bin", "h9").unwrap();

        let mut manifest = Manifest::new();
        manifest.insert("maps/1.bin", "h1");
        ledger.rename_completed(dir.path(), &manifest).unwrap();

        assert_eq!(fs::read(dir.path().join("h1")).unwrap(), b"new");
        assert!(!dir.path().join("maps/1.bin").exists());
        assert!(!dir.path().join("maps").exists());
        assert!(ledger.is_empty());
        assert!(!ledger_path.exists());
    }
}
