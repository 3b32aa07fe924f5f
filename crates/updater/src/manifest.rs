use crate::error::{Result, UpdaterError};
use crate::persist::write_atomic;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

/// One tracked resource file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestEntry {
    /// Server-relative path of the file.
    pub path: String,
    /// Content hash; also the file name the resource is stored under locally.
    pub hash: String,
}

/// On-disk / on-wire shape of a manifest.
#[derive(Debug, Default, Serialize, Deserialize)]
struct ManifestDocument {
    #[serde(default)]
    files: Vec<ManifestEntry>,
}

/// What has to happen to a path to move from one manifest to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiffAction {
    Add,
    Update,
    Remove,
}

/// A single edit produced by [`Manifest::diff`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffEntry {
    pub path: String,
    pub action: DiffAction,
    /// Hash the path must end up with; empty for [`DiffAction::Remove`].
    pub expected_hash: String,
}

impl DiffEntry {
    /// Whether this edit requires a file transfer.
    pub fn needs_download(&self) -> bool {
        matches!(self.action, DiffAction::Add | DiffAction::Update)
    }
}

/// Set of tracked resource files keyed by relative path.
///
/// Paths are kept sorted so every walk over a manifest, and therefore every
/// diff, comes out in the same order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    entries: BTreeMap<String, ManifestEntry>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a manifest document. Duplicate paths are rejected.
    pub fn parse(text: &str) -> Result<Self> {
        let document: ManifestDocument = serde_json::from_str(text)?;
        let mut manifest = Manifest::new();
        for entry in document.files {
            if manifest.entries.contains_key(&entry.path) {
                return Err(UpdaterError::DuplicatePath(entry.path));
            }
            manifest.entries.insert(entry.path.clone(), entry);
        }
        Ok(manifest)
    }

    /// Load the manifest at `path`.
    ///
    /// A missing or unreadable manifest loads as empty, which makes the next
    /// update behave like a fresh install.
    pub fn load(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(text) => match Self::parse(&text) {
                Ok(manifest) => manifest,
                Err(err) => {
                    tracing::warn!("ignoring malformed manifest {:?}: {}", path, err);
                    Self::new()
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => Self::new(),
            Err(err) => {
                tracing::warn!("failed to read manifest {:?}: {}", path, err);
                Self::new()
            }
        }
    }

    /// Serialize to the document format accepted by [`Manifest::parse`].
    pub fn to_document(&self) -> Result<String> {
        let document = ManifestDocument {
            files: self.entries.values().cloned().collect(),
        };
        Ok(serde_json::to_string_pretty(&document)?)
    }

    /// Persist the manifest without ever exposing a half-written file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let document = self.to_document()?;
        write_atomic(path, document.as_bytes())
    }

    /// Insert or replace the entry for `path`.
    pub fn insert(&mut self, path: impl Into<String>, hash: impl Into<String>) {
        let path = path.into();
        let entry = ManifestEntry {
            path: path.clone(),
            hash: hash.into(),
        };
        self.entries.insert(path, entry);
    }

    /// Content hash recorded for `path`.
    pub fn find_hash(&self, path: &str) -> Option<&str> {
        self.entries.get(path).map(|entry| entry.hash.as_str())
    }

    /// Whether any entry is stored under `hash`.
    pub fn references_hash(&self, hash: &str) -> bool {
        self.entries.values().any(|entry| entry.hash == hash)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.entries.values()
    }

    /// Compute the edits that turn `self` (local) into `remote`.
    ///
    /// Entries are ordered by path.
    pub fn diff(&self, remote: &Manifest) -> Vec<DiffEntry> {
        let mut edits = Vec::new();

        for (path, entry) in &remote.entries {
            let action = match self.entries.get(path) {
                None => DiffAction::Add,
                Some(local) if local.hash != entry.hash => DiffAction::Update,
                Some(_) => continue,
            };
            edits.push(DiffEntry {
                path: path.clone(),
                action,
                expected_hash: entry.hash.clone(),
            });
        }

        for path in self.entries.keys() {
            if !remote.entries.contains_key(path) {
                edits.push(DiffEntry {
                    path: path.clone(),
                    action: DiffAction::Remove,
                    expected_hash: String::new(),
                });
            }
        }

        edits.sort_by(|a, b| a.path.cmp(&b.path));
        edits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn manifest(pairs: &[(&str, &str)]) -> Manifest {
        let mut manifest = Manifest::new();
        for (path, hash) in pairs {
            manifest.insert(*path, *hash);
        }
        manifest
    }

    #[test]
    fn diff_of_identical_manifests_is_empty() {
        let a = manifest(&[("a.bin", "h0"), ("b.bin", "h1")]);
        assert!(a.diff(&a.clone()).is_empty());
    }

    #[test]
    fn diff_classifies_and_orders_changes() {
        let local = manifest(&[("a.bin", "h0"), ("c.bin", "h3"), ("d.bin", "h4")]);
        let remote = manifest(&[("a.bin", "h1"), ("b.bin", "h2"), ("d.bin", "h4")]);

        let diff = local.diff(&remote);
        let summary: Vec<_> = diff
            .iter()
            .map(|e| (e.path.as_str(), e.action, e.expected_hash.as_str()))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("a.bin", DiffAction::Update, "h1"),
                ("b.bin", DiffAction::Add, "h2"),
                ("c.bin", DiffAction::Remove, ""),
            ]
        );
        assert_eq!(diff, local.diff(&remote));
    }

    #[test]
    fn parse_rejects_duplicate_paths() {
        let text = r#"{"files":[{"path":"a","hash":"1"},{"path":"a","hash":"2"}]}"#;
        assert!(matches!(
            Manifest::parse(text),
            Err(UpdaterError::DuplicatePath(path)) if path == "a"
        ));
    }

    #[test]
    fn load_falls_back_to_empty() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("fileList.txt");
        assert!(Manifest::load(&missing).is_empty());

        fs::write(&missing, "not json").unwrap();
        assert!(Manifest::load(&missing).is_empty());
    }

    #[test]
    fn save_then_load_preserves_entries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fileList.txt");
        let saved = manifest(&[("ui/atlas.png", "abc"), ("maps/1.bin", "def")]);

        saved.save(&path).unwrap();
        let loaded = Manifest::load(&path);

        assert_eq!(loaded, saved);
        assert_eq!(loaded.find_hash("ui/atlas.png"), Some("abc"));
        assert_eq!(loaded.find_hash("missing"), None);
    }
}
