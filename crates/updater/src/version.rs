use crate::error::Result;
use crate::persist::write_atomic;
use std::cmp::Ordering;
use std::fs;
use std::io;
use std::path::Path;

const VERSION_KEY: &str = "res";
const MANIFEST_HASH_KEY: &str = "fileList";

/// Version information published by the resource server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteVersion {
    pub version: String,
    pub manifest_hash: String,
}

/// Locally committed `{version, manifest hash}` pair.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionRecord {
    pub resource_version: String,
    pub manifest_hash: String,
}

/// Parse `key=value` lines, picking up `res` and `fileList`.
///
/// Keys are matched case-insensitively after trimming, values are trimmed
/// and unknown keys are ignored. Returns `None` when the text has no non-empty line at all.
pub fn parse_descriptor(text: &str) -> Option<RemoteVersion> {
    let mut lines = text
        .split('\n')
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .peekable();
    lines.peek()?;

    let mut remote = RemoteVersion::default();
    for line in lines {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.eq_ignore_ascii_case(VERSION_KEY) {
            remote.version = value.trim().to_string();
        } else if key.eq_ignore_ascii_case(MANIFEST_HASH_KEY) {
            remote.manifest_hash = value.trim().to_string();
        }
    }
    Some(remote)
}

/// Ordinal comparison ignoring case. `"9"` sorts after `"10"`.
pub fn compare_ignore_case(a: &str, b: &str) -> Ordering {
    a.chars()
        .flat_map(char::to_lowercase)
        .cmp(b.chars().flat_map(char::to_lowercase))
}

impl VersionRecord {
    pub fn new(resource_version: impl Into<String>, manifest_hash: impl Into<String>) -> Self {
        Self {
            resource_version: resource_version.into(),
            manifest_hash: manifest_hash.into(),
        }
    }

    /// Parse the record file format; `None` when the text is empty.
    pub fn parse(text: &str) -> Option<Self> {
        parse_descriptor(text).map(|remote| Self {
            resource_version: remote.version,
            manifest_hash: remote.manifest_hash,
        })
    }

    /// Read the record at `path`, `None` if the file does not exist or is empty.
    pub fn load(path: &Path) -> Option<Self> {
        match fs::read(path) {
            Ok(bytes) => Self::parse(&String::from_utf8_lossy(&bytes)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(err) => {
                tracing::warn!("failed to read version record {:?}: {}", path, err);
                None
            }
        }
    }

    /// True when the local version is at least `remote_version`.
    pub fn is_version_current(&self, remote_version: &str) -> bool {
        compare_ignore_case(&self.resource_version, remote_version) != Ordering::Less
    }

    /// True when neither the version nor the manifest needs fetching.
    pub fn is_fully_current(&self, remote_version: &str, remote_manifest_hash: &str) -> bool {
        self.is_version_current(remote_version)
            && compare_ignore_case(&self.manifest_hash, remote_manifest_hash) == Ordering::Equal
    }

    /// Render the two-line record file.
    pub fn to_text(&self) -> String {
        format!(
            "{VERSION_KEY}={}\r\n{MANIFEST_HASH_KEY}={}",
            self.resource_version, self.manifest_hash
        )
    }

    /// Adopt `remote` and persist both fields in a single write.
    ///
    /// Only call once every file of the new manifest is in place.
    pub fn commit(&mut self, remote: &RemoteVersion, path: &Path) -> Result<()> {
        let next = Self::new(remote.version.clone(), remote.manifest_hash.clone());
        write_atomic(path, next.to_text().as_bytes())?;
        *self = next;
        tracing::info!(
            "committed resource version {} (manifest {})",
            self.resource_version,
            self.manifest_hash
        );
        Ok(())
    }
}
