//! Configuration for the resource updater.

use crate::error::{Result, UpdaterError};
use crate::transfer::{TransferLimits, DEFAULT_CHUNK_SIZE};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:1983/";

/// Configuration for an [`UpdateOrchestrator`](crate::UpdateOrchestrator).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UpdaterConfig {
    /// Base URL the version descriptor, manifest and resources live under.
    pub server_url: String,
    /// Writable directory holding downloaded resources and update state.
    /// `None` turns every update into a no-op.
    pub write_dir: Option<PathBuf>,
    /// Read-only directory shipped with the application, consulted for the
    /// baseline version and manifest before the first update.
    pub bundled_dir: Option<PathBuf>,
    /// Name of the version descriptor, on the server and locally.
    pub version_file: String,
    /// Name of the manifest document, on the server and locally.
    pub manifest_file: String,
    /// Name of the recovery ledger inside `write_dir`.
    pub ledger_file: String,
    /// How long a transfer may go without progress.
    pub timeout_ms: u64,
    /// Disk write granularity for file transfers.
    pub chunk_size: usize,
    /// Check each downloaded file against its manifest hash as SHA-256.
    pub verify_sha256: bool,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            write_dir: None,
            bundled_dir: None,
            version_file: "version.txt".to_string(),
            manifest_file: "fileList.txt".to_string(),
            ledger_file: "update.txt".to_string(),
            timeout_ms: 5_000,
            chunk_size: DEFAULT_CHUNK_SIZE,
            verify_sha256: false,
        }
    }
}

impl UpdaterConfig {
    /// Create a config for `server_url` writing into `write_dir`.
    pub fn new(server_url: impl Into<String>, write_dir: impl Into<PathBuf>) -> Self {
        Self {
            server_url: server_url.into(),
            write_dir: Some(write_dir.into()),
            ..Self::default()
        }
    }

    /// Set the bundled baseline directory
    pub fn bundled_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.bundled_dir = Some(dir.into());
        self
    }

    /// Set the per-transfer timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the write chunk size
    pub fn chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size = bytes.max(1);
        self
    }

    /// Enable/disable SHA-256 verification of downloads
    pub fn verify_sha256(mut self, enabled: bool) -> Self {
        self.verify_sha256 = enabled;
        self
    }

    pub fn limits(&self) -> TransferLimits {
        TransferLimits {
            timeout: Duration::from_millis(self.timeout_ms),
            chunk_size: self.chunk_size.max(1),
        }
    }

    /// The server URL with a trailing slash so relative joins stay beneath it.
    pub fn base_url(&self) -> Result<Url> {
        let mut raw = self.server_url.clone();
        if !raw.ends_with('/') {
            raw.push('/');
        }
        Url::parse(&raw).map_err(|err| UpdaterError::InvalidUrl(format!("{raw}: {err}")))
    }

    /// URL of a server-relative resource.
    pub fn resource_url(&self, relative: &str) -> Result<Url> {
        let base = self.base_url()?;
        base.join(relative.trim_start_matches('/'))
            .map_err(|err| UpdaterError::InvalidUrl(format!("{relative}: {err}")))
    }

    pub fn version_path(&self, dir: &Path) -> PathBuf {
        dir.join(&self.version_file)
    }

    pub fn manifest_path(&self, dir: &Path) -> PathBuf {
        dir.join(&self.manifest_file)
    }

    pub fn ledger_path(&self, dir: &Path) -> PathBuf {
        dir.join(&self.ledger_file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = UpdaterConfig::default();
        assert!(config.write_dir.is_none());
        assert_eq!(config.limits().timeout, Duration::from_secs(5));
        assert_eq!(config.limits().chunk_size, 64 * 1024);
        assert!(!config.verify_sha256);
    }

    #[test]
    fn resource_urls_stay_below_server_path() {
        let config = UpdaterConfig::new("http://cdn.test/game/res", "/tmp/res");
        assert_eq!(
            config.resource_url("version.txt").unwrap().as_str(),
            "http://cdn.test/game/res/version.txt"
        );
        assert_eq!(
            config.resource_url("/maps/1.bin").unwrap().as_str(),
            "http://cdn.test/game/res/maps/1.bin"
        );
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: UpdaterConfig =
            serde_json::from_str(r#"{"server_url":"http://cdn.test/","verify_sha256":true}"#)
                .unwrap();
        assert_eq!(config.manifest_file, "fileList.txt");
        assert!(config.verify_sha256);
    }
}
