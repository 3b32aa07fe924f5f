use crate::error::{Result, UpdaterError};
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use tempfile::{NamedTempFile, PathPersistError};

/// Replace `target_path` with `bytes` so that readers only ever observe the
/// old or the new content.
pub(crate) fn write_atomic(target_path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = target_path
        .parent()
        .ok_or_else(|| UpdaterError::validation("target path must have a parent directory"))?;

    if !parent.exists() {
        fs::create_dir_all(parent)?;
    }

    let mut temp = NamedTempFile::new_in(parent)?;
    temp.write_all(bytes)?;
    temp.flush()?;
    temp.as_file().sync_all()?;

    temp.into_temp_path()
        .persist(target_path)
        .map_err(map_persist_error)?;
    Ok(())
}

/// Delete `path` if it exists. Missing files are not an error.
pub(crate) fn remove_if_exists(path: &Path) -> std::io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

/// Join a server-supplied relative path onto `root`, refusing anything that
/// could escape it.
pub(crate) fn resource_path(root: &Path, relative: &str) -> Result<PathBuf> {
    let relative = Path::new(relative);
    let safe = !relative.as_os_str().is_empty()
        && relative
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
    if !safe {
        return Err(UpdaterError::validation(format!(
            "refusing unsafe resource path {relative:?}"
        )));
    }
    Ok(root.join(relative))
}

fn map_persist_error(err: PathPersistError) -> UpdaterError {
    UpdaterError::Io(err.error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_atomic_replaces_existing_content() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("nested").join("record.txt");

        write_atomic(&target, b"first").unwrap();
        write_atomic(&target, b"second").unwrap();

        assert_eq!(fs::read(&target).unwrap(), b"second");
        let leftovers: Vec<_> = fs::read_dir(target.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[test]
    fn resource_path_rejects_escapes() {
        let root = Path::new("/data");
        assert_eq!(
            resource_path(root, "maps/1.bin").unwrap(),
            Path::new("/data/maps/1.bin")
        );
        assert!(resource_path(root, "../etc/passwd").is_err());
        assert!(resource_path(root, "/etc/passwd").is_err());
        assert!(resource_path(root, "").is_err());
    }

    #[test]
    fn remove_if_exists_tolerates_missing_file() {
        let dir = tempdir().unwrap();
        assert!(!remove_if_exists(&dir.path().join("nope")).unwrap());
    }
}
