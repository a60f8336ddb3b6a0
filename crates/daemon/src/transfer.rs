//! Moving finished recordings into place and mirroring them to a secondary location.

use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur while mirroring a processed file.
#[derive(Debug, Error)]
pub enum MirrorError {
    /// Copy to the mirror location failed.
    #[error("Failed to copy to mirror: {0}")]
    Io(#[from] std::io::Error),

    /// Mirror copy does not match the source size.
    #[error("Mirror copy of {path} is {actual} bytes, expected {expected}")]
    IntegrityMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },
}

/// Temporary name used while a cross-filesystem copy is in flight.
pub fn partial_path(dest: &Path) -> PathBuf {
    let mut partial = dest.as_os_str().to_owned();
    partial.push(".partial");
    PathBuf::from(partial)
}

/// Move `src` to `dest`.
///
/// Tries a rename first. Across filesystems the file is copied to a temporary
/// name next to `dest`, renamed into place, and only then is `src` removed, so
/// an interrupted move never leaves a truncated file under the final name.
pub fn move_file(src: &Path, dest: &Path) -> std::io::Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }

    if fs::rename(src, dest).is_ok() {
        return Ok(());
    }

    let partial = partial_path(dest);
    if let Err(e) = fs::copy(src, &partial).and_then(|_| fs::rename(&partial, dest)) {
        let _ = fs::remove_file(&partial);
        return Err(e);
    }
    fs::remove_file(src)
}

/// Copy `src` into `mirror_dir` and verify the copy's size.
///
/// Returns the path of the mirrored file. The source is never modified.
pub fn mirror_file(src: &Path, mirror_dir: &Path) -> Result<PathBuf, MirrorError> {
    let file_name = src.file_name().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "source has no file name")
    })?;
    fs::create_dir_all(mirror_dir)?;
    let dest = mirror_dir.join(file_name);

    let expected = fs::metadata(src)?.len();
    fs::copy(src, &dest)?;
    verify_size(&dest, expected)?;
    Ok(dest)
}

/// Check that `path` is exactly `expected` bytes long.
pub fn verify_size(path: &Path, expected: u64) -> Result<(), MirrorError> {
    let actual = fs::metadata(path)?.len();
    if actual != expected {
        return Err(MirrorError::IntegrityMismatch {
            path: path.to_path_buf(),
            expected,
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_partial_path_keeps_extension() {
        let partial = partial_path(Path::new("/rec/processed/alice/a.mp4"));
        assert_eq!(partial, PathBuf::from("/rec/processed/alice/a.mp4.partial"));
    }

    #[test]
    fn test_move_file_creates_parent_and_removes_source() {
        let temp_dir = TempDir::new().unwrap();
        let src = temp_dir.path().join("recorded").join("a.mp4");
        fs::create_dir_all(src.parent().unwrap()).unwrap();
        fs::write(&src, b"raw recording").unwrap();
        let dest = temp_dir.path().join("processed").join("alice").join("a.mp4");

        move_file(&src, &dest).unwrap();

        assert!(!src.exists());
        assert_eq!(fs::read(&dest).unwrap(), b"raw recording");
        assert!(!partial_path(&dest).exists());
    }

    #[test]
    fn test_move_missing_source_fails_without_leftovers() {
        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("out.mp4");

        assert!(move_file(&temp_dir.path().join("missing.mp4"), &dest).is_err());
        assert!(!dest.exists());
        assert!(!partial_path(&dest).exists());
    }

    #[test]
    fn test_mirror_file_copies_and_keeps_source() {
        let temp_dir = TempDir::new().unwrap();
        let src = temp_dir.path().join("a.mp4");
        fs::write(&src, b"processed").unwrap();
        let mirror_dir = temp_dir.path().join("mirror").join("alice");

        let copied = mirror_file(&src, &mirror_dir).unwrap();

        assert_eq!(copied, mirror_dir.join("a.mp4"));
        assert_eq!(fs::read(&copied).unwrap(), b"processed");
        assert!(src.exists());
    }

    #[test]
    fn test_verify_size_mismatch() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("a.mp4");
        fs::write(&path, b"1234").unwrap();

        assert!(verify_size(&path, 4).is_ok());
        match verify_size(&path, 10) {
            Err(MirrorError::IntegrityMismatch { expected, actual, .. }) => {
                assert_eq!(expected, 10);
                assert_eq!(actual, 4);
            }
            other => panic!("expected mismatch, got {:?}", other),
        }
    }
}
