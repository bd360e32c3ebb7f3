//! Screenshot files: output directory, unique names, atomic writes and cleanup

use crate::{Error, Result};
use log::{error, warn};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static LAST_STAMP: AtomicU64 = AtomicU64::new(0);

/// Millisecond timestamp, strictly increasing across calls in this process.
///
/// Two calls within the same millisecond get consecutive values, so file
/// names stay unique under concurrent renders.
pub fn unique_stamp() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);

    let prev = LAST_STAMP
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |prev| {
            Some(now.max(prev + 1))
        })
        .unwrap_or_else(|prev| prev);
    now.max(prev + 1)
}

/// `screenshot-<stamp>.png`
pub fn next_file_name() -> String {
    format!("screenshot-{}.png", unique_stamp())
}

/// Create `dir` and its parents if missing.
pub async fn ensure_output_dir(dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(dir).await.map_err(|source| {
        error!("Error ensuring directory exists: {}", source);
        Error::OutputDirectory {
            path: dir.to_path_buf(),
            source,
        }
    })
}

/// Write `bytes` to `path` through a sibling temp file and a rename, so
/// `path` either holds the complete image or does not exist.
pub async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = partial_path(path);

    if let Err(source) = tokio::fs::write(&tmp, bytes).await {
        discard(&tmp).await;
        return Err(Error::WriteError {
            path: path.to_path_buf(),
            source,
        });
    }

    if let Err(source) = tokio::fs::rename(&tmp, path).await {
        discard(&tmp).await;
        return Err(Error::WriteError {
            path: path.to_path_buf(),
            source,
        });
    }

    Ok(())
}

/// Delete a screenshot previously returned by a render.
///
/// Failures (missing file, permissions) are logged and returned; there is
/// no retry.
pub async fn delete_artifact(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    tokio::fs::remove_file(path).await.map_err(|source| {
        error!("Error deleting file: {}", source);
        Error::Cleanup {
            path: path.to_path_buf(),
            source,
        }
    })
}

/// Best-effort removal used when an attempt fails after writing.
pub(crate) async fn discard(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove {}: {}", path.display(), e);
        }
    }
}

fn partial_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.partial", name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn stamps_strictly_increase() {
        let stamps: Vec<u64> = (0..1000).map(|_| unique_stamp()).collect();
        assert!(stamps.windows(2).all(|w| w[1] > w[0]));
    }

    #[test]
    fn stamps_are_unique_across_threads() {
        let handles: Vec<_> = (0..8)
            .map(|_| std::thread::spawn(|| (0..200).map(|_| unique_stamp()).collect::<Vec<_>>()))
            .collect();

        let mut seen = HashSet::new();
        for h in handles {
            for stamp in h.join().unwrap() {
                assert!(seen.insert(stamp), "duplicate stamp {stamp}");
            }
        }
        assert_eq!(seen.len(), 1600);
    }

    #[test]
    fn file_name_shape() {
        let name = next_file_name();
        let digits = name
            .strip_prefix("screenshot-")
            .and_then(|rest| rest.strip_suffix(".png"))
            .unwrap();
        assert!(!digits.is_empty());
        assert!(digits.chars().all(|c| c.is_ascii_digit()), "got {name}");
    }

    #[test]
    fn partial_path_is_hidden_sibling() {
        let p = partial_path(Path::new("out/screenshot-1.png"));
        assert_eq!(p, PathBuf::from("out/.screenshot-1.png.partial"));
    }

    #[tokio::test]
    async fn ensure_output_dir_creates_nested_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("caching").join("puppeteer");

        ensure_output_dir(&dir).await.unwrap();
        ensure_output_dir(&dir).await.unwrap();
        assert!(dir.is_dir());
    }

    #[tokio::test]
    async fn ensure_output_dir_reports_blocking_file() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();

        let err = ensure_output_dir(&blocker.join("sub")).await.unwrap_err();
        assert!(matches!(err, Error::OutputDirectory { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn write_atomically_leaves_only_final_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("screenshot-7.png");

        write_atomically(&path, b"\x89PNG\r\n\x1a\n").await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"\x89PNG\r\n\x1a\n");
        let entries: Vec<_> = std::fs::read_dir(tmp.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn write_atomically_into_missing_dir_fails_cleanly() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("missing").join("screenshot-8.png");

        let err = write_atomically(&path, b"data").await.unwrap_err();
        assert!(matches!(err, Error::WriteError { .. }), "got {err:?}");
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn delete_existing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("screenshot-9.png");
        std::fs::write(&path, b"png").unwrap();

        delete_artifact(&path).await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn delete_missing_file_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let err = delete_artifact(tmp.path().join("nope.png")).await.unwrap_err();
        assert!(err.is_not_found(), "got {err:?}");
    }
}
