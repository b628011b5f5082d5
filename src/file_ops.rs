use std::io::{self, Write};
use std::path::Path;
use std::time::Duration;

use tracing::warn;

/// Suffix of in-flight temporary files. Readers skip anything that does not
/// end in `.json`, so a staged file is never mistaken for a document.
pub const PARTIAL_SUFFIX: &str = ".partial";

/// Writes `bytes` to `path` so that readers see either the previous content
/// or the new content, never a prefix.
///
/// The data is staged in a temporary file next to the target, synced, then
/// renamed over it. The parent directory must already exist.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut staged = tempfile::Builder::new()
        .prefix(".staged-")
        .suffix(PARTIAL_SUFFIX)
        .tempfile_in(parent)?;
    staged.write_all(bytes)?;
    staged.as_file().sync_all()?;
    staged.persist(path).map_err(|err| err.error)?;
    Ok(())
}

/// `write_atomic` on the blocking pool, retried with linear backoff.
///
/// Returns the last error once `attempts` writes have failed.
pub async fn write_atomic_with_retry(
    path: &Path,
    bytes: Vec<u8>,
    attempts: u32,
    backoff: Duration,
) -> io::Result<()> {
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        let target = path.to_path_buf();
        let payload = bytes.clone();
        let result = tokio::task::spawn_blocking(move || write_atomic(&target, &payload))
            .await
            .unwrap_or_else(|join_err| Err(io::Error::new(io::ErrorKind::Other, join_err)));

        match result {
            Ok(()) => return Ok(()),
            Err(err) if attempt < attempts => {
                warn!(
                    target: "saga_migrator",
                    event = "write_retry",
                    path = %path.display(),
                    attempt,
                    error = %err,
                );
                tokio::time::sleep(backoff * attempt).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn commit_writes_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("doc.json");
        write_atomic(&path, b"hello").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"hello");
    }

    #[test]
    fn overwrite_replaces_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("doc.json");
        fs::write(&path, b"old").unwrap();
        write_atomic(&path, b"new").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"new");
    }

    #[test]
    fn failure_leaves_no_partial_files() {
        let dir = tempdir().unwrap();
        let existing = dir.path().join("orig.json");
        fs::write(&existing, b"old").unwrap();
        let bad_path = dir.path().join("missing").join("doc.json");
        assert!(write_atomic(&bad_path, b"data").is_err());
        assert_eq!(fs::read(&existing).unwrap(), b"old");
        assert!(!bad_path.parent().unwrap().exists());

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(PARTIAL_SUFFIX))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn retry_gives_up_after_attempts() {
        let dir = tempdir().unwrap();
        let bad_path = dir.path().join("missing").join("doc.json");
        let err = write_atomic_with_retry(&bad_path, b"x".to_vec(), 3, Duration::from_millis(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
