//! Hosts file management: one delimited block of loopback aliases, added
//! and removed idempotently. Lines outside the markers are never touched.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

const MARKER_START: &str = "# BEGIN rai-connect";
const MARKER_END: &str = "# END rai-connect";

const LOCK_ATTEMPTS: u32 = 3;
const LOCK_BACKOFF: Duration = Duration::from_millis(100);

/// A lock file older than this belongs to a dead process.
const LOCK_STALE_AFTER: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum HostsError {
    #[error("permission denied writing hosts file: {0}")]
    PermissionDenied(String),
    #[error("hosts file locked by another process after {0} attempts")]
    LockContended(u32),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(target_os = "windows")]
pub fn hosts_path() -> PathBuf {
    PathBuf::from(r"C:\Windows\System32\drivers\etc\hosts")
}

#[cfg(not(target_os = "windows"))]
pub fn hosts_path() -> PathBuf {
    PathBuf::from("/etc/hosts")
}

/// Rewrites the delimited block so it contains exactly `aliases`, appending
/// a new block when none exists. Idempotent; replaces atomically.
pub fn ensure_aliases(path: &Path, aliases: &[String]) -> Result<(), HostsError> {
    with_lock(path, |content| upsert_block(content, aliases))
}

/// Deletes the delimited block including its markers, leaving the rest of
/// the file byte-for-byte intact. A file without a block is left alone.
pub fn remove_block(path: &Path) -> Result<(), HostsError> {
    with_lock(path, strip_block)
}

fn with_lock(
    path: &Path,
    transform: impl Fn(&str) -> String,
) -> Result<(), HostsError> {
    let lock_path = PathBuf::from(format!("{}.rai-connect.lock", path.display()));
    let _lock = acquire_lock(&lock_path)?;

    let content = std::fs::read_to_string(path).map_err(map_permission)?;
    let updated = transform(&content);
    if updated == content {
        return Ok(());
    }

    // Replace atomically: sibling temp file, then rename.
    let temp_path = PathBuf::from(format!("{}.rai-connect.tmp", path.display()));
    {
        let mut temp = std::fs::File::create(&temp_path).map_err(map_permission)?;
        temp.write_all(updated.as_bytes())?;
        temp.sync_all()?;
    }
    #[cfg(target_os = "windows")]
    let _ = std::fs::remove_file(path); // rename cannot replace in place on windows
    std::fs::rename(&temp_path, path).map_err(map_permission)?;

    tracing::info!(path = %path.display(), "hosts file updated");
    Ok(())
}

struct LockGuard(PathBuf);

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

/// Best-effort advisory lock: an O_EXCL sibling file, retried with backoff.
fn acquire_lock(lock_path: &Path) -> Result<LockGuard, HostsError> {
    let mut backoff = LOCK_BACKOFF;
    for attempt in 0..LOCK_ATTEMPTS {
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(lock_path)
        {
            Ok(_) => return Ok(LockGuard(lock_path.to_path_buf())),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if lock_is_stale(lock_path) {
                    tracing::warn!(path = %lock_path.display(), "breaking stale hosts lock");
                    let _ = std::fs::remove_file(lock_path);
                    continue;
                }
                if attempt + 1 < LOCK_ATTEMPTS {
                    std::thread::sleep(backoff);
                    backoff *= 2;
                }
            }
            Err(e) => return Err(map_permission(e)),
        }
    }
    Err(HostsError::LockContended(LOCK_ATTEMPTS))
}

fn lock_is_stale(lock_path: &Path) -> bool {
    std::fs::metadata(lock_path)
        .and_then(|meta| meta.modified())
        .map(|modified| {
            modified
                .elapsed()
                .map(|age| age > LOCK_STALE_AFTER)
                .unwrap_or(false)
        })
        .unwrap_or(false)
}

fn map_permission(e: std::io::Error) -> HostsError {
    if e.kind() == std::io::ErrorKind::PermissionDenied {
        HostsError::PermissionDenied(e.to_string())
    } else {
        HostsError::Io(e)
    }
}

/// Dominant line ending of the file; new block lines follow it.
fn line_ending(content: &str) -> &'static str {
    if content.contains("\r\n") {
        "\r\n"
    } else {
        "\n"
    }
}

fn render_block(aliases: &[String], eol: &str) -> String {
    let mut block = String::new();
    block.push_str(MARKER_START);
    block.push_str(eol);
    for alias in aliases {
        block.push_str("127.0.0.1 ");
        block.push_str(alias);
        block.push_str(eol);
    }
    block.push_str(MARKER_END);
    block
}

/// Byte range of the block, from the start of the BEGIN-marker line to the
/// end of the END-marker line (exclusive of its newline).
fn block_range(content: &str) -> Option<(usize, usize)> {
    let start = content.find(MARKER_START)?;
    let end_marker = content[start..].find(MARKER_END)? + start;

    let line_start = content[..start].rfind('\n').map(|i| i + 1).unwrap_or(0);
    let end = end_marker + MARKER_END.len();
    Some((line_start, end))
}

/// Replaces (or appends) the block; everything outside it is preserved.
fn upsert_block(content: &str, aliases: &[String]) -> String {
    let eol = line_ending(content);
    let block = render_block(aliases, eol);

    if let Some((start, end)) = block_range(content) {
        let mut updated = String::with_capacity(content.len());
        updated.push_str(&content[..start]);
        updated.push_str(&block);
        updated.push_str(&content[end..]);
        updated
    } else {
        let mut updated = String::with_capacity(content.len() + block.len() + 2);
        updated.push_str(content);
        if !content.is_empty() && !content.ends_with('\n') {
            updated.push_str(eol);
        }
        updated.push_str(&block);
        updated.push_str(eol);
        updated
    }
}

/// Removes the block and its markers plus the single trailing newline.
fn strip_block(content: &str) -> String {
    let Some((start, mut end)) = block_range(content) else {
        return content.to_string();
    };

    // Take at most one adjacent trailing line ending with the block.
    if content[end..].starts_with("\r\n") {
        end += 2;
    } else if content[end..].starts_with('\n') {
        end += 1;
    }

    let mut updated = String::with_capacity(content.len());
    updated.push_str(&content[..start]);
    updated.push_str(&content[end..]);
    updated
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aliases() -> Vec<String> {
        vec![
            "osu.ppy.sh".to_string(),
            "c.ppy.sh".to_string(),
            "osu.localhost".to_string(),
        ]
    }

    #[test]
    fn test_append_block_to_plain_file() {
        let content = "127.0.0.1 localhost\n";
        let updated = upsert_block(content, &aliases());

        assert!(updated.starts_with("127.0.0.1 localhost\n"));
        assert!(updated.contains("# BEGIN rai-connect\n"));
        assert!(updated.contains("127.0.0.1 osu.ppy.sh\n"));
        assert!(updated.contains("127.0.0.1 c.ppy.sh\n"));
        assert!(updated.ends_with("# END rai-connect\n"));
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let once = upsert_block("127.0.0.1 localhost\n", &aliases());
        let twice = upsert_block(&once, &aliases());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_upsert_replaces_old_alias_set() {
        let with_a = upsert_block("# mine\n", &aliases());
        let b = vec!["b.ppy.sh".to_string()];
        let with_b = upsert_block(&with_a, &b);

        assert!(!with_b.contains("osu.ppy.sh"));
        assert!(with_b.contains("127.0.0.1 b.ppy.sh\n"));
        assert_eq!(with_b.matches(MARKER_START).count(), 1);
        assert!(with_b.starts_with("# mine\n"));

        // Jumping straight to set B converges on the same file.
        let direct = upsert_block("# mine\n", &b);
        assert_eq!(with_b, direct);
    }

    #[test]
    fn test_surrounding_lines_untouched() {
        let content = "10.0.0.1 router\n\n# custom comment\n";
        let updated = upsert_block(content, &aliases());
        let stripped = strip_block(&updated);
        assert_eq!(stripped, content);
    }

    #[test]
    fn test_strip_without_block_is_identity() {
        let content = "127.0.0.1 localhost\n";
        assert_eq!(strip_block(content), content);
    }

    #[test]
    fn test_block_in_middle_of_file() {
        let content = format!(
            "top\n{}\n127.0.0.1 osu.ppy.sh\n{}\nbottom\n",
            MARKER_START, MARKER_END
        );
        let updated = upsert_block(&content, &["a.ppy.sh".to_string()]);
        assert!(updated.starts_with("top\n"));
        assert!(updated.ends_with("bottom\n"));
        assert!(updated.contains("127.0.0.1 a.ppy.sh\n"));
        assert!(!updated.contains("osu.ppy.sh"));

        let stripped = strip_block(&updated);
        assert_eq!(stripped, "top\nbottom\n");
    }

    #[test]
    fn test_crlf_file_keeps_crlf() {
        let content = "127.0.0.1 localhost\r\n";
        let updated = upsert_block(content, &aliases());
        assert!(updated.contains("# BEGIN rai-connect\r\n"));
        assert!(updated.contains("127.0.0.1 osu.ppy.sh\r\n"));

        let stripped = strip_block(&updated);
        assert_eq!(stripped, content);
    }

    #[test]
    fn test_file_without_trailing_newline() {
        let content = "127.0.0.1 localhost";
        let updated = upsert_block(content, &aliases());
        assert!(updated.starts_with("127.0.0.1 localhost\n# BEGIN rai-connect\n"));
    }

    #[test]
    fn test_ensure_and_remove_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        std::fs::write(&path, "127.0.0.1 localhost\n# tail\n").unwrap();

        ensure_aliases(&path, &aliases()).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains(MARKER_START));
        assert!(content.contains("127.0.0.1 osu.localhost"));

        // Same input again: the file does not change at all.
        ensure_aliases(&path, &aliases()).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), content);

        remove_block(&path).unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "127.0.0.1 localhost\n# tail\n"
        );
    }

    #[test]
    fn test_contended_lock_fails_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        std::fs::write(&path, "").unwrap();

        // Simulate a live competitor holding the lock.
        let lock_path = PathBuf::from(format!("{}.rai-connect.lock", path.display()));
        std::fs::write(&lock_path, "").unwrap();

        let err = ensure_aliases(&path, &aliases()).unwrap_err();
        assert!(matches!(err, HostsError::LockContended(_)));

        std::fs::remove_file(&lock_path).unwrap();
        ensure_aliases(&path, &aliases()).unwrap();
    }

    #[test]
    fn test_missing_hosts_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist");
        assert!(matches!(
            ensure_aliases(&path, &aliases()),
            Err(HostsError::Io(_))
        ));
    }
}
