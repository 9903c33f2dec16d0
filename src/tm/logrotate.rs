use anyhow::Context as _;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

/// Append-only log sink that switches to `<base>.N+1` once the current file
/// has reached the size threshold and keeps at most `max_files` files.
///
/// Rotation state and the size/count limits live behind one mutex so a
/// runtime reconfiguration is atomic with respect to rotation decisions.
#[derive(Debug)]
pub struct FileRotator {
    dir: PathBuf,
    base_name: String,
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    max_files: usize,
    max_file_size: u64,
    file: Option<fs::File>,
    current_index: u64,
    current_size: u64,
    closed: bool,
}

impl FileRotator {
    /// Set up a rotator for `<dir>/<base_name>.N`.
    ///
    /// Picks up where an earlier incarnation left off: the highest existing
    /// index becomes the current file. No file is created until the first
    /// write arrives.
    pub fn new(dir: &Path, base_name: &str, max_files: usize, max_file_size: u64) -> anyhow::Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("create log dir {}", dir.display()))?;
        let rotator = Self {
            dir: dir.to_path_buf(),
            base_name: base_name.to_string(),
            inner: Mutex::new(Inner {
                max_files,
                max_file_size,
                file: None,
                current_index: 0,
                current_size: 0,
                closed: false,
            }),
        };
        let last = rotator.last_existing_index()?;
        {
            let mut inner = rotator.inner.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(idx) = last {
                inner.current_index = idx;
                inner.current_size = fs::metadata(rotator.path_for(idx))
                    .map(|m| m.len())
                    .unwrap_or(0);
            }
        }
        Ok(rotator)
    }

    /// Append `buf`, rotating first if the current file has already reached
    /// the size limit. A file sitting exactly at the limit rotates on this
    /// write, not earlier.
    pub fn write_all(&self, buf: &[u8]) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if inner.closed {
            anyhow::bail!("log rotator for {} is closed", self.base_name);
        }
        if inner.file.is_some() && inner.current_size >= inner.max_file_size {
            let next = inner.current_index + 1;
            self.open_index(&mut inner, next)?;
            self.prune(&inner);
        }
        if inner.file.is_none() {
            let idx = inner.current_index;
            self.open_index(&mut inner, idx)?;
        }
        if let Some(f) = inner.file.as_mut() {
            f.write_all(buf)
                .with_context(|| format!("write {}", self.path_for(inner.current_index).display()))?;
        }
        inner.current_size += buf.len() as u64;
        Ok(())
    }

    /// Re-apply the size/count limits at runtime.
    pub fn set_config(&self, max_files: usize, max_file_size: u64) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.max_files = max_files;
        inner.max_file_size = max_file_size;
    }

    /// Current `(max_files, max_file_size)` limits.
    pub fn config(&self) -> (usize, u64) {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        (inner.max_files, inner.max_file_size)
    }

    pub fn flush(&self) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(f) = inner.file.as_mut() {
            f.flush().context("flush log file")?;
        }
        Ok(())
    }

    /// Flush and drop the current file. Further writes fail.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(mut f) = inner.file.take() {
            let _ = f.flush();
        }
        inner.closed = true;
    }

    fn path_for(&self, index: u64) -> PathBuf {
        self.dir.join(format!("{}.{}", self.base_name, index))
    }

    fn open_index(&self, inner: &mut Inner, index: u64) -> anyhow::Result<()> {
        let path = self.path_for(index);
        let f = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open log {}", path.display()))?;
        inner.current_size = f.metadata().map(|m| m.len()).unwrap_or(0);
        inner.current_index = index;
        inner.file = Some(f);
        Ok(())
    }

    /// Drop files that fell out of the retention window.
    fn prune(&self, inner: &Inner) {
        if inner.max_files == 0 || inner.current_index + 1 <= inner.max_files as u64 {
            return;
        }
        let cutoff = inner.current_index + 1 - inner.max_files as u64;
        for idx in 0..cutoff {
            let path = self.path_for(idx);
            if !path.exists() {
                continue;
            }
            if let Err(e) = fs::remove_file(&path) {
                warn!("pruning rotated log {} failed: {e}", path.display());
            }
        }
    }

    fn last_existing_index(&self) -> anyhow::Result<Option<u64>> {
        let prefix = format!("{}.", self.base_name);
        let mut last: Option<u64> = None;
        for ent in fs::read_dir(&self.dir).with_context(|| format!("read_dir {}", self.dir.display()))? {
            let ent = ent?;
            let name = ent.file_name();
            let name = name.to_string_lossy();
            let Some(idx) = name.strip_prefix(&prefix) else {
                continue;
            };
            let Ok(idx) = idx.parse::<u64>() else {
                continue;
            };
            last = Some(last.map_or(idx, |l: u64| l.max(idx)));
        }
        Ok(last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn first_write_lands_in_index_zero() {
        let dir = tempdir().unwrap();
        let rot = FileRotator::new(dir.path(), "web.stdout", 3, 1024).unwrap();
        // no file until something is written
        assert!(!dir.path().join("web.stdout.0").exists());

        rot.write_all(b"hi\n").unwrap();
        rot.flush().unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("web.stdout.0")).unwrap(), "hi\n");
    }

    #[test]
    fn rotates_on_the_write_after_reaching_the_limit() {
        let dir = tempdir().unwrap();
        let rot = FileRotator::new(dir.path(), "web.stdout", 10, 4).unwrap();

        // lands exactly at the limit: stays in .0
        rot.write_all(b"abcd").unwrap();
        assert!(dir.path().join("web.stdout.0").exists());
        assert!(!dir.path().join("web.stdout.1").exists());

        // next write rotates first
        rot.write_all(b"e").unwrap();
        rot.flush().unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("web.stdout.0")).unwrap(), "abcd");
        assert_eq!(fs::read_to_string(dir.path().join("web.stdout.1")).unwrap(), "e");
    }

    #[test]
    fn keeps_at_most_max_files() {
        let dir = tempdir().unwrap();
        let rot = FileRotator::new(dir.path(), "web.stderr", 2, 1).unwrap();
        for chunk in [b"a", b"b", b"c", b"d"] {
            rot.write_all(chunk).unwrap();
        }
        // indexes 0..=3 were written; only the last two remain
        assert!(!dir.path().join("web.stderr.0").exists());
        assert!(!dir.path().join("web.stderr.1").exists());
        assert!(dir.path().join("web.stderr.2").exists());
        assert!(dir.path().join("web.stderr.3").exists());
    }

    #[test]
    fn reconfiguration_applies_to_later_rotation_decisions() {
        let dir = tempdir().unwrap();
        let rot = FileRotator::new(dir.path(), "web.stdout", 3, 2).unwrap();
        rot.write_all(b"xx").unwrap();

        rot.set_config(5, 8);
        assert_eq!(rot.config(), (5, 8));

        // .0 holds 2 bytes, below the new 8-byte limit: no rotation yet
        rot.write_all(b"yyyy").unwrap();
        assert!(!dir.path().join("web.stdout.1").exists());

        // now at 6+ bytes; pushing past 8 rotates on the following write
        rot.write_all(b"zz").unwrap();
        rot.write_all(b"!").unwrap();
        assert!(dir.path().join("web.stdout.1").exists());
    }

    #[test]
    fn resumes_from_the_highest_existing_index() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("web.stdout.0"), "old").unwrap();
        fs::write(dir.path().join("web.stdout.2"), "older").unwrap();

        let rot = FileRotator::new(dir.path(), "web.stdout", 3, 1024).unwrap();
        rot.write_all(b"+new").unwrap();
        rot.flush().unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("web.stdout.2")).unwrap(), "older+new");
    }

    #[test]
    fn writes_after_close_fail() {
        let dir = tempdir().unwrap();
        let rot = FileRotator::new(dir.path(), "web.stdout", 3, 1024).unwrap();
        rot.write_all(b"x").unwrap();
        rot.close();
        assert!(rot.write_all(b"y").is_err());
    }
}
