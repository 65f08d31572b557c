//! Size-based log file rotation
//!
//! The active file is rotated onto numbered suffixes once it exceeds the
//! configured size:
//!
//! - `proxy.log` - current active log
//! - `proxy.log.1` - most recent rotated file
//! - `proxy.log.2` - next oldest
//! - etc.
//!
//! Files past the backup count are deleted, and rotated files older than
//! the age limit are pruned at each rotation.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::config::RotationConfig;

const BYTES_PER_MEGABYTE: u64 = 1024 * 1024;
const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// Append-only writer that rotates the file by size
pub struct RollingWriter {
    path: PathBuf,
    max_size_bytes: u64,
    max_backups: u32,
    max_age: Option<Duration>,
    file: File,
    written: u64,
}

impl RollingWriter {
    /// Open (or create) the active log file
    ///
    /// # Errors
    ///
    /// Propagates filesystem errors; an unwritable log path is a startup
    /// failure.
    pub fn open(path: impl Into<PathBuf>, rotation: &RotationConfig) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata()?.len();

        Ok(Self {
            path,
            max_size_bytes: rotation.max_size.max(1) * BYTES_PER_MEGABYTE,
            max_backups: rotation.max_backups,
            max_age: (rotation.max_age > 0)
                .then(|| Duration::from_secs(u64::from(rotation.max_age) * SECS_PER_DAY)),
            file,
            written,
        })
    }

    fn backup_path(&self, index: u32) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(format!(".{index}"));
        PathBuf::from(name)
    }

    /// Shift numbered backups, retire the active file, and reopen it
    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;

        if self.max_backups == 0 {
            // No backups kept; restart the active file in place
            self.file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&self.path)?;
            self.written = 0;
            return Ok(());
        }

        let _ = fs::remove_file(self.backup_path(self.max_backups));
        for index in (1..self.max_backups).rev() {
            let from = self.backup_path(index);
            if from.exists() {
                let _ = fs::rename(&from, self.backup_path(index + 1));
            }
        }
        fs::rename(&self.path, self.backup_path(1))?;

        self.prune_old();

        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.written = 0;
        Ok(())
    }

    /// Delete rotated files older than the age limit
    fn prune_old(&self) {
        let Some(max_age) = self.max_age else { return };
        let now = SystemTime::now();

        for index in 1..=self.max_backups {
            let path = self.backup_path(index);
            if let Some(age) = file_age(&path, now) {
                if age > max_age {
                    let _ = fs::remove_file(&path);
                }
            }
        }
    }
}

fn file_age(path: &Path, now: SystemTime) -> Option<Duration> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    now.duration_since(modified).ok()
}

impl Write for RollingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written + buf.len() as u64 > self.max_size_bytes {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}
