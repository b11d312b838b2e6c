#![forbid(unsafe_code)]

//! Disk-space-bounded retention for the download directory.
//!
//! The download directory is a single flat folder; the filesystem itself is
//! the only data model. `StorageRoot` is passed explicitly to everything that
//! touches the directory so tests can run against isolated temporary roots.
//!
//! The quota is a soft limit: it is probed once at the start of a download
//! request, and when exceeded a best-effort sweep deletes entries older than
//! the retention window. If the sweep frees too little, the new download
//! still proceeds.

use std::{
    fs, io,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use tracing::{info, warn};

/// 5 GiB quota on the total bytes held in the download directory.
pub const QUOTA_BYTES: u64 = 5 * 1024 * 1024 * 1024;

/// Files older than this are eligible for deletion once the quota trips.
pub const RETENTION_WINDOW: Duration = Duration::from_secs(60 * 60);

const FILE_PREFIX: &str = "video";

#[derive(Debug, Clone)]
pub struct StorageRoot {
    dir: PathBuf,
    quota_bytes: u64,
    retention: Duration,
}

impl StorageRoot {
    pub fn new(dir: PathBuf) -> Self {
        Self::with_limits(dir, QUOTA_BYTES, RETENTION_WINDOW)
    }

    /// Same as [`StorageRoot::new`] with custom limits, mainly so tests do
    /// not have to materialize gigabytes on disk.
    pub fn with_limits(dir: PathBuf, quota_bytes: u64, retention: Duration) -> Self {
        Self {
            dir,
            quota_bytes,
            retention,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Creates the download directory if it does not exist yet. Called once
    /// at startup; subsequent operations assume the directory is there.
    pub fn ensure_exists(&self) -> io::Result<()> {
        fs::create_dir_all(&self.dir)
    }

    /// Sums the size of every entry currently in the directory. Recomputed
    /// on each call; the directory is small enough that caching would only
    /// add staleness.
    pub fn usage_bytes(&self) -> io::Result<u64> {
        let mut total = 0u64;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            total = total.saturating_add(meta.len());
        }
        Ok(total)
    }

    /// True when stored bytes strictly exceed the quota. A failed scan is
    /// logged and reported as under-quota so the quota probe can never block
    /// an incoming download request.
    pub fn over_quota(&self) -> bool {
        match self.usage_bytes() {
            Ok(total) => total > self.quota_bytes,
            Err(err) => {
                warn!(dir = %self.dir.display(), error = %err, "storage scan failed");
                false
            }
        }
    }

    /// Deletes every entry older than the retention window. Individual
    /// deletion failures are logged and skipped; one stubborn file must not
    /// shield the rest of the directory from the sweep.
    pub fn sweep_stale(&self) {
        let cutoff = match SystemTime::now().checked_sub(self.retention) {
            Some(cutoff) => cutoff,
            None => return,
        };
        self.sweep_older_than(cutoff);
    }

    fn sweep_older_than(&self, cutoff: SystemTime) {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(dir = %self.dir.display(), error = %err, "cleanup scan failed");
                return;
            }
        };

        for entry in entries {
            let Ok(entry) = entry else { continue };
            let path = entry.path();
            let modified = entry.metadata().and_then(|meta| meta.modified());
            let Ok(modified) = modified else { continue };
            if modified >= cutoff {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => info!(file = %path.display(), "cleaned up stale download"),
                Err(err) => {
                    warn!(file = %path.display(), error = %err, "failed to clean up download");
                }
            }
        }
    }
}

/// Builds the stored filename for a fetched media file:
/// `video_<unix_timestamp>_<title>.<ext>`. The title comes from the
/// extractor and is sanitized before it touches the filesystem.
pub fn media_file_name(timestamp: i64, title: &str, ext: &str) -> String {
    let title = sanitize_file_name(title);
    let title = if title.is_empty() { "media" } else { title.as_str() };
    format!("{FILE_PREFIX}_{timestamp}_{title}.{ext}")
}

/// Reduces an arbitrary requested name to a single safe path segment.
///
/// Path separators and whitespace become underscores, anything outside
/// `[A-Za-z0-9._-]` is dropped, runs of underscores collapse, and leading
/// dots/underscores are stripped so the result can never traverse out of
/// the download directory. May return an empty string.
pub fn sanitize_file_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        match c {
            '/' | '\\' => out.push('_'),
            c if c.is_whitespace() => out.push('_'),
            c if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') => out.push(c),
            _ => {}
        }
    }

    let mut collapsed = String::with_capacity(out.len());
    let mut last_was_underscore = false;
    for c in out.chars() {
        if c == '_' {
            if !last_was_underscore {
                collapsed.push(c);
            }
            last_was_underscore = true;
        } else {
            collapsed.push(c);
            last_was_underscore = false;
        }
    }

    collapsed
        .trim_start_matches(['.', '_'])
        .trim_end_matches('_')
        .to_string()
}
