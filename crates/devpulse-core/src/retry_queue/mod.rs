//! Persistent retry queue
//!
//! An ndjson file with one failed delivery per line. Producers append on
//! failure; a single periodic drain redelivers every line and rewrites the
//! file with the survivors via temp-file + rename, deleting it when nothing
//! survives.

use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::future::Future;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;

/// What a drain should do with a line after a redelivery attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineOutcome {
    /// Delivered; drop the line
    Delivered,
    /// Delivery failed; keep the line verbatim for the next drain
    Retry,
    /// Line is unusable; drop it without delivering
    Discard,
}

/// Summary of one drain pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub delivered: usize,
    pub retained: usize,
    pub discarded: usize,
}

impl DrainReport {
    /// Total lines looked at
    pub fn total(&self) -> usize {
        self.delivered + self.retained + self.discarded
    }
}

/// A line-oriented on-disk queue
pub struct PersistentQueue {
    path: PathBuf,
    /// Serializes appends against the snapshot/rewrite steps of a drain.
    /// Never held across a redelivery.
    io_lock: Mutex<()>,
}

impl PersistentQueue {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            io_lock: Mutex::new(()),
        }
    }

    /// Path of the queue file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the temp file used while rewriting
    pub fn temp_path(&self) -> PathBuf {
        let mut name: OsString = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }

    /// Append one payload as a line, creating the file and parent directories
    pub fn append(&self, payload: &[u8]) -> Result<()> {
        if payload.contains(&b'\n') {
            bail!("Queue payload must not contain a newline");
        }

        let _guard = self.io_lock.lock();

        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create queue directory: {}", dir.display()))?;
        }

        let mut line = Vec::with_capacity(payload.len() + 1);
        line.extend_from_slice(payload);
        line.push(b'\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open queue file: {}", self.path.display()))?;
        file.write_all(&line)
            .with_context(|| format!("Failed to append to queue file: {}", self.path.display()))?;
        Ok(())
    }

    /// Lines currently in the queue, in file order
    pub fn pending(&self) -> Result<Vec<String>> {
        let _guard = self.io_lock.lock();
        let bytes = match read_if_exists(&self.path)? {
            Some(b) => b,
            None => return Ok(Vec::new()),
        };
        Ok(split_lines(&bytes)
            .into_iter()
            .map(|l| String::from_utf8_lossy(l).into_owned())
            .collect())
    }

    /// Redeliver every line once, then rewrite the file with the lines that
    /// must be retried.
    ///
    /// Lines are attempted in file order and independently. Lines appended
    /// while redeliveries are in flight are kept after the retained ones.
    /// A missing file is an empty queue.
    pub async fn drain<F, Fut>(&self, mut redeliver: F) -> Result<DrainReport>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = LineOutcome>,
    {
        let snapshot = {
            let _guard = self.io_lock.lock();
            match read_if_exists(&self.path)? {
                Some(b) => b,
                None => return Ok(DrainReport::default()),
            }
        };

        let mut report = DrainReport::default();
        let mut retained: Vec<&[u8]> = Vec::new();
        for line in split_lines(&snapshot) {
            match redeliver(String::from_utf8_lossy(line).into_owned()).await {
                LineOutcome::Delivered => report.delivered += 1,
                LineOutcome::Discard => report.discarded += 1,
                LineOutcome::Retry => {
                    report.retained += 1;
                    retained.push(line);
                }
            }
        }

        let _guard = self.io_lock.lock();
        let current = read_if_exists(&self.path)?.unwrap_or_default();
        let appended = if current.len() >= snapshot.len() && current.starts_with(&snapshot) {
            &current[snapshot.len()..]
        } else {
            &[][..]
        };

        let mut content = Vec::new();
        for line in &retained {
            content.extend_from_slice(line);
            content.push(b'\n');
        }
        content.extend_from_slice(appended);

        if content.is_empty() {
            match fs::remove_file(&self.path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("Failed to remove drained queue: {}", self.path.display())
                    })
                }
            }
        } else {
            self.write_atomic(&content)?;
        }

        Ok(report)
    }

    /// Replace the queue file with `content` via temp file + fsync + rename
    fn write_atomic(&self, content: &[u8]) -> Result<()> {
        let temp_path = self.temp_path();

        // Leftover from a crash mid-rewrite
        let _ = fs::remove_file(&temp_path);

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)
            .with_context(|| format!("Failed to create temp queue file: {:?}", temp_path))?;

        file.write_all(content)
            .with_context(|| format!("Failed to write temp queue file: {:?}", temp_path))?;

        file.sync_all()
            .with_context(|| format!("Failed to sync temp queue file: {:?}", temp_path))?;

        fs::rename(&temp_path, &self.path)
            .with_context(|| format!("Failed to rename queue file: {:?}", self.path))?;

        Ok(())
    }
}

fn read_if_exists(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(b) => Ok(Some(b)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to read queue file: {}", path.display())),
    }
}

/// Non-empty lines without their terminators
fn split_lines(bytes: &[u8]) -> Vec<&[u8]> {
    bytes
        .split(|&b| b == b'\n')
        .filter(|l| !l.is_empty())
        .collect()
}
