//! File-log detection sink.
//!
//! Writes the outlined original frame to a pattern-derived path per match
//! and tracks every written image in an index log (`path|epoch_ms` lines)
//! so a periodic sweep can unlink images older than the retention window.
//! All access to the index goes through a `FileOperationQueue`: a single
//! drain thread performs queued append/overwrite/read operations one at a
//! time, so concurrent requests never interleave at the byte level.

use anyhow::{anyhow, Context, Result};
use chrono::Local;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Mutex, OnceLock};
use std::thread::JoinHandle;

use super::PlateRecorder;
use crate::detect::DetectionResult;
use crate::frame::RawImage;
use crate::ingest::CaptureSource;

const TOKEN_DATE: &str = "{date}";
const TOKEN_TIME: &str = "{time}";
const TOKEN_SOURCE: &str = "{source}";
const TOKEN_PLATE: &str = "{plate}";

pub const DEFAULT_RETAIN_DAYS: u32 = 30;
const INDEX_FILE: &str = "plate_images.log";
const MS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

enum FileOperation {
    Append(String),
    Overwrite(String),
    Read(Sender<Result<String>>),
}

/// Serializes all access to one log file through a single drain thread.
pub struct FileOperationQueue {
    tx: Option<Sender<FileOperation>>,
    handle: Option<JoinHandle<()>>,
}

impl FileOperationQueue {
    pub fn new(file: PathBuf) -> Self {
        let (tx, rx) = channel::<FileOperation>();
        let handle = std::thread::spawn(move || {
            for op in rx {
                match op {
                    FileOperation::Append(data) => {
                        if let Err(e) = append_to(&file, &data) {
                            log::warn!("file queue: append to {} failed: {}", file.display(), e);
                        }
                    }
                    FileOperation::Overwrite(data) => {
                        if let Err(e) = fs::write(&file, &data) {
                            log::warn!("file queue: overwrite of {} failed: {}", file.display(), e);
                        }
                    }
                    FileOperation::Read(reply) => {
                        let data = match fs::read_to_string(&file) {
                            Ok(data) => Ok(data),
                            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                                Ok(String::new())
                            }
                            Err(e) => Err(anyhow!("read {}: {}", file.display(), e)),
                        };
                        let _ = reply.send(data);
                    }
                }
            }
        });
        Self {
            tx: Some(tx),
            handle: Some(handle),
        }
    }

    pub fn append(&self, data: String) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(FileOperation::Append(data));
        }
    }

    pub fn overwrite(&self, data: String) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(FileOperation::Overwrite(data));
        }
    }

    /// Read the whole log. Queued behind any pending writes; a missing file
    /// reads as empty.
    pub fn read(&self) -> Result<String> {
        let tx = self.tx.as_ref().ok_or_else(|| anyhow!("queue closed"))?;
        let (reply_tx, reply_rx) = channel();
        tx.send(FileOperation::Read(reply_tx))
            .map_err(|_| anyhow!("queue worker exited"))?;
        reply_rx.recv().map_err(|_| anyhow!("queue worker exited"))?
    }
}

impl Drop for FileOperationQueue {
    fn drop(&mut self) {
        // Close the channel so the drain thread finishes pending work and
        // exits, then wait for it.
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn append_to(file: &Path, data: &str) -> std::io::Result<()> {
    let mut handle = fs::OpenOptions::new().create(true).append(true).open(file)?;
    handle.write_all(data.as_bytes())?;
    handle.sync_all()
}

/// Filename patterns may use path separators and `{date}`, `{time}`,
/// `{source}`, `{plate}` tokens; nothing that can escape the data dir.
pub fn validate_pattern(pattern: &str) -> Result<()> {
    static PATTERN_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = PATTERN_RE.get_or_init(|| regex::Regex::new(r"^[A-Za-z0-9_\-{}/.]+$").unwrap());
    if pattern.is_empty() {
        return Err(anyhow!("pattern cannot be empty"));
    }
    if !re.is_match(pattern) {
        return Err(anyhow!(
            "pattern may only contain alphanumerics, '_', '-', '{{', '}}', '/' or '.'"
        ));
    }
    if pattern.contains("..") {
        return Err(anyhow!("pattern may not contain '..'"));
    }
    Ok(())
}

/// Writes detection images to disk and sweeps them after `retain_days`.
pub struct FilePlateRecorder {
    data_dir: PathBuf,
    pattern: String,
    retain_days: u32,
    queue: Mutex<Option<FileOperationQueue>>,
}

impl FilePlateRecorder {
    pub fn new(data_dir: &Path, pattern: &str, retain_days: u32) -> Result<Self> {
        validate_pattern(pattern)?;
        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            pattern: pattern.to_string(),
            retain_days,
            queue: Mutex::new(None),
        })
    }

    fn image_path(&self, source: &CaptureSource, plate: &str) -> PathBuf {
        let now = Local::now();
        let date = now.format("%Y_%m_%d").to_string();
        let time = now.format("%H_%M_%S_%3f").to_string();
        let relative = self
            .pattern
            .replace(TOKEN_DATE, &date)
            .replace(TOKEN_TIME, &time)
            .replace(TOKEN_SOURCE, source.name())
            .replace(TOKEN_PLATE, plate);
        self.data_dir.join(relative)
    }

    /// Unlink images past retention, prune emptied directories, rewrite the
    /// index with the surviving entries. Run periodically by the daemon.
    pub fn cleanup(&self) -> Result<()> {
        let guard = self.queue.lock().expect("file queue lock");
        let queue = guard
            .as_ref()
            .ok_or_else(|| anyhow!("file recorder is not started"))?;

        let data = queue.read()?;
        let now_ms = Local::now().timestamp_millis();
        let cutoff = self.retain_days as i64 * MS_PER_DAY;
        let mut kept = Vec::new();

        for line in data.lines() {
            let Some((path, stamp)) = line.split_once('|') else {
                continue;
            };
            let Ok(stamp) = stamp.parse::<i64>() else {
                continue;
            };
            if now_ms > stamp + cutoff {
                let path = PathBuf::from(path);
                if let Err(e) = fs::remove_file(&path) {
                    log::warn!("failed to remove {}: {}", path.display(), e);
                }
                if let Some(parent) = path.parent() {
                    prune_empty_dirs(parent, &self.data_dir);
                }
            } else {
                kept.push(line.to_string());
            }
        }

        let mut contents = kept.join("\n");
        if !contents.is_empty() {
            contents.push('\n');
        }
        queue.overwrite(contents);
        Ok(())
    }
}

impl PlateRecorder for FilePlateRecorder {
    fn kind(&self) -> &'static str {
        "file"
    }

    fn start(&self) -> Result<()> {
        fs::create_dir_all(&self.data_dir)
            .with_context(|| format!("create data dir {}", self.data_dir.display()))?;
        let mut guard = self.queue.lock().expect("file queue lock");
        if guard.is_none() {
            *guard = Some(FileOperationQueue::new(self.data_dir.join(INDEX_FILE)));
        }
        Ok(())
    }

    fn record(
        &self,
        detection: &DetectionResult,
        source: &CaptureSource,
        original: &RawImage,
        _filtered: &RawImage,
    ) -> Result<()> {
        let guard = self.queue.lock().expect("file queue lock");
        let queue = guard
            .as_ref()
            .ok_or_else(|| anyhow!("file recorder is not started"))?;

        let jpeg = original.to_jpeg()?;
        for plate in &detection.results {
            let path = self.image_path(source, &plate.plate);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create {}", parent.display()))?;
            }
            fs::write(&path, &jpeg).with_context(|| format!("write {}", path.display()))?;
            queue.append(format!(
                "{}|{}\n",
                path.display(),
                Local::now().timestamp_millis()
            ));
        }
        Ok(())
    }

    fn stop(&self) {
        // Dropping the queue drains pending operations and joins the
        // worker.
        self.queue.lock().expect("file queue lock").take();
    }
}

/// Remove now-empty directories from `dir` up to (but excluding) `root`.
fn prune_empty_dirs(dir: &Path, root: &Path) {
    let mut current = dir.to_path_buf();
    while current.starts_with(root) && current != root {
        let empty = match fs::read_dir(&current) {
            Ok(mut entries) => entries.next().is_none(),
            Err(_) => false,
        };
        if !empty {
            break;
        }
        if fs::remove_dir(&current).is_err() {
            break;
        }
        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => break,
        }
    }
}
