//! Append-only record of every file move, one JSON object per line.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MovementStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovementEntry {
    pub timestamp: DateTime<Utc>,
    pub source_path: PathBuf,
    pub destination_path: PathBuf,
    pub status: MovementStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub dry_run: bool,
}

impl MovementEntry {
    pub fn success(source: &Path, destination: &Path, job_id: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            source_path: source.to_path_buf(),
            destination_path: destination.to_path_buf(),
            status: MovementStatus::Success,
            job_id: Some(job_id.to_string()),
            error_message: None,
            dry_run: false,
        }
    }

    pub fn failed(source: &Path, destination: &Path, job_id: &str, error: impl Into<String>) -> Self {
        Self {
            status: MovementStatus::Failed,
            error_message: Some(error.into()),
            ..Self::success(source, destination, job_id)
        }
    }

    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MovementStats {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub latest: Option<MovementEntry>,
}

pub struct MovementLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl MovementLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, ()> {
        match self.lock.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn io_error(&self, source: std::io::Error) -> StorageError {
        StorageError::MovementLog {
            path: self.path.clone(),
            source,
        }
    }

    pub fn record(&self, entry: &MovementEntry) -> Result<(), StorageError> {
        let _guard = self.guard();

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }

        let line = serde_json::to_string(entry)
            .map_err(|e| self.io_error(std::io::Error::other(e)))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| self.io_error(e))?;
        writeln!(file, "{}", line).map_err(|e| self.io_error(e))?;

        log::debug!(
            "Logged movement {} -> {} ({:?})",
            entry.source_path.display(),
            entry.destination_path.display(),
            entry.status
        );
        Ok(())
    }

    fn read_entries(&self) -> Result<Vec<MovementEntry>, StorageError> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.io_error(e)),
        };

        let mut entries = Vec::new();
        for (number, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| self.io_error(e))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(entry) => entries.push(entry),
                Err(e) => log::warn!(
                    "Skipping unreadable movement log line {} in {}: {}",
                    number + 1,
                    self.path.display(),
                    e
                ),
            }
        }
        Ok(entries)
    }

    /// Most recent entries first.
    pub fn read_all(&self, limit: Option<usize>) -> Result<Vec<MovementEntry>, StorageError> {
        let _guard = self.guard();
        let mut entries = self.read_entries()?;
        entries.reverse();
        if let Some(limit) = limit {
            entries.truncate(limit);
        }
        Ok(entries)
    }

    pub fn by_job(&self, job_id: &str) -> Result<Vec<MovementEntry>, StorageError> {
        let _guard = self.guard();
        Ok(self
            .read_entries()?
            .into_iter()
            .filter(|e| e.job_id.as_deref() == Some(job_id))
            .collect())
    }

    pub fn by_status(&self, status: MovementStatus) -> Result<Vec<MovementEntry>, StorageError> {
        let _guard = self.guard();
        Ok(self
            .read_entries()?
            .into_iter()
            .filter(|e| e.status == status)
            .collect())
    }

    pub fn stats(&self) -> Result<MovementStats, StorageError> {
        let _guard = self.guard();
        let entries = self.read_entries()?;
        Ok(MovementStats {
            total: entries.len(),
            successful: entries
                .iter()
                .filter(|e| e.status == MovementStatus::Success)
                .count(),
            failed: entries
                .iter()
                .filter(|e| e.status == MovementStatus::Failed)
                .count(),
            latest: entries.last().cloned(),
        })
    }

    pub fn clear(&self) -> Result<(), StorageError> {
        let _guard = self.guard();
        match fs::remove_file(&self.path) {
            Ok(()) => {
                log::info!("Cleared movement log {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.io_error(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn log_in(dir: &TempDir) -> MovementLog {
        MovementLog::new(dir.path().join("logs").join("movements.jsonl"))
    }

    #[test]
    fn test_missing_log_reads_empty() {
        let dir = TempDir::new().unwrap();
        let log = log_in(&dir);
        assert!(log.read_all(None).unwrap().is_empty());
        assert_eq!(log.stats().unwrap(), MovementStats::default());
    }

    #[test]
    fn test_record_and_read_newest_first() {
        let dir = TempDir::new().unwrap();
        let log = log_in(&dir);

        log.record(&MovementEntry::success(Path::new("/in/a.mkv"), Path::new("/lib/A.mkv"), "job-a"))
            .unwrap();
        log.record(&MovementEntry::failed(
            Path::new("/in/b.mkv"),
            Path::new("/lib/B.mkv"),
            "job-b",
            "permission denied",
        ))
        .unwrap();

        let all = log.read_all(None).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].job_id.as_deref(), Some("job-b"));

        let limited = log.read_all(Some(1)).unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn test_filters_and_stats() {
        let dir = TempDir::new().unwrap();
        let log = log_in(&dir);

        log.record(&MovementEntry::success(Path::new("/in/a.mkv"), Path::new("/lib/A.mkv"), "job-a"))
            .unwrap();
        log.record(&MovementEntry::success(Path::new("/in/a.srt"), Path::new("/lib/A.srt"), "job-b"))
            .unwrap();
        log.record(&MovementEntry::failed(Path::new("/in/c.mkv"), Path::new("/lib/C.mkv"), "job-a", "boom"))
            .unwrap();

        assert_eq!(log.by_job("job-a").unwrap().len(), 2);
        assert_eq!(log.by_status(MovementStatus::Failed).unwrap().len(), 1);

        let stats = log.stats().unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.successful, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(
            stats.latest.map(|e| e.source_path),
            Some(PathBuf::from("/in/c.mkv"))
        );
    }

    #[test]
    fn test_corrupt_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        let log = log_in(&dir);
        log.record(&MovementEntry::success(Path::new("/in/a.mkv"), Path::new("/lib/A.mkv"), "job-a"))
            .unwrap();

        let mut file = OpenOptions::new().append(true).open(log.path()).unwrap();
        writeln!(file, "{{ truncated").unwrap();

        assert_eq!(log.read_all(None).unwrap().len(), 1);
    }

    #[test]
    fn test_clear() {
        let dir = TempDir::new().unwrap();
        let log = log_in(&dir);
        log.record(&MovementEntry::success(Path::new("/in/a.mkv"), Path::new("/lib/A.mkv"), "job-a"))
            .unwrap();
        log.clear().unwrap();
        assert!(log.read_all(None).unwrap().is_empty());
        log.clear().unwrap();
    }
}
