use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub enum FeedStatus {
    InProgress,
    Completed,
    Interrupted,
    Failed,
}

/// One served install file, as the feeder daemon saw it.
#[derive(Serialize, Deserialize, Debug)]
pub struct FeedLogEntry {
    pub timestamp: String,
    pub session: String,
    pub file: PathBuf,
    pub file_idx: i16,
    pub blocks_sent: u64,
    pub bytes_sent: u64,
    pub status: FeedStatus,
    pub error: Option<String>,
}

impl FeedLogEntry {
    pub fn new(session: &str, file: &Path, file_idx: i16) -> Self {
        FeedLogEntry {
            timestamp: Utc::now().to_rfc3339(),
            session: session.to_string(),
            file: file.to_path_buf(),
            file_idx,
            blocks_sent: 0,
            bytes_sent: 0,
            status: FeedStatus::InProgress,
            error: None,
        }
    }
}

/// Append-only JSONL log of everything a feeder session served.
pub struct FeedLog {
    log_file_path: PathBuf,
}

impl FeedLog {
    pub fn new(path: &Path) -> Self {
        FeedLog {
            log_file_path: path.to_path_buf(),
        }
    }

    pub fn add_entry(&self, entry: &FeedLogEntry) -> Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file_path)
            .context("failed to open feed log file")?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, entry)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    pub fn read_log(&self) -> Result<Vec<FeedLogEntry>> {
        if !self.log_file_path.exists() {
            return Ok(Vec::new());
        }
        let file =
            File::open(&self.log_file_path).context("failed to open feed log file for reading")?;
        let reader = BufReader::new(file);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: FeedLogEntry = serde_json::from_str(&line)?;
            entries.push(entry);
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feed_log_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let log = FeedLog::new(&dir.path().join("feed.jsonl"));

        let mut entry = FeedLogEntry::new("session-1", Path::new("pkg.apk"), 0);
        entry.blocks_sent = 3;
        entry.bytes_sent = 3 * 4096;
        entry.status = FeedStatus::Completed;
        log.add_entry(&entry).unwrap();
        log.add_entry(&FeedLogEntry::new("session-1", Path::new("pkg2.apk"), 1))
            .unwrap();

        let entries = log.read_log().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].status, FeedStatus::Completed);
        assert_eq!(entries[0].blocks_sent, 3);
        assert_eq!(entries[1].file_idx, 1);
        assert_eq!(entries[1].status, FeedStatus::InProgress);
    }

    #[test]
    fn test_missing_log_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = FeedLog::new(&dir.path().join("absent.jsonl"));
        assert!(log.read_log().unwrap().is_empty());
    }
}
