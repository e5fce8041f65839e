use anyhow::Result;
use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

/// Loader event sink. Every method has a no-op default so callers only wire
/// up what they care about.
pub trait Logger: Send + Sync {
    fn prepare_start(&self, _files: usize) {}
    fn copy_done(&self, _name: &str, _bytes: u64) {}
    fn streaming_start(&self) {}
    fn prepare_done(&self, _files: usize) {}
    fn info(&self, _msg: &str) {}
    fn error(&self, _context: &str, _msg: &str) {}
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        if let Ok(mut f) = self.file.lock() {
            let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
        }
    }
}

impl Logger for TextLogger {
    fn prepare_start(&self, files: usize) {
        self.line(&format!("PREPARE files={files}"));
    }
    fn copy_done(&self, name: &str, bytes: u64) {
        self.line(&format!("COPY name={name} bytes={bytes}"));
    }
    fn streaming_start(&self) {
        self.line("STREAMING start");
    }
    fn prepare_done(&self, files: usize) {
        self.line(&format!("DONE files={files}"));
    }
    fn info(&self, msg: &str) {
        self.line(&format!("INFO {msg}"));
    }
    fn error(&self, context: &str, msg: &str) {
        self.line(&format!("ERROR ctx={context} msg={msg}"));
    }
}
