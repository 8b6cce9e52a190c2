use anyhow::Result;
use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

pub trait Logger: Send + Sync {
    fn start(&self, _operation: &str, _target: &str) {}
    fn completed(&self, _operation: &str, _target: &str) {}
    fn connection(&self, _peer: &str) {}
    fn warning(&self, _msg: &str) {}
    fn error(&self, _context: &str, _msg: &str) {}
    fn done(&self, _bytes: u64, _seconds: f64) {}
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
    fn start(&self, operation: &str, target: &str) {
        self.line(&format!("START op={operation} target={target}"));
    }
    fn completed(&self, operation: &str, target: &str) {
        self.line(&format!("DONE op={operation} target={target}"));
    }
    fn connection(&self, peer: &str) {
        self.line(&format!("CONNECT peer={peer}"));
    }
    fn warning(&self, msg: &str) {
        self.line(&format!("WARN msg={msg}"));
    }
    fn error(&self, context: &str, msg: &str) {
        self.line(&format!("ERROR ctx={context} msg={msg}"));
    }
    fn done(&self, bytes: u64, seconds: f64) {
        self.line(&format!("FINISH bytes={bytes} seconds={seconds:.3}"));
    }
}
