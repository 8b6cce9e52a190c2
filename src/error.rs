//! Error taxonomy shared by every stage of the clone pipeline

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure kinds raised by the library.
///
/// Everything except [`Error::Warning`] unwinds to the orchestrator,
/// which runs its shutdown handler before re-raising. Warnings are
/// reported to the listener and the run continues.
#[derive(Debug, Error)]
pub enum Error {
    #[error("connection failed{}", fmt_detail(.0))]
    Connection(Option<String>),

    #[error("could not read data from {0}")]
    ReadData(String),

    #[error("could not write data to {0}")]
    WriteData(String),

    #[error("could not send data to {0}")]
    SendData(String),

    #[error("could not receive data from {0}")]
    ReceiveData(String),

    #[error("could not create image{}", fmt_detail(.0))]
    CreateImage(Option<String>),

    #[error("could not restore image{}", fmt_detail(.0))]
    RestoreImage(Option<String>),

    #[error("invalid or corrupt image: {0}")]
    InvalidImage(&'static str),

    #[error("{0} is not a block device")]
    NoBlockDevice(PathBuf),

    #[error("could not mount {0}")]
    Mount(PathBuf),

    #[error("could not unmount {0}")]
    Umount(PathBuf),

    #[error("could not format {0}")]
    Format(PathBuf),

    #[error("file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("operation cancelled")]
    Cancel,

    /// Recoverable condition, e.g. one receiver dropping out of the
    /// sink set while others remain.
    #[error("warning: {0}")]
    Warning(String),
}

impl Error {
    /// Warnings are swallowed by the pipeline after being reported.
    pub fn is_warning(&self) -> bool {
        matches!(self, Error::Warning(_))
    }

    pub fn is_cancel(&self) -> bool {
        matches!(self, Error::Cancel)
    }
}

fn fmt_detail(detail: &Option<String>) -> String {
    match detail {
        Some(d) => format!(": {d}"),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warning_is_recoverable() {
        assert!(Error::Warning("peer dropped".into()).is_warning());
        assert!(!Error::Cancel.is_warning());
        assert!(!Error::InvalidImage("bad magic").is_warning());
    }

    #[test]
    fn display_includes_context() {
        let e = Error::NoBlockDevice(PathBuf::from("/dev/null"));
        assert_eq!(e.to_string(), "/dev/null is not a block device");

        let e = Error::Connection(None);
        assert_eq!(e.to_string(), "connection failed");

        let e = Error::Connection(Some("no receivers answered".into()));
        assert_eq!(e.to_string(), "connection failed: no receivers answered");
    }
}
