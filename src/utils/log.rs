use crate::session::message::{NotificationSink, SessionMessage};

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const LOG_DIR: &str = "logs";

/// Appends one timestamped line to `logs/<filename>`, creating the
/// directory and file as needed.
pub fn log_to_file(filename: &str, message: &SessionMessage) -> io::Result<()> {
    log_to_dir(Path::new(LOG_DIR), filename, message)
}

fn log_to_dir(dir: &Path, filename: &str, message: &SessionMessage) -> io::Result<()> {
    if !dir.exists() {
        std::fs::create_dir_all(dir)?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(filename))?;

    writeln!(file, "{}", message.formatted())?;
    file.flush()
}

/// Operator messages mirrored to a log file. Write failures are reported
/// once through `log` and otherwise ignored so the session keeps running.
pub struct FileSink {
    dir: PathBuf,
    filename: String,
    failed: Mutex<bool>,
}

impl FileSink {
    pub fn new(filename: &str) -> Self {
        Self::in_dir(LOG_DIR, filename)
    }

    pub fn in_dir<P: Into<PathBuf>>(dir: P, filename: &str) -> Self {
        Self {
            dir: dir.into(),
            filename: filename.to_string(),
            failed: Mutex::new(false),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(&self.filename)
    }
}

impl NotificationSink for FileSink {
    fn notify(&self, message: SessionMessage) {
        if let Err(e) = log_to_dir(&self.dir, &self.filename, &message) {
            let mut failed = self.failed.lock().unwrap_or_else(|e| e.into_inner());
            if !*failed {
                log::warn!("Could not write session messages to {}: {}", self.path().display(), e);
                *failed = true;
            }
        }
    }
}
