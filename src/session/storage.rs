use chrono::NaiveDateTime;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const CHARACTERIZATION_EXTENSION: &str = "hrs1";
pub const RECRUITMENT_EXTENSION: &str = "hrs2";
pub const CONDITIONING_EXTENSION: &str = "pcms";

/// Per-subject session directories under a data root.
///
/// Layout: `<root>/<subject>/<subject>_<YYYYmmddTHHMMSS>.<ext>`.
#[derive(Debug, Clone)]
pub struct SessionStorage {
    root: PathBuf,
}

impl SessionStorage {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    /// Uses `override_root` when given, else the platform user data directory.
    pub fn resolve(override_root: Option<&Path>, application_name: &str) -> Self {
        let root = match override_root {
            Some(root) => root.to_path_buf(),
            None => dirs::data_dir()
                .map(|d| d.join(application_name))
                .unwrap_or_else(|| PathBuf::from("data")),
        };
        Self::new(root)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the subject's directory, creating it if needed.
    pub fn subject_dir(&self, subject_id: &str) -> io::Result<PathBuf> {
        let dir = self.root.join(subject_id);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Existing session files for a subject with the given extension, oldest name first.
    pub fn find_sessions(&self, subject_id: &str, extension: &str) -> io::Result<Vec<PathBuf>> {
        let dir = self.root.join(subject_id);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut found = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_file() && path.extension().map_or(false, |e| e == extension) {
                found.push(path);
            }
        }
        found.sort();
        Ok(found)
    }

    pub fn new_session_path(
        &self,
        subject_id: &str,
        extension: &str,
        started_at: NaiveDateTime,
    ) -> io::Result<PathBuf> {
        let dir = self.subject_dir(subject_id)?;
        let stamp = started_at.format("%Y%m%dT%H%M%S");
        Ok(dir.join(format!("{}_{}.{}", subject_id, stamp, extension)))
    }
}
