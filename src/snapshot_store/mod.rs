//! SnapshotStore - device snapshot persistence
//!
//! ## Responsibilities
//!
//! - Write uploaded snapshots under `<local_root>/<serial>/`
//! - File naming: `<serial>_<channel>_<YYYYMMDDHHMMSS>.<ext>`
//! - Produce the web URL the file is served back under
//! - Normalize device-supplied capture times

use std::path::{Path, PathBuf};

use chrono::Local;
use tokio::fs;

use crate::error::Result;

pub struct SnapshotStore {
    local_root: PathBuf,
    web_root: String,
}

impl SnapshotStore {
    pub fn new(local_root: impl Into<PathBuf>, web_root: impl Into<String>) -> Self {
        Self {
            local_root: local_root.into(),
            web_root: web_root.into(),
        }
    }

    /// Persist one snapshot and return its web URL.
    pub async fn save(
        &self,
        serial: &str,
        channel: &str,
        time: &str,
        ext: &str,
        data: &[u8],
    ) -> Result<String> {
        let dir = self.local_root.join(serial);
        fs::create_dir_all(&dir).await?;

        let file_name = format!("{serial}_{channel}_{time}.{ext}");
        let path = dir.join(&file_name);
        fs::write(&path, data).await?;

        tracing::debug!(
            serial = %serial,
            channel = %channel,
            path = %path.display(),
            size = data.len(),
            "Snapshot saved"
        );

        Ok(format!(
            "{}/{}/{}",
            self.web_root.trim_end_matches('/'),
            serial,
            file_name
        ))
    }

    pub fn local_root(&self) -> &Path {
        &self.local_root
    }

    /// Normalize a capture time to `YYYYMMDDHHMMSS`.
    ///
    /// `2015-07-20 12:55:30` becomes `20150720125530`; an empty value
    /// defaults to now.
    pub fn normalize_time(raw: &str) -> String {
        if raw.is_empty() {
            return Local::now().format("%Y%m%d%H%M%S").to_string();
        }
        raw.chars()
            .filter(|c| !matches!(c, '-' | ':' | ' '))
            .collect()
    }
}
