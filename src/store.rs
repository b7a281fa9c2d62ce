use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::TaskId;
use crate::error::KiraError;
use crate::gnps::RawTaskData;

const SPECTRA_FILE: &str = "specs_ms.mgf";
const LIBRARY_FILE: &str = "merged_results_with_gnps.tsv";
const METADATA_FILE: &str = "metadata.json";

/// Per-task cache of downloaded GNPS artifacts.
#[derive(Debug, Clone)]
pub struct Store {
    cache_root: Utf8PathBuf,
}

impl Store {
    pub fn new() -> Result<Self, KiraError> {
        let cache_root = BaseDirs::new()
            .and_then(|dirs| {
                Utf8PathBuf::from_path_buf(dirs.home_dir().join(".cache").join("kira-bile-acids"))
                    .ok()
            })
            .ok_or_else(|| {
                KiraError::Filesystem("unable to resolve cache directory".to_string())
            })?;
        Ok(Self { cache_root })
    }

    pub fn new_with_paths(cache_root: Utf8PathBuf) -> Self {
        Self { cache_root }
    }

    pub fn cache_root(&self) -> &Utf8Path {
        &self.cache_root
    }

    pub fn task_dir(&self, task: &TaskId) -> Utf8PathBuf {
        self.cache_root.join("tasks").join(task.as_str())
    }

    pub fn spectra_path(&self, task: &TaskId) -> Utf8PathBuf {
        self.task_dir(task).join(SPECTRA_FILE)
    }

    pub fn library_path(&self, task: &TaskId) -> Utf8PathBuf {
        self.task_dir(task).join(LIBRARY_FILE)
    }

    pub fn metadata_path(&self, task: &TaskId) -> Utf8PathBuf {
        self.task_dir(task).join(METADATA_FILE)
    }

    /// Cached artifacts for `task`. A task counts as cached only once its
    /// metadata has been written, which happens after both artifacts.
    pub fn load(&self, task: &TaskId) -> Result<Option<RawTaskData>, KiraError> {
        if !self.metadata_path(task).as_std_path().exists() {
            return Ok(None);
        }
        let read = |path: Utf8PathBuf| {
            fs::read(path.as_std_path()).map_err(|err| KiraError::Filesystem(err.to_string()))
        };
        debug!(task = task.as_str(), "cache hit");
        Ok(Some(RawTaskData {
            spectra: read(self.spectra_path(task))?,
            library_matches: read(self.library_path(task))?,
        }))
    }

    pub fn save(&self, task: &TaskId, data: &RawTaskData) -> Result<Metadata, KiraError> {
        Self::write_bytes_atomic(&self.spectra_path(task), &data.spectra)?;
        Self::write_bytes_atomic(&self.library_path(task), &data.library_matches)?;
        let metadata = Metadata {
            source: "gnps2".to_string(),
            task_id: task.as_str().to_string(),
            downloaded_at: Utc::now().to_rfc3339(),
            tool: format!("kira-ba/{}", env!("CARGO_PKG_VERSION")),
            spectra_bytes: data.spectra.len() as u64,
            library_bytes: data.library_matches.len() as u64,
        };
        Self::write_metadata(&self.metadata_path(task), &metadata)?;
        Ok(metadata)
    }

    pub fn clear(&self) -> Result<(), KiraError> {
        if self.cache_root.as_std_path().exists() {
            fs::remove_dir_all(self.cache_root.as_std_path())
                .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        }
        Ok(())
    }

    pub fn list_metadata(&self) -> Result<Vec<Metadata>, KiraError> {
        let tasks_root = self.cache_root.join("tasks");
        if !tasks_root.as_std_path().exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(tasks_root.as_std_path())
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        let mut items = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| KiraError::Filesystem(err.to_string()))?;
            let path = entry.path().join(METADATA_FILE);
            if !path.is_file() {
                continue;
            }
            let content =
                fs::read_to_string(&path).map_err(|err| KiraError::Filesystem(err.to_string()))?;
            let metadata: Metadata = serde_json::from_str(&content)
                .map_err(|err| KiraError::Filesystem(err.to_string()))?;
            items.push(metadata);
        }
        items.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        Ok(items)
    }

    pub fn write_metadata(path: &Utf8Path, metadata: &Metadata) -> Result<(), KiraError> {
        let content = serde_json::to_vec_pretty(metadata)
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        Self::write_bytes_atomic(path, &content)
    }

    pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), KiraError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        }
        let tmp_path = Utf8PathBuf::from(format!("{path}.tmp"));
        fs::write(tmp_path.as_std_path(), content)
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        fs::rename(tmp_path.as_std_path(), path.as_std_path())
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub source: String,
    pub task_id: String,
    pub downloaded_at: String,
    pub tool: String,
    pub spectra_bytes: u64,
    pub library_bytes: u64,
}
