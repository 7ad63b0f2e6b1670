//! Run lifecycle store.
//!
//! One pretty-printed JSON document per run under the history directory.
//! Records are written in `running` state before any work happens, so a
//! crash mid-run leaves evidence instead of silence, and updated exactly
//! once more when the run reaches a terminal state.

use std::path::PathBuf;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::warn;
use uuid::Uuid;

use crate::core::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Complete,
    Failed,
    Cancelled,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    /// Operator-facing label: the template name, or the question asked
    pub label: String,
    pub prompt_id: Option<String>,
    pub status: RunStatus,
    pub result: Option<String>,
    /// The status transcript captured when the run settled
    #[serde(default)]
    pub log: Vec<String>,
    pub started_at: String,
    pub finished_at: Option<String>,
}

pub struct RunStore {
    dir: PathBuf,
}

impl RunStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn record_path(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{run_id}.json"))
    }

    /// Open a new record in `running` state and return its id. Ids sort
    /// chronologically: a UTC timestamp plus a short random suffix.
    pub async fn create(&self, label: &str, prompt_id: Option<&str>) -> Result<String> {
        fs::create_dir_all(&self.dir).await?;

        let now = Utc::now();
        let suffix = Uuid::new_v4().simple().to_string();
        let run_id = format!("{}_{}", now.format("%Y%m%d-%H%M%S"), &suffix[..8]);

        let record = RunRecord {
            id: run_id.clone(),
            label: label.to_string(),
            prompt_id: prompt_id.map(String::from),
            status: RunStatus::Running,
            result: None,
            log: Vec::new(),
            started_at: now.to_rfc3339_opts(SecondsFormat::Micros, true),
            finished_at: None,
        };
        self.write(&record).await?;
        Ok(run_id)
    }

    /// Merge-update an existing record: only the provided fields change,
    /// and `finished_at` is stamped unconditionally.
    pub async fn update(
        &self,
        run_id: &str,
        status: RunStatus,
        result: Option<String>,
        log: Option<Vec<String>>,
    ) -> Result<()> {
        let mut record = self
            .get(run_id)
            .await?
            .ok_or_else(|| Error::internal(format!("run record '{run_id}' does not exist")))?;

        record.status = status;
        if let Some(result) = result {
            record.result = Some(result);
        }
        if let Some(log) = log {
            record.log = log;
        }
        record.finished_at = Some(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true));
        self.write(&record).await
    }

    /// Fetch one record. Unknown ids and unreadable documents are `None`;
    /// the store never fails a lookup over one bad file.
    pub async fn get(&self, run_id: &str) -> Result<Option<RunRecord>> {
        if !is_safe_run_id(run_id) {
            return Ok(None);
        }
        let path = self.record_path(run_id);
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str(&text) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!("Unreadable run record {}: {}", path.display(), e);
                Ok(None)
            }
        }
    }

    /// All runs, newest first. Corrupt documents are skipped with a warning
    /// so one bad write cannot hide the rest of the history.
    pub async fn list(&self) -> Result<Vec<RunRecord>> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read_to_string(&path).await {
                Ok(text) => match serde_json::from_str::<RunRecord>(&text) {
                    Ok(record) => records.push(record),
                    Err(e) => warn!("Skipping corrupt run record {}: {}", path.display(), e),
                },
                Err(e) => warn!("Skipping unreadable run record {}: {}", path.display(), e),
            }
        }

        records.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(records)
    }

    /// Delete every record, returning how many were removed.
    pub async fn clear(&self) -> Result<usize> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                fs::remove_file(&path).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn write(&self, record: &RunRecord) -> Result<()> {
        let text = serde_json::to_string_pretty(record)?;
        fs::write(self.record_path(&record.id), text).await?;
        Ok(())
    }
}

/// Generated ids are timestamp plus hex, but `get` also sees operator input
/// from the CLI, so reject anything that could escape the directory.
fn is_safe_run_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
