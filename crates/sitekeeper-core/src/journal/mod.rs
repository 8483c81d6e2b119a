//! Journal (spec §4.4): the only component allowed to write under the
//! environment's journal root. On-disk layout:
//!
//! ```text
//! <journalRoot>/<environmentName>/ActionJournal/<timestamp>-<masterActionId>/
//!     master_action_info.json
//!     stages/<index>-<stageName>/
//!         stage_result.json
//!         logs/
//!             _master.log
//!             <nodeName>.log
//! ```
//!
//! Terminal JSON artifacts are written write-then-rename so a reader never
//! observes a partial file (§4.4 invariant).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use sitekeeper_shared::error::{SiteKeeperError, SiteKeeperResult};

use crate::model::{MasterAction, NodeAction, StageRecord};

/// `master_action_info.json` content: `MasterAction` minus transient fields
/// (§3 invariant: "transient fields are not persisted in the Journal").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchivedMasterAction {
    pub id: String,
    pub operation_type: String,
    pub name: Option<String>,
    pub initiated_by: Option<String>,
    pub parameters: std::collections::HashMap<String, Value>,
    pub start_time: chrono::DateTime<Utc>,
    pub end_time: Option<chrono::DateTime<Utc>>,
    pub overall_status: crate::model::OverallStatus,
    pub overall_progress_percent: u8,
    pub final_result_payload: Option<Value>,
    pub execution_history: Vec<StageRecord>,
}

impl From<&MasterAction> for ArchivedMasterAction {
    fn from(action: &MasterAction) -> Self {
        Self {
            id: action.id.clone(),
            operation_type: action.operation_type.clone(),
            name: action.name.clone(),
            initiated_by: action.initiated_by.clone(),
            parameters: action.parameters.clone(),
            start_time: action.start_time,
            end_time: action.end_time,
            overall_status: action.overall_status,
            overall_progress_percent: action.overall_progress_percent,
            final_result_payload: action.final_result_payload.clone(),
            execution_history: action.execution_history.clone(),
        }
    }
}

/// `stage_result.json` content (§4.4: `{ nodeActionResults[], customResult }`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchivedStageResult {
    pub node_action_results: Vec<NodeAction>,
    pub custom_result: Option<Value>,
}

struct StageKey;

impl StageKey {
    fn fmt(stage_index: usize, stage_name: &str) -> String {
        let slug: String = stage_name
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        format!("{stage_index}-{slug}")
    }
}

#[derive(Debug)]
pub struct Journal {
    action_journal_root: PathBuf,
    /// masterActionId -> its `<timestamp>-<id>` directory.
    action_dirs: DashMap<String, PathBuf>,
    /// (masterActionId, stageIndex) -> stageName, so `append_stage_log`
    /// (which per §4.4 only takes the index) can locate the directory.
    stage_names: DashMap<(String, usize), String>,
    /// Serializes appends to the same log file; keyed by its final path.
    log_locks: DashMap<PathBuf, Arc<Mutex<()>>>,
}

impl Journal {
    pub async fn new(journal_root: &Path, environment_name: &str) -> SiteKeeperResult<Arc<Self>> {
        let action_journal_root = journal_root.join(environment_name).join("ActionJournal");
        fs::create_dir_all(&action_journal_root).await?;
        Ok(Arc::new(Self {
            action_journal_root,
            action_dirs: DashMap::new(),
            stage_names: DashMap::new(),
            log_locks: DashMap::new(),
        }))
    }

    fn action_dir_name(master_action_id: &str, start_time: chrono::DateTime<Utc>) -> String {
        format!("{}-{master_action_id}", start_time.format("%Y%m%dT%H%M%S%.3fZ"))
    }

    pub async fn begin_master_action(&self, master_action: &MasterAction) -> SiteKeeperResult<()> {
        let dir_name = Self::action_dir_name(&master_action.id, master_action.start_time);
        let dir = self.action_journal_root.join(&dir_name);
        fs::create_dir_all(&dir).await?;
        self.action_dirs.insert(master_action.id.clone(), dir);
        Ok(())
    }

    async fn resolve_action_dir(&self, master_action_id: &str) -> SiteKeeperResult<PathBuf> {
        if let Some(dir) = self.action_dirs.get(master_action_id) {
            return Ok(dir.clone());
        }
        let suffix = format!("-{master_action_id}");
        let mut entries = fs::read_dir(&self.action_journal_root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_name().to_string_lossy().ends_with(&suffix) {
                let dir = entry.path();
                self.action_dirs.insert(master_action_id.to_string(), dir.clone());
                return Ok(dir);
            }
        }
        Err(SiteKeeperError::NotFound { what: format!("MasterAction {master_action_id}") })
    }

    async fn stage_dir(&self, master_action_id: &str, stage_index: usize, stage_name: &str) -> SiteKeeperResult<PathBuf> {
        self.stage_names.insert((master_action_id.to_string(), stage_index), stage_name.to_string());
        let action_dir = self.resolve_action_dir(master_action_id).await?;
        let dir = action_dir.join("stages").join(StageKey::fmt(stage_index, stage_name));
        fs::create_dir_all(dir.join("logs")).await?;
        Ok(dir)
    }

    /// Registers where slave-originated logs for `node_action_id` land
    /// (§4.4 `mapNodeActionToStage`); creates the stage directory on first use.
    pub async fn map_node_action_to_stage(
        &self,
        master_action_id: &str,
        stage_index: usize,
        stage_name: &str,
        _node_action_id: &str,
    ) -> SiteKeeperResult<()> {
        self.stage_dir(master_action_id, stage_index, stage_name).await?;
        Ok(())
    }

    async fn log_path(&self, master_action_id: &str, stage_index: usize, source: &str) -> SiteKeeperResult<PathBuf> {
        let stage_name = self
            .stage_names
            .get(&(master_action_id.to_string(), stage_index))
            .map(|s| s.clone())
            .ok_or_else(|| SiteKeeperError::invariant("Journal", format!("stage {stage_index} of {master_action_id} was never opened")))?;
        let dir = self.stage_dir(master_action_id, stage_index, &stage_name).await?;
        Ok(dir.join("logs").join(format!("{source}.log")))
    }

    /// Appends one correlated log line (§4.4 `appendStageLog`). Writers to
    /// the same file are serialized through a per-path lock rather than
    /// relying on O_APPEND alone, matching the journal's single-writer
    /// rule for any one artifact.
    pub async fn append_stage_log(&self, master_action_id: &str, stage_index: usize, source: &str, entry: &str) -> SiteKeeperResult<()> {
        let path = self.log_path(master_action_id, stage_index, source).await?;
        let lock = self
            .log_locks
            .entry(path.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let mut file = fs::OpenOptions::new().create(true).append(true).open(&path).await?;
        let line = format!("{} {entry}\n", Utc::now().to_rfc3339());
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }

    async fn write_atomic(&self, path: &Path, contents: &[u8]) -> SiteKeeperResult<()> {
        let tmp_path = path.with_extension("json.tmp");
        {
            let mut tmp = fs::File::create(&tmp_path).await?;
            tmp.write_all(contents).await?;
            tmp.flush().await?;
        }
        fs::rename(&tmp_path, path).await?;
        Ok(())
    }

    /// Writes `stage_result.json` atomically (§4.4 `recordStageCompleted`).
    pub async fn record_stage_completed(
        &self,
        master_action_id: &str,
        stage_index: usize,
        stage_name: &str,
        combined_result: ArchivedStageResult,
    ) -> SiteKeeperResult<()> {
        let dir = self.stage_dir(master_action_id, stage_index, stage_name).await?;
        let path = dir.join("stage_result.json");
        let bytes = serde_json::to_vec_pretty(&combined_result)?;
        self.write_atomic(&path, &bytes).await
    }

    /// Writes `master_action_info.json` exactly once per action (§4.4 invariant).
    pub async fn finalize_master_action(&self, master_action: &MasterAction) -> SiteKeeperResult<()> {
        let dir = self.resolve_action_dir(&master_action.id).await?;
        let path = dir.join("master_action_info.json");
        let archived = ArchivedMasterAction::from(master_action);
        let bytes = serde_json::to_vec_pretty(&archived)?;
        self.write_atomic(&path, &bytes).await
    }

    pub async fn get_archived_master_action(&self, master_action_id: &str) -> SiteKeeperResult<ArchivedMasterAction> {
        let dir = self.resolve_action_dir(master_action_id).await?;
        let path = dir.join("master_action_info.json");
        let bytes = fs::read(&path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub async fn get_archived_stage_result(&self, master_action_id: &str, stage_index: usize) -> SiteKeeperResult<ArchivedStageResult> {
        let stage_name = self
            .stage_names
            .get(&(master_action_id.to_string(), stage_index))
            .map(|s| s.clone())
            .ok_or_else(|| SiteKeeperError::NotFound { what: format!("stage {stage_index} of {master_action_id}") })?;
        let dir = self.stage_dir(master_action_id, stage_index, &stage_name).await?;
        let bytes = fs::read(dir.join("stage_result.json")).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub async fn get_archived_stage_log_content(&self, master_action_id: &str, stage_index: usize, log_file_name: &str) -> SiteKeeperResult<String> {
        let source = log_file_name.trim_end_matches(".log");
        let path = self.log_path(master_action_id, stage_index, source).await?;
        Ok(fs::read_to_string(&path).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    async fn new_journal() -> (Arc<Journal>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(dir.path(), "test").await.unwrap();
        (journal, dir)
    }

    #[tokio::test]
    async fn finalize_writes_readable_archive() {
        let (journal, _dir) = new_journal().await;
        let mut action = MasterAction::new("EnvVerify", HashMap::new());
        journal.begin_master_action(&action).await.unwrap();
        action.set_completed("all good");

        journal.finalize_master_action(&action).await.unwrap();
        let archived = journal.get_archived_master_action(&action.id).await.unwrap();
        assert_eq!(archived.id, action.id);
        assert_eq!(archived.overall_status, crate::model::OverallStatus::Succeeded);
    }

    #[tokio::test]
    async fn stage_result_round_trips() {
        let (journal, _dir) = new_journal().await;
        let action = MasterAction::new("EnvVerify", HashMap::new());
        journal.begin_master_action(&action).await.unwrap();
        journal.map_node_action_to_stage(&action.id, 0, "Verification", "na-1").await.unwrap();

        let artifact = ArchivedStageResult { node_action_results: Vec::new(), custom_result: None };
        journal.record_stage_completed(&action.id, 0, "Verification", artifact).await.unwrap();

        let read_back = journal.get_archived_stage_result(&action.id, 0).await.unwrap();
        assert!(read_back.node_action_results.is_empty());
    }

    #[tokio::test]
    async fn append_stage_log_and_read_it_back() {
        let (journal, _dir) = new_journal().await;
        let action = MasterAction::new("EnvVerify", HashMap::new());
        journal.begin_master_action(&action).await.unwrap();
        journal.map_node_action_to_stage(&action.id, 0, "Verification", "na-1").await.unwrap();

        journal.append_stage_log(&action.id, 0, "_master", "stage started").await.unwrap();
        journal.append_stage_log(&action.id, 0, "n1", "task dispatched").await.unwrap();

        let master_log = journal.get_archived_stage_log_content(&action.id, 0, "_master.log").await.unwrap();
        assert!(master_log.contains("stage started"));
        let node_log = journal.get_archived_stage_log_content(&action.id, 0, "n1.log").await.unwrap();
        assert!(node_log.contains("task dispatched"));
    }

    #[tokio::test]
    async fn missing_action_is_not_found() {
        let (journal, _dir) = new_journal().await;
        let err = journal.get_archived_master_action("does-not-exist").await.unwrap_err();
        assert!(matches!(err, SiteKeeperError::NotFound { .. }));
    }
}
