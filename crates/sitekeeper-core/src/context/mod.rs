//! StageContext / MasterActionContext (spec §4.7): the workflow DSL
//! action handlers run inside.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{error, warn};

use sitekeeper_shared::error::SiteKeeperResult;

use crate::cancel::CancelNode;
use crate::connection::AgentConnectionManager;
use crate::dispatcher::{NodeActionDispatcher, ProgressReporter};
use crate::journal::{ArchivedStageResult, Journal};
use crate::model::{MasterAction, NodeAction, NodeActionOverallStatus, NodeActionResult, NodeTaskStatus, StageRecord};
use crate::routing::ActionIdTranslator;

/// Shared services every stage in a MasterAction's run needs, held behind
/// one `Arc` per context rather than threaded through every call.
pub struct ContextServices {
    pub journal: Arc<Journal>,
    pub translator: Arc<ActionIdTranslator>,
    pub connections: Arc<AgentConnectionManager>,
    pub dispatcher: Arc<NodeActionDispatcher>,
}

/// Per-MasterAction scoped object. `action` is behind a single lock per
/// §4.7's "`executionHistory.add` and transient-field mutation occur
/// under a single per-MasterAction lock".
pub struct MasterActionContext {
    pub action: Arc<Mutex<MasterAction>>,
    services: Arc<ContextServices>,
    cancel: CancelNode,
    next_stage_index: AtomicUsize,
}

impl MasterActionContext {
    pub fn new(action: MasterAction, services: Arc<ContextServices>, cancel: CancelNode) -> Self {
        Self {
            action: Arc::new(Mutex::new(action)),
            services,
            cancel,
            next_stage_index: AtomicUsize::new(0),
        }
    }

    pub fn cancel_token(&self) -> &CancelNode {
        &self.cancel
    }

    /// Pre-announces the number of top-level stages (§4.7 `initializeProgress`).
    /// SiteKeeper has no separate "total steps" field on `MasterAction`; this
    /// is surfaced purely as a log line for operators watching `recentLogs`.
    pub async fn initialize_progress(&self, total_steps: usize) {
        let mut guard = self.action.lock().await;
        guard.push_log("info", format!("action has {total_steps} planned stage(s)"));
    }

    /// Opens a new scoped stage. Stages within one MasterAction are
    /// strictly sequential (§4.7); the caller must `close` one before
    /// calling `begin_stage` again.
    pub async fn begin_stage(&self, stage_name: impl Into<String>) -> StageContext {
        let stage_name = stage_name.into();
        let stage_index = self.next_stage_index.fetch_add(1, Ordering::SeqCst);

        let master_action_id = {
            let mut guard = self.action.lock().await;
            guard.current_stage_name = Some(stage_name.clone());
            guard.current_stage_index = Some(stage_index);
            guard.id.clone()
        };

        if let Err(err) = self.services.journal.map_node_action_to_stage(&master_action_id, stage_index, &stage_name, "").await {
            error!(?err, "failed to open stage directory in journal");
        }

        StageContext {
            master_action_id,
            stage_index,
            stage_name: stage_name.clone(),
            record: Mutex::new(StageRecord::open(stage_index, stage_name)),
            action: Arc::clone(&self.action),
            services: Arc::clone(&self.services),
            cancel: self.cancel.clone(),
        }
    }

    pub async fn set_completed(&self, message: impl Into<String>) {
        self.action.lock().await.set_completed(message);
    }

    pub async fn set_failed(&self, message: impl Into<String>) {
        self.action.lock().await.set_failed(message);
    }

    pub async fn set_cancelled(&self, message: impl Into<String>) {
        self.action.lock().await.set_cancelled(message);
    }

    pub async fn set_final_result(&self, payload: Value) {
        self.action.lock().await.set_final_result(payload);
    }

    pub async fn is_terminal(&self) -> bool {
        self.action.lock().await.is_terminal()
    }
}

/// Scope of one open stage. Finalization (writing the `StageRecord` to the
/// Journal and appending it to `executionHistory`) happens in `close`,
/// which every call path through the coordinator guarantees runs on every
/// exit.
pub struct StageContext {
    master_action_id: String,
    stage_index: usize,
    stage_name: String,
    record: Mutex<StageRecord>,
    action: Arc<Mutex<MasterAction>>,
    services: Arc<ContextServices>,
    cancel: CancelNode,
}

impl StageContext {
    /// Builds one NodeAction over all connected nodes (or the given
    /// subset), registers it with C4/C5, runs it through C6 (§4.7).
    pub async fn create_and_execute_node_action(
        &self,
        action_name: impl Into<String>,
        task_type: impl Into<String>,
        default_payload: Value,
        node_specific_payloads: HashMap<String, Value>,
        target_node_names: Option<Vec<String>>,
    ) -> SiteKeeperResult<NodeActionResult> {
        let task_type = task_type.into();
        let action_name = action_name.into();

        let connected: Vec<String> = self.services.connections.get_all_connected_agents().into_iter().map(|a| a.node_name).collect();
        let target_nodes: Vec<String> = match target_node_names {
            Some(requested) => {
                for node in &requested {
                    if !connected.contains(node) {
                        warn!(node_name = %node, "target node for NodeAction is not connected; skipping");
                    }
                }
                requested.into_iter().filter(|n| connected.contains(n)).collect()
            }
            None => connected,
        };

        let node_tasks: Vec<NodeTaskStatus> = target_nodes
            .iter()
            .map(|node| {
                let payload = node_specific_payloads.get(node).cloned().unwrap_or_else(|| default_payload.clone());
                NodeTaskStatus::new("", node.clone(), task_type.clone(), payload)
            })
            .collect();

        let mut node_action = NodeAction::new(action_name, task_type, self.stage_index, node_tasks);
        let node_action_id = node_action.id.clone();
        for task in &mut node_action.node_tasks {
            task.action_id = node_action_id.clone();
        }

        self.services.translator.register_mapping(node_action_id.clone(), self.master_action_id.clone(), self.stage_index);
        self.services
            .journal
            .map_node_action_to_stage(&self.master_action_id, self.stage_index, &self.stage_name, &node_action_id)
            .await?;

        {
            let mut guard = self.action.lock().await;
            guard.current_stage_node_action_ids.insert(node_action_id.clone());
        }

        let action_for_progress = Arc::clone(&self.action);
        let reporter: ProgressReporter = Arc::new(move |percent, message| {
            let action_for_progress = Arc::clone(&action_for_progress);
            tokio::spawn(async move {
                let mut guard = action_for_progress.lock().await;
                guard.set_progress_percent(percent);
                guard.push_log("info", message);
            });
        });

        let child_cancel = self.cancel.fork();
        let result = self.services.dispatcher.execute(node_action, reporter, child_cancel).await;

        {
            let mut guard = self.action.lock().await;
            guard.current_stage_node_action_ids.remove(&node_action_id);
        }
        self.services.translator.unregister_mapping(&node_action_id);

        self.record.lock().await.final_node_actions.push(result.final_state.clone());

        Ok(result)
    }

    /// Runs N node actions concurrently through C6; per-action cancellation
    /// shares this stage's token so cancelling the stage cancels every
    /// branch (§4.7).
    pub async fn create_and_execute_node_actions_in_parallel(
        &self,
        inputs: Vec<(String, String, Value, HashMap<String, Value>, Option<Vec<String>>)>,
    ) -> SiteKeeperResult<Vec<NodeActionResult>> {
        let futures = inputs.into_iter().map(|(name, task_type, default_payload, payloads, targets)| {
            self.create_and_execute_node_action(name, task_type, default_payload, payloads, targets)
        });
        futures::future::try_join_all(futures).await
    }

    pub async fn set_custom_result(&self, value: Value) {
        self.record.lock().await.custom_result = Some(value);
    }

    pub async fn report_progress(&self, sub_step_percent: u8, message: impl Into<String>) {
        let mut guard = self.action.lock().await;
        guard.set_progress_percent(sub_step_percent);
        guard.push_log("info", message.into());
    }

    pub async fn log_info(&self, message: impl Into<String>) {
        self.log("info", message.into()).await;
    }

    pub async fn log_warning(&self, message: impl Into<String>) {
        self.log("warn", message.into()).await;
    }

    pub async fn log_error(&self, message: impl Into<String>) {
        self.log("error", message.into()).await;
    }

    async fn log(&self, level: &str, message: String) {
        match level {
            "warn" => warn!(master_action_id = %self.master_action_id, stage_index = self.stage_index, "{message}"),
            "error" => error!(master_action_id = %self.master_action_id, stage_index = self.stage_index, "{message}"),
            _ => tracing::info!(master_action_id = %self.master_action_id, stage_index = self.stage_index, "{message}"),
        }
        self.action.lock().await.push_log(level, message.clone());
        let _ = self.services.journal.append_stage_log(&self.master_action_id, self.stage_index, "_master", &message).await;
    }

    pub fn cancel_token(&self) -> &CancelNode {
        &self.cancel
    }

    /// Closes the stage: writes its record to C4 and appends it to
    /// `executionHistory` under the MasterAction's lock (§4.7).
    pub async fn close(self) -> SiteKeeperResult<()> {
        let (combined_result, final_record) = {
            let mut record = self.record.lock().await;
            let is_success = record.final_node_actions.iter().all(|na| {
                matches!(na.overall_status, NodeActionOverallStatus::Succeeded | NodeActionOverallStatus::SucceededWithErrors)
            });
            record.close(is_success);
            let combined = ArchivedStageResult {
                node_action_results: record.final_node_actions.clone(),
                custom_result: record.custom_result.clone(),
            };
            (combined, record.clone())
        };

        self.services
            .journal
            .record_stage_completed(&self.master_action_id, self.stage_index, &self.stage_name, combined_result)
            .await?;

        let mut guard = self.action.lock().await;
        guard.execution_history.push(final_record);
        guard.current_stage_name = None;
        guard.current_stage_index = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::NodeHealthMonitor;
    use crate::transport::InMemorySlaveTransport;
    use sitekeeper_shared::config::TimeoutsConfig;
    use std::time::Duration;

    async fn test_services() -> (Arc<ContextServices>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(dir.path(), "test").await.unwrap();
        let translator = ActionIdTranslator::new(Duration::from_secs(60));
        let connections = AgentConnectionManager::new();
        let health = NodeHealthMonitor::new(Duration::from_secs(15));
        let transport = InMemorySlaveTransport::new();
        let dispatcher = NodeActionDispatcher::new(
            connections.clone(),
            health,
            Arc::clone(&translator),
            Arc::clone(&journal),
            transport,
            TimeoutsConfig::default(),
            HashMap::new(),
        );
        (Arc::new(ContextServices { journal, translator, connections, dispatcher }), dir)
    }

    #[tokio::test]
    async fn begin_stage_and_close_with_no_node_actions_archives_success() {
        let (services, _dir) = test_services().await;
        let action = MasterAction::new("EnvVerify", HashMap::new());
        let master_action_id = action.id.clone();
        let ctx = MasterActionContext::new(action, Arc::clone(&services), CancelNode::root());

        services.journal.begin_master_action(&*ctx.action.lock().await).await.unwrap();

        let stage = ctx.begin_stage("Verification").await;
        stage.close().await.unwrap();

        let guard = ctx.action.lock().await;
        assert_eq!(guard.execution_history.len(), 1);
        assert!(guard.execution_history[0].is_success);
        drop(guard);

        let archived = services.journal.get_archived_stage_result(&master_action_id, 0).await.unwrap();
        assert!(archived.node_action_results.is_empty());
    }

    #[tokio::test]
    async fn create_and_execute_node_action_with_no_connected_nodes_is_empty_and_successful() {
        let (services, _dir) = test_services().await;
        let action = MasterAction::new("EnvVerify", HashMap::new());
        let ctx = MasterActionContext::new(action, Arc::clone(&services), CancelNode::root());
        services.journal.begin_master_action(&*ctx.action.lock().await).await.unwrap();

        let stage = ctx.begin_stage("Verification").await;
        let result = stage
            .create_and_execute_node_action("Verify", "VerifyConfiguration", Value::Null, HashMap::new(), None)
            .await
            .unwrap();
        assert!(result.final_state.node_tasks.is_empty());
        stage.close().await.unwrap();
    }
}
