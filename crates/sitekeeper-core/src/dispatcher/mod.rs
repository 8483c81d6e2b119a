//! NodeActionDispatcher (spec §4.6) — the two-phase, multi-node executor.
//!
//! Each in-flight task is driven by its own future against a shared
//! `Mutex<NodeAction>`, the same "one owner at a time, accessed through a
//! documented lock" shape the teacher uses for its per-workflow-step
//! orchestration state rather than a global lock or unsynchronized
//! shared state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use sitekeeper_shared::config::{TaskTypeOverrides, TimeoutsConfig};
use sitekeeper_shared::wire::{
    CancelTaskRequest, ExecuteTaskInstruction, LogFlushRequest, PrepareForTask, TaskLogEntry, TaskProgressUpdate,
    TaskReadinessReport,
};

use crate::cancel::CancelNode;
use crate::connection::AgentConnectionManager;
use crate::health::NodeHealthMonitor;
use crate::journal::Journal;
use crate::model::{AgentConnectivityStatus, NodeAction, NodeActionOverallStatus, NodeActionResult, NodeTaskState, NodeTaskStatus};
use crate::routing::{ActionIdTranslator, RouteResolution};
use crate::transport::SlaveTransport;

/// A function invoked after every per-task state change with the
/// NodeAction's current aggregate progress and a one-line summary (§4.6
/// "Progress aggregation").
pub type ProgressReporter = Arc<dyn Fn(u8, String) + Send + Sync>;

#[derive(Debug)]
enum TaskEvent {
    Readiness(TaskReadinessReport),
    Progress(TaskProgressUpdate),
}

pub struct NodeActionDispatcher {
    connections: Arc<AgentConnectionManager>,
    health: Arc<NodeHealthMonitor>,
    translator: Arc<ActionIdTranslator>,
    journal: Arc<Journal>,
    transport: Arc<dyn SlaveTransport>,
    timeouts: TimeoutsConfig,
    per_task_type: HashMap<String, TaskTypeOverrides>,
    task_events: DashMap<String, mpsc::UnboundedSender<TaskEvent>>,
    flush_waiters: DashMap<String, mpsc::UnboundedSender<String>>,
}

impl std::fmt::Debug for NodeActionDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeActionDispatcher").finish_non_exhaustive()
    }
}

fn find_task<'a>(action: &'a NodeAction, task_id: &str) -> &'a NodeTaskStatus {
    action.node_tasks.iter().find(|t| t.task_id == task_id).expect("task_id belongs to this NodeAction")
}

fn find_task_mut<'a>(action: &'a mut NodeAction, task_id: &str) -> &'a mut NodeTaskStatus {
    action.node_tasks.iter_mut().find(|t| t.task_id == task_id).expect("task_id belongs to this NodeAction")
}

impl NodeActionDispatcher {
    pub fn new(
        connections: Arc<AgentConnectionManager>,
        health: Arc<NodeHealthMonitor>,
        translator: Arc<ActionIdTranslator>,
        journal: Arc<Journal>,
        transport: Arc<dyn SlaveTransport>,
        timeouts: TimeoutsConfig,
        per_task_type: HashMap<String, TaskTypeOverrides>,
    ) -> Arc<Self> {
        Arc::new(Self {
            connections,
            health,
            translator,
            journal,
            transport,
            timeouts,
            per_task_type,
            task_events: DashMap::new(),
            flush_waiters: DashMap::new(),
        })
    }

    /// Routes an inbound `TaskReadinessReport` to the waiting prepare-phase
    /// future, if any. Every inbound message carrying a `node_action_id`
    /// is consulted against C5 first (§4.5), even though live routing here
    /// still happens through `task_events`, keyed by `task_id` (§4.6
    /// "Slave-originated message routing").
    pub fn handle_readiness_report(&self, report: TaskReadinessReport) {
        let _ = self.translator.resolve(&report.node_action_id);
        if let Some(tx) = self.task_events.get(&report.task_id) {
            let _ = tx.send(TaskEvent::Readiness(report));
        }
    }

    pub fn handle_progress_update(&self, update: TaskProgressUpdate) {
        let _ = self.translator.resolve(&update.node_action_id);
        if let Some(tx) = self.task_events.get(&update.task_id) {
            let _ = tx.send(TaskEvent::Progress(update));
        }
    }

    pub fn handle_log_flush_confirmation(&self, node_action_id: &str, node_name: &str) {
        let _ = self.translator.resolve(node_action_id);
        if let Some(tx) = self.flush_waiters.get(node_action_id) {
            let _ = tx.send(node_name.to_string());
        }
    }

    /// Appends a slave-originated `TaskLogEntry` to its NodeAction's stage
    /// log under the node's own file (§4.1 `ReportTaskLog`, §6, Testable
    /// Property 8). Resolved through C5 rather than a dispatcher-local map
    /// since a log line for a NodeAction that just finished (still within
    /// its grace window) must still be journaled, not dropped.
    pub fn handle_task_log(&self, entry: TaskLogEntry) {
        let (master_action_id, stage_index) = match self.translator.resolve(&entry.node_action_id) {
            RouteResolution::Live { master_action_id, stage_index } => (master_action_id, stage_index),
            RouteResolution::GraceWindow { master_action_id, stage_index } => (master_action_id, stage_index),
            RouteResolution::Unknown => return,
        };

        let journal = Arc::clone(&self.journal);
        let node_action_id = entry.node_action_id.clone();
        let node_name = entry.node_name;
        let message = entry.message;
        tokio::spawn(async move {
            if let Err(err) = journal.append_stage_log(&master_action_id, stage_index, &node_name, &message).await {
                warn!(?err, node_action_id, node_name, "failed to append slave-reported task log line");
            }
        });
    }

    /// Drives a fully formed `NodeAction` through both phases to a
    /// terminal outcome (§4.6 "Inputs"/"Outputs").
    pub async fn execute(self: &Arc<Self>, mut node_action: NodeAction, progress: ProgressReporter, cancel: CancelNode) -> NodeActionResult {
        node_action.overall_status = NodeActionOverallStatus::AwaitingReadiness;
        node_action.start_time = Some(chrono::Utc::now());
        let node_action_id = node_action.id.clone();
        let task_ids: Vec<String> = node_action.node_tasks.iter().map(|t| t.task_id.clone()).collect();
        let shared = Arc::new(Mutex::new(node_action));

        let phase1 = task_ids.iter().map(|task_id| {
            let this = Arc::clone(self);
            let shared = Arc::clone(&shared);
            let cancel = cancel.clone();
            let node_action_id = node_action_id.clone();
            let task_id = task_id.clone();
            async move { this.run_prepare_phase(&node_action_id, &task_id, &shared, &cancel, &progress).await }
        });
        futures::future::join_all(phase1).await;

        let ready_task_ids: Vec<String> = {
            let guard = shared.lock().await;
            guard
                .node_tasks
                .iter()
                .filter(|t| t.state == NodeTaskState::ReadyToExecute)
                .map(|t| t.task_id.clone())
                .collect()
        };

        if ready_task_ids.is_empty() {
            warn!(node_action_id = %node_action_id, "no task reached ReadyToExecute; skipping execute phase");
        } else {
            let phase2 = ready_task_ids.iter().map(|task_id| {
                let this = Arc::clone(self);
                let shared = Arc::clone(&shared);
                let cancel = cancel.clone();
                let node_action_id = node_action_id.clone();
                let task_id = task_id.clone();
                let progress = Arc::clone(&progress);
                async move { this.run_execute_phase(&node_action_id, &task_id, &shared, &cancel, &progress).await }
            });
            futures::future::join_all(phase2).await;
        }

        self.run_log_flush_handshake(&node_action_id, &shared).await;

        let mut guard = shared.lock().await;
        self.finalize_outcome(&mut guard, cancel.is_cancelled());
        let is_success = matches!(
            guard.overall_status,
            NodeActionOverallStatus::Succeeded | NodeActionOverallStatus::SucceededWithErrors
        );
        NodeActionResult { is_success, final_state: guard.clone() }
    }

    fn recompute_progress(&self, action: &mut NodeAction, progress: &ProgressReporter) {
        let total: u32 = action.node_tasks.iter().map(|t| t.aggregation_percent() as u32).sum();
        let mean = total / action.node_tasks.len().max(1) as u32;
        action.progress_percent = mean as u8;

        let worst = action
            .node_tasks
            .iter()
            .map(|t| t.state)
            .max_by_key(|s| match s {
                NodeTaskState::Failed | NodeTaskState::TimedOut | NodeTaskState::NodeOfflineDuringTask | NodeTaskState::CancellationFailed => 3,
                NodeTaskState::Cancelling | NodeTaskState::Cancelled => 2,
                s if !s.is_terminal() => 1,
                _ => 0,
            })
            .unwrap_or(NodeTaskState::Pending);
        progress(action.progress_percent, format!("worst task state: {worst}"));
    }

    async fn run_prepare_phase(&self, node_action_id: &str, task_id: &str, shared: &Arc<Mutex<NodeAction>>, cancel: &CancelNode, progress: &ProgressReporter) {
        let (node_name, task_type, payload) = {
            let guard = shared.lock().await;
            let t = find_task(&guard, task_id);
            (t.node_name.clone(), t.task_type.clone(), t.payload.clone())
        };

        if !self.connections.is_connected(&node_name) {
            let mut guard = shared.lock().await;
            let t = find_task_mut(&mut guard, task_id);
            let _ = t.transition(NodeTaskState::AwaitingReadiness);
            let _ = t.transition(NodeTaskState::DispatchFailedPrepare);
            t.status_message = Some("node not connected".to_string());
            self.recompute_progress(&mut guard, progress);
            return;
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        self.task_events.insert(task_id.to_string(), tx);

        {
            let mut guard = shared.lock().await;
            let _ = find_task_mut(&mut guard, task_id).transition(NodeTaskState::AwaitingReadiness);
            self.recompute_progress(&mut guard, progress);
        }

        let msg = PrepareForTask {
            node_action_id: node_action_id.to_string(),
            task_id: task_id.to_string(),
            expected_task_type: task_type,
            target_resource: None,
            preparation_parameters_json: payload,
        };

        if self.transport.prepare_for_task(&node_name, msg).await.is_err() {
            let mut guard = shared.lock().await;
            let _ = find_task_mut(&mut guard, task_id).transition(NodeTaskState::DispatchFailedPrepare);
            self.recompute_progress(&mut guard, progress);
            self.task_events.remove(task_id);
            return;
        }

        let readiness_timeout = self.timeouts.readiness_timeout();
        tokio::select! {
            _ = cancel.cancelled() => {
                let mut guard = shared.lock().await;
                let _ = find_task_mut(&mut guard, task_id).transition(NodeTaskState::Cancelled);
                self.recompute_progress(&mut guard, progress);
            }
            _ = tokio::time::sleep(readiness_timeout) => {
                let mut guard = shared.lock().await;
                let _ = find_task_mut(&mut guard, task_id).transition(NodeTaskState::ReadinessCheckTimedOut);
                self.recompute_progress(&mut guard, progress);
            }
            event = rx.recv() => {
                if let Some(TaskEvent::Readiness(report)) = event {
                    let mut guard = shared.lock().await;
                    let t = find_task_mut(&mut guard, task_id);
                    if report.is_ready {
                        let _ = t.transition(NodeTaskState::ReadyToExecute);
                    } else {
                        let _ = t.transition(NodeTaskState::NotReadyForTask);
                        t.status_message = report.reason_if_not_ready.clone();
                    }
                    self.recompute_progress(&mut guard, progress);
                }
            }
        }
        self.task_events.remove(task_id);
    }

    async fn run_execute_phase(&self, node_action_id: &str, task_id: &str, shared: &Arc<Mutex<NodeAction>>, cancel: &CancelNode, progress: &ProgressReporter) {
        loop {
            let (node_name, task_type, payload, retry_count) = {
                let guard = shared.lock().await;
                let t = find_task(&guard, task_id);
                (t.node_name.clone(), t.task_type.clone(), t.payload.clone(), t.retry_count)
            };

            let (tx, mut rx) = mpsc::unbounded_channel();
            self.task_events.insert(task_id.to_string(), tx);

            let msg = ExecuteTaskInstruction {
                node_action_id: node_action_id.to_string(),
                task_id: task_id.to_string(),
                task_type: task_type.clone(),
                parameters_json: payload,
            };

            if self.transport.execute_task(&node_name, msg).await.is_err() {
                let mut guard = shared.lock().await;
                let _ = find_task_mut(&mut guard, task_id).transition(NodeTaskState::TaskDispatchFailedExecute);
                self.recompute_progress(&mut guard, progress);
                self.task_events.remove(task_id);
                return;
            }

            {
                let mut guard = shared.lock().await;
                let _ = find_task_mut(&mut guard, task_id).transition(NodeTaskState::TaskDispatched);
                self.recompute_progress(&mut guard, progress);
            }

            let exec_timeout = self.timeouts.execution_timeout_for(&task_type, &self.per_task_type);
            let mut health_changes = self.health.subscribe();
            let deadline = tokio::time::sleep(exec_timeout);
            tokio::pin!(deadline);

            let outcome = loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        break self.cancel_in_flight_task(node_action_id, task_id, &node_name, shared, &mut rx, progress).await;
                    }
                    _ = &mut deadline => {
                        let _ = self.transport.cancel_task(&node_name, CancelTaskRequest { node_action_id: node_action_id.to_string(), task_id: task_id.to_string() }).await;
                        {
                            let mut guard = shared.lock().await;
                            let _ = find_task_mut(&mut guard, task_id).transition(NodeTaskState::Cancelling);
                        }
                        let grace = self.timeouts.cancel_grace();
                        tokio::select! {
                            event = rx.recv() => {
                                self.apply_terminal_or(shared, task_id, event, NodeTaskState::TimedOut, progress).await;
                            }
                            _ = tokio::time::sleep(grace) => {
                                let mut guard = shared.lock().await;
                                let _ = find_task_mut(&mut guard, task_id).transition(NodeTaskState::TimedOut);
                                self.recompute_progress(&mut guard, progress);
                            }
                        }
                        break find_task(&*shared.lock().await, task_id).state;
                    }
                    health_event = health_changes.recv() => {
                        if let Ok(change) = health_event {
                            if change.node_name == node_name && change.current == AgentConnectivityStatus::Offline {
                                let mut guard = shared.lock().await;
                                let _ = find_task_mut(&mut guard, task_id).transition(NodeTaskState::NodeOfflineDuringTask);
                                self.recompute_progress(&mut guard, progress);
                                break NodeTaskState::NodeOfflineDuringTask;
                            }
                        }
                    }
                    event = rx.recv() => {
                        match event {
                            Some(TaskEvent::Progress(update)) => {
                                let mut guard = shared.lock().await;
                                let reached_terminal = self.apply_progress_update(&mut guard, task_id, update);
                                self.recompute_progress(&mut guard, progress);
                                if reached_terminal {
                                    break find_task(&guard, task_id).state;
                                }
                            }
                            _ => break find_task(&*shared.lock().await, task_id).state,
                        }
                    }
                }
            };
            self.task_events.remove(task_id);

            if outcome == NodeTaskState::Failed {
                let max_retries = self.timeouts.max_retries_for(&task_type, &self.per_task_type);
                if retry_count < max_retries {
                    let mut guard = shared.lock().await;
                    let t = find_task_mut(&mut guard, task_id);
                    let _ = t.transition(NodeTaskState::Retrying);
                    let _ = t.transition(NodeTaskState::Pending);
                    t.retry_count += 1;
                    info!(task_id, retry_count = t.retry_count, max_retries, "retrying failed task");
                    drop(guard);
                    continue;
                }
            }
            return;
        }
    }

    /// Applies the terminal implied by an inbound event once we're already
    /// in the cancel-grace wait, defaulting to `fallback` if the channel
    /// closed or carried something unexpected.
    async fn apply_terminal_or(&self, shared: &Arc<Mutex<NodeAction>>, task_id: &str, event: Option<TaskEvent>, fallback: NodeTaskState, progress: &ProgressReporter) {
        let mut guard = shared.lock().await;
        match event {
            Some(TaskEvent::Progress(update)) => {
                self.apply_progress_update(&mut guard, task_id, update);
            }
            _ => {
                let _ = find_task_mut(&mut guard, task_id).transition(fallback);
            }
        }
        self.recompute_progress(&mut guard, progress);
    }

    async fn cancel_in_flight_task(
        &self,
        node_action_id: &str,
        task_id: &str,
        node_name: &str,
        shared: &Arc<Mutex<NodeAction>>,
        rx: &mut mpsc::UnboundedReceiver<TaskEvent>,
        progress: &ProgressReporter,
    ) -> NodeTaskState {
        let _ = self
            .transport
            .cancel_task(node_name, CancelTaskRequest { node_action_id: node_action_id.to_string(), task_id: task_id.to_string() })
            .await;
        {
            let mut guard = shared.lock().await;
            let _ = find_task_mut(&mut guard, task_id).transition(NodeTaskState::Cancelling);
            self.recompute_progress(&mut guard, progress);
        }
        let grace = self.timeouts.cancel_grace();
        tokio::select! {
            event = rx.recv() => {
                let mut guard = shared.lock().await;
                match event {
                    Some(TaskEvent::Progress(update)) if NodeTaskState::from_wire_str(&update.status) == Some(NodeTaskState::Cancelled) => {
                        let _ = find_task_mut(&mut guard, task_id).transition(NodeTaskState::Cancelled);
                    }
                    _ => {
                        let _ = find_task_mut(&mut guard, task_id).transition(NodeTaskState::CancellationFailed);
                    }
                }
                self.recompute_progress(&mut guard, progress);
            }
            _ = tokio::time::sleep(grace) => {
                let mut guard = shared.lock().await;
                let _ = find_task_mut(&mut guard, task_id).transition(NodeTaskState::CancellationFailed);
                self.recompute_progress(&mut guard, progress);
            }
        }
        find_task(&*shared.lock().await, task_id).state
    }

    /// Applies one `TaskProgressUpdate`, returning whether the task reached
    /// a terminal state.
    fn apply_progress_update(&self, action: &mut NodeAction, task_id: &str, update: TaskProgressUpdate) -> bool {
        let task = find_task_mut(action, task_id);
        if let Some(next) = NodeTaskState::from_wire_str(&update.status) {
            if task.state.can_transition_to(next) {
                let _ = task.transition(next);
            } else if next == task.state {
                // re-entrant progress report, no state change
            } else {
                warn!(task_id, from = %task.state, to = %update.status, "ignoring illegal task transition reported by slave");
            }
        }
        task.progress_percent = update.progress_percent;
        task.status_message = update.message.clone();
        if update.result_json.is_some() {
            task.result_payload = update.result_json.clone();
        }
        task.state.is_terminal()
    }

    async fn run_log_flush_handshake(&self, node_action_id: &str, shared: &Arc<Mutex<NodeAction>>) {
        let participating_nodes: Vec<String> = {
            let guard = shared.lock().await;
            guard.node_tasks.iter().map(|t| t.node_name.clone()).collect::<std::collections::HashSet<_>>().into_iter().collect()
        };
        let connected: Vec<String> = participating_nodes.into_iter().filter(|n| self.connections.is_connected(n)).collect();
        if connected.is_empty() {
            return;
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        self.flush_waiters.insert(node_action_id.to_string(), tx);

        for node_name in &connected {
            let _ = self.transport.request_log_flush(node_name, LogFlushRequest { node_action_id: node_action_id.to_string() }).await;
        }

        let mut confirmed = std::collections::HashSet::new();
        let timeout = self.timeouts.log_flush_timeout();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        while confirmed.len() < connected.len() {
            tokio::select! {
                _ = &mut deadline => break,
                node_name = rx.recv() => {
                    match node_name {
                        Some(n) => { confirmed.insert(n); }
                        None => break,
                    }
                }
            }
        }
        if confirmed.len() < connected.len() {
            warn!(node_action_id, confirmed = confirmed.len(), expected = connected.len(), "log flush handshake incomplete; proceeding anyway");
        }
        self.flush_waiters.remove(node_action_id);
    }

    /// §4.6 "Overall outcome computation", applied once every task is terminal.
    fn finalize_outcome(&self, action: &mut NodeAction, cancellation_requested: bool) {
        action.end_time = Some(chrono::Utc::now());

        let any_cancelled_or_cancel_failed = action
            .node_tasks
            .iter()
            .any(|t| matches!(t.state, NodeTaskState::Cancelled | NodeTaskState::CancellationFailed));

        let outcome = if cancellation_requested && any_cancelled_or_cancel_failed {
            NodeActionOverallStatus::Cancelled
        } else if action.node_tasks.iter().all(|t| t.state == NodeTaskState::Succeeded) {
            NodeActionOverallStatus::Succeeded
        } else if action.node_tasks.iter().all(|t| t.state.is_success_class()) && action.node_tasks.iter().any(|t| t.state == NodeTaskState::SucceededWithIssues) {
            NodeActionOverallStatus::SucceededWithErrors
        } else {
            NodeActionOverallStatus::Failed
        };

        action.is_cancellation_requested = cancellation_requested;
        action.overall_status = outcome;
        action.final_outcome = Some(outcome);
    }
}
