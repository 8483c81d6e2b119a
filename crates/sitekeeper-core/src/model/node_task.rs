//! NodeTask state graph (spec §4.6).
//!
//! Mirrors the way the teacher models `WorkflowStepState` /
//! `TaskState` as closed enums with an explicit, exhaustively-matched
//! transition surface (see `tasker-orchestration`'s `StateTransitionHandler`
//! and `TaskCoordinator`) rather than a free-form string status.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One state in the per-task graph of spec §4.6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeTaskState {
    Pending,
    AwaitingReadiness,
    ReadyToExecute,
    NotReadyForTask,
    ReadinessCheckTimedOut,
    DispatchFailedPrepare,
    TaskDispatched,
    TaskDispatchFailedExecute,
    Starting,
    InProgress,
    Succeeded,
    SucceededWithIssues,
    Failed,
    Retrying,
    TimedOut,
    NodeOfflineDuringTask,
    Cancelling,
    Cancelled,
    CancellationFailed,
}

impl fmt::Display for NodeTaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl NodeTaskState {
    /// Parses the `status` string carried by `TaskProgressUpdate` (§6) back
    /// into a state. Slave implementations send the Rust-side `Debug` name.
    pub fn from_wire_str(s: &str) -> Option<Self> {
        use NodeTaskState::*;
        Some(match s {
            "Pending" => Pending,
            "AwaitingReadiness" => AwaitingReadiness,
            "ReadyToExecute" => ReadyToExecute,
            "NotReadyForTask" => NotReadyForTask,
            "ReadinessCheckTimedOut" => ReadinessCheckTimedOut,
            "DispatchFailedPrepare" => DispatchFailedPrepare,
            "TaskDispatched" => TaskDispatched,
            "TaskDispatchFailedExecute" => TaskDispatchFailedExecute,
            "Starting" => Starting,
            "InProgress" => InProgress,
            "Succeeded" => Succeeded,
            "SucceededWithIssues" => SucceededWithIssues,
            "Failed" => Failed,
            "Retrying" => Retrying,
            "TimedOut" => TimedOut,
            "NodeOfflineDuringTask" => NodeOfflineDuringTask,
            "Cancelling" => Cancelling,
            "Cancelled" => Cancelled,
            "CancellationFailed" => CancellationFailed,
            _ => return None,
        })
    }
}

impl NodeTaskState {
    /// The `IsTerminal` set from spec §4.6. `Failed` is included here
    /// because it is terminal *unless* the dispatcher immediately
    /// schedules a retry (Failed -> Retrying -> Pending is the one
    /// documented exception to "terminal states never transition").
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::NotReadyForTask
                | Self::ReadinessCheckTimedOut
                | Self::DispatchFailedPrepare
                | Self::Succeeded
                | Self::SucceededWithIssues
                | Self::Failed
                | Self::Cancelled
                | Self::CancellationFailed
                | Self::TaskDispatchFailedExecute
                | Self::NodeOfflineDuringTask
                | Self::TimedOut
        )
    }

    /// Success-class terminal states, used by the NodeAction outcome rule.
    pub fn is_success_class(self) -> bool {
        matches!(self, Self::Succeeded | Self::SucceededWithIssues)
    }

    /// Whether `next` is a legal transition target from `self`.
    ///
    /// `Failed -> Retrying` is the single sanctioned edge out of a
    /// terminal state (§4.6's documented retry exception); every other
    /// terminal state rejects any further transition.
    pub fn can_transition_to(self, next: NodeTaskState) -> bool {
        use NodeTaskState::*;
        if self.is_terminal() {
            return self == Failed && next == Retrying;
        }
        matches!(
            (self, next),
            (Pending, AwaitingReadiness)
                | (Pending, Cancelled)
                | (AwaitingReadiness, ReadyToExecute)
                | (AwaitingReadiness, NotReadyForTask)
                | (AwaitingReadiness, ReadinessCheckTimedOut)
                | (AwaitingReadiness, DispatchFailedPrepare)
                | (AwaitingReadiness, Cancelling)
                | (ReadyToExecute, TaskDispatched)
                | (ReadyToExecute, TaskDispatchFailedExecute)
                | (ReadyToExecute, Cancelled)
                // retry re-dispatches straight from Pending, skipping a second
                // readiness probe (§4.6 retry policy: Failed -> Retrying -> Pending).
                | (Pending, TaskDispatched)
                | (TaskDispatched, Starting)
                | (TaskDispatched, Cancelling)
                | (Starting, InProgress)
                | (Starting, Cancelling)
                | (InProgress, InProgress) // progress updates re-enter the same state
                | (InProgress, Succeeded)
                | (InProgress, SucceededWithIssues)
                | (InProgress, Failed)
                | (InProgress, TimedOut)
                | (InProgress, NodeOfflineDuringTask)
                | (InProgress, Cancelling)
                | (Cancelling, Cancelled)
                | (Cancelling, CancellationFailed)
                | (Retrying, Pending)
        )
    }
}

/// One per-node task (spec §3 `NodeTask`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeTaskStatus {
    pub task_id: String,
    pub action_id: String,
    pub node_name: String,
    pub task_type: String,
    pub state: NodeTaskState,
    pub payload: Value,
    pub creation_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub last_update_time: Option<DateTime<Utc>>,
    pub progress_percent: u8,
    pub status_message: Option<String>,
    pub retry_count: u32,
    pub result_payload: Option<Value>,
}

impl NodeTaskStatus {
    pub fn new(action_id: impl Into<String>, node_name: impl Into<String>, task_type: impl Into<String>, payload: Value) -> Self {
        let now = Utc::now();
        Self {
            task_id: uuid::Uuid::new_v4().to_string(),
            action_id: action_id.into(),
            node_name: node_name.into(),
            task_type: task_type.into(),
            state: NodeTaskState::Pending,
            payload,
            creation_time: now,
            start_time: None,
            end_time: None,
            last_update_time: None,
            progress_percent: 0,
            status_message: None,
            retry_count: 0,
            result_payload: None,
        }
    }

    /// Apply a validated transition, updating timestamps per the
    /// invariants in spec §3 ("terminal statuses set endTime").
    ///
    /// Returns `Err` (invariant violation) if the transition is illegal —
    /// callers are expected to have already checked `can_transition_to`
    /// when the transition is data-dependent (e.g. success vs. issues).
    pub fn transition(&mut self, next: NodeTaskState) -> Result<(), String> {
        if !self.state.can_transition_to(next) {
            return Err(format!(
                "illegal NodeTask transition {:?} -> {:?} for task {}",
                self.state, next, self.task_id
            ));
        }
        let now = Utc::now();
        if matches!(next, NodeTaskState::Starting) && self.start_time.is_none() {
            self.start_time = Some(now);
        }
        if next.is_terminal() {
            self.end_time = Some(now);
        }
        self.last_update_time = Some(now);
        self.state = next;
        Ok(())
    }

    /// Progress percent counted for aggregation: terminal-success tasks
    /// count as 100, terminal-non-success count as their last reported
    /// percent (or 0 if none) — spec §4.6 "Progress aggregation".
    pub fn aggregation_percent(&self) -> u8 {
        if self.state.is_terminal() {
            if self.state.is_success_class() {
                100
            } else {
                self.progress_percent
            }
        } else {
            self.progress_percent
        }
    }
}
