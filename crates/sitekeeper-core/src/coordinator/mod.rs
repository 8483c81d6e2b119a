//! MasterActionCoordinator (spec §4.8): accepts or rejects new
//! MasterActions, resolves and launches their handler, and owns the set
//! of currently non-terminal actions.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::error;

use sitekeeper_shared::config::ConflictPolicy;
use sitekeeper_shared::error::{SiteKeeperError, SiteKeeperResult};

use crate::cancel::CancelNode;
use crate::context::{ContextServices, MasterActionContext};
use crate::model::{MasterAction, OverallStatus};
use crate::notifier::{completed_event, started_event, GuiNotifier};

/// The contract a registered operation type implements (§4.8, §4.9).
/// Handlers drive a `MasterActionContext` through its stages and
/// optionally set a terminal status themselves; if they return `Ok(())`
/// without doing so the coordinator defaults to `Succeeded`.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    fn operation_type(&self) -> &'static str;
    async fn execute(&self, ctx: Arc<MasterActionContext>) -> SiteKeeperResult<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted { master_action_id: String },
    Rejected { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancellationOutcome {
    CancellationPending,
    AlreadyCompleted,
    NotFound,
    /// Reserved for handlers that opt out of cooperative cancellation.
    /// Every handler in this crate honors its `CancelNode`, so the
    /// current implementation never returns this variant.
    CancellationNotSupported,
}

#[derive(Clone)]
struct ActiveEntry {
    operation_type: String,
    cancel: CancelNode,
    action: Arc<Mutex<MasterAction>>,
}

pub struct MasterActionCoordinator {
    services: Arc<ContextServices>,
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
    conflict_policy: ConflictPolicy,
    notifier: Arc<dyn GuiNotifier>,
    active: DashMap<String, ActiveEntry>,
}

impl MasterActionCoordinator {
    pub fn new(
        services: Arc<ContextServices>,
        handlers: Vec<Arc<dyn ActionHandler>>,
        conflict_policy: ConflictPolicy,
        notifier: Arc<dyn GuiNotifier>,
    ) -> Arc<Self> {
        let handlers = handlers.into_iter().map(|h| (h.operation_type().to_string(), h)).collect();
        Arc::new(Self {
            services,
            handlers,
            conflict_policy,
            notifier,
            active: DashMap::new(),
        })
    }

    fn conflicts_with_active(&self, operation_type: &str) -> bool {
        match self.conflict_policy {
            ConflictPolicy::SingleGlobal => !self.active.is_empty(),
            ConflictPolicy::PerOperationType => self.active.iter().any(|e| e.operation_type == operation_type),
        }
    }

    /// Rejects on conflict or an unregistered OperationType; otherwise
    /// creates the `MasterAction`, opens its Journal directory, and
    /// launches the handler concurrently (§4.8).
    pub async fn submit_action(
        self: &Arc<Self>,
        operation_type: impl Into<String>,
        parameters: HashMap<String, Value>,
        initiated_by: Option<String>,
    ) -> SubmitOutcome {
        let operation_type = operation_type.into();

        if self.conflicts_with_active(&operation_type) {
            return SubmitOutcome::Rejected {
                reason: format!("a conflicting MasterAction is already running under {:?}", self.conflict_policy),
            };
        }

        let handler = match self.handlers.get(&operation_type) {
            Some(h) => Arc::clone(h),
            None => {
                return SubmitOutcome::Rejected {
                    reason: SiteKeeperError::UnknownOperationType { operation_type }.to_string(),
                }
            }
        };

        let mut action = MasterAction::new(operation_type.clone(), parameters);
        action.initiated_by = initiated_by;

        if let Err(err) = self.services.journal.begin_master_action(&action).await {
            error!(?err, "failed to open journal directory for new MasterAction");
            return SubmitOutcome::Rejected { reason: err.to_string() };
        }

        let master_action_id = action.id.clone();
        let cancel = CancelNode::root();
        let ctx = Arc::new(MasterActionContext::new(action, Arc::clone(&self.services), cancel.clone()));

        self.active.insert(
            master_action_id.clone(),
            ActiveEntry { operation_type, cancel, action: Arc::clone(&ctx.action) },
        );

        self.notifier.notify(started_event(&*ctx.action.lock().await)).await;

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run_handler(handler, ctx).await;
        });

        SubmitOutcome::Accepted { master_action_id }
    }

    /// Runs the handler to completion, applying the return/exception/finally
    /// semantics of §4.8, then finalizes in the Journal, notifies C10, and
    /// removes the action from the active set.
    async fn run_handler(self: Arc<Self>, handler: Arc<dyn ActionHandler>, ctx: Arc<MasterActionContext>) {
        let master_action_id = ctx.action.lock().await.id.clone();

        match handler.execute(Arc::clone(&ctx)).await {
            Ok(()) => {
                if !ctx.is_terminal().await {
                    ctx.set_completed("completed with no explicit result").await;
                }
            }
            Err(err) => {
                error!(master_action_id = %master_action_id, %err, "action handler returned an error");
                ctx.set_failed(err.to_string()).await;
            }
        }

        let final_snapshot = ctx.action.lock().await.clone();
        if let Err(err) = self.services.journal.finalize_master_action(&final_snapshot).await {
            error!(?err, "failed to finalize MasterAction in journal");
        }
        self.notifier.notify(completed_event(&final_snapshot)).await;
        self.active.remove(&master_action_id);
    }

    /// Triggers the action's cancel token and marks it `Cancelling`
    /// (§4.8). Once an action has left the active set (finished or
    /// never existed) this returns `NotFound` — distinguishing
    /// "completed" from "unknown" would require retaining a tombstone of
    /// recently finished ids, which this coordinator does not keep.
    pub async fn request_cancellation(&self, master_action_id: &str) -> CancellationOutcome {
        let entry = match self.active.get(master_action_id) {
            Some(e) => e.clone(),
            None => return CancellationOutcome::NotFound,
        };

        let mut guard = entry.action.lock().await;
        if guard.is_terminal() {
            return CancellationOutcome::AlreadyCompleted;
        }
        guard.overall_status = OverallStatus::Cancelling;
        drop(guard);

        entry.cancel.cancel();
        CancellationOutcome::CancellationPending
    }
}
