//! `OrchestrationTest` reference handler (spec §4.9): reads simulation
//! parameters off the submitted `MasterAction` and exercises the node-task
//! state graph end to end. The simulated behaviors themselves
//! (`slaveBehavior`, injected delays) are interpreted by whatever test
//! double sits on the other end of the transport; this handler's job is
//! only to forward them verbatim and to apply the one master-side
//! simulation, `masterFailure`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use sitekeeper_shared::error::SiteKeeperResult;

use crate::context::MasterActionContext;
use crate::coordinator::ActionHandler;

const TASK_TYPE: &str = "OrchestrationTestTask";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MasterFailureMode {
    None,
    ThrowAfterFirstStage,
}

impl MasterFailureMode {
    fn from_parameters(parameters: &HashMap<String, Value>) -> Self {
        match parameters.get("masterFailure").and_then(Value::as_str) {
            Some("ThrowAfterFirstStage") => Self::ThrowAfterFirstStage,
            _ => Self::None,
        }
    }
}

pub struct OrchestrationTestHandler;

#[async_trait]
impl ActionHandler for OrchestrationTestHandler {
    fn operation_type(&self) -> &'static str {
        "OrchestrationTest"
    }

    async fn execute(&self, ctx: Arc<MasterActionContext>) -> SiteKeeperResult<()> {
        let parameters = ctx.action.lock().await.parameters.clone();
        let master_failure = MasterFailureMode::from_parameters(&parameters);
        let target_node_names = parameters.get("targetNodeName").and_then(Value::as_str).map(|n| vec![n.to_string()]);

        // Forwarded verbatim to the slave; the core never interprets these.
        let simulation_payload = json!({
            "slaveBehavior": parameters.get("slaveBehavior").cloned().unwrap_or(Value::Null),
            "customMessage": parameters.get("customMessage").cloned().unwrap_or(Value::Null),
            "executionDelaySeconds": parameters.get("executionDelaySeconds").cloned().unwrap_or(Value::Null),
        });

        ctx.initialize_progress(1).await;

        let stage = ctx.begin_stage("Simulation Stage").await;
        let result = stage
            .create_and_execute_node_action("Orchestration Test Stage", TASK_TYPE, simulation_payload, HashMap::new(), target_node_names)
            .await?;
        stage.close().await?;

        if master_failure == MasterFailureMode::ThrowAfterFirstStage {
            return Err(sitekeeper_shared::error::SiteKeeperError::HandlerFailed {
                master_action_id: uuid::Uuid::parse_str(&ctx.action.lock().await.id).unwrap_or_default(),
                reason: "masterFailure=ThrowAfterFirstStage: simulated failure after first stage".to_string(),
            });
        }

        if result.final_state.overall_status == crate::model::NodeActionOverallStatus::Cancelled {
            ctx.set_cancelled("orchestration test cancelled").await;
        } else if result.is_success {
            ctx.set_completed("orchestration test completed").await;
        } else {
            ctx.set_failed("orchestration test stage reported a non-success outcome").await;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelNode;
    use crate::connection::AgentConnectionManager;
    use crate::context::ContextServices;
    use crate::dispatcher::NodeActionDispatcher;
    use crate::health::NodeHealthMonitor;
    use crate::journal::Journal;
    use crate::model::{MasterAction, OverallStatus};
    use crate::routing::ActionIdTranslator;
    use crate::transport::InMemorySlaveTransport;
    use sitekeeper_shared::config::TimeoutsConfig;
    use std::time::Duration;

    async fn test_ctx(parameters: HashMap<String, Value>) -> (Arc<MasterActionContext>, tempfile::TempDir) {
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
        let services = Arc::new(ContextServices { journal, translator, connections, dispatcher });

        let action = MasterAction::new("OrchestrationTest", parameters);
        services.journal.begin_master_action(&action).await.unwrap();
        (Arc::new(MasterActionContext::new(action, services, CancelNode::root())), dir)
    }

    #[tokio::test]
    async fn master_failure_throw_after_first_stage_fails_with_single_stage_history() {
        let mut parameters = HashMap::new();
        parameters.insert("masterFailure".to_string(), json!("ThrowAfterFirstStage"));
        let (ctx, _dir) = test_ctx(parameters).await;

        let err = OrchestrationTestHandler.execute(Arc::clone(&ctx)).await;
        assert!(err.is_err());

        let guard = ctx.action.lock().await;
        assert_eq!(guard.execution_history.len(), 1);
        assert!(guard.execution_history[0].is_success);
    }

    #[tokio::test]
    async fn no_simulated_failure_completes_successfully_with_no_connected_nodes() {
        let (ctx, _dir) = test_ctx(HashMap::new()).await;
        OrchestrationTestHandler.execute(Arc::clone(&ctx)).await.unwrap();

        let guard = ctx.action.lock().await;
        assert!(guard.is_terminal());
        assert_eq!(guard.overall_status, OverallStatus::Succeeded);
    }
}
