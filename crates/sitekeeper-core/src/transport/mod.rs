//! Transport abstraction (spec §4.1).
//!
//! The core depends only on this trait for the Master->Slave direction;
//! Slave->Master messages arrive as an [`InboundSlaveMessage`] stream that
//! `connection`/`routing` consume. Modeled as an object-safe `async_trait`,
//! the same shape the teacher uses for `MessagingProvider` in
//! `tasker-shared/src/messaging/client.rs`, rather than hand-rolling a
//! bespoke future-returning trait.

mod reconnect;

pub use reconnect::ReconnectSchedule;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;

use sitekeeper_shared::error::{SiteKeeperError, SiteKeeperResult};
use sitekeeper_shared::wire::{
    AdjustSystemTimeCommand, CancelTaskRequest, ExecuteTaskInstruction, Heartbeat,
    LogFlushConfirmation, LogFlushRequest, PrepareForTask, SlaveRegistration, TaskLogEntry,
    TaskProgressUpdate, TaskReadinessReport,
};

/// Everything a slave can send. `channel_handle` identifies the physical
/// connection a message arrived on, independent of whether the sender has
/// already told us its `node_name` (it hasn't, before `RegisterSlave`).
#[derive(Debug, Clone)]
pub enum InboundSlaveMessage {
    RegisterSlave {
        channel_handle: String,
        registration: SlaveRegistration,
        remote_address: Option<String>,
    },
    Heartbeat(Heartbeat),
    TaskReadinessReport(TaskReadinessReport),
    TaskProgressUpdate(TaskProgressUpdate),
    LogFlushConfirmation(LogFlushConfirmation),
    TaskLogEntry(TaskLogEntry),
    Disconnected {
        channel_handle: String,
        node_name: Option<String>,
    },
}

/// Master->Slave, per §4.1's named-method contract.
#[async_trait]
pub trait SlaveTransport: Send + Sync + fmt::Debug {
    async fn prepare_for_task(&self, node_name: &str, msg: PrepareForTask) -> SiteKeeperResult<()>;
    async fn execute_task(&self, node_name: &str, msg: ExecuteTaskInstruction) -> SiteKeeperResult<()>;
    async fn cancel_task(&self, node_name: &str, msg: CancelTaskRequest) -> SiteKeeperResult<()>;
    async fn request_log_flush(&self, node_name: &str, msg: LogFlushRequest) -> SiteKeeperResult<()>;
    async fn adjust_system_time(&self, node_name: &str, msg: AdjustSystemTimeCommand) -> SiteKeeperResult<()>;
}

/// One outbound message as queued to an in-memory slave stub.
#[derive(Debug, Clone)]
pub enum OutboundSlaveMessage {
    PrepareForTask(PrepareForTask),
    ExecuteTask(ExecuteTaskInstruction),
    CancelTask(CancelTaskRequest),
    RequestLogFlush(LogFlushRequest),
    AdjustSystemTime(AdjustSystemTimeCommand),
}

/// Test/demo transport: one `mpsc` channel per registered `node_name`,
/// mirroring the teacher's `MessagingProvider::new_in_memory()` stub used
/// throughout its messaging test suite instead of a real broker.
#[derive(Debug, Default)]
pub struct InMemorySlaveTransport {
    senders: DashMap<String, mpsc::UnboundedSender<OutboundSlaveMessage>>,
}

impl InMemorySlaveTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a node's inbound queue, returning the receiver end a test
    /// harness drains to assert on what the dispatcher sent it.
    pub fn register_node(&self, node_name: impl Into<String>) -> mpsc::UnboundedReceiver<OutboundSlaveMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.insert(node_name.into(), tx);
        rx
    }

    pub fn deregister_node(&self, node_name: &str) {
        self.senders.remove(node_name);
    }

    fn send(&self, node_name: &str, msg: OutboundSlaveMessage) -> SiteKeeperResult<()> {
        match self.senders.get(node_name) {
            Some(tx) => tx.send(msg).map_err(|_| SiteKeeperError::TransportDisconnected {
                node_name: node_name.to_string(),
                reason: "receiver dropped".to_string(),
            }),
            None => Err(SiteKeeperError::TransportDisconnected {
                node_name: node_name.to_string(),
                reason: "no registered channel".to_string(),
            }),
        }
    }
}

#[async_trait]
impl SlaveTransport for InMemorySlaveTransport {
    async fn prepare_for_task(&self, node_name: &str, msg: PrepareForTask) -> SiteKeeperResult<()> {
        self.send(node_name, OutboundSlaveMessage::PrepareForTask(msg))
    }

    async fn execute_task(&self, node_name: &str, msg: ExecuteTaskInstruction) -> SiteKeeperResult<()> {
        self.send(node_name, OutboundSlaveMessage::ExecuteTask(msg))
    }

    async fn cancel_task(&self, node_name: &str, msg: CancelTaskRequest) -> SiteKeeperResult<()> {
        self.send(node_name, OutboundSlaveMessage::CancelTask(msg))
    }

    async fn request_log_flush(&self, node_name: &str, msg: LogFlushRequest) -> SiteKeeperResult<()> {
        self.send(node_name, OutboundSlaveMessage::RequestLogFlush(msg))
    }

    async fn adjust_system_time(&self, node_name: &str, msg: AdjustSystemTimeCommand) -> SiteKeeperResult<()> {
        self.send(node_name, OutboundSlaveMessage::AdjustSystemTime(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn send_to_unregistered_node_fails_disconnected() {
        let transport = InMemorySlaveTransport::new();
        let err = transport
            .cancel_task("ghost", CancelTaskRequest { node_action_id: "na-1".into(), task_id: "t-1".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, SiteKeeperError::TransportDisconnected { .. }));
    }

    #[tokio::test]
    async fn registered_node_receives_sent_message() {
        let transport = InMemorySlaveTransport::new();
        let mut rx = transport.register_node("n1");
        transport
            .prepare_for_task(
                "n1",
                PrepareForTask {
                    node_action_id: "na-1".into(),
                    task_id: "t-1".into(),
                    expected_task_type: "VerifyConfiguration".into(),
                    target_resource: None,
                    preparation_parameters_json: json!({}),
                },
            )
            .await
            .unwrap();
        let received = rx.recv().await.unwrap();
        assert!(matches!(received, OutboundSlaveMessage::PrepareForTask(_)));
    }
}
