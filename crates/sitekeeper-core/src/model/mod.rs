//! Data model (spec §3): `MasterAction`, `StageRecord`, `NodeAction`,
//! `NodeTask`, `ConnectedAgentInfo`, `CachedNodeState`.

mod agent;
mod master_action;
mod node_action;
mod node_task;
mod stage;

pub use agent::{AgentConnectivityStatus, CachedNodeState, ConnectedAgentInfo};
pub use master_action::{MasterAction, OverallStatus};
pub use node_action::{NodeAction, NodeActionOverallStatus, NodeActionResult};
pub use node_task::{NodeTaskState, NodeTaskStatus};
pub use stage::StageRecord;
