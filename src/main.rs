//! `sitekeeperd`: wires C1-C10 together and runs until shutdown.
//!
//! Every service the Master Action engine needs (Journal, connection
//! tracking, health monitoring, routing, the dispatcher, and finally the
//! coordinator itself) is constructed explicitly here rather than through
//! a DI container — see DESIGN.md for why.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use sitekeeper_core::connection::AgentConnectionManager;
use sitekeeper_core::context::ContextServices;
use sitekeeper_core::coordinator::MasterActionCoordinator;
use sitekeeper_core::dispatcher::NodeActionDispatcher;
use sitekeeper_core::handlers::builtin_handlers;
use sitekeeper_core::health::NodeHealthMonitor;
use sitekeeper_core::journal::Journal;
use sitekeeper_core::notifier::NoopNotifier;
use sitekeeper_core::routing::ActionIdTranslator;
use sitekeeper_core::transport::{InMemorySlaveTransport, InboundSlaveMessage};
use sitekeeper_shared::config::SiteKeeperConfig;

#[derive(Parser, Debug)]
#[command(name = "sitekeeperd", about = "SiteKeeper Master Action orchestration engine")]
struct Cli {
    /// Directory holding base.toml and environments/<env>.toml.
    #[arg(long, default_value = "config")]
    config_dir: PathBuf,

    /// Environment name layered on top of base.toml.
    #[arg(long, env = "SITEKEEPER_ENV", default_value = "development")]
    environment: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("sitekeeper=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = match SiteKeeperConfig::load(&cli.config_dir, &cli.environment) {
        Ok(config) => config,
        Err(err) => {
            error!(%err, config_dir = %cli.config_dir.display(), "failed to load configuration, falling back to defaults");
            SiteKeeperConfig::for_testing(cli.environment.clone(), PathBuf::from("./journal"))
        }
    };

    info!(environment = %config.environment_name, journal_root = %config.journal_root.display(), "starting sitekeeperd");

    let journal = Journal::new(&config.journal_root, &config.environment_name).await?;
    let translator = ActionIdTranslator::new(config.timeouts.action_id_grace());
    let connections = AgentConnectionManager::new();
    let health = NodeHealthMonitor::new(config.timeouts.heartbeat_interval());
    health.spawn_connection_listener(&connections);
    health.spawn_periodic_sweep();
    translator.spawn_periodic_sweep();

    // No production transport (gRPC/websocket) is specified; the core only
    // depends on the `SlaveTransport` trait (§4.1), and wiring a real one
    // is explicitly out of scope (§1).
    let transport = InMemorySlaveTransport::new();

    let dispatcher = NodeActionDispatcher::new(
        Arc::clone(&connections),
        Arc::clone(&health),
        Arc::clone(&translator),
        Arc::clone(&journal),
        transport,
        config.timeouts.clone(),
        config.per_task_type.clone(),
    );

    // Nothing feeds this today (no real transport is wired, per the note
    // above), but the ingestion loop is the one place every Slave->Master
    // message, `InboundSlaveMessage`, is received and routed regardless of
    // which transport eventually produces it. Kept alive as `_inbound_tx`
    // so the loop below doesn't observe channel closure and exit.
    let (_inbound_tx, mut inbound_rx) = mpsc::unbounded_channel::<InboundSlaveMessage>();
    let inbound_connections = Arc::clone(&connections);
    let inbound_dispatcher = Arc::clone(&dispatcher);
    tokio::spawn(async move {
        while let Some(message) = inbound_rx.recv().await {
            match message {
                InboundSlaveMessage::RegisterSlave { channel_handle, registration, remote_address } => {
                    info!(channel_handle, agent_name = %registration.agent_name, ?remote_address, "slave registered");
                    inbound_connections.on_agent_connected(
                        &channel_handle,
                        &registration.agent_name,
                        registration.max_concurrent_tasks,
                        remote_address,
                    );
                }
                InboundSlaveMessage::Heartbeat(heartbeat) => {
                    inbound_connections.process_heartbeat(heartbeat);
                }
                InboundSlaveMessage::TaskReadinessReport(report) => {
                    inbound_dispatcher.handle_readiness_report(report);
                }
                InboundSlaveMessage::TaskProgressUpdate(update) => {
                    inbound_dispatcher.handle_progress_update(update);
                }
                InboundSlaveMessage::LogFlushConfirmation(confirmation) => {
                    inbound_dispatcher.handle_log_flush_confirmation(&confirmation.node_action_id, &confirmation.node_name);
                }
                InboundSlaveMessage::TaskLogEntry(entry) => {
                    inbound_dispatcher.handle_task_log(entry);
                }
                InboundSlaveMessage::Disconnected { channel_handle, node_name } => {
                    inbound_connections.on_agent_disconnected(&channel_handle, node_name.as_deref());
                }
            }
        }
    });

    let services = Arc::new(ContextServices { journal, translator, connections, dispatcher });

    let coordinator = MasterActionCoordinator::new(services, builtin_handlers(), config.conflict_policy, Arc::new(NoopNotifier));

    info!("sitekeeperd ready; press Ctrl+C to shut down");
    shutdown_signal().await;
    info!("shutdown signal received");

    // No non-terminal MasterAction survives a restart (§1 Non-goals: "an
    // action interrupted by master restart is finalized as Failed on
    // recovery"); the coordinator has nothing to flush on exit today.
    drop(coordinator);

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received SIGTERM"),
    }
}
