//! The Lista node: engine, TCP swarms and the IPC socket.

use crate::config::NodeConfig;
use crate::error::Result;
use crate::ipc::IpcServer;
use lista_engine::Engine;
use lista_swarm::TcpTransport;
use std::sync::Arc;
use tracing::{info, warn};

/// A running Lista node.
pub struct ListaNode {
    config: NodeConfig,
    engine: Engine,
}

impl ListaNode {
    /// Create a node. Nothing is opened until [`ListaNode::run`].
    pub fn new(config: NodeConfig) -> Result<Self> {
        let replication = Arc::new(TcpTransport::new(
            config.p2p_addr,
            config.bootstrap_peers.clone(),
        ));
        let handshake = Arc::new(TcpTransport::new(
            config.handshake_addr()?,
            config.handshake_peers(),
        ));
        let engine = Engine::with_rocksdb(config.engine_config(), replication, handshake);
        Ok(Self { config, engine })
    }

    /// The node's engine.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Start the engine and serve IPC until interrupted.
    pub async fn run(self) -> Result<()> {
        self.engine.start().await?;

        if let Some(key) = &self.config.group_key {
            if let Err(e) = self.engine.join_group(key).await {
                warn!("Could not join configured group: {}", e);
            }
        }

        if let Some(group) = self.engine.group_key().await {
            info!("Group key: {}", group.to_hex());
        }
        if let Some(identity) = self.engine.local_identity_key().await {
            info!("Local writer key: {}", identity);
        }

        let ipc = IpcServer::new(self.engine.clone(), self.config.socket_path.clone());
        let result = tokio::select! {
            result = ipc.run() => result,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                Ok(())
            }
        };

        self.engine.shutdown().await?;
        let _ = std::fs::remove_file(ipc.socket_path());
        result
    }
}
