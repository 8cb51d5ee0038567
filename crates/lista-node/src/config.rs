//! Node configuration from the environment.

use crate::error::{Error, Result};
use lista_engine::EngineConfig;
use lista_log::WriterKey;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::warn;

/// Configuration for a Lista node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Base directory for storage, keys and markers
    pub data_dir: PathBuf,
    /// Replication listen address; the handshake swarm uses the next port
    pub p2p_addr: SocketAddr,
    /// Replication addresses of known peers
    pub bootstrap_peers: Vec<String>,
    /// IPC socket path
    pub socket_path: PathBuf,
    /// Group to join after startup
    pub group_key: Option<String>,
    /// Writers to authorize on first start
    pub peer_writers: Vec<WriterKey>,
}

impl NodeConfig {
    /// Load configuration from `LISTA_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let data_dir = PathBuf::from(
            lookup("LISTA_DATA_DIR").unwrap_or_else(|| "./lista-data".to_string()),
        );

        let p2p_addr = lookup("LISTA_P2P_ADDR")
            .unwrap_or_else(|| "0.0.0.0:9400".to_string())
            .parse()
            .map_err(|e| Error::Config(format!("LISTA_P2P_ADDR: {}", e)))?;

        let bootstrap_peers = lookup("LISTA_BOOTSTRAP_PEERS")
            .map(|s| split_list(&s))
            .unwrap_or_default();

        let socket_path = lookup("LISTA_SOCKET")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("lista.sock"));

        let group_key = lookup("LISTA_GROUP_KEY").filter(|k| !k.trim().is_empty());

        let peer_writers = lookup("LISTA_PEER_WRITERS")
            .map(|s| split_list(&s))
            .unwrap_or_default()
            .iter()
            .map(|k| {
                WriterKey::from_hex(k)
                    .map_err(|e| Error::Config(format!("LISTA_PEER_WRITERS entry {}: {}", k, e)))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            data_dir,
            p2p_addr,
            bootstrap_peers,
            socket_path,
            group_key,
            peer_writers,
        })
    }

    /// Listen address of the handshake swarm.
    pub fn handshake_addr(&self) -> Result<SocketAddr> {
        let port = self
            .p2p_addr
            .port()
            .checked_add(1)
            .ok_or_else(|| Error::Config("LISTA_P2P_ADDR port leaves no room for the handshake port".into()))?;
        let mut addr = self.p2p_addr;
        addr.set_port(port);
        Ok(addr)
    }

    /// Handshake addresses of the bootstrap peers.
    pub fn handshake_peers(&self) -> Vec<String> {
        self.bootstrap_peers
            .iter()
            .filter_map(|peer| match peer.rsplit_once(':') {
                Some((host, port)) => match port.parse::<u16>().ok().and_then(|p| p.checked_add(1)) {
                    Some(port) => Some(format!("{}:{}", host, port)),
                    None => {
                        warn!("Skipping bootstrap peer with bad port: {}", peer);
                        None
                    }
                },
                None => {
                    warn!("Skipping bootstrap peer without port: {}", peer);
                    None
                }
            })
            .collect()
    }

    /// Engine configuration for this node.
    pub fn engine_config(&self) -> EngineConfig {
        let mut config = EngineConfig::new(self.data_dir.clone());
        config.static_writers = self.peer_writers.clone();
        config
    }
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<NodeConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        NodeConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let config = config(&[]).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("./lista-data"));
        assert_eq!(config.p2p_addr.port(), 9400);
        assert_eq!(config.socket_path, PathBuf::from("./lista-data/lista.sock"));
        assert!(config.bootstrap_peers.is_empty());
        assert!(config.group_key.is_none());
    }

    #[test]
    fn handshake_uses_next_port() {
        let config = config(&[
            ("LISTA_P2P_ADDR", "127.0.0.1:7000"),
            ("LISTA_BOOTSTRAP_PEERS", "10.0.0.2:7000, ,10.0.0.3:7100,bad"),
        ])
        .unwrap();
        assert_eq!(config.handshake_addr().unwrap().port(), 7001);
        assert_eq!(config.bootstrap_peers.len(), 3);
        assert_eq!(
            config.handshake_peers(),
            vec!["10.0.0.2:7001".to_string(), "10.0.0.3:7101".to_string()]
        );
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            config(&[("LISTA_P2P_ADDR", "nowhere")]),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            config(&[("LISTA_PEER_WRITERS", "abcd")]),
            Err(Error::Config(_))
        ));
        let last = config(&[("LISTA_P2P_ADDR", "127.0.0.1:65535")]).unwrap();
        assert!(last.handshake_addr().is_err());
    }

    #[test]
    fn peer_writers_reach_engine_config() {
        let key = "ab".repeat(32);
        let config = config(&[("LISTA_PEER_WRITERS", key.as_str())]).unwrap();
        assert_eq!(config.engine_config().static_writers.len(), 1);
    }
}
