//! Unix socket server for the UI process.
//!
//! Each line is a JSON [`Command`]; each reply is a JSON [`Response`] line.
//! A client that sends `{"cmd":"subscribe"}` additionally receives every
//! engine [`Notification`] as a line tagged by `type`.

use crate::error::Result;
use lista_engine::{execute, Command, Engine, Notification, Response};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast::error::RecvError;

/// Socket-level requests handled before the engine sees them.
#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
enum Control {
    Subscribe,
}

/// IPC socket server.
pub struct IpcServer {
    engine: Engine,
    socket_path: PathBuf,
}

impl IpcServer {
    /// Create a server for `engine`.
    pub fn new(engine: Engine, socket_path: impl Into<PathBuf>) -> Self {
        Self {
            engine,
            socket_path: socket_path.into(),
        }
    }

    /// Accept clients until the task is dropped.
    pub async fn run(&self) -> Result<()> {
        // Remove a stale socket from a previous run
        let _ = std::fs::remove_file(&self.socket_path);

        let listener = UnixListener::bind(&self.socket_path)?;
        tracing::info!("IPC socket listening on {}", self.socket_path.display());

        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let engine = self.engine.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, engine).await {
                            tracing::error!("IPC connection error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    tracing::error!("Failed to accept IPC connection: {}", e);
                }
            }
        }
    }

    /// Get the socket path.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

async fn handle_connection(stream: UnixStream, engine: Engine) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    let mut notifications = engine.subscribe();
    let mut subscribed = false;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                let response = if let Ok(Control::Subscribe) = serde_json::from_str(&line) {
                    subscribed = true;
                    notifications = notifications.resubscribe();
                    Response::Ok {
                        message: "Subscribed".to_string(),
                    }
                } else {
                    match serde_json::from_str::<Command>(&line) {
                        Ok(cmd) => execute(&engine, cmd).await,
                        Err(e) => Response::Error {
                            error: format!("Invalid command: {}", e),
                        },
                    }
                };
                let response_json = serde_json::to_string(&response)? + "\n";
                writer.write_all(response_json.as_bytes()).await?;
            }
            event = notifications.recv(), if subscribed => {
                let notification = match event {
                    Ok(n) => n,
                    Err(RecvError::Lagged(n)) => {
                        tracing::warn!("IPC client lagged by {} notifications, sending snapshot", n);
                        Notification::ListSnapshot {
                            items: engine.items().await,
                        }
                    }
                    Err(RecvError::Closed) => break,
                };
                let json = serde_json::to_string(&notification)? + "\n";
                writer.write_all(json.as_bytes()).await?;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lista_engine::EngineConfig;
    use lista_swarm::MemoryNetwork;
    use serde_json::Value;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;

    async fn started_engine(dir: &Path) -> Engine {
        let net = MemoryNetwork::new();
        let transport = Arc::new(net.transport("ipc"));
        let engine = Engine::with_rocksdb(
            EngineConfig::fast(dir.join("data")),
            transport.clone(),
            transport,
        );
        engine.start().await.unwrap();
        engine
    }

    async fn connect(path: &Path) -> UnixStream {
        for _ in 0..100 {
            if let Ok(stream) = UnixStream::connect(path).await {
                return stream;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("IPC socket never came up");
    }

    #[tokio::test]
    async fn commands_and_notifications() {
        let dir = tempdir().unwrap();
        let engine = started_engine(dir.path()).await;
        let socket = dir.path().join("lista.sock");
        let server = IpcServer::new(engine.clone(), &socket);
        let task = tokio::spawn(async move { server.run().await });

        let stream = connect(&socket).await;
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        writer.write_all(b"{\"cmd\":\"ping\"}\n").await.unwrap();
        let reply: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(reply["status"], "pong");
        assert_eq!(reply["phase"], "ready");

        writer.write_all(b"{\"cmd\":\"nonsense\"}\n").await.unwrap();
        let reply: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(reply["status"], "error");

        writer.write_all(b"{\"cmd\":\"subscribe\"}\n").await.unwrap();
        let reply: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(reply["status"], "ok");

        writer
            .write_all(b"{\"cmd\":\"add_item\",\"text\":\"Milk\"}\n")
            .await
            .unwrap();
        let mut saw_reply = false;
        let mut saw_added = false;
        while !(saw_reply && saw_added) {
            let line = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            let msg: Value = serde_json::from_str(&line).unwrap();
            if msg["status"] == "ok" {
                saw_reply = true;
            }
            if msg["type"] == "item-added" && msg["item"]["text"] == "Milk" {
                saw_added = true;
            }
        }

        task.abort();
        engine.shutdown().await.unwrap();
    }
}
