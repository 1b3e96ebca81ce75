use std::time::Duration;
use anyhow::bail;
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::io::{duplex, DuplexStream};
use tokio::sync::RwLock;
use tokio::time::sleep;

use crate::net::{BoxStream, Connector};

#[derive(Debug, Clone, Copy)]
pub enum Script {
    Fail,
    SucceedAfter(Duration),
}

/// A [Connector] that fails or succeeds per address as scripted. The 'server side' of every
///  successful connection is kept for inspection.
pub struct ScriptedConnector {
    scripts: FxHashMap<String, Script>,
    attempts: RwLock<Vec<String>>,
    server_sides: RwLock<FxHashMap<String, DuplexStream>>,
}

impl ScriptedConnector {
    pub fn new(scripts: Vec<(&str, Script)>) -> ScriptedConnector {
        ScriptedConnector {
            scripts: scripts.into_iter()
                .map(|(addr, script)| (addr.to_string(), script))
                .collect(),
            attempts: Default::default(),
            server_sides: Default::default(),
        }
    }

    pub async fn attempts(&self) -> Vec<String> {
        self.attempts.read().await.clone()
    }

    pub async fn server_side(&self, addr: &str) -> Option<DuplexStream> {
        self.server_sides.write().await.remove(addr)
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, addr: &str) -> anyhow::Result<BoxStream> {
        self.attempts.write().await.push(addr.to_string());

        match self.scripts.get(addr) {
            Some(Script::SucceedAfter(delay)) => {
                sleep(*delay).await;
                let (client_side, server_side) = duplex(64*1024);
                self.server_sides.write().await.insert(addr.to_string(), server_side);
                Ok(Box::new(client_side))
            }
            Some(Script::Fail) => bail!("connection to {} refused", addr),
            None => bail!("no route to {}", addr),
        }
    }
}
