//! ---
//! xbar_section: "04-configuration-orchestration"
//! xbar_subsection: "module"
//! xbar_type: "source"
//! xbar_scope: "code"
//! xbar_description: "Managed-mode uplink connection."
//! xbar_version: "v0.0.0-prealpha"
//! xbar_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tracing::{debug, info, trace};
use url::Url;
use xbar_common::{ManagerSection, NodeConfig};
use xbar_router::{Event, ManagementBridgeSession, UplinkSession};

use crate::error::{NodeError, Result};
use crate::identity::NodeIdentity;

/// Pause after the uplink is attached before the node reports itself managed.
pub const DEFAULT_MANAGED_SETTLE: Duration = Duration::from_secs(1);

/// A connected uplink whose session is not necessarily ready yet.
pub struct PendingUplink {
    pub session: Arc<dyn UplinkSession>,
    /// Fires once the uplink session has joined the management service.
    pub ready: oneshot::Receiver<()>,
}

/// Boundary to the external fleet-management service.
#[async_trait]
pub trait UplinkConnector: Send + Sync {
    async fn connect(&self, manager: &ManagerSection, node_id: &str) -> Result<PendingUplink>;
}

/// Uplink reachable over TCP; readiness is a completed connect.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpUplinkConnector;

struct TcpUplinkSession {
    peer: String,
    // Held so the connection stays open for the lifetime of the node.
    _stream: TcpStream,
    forwarded: AtomicU64,
}

impl UplinkSession for TcpUplinkSession {
    fn peer(&self) -> String {
        self.peer.clone()
    }

    fn forward(&self, event: &Event) {
        let count = self.forwarded.fetch_add(1, Ordering::Relaxed) + 1;
        trace!(peer = %self.peer, topic = %event.topic, count, "management event relayed");
    }
}

fn socket_target(manager: &ManagerSection) -> Result<(String, u16)> {
    let url = Url::parse(&manager.url)
        .map_err(|err| NodeError::ManagedConnect(format!("invalid uplink url '{}': {err}", manager.url)))?;
    let host = url
        .host_str()
        .ok_or_else(|| NodeError::ManagedConnect(format!("uplink url '{}' has no host", manager.url)))?
        .to_owned();
    let port = url.port_or_known_default().ok_or_else(|| {
        NodeError::ManagedConnect(format!("uplink url '{}' has no port", manager.url))
    })?;
    Ok((host, port))
}

#[async_trait]
impl UplinkConnector for TcpUplinkConnector {
    async fn connect(&self, manager: &ManagerSection, node_id: &str) -> Result<PendingUplink> {
        let (host, port) = socket_target(manager)?;
        debug!(node = %node_id, %host, port, realm = %manager.realm, "connecting to management uplink");
        let stream = TcpStream::connect((host.as_str(), port))
            .await
            .map_err(|err| NodeError::ManagedConnect(format!("{}: {err}", manager.url)))?;
        let (tx, ready) = oneshot::channel();
        let _ = tx.send(());
        Ok(PendingUplink {
            session: Arc::new(TcpUplinkSession {
                peer: format!("{}@{}", manager.realm, manager.url),
                _stream: stream,
                forwarded: AtomicU64::new(0),
            }),
            ready,
        })
    }
}

/// Connect, await readiness within `manager.connect_timeout`, then attach the uplink to the bridge.
///
/// There is no retry; expiry or a dropped readiness signal is a connect failure.
pub async fn run_managed(
    identity: &NodeIdentity,
    manager: &ManagerSection,
    config: &NodeConfig,
    bridge: &ManagementBridgeSession,
    connector: &dyn UplinkConnector,
    settle: Duration,
) -> Result<()> {
    let connect = async {
        let pending = connector.connect(manager, &identity.node_id).await?;
        pending.ready.await.map_err(|_| {
            NodeError::ManagedConnect("uplink dropped before becoming ready".to_owned())
        })?;
        Ok::<_, NodeError>(pending.session)
    };
    let session = tokio::time::timeout(manager.connect_timeout, connect)
        .await
        .map_err(|_| {
            NodeError::ManagedConnect(format!(
                "uplink {} not ready within {:?}",
                manager.url, manager.connect_timeout
            ))
        })??;

    bridge.attach_uplink(session);
    info!(
        node = %identity.node_id,
        manager = %manager.id,
        url = %manager.url,
        workers = config.workers.len(),
        "connected to management uplink; worker startup is driven by the manager"
    );
    tokio::time::sleep(settle).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_url_defaults_port() {
        let manager = ManagerSection::new("m");
        assert_eq!(
            socket_target(&manager).expect("target"),
            ("localhost".to_owned(), 9000)
        );
        let mut plain = ManagerSection::new("m");
        plain.url = "ws://manager.example".to_owned();
        assert_eq!(socket_target(&plain).expect("target").1, 80);
        plain.url = "not a url".to_owned();
        assert!(socket_target(&plain).is_err());
    }
}
