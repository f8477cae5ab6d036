//! ---
//! xbar_section: "04-configuration-orchestration"
//! xbar_subsection: "module"
//! xbar_type: "source"
//! xbar_scope: "code"
//! xbar_description: "Management plane construction."
//! xbar_version: "v0.0.0-prealpha"
//! xbar_owner: "tbd"
//! ---
use std::sync::Arc;

use tracing::info;
use xbar_router::{
    ManagementBridgeSession, Router, RouterFactory, RouterRealm, RouterServiceSession,
    RouterSessionFactory, SessionHandle, TRUSTED_AUTHROLE,
};

use crate::controller::{ControllerSession, NodeController, WorkerLauncher};
use crate::error::{NodeError, Result};
use crate::identity::NodeIdentity;
use crate::shutdown::ShutdownSignal;

/// The node's own router, realm and trusted sessions.
#[derive(Debug)]
pub struct ManagementPlane {
    router_factory: Arc<RouterFactory>,
    sessions: Arc<RouterSessionFactory>,
    router: Arc<Router>,
    service: SessionHandle,
    controller: Arc<ControllerSession>,
    bridge: Option<ManagementBridgeSession>,
}

impl ManagementPlane {
    /// Build the control realm and attach the service session, the controller and,
    /// when `managed`, the uplink bridge. Any construction error is fatal.
    pub async fn bootstrap(
        identity: &NodeIdentity,
        title: &str,
        managed: bool,
        launcher: Arc<dyn WorkerLauncher>,
        shutdown: ShutdownSignal,
    ) -> Result<Self> {
        let realm = identity.realm_name.as_str();
        let router_factory = Arc::new(RouterFactory::new());
        let sessions = Arc::new(RouterSessionFactory::new(Arc::clone(&router_factory)));
        let router = router_factory
            .start_realm(RouterRealm::new(realm))
            .map_err(NodeError::Bootstrap)?;

        let service = sessions
            .add(Arc::new(RouterServiceSession::new(realm)), TRUSTED_AUTHROLE)
            .await
            .map_err(NodeError::Bootstrap)?;

        let controller = Arc::new(ControllerSession::new(
            identity.clone(),
            title,
            Arc::clone(&sessions),
            launcher,
            shutdown,
        ));
        sessions
            .add(controller.clone(), TRUSTED_AUTHROLE)
            .await
            .map_err(NodeError::Bootstrap)?;

        let bridge = if managed {
            let bridge = ManagementBridgeSession::new(realm);
            sessions
                .add(Arc::new(bridge.clone()), TRUSTED_AUTHROLE)
                .await
                .map_err(NodeError::Bootstrap)?;
            Some(bridge)
        } else {
            None
        };

        info!(
            node = %identity.node_id,
            realm = %realm,
            sessions = router.session_count(),
            bridged = bridge.is_some(),
            "management plane ready"
        );
        Ok(Self {
            router_factory,
            sessions,
            router,
            service,
            controller,
            bridge,
        })
    }

    pub fn router_factory(&self) -> &Arc<RouterFactory> {
        &self.router_factory
    }

    pub fn sessions(&self) -> &Arc<RouterSessionFactory> {
        &self.sessions
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn service(&self) -> &SessionHandle {
        &self.service
    }

    pub fn controller(&self) -> &Arc<ControllerSession> {
        &self.controller
    }

    /// The controller as the seam the sequencer drives.
    pub fn node_controller(&self) -> Arc<dyn NodeController> {
        self.controller.clone()
    }

    pub fn bridge(&self) -> Option<&ManagementBridgeSession> {
        self.bridge.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentitySource;
    use crate::worker::EmbeddedWorkerLauncher;
    use serde_json::json;

    fn identity() -> NodeIdentity {
        NodeIdentity {
            node_id: "node1".to_owned(),
            realm_name: "crossbar".to_owned(),
            source: IdentitySource::Controller,
        }
    }

    #[tokio::test]
    async fn standalone_plane_has_no_bridge() {
        let plane = ManagementPlane::bootstrap(
            &identity(),
            "crossbar-controller",
            false,
            Arc::new(EmbeddedWorkerLauncher::new()),
            ShutdownSignal::new(),
        )
        .await
        .expect("bootstrap");
        assert!(plane.bridge().is_none());
        assert_eq!(plane.router().session_count(), 2);
        let sessions = plane
            .service()
            .call("wamp.session.list", vec![])
            .await
            .expect("session list");
        assert_eq!(sessions[1]["name"], json!("node-controller"));
        assert_eq!(sessions[1]["authrole"], json!("trusted"));
    }

    #[tokio::test]
    async fn managed_plane_attaches_bridge() {
        let plane = ManagementPlane::bootstrap(
            &identity(),
            "crossbar-controller",
            true,
            Arc::new(EmbeddedWorkerLauncher::new()),
            ShutdownSignal::new(),
        )
        .await
        .expect("bootstrap");
        assert!(plane.bridge().is_some());
        assert_eq!(plane.router().session_count(), 3);
        assert!(plane.router_factory().get("crossbar").is_some());
    }

    #[tokio::test]
    async fn node_procedures_are_reachable() {
        let shutdown = ShutdownSignal::new();
        let plane = ManagementPlane::bootstrap(
            &identity(),
            "my-node",
            false,
            Arc::new(EmbeddedWorkerLauncher::new()),
            shutdown.clone(),
        )
        .await
        .expect("bootstrap");
        let info = plane
            .service()
            .call("crossbar.node.node1.get_info", vec![])
            .await
            .expect("info");
        assert_eq!(info["title"], json!("my-node"));
        assert_eq!(info["workers"], json!(0));

        let stopped = plane
            .service()
            .call("crossbar.node.node1.shutdown", vec![])
            .await
            .expect("shutdown");
        assert_eq!(stopped, json!(true));
        assert!(!shutdown.is_running());
    }
}
