//! ---
//! xbar_section: "02-messaging-ipc-data-model"
//! xbar_subsection: "module"
//! xbar_type: "source"
//! xbar_scope: "code"
//! xbar_description: "Bridge session forwarding management events to the uplink."
//! xbar_version: "v0.0.0-prealpha"
//! xbar_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use tracing::{debug, info, warn};
use xbar_common::NODE_URI_PREFIX;

use crate::session::{RouterSession, SessionHandle};
use crate::types::{Event, MatchPolicy};
use crate::Result;

/// Every node management topic starts with this prefix.
pub const BRIDGED_TOPIC_PREFIX: &str = NODE_URI_PREFIX;

/// The session held open towards the external management service.
pub trait UplinkSession: Send + Sync {
    /// Human-readable peer description for logs.
    fn peer(&self) -> String;

    /// Forward one management event. Must not block.
    fn forward(&self, event: &Event);
}

#[derive(Default)]
struct BridgeState {
    uplink: OnceCell<Arc<dyn UplinkSession>>,
    forwarded: AtomicU64,
    dropped: AtomicU64,
}

impl BridgeState {
    fn relay(&self, event: &Event) {
        match self.uplink.get() {
            Some(uplink) => {
                uplink.forward(event);
                self.forwarded.fetch_add(1, Ordering::Relaxed);
            }
            None => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(topic = %event.topic, dropped, "no uplink attached; management event dropped");
            }
        }
    }
}

/// Trusted session relaying management-realm events to the uplink.
///
/// Events published before an uplink is attached are dropped and counted.
#[derive(Clone)]
pub struct ManagementBridgeSession {
    realm: String,
    state: Arc<BridgeState>,
}

impl std::fmt::Debug for ManagementBridgeSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagementBridgeSession")
            .field("realm", &self.realm)
            .field("attached", &self.is_attached())
            .field("forwarded", &self.forwarded())
            .field("dropped", &self.dropped())
            .finish()
    }
}

impl ManagementBridgeSession {
    pub fn new(realm: impl Into<String>) -> Self {
        Self {
            realm: realm.into(),
            state: Arc::new(BridgeState::default()),
        }
    }

    /// Attach the uplink. Only the first attachment takes effect.
    pub fn attach_uplink(&self, uplink: Arc<dyn UplinkSession>) -> bool {
        let peer = uplink.peer();
        if self.state.uplink.set(uplink).is_err() {
            warn!(%peer, "management bridge already has an uplink; ignoring");
            return false;
        }
        info!(%peer, realm = %self.realm, "management uplink attached");
        true
    }

    pub fn is_attached(&self) -> bool {
        self.state.uplink.get().is_some()
    }

    pub fn forwarded(&self) -> u64 {
        self.state.forwarded.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.state.dropped.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl RouterSession for ManagementBridgeSession {
    fn name(&self) -> &str {
        "management-bridge"
    }

    fn realm(&self) -> &str {
        &self.realm
    }

    async fn on_join(&self, handle: SessionHandle) -> Result<()> {
        let state = Arc::clone(&self.state);
        handle.subscribe(
            BRIDGED_TOPIC_PREFIX,
            MatchPolicy::Prefix,
            Arc::new(move |event: &Event| state.relay(event)),
        );
        Ok(())
    }
}
