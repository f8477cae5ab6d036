//! ---
//! xbar_section: "04-configuration-orchestration"
//! xbar_subsection: "module"
//! xbar_type: "source"
//! xbar_scope: "code"
//! xbar_description: "Early component exit detection for container workers."
//! xbar_version: "v0.0.0-prealpha"
//! xbar_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use xbar_common::{ProcedureUri, WorkerEndpoint, WorkerTopic};
use xbar_metrics::NodeMetrics;
use xbar_router::{Event, SubscriptionId};

use crate::controller::NodeController;
use crate::error::{NodeError, Result};
use crate::shutdown::ShutdownSignal;

/// Grace period after the last component start during which a stop is fatal.
pub const DEFAULT_COMPONENT_GRACE: Duration = Duration::from_secs(2);

/// Armed subscription on a container's component-stop topic.
pub struct ComponentWatchdog {
    worker: String,
    topic: ProcedureUri,
    subscription: SubscriptionId,
    armed: Arc<AtomicBool>,
    controller: Arc<dyn NodeController>,
}

impl std::fmt::Debug for ComponentWatchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentWatchdog")
            .field("worker", &self.worker)
            .field("topic", &self.topic)
            .field("subscription", &self.subscription)
            .field("armed", &self.armed.load(Ordering::SeqCst))
            .finish()
    }
}

impl ComponentWatchdog {
    /// Subscribe before any component of the container is started.
    pub async fn arm(
        controller: Arc<dyn NodeController>,
        endpoint: &WorkerEndpoint,
        shutdown: ShutdownSignal,
        metrics: NodeMetrics,
    ) -> Result<Self> {
        let topic = endpoint.topic(WorkerTopic::ContainerComponentStop)?;
        let armed = Arc::new(AtomicBool::new(true));
        let worker = endpoint.worker_id().to_owned();

        let handler = {
            let armed = Arc::clone(&armed);
            let worker = worker.clone();
            Arc::new(move |event: &Event| {
                if !armed.load(Ordering::SeqCst) {
                    return;
                }
                let component = event
                    .payload
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or("<unknown>")
                    .to_owned();
                let failure = NodeError::EarlyComponentExit {
                    worker: worker.clone(),
                    component: component.clone(),
                };
                error!(worker = %worker, component = %component, "{failure}");
                metrics.record_component_early_exit();
                if shutdown.is_running() {
                    shutdown.fail(failure.to_string());
                }
            })
        };

        let subscription = controller
            .subscribe(&topic, handler)
            .await
            .map_err(|source| NodeError::Rpc {
                procedure: topic.to_string(),
                source,
            })?;
        debug!(worker = %worker, topic = %topic, subscription, "component watchdog armed");
        Ok(Self {
            worker,
            topic,
            subscription,
            armed,
            controller,
        })
    }

    pub fn topic(&self) -> &ProcedureUri {
        &self.topic
    }

    pub fn subscription(&self) -> SubscriptionId {
        self.subscription
    }

    /// Stop watching once `grace` has elapsed. Runs alongside the rest of startup.
    pub fn release_after(self, grace: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            self.disarm().await;
        })
    }

    /// Stop watching now and drop the subscription.
    pub async fn disarm(self) {
        self.armed.store(false, Ordering::SeqCst);
        match self.controller.unsubscribe(self.subscription).await {
            Ok(()) => debug!(worker = %self.worker, topic = %self.topic, "component watchdog released"),
            Err(err) => warn!(worker = %self.worker, topic = %self.topic, error = %err, "failed to release component watchdog"),
        }
    }
}
