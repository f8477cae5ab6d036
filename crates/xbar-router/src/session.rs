//! ---
//! xbar_section: "02-messaging-ipc-data-model"
//! xbar_subsection: "module"
//! xbar_type: "source"
//! xbar_scope: "code"
//! xbar_description: "Router sessions and the session factory."
//! xbar_version: "v0.0.0-prealpha"
//! xbar_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::router::{Router, RouterFactory};
use crate::types::{CallDetails, EventHandler, MatchPolicy, SessionId, SubscriptionId};
use crate::{RouterError, Result};

/// Authorization role granting access to every management procedure and topic.
pub const TRUSTED_AUTHROLE: &str = "trusted";

/// A session living inside the node process.
#[async_trait]
pub trait RouterSession: Send + Sync {
    /// Name used in logs and in `wamp.session.list`.
    fn name(&self) -> &str;

    /// Realm the session joins.
    fn realm(&self) -> &str;

    /// Called once the session is attached; register procedures and subscriptions here.
    async fn on_join(&self, handle: SessionHandle) -> Result<()>;
}

/// A session's view of the router it joined.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    authrole: String,
    router: Arc<Router>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn authrole(&self) -> &str {
        &self.authrole
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    fn details(&self) -> CallDetails {
        CallDetails {
            caller: Some(self.id),
            authrole: Some(self.authrole.clone()),
        }
    }

    pub async fn call(&self, uri: &str, args: Vec<Value>) -> Result<Value> {
        self.router.call(uri, args, self.details()).await
    }

    pub fn publish(&self, topic: impl Into<String>, payload: Value) -> usize {
        self.router.publish(topic, payload, Some(self.id))
    }

    pub fn subscribe(
        &self,
        topic: impl Into<String>,
        policy: MatchPolicy,
        handler: EventHandler,
    ) -> SubscriptionId {
        self.router.subscribe(topic, policy, handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        self.router.unsubscribe(id)
    }

    pub fn leave(&self) {
        debug!(realm = %self.router.realm(), session = self.id, "session left");
        self.router.detach(self.id);
    }
}

/// Attaches in-process sessions to the realms of a [`RouterFactory`].
#[derive(Debug)]
pub struct RouterSessionFactory {
    factory: Arc<RouterFactory>,
    next_session: AtomicU64,
}

impl RouterSessionFactory {
    pub fn new(factory: Arc<RouterFactory>) -> Self {
        Self {
            factory,
            next_session: AtomicU64::new(1),
        }
    }

    pub fn router_factory(&self) -> &Arc<RouterFactory> {
        &self.factory
    }

    /// Attach `session` with `authrole` and run its `on_join`.
    pub async fn add(
        &self,
        session: Arc<dyn RouterSession>,
        authrole: &str,
    ) -> Result<SessionHandle> {
        let router = self
            .factory
            .get(session.realm())
            .ok_or_else(|| RouterError::NoSuchRealm(session.realm().to_owned()))?;
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        router.attach(id, authrole, session.name());
        let handle = SessionHandle {
            id,
            authrole: authrole.to_owned(),
            router,
        };
        debug!(realm = %session.realm(), session = id, name = %session.name(), %authrole, "session attached");
        if let Err(err) = session.on_join(handle.clone()).await {
            handle.leave();
            return Err(err);
        }
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::RouterRealm;
    use serde_json::json;

    struct EchoSession;

    #[async_trait]
    impl RouterSession for EchoSession {
        fn name(&self) -> &str {
            "echo"
        }

        fn realm(&self) -> &str {
            "crossbar"
        }

        async fn on_join(&self, handle: SessionHandle) -> Result<()> {
            handle
                .router()
                .register_fn("echo", Some(handle.id()), |args, details| async move {
                    Ok(json!({"args": args, "caller": details.caller}))
                })
        }
    }

    #[tokio::test]
    async fn add_attaches_and_joins() {
        let factory = Arc::new(RouterFactory::new());
        factory.start_realm(RouterRealm::new("crossbar")).expect("realm");
        let sessions = RouterSessionFactory::new(Arc::clone(&factory));

        let echo = sessions
            .add(Arc::new(EchoSession), TRUSTED_AUTHROLE)
            .await
            .expect("echo joins");
        let caller = sessions
            .add(Arc::new(EchoSession), TRUSTED_AUTHROLE)
            .await
            .expect_err("second echo cannot re-register");
        assert_eq!(caller, RouterError::AlreadyRegistered("echo".into()));

        let router = factory.get("crossbar").expect("router");
        assert_eq!(router.session_count(), 1);
        assert_eq!(router.callee("echo"), Some(echo.id()));

        let reply = echo.call("echo", vec![json!(1)]).await.expect("echo replies");
        assert_eq!(reply, json!({"args": [1], "caller": echo.id()}));
    }

    #[tokio::test]
    async fn add_requires_started_realm() {
        let sessions = RouterSessionFactory::new(Arc::new(RouterFactory::new()));
        let err = sessions
            .add(Arc::new(EchoSession), TRUSTED_AUTHROLE)
            .await
            .expect_err("realm missing");
        assert_eq!(err, RouterError::NoSuchRealm("crossbar".into()));
    }
}
