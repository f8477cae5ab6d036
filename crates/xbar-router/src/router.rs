//! ---
//! xbar_section: "02-messaging-ipc-data-model"
//! xbar_subsection: "module"
//! xbar_type: "source"
//! xbar_scope: "code"
//! xbar_description: "Router factory, realms, dealer and broker."
//! xbar_version: "v0.0.0-prealpha"
//! xbar_owner: "tbd"
//! ---
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, info, trace};
use xbar_common::Payload;

use crate::types::{
    CallDetails, Event, EventHandler, MatchPolicy, ProcedureHandler, SessionId, SessionInfo,
    SubscriptionId,
};
use crate::{RouterError, Result};

/// A realm to be started on a [`RouterFactory`].
#[derive(Debug, Clone)]
pub struct RouterRealm {
    pub name: String,
    pub config: Payload,
}

impl RouterRealm {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: Payload::new(),
        }
    }
}

struct Registration {
    owner: Option<SessionId>,
    handler: ProcedureHandler,
}

struct SubscriptionEntry {
    id: SubscriptionId,
    topic: String,
    policy: MatchPolicy,
    handler: EventHandler,
}

/// Dealer and broker for one realm.
pub struct Router {
    realm: RouterRealm,
    procedures: RwLock<HashMap<String, Registration>>,
    subscriptions: RwLock<Vec<SubscriptionEntry>>,
    sessions: Mutex<BTreeMap<SessionId, SessionInfo>>,
    next_subscription: AtomicU64,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("realm", &self.realm.name)
            .field("procedures", &self.procedures.read().len())
            .field("subscriptions", &self.subscriptions.read().len())
            .finish()
    }
}

impl Router {
    fn new(realm: RouterRealm) -> Self {
        Self {
            realm,
            procedures: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(Vec::new()),
            sessions: Mutex::new(BTreeMap::new()),
            next_subscription: AtomicU64::new(1),
        }
    }

    pub fn realm(&self) -> &str {
        &self.realm.name
    }

    /// Register `handler` under `uri`. One registration per uri.
    pub fn register(
        &self,
        uri: impl Into<String>,
        owner: Option<SessionId>,
        handler: ProcedureHandler,
    ) -> Result<()> {
        let uri = uri.into();
        let mut procedures = self.procedures.write();
        if procedures.contains_key(&uri) {
            return Err(RouterError::AlreadyRegistered(uri));
        }
        trace!(realm = %self.realm.name, procedure = %uri, "procedure registered");
        procedures.insert(uri, Registration { owner, handler });
        Ok(())
    }

    /// Register an async closure under `uri`.
    pub fn register_fn<F, Fut>(
        &self,
        uri: impl Into<String>,
        owner: Option<SessionId>,
        handler: F,
    ) -> Result<()>
    where
        F: Fn(Vec<Value>, CallDetails) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.register(
            uri,
            owner,
            Arc::new(move |args, details| handler(args, details).boxed()),
        )
    }

    pub fn unregister(&self, uri: &str) -> Result<()> {
        self.procedures
            .write()
            .remove(uri)
            .map(|_| ())
            .ok_or_else(|| RouterError::NoSuchProcedure(uri.to_owned()))
    }

    pub fn is_registered(&self, uri: &str) -> bool {
        self.procedures.read().contains_key(uri)
    }

    /// Session owning the registration of `uri`, if any.
    pub fn callee(&self, uri: &str) -> Option<SessionId> {
        self.procedures.read().get(uri).and_then(|reg| reg.owner)
    }

    /// Invoke the procedure registered under `uri` and wait for its result.
    pub async fn call(&self, uri: &str, args: Vec<Value>, details: CallDetails) -> Result<Value> {
        let handler = self
            .procedures
            .read()
            .get(uri)
            .map(|reg| Arc::clone(&reg.handler))
            .ok_or_else(|| RouterError::NoSuchProcedure(uri.to_owned()))?;
        trace!(realm = %self.realm.name, procedure = %uri, "dispatching call");
        handler(args, details).await
    }

    pub fn subscribe(
        &self,
        topic: impl Into<String>,
        policy: MatchPolicy,
        handler: EventHandler,
    ) -> SubscriptionId {
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        let topic = topic.into();
        debug!(realm = %self.realm.name, %topic, subscription = id, ?policy, "subscribed");
        self.subscriptions.write().push(SubscriptionEntry {
            id,
            topic,
            policy,
            handler,
        });
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        let mut subscriptions = self.subscriptions.write();
        let before = subscriptions.len();
        subscriptions.retain(|entry| entry.id != id);
        if subscriptions.len() == before {
            return Err(RouterError::NoSuchSubscription(id));
        }
        debug!(realm = %self.realm.name, subscription = id, "unsubscribed");
        Ok(())
    }

    pub fn is_subscribed(&self, id: SubscriptionId) -> bool {
        self.subscriptions.read().iter().any(|entry| entry.id == id)
    }

    /// Deliver an event to every matching subscription and return the receiver count.
    pub fn publish(
        &self,
        topic: impl Into<String>,
        payload: Value,
        publisher: Option<SessionId>,
    ) -> usize {
        let event = Event::new(topic, payload, publisher);
        let receivers: Vec<EventHandler> = self
            .subscriptions
            .read()
            .iter()
            .filter(|entry| entry.policy.matches(&entry.topic, &event.topic))
            .map(|entry| Arc::clone(&entry.handler))
            .collect();
        trace!(realm = %self.realm.name, topic = %event.topic, receivers = receivers.len(), "publishing event");
        for handler in &receivers {
            handler(&event);
        }
        receivers.len()
    }

    pub(crate) fn attach(&self, session: SessionId, authrole: &str, name: &str) {
        self.sessions.lock().insert(
            session,
            SessionInfo {
                session,
                authrole: authrole.to_owned(),
                name: name.to_owned(),
                joined: Utc::now(),
            },
        );
    }

    /// Remove a session together with its registrations.
    pub fn detach(&self, session: SessionId) {
        self.sessions.lock().remove(&session);
        self.procedures
            .write()
            .retain(|_, reg| reg.owner != Some(session));
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.sessions.lock().values().cloned().collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }
}

/// Owns the routers of every realm started on this node.
#[derive(Debug, Default)]
pub struct RouterFactory {
    routers: RwLock<HashMap<String, Arc<Router>>>,
}

impl RouterFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_realm(&self, realm: RouterRealm) -> Result<Arc<Router>> {
        let mut routers = self.routers.write();
        if routers.contains_key(&realm.name) {
            return Err(RouterError::RealmAlreadyStarted(realm.name));
        }
        let name = realm.name.clone();
        let router = Arc::new(Router::new(realm));
        routers.insert(name.clone(), Arc::clone(&router));
        info!(realm = %name, "realm started");
        Ok(router)
    }

    pub fn get(&self, realm: &str) -> Option<Arc<Router>> {
        self.routers.read().get(realm).cloned()
    }

    pub fn realms(&self) -> Vec<String> {
        let mut names: Vec<_> = self.routers.read().keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn dealer_routes_calls_to_registered_handler() {
        let factory = RouterFactory::new();
        let router = factory.start_realm(RouterRealm::new("crossbar")).expect("realm");
        router
            .register_fn("com.example.add", None, |args, _details| async move {
                let sum: i64 = args.iter().filter_map(Value::as_i64).sum();
                Ok(json!(sum))
            })
            .expect("registered");

        let result = router
            .call("com.example.add", vec![json!(2), json!(3)], CallDetails::default())
            .await
            .expect("call succeeds");
        assert_eq!(result, json!(5));

        let missing = router
            .call("com.example.sub", vec![], CallDetails::default())
            .await
            .expect_err("unregistered");
        assert_eq!(missing, RouterError::NoSuchProcedure("com.example.sub".into()));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let factory = RouterFactory::new();
        let router = factory.start_realm(RouterRealm::new("crossbar")).expect("realm");
        router
            .register_fn("p", None, |_, _| async { Ok(Value::Null) })
            .expect("first registration");
        let err = router
            .register_fn("p", None, |_, _| async { Ok(Value::Null) })
            .expect_err("second registration");
        assert_eq!(err, RouterError::AlreadyRegistered("p".into()));
    }

    #[test]
    fn realm_cannot_start_twice() {
        let factory = RouterFactory::new();
        factory.start_realm(RouterRealm::new("crossbar")).expect("realm");
        let err = factory
            .start_realm(RouterRealm::new("crossbar"))
            .expect_err("duplicate realm");
        assert_eq!(err, RouterError::RealmAlreadyStarted("crossbar".into()));
        assert!(factory.get("crossbar").is_some());
    }

    #[test]
    fn broker_stops_delivering_after_unsubscribe() {
        let factory = RouterFactory::new();
        let router = factory.start_realm(RouterRealm::new("crossbar")).expect("realm");
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let sub = router.subscribe(
            "a.b",
            MatchPolicy::Exact,
            Arc::new(move |_event: &Event| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(router.publish("a.b", json!({"id": "c1"}), None), 1);
        assert_eq!(router.publish("a.b.c", json!({}), None), 0);
        router.unsubscribe(sub).expect("unsubscribe");
        assert_eq!(router.publish("a.b", json!({}), None), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(
            router.unsubscribe(sub),
            Err(RouterError::NoSuchSubscription(sub))
        );
    }

    #[test]
    fn detach_drops_session_registrations() {
        let factory = RouterFactory::new();
        let router = factory.start_realm(RouterRealm::new("crossbar")).expect("realm");
        router.attach(7, "trusted", "worker");
        router
            .register_fn("w.p", Some(7), |_, _| async { Ok(Value::Null) })
            .expect("registered");
        assert_eq!(router.callee("w.p"), Some(7));
        router.detach(7);
        assert!(!router.is_registered("w.p"));
        assert_eq!(router.session_count(), 0);
    }
}
