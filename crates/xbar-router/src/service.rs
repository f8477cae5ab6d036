//! ---
//! xbar_section: "02-messaging-ipc-data-model"
//! xbar_subsection: "module"
//! xbar_type: "source"
//! xbar_scope: "code"
//! xbar_description: "Realm service session exposing session meta procedures."
//! xbar_version: "v0.0.0-prealpha"
//! xbar_owner: "tbd"
//! ---
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::session::{RouterSession, SessionHandle};
use crate::{Result, RouterError};

pub const SESSION_COUNT: &str = "wamp.session.count";
pub const SESSION_LIST: &str = "wamp.session.list";

/// Trusted per-realm session answering the session meta procedures.
#[derive(Debug, Clone)]
pub struct RouterServiceSession {
    realm: String,
}

impl RouterServiceSession {
    pub fn new(realm: impl Into<String>) -> Self {
        Self {
            realm: realm.into(),
        }
    }
}

#[async_trait]
impl RouterSession for RouterServiceSession {
    fn name(&self) -> &str {
        "service"
    }

    fn realm(&self) -> &str {
        &self.realm
    }

    async fn on_join(&self, handle: SessionHandle) -> Result<()> {
        let router = Arc::clone(handle.router());
        let weak = Arc::downgrade(&router);
        router.register_fn(SESSION_COUNT, Some(handle.id()), move |_args, _details| {
            let count = weak.upgrade().map(|router| router.session_count()).unwrap_or(0);
            async move { Ok(json!(count)) }
        })?;

        let weak = Arc::downgrade(&router);
        router.register_fn(SESSION_LIST, Some(handle.id()), move |_args, _details| {
            let sessions = weak
                .upgrade()
                .map(|router| router.sessions())
                .unwrap_or_default();
            async move {
                serde_json::to_value(sessions).map_err(|err| {
                    RouterError::application("wamp.error.invalid_payload", err.to_string())
                })
            }
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::{RouterFactory, RouterRealm};
    use crate::session::{RouterSessionFactory, TRUSTED_AUTHROLE};

    #[tokio::test]
    async fn meta_procedures_report_attached_sessions() {
        let factory = Arc::new(RouterFactory::new());
        let router = factory.start_realm(RouterRealm::new("crossbar")).expect("realm");
        let sessions = RouterSessionFactory::new(Arc::clone(&factory));
        let service = sessions
            .add(Arc::new(RouterServiceSession::new("crossbar")), TRUSTED_AUTHROLE)
            .await
            .expect("service joins");

        let count = service.call(SESSION_COUNT, vec![]).await.expect("count");
        assert_eq!(count, json!(1));

        let list = router
            .call(SESSION_LIST, vec![], Default::default())
            .await
            .expect("list");
        assert_eq!(list[0]["name"], json!("service"));
        assert_eq!(list[0]["authrole"], json!(TRUSTED_AUTHROLE));
    }
}
