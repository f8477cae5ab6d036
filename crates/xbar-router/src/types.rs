//! ---
//! xbar_section: "02-messaging-ipc-data-model"
//! xbar_subsection: "module"
//! xbar_type: "source"
//! xbar_scope: "code"
//! xbar_description: "Envelope and handler types for the management-plane router."
//! xbar_version: "v0.0.0-prealpha"
//! xbar_owner: "tbd"
//! ---
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub type SessionId = u64;
pub type SubscriptionId = u64;

/// Event envelope delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for deduplication and tracing.
    pub id: Uuid,
    /// Timestamp when the event was published.
    pub timestamp: DateTime<Utc>,
    pub topic: String,
    pub payload: Value,
    pub publisher: Option<SessionId>,
}

impl Event {
    pub fn new(topic: impl Into<String>, payload: Value, publisher: Option<SessionId>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            topic: topic.into(),
            payload,
            publisher,
        }
    }
}

/// Caller information handed to a procedure handler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallDetails {
    pub caller: Option<SessionId>,
    pub authrole: Option<String>,
}

/// Attached session as reported by the session meta procedures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session: SessionId,
    pub authrole: String,
    pub name: String,
    pub joined: DateTime<Utc>,
}

/// How a subscription topic is compared against published topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPolicy {
    Exact,
    Prefix,
}

impl MatchPolicy {
    pub fn matches(self, subscribed: &str, published: &str) -> bool {
        match self {
            MatchPolicy::Exact => subscribed == published,
            MatchPolicy::Prefix => published.starts_with(subscribed),
        }
    }
}

/// Async procedure implementation: positional arguments in, JSON result out.
pub type ProcedureHandler =
    Arc<dyn Fn(Vec<Value>, CallDetails) -> BoxFuture<'static, crate::Result<Value>> + Send + Sync>;

/// Synchronous event callback. Runs on the publisher's task.
pub type EventHandler = Arc<dyn Fn(&Event) + Send + Sync>;
