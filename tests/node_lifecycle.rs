//! ---
//! xbar_section: "15-testing-qa-runbook"
//! xbar_subsection: "integration-tests"
//! xbar_type: "source"
//! xbar_scope: "code"
//! xbar_description: "End-to-end standalone startup against the embedded worker host."
//! xbar_version: "v0.0.0-prealpha"
//! xbar_owner: "tbd"
//! ---
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;
use xbar_metrics::NodeMetrics;
use xbar_orchestrator::{
    EmbeddedWorkerLauncher, Node, NodeOptions, NodeState, WorkerLaunch, WorkerLauncher,
};
use xbar_router::{RouterError, RouterSessionFactory};

const API_DOC: &str = r#"# Calculator API

```javascript
{
    "$schema": "http://wamp.ws/schema#",
    "uri": "com.example.add",
    "type": "procedure",
    "args": [{"type": "number"}, {"type": "number"}]
}
```

```javascript
{"uri": "com.example.unrelated"}
```
"#;

const STANDALONE: &str = r#"{
    "controller": {"id": "node1"},
    "workers": [
        {
            "type": "router",
            "options": {"pythonpath": ["app"]},
            "realms": [{
                "name": "realm1",
                "schemas": ["schemas/api.md"],
                "roles": [{"name": "anonymous"}, {"name": "backend"}]
            }],
            "components": [{"type": "class", "classname": "app.Backend", "realm": "realm1"}],
            "transports": [{"type": "websocket", "endpoint": {"type": "tcp", "port": 8080}}]
        },
        {"id": "box", "type": "container", "components": [{"id": "c1", "type": "class"}]},
        {"type": "guest", "executable": "/usr/bin/env"}
    ]
}"#;

fn node_dir(config: &str) -> TempDir {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::create_dir_all(dir.path().join("schemas")).expect("schema dir");
    fs::write(dir.path().join("schemas/api.md"), API_DOC).expect("write schema doc");
    fs::write(dir.path().join("config.json"), config).expect("write config");
    dir
}

fn node_in(dir: &Path, grace: Duration, launcher: &EmbeddedWorkerLauncher) -> Node {
    let options = NodeOptions {
        cbdir: dir.to_path_buf(),
        component_grace: grace,
        ..NodeOptions::default()
    };
    Node::new(options, NodeMetrics::detached().expect("metrics"))
        .with_launcher(Arc::new(launcher.clone()))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn standalone_node_starts_every_worker_in_order() {
    let dir = node_dir(STANDALONE);
    let launcher = EmbeddedWorkerLauncher::new();
    let node = node_in(dir.path(), Duration::from_secs(2), &launcher);

    assert_eq!(node.start().await, NodeState::Running);
    assert_eq!(node.metrics().state_value("running"), 1);

    let inventory = launcher.inventory();
    assert_eq!(inventory.worker_ids(), vec!["worker1", "box", "worker2"]);
    let calls: Vec<String> = inventory.calls().iter().map(ToString::to_string).collect();
    let prefix = "crossbar.node.node1.worker";
    assert_eq!(
        calls,
        vec![
            format!("{prefix}.worker1.add_pythonpath"),
            format!("{prefix}.worker1.start_router_realm"),
            format!("{prefix}.worker1.start_router_realm_role"),
            format!("{prefix}.worker1.start_router_realm_role"),
            format!("{prefix}.worker1.start_router_component"),
            format!("{prefix}.worker1.start_router_transport"),
            format!("{prefix}.box.start_container_component"),
        ]
    );

    let router = inventory.worker("worker1").expect("router hosted");
    assert_eq!(router.pythonpath, vec!["app"]);
    let realm = router.realms.get("realm1").expect("realm hosted");
    assert_eq!(realm.schemas["com.example.add"]["type"], json!("procedure"));
    assert!(realm.schemas.get("com.example.unrelated").is_none());
    assert_eq!(
        realm.roles.keys().cloned().collect::<Vec<_>>(),
        vec!["role1", "role2"]
    );
    assert!(router.components.contains_key("component1"));
    assert!(router.transports.contains_key("transport1"));

    let guest = inventory.worker("worker2").expect("guest hosted");
    assert_eq!(guest.config["executable"], json!("/usr/bin/env"));

    let plane = node.management_plane().expect("management plane");
    let workers = plane
        .service()
        .call("crossbar.node.node1.get_workers", vec![])
        .await
        .expect("get_workers");
    let ids: Vec<_> = workers
        .as_array()
        .expect("worker list")
        .iter()
        .map(|w| w["id"].clone())
        .collect();
    assert_eq!(ids, vec![json!("worker1"), json!("box"), json!("worker2")]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn management_shutdown_stops_a_running_node() {
    let dir = node_dir(STANDALONE);
    let launcher = EmbeddedWorkerLauncher::new();
    let node = node_in(dir.path(), Duration::from_secs(2), &launcher);
    assert_eq!(node.start().await, NodeState::Running);

    let plane = node.management_plane().expect("management plane");
    let stopped = plane
        .service()
        .call("crossbar.node.node1.shutdown", vec![])
        .await
        .expect("shutdown call");
    assert_eq!(stopped, json!(true));
    assert_eq!(node.wait().await, NodeState::Running);
    assert!(node.shutdown_signal().failure().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn component_exit_within_grace_fails_the_node() {
    let dir = node_dir(STANDALONE);
    let launcher = EmbeddedWorkerLauncher::new();
    let node = node_in(dir.path(), Duration::from_secs(30), &launcher);
    assert_eq!(node.start().await, NodeState::Running);

    let receivers = launcher.stop_component("box", "c1").expect("component stop");
    assert_eq!(receivers, 1);

    assert_eq!(node.wait().await, NodeState::Failed);
    let failure = node.shutdown_signal().failure().expect("failure recorded");
    assert!(failure.contains("c1"), "unexpected failure: {failure}");
    assert_eq!(node.shutdown_signal().stop_requests(), 1);
    assert_eq!(node.metrics().component_early_exits(), 1);
    assert_eq!(node.metrics().state_value("failed"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn component_exit_after_grace_is_not_fatal() {
    let dir = node_dir(STANDALONE);
    let launcher = EmbeddedWorkerLauncher::new();
    let node = node_in(dir.path(), Duration::from_millis(50), &launcher);
    assert_eq!(node.start().await, NodeState::Running);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let receivers = launcher.stop_component("box", "c1").expect("component stop");
    assert_eq!(receivers, 0);
    assert!(node.shutdown_signal().is_running());
    assert_eq!(node.metrics().component_early_exits(), 0);

    node.shutdown_signal().request_stop();
    assert_eq!(node.wait().await, NodeState::Running);
}

#[tokio::test]
async fn missing_configuration_fails_startup() {
    let dir = tempfile::tempdir().expect("tempdir");
    let launcher = EmbeddedWorkerLauncher::new();
    let node = node_in(dir.path(), Duration::from_secs(2), &launcher);

    assert_eq!(node.start().await, NodeState::Failed);
    assert!(!node.shutdown_signal().is_running());
    assert!(node.management_plane().is_none());
    assert_eq!(node.wait().await, NodeState::Failed);
}

#[tokio::test]
async fn unknown_worker_type_keeps_earlier_workers() {
    let dir = node_dir(
        r#"{
            "controller": {"id": "node1"},
            "workers": [
                {"type": "guest", "executable": "/bin/true"},
                {"type": "bogus"},
                {"type": "guest", "executable": "/bin/false"}
            ]
        }"#,
    );
    let launcher = EmbeddedWorkerLauncher::new();
    let node = node_in(dir.path(), Duration::from_secs(2), &launcher);

    assert_eq!(node.start().await, NodeState::Failed);
    assert_eq!(launcher.inventory().worker_ids(), vec!["worker1"]);
    let failure = node.shutdown_signal().failure().expect("failure recorded");
    assert!(failure.contains("bogus"), "unexpected failure: {failure}");
}

#[tokio::test]
async fn router_without_transports_fails_startup() {
    let dir = node_dir(
        r#"{
            "controller": {"id": "node1"},
            "workers": [{"type": "router", "realms": [{"name": "realm1"}]}]
        }"#,
    );
    let launcher = EmbeddedWorkerLauncher::new();
    let node = node_in(dir.path(), Duration::from_secs(2), &launcher);

    assert_eq!(node.start().await, NodeState::Failed);
    let router = launcher.inventory().worker("worker1").expect("router hosted");
    assert!(router.realms.contains_key("realm1"));
    assert!(router.transports.is_empty());
}

#[tokio::test]
async fn controller_services_start_before_workers() {
    let dir = node_dir(
        r#"{
            "controller": {
                "id": "node1",
                "manhole": {"endpoint": {"type": "tcp", "port": 6022}},
                "transport": {"type": "websocket", "endpoint": {"type": "tcp", "port": 9000}}
            },
            "workers": [{"type": "guest", "executable": "/bin/true"}]
        }"#,
    );
    let launcher = EmbeddedWorkerLauncher::new();
    let node = node_in(dir.path(), Duration::from_secs(2), &launcher);

    assert_eq!(node.start().await, NodeState::Running);
    assert_eq!(node.metrics().calls("start_manhole", true), 1);
    assert_eq!(node.metrics().calls("start_management_transport", true), 1);
    assert_eq!(node.metrics().workers_started("guest"), 1);
}

/// Stops component `c1` of container `box` while launching worker `exit_on`.
struct ExitDuringLaunch {
    inner: EmbeddedWorkerLauncher,
    exit_on: &'static str,
}

#[async_trait]
impl WorkerLauncher for ExitDuringLaunch {
    async fn launch(
        &self,
        sessions: &Arc<RouterSessionFactory>,
        request: WorkerLaunch,
    ) -> Result<Value, RouterError> {
        if request.endpoint.worker_id() == self.exit_on {
            self.inner.stop_component("box", "c1")?;
        }
        self.inner.launch(sessions, request).await
    }
}

#[tokio::test]
async fn component_exit_during_later_worker_fails_startup() {
    let dir = node_dir(
        r#"{
            "controller": {"id": "node1"},
            "workers": [
                {"id": "box", "type": "container", "components": [{"id": "c1", "type": "class"}]},
                {
                    "id": "r",
                    "type": "router",
                    "realms": [{"name": "realm1"}],
                    "transports": [{"type": "websocket"}]
                },
                {"type": "guest", "executable": "/bin/true"}
            ]
        }"#,
    );
    let embedded = EmbeddedWorkerLauncher::new();
    let launcher = ExitDuringLaunch {
        inner: embedded.clone(),
        exit_on: "r",
    };
    let options = NodeOptions {
        cbdir: dir.path().to_path_buf(),
        component_grace: Duration::from_secs(30),
        ..NodeOptions::default()
    };
    let node = Node::new(options, NodeMetrics::detached().expect("metrics"))
        .with_launcher(Arc::new(launcher));

    assert_eq!(node.start().await, NodeState::Failed);
    let failure = node.shutdown_signal().failure().expect("failure recorded");
    assert!(failure.contains("c1"), "unexpected failure: {failure}");
    assert_eq!(node.metrics().component_early_exits(), 1);

    let inventory = embedded.inventory();
    assert_eq!(inventory.worker_ids(), vec!["box", "r"]);
    let router = inventory.worker("r").expect("router hosted");
    assert!(router.realms.is_empty());
    assert!(router.transports.is_empty());
    assert_eq!(node.wait().await, NodeState::Failed);
}
