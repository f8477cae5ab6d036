//! ---
//! xbar_section: "01-core-functionality"
//! xbar_subsection: "module"
//! xbar_type: "source"
//! xbar_scope: "code"
//! xbar_description: "Node configuration tree and loader."
//! xbar_version: "v0.0.0-prealpha"
//! xbar_owner: "tbd"
//! ---
use std::fmt;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use serde_with::{serde_as, DurationSeconds};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use crate::logging::LogFormat;

/// Opaque, order-preserving JSON object carried through to control-plane calls untouched.
pub type Payload = Map<String, Value>;

/// Realm name of the node management plane when `controller.realm` is absent.
pub const DEFAULT_CONTROL_REALM: &str = "crossbar";

/// Process title reported when `controller.options.title` is absent.
pub const DEFAULT_CONTROLLER_TITLE: &str = "crossbar-controller";

fn default_manager_url() -> String {
    "ws://localhost:9000".to_owned()
}

fn default_manager_realm() -> String {
    "com.crossbar.manager".to_owned()
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9898))
}

/// Errors raised while loading or validating a node configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path} at `{field}`: {message}")]
    Parse {
        path: PathBuf,
        field: String,
        message: String,
    },
    #[error("unsupported config format for {0} (expected .json, .yaml, .yml or .toml)")]
    UnsupportedFormat(PathBuf),
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("failed to render configuration: {0}")]
    Render(#[from] serde_json::Error),
}

/// Serialisation formats understood by the loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Yaml,
    Toml,
}

impl ConfigFormat {
    /// Pick a format from the file extension.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let ext = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);
        match ext.as_deref() {
            Some("json") => Ok(ConfigFormat::Json),
            Some("yaml") | Some("yml") => Ok(ConfigFormat::Yaml),
            Some("toml") => Ok(ConfigFormat::Toml),
            _ => Err(ConfigError::UnsupportedFormat(path.to_path_buf())),
        }
    }
}

/// The validated configuration tree for one node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub controller: ControllerSection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manager: Option<ManagerSection>,
    #[serde(default)]
    pub workers: Vec<WorkerSpec>,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metadata describing where a [`NodeConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedNodeConfig {
    pub config: NodeConfig,
    pub source: PathBuf,
}

impl NodeConfig {
    pub const ENV_CONFIG_PATH: &'static str = "XBAR_CONFIG";

    /// Load the node configuration, resolving `file` against the node directory.
    ///
    /// `XBAR_CONFIG` overrides `file` when set to a non-empty value.
    pub fn load(cbdir: &Path, file: &Path) -> Result<LoadedNodeConfig, ConfigError> {
        let requested = match std::env::var(Self::ENV_CONFIG_PATH) {
            Ok(env_path) if !env_path.trim().is_empty() => PathBuf::from(env_path),
            _ => file.to_path_buf(),
        };
        let path = if requested.is_absolute() {
            requested
        } else {
            cbdir.join(requested)
        };
        let config = Self::from_path(&path)?;
        Ok(LoadedNodeConfig {
            config,
            source: path,
        })
    }

    /// Read, parse and validate a configuration file.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        debug!(config_path = %path.display(), "loading node configuration");
        let format = ConfigFormat::from_path(path)?;
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::parse(&contents, format, path)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration text in the given format without validating it.
    pub fn parse(contents: &str, format: ConfigFormat, origin: &Path) -> Result<Self, ConfigError> {
        let parse_error = |field: String, message: String| ConfigError::Parse {
            path: origin.to_path_buf(),
            field,
            message,
        };
        match format {
            ConfigFormat::Json => {
                let de = &mut serde_json::Deserializer::from_str(contents);
                serde_path_to_error::deserialize(de)
                    .map_err(|err| parse_error(err.path().to_string(), err.into_inner().to_string()))
            }
            ConfigFormat::Yaml => {
                let de = serde_yaml::Deserializer::from_str(contents);
                serde_path_to_error::deserialize(de)
                    .map_err(|err| parse_error(err.path().to_string(), err.into_inner().to_string()))
            }
            ConfigFormat::Toml => {
                let de = toml::Deserializer::new(contents);
                serde_path_to_error::deserialize(de)
                    .map_err(|err| parse_error(err.path().to_string(), err.into_inner().to_string()))
            }
        }
    }

    /// Structural checks that do not depend on sequencing order.
    ///
    /// Unknown worker types and router workers without transports are accepted here;
    /// they surface as startup failures once the sequencer reaches them.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(manager) = &self.manager {
            if manager.id.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "manager section requires a non-empty id".to_owned(),
                ));
            }
        }
        for (index, worker) in self.workers.iter().enumerate() {
            for realm in worker.realms() {
                if realm.name.trim().is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "worker #{} declares a realm without a name",
                        index + 1
                    )));
                }
                if realm.roles.iter().any(|role| role.name.trim().is_empty()) {
                    return Err(ConfigError::Invalid(format!(
                        "realm '{}' on worker #{} declares a role without a name",
                        realm.name,
                        index + 1
                    )));
                }
            }
        }
        Ok(())
    }

    /// Whether the node runs under an external management uplink.
    pub fn is_managed(&self) -> bool {
        self.manager.is_some()
    }

    /// SHA-256 digest of the canonical JSON rendering of the configuration.
    pub fn digest(&self) -> Result<String, ConfigError> {
        let rendered = serde_json::to_vec(self)?;
        let mut hasher = Sha256::new();
        hasher.update(&rendered);
        Ok(format!("{:x}", hasher.finalize()))
    }
}

impl std::str::FromStr for NodeConfig {
    type Err = ConfigError;

    /// Parse and validate a JSON configuration document.
    fn from_str(content: &str) -> Result<Self, Self::Err> {
        let config = Self::parse(content, ConfigFormat::Json, Path::new("<inline>"))?;
        config.validate()?;
        Ok(config)
    }
}

/// `controller` section: identity and management-plane options of the node controller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realm: Option<String>,
    #[serde(default)]
    pub options: ControllerOptions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manhole: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<Value>,
}

impl ControllerSection {
    /// Manhole configuration; the section-level entry wins over `options.manhole`.
    pub fn manhole(&self) -> Option<&Value> {
        self.manhole.as_ref().or(self.options.manhole.as_ref())
    }

    /// Management transport configuration; the section-level entry wins over `options.transport`.
    pub fn transport(&self) -> Option<&Value> {
        self.transport.as_ref().or(self.options.transport.as_ref())
    }

    pub fn title(&self) -> &str {
        self.options
            .title
            .as_deref()
            .unwrap_or(DEFAULT_CONTROLLER_TITLE)
    }

    pub fn realm(&self) -> &str {
        self.realm.as_deref().unwrap_or(DEFAULT_CONTROL_REALM)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manhole: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<Value>,
    #[serde(flatten)]
    pub extra: Payload,
}

/// `manager` section. Its presence switches the node into managed mode.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerSection {
    pub id: String,
    #[serde(default = "default_manager_url")]
    pub url: String,
    #[serde(default = "default_manager_realm")]
    pub realm: String,
    #[serde(default = "default_connect_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub connect_timeout: Duration,
}

impl ManagerSection {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: default_manager_url(),
            realm: default_manager_realm(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

/// Worker process flavours known to the node controller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum WorkerKind {
    Router,
    Container,
    Guest,
    /// A type string this node does not understand; rejected when the worker is reached.
    Unknown(String),
}

impl WorkerKind {
    pub fn as_str(&self) -> &str {
        match self {
            WorkerKind::Router => "router",
            WorkerKind::Container => "container",
            WorkerKind::Guest => "guest",
            WorkerKind::Unknown(other) => other.as_str(),
        }
    }

    /// Capitalised name used in worker log labels, e.g. `Router 'worker1'`.
    pub fn label(&self) -> &'static str {
        match self {
            WorkerKind::Router => "Router",
            WorkerKind::Container => "Container",
            WorkerKind::Guest => "Guest",
            WorkerKind::Unknown(_) => "Worker",
        }
    }

    /// Router and container workers are native worker processes sharing the generic setup calls.
    pub fn is_native(&self) -> bool {
        matches!(self, WorkerKind::Router | WorkerKind::Container)
    }
}

impl From<String> for WorkerKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "router" => WorkerKind::Router,
            "container" => WorkerKind::Container,
            "guest" => WorkerKind::Guest,
            _ => WorkerKind::Unknown(value),
        }
    }
}

impl From<WorkerKind> for String {
    fn from(value: WorkerKind) -> Self {
        value.as_str().to_owned()
    }
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Common surface of every spec living in an ordered, id-scoped list.
pub trait ScopedSpec {
    /// The id written in the configuration, if any.
    fn declared_id(&self) -> Option<&str>;

    /// The payload forwarded to the control-plane call, without the fields the
    /// sequencer consumes itself.
    fn payload(&self) -> Result<Value, serde_json::Error>;
}

fn strip_keys<T: Serialize>(spec: &T, keys: &[&str]) -> Result<Value, serde_json::Error> {
    let mut value = serde_json::to_value(spec)?;
    if let Value::Object(map) = &mut value {
        for key in keys {
            map.shift_remove(*key);
        }
    }
    Ok(value)
}

/// One entry of the `workers` list.
///
/// `options`, `realms` and `components` stay `None` when absent so a guest
/// payload carries exactly the keys the entry was written with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: WorkerKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<WorkerOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manhole: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realms: Option<Vec<RealmSpec>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub components: Option<Vec<ComponentSpec>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transports: Option<Vec<TransportSpec>>,
    #[serde(flatten)]
    pub extra: Payload,
}

static NO_WORKER_OPTIONS: Lazy<WorkerOptions> = Lazy::new(WorkerOptions::default);

impl WorkerSpec {
    pub fn options(&self) -> &WorkerOptions {
        self.options.as_ref().unwrap_or(&NO_WORKER_OPTIONS)
    }

    pub fn realms(&self) -> &[RealmSpec] {
        self.realms.as_deref().unwrap_or_default()
    }

    pub fn components(&self) -> &[ComponentSpec] {
        self.components.as_deref().unwrap_or_default()
    }

    /// Manhole configuration; the worker-level entry wins over `options.manhole`.
    pub fn manhole(&self) -> Option<&Value> {
        self.manhole.as_ref().or(self.options().manhole.as_ref())
    }
}

impl ScopedSpec for WorkerSpec {
    fn declared_id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn payload(&self) -> Result<Value, serde_json::Error> {
        strip_keys(self, &["id"])
    }
}

/// Native worker process options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pythonpath: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_affinity: Option<Vec<u32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manhole: Option<Value>,
    #[serde(flatten)]
    pub extra: Payload,
}

impl WorkerOptions {
    pub fn to_payload(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

/// A realm started on a router worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealmSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<RoleSpec>,
    /// Documentation files, relative to the node directory, to extract declarations from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schemas: Option<Vec<PathBuf>>,
    #[serde(flatten)]
    pub extra: Payload,
}

impl RealmSpec {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            roles: Vec::new(),
            schemas: None,
            extra: Payload::new(),
        }
    }
}

impl ScopedSpec for RealmSpec {
    fn declared_id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn payload(&self) -> Result<Value, serde_json::Error> {
        strip_keys(self, &["id", "schemas"])
    }
}

/// An authorization role attached to a realm; permission data stays opaque.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(flatten)]
    pub extra: Payload,
}

impl RoleSpec {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            extra: Payload::new(),
        }
    }
}

impl ScopedSpec for RoleSpec {
    fn declared_id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn payload(&self) -> Result<Value, serde_json::Error> {
        strip_keys(self, &["id"])
    }
}

/// An application component hosted by a router or container worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComponentSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(flatten)]
    pub config: Payload,
}

impl ScopedSpec for ComponentSpec {
    fn declared_id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn payload(&self) -> Result<Value, serde_json::Error> {
        strip_keys(self, &["id"])
    }
}

/// A listening transport on a router worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(flatten)]
    pub config: Payload,
}

impl ScopedSpec for TransportSpec {
    fn declared_id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn payload(&self) -> Result<Value, serde_json::Error> {
        strip_keys(self, &["id"])
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_prefix: Option<String>,
    /// Filter directive used when neither `XBAR_LOG` nor `RUST_LOG` is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
            level: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_metrics_listen(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_worker_type_is_preserved() {
        let config: NodeConfig = r#"{"workers": [{"type": "router"}, {"type": "bogus"}]}"#
            .parse()
            .expect("config parses");
        assert_eq!(config.workers[0].kind, WorkerKind::Router);
        assert_eq!(
            config.workers[1].kind,
            WorkerKind::Unknown("bogus".to_owned())
        );
    }

    #[test]
    fn realm_payload_drops_id_and_schemas_but_keeps_roles() {
        let realm: RealmSpec = serde_json::from_value(json!({
            "id": "r1",
            "name": "realm1",
            "schemas": ["api.md"],
            "roles": [{"name": "anonymous", "permissions": []}],
            "store": {"type": "memory"}
        }))
        .expect("realm parses");
        let payload = realm.payload().expect("payload renders");
        assert_eq!(
            payload,
            json!({
                "name": "realm1",
                "roles": [{"name": "anonymous", "permissions": []}],
                "store": {"type": "memory"}
            })
        );
        assert_eq!(realm.declared_id(), Some("r1"));
    }

    #[test]
    fn guest_payload_keeps_type_and_opaque_fields() {
        let worker: WorkerSpec = serde_json::from_value(json!({
            "id": "g1",
            "type": "guest",
            "executable": "/usr/bin/node",
            "arguments": ["hello.js"]
        }))
        .expect("worker parses");
        let payload = worker.payload().expect("payload renders");
        assert_eq!(
            payload,
            json!({"type": "guest", "executable": "/usr/bin/node", "arguments": ["hello.js"]})
        );
        assert!(payload.get("options").is_none());
    }

    #[test]
    fn guest_payload_keeps_explicitly_empty_sections() {
        let worker: WorkerSpec = serde_json::from_value(json!({
            "type": "guest",
            "executable": "/bin/true",
            "options": {},
            "components": []
        }))
        .expect("worker parses");
        assert!(worker.components().is_empty());
        let payload = worker.payload().expect("payload renders");
        assert_eq!(
            payload,
            json!({"type": "guest", "executable": "/bin/true", "options": {}, "components": []})
        );
    }

    #[test]
    fn controller_manhole_prefers_section_entry() {
        let config: NodeConfig = r#"{
            "controller": {
                "manhole": {"endpoint": "a"},
                "options": {"manhole": {"endpoint": "b"}, "transport": {"endpoint": "t"}}
            }
        }"#
        .parse()
        .expect("config parses");
        assert_eq!(config.controller.manhole(), Some(&json!({"endpoint": "a"})));
        assert_eq!(
            config.controller.transport(),
            Some(&json!({"endpoint": "t"}))
        );
        assert_eq!(config.controller.title(), DEFAULT_CONTROLLER_TITLE);
        assert_eq!(config.controller.realm(), DEFAULT_CONTROL_REALM);
    }

    #[test]
    fn parse_error_reports_field_path() {
        let err = r#"{"workers": [{"type": "router", "options": {"cpu_affinity": "all"}}]}"#
            .parse::<NodeConfig>()
            .expect_err("cpu_affinity must be a list");
        match err {
            ConfigError::Parse { field, .. } => {
                assert!(field.starts_with("workers[0]"), "unexpected path {field}");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn manager_without_id_is_rejected() {
        let err = r#"{"manager": {"id": "  "}}"#
            .parse::<NodeConfig>()
            .expect_err("blank manager id");
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn manager_connect_timeout_reads_seconds() {
        let config: NodeConfig = r#"{"manager": {"id": "m", "connect_timeout": 3}}"#
            .parse()
            .expect("config parses");
        let manager = config.manager.expect("manager present");
        assert_eq!(manager.connect_timeout, Duration::from_secs(3));
        assert_eq!(manager.url, default_manager_url());
    }

    #[test]
    fn digest_is_stable_for_identical_configs() {
        let a: NodeConfig = r#"{"controller": {"id": "n1"}}"#.parse().expect("parses");
        let b: NodeConfig = r#"{"controller": {"id": "n1"}}"#.parse().expect("parses");
        assert_eq!(a.digest().expect("digest"), b.digest().expect("digest"));
    }
}
