//! ---
//! xbar_section: "04-configuration-orchestration"
//! xbar_subsection: "module"
//! xbar_type: "source"
//! xbar_scope: "code"
//! xbar_description: "Node identity resolution."
//! xbar_version: "v0.0.0-prealpha"
//! xbar_owner: "tbd"
//! ---
use serde::Serialize;
use xbar_common::NodeConfig;

use crate::error::{NodeError, Result};

/// Where the node id came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentitySource {
    Manager,
    Controller,
    Host,
}

/// Node id and control realm, fixed for the process lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeIdentity {
    pub node_id: String,
    pub realm_name: String,
    pub source: IdentitySource,
}

impl NodeIdentity {
    /// Managed identity overrides local identity overrides the host name.
    pub fn resolve(config: &NodeConfig) -> Result<Self> {
        Self::resolve_with(config, local_hostname)
    }

    pub fn resolve_with<F>(config: &NodeConfig, host: F) -> Result<Self>
    where
        F: FnOnce() -> Result<String>,
    {
        let (node_id, source) = if let Some(manager) = &config.manager {
            (manager.id.clone(), IdentitySource::Manager)
        } else if let Some(id) = &config.controller.id {
            (id.clone(), IdentitySource::Controller)
        } else {
            (host()?, IdentitySource::Host)
        };
        Ok(Self {
            node_id,
            realm_name: config.controller.realm().to_owned(),
            source,
        })
    }
}

/// Host name of the local machine.
pub fn local_hostname() -> Result<String> {
    hostname::get()
        .map_err(|err| NodeError::Identity(format!("hostname lookup failed: {err}")))?
        .into_string()
        .map_err(|raw| NodeError::Identity(format!("host name {raw:?} is not valid UTF-8")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_host() -> Result<String> {
        Ok("host-a".to_owned())
    }

    #[test]
    fn manager_id_wins() {
        let config: NodeConfig = r#"{"manager": {"id": "M"}, "controller": {"id": "C"}}"#
            .parse()
            .expect("config");
        let identity = NodeIdentity::resolve_with(&config, fixed_host).expect("identity");
        assert_eq!(identity.node_id, "M");
        assert_eq!(identity.source, IdentitySource::Manager);
    }

    #[test]
    fn controller_id_beats_host() {
        let config: NodeConfig = r#"{"controller": {"id": "C", "realm": "mgmt"}}"#
            .parse()
            .expect("config");
        let identity = NodeIdentity::resolve_with(&config, fixed_host).expect("identity");
        assert_eq!(identity.node_id, "C");
        assert_eq!(identity.realm_name, "mgmt");
    }

    #[test]
    fn empty_config_falls_back_to_host() {
        let config: NodeConfig = "{}".parse().expect("config");
        let identity = NodeIdentity::resolve_with(&config, fixed_host).expect("identity");
        assert_eq!(identity.node_id, "host-a");
        assert_eq!(identity.realm_name, "crossbar");
        assert_eq!(identity.source, IdentitySource::Host);
    }

    #[test]
    fn real_host_name_is_used_by_default() {
        let config: NodeConfig = "{}".parse().expect("config");
        let identity = NodeIdentity::resolve(&config).expect("identity");
        assert_eq!(identity.node_id, local_hostname().expect("hostname"));
    }
}
