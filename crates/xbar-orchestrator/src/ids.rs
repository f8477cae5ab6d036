//! ---
//! xbar_section: "04-configuration-orchestration"
//! xbar_subsection: "module"
//! xbar_type: "source"
//! xbar_scope: "code"
//! xbar_description: "Id assignment for unnamed configuration entries."
//! xbar_version: "v0.0.0-prealpha"
//! xbar_owner: "tbd"
//! ---
//! Each ordered list of specs is its own id scope. Entries without an explicit
//! id are named `<kind><n>`, counting only the unnamed entries. Explicit ids
//! are taken as written; collisions are left for the callee to reject.

use serde_json::Value;
use xbar_common::ScopedSpec;

/// Id prefix of each scoped list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdKind {
    Worker,
    Realm,
    Role,
    Component,
    Transport,
}

impl IdKind {
    pub fn prefix(self) -> &'static str {
        match self {
            IdKind::Worker => "worker",
            IdKind::Realm => "realm",
            IdKind::Role => "role",
            IdKind::Component => "component",
            IdKind::Transport => "transport",
        }
    }
}

/// A spec paired with its resolved id. The spec itself is never modified.
#[derive(Debug)]
pub struct Resolved<'a, T> {
    pub id: String,
    pub spec: &'a T,
}

impl<T: ScopedSpec> Resolved<'_, T> {
    /// The spec body sent along with the id.
    pub fn payload(&self) -> Result<Value, serde_json::Error> {
        self.spec.payload()
    }
}

/// Resolve ids for one scope, in declaration order.
pub fn resolve_ids<T: ScopedSpec>(kind: IdKind, specs: &[T]) -> Vec<Resolved<'_, T>> {
    let mut assigned = 0usize;
    specs
        .iter()
        .map(|spec| {
            let id = match spec.declared_id() {
                Some(id) => id.to_owned(),
                None => {
                    assigned += 1;
                    format!("{}{}", kind.prefix(), assigned)
                }
            };
            Resolved { id, spec }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use xbar_common::{ComponentSpec, NodeConfig};

    fn ids<T: ScopedSpec>(kind: IdKind, specs: &[T]) -> Vec<String> {
        resolve_ids(kind, specs).into_iter().map(|r| r.id).collect()
    }

    #[test]
    fn named_entries_do_not_consume_counter() {
        let config: NodeConfig = r#"{"workers": [
            {"type": "router", "transports": []},
            {"id": "custom", "type": "container"},
            {"type": "guest"}
        ]}"#
        .parse()
        .expect("config");
        assert_eq!(
            ids(IdKind::Worker, &config.workers),
            vec!["worker1", "custom", "worker2"]
        );
    }

    #[test]
    fn counter_ignores_interspersed_named_entries() {
        let specs: Vec<ComponentSpec> = serde_json::from_str(
            r#"[{"id": "a"}, {"id": "b"}, {}, {"id": "c"}, {}, {}]"#,
        )
        .expect("components");
        assert_eq!(
            ids(IdKind::Component, &specs),
            vec!["a", "b", "component1", "c", "component2", "component3"]
        );
    }

    #[test]
    fn explicit_collisions_are_not_deduplicated() {
        let specs: Vec<ComponentSpec> =
            serde_json::from_str(r#"[{"id": "component1"}, {}]"#).expect("components");
        assert_eq!(
            ids(IdKind::Component, &specs),
            vec!["component1", "component1"]
        );
    }

    #[test]
    fn resolution_leaves_specs_untouched() {
        let specs: Vec<ComponentSpec> =
            serde_json::from_str(r#"[{"type": "class"}]"#).expect("components");
        let first = ids(IdKind::Component, &specs);
        let second = ids(IdKind::Component, &specs);
        assert_eq!(first, second);
        assert!(specs[0].id.is_none());
    }
}
