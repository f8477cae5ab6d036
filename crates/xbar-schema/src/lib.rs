//! ---
//! xbar_section: "02-messaging-ipc-data-model"
//! xbar_subsection: "module"
//! xbar_type: "source"
//! xbar_scope: "code"
//! xbar_description: "API schema declaration extraction from annotated Markdown."
//! xbar_version: "v0.0.0-prealpha"
//! xbar_owner: "tbd"
//! ---
//! Schema declarations for router realms.
//!
//! Realm documentation is written as Markdown in which API declarations are
//! embedded as fenced ```` ```javascript ```` blocks holding a JSON object. A
//! block becomes a declaration when its `$schema` equals [`SCHEMA_DIALECT`] and
//! it carries a `uri`. Declarations sharing a uri are merged shallowly in the
//! order the files (and blocks within a file) are processed.

use std::fs;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

/// Dialect marker identifying a WAMP API declaration.
pub const SCHEMA_DIALECT: &str = "http://wamp.ws/schema#";

static DECLARATION_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)```javascript(.*?)```").expect("declaration block pattern is valid")
});

pub type SchemaResult<T> = Result<T, SchemaError>;

#[derive(Debug, Error)]
pub enum SchemaError {
    /// A listed schema file could not be read. This aborts the realm start.
    #[error("unable to read schema file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Uri-keyed registry of merged declarations, in first-seen order.
pub type SchemaRegistry = IndexMap<String, Map<String, Value>>;

/// Result of one extraction run over a realm's schema files.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchemaExtraction {
    pub registry: SchemaRegistry,
    /// Files read.
    pub files: usize,
    /// Declarations accepted into the registry.
    pub declarations: usize,
    /// Blocks that failed to parse or lacked a usable uri.
    pub skipped: usize,
}

impl SchemaExtraction {
    /// Number of distinct uris in the registry.
    pub fn uris(&self) -> usize {
        self.registry.len()
    }

    /// JSON rendering passed to `start_router_realm`.
    pub fn to_value(&self) -> Value {
        Value::Object(
            self.registry
                .iter()
                .map(|(uri, decl)| (uri.clone(), Value::Object(decl.clone())))
                .collect(),
        )
    }

    fn absorb(&mut self, origin: &Path, body: &str) {
        let parsed: Value = match serde_json::from_str(body) {
            Ok(value) => value,
            Err(err) => {
                warn!(file = %origin.display(), error = %err, "failed to process schema declaration block");
                self.skipped += 1;
                return;
            }
        };
        let Value::Object(decl) = parsed else {
            return;
        };
        if decl.get("$schema").and_then(Value::as_str) != Some(SCHEMA_DIALECT) {
            return;
        }
        let Some(uri) = decl.get("uri").and_then(Value::as_str).map(str::to_owned) else {
            warn!(file = %origin.display(), "schema declaration without a string uri");
            self.skipped += 1;
            return;
        };
        let merged = self.registry.entry(uri).or_default();
        for (key, value) in decl {
            merged.insert(key, value);
        }
        self.declarations += 1;
    }
}

/// Iterate the bodies of the declaration blocks in `text`, in order.
pub fn declaration_blocks(text: &str) -> impl Iterator<Item = &str> {
    DECLARATION_BLOCK
        .captures_iter(text)
        .filter_map(|caps| caps.get(1).map(|body| body.as_str()))
}

/// Extract declarations from `files`, each resolved against `base_dir`.
///
/// Malformed blocks are logged and skipped; an unreadable file is an error.
pub fn extract<P: AsRef<Path>>(base_dir: &Path, files: &[P]) -> SchemaResult<SchemaExtraction> {
    let mut extraction = SchemaExtraction::default();
    for file in files {
        let path = base_dir.join(file.as_ref());
        debug!(file = %path.display(), "processing schema file");
        let text = fs::read_to_string(&path).map_err(|source| SchemaError::Io {
            path: path.clone(),
            source,
        })?;
        extraction.files += 1;
        for body in declaration_blocks(&text) {
            extraction.absorb(&path, body);
        }
    }
    Ok(extraction)
}
