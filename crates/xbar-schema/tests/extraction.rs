//! ---
//! xbar_section: "02-messaging-ipc-data-model"
//! xbar_subsection: "tests"
//! xbar_type: "test"
//! xbar_scope: "code"
//! xbar_description: "File-level tests for schema declaration extraction."
//! xbar_version: "v0.0.0-prealpha"
//! xbar_owner: "tbd"
//! ---
use std::fs;
use std::path::Path;

use serde_json::json;
use xbar_schema::{extract, SchemaError};

const FILE_A: &str = r#"# API A

```javascript
{"$schema": "http://wamp.ws/schema#", "uri": "x", "a": 1}
```
"#;

const FILE_B: &str = r#"# API B

Some prose.

```javascript
{"$schema": "http://wamp.ws/schema#", "uri": "x", "a": 2, "b": 3}
```
"#;

const FILE_BROKEN: &str = r#"
```javascript
{"$schema": "http://wamp.ws/schema#", "uri": "broken",
```

```javascript
{"$schema": "http://wamp.ws/schema#", "uri": "y", "type": "procedure"}
```
"#;

fn write_fixtures(dir: &Path) {
    fs::write(dir.join("a.md"), FILE_A).expect("write a.md");
    fs::write(dir.join("b.md"), FILE_B).expect("write b.md");
    fs::write(dir.join("broken.md"), FILE_BROKEN).expect("write broken.md");
}

#[test]
fn later_files_overwrite_earlier_fields() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_fixtures(dir.path());

    let forward = extract(dir.path(), &["a.md", "b.md"]).expect("extraction succeeds");
    assert_eq!(forward.registry["x"]["a"], json!(2));
    assert_eq!(forward.registry["x"]["b"], json!(3));

    let backward = extract(dir.path(), &["b.md", "a.md"]).expect("extraction succeeds");
    assert_eq!(backward.registry["x"]["a"], json!(1));
    assert_eq!(backward.registry["x"]["b"], json!(3));

    assert_eq!(forward.files, 2);
    assert_eq!(forward.declarations, 2);
    assert_eq!(forward.uris(), 1);
}

#[test]
fn malformed_block_does_not_stop_extraction() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_fixtures(dir.path());

    let extraction =
        extract(dir.path(), &["broken.md", "a.md"]).expect("extraction succeeds");
    assert_eq!(extraction.files, 2);
    assert_eq!(extraction.declarations, 2);
    assert_eq!(extraction.skipped, 1);
    assert_eq!(extraction.uris(), 2);
    assert!(extraction.registry.contains_key("y"));
    assert!(!extraction.registry.contains_key("broken"));
    let keys: Vec<_> = extraction.registry.keys().cloned().collect();
    assert_eq!(keys, vec!["y".to_owned(), "x".to_owned()]);
}

#[test]
fn rendered_registry_is_keyed_by_uri() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_fixtures(dir.path());
    let extraction = extract(dir.path(), &["a.md"]).expect("extraction succeeds");
    assert_eq!(
        extraction.to_value(),
        json!({"x": {"$schema": "http://wamp.ws/schema#", "uri": "x", "a": 1}})
    );
}

#[test]
fn unreadable_file_is_fatal() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_fixtures(dir.path());
    let err = extract(dir.path(), &["a.md", "missing.md"]).expect_err("missing file");
    match err {
        SchemaError::Io { path, .. } => assert!(path.ends_with("missing.md")),
    }
}

#[test]
fn empty_file_list_yields_empty_registry() {
    let dir = tempfile::tempdir().expect("tempdir");
    let extraction = extract::<&str>(dir.path(), &[]).expect("extraction succeeds");
    assert_eq!(extraction.files, 0);
    assert!(extraction.registry.is_empty());
}
