//! Integration tests for the resource lifecycle
//!
//! Every test drives real `/bin/sh` commands against files in a temporary
//! directory.
#![cfg(unix)]

mod common;

use common::{commit, engine, fresh, map};
use shellres_core::errors::{CommandError, ShellresError};
use std::fs;
use tempfile::TempDir;

const FILE_PROVIDER: &str = r#"
[commands]
create = "printf '%s' '{{ content }}' > '{{ path }}'"
read = "echo \"out=$(cat '{{ path }}')\""
delete = "rm '{{ path }}'"
"#;

#[test]
fn test_basic_create_read_delete() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("file.txt");
    let path_str = path.to_str().unwrap();
    let engine = engine(FILE_PROVIDER);

    let mut data = fresh(&[("path", path_str), ("content", "hi")]);
    engine.create(&mut data).unwrap();

    assert_eq!(fs::read_to_string(&path).unwrap(), "hi");
    assert_eq!(data.output, map(&[("out", "hi")]));
    assert!(data.is_provisioned());

    commit(&mut data);
    engine.delete(&mut data).unwrap();
    assert!(!path.exists());
    assert!(!data.is_provisioned());
    assert!(data.output.is_empty());
}

#[test]
fn test_base64_read_output() {
    let engine = engine(
        r#"
output_format = "base64"

[commands]
read = "echo out=aGk="
"#,
    );
    let mut data = fresh(&[]);
    engine.create(&mut data).unwrap();
    assert_eq!(data.output, map(&[("out", "hi")]));
}

#[test]
fn test_update_without_template_replaces() {
    let dir = TempDir::new().unwrap();
    let first = dir.path().join("first.txt");
    let second = dir.path().join("second.txt");
    let engine = engine(FILE_PROVIDER);

    let mut data = fresh(&[("path", first.to_str().unwrap()), ("content", "one")]);
    engine.create(&mut data).unwrap();
    commit(&mut data);
    let first_id = data.id.clone();

    data.context.new = map(&[("path", second.to_str().unwrap()), ("content", "two")]);
    engine.update(&mut data).unwrap();

    assert!(!first.exists());
    assert_eq!(fs::read_to_string(&second).unwrap(), "two");
    assert_eq!(data.output, map(&[("out", "two")]));
    assert_ne!(data.id, first_id);
}

#[test]
fn test_update_with_template() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("file.txt");
    let engine = engine(
        r#"
[commands]
create = "printf '%s' '{{ content }}' > '{{ path }}'"
update = "printf '%s' '{{ old.content }}->{{ content }}' > '{{ path }}'"
read = "echo \"out=$(cat '{{ path }}')\""
"#,
    );

    let mut data = fresh(&[("path", path.to_str().unwrap()), ("content", "a")]);
    engine.create(&mut data).unwrap();
    commit(&mut data);

    data.context.new.insert("content".into(), "b".into());
    engine.update(&mut data).unwrap();
    assert_eq!(fs::read_to_string(&path).unwrap(), "a->b");
    assert_eq!(data.output, map(&[("out", "a->b")]));
}

#[test]
fn test_create_delegates_to_update() {
    let engine = engine(
        r#"
[commands]
update = "echo '{{ state_prefix }}via=update'"
"#,
    );
    let mut data = fresh(&[]);
    engine.create(&mut data).unwrap();
    assert_eq!(data.state.new, map(&[("via", "update")]));
    assert!(data.is_provisioned());
}

#[test]
fn test_delete_on_read_failure_clears_silently() {
    let engine = engine(
        r#"
delete_on_read_failure = true

[commands]
read = "echo gone >&2; exit 3"
"#,
    );
    let mut data = fresh(&[("a", "1")]);
    data.id = "existing".into();
    data.output = map(&[("out", "stale")]);
    data.state.new = map(&[("k", "v")]);

    engine.read(&mut data).unwrap();
    assert!(data.id.is_empty());
    assert!(data.output.is_empty());
    assert!(data.state.new.is_empty());
}

#[test]
fn test_read_failure_propagates_by_default() {
    let engine = engine(
        r#"
[commands]
read = "echo 'something broke' >&2; exit 3"
"#,
    );
    let mut data = fresh(&[]);
    data.id = "existing".into();

    let err = engine.read(&mut data).unwrap_err();
    match err {
        ShellresError::Command(CommandError::Failed { status, output, .. }) => {
            assert_eq!(status, "exit code 3");
            assert!(output.contains("something broke"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(data.id, "existing");
}

#[test]
fn test_state_round_trip() {
    let engine = engine(
        r#"
[commands]
create = "echo '{{ state_prefix }}k=v'"
read = "echo 'old={{ state.old.k }}'; echo 'new={{ state.new.k }}'"
"#,
    );

    let mut data = fresh(&[]);
    engine.create(&mut data).unwrap();
    assert_eq!(data.output, map(&[("old", "<no value>"), ("new", "v")]));

    commit(&mut data);
    engine.read(&mut data).unwrap();
    assert_eq!(data.output, map(&[("old", "v"), ("new", "v")]));
}

#[test]
fn test_empty_marker_removes_state() {
    let engine = engine(
        r#"
[commands]
create = "echo '{{ state_prefix }}keep=1'; echo '{{ state_prefix }}drop=2'"
update = "echo '{{ state_prefix }}drop={{ empty }}'; echo '{{ state_prefix }}empty='"
"#,
    );
    let mut data = fresh(&[]);
    engine.create(&mut data).unwrap();
    assert_eq!(data.state.new, map(&[("keep", "1"), ("drop", "2")]));

    commit(&mut data);
    engine.update(&mut data).unwrap();
    assert_eq!(data.state.new, map(&[("keep", "1"), ("empty", "")]));
}

#[test]
fn test_derived_id_is_idempotent() {
    let engine = engine(
        r#"
[commands]
create = "echo '{{ state_prefix }}token=fixed'"
read = "echo 'name={{ name }}'"
"#,
    );

    let mut first = fresh(&[("name", "x")]);
    engine.create(&mut first).unwrap();
    let mut second = fresh(&[("name", "x")]);
    engine.create(&mut second).unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(first.output, second.output);

    let mut other = fresh(&[("name", "y")]);
    engine.create(&mut other).unwrap();
    assert_ne!(first.id, other.id);
}

#[test]
fn test_id_command() {
    let engine = engine(
        r#"
[commands]
create = "true"
id = "echo 'res-{{ name }}'"
"#,
    );
    let mut data = fresh(&[("name", "abc")]);
    engine.create(&mut data).unwrap();
    assert_eq!(data.id, "res-abc");
}

#[test]
fn test_empty_read_output() {
    let engine = engine(
        r#"
[commands]
read = "true"
"#,
    );
    let mut data = fresh(&[]);
    data.output = map(&[("stale", "1")]);
    engine.read(&mut data).unwrap();
    assert!(data.output.is_empty());
}

#[test]
fn test_except_prefix_beats_output_prefix() {
    let engine = engine(
        r#"
output_line_prefix = "OUT:"

[commands]
read = """
echo 'OUT:a=1'
echo 'b=2'
echo 'no equals sign'
echo '{{ state_prefix }}OUT:c=3'
"""
"#,
    );
    let mut data = fresh(&[]);
    engine.read(&mut data).unwrap();
    assert_eq!(data.output.get("a").map(String::as_str), Some("1"));
    assert!(!data.output.contains_key("b"));
    assert!(!data.output.contains_key("c"));
    assert!(!data.output.contains_key("OUT:c"));
    assert_eq!(data.state.new.get("OUT:c").map(String::as_str), Some("3"));
}

#[test]
fn test_create_failure_rolls_back() {
    let engine = engine(
        r#"
[commands]
create = "echo '{{ state_prefix }}k=v'; echo failing >&2; exit 1"
"#,
    );
    let mut data = fresh(&[]);
    let err = engine.create(&mut data).unwrap_err();
    assert!(err.is_command_failure());
    assert!(err.to_string().contains("failing"));
    assert!(data.id.is_empty());
    assert!(data.state.new.is_empty());
}

#[test]
fn test_read_failure_after_create_rolls_back_even_with_delete_policy() {
    let engine = engine(
        r#"
delete_on_read_failure = true

[commands]
create = "echo '{{ state_prefix }}k=v'"
read = "exit 4"
"#,
    );
    let mut data = fresh(&[]);
    assert!(engine.create(&mut data).is_err());
    assert!(data.id.is_empty());
    assert!(data.state.new.is_empty());
}

#[test]
fn test_unmet_dependencies_skip_create() {
    let dir = TempDir::new().unwrap();
    let marker = dir.path().join("created");
    let engine = engine(&format!(
        r#"
[commands]
dependencies = "echo false"
create = "touch '{}'"
"#,
        marker.display()
    ));
    let mut data = fresh(&[]);
    engine.create(&mut data).unwrap();
    assert!(!marker.exists());
    assert!(!data.is_provisioned());
}

#[test]
fn test_met_dependencies_allow_create() {
    let engine = engine(
        r#"
[commands]
dependencies = "echo '  true  '"
create = "echo '{{ state_prefix }}ran=yes'"
"#,
    );
    let mut data = fresh(&[]);
    engine.create(&mut data).unwrap();
    assert_eq!(data.state.new, map(&[("ran", "yes")]));
}

#[test]
fn test_delete_renders_old_snapshot() {
    let dir = TempDir::new().unwrap();
    let old_file = dir.path().join("old");
    fs::write(&old_file, "x").unwrap();
    let engine = engine(FILE_PROVIDER);

    let mut data = fresh(&[("path", "/nonexistent/new")]);
    data.context.old = map(&[("path", old_file.to_str().unwrap())]);
    data.id = "id".into();
    engine.delete(&mut data).unwrap();
    assert!(!old_file.exists());
}

#[test]
fn test_delete_runs_despite_broken_old_reference() {
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("entity");
    fs::write(&target, "x").unwrap();
    let engine = engine(
        r#"
[commands]
delete = "rm -f '{{ path }}' # {{ from_json(gone) }}"
"#,
    );

    let mut data = fresh(&[]);
    data.context.old = map(&[("path", target.to_str().unwrap()), ("gone", "not json")]);
    data.id = "id".into();
    data.state.new = map(&[("k", "v")]);

    engine.delete(&mut data).unwrap();
    assert!(!target.exists());
    assert!(data.id.is_empty());
    assert!(data.state.new.is_empty());
}

#[test]
fn test_delete_rendering_empty_is_noop() {
    let engine = engine(
        r#"
[commands]
delete = "{% if remove == 'yes' %}exit 1{% endif %}"
"#,
    );
    let mut data = fresh(&[]);
    data.context.old = map(&[("remove", "no")]);
    data.id = "id".into();
    engine.delete(&mut data).unwrap();
    assert!(data.id.is_empty());
}

#[test]
fn test_delete_failure_keeps_resource() {
    let engine = engine(
        r#"
[commands]
delete = "exit 2"
"#,
    );
    let mut data = fresh(&[]);
    data.id = "id".into();
    data.state.new = map(&[("k", "v")]);
    assert!(engine.delete(&mut data).is_err());
    assert_eq!(data.id, "id");
    assert_eq!(data.state.new, map(&[("k", "v")]));
}

#[test]
fn test_exists_probe() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("entity");
    let toml = r#"
[commands]
exists = "test -f '{{ path }}' && echo true || echo false"
"#;
    let engine = engine(toml);

    let mut data = fresh(&[("path", path.to_str().unwrap())]);
    data.id = "id".into();
    assert!(!engine.exists(&mut data).unwrap());
    assert_eq!(data.id, "id");

    fs::write(&path, "").unwrap();
    assert!(engine.exists(&mut data).unwrap());
}

#[test]
fn test_exists_failure_means_missing_and_clears() {
    let engine = engine(
        r#"
delete_on_not_exists = true

[commands]
exists = "exit 9"
"#,
    );
    let mut data = fresh(&[]);
    data.id = "id".into();
    assert!(!engine.exists(&mut data).unwrap());
    assert!(data.id.is_empty());
}

#[test]
fn test_modify_prefix_is_prepended() {
    let engine = engine(
        r#"
[commands]
modify_prefix = "GREETING='hello {{ name }}'"
create = "echo \"{{ state_prefix }}greeting=$GREETING\""
"#,
    );
    let mut data = fresh(&[("name", "world")]);
    engine.create(&mut data).unwrap();
    assert_eq!(data.state.new, map(&[("greeting", "hello world")]));
}

#[test]
fn test_template_error_is_not_a_command_failure() {
    let engine = engine(
        r#"
delete_on_read_failure = true

[commands]
read = "echo {{ broken"
"#,
    );
    let mut data = fresh(&[]);
    data.id = "id".into();
    let err = engine.read(&mut data).unwrap_err();
    assert!(matches!(err, ShellresError::Template(_)));
    assert_eq!(data.id, "id");
}
