//! Integration tests for diff customization probes
#![cfg(unix)]

mod common;

use common::{engine, map};
use shellres_core::resource::{ApplyData, ChangeFlag, PlanData};
use shellres_core::{ChangeMap, Field};

fn provisioned_plan(context: &[(&str, &str)]) -> PlanData {
    PlanData::from_apply(&ApplyData {
        context: ChangeMap::unchanged(map(context)),
        state: ChangeMap::unchanged(map(&[("k", "v")])),
        id: "res-1".into(),
        trigger: ChangeFlag::unchanged(false),
        ..ApplyData::default()
    })
}

#[test]
fn test_no_change_without_probes() {
    let engine = engine("");
    let mut plan = provisioned_plan(&[("a", "1")]);
    engine.customize_diff(&mut plan).unwrap();
    assert!(!plan.has_change());
}

#[test]
fn test_context_change_marks_computed() {
    let engine = engine("");
    let mut plan = provisioned_plan(&[("a", "1")]);
    plan.context.new.insert("a".into(), "2".into());
    engine.customize_diff(&mut plan).unwrap();
    assert!(plan.is_computed(Field::Output));
    assert!(plan.is_computed(Field::State));
    assert!(!plan.trigger.has_change());
}

#[test]
fn test_needs_update_flips_trigger() {
    let engine = engine(
        r#"
[commands]
needs_update = "test '{{ state.cur.k }}' = 'v' && echo true"
"#,
    );
    let mut plan = provisioned_plan(&[]);
    engine.customize_diff(&mut plan).unwrap();
    assert_eq!(plan.trigger, ChangeFlag { old: false, new: true });
    assert!(plan.is_computed(Field::Output));
    assert!(plan.is_computed(Field::State));
    assert!(!plan.forces_new(Field::Trigger));
}

#[test]
fn test_needs_update_custom_marker() {
    let engine = engine(
        r#"
needs_update_marker = "stale"

[commands]
needs_update = "echo true"
"#,
    );
    let mut plan = provisioned_plan(&[]);
    engine.customize_diff(&mut plan).unwrap();
    assert!(!plan.has_change());
}

#[test]
fn test_needs_delete_forces_replacement() {
    let engine = engine(
        r#"
[commands]
needs_delete = "echo true"
needs_update = "echo true"
"#,
    );
    let mut plan = provisioned_plan(&[]);
    engine.customize_diff(&mut plan).unwrap();
    assert!(plan.forces_new(Field::Trigger));
    assert!(plan.trigger.has_change());
}

#[test]
fn test_failing_probe_is_negative() {
    let engine = engine(
        r#"
[commands]
needs_update = "echo true; exit 1"
"#,
    );
    let mut plan = provisioned_plan(&[]);
    engine.customize_diff(&mut plan).unwrap();
    assert!(!plan.has_change());
}

#[test]
fn test_unmet_dependencies_leave_plan_untouched() {
    let engine = engine(
        r#"
[commands]
dependencies = "echo no"
needs_update = "echo true"
"#,
    );
    let mut plan = provisioned_plan(&[("a", "1")]);
    plan.context.new.insert("a".into(), "2".into());
    engine.customize_diff(&mut plan).unwrap();
    assert!(!plan.trigger.has_change());
    assert!(!plan.is_computed(Field::Output));
}

#[test]
fn test_probe_template_error_propagates() {
    let engine = engine(
        r#"
[commands]
needs_update = "echo {{ unterminated"
"#,
    );
    let mut plan = provisioned_plan(&[]);
    assert!(engine.customize_diff(&mut plan).is_err());
}
