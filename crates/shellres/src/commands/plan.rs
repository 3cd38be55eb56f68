//! Plan subcommand: run the diff probes without touching the record

use super::{load_engine, load_record, print_json, ResourceArgs};
use anyhow::Result;
use serde::Serialize;
use shellres_core::{Field, PlanData};
use tracing::instrument;

const FIELDS: [Field; 3] = [Field::Output, Field::State, Field::Trigger];

/// Stdout contract of `plan`
#[derive(Debug, Serialize)]
pub struct PlanSummary {
    /// One of `create`, `replace`, `update` or `none`
    pub action: &'static str,
    pub changed_context: Vec<String>,
    pub changed_environment: Vec<String>,
    pub sensitive_environment_changed: bool,
    pub trigger: bool,
    pub computed: Vec<Field>,
    pub forces_new: Vec<Field>,
}

impl PlanSummary {
    fn new(plan: &PlanData) -> Self {
        let action = if plan.id.is_empty() {
            "create"
        } else if FIELDS.iter().any(|field| plan.forces_new(*field)) {
            "replace"
        } else if plan.has_change() {
            "update"
        } else {
            "none"
        };
        Self {
            action,
            changed_context: owned(plan.context.changed_keys()),
            changed_environment: owned(plan.environment.changed_keys()),
            sensitive_environment_changed: plan.sensitive_environment.has_change(),
            trigger: plan.trigger.new,
            computed: plan.computed_fields().collect(),
            forces_new: FIELDS
                .into_iter()
                .filter(|field| plan.forces_new(*field))
                .collect(),
        }
    }
}

fn owned(keys: Vec<&str>) -> Vec<String> {
    keys.into_iter().map(str::to_string).collect()
}

#[instrument(skip(args), fields(record = %args.record.display()))]
pub fn plan(args: ResourceArgs) -> Result<()> {
    let engine = load_engine(&args)?;
    let record = load_record(&args)?;
    let mut plan = record.to_plan_data(&args.overrides);
    engine.customize_diff(&mut plan)?;
    print_json(&PlanSummary::new(&plan))
}
