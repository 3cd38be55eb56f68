//! Apply-style subcommands: create, read, update, delete and exists

use super::{load_engine, load_record, print_json, ResourceArgs};
use anyhow::{bail, Result};
use serde::Serialize;
use shellres_core::state::ResourceRecord;
use shellres_core::{ApplyData, Field, Lifecycle, PlanData, StringMap};
use std::collections::BTreeMap;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Create,
    Read,
    Update,
    Delete,
}

impl Action {
    fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Read => "read",
            Action::Update => "update",
            Action::Delete => "delete",
        }
    }
}

/// Stdout contract of the apply-style subcommands
#[derive(Debug, Serialize)]
pub struct ApplySummary {
    pub operation: &'static str,
    pub id: String,
    pub provisioned: bool,
    pub replaced: bool,
    pub state: StringMap,
    pub output: StringMap,
    pub trigger: bool,
}

impl ApplySummary {
    fn new(action: Action, data: &ApplyData, replaced: bool) -> Self {
        Self {
            operation: action.as_str(),
            id: data.id.clone(),
            provisioned: data.is_provisioned(),
            replaced,
            state: data.state.new.clone(),
            output: data.output.clone(),
            trigger: data.trigger.new,
        }
    }
}

/// Run one apply-style operation and persist the resulting snapshot
///
/// When the engine rolled the resource back after a failure, the cleared
/// snapshot is persisted before the error is returned.
#[instrument(skip(args), fields(record = %args.record.display()))]
pub fn apply(action: Action, args: ResourceArgs) -> Result<()> {
    let engine = load_engine(&args)?;
    let record = load_record(&args)?;
    match action {
        Action::Create if record.is_provisioned() => bail!(
            "Resource {} is already provisioned; use `update` instead",
            record.id
        ),
        Action::Update if !record.is_provisioned() => {
            bail!("Resource is not provisioned; use `create` first")
        }
        _ => {}
    }

    let mut data = record.to_apply_data(&args.overrides);
    let replaced = match run_action(&engine, action, &mut data) {
        Ok(replaced) => replaced,
        Err(err) => {
            let rolled_back = matches!(action, Action::Create | Action::Update);
            if rolled_back && !data.is_provisioned() {
                warn!("{} failed; recording rolled back resource", action.as_str());
                if let Err(save_err) = ResourceRecord::from_apply(&data).save(&args.record) {
                    warn!("Failed to record rollback: {:#}", save_err);
                }
            }
            return Err(err);
        }
    };

    ResourceRecord::from_apply(&data).save(&args.record)?;
    print_json(&ApplySummary::new(action, &data, replaced))
}

fn run_action(engine: &Lifecycle, action: Action, data: &mut ApplyData) -> Result<bool> {
    match action {
        Action::Create => engine.create(data)?,
        Action::Read => engine.read(data)?,
        Action::Update => return update_or_replace(engine, data),
        Action::Delete => {
            if data.is_provisioned() {
                engine.delete(data)?;
            } else {
                info!("Resource is not provisioned; nothing to delete");
            }
        }
    }
    Ok(false)
}

/// Probe the change first; a forced replacement is a delete followed by a create
fn update_or_replace(engine: &Lifecycle, data: &mut ApplyData) -> Result<bool> {
    let mut plan = PlanData::from_apply(data);
    engine.customize_diff(&mut plan)?;
    data.trigger = plan.trigger;

    if plan.forces_new(Field::Trigger) {
        info!(id = %data.id, "Replacing resource");
        engine.delete(data)?;
        data.state.old.clear();
        engine.create(data)?;
        return Ok(true);
    }
    engine.update(data)?;
    Ok(false)
}

/// Run the exists probe and print `{"exists": bool}`
#[instrument(skip(args), fields(record = %args.record.display()))]
pub fn exists(args: ResourceArgs) -> Result<()> {
    let engine = load_engine(&args)?;
    let record = load_record(&args)?;
    let mut data = record.to_apply_data(&args.overrides);

    let exists = record.is_provisioned() && engine.exists(&mut data)?;
    if record.is_provisioned() && !data.is_provisioned() {
        // The probe cleared the resource; forget the old identity.
        let mut forgotten = record.clone();
        forgotten.id.clear();
        forgotten.state.clear();
        forgotten.output.clear();
        forgotten.save(&args.record)?;
    }

    let mut summary = BTreeMap::new();
    summary.insert("exists", exists);
    print_json(&summary)
}
