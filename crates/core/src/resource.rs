//! Host capability interface
//!
//! The lifecycle engine never talks to the host directly. It works through
//! [`ResourceAccess`], which has two implementations:
//!
//! - [`ApplyData`] for create/read/update/delete/exists, which may assign the
//!   id and write output and state;
//! - [`PlanData`] for diff-customization, which may flip the trigger and
//!   mark fields for recomputation but never touches id, output or state.
//!
//! Calling a capability the variant does not carry returns
//! [`ShellresError::Unsupported`].

use crate::change_map::{ChangeMap, StringMap};
use crate::errors::{Result, ShellresError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Which kind of host call is in progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    Apply,
    Plan,
}

impl AccessMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessMode::Apply => "apply",
            AccessMode::Plan => "plan",
        }
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Host-visible fields the engine can ask the host to recompute or replace
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Field {
    Output,
    State,
    Trigger,
}

impl Field {
    pub fn as_str(&self) -> &'static str {
        match self {
            Field::Output => "output",
            Field::State => "state",
            Field::Trigger => "trigger",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Old and new value of the boolean trigger field
///
/// Diff-customization flips `new` relative to `old` to force the host to
/// see a change even when no declared field changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeFlag {
    pub old: bool,
    pub new: bool,
}

impl ChangeFlag {
    pub fn unchanged(value: bool) -> Self {
        Self {
            old: value,
            new: value,
        }
    }

    pub fn has_change(&self) -> bool {
        self.old != self.new
    }
}

/// Capabilities the lifecycle engine needs from the host
///
/// Readers are available in every mode. Writers default to
/// [`ShellresError::Unsupported`]; each variant overrides the ones its mode
/// carries.
pub trait ResourceAccess {
    fn mode(&self) -> AccessMode;

    /// User-declared template inputs
    fn context(&self) -> &ChangeMap;

    /// Declared environment entries (unrendered templates)
    fn environment(&self) -> &ChangeMap;

    /// Declared environment entries whose rendered values are secret
    fn sensitive_environment(&self) -> &ChangeMap;

    /// Engine-persisted state
    fn state(&self) -> &ChangeMap;

    /// Current resource id; empty when the resource is not provisioned
    fn id(&self) -> &str;

    /// Output of the most recent read
    fn output(&self) -> &StringMap;

    fn trigger(&self) -> ChangeFlag;

    fn set_id(&mut self, _id: String) -> Result<()> {
        Err(self.unsupported("set_id"))
    }

    fn set_output(&mut self, _output: StringMap) -> Result<()> {
        Err(self.unsupported("set_output"))
    }

    /// Replace the new state snapshot
    fn set_state(&mut self, _state: StringMap) -> Result<()> {
        Err(self.unsupported("set_state"))
    }

    fn set_trigger(&mut self, _value: bool) -> Result<()> {
        Err(self.unsupported("set_trigger"))
    }

    /// Ask the host to treat `field` as unknown until apply
    fn mark_computed(&mut self, _field: Field) -> Result<()> {
        Err(self.unsupported("mark_computed"))
    }

    /// Ask the host to replace the resource because `field` changes
    fn force_new(&mut self, _field: Field) -> Result<()> {
        Err(self.unsupported("force_new"))
    }

    #[doc(hidden)]
    fn unsupported(&self, operation: &'static str) -> ShellresError {
        ShellresError::Unsupported {
            operation,
            mode: self.mode(),
        }
    }
}

/// Clear id, output and state, leaving the resource unprovisioned
pub fn clear_resource(data: &mut dyn ResourceAccess) -> Result<()> {
    data.set_id(String::new())?;
    data.set_output(StringMap::new())?;
    data.set_state(StringMap::new())?;
    Ok(())
}

/// Resource data during create/read/update/delete/exists
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplyData {
    pub context: ChangeMap,
    pub environment: ChangeMap,
    pub sensitive_environment: ChangeMap,
    pub state: ChangeMap,
    pub id: String,
    pub output: StringMap,
    pub trigger: ChangeFlag,
}

impl ApplyData {
    pub fn new(context: ChangeMap) -> Self {
        Self {
            context,
            ..Self::default()
        }
    }

    /// Whether an id is assigned
    pub fn is_provisioned(&self) -> bool {
        !self.id.is_empty()
    }
}

impl ResourceAccess for ApplyData {
    fn mode(&self) -> AccessMode {
        AccessMode::Apply
    }

    fn context(&self) -> &ChangeMap {
        &self.context
    }

    fn environment(&self) -> &ChangeMap {
        &self.environment
    }

    fn sensitive_environment(&self) -> &ChangeMap {
        &self.sensitive_environment
    }

    fn state(&self) -> &ChangeMap {
        &self.state
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn output(&self) -> &StringMap {
        &self.output
    }

    fn trigger(&self) -> ChangeFlag {
        self.trigger
    }

    fn set_id(&mut self, id: String) -> Result<()> {
        self.id = id;
        Ok(())
    }

    fn set_output(&mut self, output: StringMap) -> Result<()> {
        self.output = output;
        Ok(())
    }

    fn set_state(&mut self, state: StringMap) -> Result<()> {
        self.state.new = state;
        Ok(())
    }
}

/// Resource data during diff-customization
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanData {
    pub context: ChangeMap,
    pub environment: ChangeMap,
    pub sensitive_environment: ChangeMap,
    pub state: ChangeMap,
    pub id: String,
    pub output: StringMap,
    pub trigger: ChangeFlag,
    computed: BTreeSet<Field>,
    replaced: BTreeSet<Field>,
}

impl PlanData {
    /// Plan against the persisted values of an applied resource
    pub fn from_apply(data: &ApplyData) -> Self {
        Self {
            context: data.context.clone(),
            environment: data.environment.clone(),
            sensitive_environment: data.sensitive_environment.clone(),
            state: data.state.clone(),
            id: data.id.clone(),
            output: data.output.clone(),
            trigger: data.trigger,
            computed: BTreeSet::new(),
            replaced: BTreeSet::new(),
        }
    }

    /// Fields marked for recomputation
    pub fn computed_fields(&self) -> impl Iterator<Item = Field> + '_ {
        self.computed.iter().copied()
    }

    pub fn is_computed(&self, field: Field) -> bool {
        self.computed.contains(&field)
    }

    /// Whether a change to `field` forces replacement
    pub fn forces_new(&self, field: Field) -> bool {
        self.replaced.contains(&field)
    }

    /// Whether the host will see any change for this resource
    pub fn has_change(&self) -> bool {
        self.context.has_change()
            || self.environment.has_change()
            || self.sensitive_environment.has_change()
            || self.trigger.has_change()
            || !self.computed.is_empty()
    }
}

impl ResourceAccess for PlanData {
    fn mode(&self) -> AccessMode {
        AccessMode::Plan
    }

    fn context(&self) -> &ChangeMap {
        &self.context
    }

    fn environment(&self) -> &ChangeMap {
        &self.environment
    }

    fn sensitive_environment(&self) -> &ChangeMap {
        &self.sensitive_environment
    }

    fn state(&self) -> &ChangeMap {
        &self.state
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn output(&self) -> &StringMap {
        &self.output
    }

    fn trigger(&self) -> ChangeFlag {
        self.trigger
    }

    fn set_trigger(&mut self, value: bool) -> Result<()> {
        self.trigger.new = value;
        Ok(())
    }

    fn mark_computed(&mut self, field: Field) -> Result<()> {
        self.computed.insert(field);
        Ok(())
    }

    fn force_new(&mut self, field: Field) -> Result<()> {
        self.replaced.insert(field);
        Ok(())
    }
}
