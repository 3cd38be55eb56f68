//! Resource lifecycle
//!
//! [`Lifecycle`] implements the host entry points (create, read, update,
//! delete, exists, customize_diff) as short sequences of render, execute
//! and parse steps.
//!
//! Ordering rules shared by the entry points:
//! - the dependency probe runs first; when it is not met the entry point
//!   returns `Ok` without doing anything else;
//! - a failure anywhere inside create or update clears id, output and state
//!   before the error is returned, so a half-applied resource is never left
//!   addressable;
//! - read only clears the resource under `delete_on_read_failure`;
//! - delete renders against the old snapshot and only clears local data
//!   once the delete command succeeded.

use crate::change_map::{Epoch, StringMap};
use crate::command::CommandExecutor;
use crate::config::{OutputFormat, ProviderConfig};
use crate::context::{Operation, ResourceContext};
use crate::errors::Result;
use crate::identity::{derive_id, id_from_output};
use crate::output::{parse_lines, ParseOptions};
use crate::resource::{clear_resource, Field, ResourceAccess};
use crate::scoped_log::{LogStack, Logger};
use crate::templates::{OnError, Sentinels, StateValue, TemplateRenderer};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{instrument, Span};

/// Process-wide invocation counter used as log correlation id
static INVOCATIONS: AtomicU64 = AtomicU64::new(1);

/// Result of comparing a probe command's output with its marker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Output equals the marker
    Matched,
    /// Output differs from the marker
    Unmatched,
    /// The probe command could not run or exited unsuccessfully
    Failed,
}

/// The command lifecycle engine for one provider
#[derive(Debug)]
pub struct Lifecycle {
    config: ProviderConfig,
    renderer: TemplateRenderer,
    executor: CommandExecutor,
    sentinels: Sentinels,
    log: Logger,
}

impl Lifecycle {
    /// Build an engine logging through the sinks described by `config.log`
    pub fn new(config: ProviderConfig) -> Result<Self> {
        let log = config.log.build_logger()?;
        Self::with_logger(config, log)
    }

    /// Build an engine logging through `log`
    pub fn with_logger(config: ProviderConfig, log: Logger) -> Result<Self> {
        config.validate()?;
        let renderer = TemplateRenderer::new(&config.syntax)?;
        let executor = CommandExecutor::from_config(&config)?;
        let sentinels = Sentinels::generate(config.output_line_prefix.as_deref());
        Ok(Self {
            config,
            renderer,
            executor,
            sentinels,
            log,
        })
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub fn sentinels(&self) -> &Sentinels {
        &self.sentinels
    }

    fn begin(&self, operation: Operation) -> ResourceContext<'_> {
        let invocation = INVOCATIONS.fetch_add(1, Ordering::Relaxed);
        Span::current().record("invocation", invocation);
        let root = self
            .log
            .with_forked_secrets()
            .child(&[
                ("invocation", invocation.to_string()),
                ("operation", operation.as_str().to_string()),
            ]);
        ResourceContext::new(
            operation,
            invocation,
            &self.config,
            &self.renderer,
            &self.executor,
            &self.sentinels,
            LogStack::new(root),
        )
    }

    /// Provision the resource
    #[instrument(skip_all, fields(invocation = tracing::field::Empty))]
    pub fn create(&self, data: &mut dyn ResourceAccess) -> Result<()> {
        let ctx = self.begin(Operation::Create);
        if !self.dependencies_met(&ctx, data)? {
            ctx.log.info("Dependencies not met; skipping create");
            return Ok(());
        }
        let result = self.create_inner(&ctx, data);
        self.rollback_on_error(&ctx, data, result)
    }

    /// Refresh the output map from the read command
    #[instrument(skip_all, fields(invocation = tracing::field::Empty))]
    pub fn read(&self, data: &mut dyn ResourceAccess) -> Result<()> {
        let ctx = self.begin(Operation::Read);
        match self.read_inner(&ctx, data) {
            Err(err) if err.is_command_failure() && self.config.delete_on_read_failure => {
                ctx.log
                    .warn(&format!("Read failed; treating resource as gone: {}", err));
                clear_resource(data)
            }
            other => other,
        }
    }

    /// Apply a change to an existing resource
    #[instrument(skip_all, fields(invocation = tracing::field::Empty))]
    pub fn update(&self, data: &mut dyn ResourceAccess) -> Result<()> {
        let ctx = self.begin(Operation::Update);
        if !self.dependencies_met(&ctx, data)? {
            ctx.log.info("Dependencies not met; skipping update");
            return Ok(());
        }
        let result = self.update_inner(&ctx, data);
        self.rollback_on_error(&ctx, data, result)
    }

    /// Destroy the resource
    #[instrument(skip_all, fields(invocation = tracing::field::Empty))]
    pub fn delete(&self, data: &mut dyn ResourceAccess) -> Result<()> {
        let ctx = self.begin(Operation::Delete);
        self.delete_inner(&ctx, data)
    }

    /// Whether the external entity still exists
    #[instrument(skip_all, fields(invocation = tracing::field::Empty))]
    pub fn exists(&self, data: &mut dyn ResourceAccess) -> Result<bool> {
        let ctx = self.begin(Operation::Exists);
        let Some(template) = self.config.commands.exists.as_deref() else {
            return Ok(true);
        };
        let outcome = self.probe(
            &ctx,
            data,
            "exists",
            template,
            &self.config.exists_missing_marker,
        )?;
        let exists = outcome == ProbeOutcome::Unmatched;
        if !exists {
            ctx.log.info(&format!("Resource does not exist ({:?})", outcome));
            if self.config.delete_on_not_exists {
                clear_resource(data)?;
            }
        }
        Ok(exists)
    }

    /// Pre-apply probes
    ///
    /// Flips the trigger when `needs_update` matches, forces replacement when
    /// `needs_delete` matches, and marks output and state for recomputation
    /// whenever the apply will change anything.
    #[instrument(skip_all, fields(invocation = tracing::field::Empty))]
    pub fn customize_diff(&self, data: &mut dyn ResourceAccess) -> Result<()> {
        let ctx = self.begin(Operation::CustomizeDiff);
        if data.id().is_empty() {
            ctx.log.debug("Resource not provisioned; nothing to probe");
            return Ok(());
        }
        if !self.dependencies_met(&ctx, data)? {
            ctx.log.info("Dependencies not met; leaving plan unchanged");
            return Ok(());
        }

        let commands = &self.config.commands;
        let mut changed = data.context().has_change()
            || data.environment().has_change()
            || data.sensitive_environment().has_change();

        if let Some(template) = commands.needs_delete.as_deref() {
            let outcome =
                self.probe(&ctx, data, "needs_delete", template, &self.config.needs_delete_marker)?;
            if outcome == ProbeOutcome::Matched {
                ctx.log.info("Probe requested replacement");
                data.force_new(Field::Trigger)?;
                data.set_trigger(!data.trigger().old)?;
                changed = true;
            }
        }
        if let Some(template) = commands.needs_update.as_deref() {
            let outcome =
                self.probe(&ctx, data, "needs_update", template, &self.config.needs_update_marker)?;
            if outcome == ProbeOutcome::Matched && !data.trigger().has_change() {
                ctx.log.info("Probe requested update");
                data.set_trigger(!data.trigger().old)?;
                changed = true;
            }
        }

        if changed {
            data.mark_computed(Field::Output)?;
            data.mark_computed(Field::State)?;
        }
        Ok(())
    }

    fn create_inner(&self, ctx: &ResourceContext<'_>, data: &mut dyn ResourceAccess) -> Result<()> {
        let commands = &self.config.commands;
        if let Some(template) = commands.create.as_deref() {
            let stdout = ctx.execute(data, "create", &self.modify_sources(template), Epoch::New)?;
            self.sync_state(ctx, data, &stdout)?;
            self.assign_id(ctx, data)?;
            self.read_inner(ctx, data)
        } else if commands.update.is_some() {
            ctx.log.debug("No create command; delegating to update");
            self.update_inner(ctx, data)
        } else {
            ctx.log.debug("No create or update command; idling resource");
            data.set_state(StringMap::new())?;
            self.assign_id(ctx, data)?;
            self.read_inner(ctx, data)
        }
    }

    fn update_inner(&self, ctx: &ResourceContext<'_>, data: &mut dyn ResourceAccess) -> Result<()> {
        let Some(template) = self.config.commands.update.as_deref() else {
            ctx.log.debug("No update command; replacing resource");
            self.delete_inner(ctx, data)?;
            data.set_state(StringMap::new())?;
            return self.create_inner(ctx, data);
        };
        let stdout = ctx.execute(data, "update", &self.modify_sources(template), Epoch::New)?;
        self.sync_state(ctx, data, &stdout)?;
        self.assign_id(ctx, data)?;
        self.read_inner(ctx, data)
    }

    fn read_inner(&self, ctx: &ResourceContext<'_>, data: &mut dyn ResourceAccess) -> Result<()> {
        let Some(template) = self.config.commands.read.as_deref() else {
            return data.set_output(StringMap::new());
        };
        let stdout = ctx.execute(data, "read", &[template], Epoch::New)?;
        self.sync_state(ctx, data, &stdout)?;

        let options = ParseOptions::new(self.config.output_format)
            .prefix(&self.sentinels.output_prefix)
            .except_prefix(&self.sentinels.state_prefix);
        let output = parse_lines(&stdout, &options, &ctx.log.current());
        ctx.log.debug(&format!("Read {} output values", output.len()));
        data.set_output(output)
    }

    fn delete_inner(&self, ctx: &ResourceContext<'_>, data: &mut dyn ResourceAccess) -> Result<()> {
        if let Some(template) = self.config.commands.delete.as_deref() {
            let script =
                ctx.render_script(data, "delete", &[template], Epoch::Old, OnError::Placeholder)?;
            if script.trim().is_empty() {
                ctx.log.debug("Delete command rendered empty; nothing to run");
            } else {
                ctx.run_script(data, "delete", &script, Epoch::Old)?;
            }
        }
        clear_resource(data)
    }

    /// Merge state lines of `stdout` into the new state snapshot
    fn sync_state(
        &self,
        ctx: &ResourceContext<'_>,
        data: &mut dyn ResourceAccess,
        stdout: &str,
    ) -> Result<()> {
        let options =
            ParseOptions::new(OutputFormat::Raw).prefix(&self.sentinels.state_prefix);
        let lines = parse_lines(stdout, &options, &ctx.log.current());
        if lines.is_empty() {
            return Ok(());
        }

        let mut state = data.state().new.clone();
        for (key, raw) in lines {
            match StateValue::decode(raw, &self.sentinels) {
                StateValue::Present(value) => {
                    state.insert(key, value);
                }
                StateValue::Absent => {
                    state.remove(&key);
                }
            }
        }
        data.set_state(state)
    }

    fn assign_id(&self, ctx: &ResourceContext<'_>, data: &mut dyn ResourceAccess) -> Result<()> {
        let declared = match self.config.commands.id.as_deref() {
            Some(template) => id_from_output(&ctx.execute(data, "id", &[template], Epoch::New)?),
            None => None,
        };
        let id = match declared {
            Some(id) => id,
            None => {
                let environment = ctx.environment(data)?.declared_new();
                derive_id(&data.context().new, &data.state().new, &environment)
            }
        };
        ctx.log.debug(&format!("Assigned id {}", id));
        data.set_id(id)
    }

    fn dependencies_met(&self, ctx: &ResourceContext<'_>, data: &dyn ResourceAccess) -> Result<bool> {
        let Some(template) = self.config.commands.dependencies.as_deref() else {
            return Ok(true);
        };
        let outcome = self.probe(
            ctx,
            data,
            "dependencies",
            template,
            &self.config.dependencies_met_marker,
        )?;
        Ok(outcome == ProbeOutcome::Matched)
    }

    /// Run a probe and compare its trimmed output with `marker`
    ///
    /// Command failures are an outcome, not an error; template errors still
    /// propagate.
    fn probe(
        &self,
        ctx: &ResourceContext<'_>,
        data: &dyn ResourceAccess,
        stage: &str,
        template: &str,
        marker: &str,
    ) -> Result<ProbeOutcome> {
        let script = ctx.render_script(data, stage, &[template], Epoch::New, OnError::Fail)?;
        let outcome = match ctx.run_script(data, stage, &script, Epoch::New) {
            Ok(stdout) if stdout.trim() == marker.trim() => ProbeOutcome::Matched,
            Ok(_) => ProbeOutcome::Unmatched,
            Err(err) if err.is_command_failure() => {
                ctx.log.warn(&format!("{} probe failed: {}", stage, err));
                ProbeOutcome::Failed
            }
            Err(err) => return Err(err),
        };
        ctx.log.debug(&format!("{} probe: {:?}", stage, outcome));
        Ok(outcome)
    }

    fn modify_sources<'t>(&'t self, template: &'t str) -> Vec<&'t str> {
        match self.config.commands.modify_prefix.as_deref() {
            Some(prefix) => vec![prefix, template],
            None => vec![template],
        }
    }

    fn rollback_on_error(
        &self,
        ctx: &ResourceContext<'_>,
        data: &mut dyn ResourceAccess,
        result: Result<()>,
    ) -> Result<()> {
        let Err(err) = result else {
            return Ok(());
        };
        ctx.log
            .error(&format!("{} failed; rolling back: {}", ctx.operation(), err));
        if let Err(clear_err) = clear_resource(data) {
            ctx.log.warn(&format!("Rollback incomplete: {}", clear_err));
        }
        Err(err)
    }
}
