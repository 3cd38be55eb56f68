//! Per-invocation resource context
//!
//! A [`ResourceContext`] lives for exactly one lifecycle entry point. It
//! owns the invocation's log stack and the lazily built environment, and
//! knows how to turn a command template into executed output.

use crate::change_map::Epoch;
use crate::command::{CommandExecutor, Invocation};
use crate::config::ProviderConfig;
use crate::environment::{BuiltEnvironment, EnvironmentBuilder};
use crate::errors::Result;
use crate::redaction::SecretRegistry;
use crate::resource::ResourceAccess;
use crate::scoped_log::LogStack;
use crate::templates::{OnError, Sentinels, TemplateContext, TemplateRenderer};
use once_cell::unsync::OnceCell;
use std::fmt;

/// Host-invoked entry point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Read,
    Update,
    Delete,
    Exists,
    CustomizeDiff,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Read => "read",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::Exists => "exists",
            Operation::CustomizeDiff => "customize_diff",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of one lifecycle invocation
pub struct ResourceContext<'a> {
    pub(crate) operation: Operation,
    pub(crate) invocation: u64,
    pub(crate) config: &'a ProviderConfig,
    pub(crate) renderer: &'a TemplateRenderer,
    pub(crate) executor: &'a CommandExecutor,
    pub(crate) sentinels: &'a Sentinels,
    pub(crate) log: LogStack,
    environment: OnceCell<BuiltEnvironment>,
}

impl<'a> ResourceContext<'a> {
    pub(crate) fn new(
        operation: Operation,
        invocation: u64,
        config: &'a ProviderConfig,
        renderer: &'a TemplateRenderer,
        executor: &'a CommandExecutor,
        sentinels: &'a Sentinels,
        log: LogStack,
    ) -> Self {
        Self {
            operation,
            invocation,
            config,
            renderer,
            executor,
            sentinels,
            log,
            environment: OnceCell::new(),
        }
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn invocation(&self) -> u64 {
        self.invocation
    }

    pub fn log(&self) -> &LogStack {
        &self.log
    }

    fn secrets(&self) -> SecretRegistry {
        self.log.current().redaction().registry.clone()
    }

    /// The environment, built on first use and reused afterwards
    pub fn environment(&self, data: &dyn ResourceAccess) -> Result<&BuiltEnvironment> {
        self.environment.get_or_try_init(|| {
            let ctx = TemplateContext::new(
                self.operation.as_str(),
                Epoch::New,
                data.context(),
                data.state(),
                data.output(),
                self.sentinels,
            );
            let mut builder = EnvironmentBuilder::new(self.renderer).mirror(
                self.config.environment_old_prefix.as_deref(),
                self.config.environment_new_prefix.as_deref(),
            );
            if self.config.inherit_environment {
                builder = builder.inherit(std::env::vars().collect());
            }
            let built = builder.build(
                &ctx,
                data.environment(),
                data.sensitive_environment(),
                &self.secrets(),
            )?;
            self.log.debug(&format!(
                "Environment built with {} variables",
                built.view(Epoch::New).len()
            ));
            Ok(built)
        })
    }

    /// Join `sources` and render them as one script for `stage`
    pub fn render_script(
        &self,
        data: &dyn ResourceAccess,
        stage: &str,
        sources: &[&str],
        epoch: Epoch,
        on_error: OnError,
    ) -> Result<String> {
        let environment = self.environment(data)?;
        let source = self.executor.join(sources);
        let ctx = TemplateContext::new(
            stage,
            epoch,
            data.context(),
            data.state(),
            data.output(),
            self.sentinels,
        )
        .with_environment(environment.view(epoch));
        self.renderer.render_with(stage, &source, &ctx, on_error)
    }

    /// Run an already rendered script and return its stdout
    pub fn run_script(
        &self,
        data: &dyn ResourceAccess,
        stage: &str,
        script: &str,
        epoch: Epoch,
    ) -> Result<String> {
        let guard = self.log.scope(&[("stage", stage)]);
        let environment = self.environment(data)?;
        let ctx = TemplateContext::new(
            stage,
            epoch,
            data.context(),
            data.state(),
            data.output(),
            self.sentinels,
        )
        .with_environment(environment.view(epoch));
        let argv = self.executor.resolve_argv(script, self.renderer, &ctx)?;
        self.executor.run(
            Invocation {
                stage,
                argv,
                script,
                environment: environment.view(epoch),
                resource_id: data.id(),
            },
            guard.logger(),
        )
    }

    /// Render and run `sources` as one command
    pub fn execute(
        &self,
        data: &dyn ResourceAccess,
        stage: &str,
        sources: &[&str],
        epoch: Epoch,
    ) -> Result<String> {
        let script = self.render_script(data, stage, sources, epoch, OnError::Fail)?;
        self.run_script(data, stage, &script, epoch)
    }
}

impl fmt::Debug for ResourceContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceContext")
            .field("operation", &self.operation)
            .field("invocation", &self.invocation)
            .field("environment_built", &self.environment.get().is_some())
            .finish()
    }
}
