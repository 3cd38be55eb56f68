//! Process environment assembly
//!
//! Each declared entry is a template rendered separately for the old and
//! the new epoch. A failure in the new view aborts; a failure in the old
//! view degrades to an `<ERROR: ...>` placeholder so cleanup commands still
//! run when the entry references something that no longer exists.

use crate::change_map::{ChangeMap, Epoch, StringMap};
use crate::errors::Result;
use crate::redaction::SecretRegistry;
use crate::templates::{OnError, TemplateContext, TemplateRenderer};
use std::collections::BTreeSet;
use tracing::trace;

/// Rendered old/new environments of one invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuiltEnvironment {
    /// Complete child environments
    pub views: ChangeMap,
    /// Keys that came from non-sensitive declarations
    declared: BTreeSet<String>,
}

impl BuiltEnvironment {
    pub fn view(&self, epoch: Epoch) -> &StringMap {
        self.views.view(epoch)
    }

    /// Rendered new values of non-sensitive declared entries
    ///
    /// Inherited and sensitive values are left out so the derived id is
    /// stable across hosts and never depends on a secret.
    pub fn declared_new(&self) -> StringMap {
        self.declared
            .iter()
            .filter_map(|key| {
                self.views
                    .new
                    .get(key)
                    .map(|value| (key.clone(), value.clone()))
            })
            .collect()
    }
}

/// Builds a [`BuiltEnvironment`] from declared entries
#[derive(Debug)]
pub struct EnvironmentBuilder<'a> {
    renderer: &'a TemplateRenderer,
    inherited: Option<StringMap>,
    old_prefix: Option<&'a str>,
    new_prefix: Option<&'a str>,
}

impl<'a> EnvironmentBuilder<'a> {
    pub fn new(renderer: &'a TemplateRenderer) -> Self {
        Self {
            renderer,
            inherited: None,
            old_prefix: None,
            new_prefix: None,
        }
    }

    /// Seed both views with these variables for keys not declared
    pub fn inherit(mut self, parent: StringMap) -> Self {
        self.inherited = Some(parent);
        self
    }

    /// Mirror declared entries under prefixed keys in both views
    pub fn mirror(mut self, old_prefix: Option<&'a str>, new_prefix: Option<&'a str>) -> Self {
        self.old_prefix = old_prefix.filter(|p| !p.is_empty());
        self.new_prefix = new_prefix.filter(|p| !p.is_empty());
        self
    }

    /// Render `declared` and `sensitive` for both epochs
    ///
    /// `ctx` must not carry an environment; entries cannot reference each
    /// other. Rendered sensitive values are added to `secrets`.
    pub fn build(
        &self,
        ctx: &TemplateContext<'_>,
        declared: &ChangeMap,
        sensitive: &ChangeMap,
        secrets: &SecretRegistry,
    ) -> Result<BuiltEnvironment> {
        let mut built = BuiltEnvironment::default();

        for epoch in [Epoch::Old, Epoch::New] {
            let ctx = ctx.at(epoch);
            let mut view = StringMap::new();

            for (key, template) in declared.view(epoch) {
                let value = self.render_entry(key, template, &ctx)?;
                view.insert(key.clone(), value);
                built.declared.insert(key.clone());
            }
            for (key, template) in sensitive.view(epoch) {
                let value = self.render_entry(key, template, &ctx)?;
                secrets.add_secret(&value);
                built.declared.remove(key);
                view.insert(key.clone(), value);
            }
            *built.views.view_mut(epoch) = view;
        }
        // a key declared sensitive in either epoch stays out of the hash
        for key in sensitive.old.keys().chain(sensitive.new.keys()) {
            built.declared.remove(key);
        }

        let mirrors: Vec<(String, String)> = [(Epoch::Old, self.old_prefix), (Epoch::New, self.new_prefix)]
            .into_iter()
            .filter_map(|(epoch, prefix)| prefix.map(|p| (epoch, p)))
            .flat_map(|(epoch, prefix)| {
                built
                    .view(epoch)
                    .iter()
                    .map(move |(k, v)| (format!("{}{}", prefix, k), v.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();
        for (key, value) in mirrors {
            built.views.old.insert(key.clone(), value.clone());
            built.views.new.insert(key, value);
        }

        if let Some(parent) = &self.inherited {
            for epoch in [Epoch::Old, Epoch::New] {
                let view = built.views.view_mut(epoch);
                for (key, value) in parent {
                    view.entry(key.clone()).or_insert_with(|| value.clone());
                }
            }
        }

        trace!(
            old = built.views.old.len(),
            new = built.views.new.len(),
            "Built environment"
        );
        Ok(built)
    }

    fn render_entry(&self, key: &str, template: &str, ctx: &TemplateContext<'_>) -> Result<String> {
        if !self.renderer.is_templated(template) {
            return Ok(template.to_string());
        }
        self.renderer
            .render_with(&format!("env.{}", key), template, ctx, OnError::Placeholder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TemplateSyntax;
    use crate::errors::{ShellresError, TemplateError};
    use crate::templates::Sentinels;

    fn map(pairs: &[(&str, &str)]) -> StringMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    struct Fixture {
        renderer: TemplateRenderer,
        context: ChangeMap,
        state: ChangeMap,
        output: StringMap,
        sentinels: Sentinels,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                renderer: TemplateRenderer::new(&TemplateSyntax::default()).unwrap(),
                context: ChangeMap::new(map(&[("name", "a")]), map(&[("name", "b")])),
                state: ChangeMap::default(),
                output: StringMap::new(),
                sentinels: Sentinels::generate(None),
            }
        }

        fn ctx(&self) -> TemplateContext<'_> {
            TemplateContext::new(
                "create",
                Epoch::New,
                &self.context,
                &self.state,
                &self.output,
                &self.sentinels,
            )
        }
    }

    #[test]
    fn test_entries_render_per_epoch() {
        let fx = Fixture::new();
        let declared = ChangeMap::unchanged(map(&[("FILE", "/tmp/{{ name }}"), ("PLAIN", "x")]));
        let built = EnvironmentBuilder::new(&fx.renderer)
            .build(&fx.ctx(), &declared, &ChangeMap::default(), &SecretRegistry::new())
            .unwrap();
        assert_eq!(built.view(Epoch::Old)["FILE"], "/tmp/a");
        assert_eq!(built.view(Epoch::New)["FILE"], "/tmp/b");
        assert_eq!(built.view(Epoch::New)["PLAIN"], "x");
    }

    #[test]
    fn test_inherited_never_overrides_declared() {
        let fx = Fixture::new();
        let declared = ChangeMap::unchanged(map(&[("HOME", "/declared")]));
        let built = EnvironmentBuilder::new(&fx.renderer)
            .inherit(map(&[("HOME", "/parent"), ("PATH", "/bin")]))
            .build(&fx.ctx(), &declared, &ChangeMap::default(), &SecretRegistry::new())
            .unwrap();
        assert_eq!(built.view(Epoch::New)["HOME"], "/declared");
        assert_eq!(built.view(Epoch::Old)["PATH"], "/bin");
        assert_eq!(built.declared_new(), map(&[("HOME", "/declared")]));
    }

    #[test]
    fn test_prefixed_mirrors_in_both_views() {
        let fx = Fixture::new();
        let declared = ChangeMap::unchanged(map(&[("NAME", "{{ name }}")]));
        let built = EnvironmentBuilder::new(&fx.renderer)
            .mirror(Some("OLD_"), Some("NEW_"))
            .build(&fx.ctx(), &declared, &ChangeMap::default(), &SecretRegistry::new())
            .unwrap();
        for epoch in [Epoch::Old, Epoch::New] {
            assert_eq!(built.view(epoch)["OLD_NAME"], "a");
            assert_eq!(built.view(epoch)["NEW_NAME"], "b");
        }
        assert_eq!(built.view(Epoch::Old)["NAME"], "a");
    }

    #[test]
    fn test_old_view_error_degrades_new_view_error_fails() {
        let fx = Fixture::new();
        let broken = "{{ from_json('nope') }}";
        let declared = ChangeMap::new(map(&[("X", broken)]), map(&[("X", "fine")]));
        let built = EnvironmentBuilder::new(&fx.renderer)
            .build(&fx.ctx(), &declared, &ChangeMap::default(), &SecretRegistry::new())
            .unwrap();
        assert!(built.view(Epoch::Old)["X"].starts_with("<ERROR: "));

        let declared = ChangeMap::new(map(&[("X", "fine")]), map(&[("X", broken)]));
        let err = EnvironmentBuilder::new(&fx.renderer)
            .build(&fx.ctx(), &declared, &ChangeMap::default(), &SecretRegistry::new())
            .unwrap_err();
        assert!(matches!(
            err,
            ShellresError::Template(TemplateError::Render { ref name, .. }) if name == "env.X"
        ));
    }

    #[test]
    fn test_sensitive_values_registered_and_excluded() {
        let fx = Fixture::new();
        let secrets = SecretRegistry::new();
        let declared = ChangeMap::unchanged(map(&[("USER", "me")]));
        let sensitive = ChangeMap::unchanged(map(&[("TOKEN", "tok-{{ name }}-secret")]));
        let built = EnvironmentBuilder::new(&fx.renderer)
            .build(&fx.ctx(), &declared, &sensitive, &secrets)
            .unwrap();
        assert_eq!(built.view(Epoch::New)["TOKEN"], "tok-b-secret");
        assert_eq!(secrets.redact_text("x tok-a-secret tok-b-secret"), "x **** ****");
        assert_eq!(built.declared_new(), map(&[("USER", "me")]));
    }
}
