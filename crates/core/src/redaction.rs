//! Sensitive value redaction
//!
//! Values of the sensitive environment are registered here when the
//! environment is built. Every log record and every command error passes
//! through [`SecretRegistry::redact_text`] before it leaves the engine.

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};

/// Minimum length for a value to be considered for redaction
///
/// Shorter values would match all over unrelated text.
const MIN_REDACTION_LENGTH: usize = 4;

/// Replacement text for redacted secrets
pub const REDACTION_PLACEHOLDER: &str = "****";

/// Thread-safe registry of secret strings
///
/// Clones share the same underlying set, so a registry handed to the
/// executor's reader threads sees secrets registered later by the caller.
#[derive(Debug, Clone, Default)]
pub struct SecretRegistry {
    inner: Arc<RwLock<BTreeSet<String>>>,
}

impl SecretRegistry {
    /// Create a new empty secret registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a secret value to the registry
    ///
    /// Values shorter than the minimum length are ignored.
    pub fn add_secret(&self, secret: &str) {
        if secret.len() < MIN_REDACTION_LENGTH {
            return;
        }
        if let Ok(mut inner) = self.inner.write() {
            inner.insert(secret.to_string());
        }
    }

    /// An independent registry starting with a copy of the current secrets
    ///
    /// Secrets added to the fork are not seen by this registry.
    pub fn fork(&self) -> Self {
        let secrets = self
            .inner
            .read()
            .map(|inner| inner.clone())
            .unwrap_or_default();
        Self {
            inner: Arc::new(RwLock::new(secrets)),
        }
    }

    /// Replace every registered secret in `text` with the placeholder
    ///
    /// Longer secrets are replaced first so a secret that contains another
    /// one is not left half-masked.
    pub fn redact_text(&self, text: &str) -> String {
        let Ok(inner) = self.inner.read() else {
            return text.to_string();
        };
        if inner.is_empty() {
            return text.to_string();
        }

        let mut secrets: Vec<&String> = inner.iter().collect();
        secrets.sort_by_key(|s| std::cmp::Reverse(s.len()));

        let mut result = text.to_string();
        for secret in secrets {
            if result.contains(secret.as_str()) {
                result = result.replace(secret.as_str(), REDACTION_PLACEHOLDER);
            }
        }
        result
    }

    /// Get the count of registered secrets
    pub fn secret_count(&self) -> usize {
        self.inner.read().map(|inner| inner.len()).unwrap_or(0)
    }
}

/// Configuration for redaction behavior
#[derive(Debug, Clone)]
pub struct RedactionConfig {
    /// Whether redaction is enabled
    pub enabled: bool,
    /// Registry consulted when redacting
    pub registry: SecretRegistry,
}

impl Default for RedactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            registry: SecretRegistry::new(),
        }
    }
}

impl RedactionConfig {
    /// Create config with redaction disabled
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            registry: SecretRegistry::new(),
        }
    }

    /// Create config backed by an existing registry
    pub fn with_registry(registry: SecretRegistry) -> Self {
        Self {
            enabled: true,
            registry,
        }
    }

    /// Same policy over a forked registry
    pub fn fork(&self) -> Self {
        Self {
            enabled: self.enabled,
            registry: self.registry.fork(),
        }
    }

    /// Redact text if redaction is enabled
    pub fn redact(&self, text: &str) -> String {
        if self.enabled {
            self.registry.redact_text(text)
        } else {
            text.to_string()
        }
    }
}
