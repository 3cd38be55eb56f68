//! Shared test helpers for core integration tests.
#![allow(dead_code)]

use shellres_core::redaction::RedactionConfig;
use shellres_core::resource::ApplyData;
use shellres_core::scoped_log::{LogSink, Logger, MemorySink};
use shellres_core::{ChangeMap, Lifecycle, ProviderConfig, StringMap};
use std::sync::Arc;

/// Build a string map from pairs
pub fn map(pairs: &[(&str, &str)]) -> StringMap {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Engine from a TOML provider document, logging nowhere
pub fn engine(toml: &str) -> Lifecycle {
    shellres_core::logging::init(None, None).ok();
    let config = ProviderConfig::from_toml_str(toml).unwrap();
    Lifecycle::with_logger(config, Logger::disabled()).unwrap()
}

/// Engine from a TOML provider document, logging into memory
pub fn engine_with_sink(toml: &str) -> (Lifecycle, Arc<MemorySink>) {
    let sink = Arc::new(MemorySink::new());
    let logger = Logger::new(
        vec![sink.clone() as Arc<dyn LogSink>],
        RedactionConfig::default(),
    );
    let config = ProviderConfig::from_toml_str(toml).unwrap();
    (Lifecycle::with_logger(config, logger).unwrap(), sink)
}

/// Data for a first apply: no old snapshot
pub fn fresh(context: &[(&str, &str)]) -> ApplyData {
    ApplyData::new(ChangeMap::new(StringMap::new(), map(context)))
}

/// Persist the new snapshot the way a host does after an apply
pub fn commit(data: &mut ApplyData) {
    data.context.old = data.context.new.clone();
    data.environment.old = data.environment.new.clone();
    data.sensitive_environment.old = data.sensitive_environment.new.clone();
    data.state.old = data.state.new.clone();
    data.trigger.old = data.trigger.new;
}
