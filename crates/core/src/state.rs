//! Resource record persistence
//!
//! A local host keeps one resource instance in a JSON file. The record holds
//! the last applied snapshot; the next invocation's old snapshot is the
//! record and its new snapshot is the record with the caller's overrides
//! applied.

use crate::change_map::{ChangeMap, StringMap};
use crate::resource::{ApplyData, ChangeFlag, PlanData};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, instrument};

/// Persisted state of one resource instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceRecord {
    pub context: StringMap,
    pub environment: StringMap,
    pub sensitive_environment: StringMap,
    pub state: StringMap,
    pub id: String,
    pub output: StringMap,
    pub trigger: bool,
}

/// Caller-supplied changes for the new snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overrides {
    pub set: StringMap,
    pub unset: Vec<String>,
    pub environment: StringMap,
    pub sensitive_environment: StringMap,
}

impl ResourceRecord {
    /// Load a record; a missing file is an empty record
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No resource record yet");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read resource record {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse resource record {}", path.display()))
    }

    /// Write the record, replacing the file atomically
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create record directory {}", parent.display())
                })?;
            }
        }
        let content =
            serde_json::to_string_pretty(self).context("Failed to serialize resource record")?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        debug!("Saved resource record");
        Ok(())
    }

    pub fn is_provisioned(&self) -> bool {
        !self.id.is_empty()
    }

    /// Host data with the record as old snapshot and overrides applied to new
    pub fn to_apply_data(&self, overrides: &Overrides) -> ApplyData {
        let mut context = self.context.clone();
        for key in &overrides.unset {
            context.remove(key);
        }
        context.extend(overrides.set.clone());

        let mut environment = self.environment.clone();
        environment.extend(overrides.environment.clone());
        let mut sensitive = self.sensitive_environment.clone();
        sensitive.extend(overrides.sensitive_environment.clone());

        ApplyData {
            context: ChangeMap::new(self.context.clone(), context),
            environment: ChangeMap::new(self.environment.clone(), environment),
            sensitive_environment: ChangeMap::new(self.sensitive_environment.clone(), sensitive),
            state: ChangeMap::unchanged(self.state.clone()),
            id: self.id.clone(),
            output: self.output.clone(),
            trigger: ChangeFlag::unchanged(self.trigger),
        }
    }

    /// Plan data for the same snapshots
    pub fn to_plan_data(&self, overrides: &Overrides) -> PlanData {
        PlanData::from_apply(&self.to_apply_data(overrides))
    }

    /// Record the new snapshot of applied data
    pub fn from_apply(data: &ApplyData) -> Self {
        Self {
            context: data.context.new.clone(),
            environment: data.environment.new.clone(),
            sensitive_environment: data.sensitive_environment.new.clone(),
            state: data.state.new.clone(),
            id: data.id.clone(),
            output: data.output.clone(),
            trigger: data.trigger.new,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn map(pairs: &[(&str, &str)]) -> StringMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_missing_record_is_empty() {
        let dir = TempDir::new().unwrap();
        let record = ResourceRecord::load(&dir.path().join("none.json")).unwrap();
        assert_eq!(record, ResourceRecord::default());
        assert!(!record.is_provisioned());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("resource.json");
        let record = ResourceRecord {
            context: map(&[("a", "1")]),
            id: "abc".into(),
            trigger: true,
            ..ResourceRecord::default()
        };
        record.save(&path).unwrap();
        assert_eq!(ResourceRecord::load(&path).unwrap(), record);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_corrupt_record_reports_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = ResourceRecord::load(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("bad.json"));
    }

    #[test]
    fn test_overrides_build_new_snapshot() {
        let record = ResourceRecord {
            context: map(&[("keep", "1"), ("drop", "2"), ("change", "old")]),
            state: map(&[("s", "v")]),
            ..ResourceRecord::default()
        };
        let overrides = Overrides {
            set: map(&[("change", "new"), ("add", "x")]),
            unset: vec!["drop".into()],
            environment: map(&[("E", "1")]),
            ..Overrides::default()
        };
        let data = record.to_apply_data(&overrides);
        assert_eq!(data.context.old, record.context);
        assert_eq!(
            data.context.new,
            map(&[("keep", "1"), ("change", "new"), ("add", "x")])
        );
        assert_eq!(data.environment.new, map(&[("E", "1")]));
        assert!(!data.state.has_change());

        let saved = ResourceRecord::from_apply(&data);
        assert_eq!(saved.context, data.context.new);
    }
}
