//! Paired old/new key-value snapshots
//!
//! A [`ChangeMap`] holds the pre-change (`old`) and post-change (`new`)
//! snapshot of a set of string fields. Which snapshot a render sees is chosen
//! by an explicit [`Epoch`] argument rather than a mutable "current" pointer,
//! so a nested render can look at the opposite snapshot without any state to
//! restore afterwards.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A string-keyed, string-valued map with deterministic iteration order
pub type StringMap = BTreeMap<String, String>;

/// Which snapshot of a [`ChangeMap`] is being viewed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Epoch {
    /// The snapshot from before the change
    Old,
    /// The snapshot the change is moving towards
    New,
}

impl Epoch {
    /// Get the epoch name as string
    pub fn as_str(&self) -> &'static str {
        match self {
            Epoch::Old => "old",
            Epoch::New => "new",
        }
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Old and new snapshots of the same set of fields
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeMap {
    #[serde(default)]
    pub old: StringMap,
    #[serde(default)]
    pub new: StringMap,
}

impl ChangeMap {
    /// Build a change map from both snapshots
    pub fn new(old: StringMap, new: StringMap) -> Self {
        Self { old, new }
    }

    /// A change map whose snapshots are identical (no pending change)
    pub fn unchanged(values: StringMap) -> Self {
        Self {
            old: values.clone(),
            new: values,
        }
    }

    /// The snapshot selected by `epoch`
    pub fn view(&self, epoch: Epoch) -> &StringMap {
        match epoch {
            Epoch::Old => &self.old,
            Epoch::New => &self.new,
        }
    }

    /// Mutable access to the snapshot selected by `epoch`
    pub fn view_mut(&mut self, epoch: Epoch) -> &mut StringMap {
        match epoch {
            Epoch::Old => &mut self.old,
            Epoch::New => &mut self.new,
        }
    }

    /// Look up a single field in the selected snapshot
    pub fn get(&self, epoch: Epoch, key: &str) -> Option<&str> {
        self.view(epoch).get(key).map(String::as_str)
    }

    /// Whether the two snapshots differ
    pub fn has_change(&self) -> bool {
        self.old != self.new
    }

    /// Keys whose value differs between the snapshots, including keys present
    /// in only one of them
    pub fn changed_keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self
            .old
            .keys()
            .chain(self.new.keys())
            .map(String::as_str)
            .filter(|k| self.old.get(*k) != self.new.get(*k))
            .collect();
        keys.sort_unstable();
        keys.dedup();
        keys
    }
}
