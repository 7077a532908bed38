//! Reverse index from port configs and ports to the patches using them
//!
//! Each patch is registered under every port config id it references and,
//! when a config id differs from its owning port id, under that port id too.
//! The index is always derivable from the patch list; [`PatchIndex::rebuild`]
//! does exactly that and is what the incremental updates must agree with.

use crate::domain::port::{AudioPatch, AudioPortConfig};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchIndex {
    entries: BTreeMap<i32, BTreeSet<i32>>,
}

impl PatchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the index from scratch
    pub fn rebuild(patches: &[AudioPatch], port_configs: &[AudioPortConfig]) -> Self {
        let mut index = Self::new();
        for patch in patches {
            index.register(patch, port_configs);
        }
        index
    }

    /// Adds entries for every config of `patch` known to `port_configs`
    pub fn register(&mut self, patch: &AudioPatch, port_configs: &[AudioPortConfig]) {
        for config_id in patch.port_config_ids() {
            let Some(config) = port_configs.iter().find(|c| c.id == config_id) else {
                continue;
            };
            self.entries.entry(config_id).or_default().insert(patch.id);
            if config.port_id != config_id {
                self.entries.entry(config.port_id).or_default().insert(patch.id);
            }
        }
    }

    /// Drops every entry pointing at `patch_id`
    pub fn remove_patch(&mut self, patch_id: i32) {
        self.entries.retain(|_, patches| {
            patches.remove(&patch_id);
            !patches.is_empty()
        });
    }

    /// True when the port config or port id is used by some patch
    pub fn contains(&self, id: i32) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn patches_for(&self, id: i32) -> impl Iterator<Item = i32> + '_ {
        self.entries.get(&id).into_iter().flatten().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
