//! Patch management and stream reconnection
//!
//! Establishing, updating or removing a patch changes which devices the open
//! streams on the patched mix port configs are connected to. Streams are told
//! about the change in two passes (disconnect, then connect). If any stream
//! rejects its new routing, every stream touched so far is put back on its old
//! devices and the graph is restored, so the caller observes either the whole
//! change or none of it.

mod index;

pub use index::PatchIndex;

use crate::domain::audio::{AudioDevice, HalError, Result};
use crate::domain::module::{invariant_violation, ModuleState};
use crate::domain::port::{AudioPatch, AudioPortConfig};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, error, warn};

/// Mix port config id to the device port config ids it is connected to
type Connections = BTreeMap<i32, BTreeSet<i32>>;

fn has_duplicates(ids: &[i32]) -> bool {
    ids.iter().collect::<BTreeSet<_>>().len() != ids.len()
}

impl ModuleState {
    fn select_port_configs(&self, ids: &[i32], role: &str) -> Result<Vec<AudioPortConfig>> {
        let mut selected = Vec::with_capacity(ids.len());
        let mut missing = Vec::new();
        for id in ids {
            match self.config.find_port_config(*id) {
                Some(config) => selected.push(config.clone()),
                None => missing.push(*id),
            }
        }
        if !missing.is_empty() {
            error!(module = %self.kind, ?missing, "Unknown {} port config ids", role);
            return Err(HalError::invalid_argument(format!(
                "{} port config ids not found: {:?}",
                role, missing
            )));
        }
        Ok(selected)
    }

    pub(crate) fn set_audio_patch(&mut self, requested: &AudioPatch) -> Result<AudioPatch> {
        debug!(module = %self.kind, ?requested, "Requested patch");
        if requested.source_port_config_ids.is_empty() {
            error!(module = %self.kind, "Requested patch has no sources");
            return Err(HalError::invalid_argument("patch has an empty sources list"));
        }
        if has_duplicates(&requested.source_port_config_ids) {
            error!(module = %self.kind, "Requested patch has duplicate sources");
            return Err(HalError::invalid_argument("patch has duplicate source ids"));
        }
        if requested.sink_port_config_ids.is_empty() {
            error!(module = %self.kind, "Requested patch has no sinks");
            return Err(HalError::invalid_argument("patch has an empty sinks list"));
        }
        if has_duplicates(&requested.sink_port_config_ids) {
            error!(module = %self.kind, "Requested patch has duplicate sinks");
            return Err(HalError::invalid_argument("patch has duplicate sink ids"));
        }

        let sources = self.select_port_configs(&requested.source_port_config_ids, "source")?;
        let sinks = self.select_port_configs(&requested.sink_port_config_ids, "sink")?;

        // sink port id -> whether a non-exclusive route to it exists
        let mut allowed_sink_ports: BTreeMap<i32, bool> = BTreeMap::new();
        for source in &sources {
            for route in &self.config.routes {
                if route.source_port_ids.contains(&source.port_id) {
                    let non_exclusive = allowed_sink_ports.entry(route.sink_port_id).or_insert(false);
                    if !*non_exclusive {
                        *non_exclusive = !route.is_exclusive;
                    }
                }
            }
        }
        for sink in &sinks {
            if !allowed_sink_ports.contains_key(&sink.port_id) {
                error!(module = %self.kind, sink_port_id = sink.port_id, "No route to sink port");
                return Err(HalError::invalid_argument(format!(
                    "there is no route to the sink port id {}",
                    sink.port_id
                )));
            }
        }
        self.hooks.check_audio_patch_endpoints_match(&sources, &sinks)?;

        let existing_index = if requested.id != 0 {
            match self.config.patches.iter().position(|p| p.id == requested.id) {
                Some(index) => Some(index),
                None => {
                    error!(module = %self.kind, id = requested.id, "Existing patch not found");
                    return Err(HalError::invalid_argument(format!(
                        "patch id {} not found",
                        requested.id
                    )));
                }
            }
        } else {
            None
        };

        let index_backup = self.patch_index.clone();
        if existing_index.is_some() {
            self.patch_index.remove_patch(requested.id);
        }

        for (&sink_port_id, &non_exclusive) in &allowed_sink_ports {
            if !non_exclusive && self.patch_index.contains(sink_port_id) {
                error!(module = %self.kind, sink_port_id, "Exclusive sink port is already in use");
                self.patch_index = index_backup;
                return Err(HalError::illegal_state(format!(
                    "sink port id {} is exclusive and already used by another patch",
                    sink_port_id
                )));
            }
        }

        let mix_configs = if sources[0].ext.as_mix().is_some() { &sources } else { &sinks };
        let mut by_rate: BTreeMap<u32, &AudioPortConfig> = BTreeMap::new();
        for config in mix_configs {
            by_rate.entry(config.sample_rate.unwrap_or(0)).or_insert(config);
        }
        let Some((&max_rate, &reference)) = by_rate.iter().next_back() else {
            invariant_violation(self.kind, "patch without port configs passed validation".to_string());
        };

        let mut result = requested.clone();
        let latency_ms = self.hooks.nominal_latency_ms(reference);
        let format = reference.format.clone().unwrap_or_default();
        match self.hooks.calculate_buffer_size_frames(&format, latency_ms, max_rate) {
            Ok(frames) => result.minimum_stream_buffer_size_frames = frames,
            Err(e) => {
                error!(module = %self.kind, error = %e, "Failed to calculate minimum buffer size");
                self.patch_index = index_backup;
                return Err(HalError::illegal_state(format!(
                    "can not size stream buffers for format {}",
                    format
                )));
            }
        }
        result.latencies_ms = vec![latency_ms; result.sink_port_config_ids.len()];

        let next_patch_id = self.config.next_patch_id;
        let old_patch = match existing_index {
            None => {
                result.id = self.config.allocate_patch_id();
                self.config.patches.push(result.clone());
                AudioPatch::default()
            }
            Some(index) => std::mem::replace(&mut self.config.patches[index], result.clone()),
        };

        self.patch_index.register(&result, &self.config.port_configs);
        if let Err(e) = self.update_streams_connected_state(&old_patch, &result) {
            self.patch_index = index_backup;
            match existing_index {
                None => {
                    self.config.patches.pop();
                    self.config.next_patch_id = next_patch_id;
                }
                Some(index) => self.config.patches[index] = old_patch,
            }
            error!(module = %self.kind, error = %e, "Stream reconnection failed, patch change reverted");
            return Err(e);
        }

        debug!(
            module = %self.kind,
            id = result.id,
            created = existing_index.is_none(),
            minimum_frames = result.minimum_stream_buffer_size_frames,
            "Patch established"
        );
        Ok(result)
    }

    pub(crate) fn reset_audio_patch(&mut self, patch_id: i32) -> Result<()> {
        let Some(position) = self.config.patches.iter().position(|p| p.id == patch_id) else {
            error!(module = %self.kind, patch_id, "Patch not found");
            return Err(HalError::invalid_argument(format!("patch id {} not found", patch_id)));
        };
        let index_backup = self.patch_index.clone();
        self.patch_index.remove_patch(patch_id);
        let patch = self.config.patches[position].clone();
        if let Err(e) = self.update_streams_connected_state(&patch, &AudioPatch::default()) {
            self.patch_index = index_backup;
            error!(module = %self.kind, patch_id, error = %e, "Stream disconnection failed, patch kept");
            return Err(e);
        }
        self.config.patches.remove(position);
        debug!(module = %self.kind, patch_id, "Patch erased");
        Ok(())
    }

    pub(crate) fn reset_audio_port_config(&mut self, port_config_id: i32) -> Result<()> {
        let Some(position) = self.config.port_configs.iter().position(|c| c.id == port_config_id) else {
            error!(module = %self.kind, port_config_id, "Port config not found");
            return Err(HalError::invalid_argument(format!(
                "port config id {} not found",
                port_config_id
            )));
        };
        if self.streams.count(port_config_id) != 0 {
            error!(module = %self.kind, port_config_id, "Port config has an open stream");
            return Err(HalError::illegal_state(format!(
                "port config id {} has a stream opened on it",
                port_config_id
            )));
        }
        if let Some(patch_id) = self.patch_index.patches_for(port_config_id).next() {
            error!(module = %self.kind, port_config_id, patch_id, "Port config is used by a patch");
            return Err(HalError::illegal_state(format!(
                "port config id {} is used by the patch with id {}",
                port_config_id, patch_id
            )));
        }
        match self.config.find_initial_config(port_config_id).cloned() {
            None => {
                self.config.port_configs.remove(position);
                debug!(module = %self.kind, port_config_id, "Port config erased");
            }
            Some(initial) if self.config.port_configs[position] != initial => {
                self.config.port_configs[position] = initial;
                debug!(module = %self.kind, port_config_id, "Port config reset to initial");
            }
            Some(_) => {}
        }
        Ok(())
    }

    /// Port configs on the other side of every patch using `port_config_id`
    pub(crate) fn find_connected_port_config_ids(&self, port_config_id: i32) -> BTreeSet<i32> {
        let mut result = BTreeSet::new();
        for patch_id in self.patch_index.patches_for(port_config_id) {
            let Some(patch) = self.config.find_patch(patch_id) else {
                invariant_violation(
                    self.kind,
                    format!("patch {} from the index is missing from the configuration", patch_id),
                );
            };
            if patch.source_port_config_ids.contains(&port_config_id) {
                result.extend(patch.sink_port_config_ids.iter().copied());
            } else {
                result.extend(patch.source_port_config_ids.iter().copied());
            }
        }
        result
    }

    pub(crate) fn find_connected_devices(&self, port_config_id: i32) -> Vec<AudioDevice> {
        self.devices_from_device_port_config_ids(&self.find_connected_port_config_ids(port_config_id))
    }

    fn devices_from_device_port_config_ids(&self, ids: &BTreeSet<i32>) -> Vec<AudioDevice> {
        ids.iter()
            .map(|id| {
                match self.config.find_port_config(*id).and_then(|c| c.ext.as_device()) {
                    Some(ext) => ext.device.clone(),
                    None => invariant_violation(
                        self.kind,
                        format!("failed to find device for port config id {}", id),
                    ),
                }
            })
            .collect()
    }

    fn fill_connections(&self, connections: &mut Connections, patch: &AudioPatch) {
        let has_stream = |ids: &[i32]| ids.iter().any(|id| self.streams.count(*id) > 0);
        let (mix_ids, device_ids) = if has_stream(&patch.source_port_config_ids) {
            (&patch.source_port_config_ids, &patch.sink_port_config_ids)
        } else if has_stream(&patch.sink_port_config_ids) {
            (&patch.sink_port_config_ids, &patch.source_port_config_ids)
        } else {
            return;
        };
        for mix_id in mix_ids {
            connections.entry(*mix_id).or_default().extend(device_ids.iter().copied());
        }
    }

    /// Best-effort return of streams to their previous devices
    fn restore_old_connections(
        &self,
        old_connections: &Connections,
        mix_config_ids: &BTreeSet<i32>,
        continue_with_empty_devices: bool,
    ) {
        for mix_config_id in mix_config_ids {
            let old = old_connections.get(mix_config_id);
            if old.is_none() && !continue_with_empty_devices {
                continue;
            }
            let devices = old
                .map(|ids| self.devices_from_device_port_config_ids(ids))
                .unwrap_or_default();
            match self.streams.set_stream_connected_devices(*mix_config_id, &devices) {
                Ok(()) => warn!(
                    module = %self.kind,
                    mix_config_id,
                    devices = ?devices,
                    "Rollback: stream routing restored"
                ),
                Err(e) => error!(
                    module = %self.kind,
                    mix_config_id,
                    error = %e,
                    "Rollback: failed to restore stream routing"
                ),
            }
        }
    }

    /// Moves streams from the routing of `old_patch` to that of `new_patch`
    pub(crate) fn update_streams_connected_state(
        &self,
        old_patch: &AudioPatch,
        new_patch: &AudioPatch,
    ) -> Result<()> {
        let mut old_connections = Connections::new();
        let mut new_connections = Connections::new();
        self.fill_connections(&mut old_connections, old_patch);
        self.fill_connections(&mut new_connections, new_patch);

        let mut ids_to_connect_back = BTreeSet::new();
        for mix_config_id in old_connections.keys() {
            if new_connections.contains_key(mix_config_id) {
                continue;
            }
            ids_to_connect_back.insert(*mix_config_id);
            if let Err(e) = self.streams.set_stream_connected_devices(*mix_config_id, &[]) {
                self.restore_old_connections(&old_connections, &ids_to_connect_back, false);
                warn!(module = %self.kind, error = %e, "Failed to disconnect from the old patch, rolled back");
                return Err(e);
            }
            debug!(module = %self.kind, mix_config_id, "Stream disconnected");
        }

        let mut ids_to_rollback = BTreeSet::new();
        for (mix_config_id, device_config_ids) in &new_connections {
            if old_connections.get(mix_config_id) == Some(device_config_ids) {
                continue;
            }
            let devices = self.devices_from_device_port_config_ids(device_config_ids);
            ids_to_rollback.insert(*mix_config_id);
            if devices.is_empty() {
                invariant_violation(
                    self.kind,
                    format!("no connected devices found for port config id {}", mix_config_id),
                );
            }
            if let Err(e) = self.streams.set_stream_connected_devices(*mix_config_id, &devices) {
                self.restore_old_connections(&old_connections, &ids_to_connect_back, false);
                self.restore_old_connections(&old_connections, &ids_to_rollback, true);
                warn!(module = %self.kind, error = %e, "Failed to connect for the new patch, rolled back");
                return Err(e);
            }
            debug!(module = %self.kind, mix_config_id, devices = ?devices, "Stream connected");
        }
        Ok(())
    }
}
