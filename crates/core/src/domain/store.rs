//! In-memory graph of a module: ports, configs, routes, patches
//!
//! `Configuration` owns every collection of the routing graph plus the id
//! allocators. It offers lookups and small structural queries; the rules for
//! mutating the graph live in the resolver, patch and device modules.

use crate::domain::audio::{has_dynamic_profiles_only, standard_pcm_profiles, AudioProfile};
use crate::domain::port::{AudioPatch, AudioPort, AudioPortConfig, AudioRoute};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// The full routing graph of a module
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    pub ports: Vec<AudioPort>,
    pub port_configs: Vec<AudioPortConfig>,
    /// Configs present at load time; resetting a config restores its entry here
    pub initial_configs: Vec<AudioPortConfig>,
    pub routes: Vec<AudioRoute>,
    pub patches: Vec<AudioPatch>,
    /// Profiles used for template device ports when device connections are simulated
    pub connected_profiles: BTreeMap<i32, Vec<AudioProfile>>,
    pub next_port_id: i32,
    pub next_patch_id: i32,
}

impl Configuration {
    pub fn new() -> Self {
        Self {
            ports: Vec::new(),
            port_configs: Vec::new(),
            initial_configs: Vec::new(),
            routes: Vec::new(),
            patches: Vec::new(),
            connected_profiles: BTreeMap::new(),
            next_port_id: 1,
            next_patch_id: 1,
        }
    }

    /// Hands out the next id from the port / port config namespace
    pub fn allocate_port_id(&mut self) -> i32 {
        let id = self.next_port_id;
        self.next_port_id += 1;
        id
    }

    pub fn allocate_patch_id(&mut self) -> i32 {
        let id = self.next_patch_id;
        self.next_patch_id += 1;
        id
    }

    pub fn find_port(&self, id: i32) -> Option<&AudioPort> {
        self.ports.iter().find(|p| p.id == id)
    }

    pub fn find_port_mut(&mut self, id: i32) -> Option<&mut AudioPort> {
        self.ports.iter_mut().find(|p| p.id == id)
    }

    /// Removes a port and returns it
    pub fn remove_port(&mut self, id: i32) -> Option<AudioPort> {
        let index = self.ports.iter().position(|p| p.id == id)?;
        Some(self.ports.remove(index))
    }

    pub fn find_port_config(&self, id: i32) -> Option<&AudioPortConfig> {
        self.port_configs.iter().find(|c| c.id == id)
    }

    pub fn find_port_config_mut(&mut self, id: i32) -> Option<&mut AudioPortConfig> {
        self.port_configs.iter_mut().find(|c| c.id == id)
    }

    pub fn find_initial_config(&self, id: i32) -> Option<&AudioPortConfig> {
        self.initial_configs.iter().find(|c| c.id == id)
    }

    pub fn find_patch(&self, id: i32) -> Option<&AudioPatch> {
        self.patches.iter().find(|p| p.id == id)
    }

    /// Indices of the routes where the port is the sink or one of the sources
    pub fn route_indices_for_port(&self, port_id: i32) -> Vec<usize> {
        self.routes
            .iter()
            .enumerate()
            .filter(|(_, route)| route.involves(port_id))
            .map(|(index, _)| index)
            .collect()
    }

    pub fn routes_for_port(&self, port_id: i32) -> Vec<AudioRoute> {
        self.routes
            .iter()
            .filter(|route| route.involves(port_id))
            .cloned()
            .collect()
    }

    /// Ports reachable from `port_id` through a single route, in either direction
    pub fn routable_port_ids(&self, port_id: i32) -> BTreeSet<i32> {
        let mut result = BTreeSet::new();
        for route in self.routes.iter().filter(|r| r.involves(port_id)) {
            if route.sink_port_id == port_id {
                result.extend(route.source_port_ids.iter().copied());
            } else {
                result.insert(route.sink_port_id);
            }
        }
        result
    }

    /// Seeds `connected_profiles` for template device ports without profiles
    ///
    /// Used when device connections are simulated: the connected instance of
    /// such a port gets the standard PCM profile set.
    pub fn populate_connected_profiles(&mut self) {
        for port in &self.ports {
            if port.is_external_device_port()
                && has_dynamic_profiles_only(&port.profiles)
                && !self.connected_profiles.contains_key(&port.id)
            {
                debug!(port_id = port.id, name = %port.name, "Seeding connected profiles");
                self.connected_profiles.insert(port.id, standard_pcm_profiles());
            }
        }
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self::new()
    }
}
