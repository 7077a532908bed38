//! External device connection lifecycle
//!
//! Template device ports (those with a connection type) describe devices that
//! may appear at runtime. Connecting a device clones its template into a new
//! port, resolves dynamic profiles, and extends the routes. Disconnecting undoes
//! that, provided the client released every config it made on the port.

use crate::domain::audio::{has_dynamic_profiles_only, HalError, Result};
use crate::domain::module::ModuleState;
use crate::domain::port::{AudioPort, AudioRoute};
use std::collections::BTreeSet;
use tracing::{debug, error};

impl ModuleState {
    pub(crate) fn connect_external_device(&mut self, template: &AudioPort) -> Result<AudioPort> {
        let template_id = template.id;
        let Some(template_port) = self.config.find_port(template_id) else {
            error!(module = %self.kind, template_id, "Template port not found");
            return Err(HalError::invalid_argument(format!("port id {} not found", template_id)));
        };
        let Some(template_ext) = template_port.device_ext() else {
            error!(module = %self.kind, template_id, "Template is not a device port");
            return Err(HalError::invalid_argument(format!(
                "port id {} is not a device port",
                template_id
            )));
        };
        if !template_ext.device.device_type.is_external() {
            error!(module = %self.kind, template_id, "Template port is permanently attached");
            return Err(HalError::invalid_argument(format!(
                "port id {} is permanently attached",
                template_id
            )));
        }
        if self.connected_device_ports.contains_key(&template_id) {
            error!(module = %self.kind, template_id, "Port is a connected device port, not a template");
            return Err(HalError::invalid_argument(format!(
                "port id {} is a connected device port",
                template_id
            )));
        }
        let Some(requested_ext) = template.device_ext() else {
            error!(module = %self.kind, template_id, "Connection request carries no device");
            return Err(HalError::invalid_argument("connection request must describe a device"));
        };

        let mut connected = template_port.clone();
        connected.extra_audio_descriptors = template.extra_audio_descriptors.clone();
        if let Some(ext) = connected.device_ext_mut() {
            ext.device.address = requested_ext.device.address.clone();
        }
        let connected_device = connected.device().cloned().unwrap_or_default();
        debug!(module = %self.kind, template_id, device = %connected_device, "Connecting device");

        for connected_id in self.connected_device_ports.keys() {
            if self.config.find_port(*connected_id).and_then(AudioPort::device) == Some(&connected_device) {
                error!(
                    module = %self.kind,
                    device = %connected_device,
                    port_id = connected_id,
                    "Device is already connected"
                );
                return Err(HalError::illegal_state(format!(
                    "device {} is already connected at port id {}",
                    connected_device, connected_id
                )));
            }
        }

        let route_indices = self.config.route_indices_for_port(template_id);
        let routable_ids = self.config.routable_port_ids(template_id);
        let new_port_id = self.config.allocate_port_id();

        if !self.debug.simulate_device_connections {
            self.hooks.populate_connected_device_port(&mut connected, new_port_id)?;
        } else if has_dynamic_profiles_only(&connected.profiles) {
            if let Some(profiles) = self.config.connected_profiles.get(&template_id) {
                connected.profiles = profiles.clone();
            }
        }

        if has_dynamic_profiles_only(&connected.profiles) {
            if let Some(dynamic_mix) = self
                .config
                .ports
                .iter()
                .find(|p| routable_ids.contains(&p.id) && has_dynamic_profiles_only(&p.profiles))
            {
                error!(
                    module = %self.kind,
                    template_id,
                    mix_port_id = dynamic_mix.id,
                    "Connected port has only dynamic profiles and so does a routable mix port"
                );
                return Err(HalError::illegal_state(format!(
                    "connected port keeps dynamic profiles while routable port {} has dynamic profiles",
                    dynamic_mix.id
                )));
            }
        }

        connected.id = new_port_id;
        self.connected_device_ports.insert(new_port_id, BTreeSet::new());
        self.config.ports.push(connected.clone());
        self.hooks.on_external_device_connection_changed(&connected, true);
        debug!(module = %self.kind, template_id, port_id = new_port_id, "External device connected");

        let mut new_routes = Vec::new();
        for index in route_indices {
            let route = &mut self.config.routes[index];
            if route.sink_port_id == template_id {
                new_routes.push(AudioRoute::new(
                    route.source_port_ids.clone(),
                    new_port_id,
                    route.is_exclusive,
                ));
            } else {
                route.source_port_ids.push(new_port_id);
            }
        }
        self.config.routes.extend(new_routes);

        if !has_dynamic_profiles_only(&connected.profiles) && !routable_ids.is_empty() {
            let mut populated = BTreeSet::new();
            for port in self.config.ports.iter_mut().filter(|p| routable_ids.contains(&p.id)) {
                if has_dynamic_profiles_only(&port.profiles) {
                    port.profiles = connected.profiles.clone();
                    populated.insert(port.id);
                } else if self.connected_device_ports.values().any(|mixes| mixes.contains(&port.id)) {
                    // profiles were filled by an earlier connection
                    populated.insert(port.id);
                }
            }
            debug!(module = %self.kind, port_id = new_port_id, mix_ports = ?populated, "Mix port profiles populated");
            self.connected_device_ports.insert(new_port_id, populated);
        }

        Ok(connected)
    }

    /// Checks shared by disconnect and prepare-to-disconnect
    fn find_connected_device_port(&self, port_id: i32) -> Result<&AudioPort> {
        let Some(port) = self.config.find_port(port_id) else {
            error!(module = %self.kind, port_id, "Port not found");
            return Err(HalError::invalid_argument(format!("port id {} not found", port_id)));
        };
        if !port.is_device_port() {
            error!(module = %self.kind, port_id, "Not a device port");
            return Err(HalError::invalid_argument(format!(
                "port id {} is not a device port",
                port_id
            )));
        }
        if !self.connected_device_ports.contains_key(&port_id) {
            error!(module = %self.kind, port_id, "Not a connected device port");
            return Err(HalError::invalid_argument(format!(
                "port id {} is not a connected device port",
                port_id
            )));
        }
        Ok(port)
    }

    pub(crate) fn disconnect_external_device(&mut self, port_id: i32) -> Result<()> {
        let port = self.find_connected_device_port(port_id)?.clone();

        let client_config = self.config.port_configs.iter().find(|config| {
            config.port_id == port_id
                && self.config.find_initial_config(config.id) != Some(*config)
        });
        if let Some(config) = client_config {
            error!(module = %self.kind, port_id, config_id = config.id, "Port has a non-default config");
            return Err(HalError::illegal_state(format!(
                "port id {} has a non-default config with id {}",
                port_id, config.id
            )));
        }

        self.hooks.on_external_device_connection_changed(&port, false);
        self.config.remove_port(port_id);
        debug!(module = %self.kind, port_id, "Connected device port released");

        self.config.routes.retain_mut(|route| {
            if route.sink_port_id == port_id {
                return false;
            }
            route.source_port_ids.retain(|id| *id != port_id);
            true
        });

        let mut mix_ports_to_clear = self.connected_device_ports.remove(&port_id).unwrap_or_default();
        for mixes in self.connected_device_ports.values() {
            for mix_id in mixes {
                mix_ports_to_clear.remove(mix_id);
            }
        }
        for mix_id in &mix_ports_to_clear {
            if let Some(mix) = self.config.find_port_mut(*mix_id) {
                mix.profiles.clear();
                debug!(module = %self.kind, mix_port_id = mix_id, "Mix port profiles cleared");
            }
        }
        Ok(())
    }

    pub(crate) fn prepare_to_disconnect_external_device(&self, port_id: i32) -> Result<()> {
        let port = self.find_connected_device_port(port_id)?;
        self.hooks.on_prepare_to_disconnect_external_device(port);
        debug!(module = %self.kind, port_id, "Prepared to disconnect");
        Ok(())
    }
}
