//! Port config resolution
//!
//! A client asks for a port config with any subset of fields filled in. The
//! resolver starts from a suggestion (the existing config, or a default derived
//! from the port's first concrete profile), overlays every requested field the
//! port supports, and commits the result only when the request was valid and,
//! for new configs, complete.

use crate::domain::audio::{
    has_dynamic_profiles_only, AudioFormat, AudioGainConfig, AudioProfile, ChannelLayout,
    HalError, Result,
};
use crate::domain::module::ModuleState;
use crate::domain::port::{AudioPort, AudioPortConfig, AudioPortExt, PortExtTag};
use tracing::{debug, error, warn};

/// Derives a config from the first non-dynamic profile of the port
///
/// Device ports without such a profile get an all-wildcard config; mix ports
/// without one can not be configured and yield `None`.
pub fn generate_default_port_config(port: &AudioPort) -> Option<AudioPortConfig> {
    let mut config = AudioPortConfig {
        port_id: port.id,
        flags: Some(port.flags),
        ext: port.ext().clone(),
        ..Default::default()
    };
    if let Some(profile) = port.profiles.iter().find(|p| !p.is_dynamic()) {
        config.format = Some(profile.format.clone());
        config.channel_mask = profile.channel_masks.first().copied();
        config.sample_rate = profile.sample_rates.first().copied();
        return Some(config);
    }
    if port.is_device_port() {
        config.format = Some(AudioFormat::Default);
        config.channel_mask = Some(ChannelLayout::None);
        config.sample_rate = Some(0);
        return Some(config);
    }
    None
}

/// Profile of the port matching the format
pub fn find_audio_profile<'a>(port: &'a AudioPort, format: &AudioFormat) -> Option<&'a AudioProfile> {
    port.profiles.iter().find(|p| &p.format == format)
}

/// Linear gain for a millibel value on a stepped gain stage
pub fn gain_from_millibels(min_value: i32, max_value: i32, gain_index: i32, total_steps: i32) -> f32 {
    let fraction = gain_index as f32 / total_steps as f32;
    let millibels = min_value as f32 + (max_value as f32 - min_value as f32) * fraction;
    10f32.powf(millibels / 2000.0)
}

impl ModuleState {
    pub(crate) fn set_audio_port_config(
        &mut self,
        requested: &AudioPortConfig,
    ) -> Result<(AudioPortConfig, bool)> {
        debug!(module = %self.kind, ?requested, "Requested port config");

        let existing = if requested.id != 0 {
            match self.config.find_port_config(requested.id) {
                Some(config) => Some(config.clone()),
                None => {
                    error!(module = %self.kind, id = requested.id, "Existing port config not found");
                    return Err(HalError::invalid_argument(format!(
                        "port config id {} not found",
                        requested.id
                    )));
                }
            }
        } else {
            None
        };

        let port_id = existing.as_ref().map(|c| c.port_id).unwrap_or(requested.port_id);
        if port_id == 0 {
            error!(module = %self.kind, "Port id must be specified for a new port config");
            return Err(HalError::invalid_argument("port id is not set"));
        }
        let Some(port) = self.config.find_port(port_id).cloned() else {
            error!(module = %self.kind, port_id, "Port not found");
            return Err(HalError::invalid_argument(format!("port id {} not found", port_id)));
        };

        let mut suggested = match &existing {
            Some(config) => config.clone(),
            None => match generate_default_port_config(&port) {
                Some(config) => config,
                None => {
                    error!(module = %self.kind, port_id, "Unable to generate a default config");
                    return Err(HalError::invalid_argument(format!(
                        "unable to generate a default config for port {}",
                        port_id
                    )));
                }
            },
        };

        let allow_dynamic = port.is_device_port() && has_dynamic_profiles_only(&port.profiles);
        let mut valid = true;
        let mut fully_specified = true;

        match requested.flags {
            Some(flags) if flags != port.flags => {
                warn!(module = %self.kind, ?flags, expected = ?port.flags, "Requested flags mismatch");
                valid = false;
            }
            Some(flags) => suggested.flags = Some(flags),
            None => fully_specified = false,
        }

        match &requested.format {
            Some(format) => {
                if (format.is_dynamic() && allow_dynamic) || find_audio_profile(&port, format).is_some() {
                    suggested.format = Some(format.clone());
                } else {
                    warn!(module = %self.kind, %format, "Requested format is not supported by the port");
                    valid = false;
                }
            }
            None => fully_specified = false,
        }

        let suggested_format = suggested.format.clone().unwrap_or_default();
        let port_profile = if suggested_format.is_dynamic() && allow_dynamic {
            AudioProfile::default()
        } else {
            match find_audio_profile(&port, &suggested_format) {
                Some(profile) => profile.clone(),
                None => {
                    error!(module = %self.kind, port_id, format = %suggested_format, "Port no longer supports format");
                    return Err(HalError::invalid_argument(format!(
                        "port {} does not support format {} anymore",
                        port_id, suggested_format
                    )));
                }
            }
        };

        match requested.channel_mask {
            Some(mask) => {
                if (mask.is_dynamic() && allow_dynamic) || port_profile.channel_masks.contains(&mask) {
                    suggested.channel_mask = Some(mask);
                } else {
                    warn!(module = %self.kind, ?mask, "Requested channel mask is not supported");
                    valid = false;
                }
            }
            None => fully_specified = false,
        }

        match requested.sample_rate {
            Some(rate) => {
                if (rate == 0 && allow_dynamic) || port_profile.sample_rates.contains(&rate) {
                    suggested.sample_rate = Some(rate);
                } else {
                    warn!(module = %self.kind, rate, "Requested sample rate is not supported");
                    valid = false;
                }
            }
            None => fully_specified = false,
        }

        if let Some(gain) = &requested.gain {
            self.set_audio_port_config_gain(&port, gain)?;
            suggested.gain = Some(gain.clone());
        }

        if requested.ext.tag() != PortExtTag::Unspecified {
            if requested.ext.tag() == suggested.ext.tag() {
                if let (AudioPortExt::Mix(requested_mix), AudioPortExt::Mix(suggested_mix)) =
                    (&requested.ext, &mut suggested.ext)
                {
                    suggested_mix.handle = requested_mix.handle;
                    suggested_mix.usecase = requested_mix.usecase.clone();
                }
            } else {
                warn!(
                    module = %self.kind,
                    requested = %requested.ext.tag(),
                    expected = %suggested.ext.tag(),
                    "Requested extension mismatch"
                );
                valid = false;
            }
        }

        let applied = match existing {
            None if valid && fully_specified => {
                suggested.id = self.config.allocate_port_id();
                self.config.port_configs.push(suggested.clone());
                debug!(module = %self.kind, id = suggested.id, "Created new port config");
                true
            }
            Some(_) if valid => {
                if let Some(slot) = self.config.find_port_config_mut(suggested.id) {
                    *slot = suggested.clone();
                }
                debug!(module = %self.kind, id = suggested.id, "Updated port config");
                true
            }
            _ => {
                debug!(module = %self.kind, valid, fully_specified, "Requested port config not applied");
                false
            }
        };
        Ok((suggested, applied))
    }

    /// Validates a gain request and pushes the gain to streams routed to the port
    fn set_audio_port_config_gain(&self, port: &AudioPort, gain: &AudioGainConfig) -> Result<()> {
        let invalid = |reason: String| {
            error!(module = %self.kind, port_id = port.id, "Invalid gain: {}", reason);
            Err(HalError::invalid_argument(reason))
        };
        let Some(stage) = usize::try_from(gain.index).ok().and_then(|i| port.gains.get(i)) else {
            return invalid(format!("gain index {} is out of range", gain.index));
        };
        if stage.step_value == 0 {
            return invalid(format!("gain stage {} has a zero step", gain.index));
        }
        let Some(&value) = gain.values.first() else {
            return invalid("gain has no values".to_string());
        };
        if value < stage.min_value || value > stage.max_value {
            return invalid(format!(
                "gain value {} outside [{}, {}]",
                value, stage.min_value, stage.max_value
            ));
        }
        let step = i64::from(stage.step_value);
        let steps = (i64::from(stage.max_value) - i64::from(stage.min_value)) / step;
        let Ok(total_steps) = i32::try_from(steps) else {
            return invalid(format!("gain stage {} has too many steps", gain.index));
        };
        if total_steps == 0 {
            return invalid(format!("gain stage {} has no steps", gain.index));
        }
        let Ok(gain_index) = i32::try_from((i64::from(value) - i64::from(stage.min_value)) / step) else {
            return invalid(format!("gain value {} is not on stage {}", value, gain.index));
        };
        let linear = gain_from_millibels(stage.min_value, stage.max_value, gain_index, total_steps);
        debug!(module = %self.kind, port_id = port.id, value, linear, "Applying gain");

        for route in self.config.routes.iter().filter(|r| r.sink_port_id == port.id) {
            for source_id in &route.source_port_ids {
                self.streams.set_gain(*source_id, linear);
            }
        }
        Ok(())
    }
}
