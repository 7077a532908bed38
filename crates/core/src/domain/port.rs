//! Ports, port configurations, routes and patches
//!
//! A port is a routable endpoint (a device or a mix stream). A port config is a
//! concrete instantiation of a port's capabilities. Routes describe which port
//! connections the hardware allows; patches are the connections currently
//! established between port configs.

use crate::domain::audio::{
    AudioDevice, AudioFormat, AudioGain, AudioGainConfig, AudioProfile, ChannelLayout, IoFlags,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Device-side extension of a port
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AudioPortDeviceExt {
    pub device: AudioDevice,
    #[serde(default)]
    pub flags: u32,
    #[serde(default)]
    pub encoded_formats: Vec<AudioFormat>,
}

impl AudioPortDeviceExt {
    pub const FLAG_DEFAULT_DEVICE: u32 = 1 << 0;

    pub fn new(device: AudioDevice) -> Self {
        Self {
            device,
            flags: 0,
            encoded_formats: Vec::new(),
        }
    }

    pub fn is_default(&self) -> bool {
        self.flags & Self::FLAG_DEFAULT_DEVICE != 0
    }
}

/// What a mix stream is used for
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MixUsecase {
    #[default]
    Unspecified,
    /// Playback stream type, e.g. `music`
    Stream(String),
    /// Capture source, e.g. `mic`
    Source(String),
}

/// Mix-side extension of a port
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AudioPortMixExt {
    #[serde(default)]
    pub handle: i32,
    #[serde(default)]
    pub usecase: MixUsecase,
    /// 0 means unlimited
    #[serde(default)]
    pub max_open_stream_count: i32,
    #[serde(default)]
    pub max_active_stream_count: i32,
    #[serde(default)]
    pub recommended_mute_duration_ms: i32,
}

/// Tag of [`AudioPortExt`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortExtTag {
    Unspecified,
    Device,
    Mix,
}

impl fmt::Display for PortExtTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortExtTag::Unspecified => write!(f, "unspecified"),
            PortExtTag::Device => write!(f, "device"),
            PortExtTag::Mix => write!(f, "mix"),
        }
    }
}

/// Tagged port extension
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioPortExt {
    #[default]
    Unspecified,
    Device(AudioPortDeviceExt),
    Mix(AudioPortMixExt),
}

impl AudioPortExt {
    pub fn tag(&self) -> PortExtTag {
        match self {
            AudioPortExt::Unspecified => PortExtTag::Unspecified,
            AudioPortExt::Device(_) => PortExtTag::Device,
            AudioPortExt::Mix(_) => PortExtTag::Mix,
        }
    }

    pub fn as_device(&self) -> Option<&AudioPortDeviceExt> {
        match self {
            AudioPortExt::Device(ext) => Some(ext),
            _ => None,
        }
    }

    pub fn as_mix(&self) -> Option<&AudioPortMixExt> {
        match self {
            AudioPortExt::Mix(ext) => Some(ext),
            _ => None,
        }
    }
}

/// Opaque descriptor blob supplied with a connected device (EDID, SAD, ...)
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExtraAudioDescriptor {
    pub standard: String,
    pub descriptor: Vec<u8>,
    #[serde(default)]
    pub encapsulation_type: String,
}

/// A routable endpoint
///
/// The extension tag is fixed at construction: it can be inspected and its
/// contents edited, but a device port never turns into a mix port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioPort {
    pub id: i32,
    pub name: String,
    pub profiles: Vec<AudioProfile>,
    pub flags: IoFlags,
    pub gains: Vec<AudioGain>,
    ext: AudioPortExt,
    #[serde(default)]
    pub extra_audio_descriptors: Vec<ExtraAudioDescriptor>,
}

impl AudioPort {
    pub fn new_device(id: i32, name: impl Into<String>, flags: IoFlags, ext: AudioPortDeviceExt) -> Self {
        Self::with_ext(id, name, flags, AudioPortExt::Device(ext))
    }

    pub fn new_mix(id: i32, name: impl Into<String>, flags: IoFlags, ext: AudioPortMixExt) -> Self {
        Self::with_ext(id, name, flags, AudioPortExt::Mix(ext))
    }

    fn with_ext(id: i32, name: impl Into<String>, flags: IoFlags, ext: AudioPortExt) -> Self {
        Self {
            id,
            name: name.into(),
            profiles: Vec::new(),
            flags,
            gains: Vec::new(),
            ext,
            extra_audio_descriptors: Vec::new(),
        }
    }

    pub fn with_profiles(mut self, profiles: Vec<AudioProfile>) -> Self {
        self.profiles = profiles;
        self
    }

    pub fn with_gains(mut self, gains: Vec<AudioGain>) -> Self {
        self.gains = gains;
        self
    }

    pub fn ext(&self) -> &AudioPortExt {
        &self.ext
    }

    pub fn device_ext(&self) -> Option<&AudioPortDeviceExt> {
        self.ext.as_device()
    }

    pub fn device_ext_mut(&mut self) -> Option<&mut AudioPortDeviceExt> {
        match &mut self.ext {
            AudioPortExt::Device(ext) => Some(ext),
            _ => None,
        }
    }

    pub fn mix_ext(&self) -> Option<&AudioPortMixExt> {
        self.ext.as_mix()
    }

    pub fn is_device_port(&self) -> bool {
        self.ext.tag() == PortExtTag::Device
    }

    pub fn is_mix_port(&self) -> bool {
        self.ext.tag() == PortExtTag::Mix
    }

    /// Device of a device port
    pub fn device(&self) -> Option<&AudioDevice> {
        self.device_ext().map(|ext| &ext.device)
    }

    /// Template device ports carry a non-empty connection type
    pub fn is_external_device_port(&self) -> bool {
        self.device()
            .map(|device| device.device_type.is_external())
            .unwrap_or(false)
    }
}

/// A concrete (or requested) instantiation of a port
///
/// In requests any field may be left unset; the resolver fills the blanks from
/// the port's suggested configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AudioPortConfig {
    pub id: i32,
    pub port_id: i32,
    #[serde(default)]
    pub sample_rate: Option<u32>,
    #[serde(default)]
    pub channel_mask: Option<ChannelLayout>,
    #[serde(default)]
    pub format: Option<AudioFormat>,
    #[serde(default)]
    pub gain: Option<AudioGainConfig>,
    #[serde(default)]
    pub flags: Option<IoFlags>,
    #[serde(default)]
    pub ext: AudioPortExt,
}

impl AudioPortConfig {
    /// Request for a new config on `port_id`
    pub fn for_port(port_id: i32) -> Self {
        Self {
            port_id,
            ..Default::default()
        }
    }

    /// Request updating the existing config `id`
    pub fn for_existing(id: i32) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    pub fn with_sample_rate(mut self, rate: u32) -> Self {
        self.sample_rate = Some(rate);
        self
    }

    pub fn with_channel_mask(mut self, mask: ChannelLayout) -> Self {
        self.channel_mask = Some(mask);
        self
    }

    pub fn with_format(mut self, format: AudioFormat) -> Self {
        self.format = Some(format);
        self
    }

    pub fn with_flags(mut self, flags: IoFlags) -> Self {
        self.flags = Some(flags);
        self
    }

    pub fn with_gain(mut self, gain: AudioGainConfig) -> Self {
        self.gain = Some(gain);
        self
    }

    pub fn with_ext(mut self, ext: AudioPortExt) -> Self {
        self.ext = ext;
        self
    }
}

/// An allowed connection: any of the sources may feed the sink
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AudioRoute {
    pub source_port_ids: Vec<i32>,
    pub sink_port_id: i32,
    /// An exclusive sink accepts one active patch at a time
    #[serde(default)]
    pub is_exclusive: bool,
}

impl AudioRoute {
    pub fn new(source_port_ids: Vec<i32>, sink_port_id: i32, is_exclusive: bool) -> Self {
        Self {
            source_port_ids,
            sink_port_id,
            is_exclusive,
        }
    }

    pub fn involves(&self, port_id: i32) -> bool {
        self.sink_port_id == port_id || self.source_port_ids.contains(&port_id)
    }
}

/// An established connection between port configs
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AudioPatch {
    pub id: i32,
    pub source_port_config_ids: Vec<i32>,
    pub sink_port_config_ids: Vec<i32>,
    #[serde(default)]
    pub minimum_stream_buffer_size_frames: i32,
    #[serde(default)]
    pub latencies_ms: Vec<i32>,
}

impl AudioPatch {
    /// Request for a new patch
    pub fn new(source_port_config_ids: Vec<i32>, sink_port_config_ids: Vec<i32>) -> Self {
        Self {
            source_port_config_ids,
            sink_port_config_ids,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.source_port_config_ids.is_empty() && self.sink_port_config_ids.is_empty()
    }

    /// Every port config id referenced by the patch, sources first
    pub fn port_config_ids(&self) -> impl Iterator<Item = i32> + '_ {
        self.source_port_config_ids
            .iter()
            .chain(self.sink_port_config_ids.iter())
            .copied()
    }
}
