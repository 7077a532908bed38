//! Audio value types and the HAL error taxonomy
//!
//! This module defines the platform-agnostic descriptions the routing graph is
//! built from: formats, channel layouts, capability profiles, I/O flags,
//! physical devices and gain stages. None of these types carry behavior beyond
//! simple queries; the graph logic lives in the sibling modules.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors reported to clients of the module
///
/// Internal invariant violations are not represented here: they abort the
/// process instead of surfacing as a categorical outcome.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HalError {
    /// Malformed request: unknown ids, duplicates, values outside the port's capabilities
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The request is well formed but the current graph state forbids it
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// The operation is not implemented at this layer
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

impl HalError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn illegal_state(msg: impl Into<String>) -> Self {
        Self::IllegalState(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, HalError>;

/// PCM sample encodings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PcmType {
    UInt8,
    Int16,
    Int32,
    FixedQ824,
    Float32,
    Int24,
}

impl PcmType {
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            PcmType::UInt8 => 1,
            PcmType::Int16 => 2,
            PcmType::Int24 => 3,
            PcmType::Int32 | PcmType::FixedQ824 | PcmType::Float32 => 4,
        }
    }
}

/// Audio data format
///
/// `Default` is the wildcard used by dynamic profiles: the actual format is
/// only known once an external device is connected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioFormat {
    #[default]
    Default,
    Pcm(PcmType),
    /// Encoded stream identified by its MIME type, e.g. `audio/mpeg`
    NonPcm(String),
}

impl AudioFormat {
    pub const PCM_16_BIT: AudioFormat = AudioFormat::Pcm(PcmType::Int16);
    pub const PCM_24_BIT: AudioFormat = AudioFormat::Pcm(PcmType::Int24);
    pub const PCM_FLOAT: AudioFormat = AudioFormat::Pcm(PcmType::Float32);

    pub fn is_dynamic(&self) -> bool {
        matches!(self, AudioFormat::Default)
    }

    pub fn is_pcm(&self) -> bool {
        matches!(self, AudioFormat::Pcm(_))
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AudioFormat::Default => write!(f, "default"),
            AudioFormat::Pcm(pcm) => write!(f, "pcm:{:?}", pcm),
            AudioFormat::NonPcm(encoding) => write!(f, "{}", encoding),
        }
    }
}

/// Channel position bits used by positional layouts
pub mod channel {
    pub const FRONT_LEFT: u32 = 1 << 0;
    pub const FRONT_RIGHT: u32 = 1 << 1;
    pub const FRONT_CENTER: u32 = 1 << 2;
    pub const LOW_FREQUENCY: u32 = 1 << 3;
    pub const BACK_LEFT: u32 = 1 << 4;
    pub const BACK_RIGHT: u32 = 1 << 5;
}

/// Channel layout of a stream or profile
///
/// `None` is the wildcard used by dynamic profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelLayout {
    #[default]
    None,
    /// Positional layout built from [`channel`] bits
    Layout(u32),
    /// Non-positional layout, one bit per channel index
    IndexMask(u32),
}

impl ChannelLayout {
    pub const MONO: ChannelLayout = ChannelLayout::Layout(channel::FRONT_LEFT);
    pub const STEREO: ChannelLayout =
        ChannelLayout::Layout(channel::FRONT_LEFT | channel::FRONT_RIGHT);
    pub const SURROUND_5_1: ChannelLayout = ChannelLayout::Layout(
        channel::FRONT_LEFT
            | channel::FRONT_RIGHT
            | channel::FRONT_CENTER
            | channel::LOW_FREQUENCY
            | channel::BACK_LEFT
            | channel::BACK_RIGHT,
    );

    pub fn is_dynamic(&self) -> bool {
        matches!(self, ChannelLayout::None)
    }

    pub fn channel_count(&self) -> usize {
        match self {
            ChannelLayout::None => 0,
            ChannelLayout::Layout(mask) | ChannelLayout::IndexMask(mask) => {
                mask.count_ones() as usize
            }
        }
    }
}

/// Size in bytes of one audio frame, or 0 when it can not be derived
pub fn frame_size_in_bytes(format: &AudioFormat, layout: &ChannelLayout) -> usize {
    match format {
        AudioFormat::Pcm(pcm) => pcm.bytes_per_sample() * layout.channel_count(),
        AudioFormat::NonPcm(_) => 1,
        AudioFormat::Default => 0,
    }
}

/// A capability entry of a port: one format with its channel layouts and rates
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AudioProfile {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub format: AudioFormat,
    #[serde(default)]
    pub channel_masks: Vec<ChannelLayout>,
    #[serde(default)]
    pub sample_rates: Vec<u32>,
}

impl AudioProfile {
    pub fn new(format: AudioFormat, channel_masks: Vec<ChannelLayout>, sample_rates: Vec<u32>) -> Self {
        Self {
            name: String::new(),
            format,
            channel_masks,
            sample_rates,
        }
    }

    /// A profile is dynamic when any of its dimensions is a wildcard
    pub fn is_dynamic(&self) -> bool {
        self.format.is_dynamic()
            || self.channel_masks.iter().all(ChannelLayout::is_dynamic)
            || self.sample_rates.iter().all(|&rate| rate == 0)
    }
}

/// True when no profile of the set can be used without external resolution
pub fn has_dynamic_profiles_only(profiles: &[AudioProfile]) -> bool {
    profiles.iter().all(AudioProfile::is_dynamic)
}

/// Standard 16-bit and 24-bit PCM profiles used for simulated device connections
pub fn standard_pcm_profiles() -> Vec<AudioProfile> {
    const RATES: [u32; 6] = [8000, 11025, 16000, 32000, 44100, 48000];
    [AudioFormat::PCM_16_BIT, AudioFormat::PCM_24_BIT]
        .into_iter()
        .map(|format| {
            AudioProfile::new(
                format,
                vec![ChannelLayout::MONO, ChannelLayout::STEREO],
                RATES.to_vec(),
            )
        })
        .collect()
}

/// Input flag bits (`IoFlags::Input`)
pub mod input_flags {
    pub const FAST: u32 = 1 << 0;
    pub const HW_HOTWORD: u32 = 1 << 1;
    pub const RAW: u32 = 1 << 2;
    pub const SYNC: u32 = 1 << 3;
    pub const MMAP_NOIRQ: u32 = 1 << 4;
    pub const VOIP_TX: u32 = 1 << 5;
    pub const HW_AV_SYNC: u32 = 1 << 6;
    pub const DIRECT: u32 = 1 << 7;

    pub fn from_name(name: &str) -> Option<u32> {
        match name {
            "fast" => Some(FAST),
            "hw_hotword" => Some(HW_HOTWORD),
            "raw" => Some(RAW),
            "sync" => Some(SYNC),
            "mmap_noirq" => Some(MMAP_NOIRQ),
            "voip_tx" => Some(VOIP_TX),
            "hw_av_sync" => Some(HW_AV_SYNC),
            "direct" => Some(DIRECT),
            _ => None,
        }
    }
}

/// Output flag bits (`IoFlags::Output`)
pub mod output_flags {
    pub const DIRECT: u32 = 1 << 0;
    pub const PRIMARY: u32 = 1 << 1;
    pub const FAST: u32 = 1 << 2;
    pub const DEEP_BUFFER: u32 = 1 << 3;
    pub const COMPRESS_OFFLOAD: u32 = 1 << 4;
    pub const NON_BLOCKING: u32 = 1 << 5;
    pub const HW_AV_SYNC: u32 = 1 << 6;
    pub const RAW: u32 = 1 << 8;
    pub const SYNC: u32 = 1 << 9;
    pub const MMAP_NOIRQ: u32 = 1 << 12;
    pub const VOIP_RX: u32 = 1 << 13;

    pub fn from_name(name: &str) -> Option<u32> {
        match name {
            "direct" => Some(DIRECT),
            "primary" => Some(PRIMARY),
            "fast" => Some(FAST),
            "deep_buffer" => Some(DEEP_BUFFER),
            "compress_offload" => Some(COMPRESS_OFFLOAD),
            "non_blocking" => Some(NON_BLOCKING),
            "hw_av_sync" => Some(HW_AV_SYNC),
            "raw" => Some(RAW),
            "sync" => Some(SYNC),
            "mmap_noirq" => Some(MMAP_NOIRQ),
            "voip_rx" => Some(VOIP_RX),
            _ => None,
        }
    }
}

/// Direction of a port together with its behavioral flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoFlags {
    Input(u32),
    Output(u32),
}

impl IoFlags {
    pub fn is_input(&self) -> bool {
        matches!(self, IoFlags::Input(_))
    }

    pub fn bits(&self) -> u32 {
        match self {
            IoFlags::Input(bits) | IoFlags::Output(bits) => *bits,
        }
    }

    pub fn has(&self, flag: u32) -> bool {
        self.bits() & flag != 0
    }

    pub fn has_mmap(&self) -> bool {
        match self {
            IoFlags::Input(bits) => bits & input_flags::MMAP_NOIRQ != 0,
            IoFlags::Output(bits) => bits & output_flags::MMAP_NOIRQ != 0,
        }
    }
}

impl Default for IoFlags {
    fn default() -> Self {
        IoFlags::Output(0)
    }
}

/// Physical device categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    #[default]
    None,
    InDefault,
    InMicrophone,
    InMicrophoneBack,
    InHeadset,
    InDevice,
    InSubmix,
    InTelephonyRx,
    InFmTuner,
    InEchoReference,
    OutDefault,
    OutSpeaker,
    OutSpeakerEarpiece,
    OutHeadset,
    OutHeadphone,
    OutDevice,
    OutSubmix,
    OutTelephonyTx,
    OutLineAux,
    OutHearingAid,
}

impl DeviceKind {
    pub fn is_input(&self) -> bool {
        matches!(
            self,
            DeviceKind::InDefault
                | DeviceKind::InMicrophone
                | DeviceKind::InMicrophoneBack
                | DeviceKind::InHeadset
                | DeviceKind::InDevice
                | DeviceKind::InSubmix
                | DeviceKind::InTelephonyRx
                | DeviceKind::InFmTuner
                | DeviceKind::InEchoReference
        )
    }

    pub fn is_microphone(&self) -> bool {
        matches!(self, DeviceKind::InMicrophone | DeviceKind::InMicrophoneBack)
    }
}

/// Connection type strings; empty means permanently attached
pub mod connection {
    pub const ANALOG: &str = "analog";
    pub const BT_A2DP: &str = "bt-a2dp";
    pub const BT_LE: &str = "bt-le";
    pub const BT_SCO: &str = "bt-sco";
    pub const BUS: &str = "bus";
    pub const HDMI: &str = "hdmi";
    pub const IP_V4: &str = "ip-v4";
    pub const USB: &str = "usb";
    pub const VIRTUAL: &str = "virtual";
    pub const WIRELESS: &str = "wireless";
}

/// Device type: category plus connection
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct AudioDeviceType {
    pub kind: DeviceKind,
    #[serde(default)]
    pub connection: String,
}

impl AudioDeviceType {
    pub fn new(kind: DeviceKind, connection: &str) -> Self {
        Self {
            kind,
            connection: connection.to_string(),
        }
    }

    pub fn is_external(&self) -> bool {
        !self.connection.is_empty()
    }
}

/// Address distinguishing devices of the same type
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceAddress {
    #[default]
    Empty,
    Id(String),
    Mac([u8; 6]),
    Ipv4([u8; 4]),
    /// ALSA card and device numbers
    Alsa(Vec<i32>),
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceAddress::Empty => write!(f, "<empty>"),
            DeviceAddress::Id(id) => write!(f, "{}", id),
            DeviceAddress::Mac(mac) => write!(
                f,
                "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
                mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
            ),
            DeviceAddress::Ipv4(ip) => write!(f, "{}.{}.{}.{}", ip[0], ip[1], ip[2], ip[3]),
            DeviceAddress::Alsa(values) => write!(f, "alsa{:?}", values),
        }
    }
}

/// A physical audio device: type plus address
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct AudioDevice {
    pub device_type: AudioDeviceType,
    #[serde(default)]
    pub address: DeviceAddress,
}

impl AudioDevice {
    pub fn new(kind: DeviceKind, connection: &str) -> Self {
        Self {
            device_type: AudioDeviceType::new(kind, connection),
            address: DeviceAddress::Empty,
        }
    }

    pub fn with_address(mut self, address: DeviceAddress) -> Self {
        self.address = address;
        self
    }
}

impl fmt::Display for AudioDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.device_type.kind)?;
        if self.device_type.is_external() {
            write!(f, "/{}", self.device_type.connection)?;
        }
        write!(f, "@{}", self.address)
    }
}

/// Gain mode bits
pub mod gain_mode {
    pub const JOINT: u32 = 1 << 0;
    pub const CHANNELS: u32 = 1 << 1;
    pub const RAMP: u32 = 1 << 2;
}

/// A gain stage of a port, values in millibels
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AudioGain {
    #[serde(default)]
    pub mode: u32,
    #[serde(default)]
    pub channel_mask: ChannelLayout,
    pub min_value: i32,
    pub max_value: i32,
    #[serde(default)]
    pub default_value: i32,
    pub step_value: i32,
    #[serde(default)]
    pub min_ramp_ms: i32,
    #[serde(default)]
    pub max_ramp_ms: i32,
    #[serde(default)]
    pub use_for_volume: bool,
}

/// A requested gain setting referencing one of the port's gain stages
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AudioGainConfig {
    pub index: i32,
    #[serde(default)]
    pub mode: u32,
    #[serde(default)]
    pub channel_mask: ChannelLayout,
    pub values: Vec<i32>,
    #[serde(default)]
    pub ramp_duration_ms: i32,
}

impl AudioGainConfig {
    pub fn joint(index: i32, value_mb: i32) -> Self {
        Self {
            index,
            mode: gain_mode::JOINT,
            channel_mask: ChannelLayout::None,
            values: vec![value_mb],
            ramp_duration_ms: 0,
        }
    }
}
