//! CPAL-based discovery of connected device capabilities
//!
//! When an external device is connected, the module asks its hooks to fill in
//! the device port's profiles. [`CpalDevicePopulator`] answers by looking the
//! device up among the host's audio devices and translating the configurations
//! CPAL reports into audio profiles.

use audiohal_core::domain::audio::{
    AudioFormat, AudioProfile, ChannelLayout, DeviceAddress, HalError, PcmType, Result,
};
use audiohal_core::domain::hooks::{DefaultHooks, ModuleHooks};
use audiohal_core::domain::port::AudioPort;
use cpal::traits::{DeviceTrait, HostTrait};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Sample rates advertised for a device supporting a continuous range
pub const STANDARD_SAMPLE_RATES: [u32; 8] = [8000, 11025, 16000, 22050, 32000, 44100, 48000, 96000];

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("host error: {0}")]
    Host(String),

    #[error("no host device matches '{0}'")]
    NoMatchingDevice(String),

    #[error("device '{0}' reports no usable configuration")]
    NoUsableConfig(String),
}

impl From<BackendError> for HalError {
    fn from(e: BackendError) -> Self {
        HalError::illegal_state(e.to_string())
    }
}

/// One supported configuration range as reported by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupportedRange {
    pub sample_format: cpal::SampleFormat,
    pub channels: u16,
    pub min_sample_rate: u32,
    pub max_sample_rate: u32,
}

impl From<&cpal::SupportedStreamConfigRange> for SupportedRange {
    fn from(range: &cpal::SupportedStreamConfigRange) -> Self {
        Self {
            sample_format: range.sample_format(),
            channels: range.channels(),
            min_sample_rate: range.min_sample_rate(),
            max_sample_rate: range.max_sample_rate(),
        }
    }
}

fn pcm_format(format: cpal::SampleFormat) -> Option<AudioFormat> {
    match format {
        cpal::SampleFormat::U8 => Some(AudioFormat::Pcm(PcmType::UInt8)),
        cpal::SampleFormat::I16 => Some(AudioFormat::Pcm(PcmType::Int16)),
        cpal::SampleFormat::I32 => Some(AudioFormat::Pcm(PcmType::Int32)),
        cpal::SampleFormat::F32 => Some(AudioFormat::Pcm(PcmType::Float32)),
        _ => None,
    }
}

fn channel_layout(channels: u16) -> Option<ChannelLayout> {
    match channels {
        0 => None,
        1 => Some(ChannelLayout::MONO),
        2 => Some(ChannelLayout::STEREO),
        6 => Some(ChannelLayout::SURROUND_5_1),
        n if n < 32 => Some(ChannelLayout::IndexMask((1u32 << n) - 1)),
        _ => None,
    }
}

/// Groups host configuration ranges into one profile per sample format
///
/// Formats the HAL has no PCM type for are skipped, as are ranges that cover
/// none of the standard rates.
pub fn profiles_from_ranges(ranges: &[SupportedRange]) -> Vec<AudioProfile> {
    let mut by_format: BTreeMap<u8, AudioProfile> = BTreeMap::new();
    for range in ranges {
        let (Some(format), Some(layout)) = (pcm_format(range.sample_format), channel_layout(range.channels)) else {
            continue;
        };
        let rates: Vec<u32> = STANDARD_SAMPLE_RATES
            .iter()
            .copied()
            .filter(|rate| (range.min_sample_rate..=range.max_sample_rate).contains(rate))
            .collect();
        if rates.is_empty() {
            continue;
        }
        let key = match &format {
            AudioFormat::Pcm(pcm) => *pcm as u8,
            _ => continue,
        };
        let profile = by_format
            .entry(key)
            .or_insert_with(|| AudioProfile::new(format, Vec::new(), Vec::new()));
        if !profile.channel_masks.contains(&layout) {
            profile.channel_masks.push(layout);
        }
        for rate in rates {
            if !profile.sample_rates.contains(&rate) {
                profile.sample_rates.push(rate);
            }
        }
    }
    by_format
        .into_values()
        .map(|mut profile| {
            profile.sample_rates.sort_unstable();
            profile
        })
        .collect()
}

/// Substring expected in the host name of the device at `address`
///
/// `None` selects the host's default device.
pub fn host_name_hint(address: &DeviceAddress) -> Option<String> {
    match address {
        DeviceAddress::Empty => None,
        DeviceAddress::Alsa(values) => match values.as_slice() {
            [card, device, ..] => Some(format!("hw:{},{}", card, device)),
            [card] => Some(format!("hw:{}", card)),
            [] => None,
        },
        other => Some(other.to_string()),
    }
}

/// Module hooks that read external device capabilities from the host
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalDevicePopulator;

impl CpalDevicePopulator {
    pub fn new() -> Self {
        Self
    }

    fn find_device(is_input: bool, hint: Option<&str>) -> std::result::Result<cpal::Device, BackendError> {
        let host = cpal::default_host();
        let Some(hint) = hint else {
            let device = if is_input {
                host.default_input_device()
            } else {
                host.default_output_device()
            };
            return device.ok_or_else(|| BackendError::NoMatchingDevice("<default>".to_string()));
        };
        let devices: Vec<cpal::Device> = if is_input {
            host.input_devices().map_err(|e| BackendError::Host(e.to_string()))?.collect()
        } else {
            host.output_devices().map_err(|e| BackendError::Host(e.to_string()))?.collect()
        };
        #[allow(deprecated)]
        let found = devices
            .into_iter()
            .find(|d| d.name().map(|name| name.contains(hint)).unwrap_or(false));
        found.ok_or_else(|| BackendError::NoMatchingDevice(hint.to_string()))
    }

    fn query_ranges(device: &cpal::Device, is_input: bool) -> std::result::Result<Vec<SupportedRange>, BackendError> {
        let ranges: Vec<SupportedRange> = if is_input {
            device
                .supported_input_configs()
                .map_err(|e| BackendError::Host(e.to_string()))?
                .map(|range| SupportedRange::from(&range))
                .collect()
        } else {
            device
                .supported_output_configs()
                .map_err(|e| BackendError::Host(e.to_string()))?
                .map(|range| SupportedRange::from(&range))
                .collect()
        };
        Ok(ranges)
    }
}

impl ModuleHooks for CpalDevicePopulator {
    fn populate_connected_device_port(&self, port: &mut AudioPort, next_port_id: i32) -> Result<()> {
        if !port.is_device_port() || !port.is_external_device_port() {
            return DefaultHooks.populate_connected_device_port(port, next_port_id);
        }
        let is_input = port.flags.is_input();
        let hint = port.device().and_then(|d| host_name_hint(&d.address));
        let device = Self::find_device(is_input, hint.as_deref())?;

        #[allow(deprecated)]
        let name = device.name().unwrap_or_else(|_| "Unknown Device".to_string());
        info!(port = %port.name, host_device = %name, "Querying connected device capabilities");

        let ranges = Self::query_ranges(&device, is_input)?;
        let profiles = profiles_from_ranges(&ranges);
        if profiles.is_empty() {
            warn!(host_device = %name, ranges = ranges.len(), "No usable configuration reported");
            return Err(BackendError::NoUsableConfig(name).into());
        }
        debug!(port = %port.name, profiles = profiles.len(), "Populated connected device port");
        port.profiles = profiles;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(sample_format: cpal::SampleFormat, channels: u16, min: u32, max: u32) -> SupportedRange {
        SupportedRange {
            sample_format,
            channels,
            min_sample_rate: min,
            max_sample_rate: max,
        }
    }

    #[test]
    fn test_profiles_grouped_by_format() {
        let profiles = profiles_from_ranges(&[
            range(cpal::SampleFormat::I16, 2, 44100, 48000),
            range(cpal::SampleFormat::I16, 1, 8000, 16000),
            range(cpal::SampleFormat::F32, 2, 48000, 48000),
        ]);
        assert_eq!(profiles.len(), 2);

        let pcm16 = profiles.iter().find(|p| p.format == AudioFormat::PCM_16_BIT).unwrap();
        assert_eq!(pcm16.channel_masks, vec![ChannelLayout::STEREO, ChannelLayout::MONO]);
        assert_eq!(pcm16.sample_rates, vec![8000, 11025, 16000, 44100, 48000]);

        let float = profiles.iter().find(|p| p.format == AudioFormat::PCM_FLOAT).unwrap();
        assert_eq!(float.sample_rates, vec![48000]);
        assert!(profiles.iter().all(|p| !p.is_dynamic()));
    }

    #[test]
    fn test_unusable_ranges_skipped() {
        let profiles = profiles_from_ranges(&[
            range(cpal::SampleFormat::I16, 2, 1000, 2000),
            range(cpal::SampleFormat::I16, 0, 48000, 48000),
            range(cpal::SampleFormat::F64, 2, 48000, 48000),
        ]);
        assert!(profiles.is_empty());
    }

    #[test]
    fn test_multichannel_layouts() {
        assert_eq!(channel_layout(6), Some(ChannelLayout::SURROUND_5_1));
        assert_eq!(channel_layout(4), Some(ChannelLayout::IndexMask(0b1111)));
        assert_eq!(channel_layout(0), None);
    }

    #[test]
    fn test_host_name_hint() {
        assert_eq!(host_name_hint(&DeviceAddress::Empty), None);
        assert_eq!(host_name_hint(&DeviceAddress::Alsa(vec![1, 0])), Some("hw:1,0".to_string()));
        assert_eq!(host_name_hint(&DeviceAddress::Id("Scarlett".into())), Some("Scarlett".to_string()));
    }

    #[test]
    fn test_attached_ports_pass_through() {
        use audiohal_core::domain::audio::{AudioDevice, DeviceKind, IoFlags};
        use audiohal_core::domain::port::AudioPortDeviceExt;

        let mut speaker = AudioPort::new_device(
            1,
            "Speaker",
            IoFlags::Output(0),
            AudioPortDeviceExt::new(AudioDevice::new(DeviceKind::OutSpeaker, "")),
        );
        assert!(CpalDevicePopulator::new().populate_connected_device_port(&mut speaker, 2).is_ok());
    }
}
