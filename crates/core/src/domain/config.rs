//! Module configuration files
//!
//! This module provides:
//! - The TOML description of a module's topology (`ModuleConfigFile`)
//! - Conversion of that description into the in-memory graph
//! - A factory default describing a typical primary module
//! - `ConfigManager`, which keeps the file under the user's config directory
//! - The `ConfigurationLoader` seam used by modules to obtain their graph lazily

use crate::domain::audio::{
    gain_mode, input_flags, output_flags, AudioDevice, AudioFormat, AudioGain, AudioProfile,
    ChannelLayout, DeviceAddress, DeviceKind, IoFlags, connection,
};
use crate::domain::module::ModuleKind;
use crate::domain::port::{AudioPort, AudioPortDeviceExt, AudioPortMixExt, AudioRoute};
use crate::domain::resolver::generate_default_port_config;
use crate::domain::store::Configuration;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, error, info, instrument, warn};

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors that can occur during configuration operations
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Unknown port in route: {0}")]
    UnknownPort(String),
}

/// Source of a module's initial graph
///
/// Called once, on the first operation that needs the graph.
pub trait ConfigurationLoader: Send + Sync {
    fn load(&self) -> Configuration;
}

impl<F> ConfigurationLoader for F
where
    F: Fn() -> Configuration + Send + Sync,
{
    fn load(&self) -> Configuration {
        self()
    }
}

impl ConfigurationLoader for Configuration {
    fn load(&self) -> Configuration {
        self.clone()
    }
}

/// Stream direction of a mix port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Input,
    Output,
}

/// `[module]` table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleSettings {
    pub name: String,

    #[serde(default)]
    pub kind: ModuleKind,

    /// Connect external devices without querying the hardware
    #[serde(default)]
    pub simulate_device_connections: bool,

    #[serde(default)]
    pub stream_transient_state_delay_ms: i32,
}

/// `[[device_ports]]` entry
///
/// A device port with an empty connection is permanently attached; any other
/// connection makes it a template for external devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevicePortEntry {
    pub name: String,

    pub kind: DeviceKind,

    #[serde(default)]
    pub connection: String,

    #[serde(default)]
    pub address: DeviceAddress,

    #[serde(default)]
    pub default_device: bool,

    #[serde(default)]
    pub profiles: Vec<AudioProfile>,

    #[serde(default)]
    pub gains: Vec<AudioGain>,
}

impl DevicePortEntry {
    pub fn attached(name: &str, kind: DeviceKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            connection: String::new(),
            address: DeviceAddress::Empty,
            default_device: false,
            profiles: Vec::new(),
            gains: Vec::new(),
        }
    }

    pub fn template(name: &str, kind: DeviceKind, connection: &str) -> Self {
        Self {
            connection: connection.to_string(),
            ..Self::attached(name, kind)
        }
    }

    pub fn with_profiles(mut self, profiles: Vec<AudioProfile>) -> Self {
        self.profiles = profiles;
        self
    }
}

fn default_max_open_stream_count() -> i32 {
    1
}

/// `[[mix_ports]]` entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MixPortEntry {
    pub name: String,

    pub direction: Direction,

    /// Flag names, e.g. `primary`, `deep_buffer`, `mmap_noirq`
    #[serde(default)]
    pub flags: Vec<String>,

    /// 0 = unlimited
    #[serde(default = "default_max_open_stream_count")]
    pub max_open_stream_count: i32,

    #[serde(default)]
    pub max_active_stream_count: i32,

    #[serde(default)]
    pub recommended_mute_duration_ms: i32,

    #[serde(default)]
    pub profiles: Vec<AudioProfile>,

    #[serde(default)]
    pub gains: Vec<AudioGain>,
}

impl MixPortEntry {
    pub fn new(name: &str, direction: Direction, flags: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            direction,
            flags: flags.iter().map(|f| f.to_string()).collect(),
            max_open_stream_count: 1,
            max_active_stream_count: 1,
            recommended_mute_duration_ms: 0,
            profiles: Vec::new(),
            gains: Vec::new(),
        }
    }

    pub fn with_profiles(mut self, profiles: Vec<AudioProfile>) -> Self {
        self.profiles = profiles;
        self
    }
}

/// `[[routes]]` entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEntry {
    pub sources: Vec<String>,
    pub sink: String,

    /// A mux sink accepts a single active connection
    #[serde(default)]
    pub mux: bool,
}

impl RouteEntry {
    pub fn new(sources: &[&str], sink: &str) -> Self {
        Self {
            sources: sources.iter().map(|s| s.to_string()).collect(),
            sink: sink.to_string(),
            mux: false,
        }
    }
}

/// Complete module description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleConfigFile {
    pub module: ModuleSettings,

    #[serde(default)]
    pub device_ports: Vec<DevicePortEntry>,

    #[serde(default)]
    pub mix_ports: Vec<MixPortEntry>,

    #[serde(default)]
    pub routes: Vec<RouteEntry>,
}

fn parse_flags(direction: Direction, names: &[String], port: &str) -> Result<IoFlags> {
    let mut bits = 0;
    for name in names {
        let bit = match direction {
            Direction::Input => input_flags::from_name(name),
            Direction::Output => output_flags::from_name(name),
        };
        bits |= bit.ok_or_else(|| {
            ConfigError::Invalid(format!("unknown {:?} flag '{}' on port '{}'", direction, name, port))
        })?;
    }
    Ok(match direction {
        Direction::Input => IoFlags::Input(bits),
        Direction::Output => IoFlags::Output(bits),
    })
}

fn pcm_profile(masks: &[ChannelLayout], rates: &[u32]) -> AudioProfile {
    AudioProfile::new(AudioFormat::PCM_16_BIT, masks.to_vec(), rates.to_vec())
}

impl ModuleConfigFile {
    /// Parses a TOML document
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Load configuration from TOML file
    #[instrument(skip(path))]
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading module configuration");

        let contents = fs::read_to_string(path).await?;
        let config = Self::from_toml_str(&contents)?;

        debug!(name = %config.module.name, "Module configuration loaded successfully");
        Ok(config)
    }

    /// Save configuration to TOML file
    #[instrument(skip(self, path))]
    pub async fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        info!(path = %path.display(), "Saving module configuration");

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        fs::write(path, self.to_toml_string()?).await?;

        debug!("Module configuration saved successfully");
        Ok(())
    }

    /// Builds the in-memory graph
    ///
    /// Ids are handed out in file order, device ports first. Attached device
    /// ports receive an initial config sharing their port id.
    pub fn into_configuration(&self) -> Result<Configuration> {
        let mut config = Configuration::new();
        let mut ids_by_name: BTreeMap<&str, i32> = BTreeMap::new();

        for entry in &self.device_ports {
            if entry.kind == DeviceKind::None {
                return Err(ConfigError::Invalid(format!(
                    "device port '{}' has no device kind",
                    entry.name
                )));
            }
            let id = config.allocate_port_id();
            if ids_by_name.insert(entry.name.as_str(), id).is_some() {
                return Err(ConfigError::Invalid(format!("duplicate port name '{}'", entry.name)));
            }
            let flags = if entry.kind.is_input() {
                IoFlags::Input(0)
            } else {
                IoFlags::Output(0)
            };
            let mut ext = AudioPortDeviceExt::new(
                AudioDevice::new(entry.kind, &entry.connection).with_address(entry.address.clone()),
            );
            if entry.default_device {
                ext.flags |= AudioPortDeviceExt::FLAG_DEFAULT_DEVICE;
            }
            config.ports.push(
                AudioPort::new_device(id, entry.name.clone(), flags, ext)
                    .with_profiles(entry.profiles.clone())
                    .with_gains(entry.gains.clone()),
            );
        }

        let has_default_input = config
            .ports
            .iter()
            .any(|p| p.flags.is_input() && p.device_ext().map(|e| e.is_default()).unwrap_or(false));
        if !has_default_input {
            if let Some(ext) = config
                .ports
                .iter_mut()
                .find(|p| p.flags.is_input() && !p.is_external_device_port())
                .and_then(AudioPort::device_ext_mut)
            {
                ext.flags |= AudioPortDeviceExt::FLAG_DEFAULT_DEVICE;
            }
        }

        for entry in &self.mix_ports {
            let id = config.allocate_port_id();
            if ids_by_name.insert(entry.name.as_str(), id).is_some() {
                return Err(ConfigError::Invalid(format!("duplicate port name '{}'", entry.name)));
            }
            let flags = parse_flags(entry.direction, &entry.flags, &entry.name)?;
            let ext = AudioPortMixExt {
                max_open_stream_count: entry.max_open_stream_count,
                max_active_stream_count: entry.max_active_stream_count,
                recommended_mute_duration_ms: entry.recommended_mute_duration_ms,
                ..Default::default()
            };
            config.ports.push(
                AudioPort::new_mix(id, entry.name.clone(), flags, ext)
                    .with_profiles(entry.profiles.clone())
                    .with_gains(entry.gains.clone()),
            );
        }

        let lookup = |name: &str| {
            ids_by_name
                .get(name)
                .copied()
                .ok_or_else(|| ConfigError::UnknownPort(name.to_string()))
        };
        for entry in &self.routes {
            let sink = lookup(&entry.sink)?;
            let sources = entry
                .sources
                .iter()
                .map(|name| lookup(name))
                .collect::<Result<Vec<_>>>()?;
            if sources.is_empty() {
                return Err(ConfigError::Invalid(format!("route to '{}' has no sources", entry.sink)));
            }
            config.routes.push(AudioRoute::new(sources, sink, entry.mux));
        }

        for port in config.ports.iter().filter(|p| p.is_device_port() && !p.is_external_device_port()) {
            if let Some(mut initial) = generate_default_port_config(port) {
                initial.id = port.id;
                config.initial_configs.push(initial);
            }
        }
        config.port_configs = config.initial_configs.clone();
        config.populate_connected_profiles();

        debug!(
            module = %self.module.name,
            ports = config.ports.len(),
            routes = config.routes.len(),
            initial_configs = config.initial_configs.len(),
            "Configuration built"
        );
        Ok(config)
    }

    /// Topology of a typical primary module
    pub fn factory_default() -> Self {
        const ALL_RATES: [u32; 6] = [8000, 11025, 16000, 32000, 44100, 48000];
        let stereo = [ChannelLayout::STEREO];
        let mono = [ChannelLayout::MONO];
        let mono_stereo = [ChannelLayout::MONO, ChannelLayout::STEREO];

        let mut speaker = DevicePortEntry::attached("Speaker", DeviceKind::OutSpeaker)
            .with_profiles(vec![pcm_profile(&stereo, &[44100, 48000])]);
        speaker.default_device = true;
        speaker.gains = vec![AudioGain {
            mode: gain_mode::JOINT,
            channel_mask: ChannelLayout::STEREO,
            min_value: -6000,
            max_value: 0,
            default_value: 0,
            step_value: 100,
            min_ramp_ms: 100,
            max_ramp_ms: 100,
            use_for_volume: true,
        }];

        let device_ports = vec![
            speaker,
            DevicePortEntry::attached("Built-In Mic", DeviceKind::InMicrophone)
                .with_profiles(vec![pcm_profile(&mono_stereo, &ALL_RATES)]),
            DevicePortEntry::attached("Telephony Tx", DeviceKind::OutTelephonyTx)
                .with_profiles(vec![pcm_profile(&mono, &[8000, 16000])]),
            DevicePortEntry::attached("Telephony Rx", DeviceKind::InTelephonyRx)
                .with_profiles(vec![pcm_profile(&mono, &[8000, 16000])]),
            DevicePortEntry::attached("FM Tuner", DeviceKind::InFmTuner)
                .with_profiles(vec![pcm_profile(&stereo, &[48000])]),
            DevicePortEntry::template("Wired Headset Out", DeviceKind::OutHeadset, connection::ANALOG),
            DevicePortEntry::template("USB Device Out", DeviceKind::OutDevice, connection::USB),
            DevicePortEntry::template("USB Device In", DeviceKind::InDevice, connection::USB),
        ];

        let mut compressed = MixPortEntry::new(
            "compressed offload",
            Direction::Output,
            &["direct", "compress_offload", "non_blocking"],
        )
        .with_profiles(vec![AudioProfile::new(
            AudioFormat::NonPcm("audio/mpeg".to_string()),
            vec![ChannelLayout::MONO, ChannelLayout::STEREO],
            vec![44100, 48000],
        )]);
        compressed.max_active_stream_count = 1;

        let mix_ports = vec![
            MixPortEntry::new("primary output", Direction::Output, &["primary"])
                .with_profiles(vec![pcm_profile(&stereo, &[44100, 48000])]),
            MixPortEntry::new("primary input", Direction::Input, &[])
                .with_profiles(vec![pcm_profile(&mono_stereo, &ALL_RATES)]),
            compressed,
            MixPortEntry::new("telephony_tx", Direction::Output, &[])
                .with_profiles(vec![pcm_profile(&mono, &[8000, 16000])]),
            MixPortEntry::new("telephony_rx", Direction::Input, &[])
                .with_profiles(vec![pcm_profile(&mono, &[8000, 16000])]),
            MixPortEntry::new("fm_tuner", Direction::Input, &[])
                .with_profiles(vec![pcm_profile(&stereo, &[48000])]),
            MixPortEntry::new("usb out", Direction::Output, &["direct"]),
            MixPortEntry::new("usb in", Direction::Input, &[]),
            MixPortEntry::new("mmap out", Direction::Output, &["direct", "mmap_noirq"])
                .with_profiles(vec![pcm_profile(&stereo, &[48000])]),
        ];

        let mut telephony_rx = RouteEntry::new(&["Telephony Rx", "FM Tuner"], "telephony_rx");
        telephony_rx.mux = true;

        let routes = vec![
            RouteEntry::new(&["primary output", "compressed offload", "mmap out"], "Speaker"),
            RouteEntry::new(&["primary output", "compressed offload"], "Wired Headset Out"),
            RouteEntry::new(&["primary output", "usb out"], "USB Device Out"),
            RouteEntry::new(&["telephony_tx"], "Telephony Tx"),
            RouteEntry::new(&["Built-In Mic", "USB Device In"], "primary input"),
            RouteEntry::new(&["USB Device In"], "usb in"),
            telephony_rx,
            RouteEntry::new(&["FM Tuner"], "fm_tuner"),
        ];

        Self {
            module: ModuleSettings {
                name: "primary".to_string(),
                kind: ModuleKind::Default,
                simulate_device_connections: false,
                stream_transient_state_delay_ms: 0,
            },
            device_ports,
            mix_ports,
            routes,
        }
    }
}

impl ConfigurationLoader for ModuleConfigFile {
    /// Invalid descriptions yield an empty graph
    fn load(&self) -> Configuration {
        match self.into_configuration() {
            Ok(config) => config,
            Err(e) => {
                error!(module = %self.module.name, error = %e, "Invalid module description, using an empty graph");
                Configuration::new()
            }
        }
    }
}

/// Configuration manager for the module description file
///
/// Manages the file at `~/.config/audiohal/module.toml`.
pub struct ConfigManager {
    config_dir: PathBuf,
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a new ConfigManager
    ///
    /// # Arguments
    /// * `config_dir` - Configuration directory path (e.g., `~/.config/audiohal`)
    pub fn new(config_dir: PathBuf) -> Self {
        let config_path = config_dir.join("module.toml");
        Self {
            config_dir,
            config_path,
        }
    }

    /// Get the default config directory path
    ///
    /// Returns `~/.config/audiohal` on Linux, the platform equivalent elsewhere
    pub fn default_config_dir() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|p| p.join("audiohal"))
            .ok_or_else(|| ConfigError::Invalid("Could not determine config directory".to_string()))
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Load the module description
    ///
    /// A missing file is replaced by the factory default. A file that does not
    /// parse or does not describe a consistent graph is backed up next to the
    /// original and the factory default is returned.
    #[instrument(skip(self))]
    pub async fn load(&self) -> ModuleConfigFile {
        if !self.config_path.exists() {
            info!(
                path = %self.config_path.display(),
                "Module file not found, creating factory default"
            );

            let config = ModuleConfigFile::factory_default();
            if let Err(e) = self.save(&config).await {
                error!(
                    path = %self.config_path.display(),
                    error = %e,
                    "Failed to save factory default module file"
                );
            }
            return config;
        }

        let loaded = match ModuleConfigFile::load_from_file(&self.config_path).await {
            Ok(config) => config.into_configuration().map(|_| config),
            Err(e) => Err(e),
        };
        match loaded {
            Ok(config) => {
                info!(path = %self.config_path.display(), "Module file loaded successfully");
                config
            }
            Err(e) => {
                error!(
                    path = %self.config_path.display(),
                    error = %e,
                    "Failed to load module file, using factory default"
                );

                let backup_path = self.config_path.with_extension("toml.corrupt");
                if let Err(copy_err) = fs::copy(&self.config_path, &backup_path).await {
                    warn!(
                        path = %backup_path.display(),
                        error = %copy_err,
                        "Failed to backup corrupt module file"
                    );
                }

                ModuleConfigFile::factory_default()
            }
        }
    }

    #[instrument(skip(self, config))]
    pub async fn save(&self, config: &ModuleConfigFile) -> Result<()> {
        fs::create_dir_all(&self.config_dir).await?;
        config.save_to_file(&self.config_path).await
    }

    pub fn exists(&self) -> bool {
        self.config_path.exists()
    }
}
