//! The module facade: one audio HAL module and its routing graph
//!
//! All graph state lives in [`ModuleState`] behind a single mutex, which makes
//! every public operation atomic with respect to the others. Open streams live
//! in a separate lock domain ([`StreamRegistryHandle`]); when both are needed
//! the state lock is always acquired first.
//!
//! The configuration is loaded lazily on first access through the
//! [`ConfigurationLoader`] supplied at construction.

use crate::domain::audio::{frame_size_in_bytes, output_flags, AudioDevice, HalError, Result};
use crate::domain::config::ConfigurationLoader;
use crate::domain::hooks::{DefaultHooks, ModuleHooks, MAXIMUM_STREAM_BUFFER_SIZE_BYTES};
use crate::domain::patch::PatchIndex;
use crate::domain::port::{AudioPatch, AudioPort, AudioPortConfig, AudioRoute};
use crate::domain::store::Configuration;
use crate::domain::stream::{
    MmapBufferDescriptor, OffloadInfo, SinkMetadata, SourceMetadata, StreamCallback, StreamContext,
    StreamControl, StreamDebugParameters, StreamFactory, StreamRegistry, StreamRegistryHandle,
    StreamSet, UnsupportedStreamFactory,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, info, instrument, trace, warn};

/// Module variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleKind {
    #[default]
    Default,
    RSubmix,
    Stub,
    Usb,
    Bluetooth,
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModuleKind::Default => "default",
            ModuleKind::RSubmix => "r_submix",
            ModuleKind::Stub => "stub",
            ModuleKind::Usb => "usb",
            ModuleKind::Bluetooth => "bluetooth",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for ModuleKind {
    type Err = HalError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "default" => Ok(ModuleKind::Default),
            "r_submix" => Ok(ModuleKind::RSubmix),
            "stub" => Ok(ModuleKind::Stub),
            "usb" => Ok(ModuleKind::Usb),
            "bluetooth" => Ok(ModuleKind::Bluetooth),
            other => Err(HalError::invalid_argument(format!("unknown module kind '{}'", other))),
        }
    }
}

/// Test and debug knobs of a module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ModuleDebug {
    /// Connect external devices without asking the hardware for their capabilities
    pub simulate_device_connections: bool,
    /// Delay applied by streams in transient states; must not be negative
    pub stream_transient_state_delay_ms: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MmapPolicyType {
    Default,
    Exclusive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MmapPolicy {
    Never,
    Auto,
    Always,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MmapPolicyInfo {
    pub device: Option<AudioDevice>,
    pub policy: MmapPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MicrophoneInfo {
    pub id: String,
    pub device: AudioDevice,
    pub group: i32,
    pub index_in_the_group: i32,
}

#[derive(Clone, Default)]
pub struct OpenInputStreamArgs {
    pub port_config_id: i32,
    pub sink_metadata: SinkMetadata,
    pub buffer_size_frames: i64,
}

#[derive(Clone, Default)]
pub struct OpenOutputStreamArgs {
    pub port_config_id: i32,
    pub source_metadata: SourceMetadata,
    pub offload_info: Option<OffloadInfo>,
    pub buffer_size_frames: i64,
    /// Required for ports with the non-blocking flag
    pub callback: Option<Arc<dyn StreamCallback>>,
}

/// Shape of the stream's data path as seen by the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    pub frame_size_bytes: usize,
    pub buffer_size_frames: i64,
    pub nominal_latency_ms: i32,
    pub mmap: Option<MmapBufferDescriptor>,
}

impl From<&StreamContext> for StreamDescriptor {
    fn from(context: &StreamContext) -> Self {
        Self {
            frame_size_bytes: context.frame_size_bytes,
            buffer_size_frames: context.buffer_size_frames,
            nominal_latency_ms: context.nominal_latency_ms,
            mmap: context.mmap.clone(),
        }
    }
}

pub struct OpenStreamReturn {
    pub stream: Arc<dyn StreamControl>,
    pub descriptor: StreamDescriptor,
}

/// Serializable view of the whole module state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleSnapshot {
    pub kind: ModuleKind,
    pub configuration: Configuration,
    pub connected_device_ports: BTreeMap<i32, BTreeSet<i32>>,
    pub debug: ModuleDebug,
}

/// Aborts on a broken internal invariant
pub(crate) fn invariant_violation(kind: ModuleKind, message: String) -> ! {
    error!(module = %kind, "{}", message);
    panic!("{}: {}", kind, message);
}

/// Mutable state of a module, always accessed under the module lock
pub(crate) struct ModuleState {
    pub(crate) kind: ModuleKind,
    pub(crate) config: Configuration,
    pub(crate) patch_index: PatchIndex,
    /// Connected device port id to the mix ports whose profiles it populated
    pub(crate) connected_device_ports: BTreeMap<i32, BTreeSet<i32>>,
    pub(crate) debug: ModuleDebug,
    pub(crate) hooks: Arc<dyn ModuleHooks>,
    pub(crate) streams: Arc<StreamRegistryHandle>,
    factory: Arc<dyn StreamFactory>,
    mmap_supported: Option<bool>,
}

impl ModuleState {
    pub(crate) fn new(
        kind: ModuleKind,
        mut config: Configuration,
        hooks: Arc<dyn ModuleHooks>,
        streams: Arc<StreamRegistryHandle>,
        factory: Arc<dyn StreamFactory>,
    ) -> Self {
        config.populate_connected_profiles();
        let patch_index = PatchIndex::rebuild(&config.patches, &config.port_configs);
        info!(
            module = %kind,
            ports = config.ports.len(),
            routes = config.routes.len(),
            "Module configuration loaded"
        );
        Self {
            kind,
            config,
            patch_index,
            connected_device_ports: BTreeMap::new(),
            debug: ModuleDebug::default(),
            hooks,
            streams,
            factory,
            mmap_supported: None,
        }
    }

    pub(crate) fn snapshot(&self) -> ModuleSnapshot {
        ModuleSnapshot {
            kind: self.kind,
            configuration: self.config.clone(),
            connected_device_ports: self.connected_device_ports.clone(),
            debug: self.debug,
        }
    }

    fn set_module_debug(&mut self, module_debug: ModuleDebug) -> Result<()> {
        if !self.connected_device_ports.is_empty()
            && self.debug.simulate_device_connections != module_debug.simulate_device_connections
        {
            error!(
                module = %self.kind,
                "Attempting to change device connection simulation while external devices are connected"
            );
            return Err(HalError::illegal_state(
                "external devices are connected, can not change connection simulation",
            ));
        }
        if module_debug.stream_transient_state_delay_ms < 0 {
            error!(
                module = %self.kind,
                delay_ms = module_debug.stream_transient_state_delay_ms,
                "Negative stream transient state delay"
            );
            return Err(HalError::invalid_argument(format!(
                "stream transient state delay is negative: {}",
                module_debug.stream_transient_state_delay_ms
            )));
        }
        debug!(module = %self.kind, debug = ?module_debug, "Module debug updated");
        self.debug = module_debug;
        Ok(())
    }

    fn audio_port(&self, port_id: i32) -> Result<AudioPort> {
        self.config.find_port(port_id).cloned().ok_or_else(|| {
            error!(module = %self.kind, port_id, "Port not found");
            HalError::invalid_argument(format!("port id {} not found", port_id))
        })
    }

    fn audio_routes_for_audio_port(&self, port_id: i32) -> Result<Vec<AudioRoute>> {
        if self.config.find_port(port_id).is_none() {
            error!(module = %self.kind, port_id, "Port not found");
            return Err(HalError::invalid_argument(format!("port id {} not found", port_id)));
        }
        Ok(self.config.routes_for_port(port_id))
    }

    fn microphones(&self) -> Vec<MicrophoneInfo> {
        self.config
            .ports
            .iter()
            .filter_map(|port| port.device().map(|device| (port, device)))
            .filter(|(_, device)| device.device_type.kind.is_microphone())
            .enumerate()
            .map(|(index, (port, device))| MicrophoneInfo {
                id: port.name.clone(),
                device: device.clone(),
                group: 0,
                index_in_the_group: index as i32,
            })
            .collect()
    }

    fn mmap_policy_infos(&self) -> Vec<MmapPolicyInfo> {
        let ports = &self.config.ports;
        let mmap_sinks: BTreeSet<i32> = ports
            .iter()
            .filter(|p| p.flags.is_input() && p.flags.has_mmap())
            .map(|p| p.id)
            .collect();
        let mmap_sources: BTreeSet<i32> = ports
            .iter()
            .filter(|p| !p.flags.is_input() && p.flags.has_mmap())
            .map(|p| p.id)
            .collect();
        if mmap_sinks.is_empty() && mmap_sources.is_empty() {
            return vec![MmapPolicyInfo {
                device: None,
                policy: MmapPolicy::Never,
            }];
        }

        let mut infos = Vec::new();
        for route in &self.config.routes {
            if mmap_sinks.contains(&route.sink_port_id) {
                for source_id in &route.source_port_ids {
                    if let Some(device) = self.config.find_port(*source_id).and_then(AudioPort::device) {
                        infos.push(MmapPolicyInfo {
                            device: Some(device.clone()),
                            policy: MmapPolicy::Auto,
                        });
                    }
                }
            } else if route.source_port_ids.iter().any(|id| mmap_sources.contains(id)) {
                if let Some(device) = self.config.find_port(route.sink_port_id).and_then(AudioPort::device) {
                    infos.push(MmapPolicyInfo {
                        device: Some(device.clone()),
                        policy: MmapPolicy::Auto,
                    });
                }
            }
        }
        infos
    }

    fn is_mmap_supported(&mut self) -> bool {
        if let Some(supported) = self.mmap_supported {
            return supported;
        }
        let supported = self
            .mmap_policy_infos()
            .iter()
            .any(|info| matches!(info.policy, MmapPolicy::Auto | MmapPolicy::Always));
        self.mmap_supported = Some(supported);
        supported
    }

    /// Validates that a new stream may be opened on the port config
    fn find_port_for_new_stream(&self, port_config_id: i32) -> Result<AudioPort> {
        let Some(port_config) = self.config.find_port_config(port_config_id) else {
            error!(module = %self.kind, port_config_id, "Port config not found");
            return Err(HalError::invalid_argument(format!(
                "port config id {} not found",
                port_config_id
            )));
        };
        let port_id = port_config.port_id;
        let Some(port) = self.config.find_port(port_id) else {
            error!(module = %self.kind, port_id, port_config_id, "Port used by config not found");
            return Err(HalError::invalid_argument(format!("port id {} not found", port_id)));
        };
        if self.streams.count(port_config_id) != 0 {
            error!(module = %self.kind, port_config_id, "Port config already has a stream");
            return Err(HalError::illegal_state(format!(
                "port config id {} already has a stream opened on it",
                port_config_id
            )));
        }
        let Some(mix) = port.mix_ext() else {
            error!(module = %self.kind, port_config_id, "Port config does not belong to a mix port");
            return Err(HalError::invalid_argument(format!(
                "port config id {} does not correspond to a mix port",
                port_config_id
            )));
        };
        let max_open = mix.max_open_stream_count;
        if max_open != 0 && self.streams.count(port_id) >= max_open as usize {
            error!(module = %self.kind, port_id, max_open, "Maximum open stream count reached");
            return Err(HalError::illegal_state(format!(
                "port id {} has reached the maximum open stream count {}",
                port_id, max_open
            )));
        }
        Ok(port.clone())
    }

    fn create_stream_context(
        &self,
        port_config_id: i32,
        buffer_size_frames: i64,
        async_callback: Option<Arc<dyn StreamCallback>>,
    ) -> Result<StreamContext> {
        if buffer_size_frames <= 0 {
            error!(module = %self.kind, buffer_size_frames, "Non-positive buffer size");
            return Err(HalError::invalid_argument(format!(
                "non-positive buffer size {}",
                buffer_size_frames
            )));
        }
        let Some(port_config) = self.config.find_port_config(port_config_id) else {
            invariant_violation(
                self.kind,
                format!("port config {} vanished while opening a stream", port_config_id),
            );
        };
        let format = port_config.format.clone().unwrap_or_default();
        let channel_layout = port_config.channel_mask.unwrap_or_default();
        let sample_rate = port_config.sample_rate.unwrap_or(0);
        let nominal_latency_ms = self.hooks.nominal_latency_ms(port_config);

        let minimum = self
            .hooks
            .calculate_buffer_size_frames(&format, nominal_latency_ms, sample_rate)
            .map_err(|e| {
                error!(module = %self.kind, error = %e, "Failed to calculate minimum buffer size");
                HalError::illegal_state(format!("can not size buffers for format {}", format))
            })?;
        if buffer_size_frames < i64::from(minimum) {
            error!(module = %self.kind, buffer_size_frames, minimum, "Insufficient buffer size");
            return Err(HalError::invalid_argument(format!(
                "insufficient buffer size {}, must be at least {}",
                buffer_size_frames, minimum
            )));
        }
        let frame_size_bytes = frame_size_in_bytes(&format, &channel_layout);
        if frame_size_bytes == 0 {
            error!(module = %self.kind, port_config_id, "Could not calculate frame size");
            return Err(HalError::invalid_argument(format!(
                "could not calculate frame size for port config {}",
                port_config_id
            )));
        }
        if frame_size_bytes as i64 > MAXIMUM_STREAM_BUFFER_SIZE_BYTES / buffer_size_frames {
            error!(
                module = %self.kind,
                buffer_size_frames,
                max_frames = MAXIMUM_STREAM_BUFFER_SIZE_BYTES / frame_size_bytes as i64,
                "Buffer size too large"
            );
            return Err(HalError::invalid_argument(format!(
                "buffer size {} frames is too large",
                buffer_size_frames
            )));
        }
        debug!(module = %self.kind, frame_size_bytes, "Frame size");

        let flags = port_config.flags.unwrap_or_default();
        let mmap = if flags.has_mmap() {
            Some(self.hooks.create_mmap_buffer(port_config, buffer_size_frames, frame_size_bytes)?)
        } else {
            None
        };
        Ok(StreamContext {
            port_config_id,
            format,
            channel_layout,
            sample_rate,
            flags,
            mix_port_handle: port_config.ext.as_mix().map(|m| m.handle).unwrap_or(0),
            nominal_latency_ms,
            buffer_size_frames,
            frame_size_bytes,
            mmap,
            async_callback,
            debug: StreamDebugParameters {
                transient_state_delay_ms: self.debug.stream_transient_state_delay_ms,
            },
        })
    }

    /// Routes a freshly created stream if its config is already patched, then registers it
    fn register_stream(
        &self,
        port_id: i32,
        port_config_id: i32,
        stream: Arc<dyn StreamControl>,
    ) -> Result<()> {
        if self.patch_index.contains(port_config_id) {
            let devices = self.find_connected_devices(port_config_id);
            if let Err(e) = stream.set_connected_devices(&devices) {
                error!(module = %self.kind, port_config_id, error = %e, "Failed to route new stream");
                if let Err(close_error) = stream.close() {
                    warn!(module = %self.kind, port_config_id, error = %close_error, "Stream close reported an error");
                }
                return Err(e);
            }
        }
        self.streams.insert(port_id, port_config_id, stream);
        Ok(())
    }

    fn open_input_stream(&self, args: &OpenInputStreamArgs) -> Result<OpenStreamReturn> {
        let port = self.find_port_for_new_stream(args.port_config_id)?;
        if !port.flags.is_input() {
            error!(module = %self.kind, port_config_id = args.port_config_id, "Not an input mix port");
            return Err(HalError::invalid_argument(format!(
                "port config id {} does not correspond to an input mix port",
                args.port_config_id
            )));
        }
        let context = self.create_stream_context(args.port_config_id, args.buffer_size_frames, None)?;
        let descriptor = StreamDescriptor::from(&context);
        let stream = self.factory.create_input_stream(context, &args.sink_metadata)?;
        self.register_stream(port.id, args.port_config_id, Arc::clone(&stream))?;
        Ok(OpenStreamReturn { stream, descriptor })
    }

    fn open_output_stream(&self, args: &OpenOutputStreamArgs) -> Result<OpenStreamReturn> {
        let port = self.find_port_for_new_stream(args.port_config_id)?;
        if port.flags.is_input() {
            error!(module = %self.kind, port_config_id = args.port_config_id, "Not an output mix port");
            return Err(HalError::invalid_argument(format!(
                "port config id {} does not correspond to an output mix port",
                args.port_config_id
            )));
        }
        if port.flags.has(output_flags::COMPRESS_OFFLOAD) && args.offload_info.is_none() {
            error!(module = %self.kind, port_id = port.id, "Offload port requires offload info");
            return Err(HalError::invalid_argument(format!(
                "port id {} has the compress offload flag set, requires offload info",
                port.id
            )));
        }
        let non_blocking = port.flags.has(output_flags::NON_BLOCKING);
        if non_blocking && args.callback.is_none() {
            error!(module = %self.kind, port_id = port.id, "Non-blocking port requires a callback");
            return Err(HalError::invalid_argument(format!(
                "port id {} has the non-blocking flag set, requires an async callback",
                port.id
            )));
        }
        let callback = if non_blocking { args.callback.clone() } else { None };
        let context = self.create_stream_context(args.port_config_id, args.buffer_size_frames, callback)?;
        let descriptor = StreamDescriptor::from(&context);
        let stream = self.factory.create_output_stream(
            context,
            &args.source_metadata,
            args.offload_info.as_ref(),
        )?;
        self.register_stream(port.id, args.port_config_id, Arc::clone(&stream))?;
        Ok(OpenStreamReturn { stream, descriptor })
    }

    fn close_stream(&self, port_config_id: i32) -> Result<()> {
        let Some(stream) = self.streams.remove(port_config_id) else {
            error!(module = %self.kind, port_config_id, "No stream to close");
            return Err(HalError::invalid_argument(format!(
                "no stream is opened on port config id {}",
                port_config_id
            )));
        };
        if let Err(e) = stream.close() {
            warn!(module = %self.kind, port_config_id, error = %e, "Stream close reported an error");
        }
        debug!(module = %self.kind, port_config_id, "Stream closed");
        Ok(())
    }
}

/// Builder for [`Module`]
pub struct ModuleBuilder {
    kind: ModuleKind,
    loader: Box<dyn ConfigurationLoader>,
    hooks: Arc<dyn ModuleHooks>,
    factory: Arc<dyn StreamFactory>,
    registry: Box<dyn StreamRegistry>,
}

impl ModuleBuilder {
    pub fn hooks(mut self, hooks: Arc<dyn ModuleHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn stream_factory(mut self, factory: Arc<dyn StreamFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub fn stream_registry(mut self, registry: Box<dyn StreamRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn build(self) -> Module {
        Module {
            kind: self.kind,
            loader: self.loader,
            hooks: self.hooks,
            factory: self.factory,
            streams: Arc::new(StreamRegistryHandle::new(self.registry)),
            state: Mutex::new(None),
        }
    }
}

/// An audio HAL module
pub struct Module {
    kind: ModuleKind,
    loader: Box<dyn ConfigurationLoader>,
    hooks: Arc<dyn ModuleHooks>,
    factory: Arc<dyn StreamFactory>,
    streams: Arc<StreamRegistryHandle>,
    state: Mutex<Option<ModuleState>>,
}

impl Module {
    /// Module with default hooks and no stream support
    pub fn new(kind: ModuleKind, loader: impl ConfigurationLoader + 'static) -> Self {
        Self::builder(kind, loader).build()
    }

    pub fn builder(kind: ModuleKind, loader: impl ConfigurationLoader + 'static) -> ModuleBuilder {
        ModuleBuilder {
            kind,
            loader: Box::new(loader),
            hooks: Arc::new(DefaultHooks),
            factory: Arc::new(UnsupportedStreamFactory),
            registry: Box::new(StreamSet::new()),
        }
    }

    pub fn kind(&self) -> ModuleKind {
        self.kind
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut ModuleState) -> T) -> T {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let state = guard.get_or_insert_with(|| {
            debug!(module = %self.kind, "Loading configuration on first access");
            ModuleState::new(
                self.kind,
                self.loader.load(),
                Arc::clone(&self.hooks),
                Arc::clone(&self.streams),
                Arc::clone(&self.factory),
            )
        });
        f(state)
    }

    #[cfg(test)]
    pub(crate) fn with_state_for_tests<T>(&self, f: impl FnOnce(&mut ModuleState) -> T) -> T {
        self.with_state(f)
    }

    pub fn get_audio_ports(&self) -> Vec<AudioPort> {
        self.with_state(|s| {
            trace!(module = %s.kind, count = s.config.ports.len(), "Returning ports");
            s.config.ports.clone()
        })
    }

    #[instrument(skip(self), fields(module = %self.kind))]
    pub fn get_audio_port(&self, port_id: i32) -> Result<AudioPort> {
        self.with_state(|s| s.audio_port(port_id))
    }

    pub fn get_audio_port_configs(&self) -> Vec<AudioPortConfig> {
        self.with_state(|s| {
            trace!(module = %s.kind, count = s.config.port_configs.len(), "Returning port configs");
            s.config.port_configs.clone()
        })
    }

    pub fn get_audio_patches(&self) -> Vec<AudioPatch> {
        self.with_state(|s| s.config.patches.clone())
    }

    pub fn get_audio_routes(&self) -> Vec<AudioRoute> {
        self.with_state(|s| s.config.routes.clone())
    }

    #[instrument(skip(self), fields(module = %self.kind))]
    pub fn get_audio_routes_for_audio_port(&self, port_id: i32) -> Result<Vec<AudioRoute>> {
        self.with_state(|s| s.audio_routes_for_audio_port(port_id))
    }

    pub fn get_microphones(&self) -> Vec<MicrophoneInfo> {
        self.with_state(|s| s.microphones())
    }

    #[instrument(skip(self), fields(module = %self.kind))]
    pub fn get_mmap_policy_infos(&self, policy_type: MmapPolicyType) -> Vec<MmapPolicyInfo> {
        debug!(?policy_type, "Querying MMAP policies");
        self.with_state(|s| s.mmap_policy_infos())
    }

    pub fn is_mmap_supported(&self) -> bool {
        self.with_state(|s| s.is_mmap_supported())
    }

    pub fn get_module_debug(&self) -> ModuleDebug {
        self.with_state(|s| s.debug)
    }

    #[instrument(skip(self, module_debug), fields(module = %self.kind, debug = ?module_debug))]
    pub fn set_module_debug(&self, module_debug: ModuleDebug) -> Result<()> {
        self.with_state(|s| s.set_module_debug(module_debug))
    }

    /// Creates or updates a port config
    ///
    /// Returns the suggested config and whether it was applied. A request that
    /// is merely incomplete or names unsupported values is not an error: the
    /// suggestion tells the client what the port can do instead.
    #[instrument(skip(self, requested), fields(module = %self.kind, id = requested.id, port_id = requested.port_id))]
    pub fn set_audio_port_config(&self, requested: &AudioPortConfig) -> Result<(AudioPortConfig, bool)> {
        self.with_state(|s| s.set_audio_port_config(requested))
    }

    #[instrument(skip(self), fields(module = %self.kind))]
    pub fn reset_audio_port_config(&self, port_config_id: i32) -> Result<()> {
        self.with_state(|s| s.reset_audio_port_config(port_config_id))
    }

    /// Creates (id 0) or updates a patch; streams are rerouted atomically
    #[instrument(skip(self, requested), fields(module = %self.kind, id = requested.id))]
    pub fn set_audio_patch(&self, requested: &AudioPatch) -> Result<AudioPatch> {
        self.with_state(|s| s.set_audio_patch(requested))
    }

    #[instrument(skip(self), fields(module = %self.kind))]
    pub fn reset_audio_patch(&self, patch_id: i32) -> Result<()> {
        self.with_state(|s| s.reset_audio_patch(patch_id))
    }

    /// Instantiates a template device port for an attached external device
    #[instrument(skip(self, template), fields(module = %self.kind, template_id = template.id))]
    pub fn connect_external_device(&self, template: &AudioPort) -> Result<AudioPort> {
        self.with_state(|s| s.connect_external_device(template))
    }

    #[instrument(skip(self), fields(module = %self.kind))]
    pub fn disconnect_external_device(&self, port_id: i32) -> Result<()> {
        self.with_state(|s| s.disconnect_external_device(port_id))
    }

    #[instrument(skip(self), fields(module = %self.kind))]
    pub fn prepare_to_disconnect_external_device(&self, port_id: i32) -> Result<()> {
        self.with_state(|s| s.prepare_to_disconnect_external_device(port_id))
    }

    #[instrument(skip(self, args), fields(module = %self.kind, port_config_id = args.port_config_id))]
    pub fn open_input_stream(&self, args: &OpenInputStreamArgs) -> Result<OpenStreamReturn> {
        self.with_state(|s| s.open_input_stream(args))
    }

    #[instrument(skip(self, args), fields(module = %self.kind, port_config_id = args.port_config_id))]
    pub fn open_output_stream(&self, args: &OpenOutputStreamArgs) -> Result<OpenStreamReturn> {
        self.with_state(|s| s.open_output_stream(args))
    }

    #[instrument(skip(self), fields(module = %self.kind))]
    pub fn close_stream(&self, port_config_id: i32) -> Result<()> {
        self.with_state(|s| s.close_stream(port_config_id))
    }

    /// Copy of the graph and connection bookkeeping
    pub fn snapshot(&self) -> ModuleSnapshot {
        self.with_state(|s| s.snapshot())
    }

    /// Copy of the patch reverse index
    pub fn patch_index(&self) -> PatchIndex {
        self.with_state(|s| s.patch_index.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::audio::{
        input_flags, AudioFormat, AudioProfile, ChannelLayout, DeviceKind, IoFlags,
    };
    use crate::domain::port::{AudioPortDeviceExt, AudioPortMixExt};
    use crate::domain::test_support::{primary_config, RecordingFactory};

    fn module() -> Module {
        Module::new(ModuleKind::Default, primary_config())
    }

    fn mix_config(module: &Module, port_name: &str) -> AudioPortConfig {
        let port = module
            .get_audio_ports()
            .into_iter()
            .find(|p| p.name == port_name)
            .unwrap();
        let (config, applied) = module
            .set_audio_port_config(&AudioPortConfig::for_port(port.id)
                .with_format(AudioFormat::PCM_16_BIT)
                .with_channel_mask(ChannelLayout::STEREO)
                .with_sample_rate(48000)
                .with_flags(port.flags))
            .unwrap();
        assert!(applied);
        config
    }

    #[test]
    fn test_module_kind_parsing() {
        assert_eq!("r_submix".parse::<ModuleKind>().unwrap(), ModuleKind::RSubmix);
        assert_eq!(ModuleKind::Usb.to_string(), "usb");
        assert!("nope".parse::<ModuleKind>().is_err());
    }

    #[test]
    fn test_get_audio_port_unknown() {
        let module = module();
        assert!(matches!(module.get_audio_port(999), Err(HalError::InvalidArgument(_))));
        assert!(matches!(
            module.get_audio_routes_for_audio_port(999),
            Err(HalError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_routes_for_port() {
        let module = module();
        let speaker = module.get_audio_ports().into_iter().find(|p| p.name == "Speaker").unwrap();
        let routes = module.get_audio_routes_for_audio_port(speaker.id).unwrap();
        assert!(!routes.is_empty());
        assert!(routes.iter().all(|r| r.involves(speaker.id)));
    }

    #[test]
    fn test_set_module_debug() {
        let module = module();
        let debug = ModuleDebug {
            simulate_device_connections: true,
            stream_transient_state_delay_ms: 10,
        };
        module.set_module_debug(debug).unwrap();
        assert_eq!(module.get_module_debug(), debug);

        let negative = ModuleDebug {
            stream_transient_state_delay_ms: -1,
            ..debug
        };
        assert!(matches!(module.set_module_debug(negative), Err(HalError::InvalidArgument(_))));
    }

    #[test]
    fn test_debug_toggle_blocked_while_connected() {
        let module = module();
        module
            .set_module_debug(ModuleDebug {
                simulate_device_connections: true,
                stream_transient_state_delay_ms: 0,
            })
            .unwrap();
        let usb = module
            .get_audio_ports()
            .into_iter()
            .find(|p| p.name == "USB Device Out")
            .unwrap();
        let connected = module.connect_external_device(&usb).unwrap();

        let result = module.set_module_debug(ModuleDebug::default());
        assert!(matches!(result, Err(HalError::IllegalState(_))));

        module.disconnect_external_device(connected.id).unwrap();
        module.set_module_debug(ModuleDebug::default()).unwrap();
    }

    #[test]
    fn test_microphones() {
        let mics = module().get_microphones();
        assert_eq!(mics.len(), 1);
        assert_eq!(mics[0].device.device_type.kind, DeviceKind::InMicrophone);
    }

    #[test]
    fn test_mmap_policy() {
        let module = module();
        let infos = module.get_mmap_policy_infos(MmapPolicyType::Default);
        assert!(infos.iter().all(|i| i.policy == MmapPolicy::Auto));
        assert!(infos.iter().any(|i| i.device.as_ref().map(|d| d.device_type.kind) == Some(DeviceKind::OutSpeaker)));
        assert!(module.is_mmap_supported());

        let mut bare = Configuration::new();
        bare.ports.push(AudioPort::new_mix(1, "in", IoFlags::Input(input_flags::FAST), AudioPortMixExt::default()));
        let bare_module = Module::new(ModuleKind::Stub, bare);
        let infos = bare_module.get_mmap_policy_infos(MmapPolicyType::Exclusive);
        assert_eq!(infos, vec![MmapPolicyInfo { device: None, policy: MmapPolicy::Never }]);
        assert!(!bare_module.is_mmap_supported());
    }

    #[test]
    fn test_open_output_stream() {
        let factory = Arc::new(RecordingFactory::default());
        let module = Module::builder(ModuleKind::Default, primary_config())
            .stream_factory(factory.clone())
            .build();
        let config = mix_config(&module, "primary output");

        let opened = module
            .open_output_stream(&OpenOutputStreamArgs {
                port_config_id: config.id,
                buffer_size_frames: 480,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(opened.descriptor.frame_size_bytes, 4);
        assert_eq!(opened.descriptor.nominal_latency_ms, 5);
        assert_eq!(factory.created(), 1);

        // one stream per config
        let again = module.open_output_stream(&OpenOutputStreamArgs {
            port_config_id: config.id,
            buffer_size_frames: 480,
            ..Default::default()
        });
        assert!(matches!(again, Err(HalError::IllegalState(_))));

        module.close_stream(config.id).unwrap();
        assert!(factory.stream(config.id).unwrap().is_closed());
        assert!(matches!(module.close_stream(config.id), Err(HalError::InvalidArgument(_))));
    }

    #[test]
    fn test_stream_closed_when_initial_routing_fails() {
        let factory = Arc::new(RecordingFactory::default());
        let module = Module::builder(ModuleKind::Default, primary_config())
            .stream_factory(factory.clone())
            .build();
        let config = mix_config(&module, "primary output");
        let speaker = module
            .get_audio_ports()
            .into_iter()
            .find(|p| p.name == "Speaker")
            .unwrap();
        module
            .set_audio_patch(&AudioPatch::new(vec![config.id], vec![speaker.id]))
            .unwrap();

        factory.fail_next_stream_connection();
        let args = OpenOutputStreamArgs {
            port_config_id: config.id,
            buffer_size_frames: 480,
            ..Default::default()
        };
        assert!(matches!(module.open_output_stream(&args), Err(HalError::IllegalState(_))));
        assert!(factory.stream(config.id).unwrap().is_closed());

        module.open_output_stream(&args).unwrap();
        let stream = factory.stream(config.id).unwrap();
        assert!(!stream.is_closed());
        assert_eq!(stream.devices(), vec![speaker.device().cloned().unwrap()]);
    }

    #[test]
    fn test_open_stream_buffer_validation() {
        let factory = Arc::new(RecordingFactory::default());
        let module = Module::builder(ModuleKind::Default, primary_config())
            .stream_factory(factory)
            .build();
        let config = mix_config(&module, "primary output");

        for frames in [0, 16, 1 << 20] {
            let result = module.open_output_stream(&OpenOutputStreamArgs {
                port_config_id: config.id,
                buffer_size_frames: frames,
                ..Default::default()
            });
            assert!(matches!(result, Err(HalError::InvalidArgument(_))), "frames {}", frames);
        }
    }

    #[test]
    fn test_open_stream_direction_and_port_checks() {
        let factory = Arc::new(RecordingFactory::default());
        let module = Module::builder(ModuleKind::Default, primary_config())
            .stream_factory(factory)
            .build();
        let output = mix_config(&module, "primary output");

        let wrong_direction = module.open_input_stream(&OpenInputStreamArgs {
            port_config_id: output.id,
            buffer_size_frames: 480,
            ..Default::default()
        });
        assert!(matches!(wrong_direction, Err(HalError::InvalidArgument(_))));

        let speaker_config = module
            .get_audio_port_configs()
            .into_iter()
            .find(|c| c.ext.as_device().is_some())
            .unwrap();
        let on_device = module.open_output_stream(&OpenOutputStreamArgs {
            port_config_id: speaker_config.id,
            buffer_size_frames: 480,
            ..Default::default()
        });
        assert!(matches!(on_device, Err(HalError::InvalidArgument(_))));

        let offload = mix_config_for_offload(&module);
        let missing_info = module.open_output_stream(&OpenOutputStreamArgs {
            port_config_id: offload.id,
            buffer_size_frames: 480,
            ..Default::default()
        });
        assert!(matches!(missing_info, Err(HalError::InvalidArgument(_))));
    }

    fn mix_config_for_offload(module: &Module) -> AudioPortConfig {
        let port = module
            .get_audio_ports()
            .into_iter()
            .find(|p| p.name == "compressed offload")
            .unwrap();
        let (config, applied) = module
            .set_audio_port_config(&AudioPortConfig::for_port(port.id)
                .with_format(AudioFormat::NonPcm("audio/mpeg".into()))
                .with_channel_mask(ChannelLayout::STEREO)
                .with_sample_rate(44100)
                .with_flags(port.flags))
            .unwrap();
        assert!(applied);
        config
    }

    #[test]
    fn test_max_open_stream_count() {
        let factory = Arc::new(RecordingFactory::default());
        let mut config = primary_config();
        let mix_id = config.allocate_port_id();
        config.ports.push(
            AudioPort::new_mix(
                mix_id,
                "single",
                IoFlags::Output(0),
                AudioPortMixExt {
                    max_open_stream_count: 1,
                    ..Default::default()
                },
            )
            .with_profiles(vec![AudioProfile::new(
                AudioFormat::PCM_16_BIT,
                vec![ChannelLayout::STEREO],
                vec![48000],
            )]),
        );
        let speaker_id = config.ports.iter().find(|p| p.name == "Speaker").unwrap().id;
        config.routes.push(AudioRoute::new(vec![mix_id], speaker_id, false));
        let module = Module::builder(ModuleKind::Default, config)
            .stream_factory(factory)
            .build();

        let first = mix_config(&module, "single");
        let second = mix_config(&module, "single");
        let args = |id| OpenOutputStreamArgs {
            port_config_id: id,
            buffer_size_frames: 480,
            ..Default::default()
        };
        module.open_output_stream(&args(first.id)).unwrap();
        assert!(matches!(
            module.open_output_stream(&args(second.id)),
            Err(HalError::IllegalState(_))
        ));
    }

    #[test]
    fn test_lazy_configuration_loading() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&loads);
        let module = Module::new(ModuleKind::Default, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            primary_config()
        });
        assert_eq!(loads.load(Ordering::SeqCst), 0);
        module.get_audio_ports();
        module.get_audio_routes();
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_device_ext_default_flag_survives_clone() {
        let module = module();
        let mic = module
            .get_audio_ports()
            .into_iter()
            .find(|p| p.name == "Built-In Mic")
            .unwrap();
        assert!(mic.device_ext().map(AudioPortDeviceExt::is_default).unwrap_or(false));
    }
}
