//! Remote submix routes
//!
//! A remote submix device is a loopback: whatever an output stream writes to
//! the device at some address can be captured by input streams on the same
//! address. Each address owns a [`SubmixRoute`] holding the pipe configuration
//! and the open/standby state of both ends. Routes live in a
//! [`SubmixRouteRegistry`] owned by whoever creates the submix module.

use audiohal_core::domain::audio::{
    has_dynamic_profiles_only, standard_pcm_profiles, AudioDevice, AudioFormat, ChannelLayout,
    DeviceAddress, HalError, Result,
};
use audiohal_core::domain::hooks::{DefaultHooks, ModuleHooks};
use audiohal_core::domain::port::{AudioPort, AudioPortConfig};
use audiohal_core::domain::stream::{
    OffloadInfo, SinkMetadata, SourceMetadata, StreamContext, StreamControl, StreamFactory,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, info};

/// Pipe size at [`DEFAULT_SAMPLE_RATE_HZ`]
pub const DEFAULT_PIPE_SIZE_FRAMES: i64 = 1024 * 4;
pub const DEFAULT_SAMPLE_RATE_HZ: u32 = 48000;

/// Configuration shared by both ends of a route
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipeConfig {
    pub format: AudioFormat,
    pub channel_layout: ChannelLayout,
    pub sample_rate: u32,
    #[serde(default)]
    pub frame_count: i64,
}

impl PipeConfig {
    pub fn new(format: AudioFormat, channel_layout: ChannelLayout, sample_rate: u32) -> Self {
        Self {
            format,
            channel_layout,
            sample_rate,
            frame_count: 0,
        }
    }

    /// Pipe capacity scaled from the default size to the config's rate
    pub fn pipe_size_frames(&self) -> i64 {
        DEFAULT_PIPE_SIZE_FRAMES * i64::from(self.sample_rate) / i64::from(DEFAULT_SAMPLE_RATE_HZ)
    }
}

#[derive(Debug, Default)]
struct RouteState {
    pipe: Option<PipeConfig>,
    input_ref_count: u32,
    output_open: bool,
}

impl RouteState {
    fn input_open(&self) -> bool {
        self.input_ref_count > 0
    }

    fn has_at_least_one_stream_open(&self) -> bool {
        self.input_open() || self.output_open
    }

    fn is_stream_config_compatible(&self, config: &PipeConfig) -> bool {
        let Some(pipe) = &self.pipe else {
            return true;
        };
        if config.channel_layout != pipe.channel_layout {
            error!(stream = ?config.channel_layout, pipe = ?pipe.channel_layout, "Channel layout mismatch");
            return false;
        }
        if config.sample_rate != pipe.sample_rate {
            error!(stream = config.sample_rate, pipe = pipe.sample_rate, "Sample rate mismatch");
            return false;
        }
        if config.format != pipe.format {
            error!(stream = %config.format, pipe = %pipe.format, "Format mismatch");
            return false;
        }
        true
    }

    fn is_stream_config_valid(&self, is_input: bool, config: &PipeConfig) -> bool {
        if !is_input && self.output_open {
            error!("Submix output stream already open");
            return false;
        }
        !self.has_at_least_one_stream_open() || self.is_stream_config_compatible(config)
    }
}

#[derive(Debug, Default)]
pub struct SubmixRoute {
    state: Mutex<RouteState>,
}

impl SubmixRoute {
    fn with_pipe(config: PipeConfig) -> Self {
        let route = Self::default();
        route.create_pipe(config);
        route
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RouteState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn create_pipe(&self, mut config: PipeConfig) {
        config.frame_count = config.pipe_size_frames();
        debug!(rate = config.sample_rate, frames = config.frame_count, "Creating submix pipe");
        self.lock().pipe = Some(config);
    }

    pub fn pipe_config(&self) -> Option<PipeConfig> {
        self.lock().pipe.clone()
    }

    /// Drops the pipe, returning its last configuration
    pub fn release_pipe(&self) -> Option<PipeConfig> {
        self.lock().pipe.take()
    }

    pub fn has_at_least_one_stream_open(&self) -> bool {
        self.lock().has_at_least_one_stream_open()
    }

    pub fn is_stream_out_open(&self) -> bool {
        self.lock().output_open
    }

    pub fn is_stream_in_open(&self) -> bool {
        self.lock().input_open()
    }

    /// Whether a stream with `config` may be opened on this route
    ///
    /// Only one output stream can be open at a time. While either end is
    /// open, new streams must match the pipe configuration.
    pub fn is_stream_config_valid(&self, is_input: bool, config: &PipeConfig) -> bool {
        self.lock().is_stream_config_valid(is_input, config)
    }

    /// Validates `config` and opens one end of the route
    ///
    /// A route whose pipe was released by its last stream gets a new pipe
    /// with `config`.
    pub fn open_stream(&self, is_input: bool, config: &PipeConfig) -> Result<()> {
        let mut state = self.lock();
        if !state.is_stream_config_valid(is_input, config) {
            return Err(HalError::illegal_state(format!(
                "submix {} stream config {}/{:?}/{}Hz is not compatible with the route",
                if is_input { "input" } else { "output" },
                config.format,
                config.channel_layout,
                config.sample_rate
            )));
        }
        if state.pipe.is_none() {
            let mut pipe = config.clone();
            pipe.frame_count = pipe.pipe_size_frames();
            state.pipe = Some(pipe);
        }
        if is_input {
            state.input_ref_count += 1;
        } else {
            state.output_open = true;
        }
        Ok(())
    }

    pub fn close_stream(&self, is_input: bool) {
        let mut state = self.lock();
        if is_input {
            state.input_ref_count = state.input_ref_count.saturating_sub(1);
        } else {
            state.output_open = false;
        }
    }

    pub fn dump(&self) -> String {
        let state = self.lock();
        format!(
            "in: {} (refs {}), out: {}, pipe: {}",
            if state.input_open() { "open" } else { "closed" },
            state.input_ref_count,
            if state.output_open { "open" } else { "closed" },
            match &state.pipe {
                Some(pipe) => format!("{}/{:?}/{}Hz/{} frames", pipe.format, pipe.channel_layout, pipe.sample_rate, pipe.frame_count),
                None => "none".to_string(),
            }
        )
    }
}

/// Submix routes keyed by device address
#[derive(Debug, Default)]
pub struct SubmixRouteRegistry {
    routes: Mutex<HashMap<DeviceAddress, Arc<SubmixRoute>>>,
}

impl SubmixRouteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<DeviceAddress, Arc<SubmixRoute>>> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the route at `address`, creating it with `pipe_config` if absent
    pub fn find_or_create_route(&self, address: &DeviceAddress, pipe_config: PipeConfig) -> Arc<SubmixRoute> {
        self.lock()
            .entry(address.clone())
            .or_insert_with(|| {
                info!(%address, "Creating submix route");
                Arc::new(SubmixRoute::with_pipe(pipe_config))
            })
            .clone()
    }

    pub fn find_route(&self, address: &DeviceAddress) -> Option<Arc<SubmixRoute>> {
        self.lock().get(address).cloned()
    }

    pub fn remove_route(&self, address: &DeviceAddress) -> Option<Arc<SubmixRoute>> {
        let removed = self.lock().remove(address);
        if removed.is_some() {
            info!(%address, "Removed submix route");
        }
        removed
    }

    /// Closes one end of `route`; the last stream out drops the pipe and the route
    ///
    /// Runs under the registry lock so a concurrent lookup never hands out a
    /// route that is being dropped. A route already replaced at `address` is
    /// left in place.
    pub fn release_stream(&self, address: &DeviceAddress, route: &Arc<SubmixRoute>, is_input: bool) {
        let mut routes = self.lock();
        route.close_stream(is_input);
        if route.has_at_least_one_stream_open() {
            return;
        }
        route.release_pipe();
        if routes.get(address).is_some_and(|current| Arc::ptr_eq(current, route)) {
            routes.remove(address);
            info!(%address, "Last submix stream closed, route removed");
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One line per route, sorted by address
    pub fn dump(&self) -> String {
        let Ok(routes) = self.routes.try_lock() else {
            return " ! registry is busy".to_string();
        };
        if routes.is_empty() {
            return " <Empty>".to_string();
        }
        let mut entries: Vec<(String, String)> =
            routes.iter().map(|(address, route)| (address.to_string(), route.dump())).collect();
        entries.sort();
        let mut result = String::new();
        for (address, route) in entries {
            let _ = writeln!(result, " - {}: {}", address, route);
        }
        result
    }
}

struct Attachment {
    address: DeviceAddress,
    route: Arc<SubmixRoute>,
}

/// Stream end of a remote submix route
///
/// The stream joins the route of the device it is connected to and leaves it
/// when disconnected or closed. State changes are then forwarded to the
/// wrapped stream.
pub struct SubmixStream {
    inner: Arc<dyn StreamControl>,
    registry: Arc<SubmixRouteRegistry>,
    is_input: bool,
    config: PipeConfig,
    attachment: Mutex<Option<Attachment>>,
}

impl SubmixStream {
    /// Address of the route the stream currently belongs to
    pub fn route_address(&self) -> Option<DeviceAddress> {
        self.lock().as_ref().map(|a| a.address.clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Attachment>> {
        self.attachment.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn detach(&self, attachment: &mut Option<Attachment>) {
        if let Some(Attachment { address, route }) = attachment.take() {
            self.registry.release_stream(&address, &route, self.is_input);
            debug!(%address, is_input = self.is_input, "Left submix route");
        }
    }

    fn attach(&self, attachment: &mut Option<Attachment>, address: &DeviceAddress) -> Result<()> {
        let route = self.registry.find_or_create_route(address, self.config.clone());
        if let Err(e) = route.open_stream(self.is_input, &self.config) {
            error!(%address, is_input = self.is_input, error = %e, "Submix route rejected stream");
            return Err(e);
        }
        debug!(%address, is_input = self.is_input, "Joined submix route");
        *attachment = Some(Attachment {
            address: address.clone(),
            route,
        });
        Ok(())
    }
}

impl StreamControl for SubmixStream {
    fn set_connected_devices(&self, devices: &[AudioDevice]) -> Result<()> {
        let mut attachment = self.lock();
        match devices.first() {
            None => self.detach(&mut attachment),
            Some(device) => {
                let current = attachment.as_ref().map(|a| &a.address);
                if current != Some(&device.address) {
                    self.detach(&mut attachment);
                    self.attach(&mut attachment, &device.address)?;
                }
            }
        }
        self.inner.set_connected_devices(devices)
    }

    fn set_gain(&self, gain: f32) -> Result<()> {
        self.inner.set_gain(gain)
    }

    fn close(&self) -> Result<()> {
        self.detach(&mut self.lock());
        self.inner.close()
    }
}

/// Wraps another factory so that its streams take part in submix routes
pub struct SubmixStreamFactory {
    registry: Arc<SubmixRouteRegistry>,
    inner: Arc<dyn StreamFactory>,
}

impl SubmixStreamFactory {
    pub fn new(registry: Arc<SubmixRouteRegistry>, inner: Arc<dyn StreamFactory>) -> Self {
        Self { registry, inner }
    }

    fn wrap(&self, inner: Arc<dyn StreamControl>, is_input: bool, context: &StreamContext) -> Arc<dyn StreamControl> {
        Arc::new(SubmixStream {
            inner,
            registry: Arc::clone(&self.registry),
            is_input,
            config: PipeConfig::new(context.format.clone(), context.channel_layout, context.sample_rate),
            attachment: Mutex::new(None),
        })
    }
}

impl StreamFactory for SubmixStreamFactory {
    fn create_input_stream(
        &self,
        context: StreamContext,
        metadata: &SinkMetadata,
    ) -> Result<Arc<dyn StreamControl>> {
        let inner = self.inner.create_input_stream(context.clone(), metadata)?;
        Ok(self.wrap(inner, true, &context))
    }

    fn create_output_stream(
        &self,
        context: StreamContext,
        metadata: &SourceMetadata,
        offload_info: Option<&OffloadInfo>,
    ) -> Result<Arc<dyn StreamControl>> {
        let inner = self.inner.create_output_stream(context.clone(), metadata, offload_info)?;
        Ok(self.wrap(inner, false, &context))
    }
}

/// Hooks of the remote submix module
///
/// Connected submix devices get the standard PCM profiles. Patch endpoints
/// must agree on format, channel layout and rate since the pipe does not
/// convert. Disconnecting a device drops its route.
pub struct SubmixHooks {
    registry: Arc<SubmixRouteRegistry>,
}

impl SubmixHooks {
    pub fn new(registry: Arc<SubmixRouteRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<SubmixRouteRegistry> {
        &self.registry
    }
}

impl ModuleHooks for SubmixHooks {
    fn populate_connected_device_port(&self, port: &mut AudioPort, next_port_id: i32) -> Result<()> {
        if !port.is_external_device_port() {
            return DefaultHooks.populate_connected_device_port(port, next_port_id);
        }
        if has_dynamic_profiles_only(&port.profiles) {
            port.profiles = standard_pcm_profiles();
        }
        Ok(())
    }

    fn check_audio_patch_endpoints_match(
        &self,
        sources: &[AudioPortConfig],
        sinks: &[AudioPortConfig],
    ) -> Result<()> {
        for source in sources {
            for sink in sinks {
                if source.format != sink.format
                    || source.channel_mask != sink.channel_mask
                    || source.sample_rate != sink.sample_rate
                {
                    error!(source = source.id, sink = sink.id, "Submix patch endpoints do not match");
                    return Err(HalError::unsupported(format!(
                        "submix endpoints {} and {} have different configurations",
                        source.id, sink.id
                    )));
                }
            }
        }
        Ok(())
    }

    fn on_external_device_connection_changed(&self, port: &AudioPort, connected: bool) {
        if connected {
            return;
        }
        if let Some(device) = port.device() {
            self.registry.remove_route(&device.address);
        }
    }
}
