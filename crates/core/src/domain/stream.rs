//! Stream abstractions and the registry of open streams
//!
//! The module never owns stream I/O. It only needs to tell open streams which
//! devices they are connected to and which gain to apply; everything else is
//! behind [`StreamControl`] and created by a [`StreamFactory`].

use crate::domain::audio::{AudioDevice, AudioFormat, ChannelLayout, HalError, IoFlags, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

/// Control surface of an open stream
pub trait StreamControl: Send + Sync {
    /// Replaces the set of devices the stream is routed to; empty means disconnected
    fn set_connected_devices(&self, devices: &[AudioDevice]) -> Result<()>;

    /// Applies a linear gain coming from a port config on a routed device
    fn set_gain(&self, gain: f32) -> Result<()>;

    /// Releases the stream's resources
    fn close(&self) -> Result<()>;
}

/// Notifications sent by non-blocking streams
pub trait StreamCallback: Send + Sync {
    fn on_transfer_ready(&self);
    fn on_error(&self);
    fn on_drain_ready(&self);
}

/// Client metadata for playback streams
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SourceMetadata {
    pub tracks: Vec<PlaybackTrack>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PlaybackTrack {
    pub usage: String,
    pub content_type: String,
    pub gain: f32,
}

/// Client metadata for capture streams
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SinkMetadata {
    pub tracks: Vec<RecordTrack>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RecordTrack {
    pub source: String,
    pub gain: f32,
}

/// Parameters of a compressed offload playback stream
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OffloadInfo {
    pub format: AudioFormat,
    pub sample_rate: u32,
    pub channel_mask: ChannelLayout,
    pub bit_rate_bps: i32,
    pub duration_us: i64,
}

/// Shared memory region backing an MMAP stream
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MmapBufferDescriptor {
    pub buffer_size_frames: i64,
    pub burst_size_frames: i32,
    pub flags: u32,
}

/// Debug knobs propagated to streams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StreamDebugParameters {
    pub transient_state_delay_ms: i32,
}

/// Everything a stream implementation needs to start
#[derive(Clone)]
pub struct StreamContext {
    pub port_config_id: i32,
    pub format: AudioFormat,
    pub channel_layout: ChannelLayout,
    pub sample_rate: u32,
    pub flags: IoFlags,
    pub mix_port_handle: i32,
    pub nominal_latency_ms: i32,
    pub buffer_size_frames: i64,
    pub frame_size_bytes: usize,
    pub mmap: Option<MmapBufferDescriptor>,
    pub async_callback: Option<Arc<dyn StreamCallback>>,
    pub debug: StreamDebugParameters,
}

impl std::fmt::Debug for StreamContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamContext")
            .field("port_config_id", &self.port_config_id)
            .field("format", &self.format)
            .field("channel_layout", &self.channel_layout)
            .field("sample_rate", &self.sample_rate)
            .field("flags", &self.flags)
            .field("buffer_size_frames", &self.buffer_size_frames)
            .field("frame_size_bytes", &self.frame_size_bytes)
            .field("mmap", &self.mmap.is_some())
            .field("async_callback", &self.async_callback.is_some())
            .finish()
    }
}

/// Creates stream implementations for the module
pub trait StreamFactory: Send + Sync {
    fn create_input_stream(
        &self,
        context: StreamContext,
        metadata: &SinkMetadata,
    ) -> Result<Arc<dyn StreamControl>>;

    fn create_output_stream(
        &self,
        context: StreamContext,
        metadata: &SourceMetadata,
        offload_info: Option<&OffloadInfo>,
    ) -> Result<Arc<dyn StreamControl>>;
}

/// Factory for modules without stream support
#[derive(Debug, Default)]
pub struct UnsupportedStreamFactory;

impl StreamFactory for UnsupportedStreamFactory {
    fn create_input_stream(
        &self,
        _context: StreamContext,
        _metadata: &SinkMetadata,
    ) -> Result<Arc<dyn StreamControl>> {
        Err(HalError::unsupported("input streams are not available"))
    }

    fn create_output_stream(
        &self,
        _context: StreamContext,
        _metadata: &SourceMetadata,
        _offload_info: Option<&OffloadInfo>,
    ) -> Result<Arc<dyn StreamControl>> {
        Err(HalError::unsupported("output streams are not available"))
    }
}

/// Open streams indexed by port config and by mix port
pub trait StreamRegistry: Send {
    /// Streams opened on the port config, or on any config of the port
    fn count(&self, id: i32) -> usize;

    fn insert(&mut self, port_id: i32, port_config_id: i32, stream: Arc<dyn StreamControl>);

    fn remove(&mut self, port_config_id: i32) -> Option<Arc<dyn StreamControl>>;

    fn find(&self, port_config_id: i32) -> Option<Arc<dyn StreamControl>>;

    /// Routes the stream opened on the config; absent streams are ignored
    fn set_stream_connected_devices(&self, port_config_id: i32, devices: &[AudioDevice]) -> Result<()>;

    /// Applies gain to every stream opened on the port
    fn set_gain(&self, port_id: i32, gain: f32) -> Result<()>;
}

/// Default [`StreamRegistry`]
#[derive(Default)]
pub struct StreamSet {
    port_streams: BTreeMap<i32, BTreeSet<i32>>,
    streams: BTreeMap<i32, (i32, Arc<dyn StreamControl>)>,
}

impl StreamSet {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StreamRegistry for StreamSet {
    fn count(&self, id: i32) -> usize {
        if let Some(configs) = self.port_streams.get(&id) {
            return configs.len();
        }
        usize::from(self.streams.contains_key(&id))
    }

    fn insert(&mut self, port_id: i32, port_config_id: i32, stream: Arc<dyn StreamControl>) {
        self.port_streams.entry(port_id).or_default().insert(port_config_id);
        self.streams.insert(port_config_id, (port_id, stream));
    }

    fn remove(&mut self, port_config_id: i32) -> Option<Arc<dyn StreamControl>> {
        let (port_id, stream) = self.streams.remove(&port_config_id)?;
        if let Some(configs) = self.port_streams.get_mut(&port_id) {
            configs.remove(&port_config_id);
            if configs.is_empty() {
                self.port_streams.remove(&port_id);
            }
        }
        Some(stream)
    }

    fn find(&self, port_config_id: i32) -> Option<Arc<dyn StreamControl>> {
        self.streams.get(&port_config_id).map(|(_, s)| Arc::clone(s))
    }

    fn set_stream_connected_devices(&self, port_config_id: i32, devices: &[AudioDevice]) -> Result<()> {
        match self.streams.get(&port_config_id) {
            Some((_, stream)) => stream.set_connected_devices(devices),
            None => Ok(()),
        }
    }

    fn set_gain(&self, port_id: i32, gain: f32) -> Result<()> {
        let Some(configs) = self.port_streams.get(&port_id) else {
            return Ok(());
        };
        for config_id in configs {
            if let Some((_, stream)) = self.streams.get(config_id) {
                stream.set_gain(gain)?;
            }
        }
        Ok(())
    }
}

/// Lock domain around a [`StreamRegistry`]
///
/// Every call takes the lock for its own duration only. When both the module
/// state and the registry are held, the state lock is always taken first.
pub struct StreamRegistryHandle {
    inner: Mutex<Box<dyn StreamRegistry>>,
}

impl StreamRegistryHandle {
    pub fn new(registry: Box<dyn StreamRegistry>) -> Self {
        Self {
            inner: Mutex::new(registry),
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut dyn StreamRegistry) -> T) -> T {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(guard.as_mut())
    }

    pub fn count(&self, id: i32) -> usize {
        self.with(|r| r.count(id))
    }

    pub fn insert(&self, port_id: i32, port_config_id: i32, stream: Arc<dyn StreamControl>) {
        debug!(port_id, port_config_id, "Registering stream");
        self.with(|r| r.insert(port_id, port_config_id, stream));
    }

    pub fn remove(&self, port_config_id: i32) -> Option<Arc<dyn StreamControl>> {
        self.with(|r| r.remove(port_config_id))
    }

    pub fn set_stream_connected_devices(&self, port_config_id: i32, devices: &[AudioDevice]) -> Result<()> {
        self.with(|r| r.set_stream_connected_devices(port_config_id, devices))
    }

    pub fn set_gain(&self, port_id: i32, gain: f32) {
        if let Err(e) = self.with(|r| r.set_gain(port_id, gain)) {
            warn!(port_id, gain, error = %e, "Failed to apply gain to streams");
        }
    }
}

impl Default for StreamRegistryHandle {
    fn default() -> Self {
        Self::new(Box::new(StreamSet::new()))
    }
}
