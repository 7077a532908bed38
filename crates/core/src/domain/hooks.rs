//! Extension points for concrete module implementations
//!
//! A module variant (USB, Bluetooth, remote submix, ...) plugs its hardware
//! specific behavior in through [`ModuleHooks`]. The provided methods describe
//! a module without external device support.

use crate::domain::audio::{AudioFormat, HalError, Result};
use crate::domain::port::{AudioPort, AudioPortConfig};
use crate::domain::stream::MmapBufferDescriptor;

/// Upper bound for the data buffer of a single stream
pub const MAXIMUM_STREAM_BUFFER_SIZE_BYTES: i64 = 1024 * 1024;

/// Latency used when a module does not report its own
pub const DEFAULT_NOMINAL_LATENCY_MS: i32 = 5;

/// Minimum buffer size for a PCM stream at `sample_rate` with `latency_ms` of latency
///
/// The size is rounded up to a mixer burst of 16 frames. At 44.1 kHz and above,
/// sizes above 512 frames are rounded up to a power of two.
pub fn pcm_buffer_size_frames(latency_ms: i32, sample_rate: u32) -> i32 {
    let raw = (i64::from(latency_ms) * i64::from(sample_rate) / 1000) as i32;
    let multiple_of_16 = (raw + 15) & !15;
    if sample_rate < 44100 || multiple_of_16 <= 512 {
        return multiple_of_16;
    }
    let mut power_of_2 = 1;
    while power_of_2 < multiple_of_16 {
        power_of_2 <<= 1;
    }
    power_of_2
}

pub trait ModuleHooks: Send + Sync {
    /// Nominal latency of streams opened on the given mix port config
    fn nominal_latency_ms(&self, _port_config: &AudioPortConfig) -> i32 {
        DEFAULT_NOMINAL_LATENCY_MS
    }

    /// Minimum stream buffer size in frames
    fn calculate_buffer_size_frames(
        &self,
        format: &AudioFormat,
        latency_ms: i32,
        sample_rate: u32,
    ) -> Result<i32> {
        if format.is_pcm() {
            return Ok(pcm_buffer_size_frames(latency_ms, sample_rate));
        }
        Err(HalError::unsupported(format!(
            "buffer size calculation is not supported for format {}",
            format
        )))
    }

    /// Fills in the capabilities of a freshly connected external device
    ///
    /// `next_port_id` is the id the connected port will receive.
    fn populate_connected_device_port(&self, port: &mut AudioPort, _next_port_id: i32) -> Result<()> {
        if !port.is_device_port() {
            return Err(HalError::invalid_argument(format!(
                "port {} is not a device port",
                port.id
            )));
        }
        if port.is_external_device_port() {
            return Err(HalError::illegal_state(
                "module does not support connection of external devices",
            ));
        }
        Ok(())
    }

    /// Vetoes patches whose endpoints can not work together
    fn check_audio_patch_endpoints_match(
        &self,
        _sources: &[AudioPortConfig],
        _sinks: &[AudioPortConfig],
    ) -> Result<()> {
        Ok(())
    }

    fn on_external_device_connection_changed(&self, _port: &AudioPort, _connected: bool) {}

    fn on_prepare_to_disconnect_external_device(&self, _port: &AudioPort) {}

    /// Allocates the shared buffer of an MMAP stream
    fn create_mmap_buffer(
        &self,
        _port_config: &AudioPortConfig,
        _buffer_size_frames: i64,
        _frame_size_bytes: usize,
    ) -> Result<MmapBufferDescriptor> {
        Err(HalError::unsupported("MMAP streams are not supported"))
    }
}

/// Hooks of a module without hardware specifics
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHooks;

impl ModuleHooks for DefaultHooks {}
