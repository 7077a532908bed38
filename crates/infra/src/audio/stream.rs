//! Streams backed by a worker thread
//!
//! The module only manages stream state; moving audio is the job of a stream
//! worker. [`WorkerStream`] forwards every state change the module makes to
//! that worker as a [`StreamEvent`] on a crossbeam channel.

use audiohal_core::domain::audio::{AudioDevice, HalError, Result};
use audiohal_core::domain::stream::{
    OffloadInfo, SinkMetadata, SourceMetadata, StreamContext, StreamControl, StreamFactory,
};
use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

/// Capacity of the command channel shared by all streams of a factory
pub const EVENT_QUEUE_CAPACITY: usize = 64;

/// State change delivered to the stream worker
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamEvent {
    Opened {
        port_config_id: i32,
        is_input: bool,
        buffer_size_frames: i64,
        frame_size_bytes: usize,
    },
    DevicesChanged {
        port_config_id: i32,
        devices: Vec<AudioDevice>,
    },
    GainChanged {
        port_config_id: i32,
        gain: f32,
    },
    Closed {
        port_config_id: i32,
    },
}

/// A stream whose I/O runs on a worker fed through a channel
pub struct WorkerStream {
    context: StreamContext,
    is_input: bool,
    devices: Mutex<Vec<AudioDevice>>,
    gain: Mutex<f32>,
    closed: AtomicBool,
    events: Sender<StreamEvent>,
}

impl WorkerStream {
    fn new(context: StreamContext, is_input: bool, events: Sender<StreamEvent>) -> Self {
        Self {
            context,
            is_input,
            devices: Mutex::new(Vec::new()),
            gain: Mutex::new(1.0),
            closed: AtomicBool::new(false),
            events,
        }
    }

    pub fn context(&self) -> &StreamContext {
        &self.context
    }

    pub fn is_input(&self) -> bool {
        self.is_input
    }

    pub fn connected_devices(&self) -> Vec<AudioDevice> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn gain(&self) -> f32 {
        *self.gain.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn publish(&self, event: StreamEvent) -> Result<()> {
        match self.events.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(event)) => {
                warn!(port_config_id = self.context.port_config_id, ?event, "Stream worker queue full");
                Err(HalError::illegal_state("stream worker is not keeping up"))
            }
            Err(TrySendError::Disconnected(_)) => {
                Err(HalError::illegal_state("stream worker has exited"))
            }
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(HalError::illegal_state(format!(
                "stream on port config {} is closed",
                self.context.port_config_id
            )));
        }
        Ok(())
    }
}

impl StreamControl for WorkerStream {
    fn set_connected_devices(&self, devices: &[AudioDevice]) -> Result<()> {
        self.ensure_open()?;
        self.publish(StreamEvent::DevicesChanged {
            port_config_id: self.context.port_config_id,
            devices: devices.to_vec(),
        })?;
        *self.devices.lock().unwrap_or_else(PoisonError::into_inner) = devices.to_vec();
        debug!(port_config_id = self.context.port_config_id, count = devices.len(), "Connected devices updated");
        Ok(())
    }

    fn set_gain(&self, gain: f32) -> Result<()> {
        self.ensure_open()?;
        self.publish(StreamEvent::GainChanged {
            port_config_id: self.context.port_config_id,
            gain,
        })?;
        *self.gain.lock().unwrap_or_else(PoisonError::into_inner) = gain;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!(port_config_id = self.context.port_config_id, "Closing worker stream");
        self.publish(StreamEvent::Closed {
            port_config_id: self.context.port_config_id,
        })
    }
}

/// Creates [`WorkerStream`]s that all report to one worker
pub struct WorkerStreamFactory {
    sender: Sender<StreamEvent>,
    receiver: Receiver<StreamEvent>,
    streams: Mutex<Vec<Arc<WorkerStream>>>,
}

impl WorkerStreamFactory {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity);
        Self {
            sender,
            receiver,
            streams: Mutex::new(Vec::new()),
        }
    }

    /// Channel the stream worker consumes
    pub fn events(&self) -> Receiver<StreamEvent> {
        self.receiver.clone()
    }

    /// Every stream created so far, closed ones included
    pub fn streams(&self) -> Vec<Arc<WorkerStream>> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn create(&self, context: StreamContext, is_input: bool) -> Result<Arc<dyn StreamControl>> {
        let opened = StreamEvent::Opened {
            port_config_id: context.port_config_id,
            is_input,
            buffer_size_frames: context.buffer_size_frames,
            frame_size_bytes: context.frame_size_bytes,
        };
        let stream = Arc::new(WorkerStream::new(context, is_input, self.sender.clone()));
        stream.publish(opened)?;
        self.streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(stream.clone());
        Ok(stream)
    }
}

impl Default for WorkerStreamFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamFactory for WorkerStreamFactory {
    fn create_input_stream(
        &self,
        context: StreamContext,
        metadata: &SinkMetadata,
    ) -> Result<Arc<dyn StreamControl>> {
        debug!(port_config_id = context.port_config_id, tracks = metadata.tracks.len(), "Creating input stream");
        self.create(context, true)
    }

    fn create_output_stream(
        &self,
        context: StreamContext,
        metadata: &SourceMetadata,
        offload_info: Option<&OffloadInfo>,
    ) -> Result<Arc<dyn StreamControl>> {
        debug!(
            port_config_id = context.port_config_id,
            tracks = metadata.tracks.len(),
            offload = offload_info.is_some(),
            "Creating output stream"
        );
        self.create(context, false)
    }
}
