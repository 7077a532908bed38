//! Fixtures shared by the unit tests of the domain modules

use crate::domain::audio::{AudioDevice, HalError, Result};
use crate::domain::config::ModuleConfigFile;
use crate::domain::store::Configuration;
use crate::domain::stream::{
    OffloadInfo, SinkMetadata, SourceMetadata, StreamContext, StreamControl, StreamFactory,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub fn primary_config() -> Configuration {
    ModuleConfigFile::factory_default()
        .into_configuration()
        .expect("factory default must build")
}

/// Stream that remembers what the module told it
#[derive(Default)]
pub struct RecordingStream {
    devices: Mutex<Vec<AudioDevice>>,
    gains: Mutex<Vec<f32>>,
    fail_next: AtomicBool,
    closed: AtomicBool,
}

impl RecordingStream {
    pub fn devices(&self) -> Vec<AudioDevice> {
        self.devices.lock().unwrap().clone()
    }

    pub fn gains(&self) -> Vec<f32> {
        self.gains.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Makes the next device update fail
    pub fn fail_next_connection(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

impl StreamControl for RecordingStream {
    fn set_connected_devices(&self, devices: &[AudioDevice]) -> Result<()> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(HalError::illegal_state("injected connection failure"));
        }
        *self.devices.lock().unwrap() = devices.to_vec();
        Ok(())
    }

    fn set_gain(&self, gain: f32) -> Result<()> {
        self.gains.lock().unwrap().push(gain);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory keeping every stream it creates, keyed by port config id
#[derive(Default)]
pub struct RecordingFactory {
    streams: Mutex<BTreeMap<i32, Arc<RecordingStream>>>,
    fail_new: AtomicBool,
}

impl RecordingFactory {
    pub fn created(&self) -> usize {
        self.streams.lock().unwrap().len()
    }

    pub fn stream(&self, port_config_id: i32) -> Option<Arc<RecordingStream>> {
        self.streams.lock().unwrap().get(&port_config_id).cloned()
    }

    /// Makes the first device update of the next created stream fail
    pub fn fail_next_stream_connection(&self) {
        self.fail_new.store(true, Ordering::SeqCst);
    }

    fn create(&self, context: &StreamContext) -> Arc<dyn StreamControl> {
        let stream = Arc::new(RecordingStream::default());
        if self.fail_new.swap(false, Ordering::SeqCst) {
            stream.fail_next_connection();
        }
        self.streams
            .lock()
            .unwrap()
            .insert(context.port_config_id, stream.clone());
        stream
    }
}

impl StreamFactory for RecordingFactory {
    fn create_input_stream(
        &self,
        context: StreamContext,
        _metadata: &SinkMetadata,
    ) -> Result<Arc<dyn StreamControl>> {
        Ok(self.create(&context))
    }

    fn create_output_stream(
        &self,
        context: StreamContext,
        _metadata: &SourceMetadata,
        _offload_info: Option<&OffloadInfo>,
    ) -> Result<Arc<dyn StreamControl>> {
        Ok(self.create(&context))
    }
}
