//! Stream doubles with call counting and failure injection

use audiohal_core::domain::audio::{AudioDevice, HalError, Result};
use audiohal_core::domain::stream::{
    OffloadInfo, SinkMetadata, SourceMetadata, StreamContext, StreamControl, StreamFactory,
    StreamRegistry, StreamSet,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
pub struct MockStream {
    devices: Mutex<Vec<AudioDevice>>,
    gains: Mutex<Vec<f32>>,
    device_updates: AtomicUsize,
    fail_connections: AtomicBool,
}

impl MockStream {
    pub fn devices(&self) -> Vec<AudioDevice> {
        self.devices.lock().unwrap().clone()
    }

    pub fn gains(&self) -> Vec<f32> {
        self.gains.lock().unwrap().clone()
    }

    pub fn device_updates(&self) -> usize {
        self.device_updates.load(Ordering::SeqCst)
    }

    /// Makes every device update fail until cleared
    pub fn set_fail_connections(&self, fail: bool) {
        self.fail_connections.store(fail, Ordering::SeqCst);
    }
}

impl StreamControl for MockStream {
    fn set_connected_devices(&self, devices: &[AudioDevice]) -> Result<()> {
        self.device_updates.fetch_add(1, Ordering::SeqCst);
        if self.fail_connections.load(Ordering::SeqCst) {
            return Err(HalError::illegal_state("injected failure"));
        }
        *self.devices.lock().unwrap() = devices.to_vec();
        Ok(())
    }

    fn set_gain(&self, gain: f32) -> Result<()> {
        self.gains.lock().unwrap().push(gain);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct MockFactory {
    streams: Mutex<BTreeMap<i32, Arc<MockStream>>>,
}

impl MockFactory {
    pub fn stream(&self, port_config_id: i32) -> Arc<MockStream> {
        self.streams.lock().unwrap()[&port_config_id].clone()
    }

    fn create(&self, context: &StreamContext) -> Arc<dyn StreamControl> {
        let stream = Arc::new(MockStream::default());
        self.streams.lock().unwrap().insert(context.port_config_id, stream.clone());
        stream
    }
}

impl StreamFactory for MockFactory {
    fn create_input_stream(&self, context: StreamContext, _: &SinkMetadata) -> Result<Arc<dyn StreamControl>> {
        Ok(self.create(&context))
    }

    fn create_output_stream(
        &self,
        context: StreamContext,
        _: &SourceMetadata,
        _: Option<&OffloadInfo>,
    ) -> Result<Arc<dyn StreamControl>> {
        Ok(self.create(&context))
    }
}

/// Registry counting the gain requests it receives
pub struct CountingRegistry {
    inner: StreamSet,
    gain_calls: Arc<AtomicUsize>,
}

impl CountingRegistry {
    pub fn new() -> (Self, Arc<AtomicUsize>) {
        let gain_calls = Arc::new(AtomicUsize::new(0));
        (
            Self {
                inner: StreamSet::new(),
                gain_calls: gain_calls.clone(),
            },
            gain_calls,
        )
    }
}

impl StreamRegistry for CountingRegistry {
    fn count(&self, id: i32) -> usize {
        self.inner.count(id)
    }

    fn insert(&mut self, port_id: i32, port_config_id: i32, stream: Arc<dyn StreamControl>) {
        self.inner.insert(port_id, port_config_id, stream)
    }

    fn remove(&mut self, port_config_id: i32) -> Option<Arc<dyn StreamControl>> {
        self.inner.remove(port_config_id)
    }

    fn find(&self, port_config_id: i32) -> Option<Arc<dyn StreamControl>> {
        self.inner.find(port_config_id)
    }

    fn set_stream_connected_devices(&self, port_config_id: i32, devices: &[AudioDevice]) -> Result<()> {
        self.inner.set_stream_connected_devices(port_config_id, devices)
    }

    fn set_gain(&self, port_id: i32, gain: f32) -> Result<()> {
        self.gain_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.set_gain(port_id, gain)
    }
}
