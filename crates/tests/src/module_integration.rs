//! Integration tests for the module graph
//!
//! These tests drive a module built from the factory default description
//! through its public API: port config resolution, patch lifecycle with stream
//! reconnection and rollback, external device connection and gain routing.

use crate::mocks::{CountingRegistry, MockFactory};
use audiohal_core::domain::audio::{
    gain_mode, AudioFormat, AudioGain, AudioGainConfig, ChannelLayout, DeviceAddress, HalError,
};
use audiohal_core::domain::config::{ConfigManager, ModuleConfigFile};
use audiohal_core::domain::module::{Module, ModuleDebug, ModuleKind, OpenOutputStreamArgs};
use audiohal_core::domain::patch::PatchIndex;
use audiohal_core::domain::port::{AudioPatch, AudioPort, AudioPortConfig};
use proptest::prelude::*;
use std::sync::atomic::Ordering;
use std::sync::Arc;

fn module_with(factory: Arc<MockFactory>) -> Module {
    Module::builder(ModuleKind::Default, ModuleConfigFile::factory_default())
        .stream_factory(factory)
        .build()
}

fn port(module: &Module, name: &str) -> AudioPort {
    module
        .get_audio_ports()
        .into_iter()
        .filter(|p| p.name == name)
        .max_by_key(|p| p.id)
        .unwrap()
}

fn pcm_config(module: &Module, port_name: &str, mask: ChannelLayout, rate: u32) -> AudioPortConfig {
    let port = port(module, port_name);
    let (config, applied) = module
        .set_audio_port_config(
            &AudioPortConfig::for_port(port.id)
                .with_flags(port.flags)
                .with_format(AudioFormat::PCM_16_BIT)
                .with_channel_mask(mask)
                .with_sample_rate(rate),
        )
        .unwrap();
    assert!(applied, "config for {} not applied", port_name);
    config
}

fn open_output(module: &Module, port_config_id: i32) {
    module
        .open_output_stream(&OpenOutputStreamArgs {
            port_config_id,
            buffer_size_frames: 960,
            ..Default::default()
        })
        .unwrap();
}

// ============================================================================
// PORT CONFIG RESOLUTION
// ============================================================================

#[test]
fn test_default_config_determinism() {
    let module = module_with(Arc::default());
    let mix = port(&module, "primary output");
    let configs_before = module.get_audio_port_configs();

    let request = AudioPortConfig::for_port(mix.id);
    let (first, first_applied) = module.set_audio_port_config(&request).unwrap();
    let (second, second_applied) = module.set_audio_port_config(&request).unwrap();

    assert!(!first_applied && !second_applied);
    assert_eq!(first, second);
    assert_eq!(first.format, Some(AudioFormat::PCM_16_BIT));
    assert_eq!(first.channel_mask, Some(ChannelLayout::STEREO));
    assert_eq!(first.sample_rate, Some(44100));
    assert_eq!(module.get_audio_port_configs(), configs_before);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn test_commit_iff_valid_and_complete(
        with_flags in any::<bool>(),
        with_format in any::<bool>(),
        with_mask in any::<bool>(),
        with_rate in any::<bool>(),
    ) {
        let module = module_with(Arc::default());
        let mix = port(&module, "primary output");
        let configs_before = module.get_audio_port_configs().len();

        let mut request = AudioPortConfig::for_port(mix.id);
        if with_flags {
            request = request.with_flags(mix.flags);
        }
        if with_format {
            request = request.with_format(AudioFormat::PCM_16_BIT);
        }
        if with_mask {
            request = request.with_channel_mask(ChannelLayout::STEREO);
        }
        if with_rate {
            request = request.with_sample_rate(48000);
        }
        let (suggested, applied) = module.set_audio_port_config(&request).unwrap();

        let complete = with_flags && with_format && with_mask && with_rate;
        prop_assert_eq!(applied, complete);
        prop_assert_eq!(module.get_audio_port_configs().len(), configs_before + usize::from(complete));
        let expected_rate = if with_rate { 48000 } else { 44100 };
        prop_assert_eq!(suggested.sample_rate, Some(expected_rate));
    }
}

#[test]
fn test_invalid_field_blocks_commit() {
    let module = module_with(Arc::default());
    let mix = port(&module, "primary output");
    let request = AudioPortConfig::for_port(mix.id)
        .with_flags(mix.flags)
        .with_format(AudioFormat::PCM_16_BIT)
        .with_channel_mask(ChannelLayout::STEREO)
        .with_sample_rate(12345);
    let configs_before = module.get_audio_port_configs();

    let (suggested, applied) = module.set_audio_port_config(&request).unwrap();
    assert!(!applied);
    assert_ne!(suggested.sample_rate, Some(12345));
    assert_eq!(suggested.channel_mask, Some(ChannelLayout::STEREO));
    assert_eq!(module.get_audio_port_configs(), configs_before);
}

// ============================================================================
// PATCHES
// ============================================================================

#[test]
fn test_exclusive_sink_rejects_second_patch() {
    let module = module_with(Arc::default());
    let telephony_rx = port(&module, "Telephony Rx").id;
    let fm_tuner = port(&module, "FM Tuner").id;
    let first_sink = pcm_config(&module, "telephony_rx", ChannelLayout::MONO, 16000);
    let second_sink = pcm_config(&module, "telephony_rx", ChannelLayout::MONO, 8000);

    let first = module
        .set_audio_patch(&AudioPatch::new(vec![telephony_rx], vec![first_sink.id]))
        .unwrap();
    let index_before = module.patch_index();
    let patches_before = module.get_audio_patches();

    for sink in [first_sink.id, second_sink.id] {
        let result = module.set_audio_patch(&AudioPatch::new(vec![fm_tuner], vec![sink]));
        assert!(matches!(result, Err(HalError::IllegalState(_))), "sink {}", sink);
    }
    assert_eq!(module.patch_index(), index_before);
    assert_eq!(module.get_audio_patches(), patches_before);
    assert!(module.patch_index().patches_for(first_sink.id).eq([first.id]));

    // the owner of the exclusive sink may still update its patch
    let mut update = first.clone();
    update.source_port_config_ids = vec![fm_tuner];
    let updated = module.set_audio_patch(&update).unwrap();
    assert_eq!(updated.id, first.id);
}

#[test]
fn test_failed_reconnection_rolls_back() {
    let factory = Arc::new(MockFactory::default());
    let module = module_with(factory.clone());
    let speaker = port(&module, "Speaker").id;
    let mix = pcm_config(&module, "primary output", ChannelLayout::STEREO, 48000);
    open_output(&module, mix.id);

    let stream = factory.stream(mix.id);
    stream.set_fail_connections(true);

    let snapshot_before = module.snapshot();
    let index_before = module.patch_index();
    let result = module.set_audio_patch(&AudioPatch::new(vec![mix.id], vec![speaker]));

    assert!(result.is_err());
    assert!(stream.device_updates() > 0);
    assert_eq!(module.get_audio_patches(), snapshot_before.configuration.patches);
    assert_eq!(module.patch_index(), index_before);
    assert_eq!(
        module.snapshot().configuration.next_patch_id,
        snapshot_before.configuration.next_patch_id
    );
    assert!(stream.devices().is_empty());

    // once the stream recovers the same request goes through
    stream.set_fail_connections(false);
    let patch = module
        .set_audio_patch(&AudioPatch::new(vec![mix.id], vec![speaker]))
        .unwrap();
    assert_eq!(patch.id, snapshot_before.configuration.next_patch_id);
    assert_eq!(stream.devices(), vec![port(&module, "Speaker").device().unwrap().clone()]);
}

#[test]
fn test_patch_round_trip() {
    let module = module_with(Arc::default());
    let speaker = port(&module, "Speaker").id;
    let mix = pcm_config(&module, "primary output", ChannelLayout::STEREO, 48000);

    let created = module
        .set_audio_patch(&AudioPatch::new(vec![mix.id], vec![speaker]))
        .unwrap();
    assert!(created.id > 0);
    assert_eq!(created.minimum_stream_buffer_size_frames, 240);

    let stored = module
        .get_audio_patches()
        .into_iter()
        .find(|p| p.id == created.id)
        .unwrap();
    assert_eq!(stored.source_port_config_ids, vec![mix.id]);
    assert_eq!(stored.sink_port_config_ids, vec![speaker]);
    assert_eq!(stored.latencies_ms.len(), 1);

    module.reset_audio_patch(created.id).unwrap();
    assert!(module.get_audio_patches().is_empty());
    assert!(module.patch_index().is_empty());
    assert!(matches!(module.reset_audio_patch(created.id), Err(HalError::InvalidArgument(_))));
}

#[test]
fn test_concurrent_patch_cycles_keep_index_consistent() {
    let module = Arc::new(module_with(Arc::default()));
    let speaker = port(&module, "Speaker").id;
    let mixes: Vec<i32> = (0..4)
        .map(|_| pcm_config(&module, "primary output", ChannelLayout::STEREO, 48000).id)
        .collect();

    std::thread::scope(|scope| {
        for mix in &mixes {
            let module = Arc::clone(&module);
            let mix = *mix;
            scope.spawn(move || {
                for _ in 0..50 {
                    let patch = module
                        .set_audio_patch(&AudioPatch::new(vec![mix], vec![speaker]))
                        .unwrap();
                    let index = module.patch_index();
                    assert!(index.contains(mix));
                    module.reset_audio_patch(patch.id).unwrap();
                }
            });
        }
    });

    let snapshot = module.snapshot();
    assert!(snapshot.configuration.patches.is_empty());
    assert_eq!(
        module.patch_index(),
        PatchIndex::rebuild(&snapshot.configuration.patches, &snapshot.configuration.port_configs)
    );
    assert_eq!(snapshot.configuration.next_patch_id, 1 + 4 * 50);
}

// ============================================================================
// EXTERNAL DEVICES
// ============================================================================

#[test]
fn test_disconnect_guarded_by_client_config() {
    let module = module_with(Arc::default());
    module
        .set_module_debug(ModuleDebug {
            simulate_device_connections: true,
            ..Default::default()
        })
        .unwrap();

    let mut request = port(&module, "USB Device Out");
    request.device_ext_mut().unwrap().device.address = DeviceAddress::Alsa(vec![1, 0]);
    let connected = module.connect_external_device(&request).unwrap();
    assert_ne!(connected.id, request.id);
    assert!(!connected.profiles.is_empty());

    let config = pcm_config(&module, "USB Device Out", ChannelLayout::STEREO, 48000);
    assert_eq!(config.port_id, connected.id);
    assert!(matches!(
        module.disconnect_external_device(connected.id),
        Err(HalError::IllegalState(_))
    ));

    module.reset_audio_port_config(config.id).unwrap();
    module.disconnect_external_device(connected.id).unwrap();
    assert!(module.get_audio_ports().iter().all(|p| p.id != connected.id));
    assert!(module.get_audio_routes().iter().all(|r| !r.involves(connected.id)));

    // simulation can be switched off again once nothing is connected
    module.set_module_debug(ModuleDebug::default()).unwrap();
}

#[test]
fn test_same_device_connects_once() {
    let module = module_with(Arc::default());
    module
        .set_module_debug(ModuleDebug {
            simulate_device_connections: true,
            ..Default::default()
        })
        .unwrap();
    let template = port(&module, "Wired Headset Out");
    let connected = module.connect_external_device(&template).unwrap();

    assert!(matches!(
        module.connect_external_device(&template),
        Err(HalError::IllegalState(_))
    ));
    assert!(matches!(
        module.set_module_debug(ModuleDebug::default()),
        Err(HalError::IllegalState(_))
    ));
    module.prepare_to_disconnect_external_device(connected.id).unwrap();
    module.disconnect_external_device(connected.id).unwrap();
}

// ============================================================================
// GAIN
// ============================================================================

#[test]
fn test_gain_reaches_streams_feeding_the_device() {
    let mut file = ModuleConfigFile::factory_default();
    let mic = file
        .device_ports
        .iter_mut()
        .find(|p| p.name == "Built-In Mic")
        .unwrap();
    mic.gains = vec![AudioGain {
        mode: gain_mode::JOINT,
        channel_mask: ChannelLayout::MONO,
        min_value: -1200,
        max_value: 1200,
        default_value: 0,
        step_value: 100,
        ..Default::default()
    }];

    let factory = Arc::new(MockFactory::default());
    let (registry, gain_calls) = CountingRegistry::new();
    let module = Module::builder(ModuleKind::Default, file)
        .stream_factory(factory.clone())
        .stream_registry(Box::new(registry))
        .build();

    let speaker = port(&module, "Speaker");
    let mix = pcm_config(&module, "primary output", ChannelLayout::STEREO, 48000);
    open_output(&module, mix.id);

    let request = AudioPortConfig::for_existing(speaker.id).with_gain(AudioGainConfig::joint(0, -2000));
    let (_, applied) = module.set_audio_port_config(&request).unwrap();
    assert!(applied);

    let gains = factory.stream(mix.id).gains();
    assert_eq!(gains.len(), 1);
    assert!((gains[0] - 0.1).abs() < 1e-4, "gain {}", gains[0]);
    let calls_after_speaker = gain_calls.load(Ordering::SeqCst);
    assert!(calls_after_speaker > 0);

    // nothing is routed into the microphone
    let mic = port(&module, "Built-In Mic");
    let request = AudioPortConfig::for_existing(mic.id).with_gain(AudioGainConfig::joint(0, 600));
    let (_, applied) = module.set_audio_port_config(&request).unwrap();
    assert!(applied);
    assert_eq!(gain_calls.load(Ordering::SeqCst), calls_after_speaker);
    assert_eq!(factory.stream(mix.id).gains().len(), 1);
}

// ============================================================================
// CONFIGURATION FILES
// ============================================================================

#[tokio::test]
async fn test_module_from_managed_file() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let manager = ConfigManager::new(temp_dir.path().to_path_buf());

    let mut file = ModuleConfigFile::factory_default();
    file.module.name = "saved".to_string();
    manager.save(&file).await.unwrap();

    let loaded = manager.load().await;
    assert_eq!(loaded.module.name, "saved");

    let module = Module::new(ModuleKind::Default, loaded);
    assert_eq!(module.get_audio_ports().len(), file.device_ports.len() + file.mix_ports.len());
    assert_eq!(module.get_audio_routes().len(), file.routes.len());
    assert_eq!(module.get_microphones().len(), 1);
    assert!(module.is_mmap_supported());
}
