//! Integration tests for modules wired to the infra collaborators

use audiohal_core::domain::audio::{AudioFormat, ChannelLayout, DeviceAddress, HalError};
use audiohal_core::domain::config::ModuleConfigFile;
use audiohal_core::domain::module::{
    Module, ModuleKind, OpenInputStreamArgs, OpenOutputStreamArgs,
};
use audiohal_core::domain::port::{AudioPatch, AudioPort, AudioPortConfig};
use audiohal_infra::audio::{
    PipeConfig, StreamEvent, SubmixHooks, SubmixRouteRegistry, SubmixStreamFactory,
    WorkerStreamFactory,
};
use std::sync::Arc;

const SUBMIX_MODULE: &str = r#"
    [module]
    name = "r_submix"
    kind = "r_submix"

    [[device_ports]]
    name = "Remote Submix Out"
    kind = "out_submix"
    connection = "virtual"

    [[device_ports]]
    name = "Remote Submix In"
    kind = "in_submix"
    connection = "virtual"

    [[mix_ports]]
    name = "r_submix output"
    direction = "output"

    [[mix_ports.profiles]]
    format = { pcm = "int16" }
    channel_masks = [{ layout = 3 }]
    sample_rates = [48000]

    [[mix_ports]]
    name = "r_submix input"
    direction = "input"

    [[mix_ports.profiles]]
    format = { pcm = "int16" }
    channel_masks = [{ layout = 3 }]
    sample_rates = [44100, 48000]

    [[routes]]
    sources = ["r_submix output"]
    sink = "Remote Submix Out"

    [[routes]]
    sources = ["Remote Submix In"]
    sink = "r_submix input"
"#;

fn port(module: &Module, name: &str) -> AudioPort {
    module
        .get_audio_ports()
        .into_iter()
        .filter(|p| p.name == name)
        .max_by_key(|p| p.id)
        .unwrap()
}

fn stereo_config(module: &Module, port_name: &str, rate: u32) -> AudioPortConfig {
    let port = port(module, port_name);
    let (config, applied) = module
        .set_audio_port_config(
            &AudioPortConfig::for_port(port.id)
                .with_flags(port.flags)
                .with_format(AudioFormat::PCM_16_BIT)
                .with_channel_mask(ChannelLayout::STEREO)
                .with_sample_rate(rate),
        )
        .unwrap();
    assert!(applied);
    config
}

#[test]
fn test_worker_streams_follow_patches() {
    let factory = Arc::new(WorkerStreamFactory::new());
    let events = factory.events();
    let module = Module::builder(ModuleKind::Default, ModuleConfigFile::factory_default())
        .stream_factory(factory.clone())
        .build();

    let speaker = port(&module, "Speaker");
    let mix = stereo_config(&module, "primary output", 48000);
    module
        .open_output_stream(&OpenOutputStreamArgs {
            port_config_id: mix.id,
            buffer_size_frames: 960,
            ..Default::default()
        })
        .unwrap();

    let patch = module
        .set_audio_patch(&AudioPatch::new(vec![mix.id], vec![speaker.id]))
        .unwrap();
    module.reset_audio_patch(patch.id).unwrap();
    module.close_stream(mix.id).unwrap();

    let received: Vec<StreamEvent> = events.try_iter().collect();
    let speaker_device = speaker.device().unwrap().clone();
    assert_eq!(
        received,
        vec![
            StreamEvent::Opened {
                port_config_id: mix.id,
                is_input: false,
                buffer_size_frames: 960,
                frame_size_bytes: 4,
            },
            StreamEvent::DevicesChanged {
                port_config_id: mix.id,
                devices: vec![speaker_device],
            },
            StreamEvent::DevicesChanged {
                port_config_id: mix.id,
                devices: vec![],
            },
            StreamEvent::Closed { port_config_id: mix.id },
        ]
    );
}

#[test]
fn test_submix_module_lifecycle() {
    let registry = Arc::new(SubmixRouteRegistry::new());
    let file = ModuleConfigFile::from_toml_str(SUBMIX_MODULE).unwrap();
    let module = Module::builder(ModuleKind::RSubmix, file)
        .hooks(Arc::new(SubmixHooks::new(registry.clone())))
        .build();

    let address = DeviceAddress::Id("0".into());
    let mut request = port(&module, "Remote Submix Out");
    request.device_ext_mut().unwrap().device.address = address.clone();
    let connected = module.connect_external_device(&request).unwrap();
    assert!(!connected.profiles.is_empty());

    registry.find_or_create_route(
        &address,
        PipeConfig::new(AudioFormat::PCM_16_BIT, ChannelLayout::STEREO, 48000),
    );

    let mix = stereo_config(&module, "r_submix output", 48000);
    let mismatched = stereo_config(&module, "Remote Submix Out", 44100);
    assert_eq!(mismatched.port_id, connected.id);
    let result = module.set_audio_patch(&AudioPatch::new(vec![mix.id], vec![mismatched.id]));
    assert!(matches!(result, Err(HalError::Unsupported(_))));
    assert!(module.get_audio_patches().is_empty());

    let device = stereo_config(&module, "Remote Submix Out", 48000);
    let patch = module
        .set_audio_patch(&AudioPatch::new(vec![mix.id], vec![device.id]))
        .unwrap();
    module.reset_audio_patch(patch.id).unwrap();

    module.reset_audio_port_config(mismatched.id).unwrap();
    module.reset_audio_port_config(device.id).unwrap();
    module.disconnect_external_device(connected.id).unwrap();
    assert!(registry.find_route(&address).is_none());
    assert!(registry.is_empty());
}

fn connect_submix(module: &Module, template: &str, address: &DeviceAddress) -> AudioPort {
    let mut request = port(module, template);
    request.device_ext_mut().unwrap().device.address = address.clone();
    module.connect_external_device(&request).unwrap()
}

#[test]
fn test_submix_streams_validated_against_route() {
    let registry = Arc::new(SubmixRouteRegistry::new());
    let workers = Arc::new(WorkerStreamFactory::new());
    let file = ModuleConfigFile::from_toml_str(SUBMIX_MODULE).unwrap();
    let module = Module::builder(ModuleKind::RSubmix, file)
        .hooks(Arc::new(SubmixHooks::new(registry.clone())))
        .stream_factory(Arc::new(SubmixStreamFactory::new(registry.clone(), workers.clone())))
        .build();

    let address = DeviceAddress::Id("0".into());
    connect_submix(&module, "Remote Submix Out", &address);
    connect_submix(&module, "Remote Submix In", &address);

    let out_mix = stereo_config(&module, "r_submix output", 48000);
    let out_device = stereo_config(&module, "Remote Submix Out", 48000);
    module
        .open_output_stream(&OpenOutputStreamArgs {
            port_config_id: out_mix.id,
            buffer_size_frames: 960,
            ..Default::default()
        })
        .unwrap();
    let playback = module
        .set_audio_patch(&AudioPatch::new(vec![out_mix.id], vec![out_device.id]))
        .unwrap();
    let route = registry.find_route(&address).unwrap();
    assert!(route.is_stream_out_open());

    // capture at a rate the pipe does not carry
    let in_mix = stereo_config(&module, "r_submix input", 44100);
    let in_device = stereo_config(&module, "Remote Submix In", 44100);
    let open_input = |config_id| OpenInputStreamArgs {
        port_config_id: config_id,
        buffer_size_frames: 960,
        ..Default::default()
    };
    module.open_input_stream(&open_input(in_mix.id)).unwrap();
    let result = module.set_audio_patch(&AudioPatch::new(vec![in_device.id], vec![in_mix.id]));
    assert!(matches!(result, Err(HalError::IllegalState(_))));
    assert_eq!(module.get_audio_patches(), vec![playback.clone()]);
    assert!(!route.is_stream_in_open());
    module.close_stream(in_mix.id).unwrap();

    let in_mix = stereo_config(&module, "r_submix input", 48000);
    let in_device = stereo_config(&module, "Remote Submix In", 48000);
    module.open_input_stream(&open_input(in_mix.id)).unwrap();
    let capture = module
        .set_audio_patch(&AudioPatch::new(vec![in_device.id], vec![in_mix.id]))
        .unwrap();
    assert!(route.is_stream_in_open());

    module.reset_audio_patch(playback.id).unwrap();
    assert!(!route.is_stream_out_open());
    assert!(registry.find_route(&address).is_some());
    module.reset_audio_patch(capture.id).unwrap();
    assert!(registry.is_empty());
}
