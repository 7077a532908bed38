//! Example walking a primary module through a typical session
//!
//! Run with: cargo run --package audiohal-core --example module_demo

use audiohal_core::domain::audio::{AudioFormat, ChannelLayout, DeviceAddress};
use audiohal_core::domain::config::{ConfigManager, ModuleConfigFile};
use audiohal_core::domain::module::{Module, ModuleDebug, ModuleKind};
use audiohal_core::domain::port::{AudioPatch, AudioPortConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter("audiohal_core=debug,info")
        .init();

    println!("=== Audio HAL Module Demo ===\n");

    // 1. Persist and reload the factory default description
    let dir = tempfile::tempdir()?;
    let manager = ConfigManager::new(dir.path().to_path_buf());
    manager.save(&ModuleConfigFile::factory_default()).await?;
    let file = manager.load().await;
    println!(
        "1. Loaded '{}' with {} device ports, {} mix ports and {} routes",
        file.module.name,
        file.device_ports.len(),
        file.mix_ports.len(),
        file.routes.len()
    );

    // 2. Create the module; the graph is built on first use
    let module = Module::new(ModuleKind::Default, file);
    for port in module.get_audio_ports() {
        println!("   [{}] {} ({} profiles)", port.id, port.name, port.profiles.len());
    }

    // 3. Configure the primary output mix port
    let mix = module
        .get_audio_ports()
        .into_iter()
        .find(|p| p.name == "primary output")
        .ok_or("no primary output")?;
    let (config, applied) = module.set_audio_port_config(
        &AudioPortConfig::for_port(mix.id)
            .with_flags(mix.flags)
            .with_format(AudioFormat::PCM_16_BIT)
            .with_channel_mask(ChannelLayout::STEREO)
            .with_sample_rate(48000),
    )?;
    println!("\n3. Port config {} applied: {}", config.id, applied);

    // 4. Connect a USB headset with simulated capabilities
    module.set_module_debug(ModuleDebug {
        simulate_device_connections: true,
        ..Default::default()
    })?;
    let mut usb = module
        .get_audio_ports()
        .into_iter()
        .find(|p| p.name == "USB Device Out")
        .ok_or("no USB template")?;
    if let Some(ext) = usb.device_ext_mut() {
        ext.device.address = DeviceAddress::Alsa(vec![1, 0]);
    }
    let connected = module.connect_external_device(&usb)?;
    println!("\n4. Connected {} as port {}", connected.name, connected.id);

    // 5. Route playback to the speaker, then release everything
    let speaker = module
        .get_audio_ports()
        .into_iter()
        .find(|p| p.name == "Speaker")
        .ok_or("no speaker")?;
    let patch = module.set_audio_patch(&AudioPatch::new(vec![config.id], vec![speaker.id]))?;
    println!(
        "\n5. Patch {} needs at least {} frames per buffer",
        patch.id, patch.minimum_stream_buffer_size_frames
    );

    module.reset_audio_patch(patch.id)?;
    module.reset_audio_port_config(config.id)?;
    module.disconnect_external_device(connected.id)?;
    println!("\n=== Demo complete ===");

    Ok(())
}
