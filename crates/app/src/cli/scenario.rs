//! Scripted client sessions
//!
//! A scenario is a TOML file with a list of `[[steps]]`, each naming a module
//! operation in `op`. Ports are referred to by name; port configs either by id
//! or by the name of their port, which selects the most recent config of it.

use anyhow::{anyhow, Context};
use audiohal_core::domain::audio::{AudioFormat, ChannelLayout, DeviceAddress};
use audiohal_core::domain::config::ModuleConfigFile;
use audiohal_core::domain::hooks::{DefaultHooks, ModuleHooks};
use audiohal_core::domain::module::{
    Module, ModuleDebug, ModuleKind, OpenInputStreamArgs, OpenOutputStreamArgs,
};
use audiohal_core::domain::port::{AudioPatch, AudioPort, AudioPortConfig};
use audiohal_core::domain::stream::StreamFactory;
use audiohal_infra::audio::{
    CpalDevicePopulator, SubmixHooks, SubmixRouteRegistry, SubmixStreamFactory, WorkerStreamFactory,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl Scenario {
    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading scenario {}", path.display()))?;
        Self::from_toml_str(&contents)
    }
}

/// Port config selector
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ConfigRef {
    Id(i32),
    Port(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    SetPortConfig {
        port: String,
        #[serde(default)]
        format: Option<AudioFormat>,
        #[serde(default)]
        channel_mask: Option<ChannelLayout>,
        #[serde(default)]
        sample_rate: Option<u32>,
    },
    ResetPortConfig {
        config: ConfigRef,
    },
    SetPatch {
        #[serde(default)]
        id: i32,
        sources: Vec<ConfigRef>,
        sinks: Vec<ConfigRef>,
    },
    ResetPatch {
        id: i32,
    },
    Connect {
        template: String,
        #[serde(default)]
        address: DeviceAddress,
    },
    Disconnect {
        port: String,
    },
    PrepareToDisconnect {
        port: String,
    },
    OpenOutput {
        config: ConfigRef,
        buffer_size_frames: i64,
    },
    OpenInput {
        config: ConfigRef,
        buffer_size_frames: i64,
    },
    CloseStream {
        config: ConfigRef,
    },
    SetDebug {
        simulate_device_connections: bool,
        #[serde(default)]
        stream_transient_state_delay_ms: i32,
    },
}

impl Step {
    pub fn name(&self) -> &'static str {
        match self {
            Step::SetPortConfig { .. } => "set_port_config",
            Step::ResetPortConfig { .. } => "reset_port_config",
            Step::SetPatch { .. } => "set_patch",
            Step::ResetPatch { .. } => "reset_patch",
            Step::Connect { .. } => "connect",
            Step::Disconnect { .. } => "disconnect",
            Step::PrepareToDisconnect { .. } => "prepare_to_disconnect",
            Step::OpenOutput { .. } => "open_output",
            Step::OpenInput { .. } => "open_input",
            Step::CloseStream { .. } => "close_stream",
            Step::SetDebug { .. } => "set_debug",
        }
    }
}

/// Creates the module described by `file`
///
/// Hooks are chosen by module kind, and remote submix modules route their
/// streams through the submix route registry. The module's debug settings are
/// applied from the file before it is returned.
pub fn build_module(file: &ModuleConfigFile, factory: Arc<WorkerStreamFactory>) -> anyhow::Result<Module> {
    let kind = file.module.kind;
    let mut factory: Arc<dyn StreamFactory> = factory;
    let hooks: Arc<dyn ModuleHooks> = match kind {
        ModuleKind::Usb => Arc::new(CpalDevicePopulator::new()),
        ModuleKind::RSubmix => {
            let registry = Arc::new(SubmixRouteRegistry::new());
            factory = Arc::new(SubmixStreamFactory::new(registry.clone(), factory));
            Arc::new(SubmixHooks::new(registry))
        }
        _ => Arc::new(DefaultHooks),
    };
    let module = Module::builder(kind, file.clone())
        .hooks(hooks)
        .stream_factory(factory)
        .build();

    let debug = ModuleDebug {
        simulate_device_connections: file.module.simulate_device_connections,
        stream_transient_state_delay_ms: file.module.stream_transient_state_delay_ms,
    };
    if debug != ModuleDebug::default() {
        module.set_module_debug(debug)?;
    }
    info!(module = %kind, name = %file.module.name, "Module ready");
    Ok(module)
}

/// Most recently created port with the given name
fn port_named(module: &Module, name: &str) -> anyhow::Result<AudioPort> {
    module
        .get_audio_ports()
        .into_iter()
        .filter(|p| p.name == name)
        .max_by_key(|p| p.id)
        .ok_or_else(|| anyhow!("no port named '{}'", name))
}

fn resolve_config(module: &Module, config: &ConfigRef) -> anyhow::Result<i32> {
    match config {
        ConfigRef::Id(id) => Ok(*id),
        ConfigRef::Port(name) => {
            let port = port_named(module, name)?;
            module
                .get_audio_port_configs()
                .into_iter()
                .filter(|c| c.port_id == port.id)
                .map(|c| c.id)
                .max()
                .ok_or_else(|| anyhow!("port '{}' has no config", name))
        }
    }
}

fn resolve_configs(module: &Module, configs: &[ConfigRef]) -> anyhow::Result<Vec<i32>> {
    configs.iter().map(|c| resolve_config(module, c)).collect()
}

/// Executes one step, returning what the module answered
pub fn run_step(module: &Module, step: &Step) -> anyhow::Result<Value> {
    debug!(op = step.name(), "Running scenario step");
    let result = match step {
        Step::SetPortConfig {
            port,
            format,
            channel_mask,
            sample_rate,
        } => {
            let port = port_named(module, port)?;
            let mut request = AudioPortConfig::for_port(port.id).with_flags(port.flags);
            request.format = format.clone();
            request.channel_mask = *channel_mask;
            request.sample_rate = *sample_rate;
            let (config, applied) = module.set_audio_port_config(&request)?;
            json!({ "applied": applied, "config": config })
        }
        Step::ResetPortConfig { config } => {
            let id = resolve_config(module, config)?;
            module.reset_audio_port_config(id)?;
            json!({ "reset": id })
        }
        Step::SetPatch { id, sources, sinks } => {
            let mut patch = AudioPatch::new(resolve_configs(module, sources)?, resolve_configs(module, sinks)?);
            patch.id = *id;
            json!(module.set_audio_patch(&patch)?)
        }
        Step::ResetPatch { id } => {
            module.reset_audio_patch(*id)?;
            json!({ "reset": id })
        }
        Step::Connect { template, address } => {
            let mut request = module
                .get_audio_ports()
                .into_iter()
                .filter(|p| p.name == *template)
                .min_by_key(|p| p.id)
                .ok_or_else(|| anyhow!("no port named '{}'", template))?;
            let ext = request
                .device_ext_mut()
                .ok_or_else(|| anyhow!("'{}' is not a device port", template))?;
            ext.device.address = address.clone();
            json!(module.connect_external_device(&request)?)
        }
        Step::Disconnect { port } => {
            let port = port_named(module, port)?;
            module.disconnect_external_device(port.id)?;
            json!({ "disconnected": port.id })
        }
        Step::PrepareToDisconnect { port } => {
            let port = port_named(module, port)?;
            module.prepare_to_disconnect_external_device(port.id)?;
            json!({ "prepared": port.id })
        }
        Step::OpenOutput {
            config,
            buffer_size_frames,
        } => {
            let opened = module.open_output_stream(&OpenOutputStreamArgs {
                port_config_id: resolve_config(module, config)?,
                buffer_size_frames: *buffer_size_frames,
                ..Default::default()
            })?;
            json!(opened.descriptor)
        }
        Step::OpenInput {
            config,
            buffer_size_frames,
        } => {
            let opened = module.open_input_stream(&OpenInputStreamArgs {
                port_config_id: resolve_config(module, config)?,
                buffer_size_frames: *buffer_size_frames,
                ..Default::default()
            })?;
            json!(opened.descriptor)
        }
        Step::CloseStream { config } => {
            let id = resolve_config(module, config)?;
            module.close_stream(id)?;
            json!({ "closed": id })
        }
        Step::SetDebug {
            simulate_device_connections,
            stream_transient_state_delay_ms,
        } => {
            let debug = ModuleDebug {
                simulate_device_connections: *simulate_device_connections,
                stream_transient_state_delay_ms: *stream_transient_state_delay_ms,
            };
            module.set_module_debug(debug)?;
            json!(debug)
        }
    };
    Ok(result)
}

/// Runs every step, collecting one outcome record per step
///
/// A failing step is recorded and the run continues.
pub fn run_scenario(module: &Module, scenario: &Scenario) -> Vec<Value> {
    scenario
        .steps
        .iter()
        .enumerate()
        .map(|(index, step)| match run_step(module, step) {
            Ok(result) => json!({ "step": index, "op": step.name(), "ok": true, "result": result }),
            Err(e) => json!({ "step": index, "op": step.name(), "ok": false, "error": e.to_string() }),
        })
        .collect()
}
