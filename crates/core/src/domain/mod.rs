//! Domain entities and business rules

pub mod audio;
pub mod config;
mod device;
pub mod hooks;
pub mod module;
pub mod patch;
pub mod port;
pub mod resolver;
pub mod store;
pub mod stream;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export specific items to avoid ambiguous glob imports
pub use audio::{
    AudioDevice, AudioFormat, AudioGainConfig, AudioProfile, ChannelLayout, DeviceAddress,
    DeviceKind, HalError, IoFlags,
};
pub use config::{ConfigError, ConfigManager, ConfigurationLoader, ModuleConfigFile};
pub use hooks::{DefaultHooks, ModuleHooks};
pub use module::{
    Module, ModuleBuilder, ModuleDebug, ModuleKind, ModuleSnapshot, OpenInputStreamArgs,
    OpenOutputStreamArgs, OpenStreamReturn,
};
pub use patch::PatchIndex;
pub use port::{AudioPatch, AudioPort, AudioPortConfig, AudioPortExt, AudioRoute};
pub use store::Configuration;
pub use stream::{StreamContext, StreamControl, StreamFactory, StreamRegistry};
