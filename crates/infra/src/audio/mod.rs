//! Platform-facing module collaborators
//!
//! This module provides:
//! - `cpal_backend`: fills connected device ports from the host devices (CPAL)
//! - `stream`: streams that forward state changes to a worker over a channel
//! - `submix`: the remote submix route registry, its streams and module hooks

pub mod cpal_backend;
pub mod stream;
pub mod submix;

pub use cpal_backend::{CpalDevicePopulator, SupportedRange};
pub use stream::{StreamEvent, WorkerStream, WorkerStreamFactory};
pub use submix::{
    PipeConfig, SubmixHooks, SubmixRoute, SubmixRouteRegistry, SubmixStream, SubmixStreamFactory,
};
