//! Core of the audio HAL module: the port graph, patches and the stream
//! reconnection protocol.

pub mod domain;
