//! Collaborators plugged into `audiohal-core` modules: host device discovery,
//! stream workers and the remote submix route table.

pub mod audio;
