//! Cross-crate integration tests for audio HAL modules

#[cfg(test)]
mod mocks;

#[cfg(test)]
mod module_integration;

#[cfg(test)]
mod infra_integration;
