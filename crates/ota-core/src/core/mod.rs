//! Internal implementation modules for `ota-core`.
//!
//! Hosts normally go through [`crate::UpdatesController`]; the pieces below
//! are public for tools that drive the store or loaders directly.

pub mod config;
pub mod controller;
pub mod errors;
pub mod events;
pub mod launcher;
pub mod loader;
pub mod loader_task;
pub mod reaper;
pub(crate) mod signal;
pub mod store;

#[cfg(test)]
pub(crate) mod test_support;
