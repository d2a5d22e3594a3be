//! hotswap Testing Framework
//!
//! Utilities for testing plugin deployments without a real host: a
//! scriptable activator, an event sink that records what was published,
//! and builders for module artifacts and plugin directories.

pub mod activator;
pub mod events;
pub mod fixtures;

pub use activator::ScriptedActivator;
pub use events::RecordingEventSink;
pub use fixtures::{ArchiveBuilder, PluginDir};
