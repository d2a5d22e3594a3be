//! hotswap kernel
//!
//! Leaf types and contracts shared by the hot-swap runtime: the framework
//! state machine, module identity and lifecycle states, persisted enablement
//! overrides, lifecycle events, configuration and logging setup.

pub mod config;
pub mod error;
pub mod event;
pub mod framework;
pub mod logging;
pub mod module;
pub mod store;

pub use config::FrameworkConfig;
pub use error::{KernelError, KernelResult};
pub use event::{
    ChannelEventSink, EventSink, FrameworkSnapshot, LifecycleEvent, LifecycleListener,
    ListenerRegistry, NoopEventSink,
};
pub use framework::{FrameworkState, FrameworkStateTracker, TransitionError};
pub use module::{
    ModuleDescriptor, ModuleId, ModuleKey, ModuleState, PersistentState, PersistentStateBuilder,
    RestartState,
};
pub use store::{
    JsonFileOverridesStore, MemoryOverridesStore, OverridesStore, PersistenceError, open_overrides_store,
};
