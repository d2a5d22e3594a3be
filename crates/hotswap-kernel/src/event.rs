//! Lifecycle events and the sink they are published to.
//!
//! Listeners are registered explicitly with a [`ListenerRegistry`]; there is
//! no discovery step. A [`ChannelEventSink`] forwards events to any number of
//! async subscribers through a tokio broadcast channel.

use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::framework::FrameworkState;
use crate::module::ModuleId;

/// Point-in-time view of the framework handed to framework-level events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameworkSnapshot {
    pub state: FrameworkState,
    /// Modules loaded at the time of the event
    pub modules: Vec<ModuleId>,
}

/// Lifecycle event published by the core.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum LifecycleEvent {
    ModuleInstalled { module: ModuleId },
    ModuleEnabled { module: ModuleId },
    ModuleDisabled { module: ModuleId },
    /// Activation or deactivation failed; the module is left `Failed`
    ModuleFailed { module: ModuleId, error: String },
    ModuleUninstalled { module: ModuleId },
    FrameworkStarted(FrameworkSnapshot),
    FrameworkWarmRestarted(FrameworkSnapshot),
    FrameworkShutdown(FrameworkSnapshot),
}

impl LifecycleEvent {
    /// Module the event is about, if it is a module event.
    pub fn module(&self) -> Option<&ModuleId> {
        match self {
            LifecycleEvent::ModuleInstalled { module }
            | LifecycleEvent::ModuleEnabled { module }
            | LifecycleEvent::ModuleDisabled { module }
            | LifecycleEvent::ModuleFailed { module, .. }
            | LifecycleEvent::ModuleUninstalled { module } => Some(module),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            LifecycleEvent::ModuleInstalled { .. } => "module_installed",
            LifecycleEvent::ModuleEnabled { .. } => "module_enabled",
            LifecycleEvent::ModuleDisabled { .. } => "module_disabled",
            LifecycleEvent::ModuleFailed { .. } => "module_failed",
            LifecycleEvent::ModuleUninstalled { .. } => "module_uninstalled",
            LifecycleEvent::FrameworkStarted(_) => "framework_started",
            LifecycleEvent::FrameworkWarmRestarted(_) => "framework_warm_restarted",
            LifecycleEvent::FrameworkShutdown(_) => "framework_shutdown",
        }
    }
}

/// External collaborator receiving every lifecycle event.
pub trait EventSink: Send + Sync {
    fn broadcast(&self, event: &LifecycleEvent);
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn broadcast(&self, event: &LifecycleEvent) {
        trace!(event = event.name(), "dropping lifecycle event");
    }
}

/// Callback registered with a [`ListenerRegistry`].
pub trait LifecycleListener: Send + Sync {
    fn on_event(&self, event: &LifecycleEvent);
}

impl<F> LifecycleListener for F
where
    F: Fn(&LifecycleEvent) + Send + Sync,
{
    fn on_event(&self, event: &LifecycleEvent) {
        self(event)
    }
}

/// Fan-out sink over explicitly registered listeners, called in
/// registration order.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: RwLock<Vec<Arc<dyn LifecycleListener>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, listener: Arc<dyn LifecycleListener>) {
        self.listeners.write().push(listener);
    }

    /// Remove a listener previously registered with the same `Arc`.
    pub fn unregister(&self, listener: &Arc<dyn LifecycleListener>) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSink for ListenerRegistry {
    fn broadcast(&self, event: &LifecycleEvent) {
        // Snapshot so a listener may register/unregister without deadlocking.
        let listeners = self.listeners.read().clone();
        debug!(event = event.name(), listeners = listeners.len(), "broadcasting lifecycle event");
        for listener in listeners {
            listener.on_event(event);
        }
    }
}

/// Sink publishing to a tokio broadcast channel.
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl ChannelEventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }
}

impl Default for ChannelEventSink {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventSink for ChannelEventSink {
    fn broadcast(&self, event: &LifecycleEvent) {
        // No subscribers is not an error for the publisher.
        if self.tx.send(event.clone()).is_err() {
            trace!(event = event.name(), "no lifecycle subscribers");
        }
    }
}
