//! Per-module lifecycle supervision
//!
//! [`ModuleLifecycleManager`] owns the state table of every loaded module and
//! drives it through install → enable → disable → uninstall. Activation and
//! deactivation are delegated to a [`ModuleActivator`], which runs with the
//! module's resolver installed as the current resolver. Effective enablement
//! is computed from the persisted overrides, never stored twice.
//!
//! The table lock is only held for the state flip itself, never across an
//! activator call. Two operations on the same module must be serialized by
//! the caller; operations on different modules may run concurrently.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use hotswap_kernel::{
    EventSink, FrameworkState, FrameworkStateTracker, LifecycleEvent, ModuleDescriptor, ModuleId,
    ModuleKey, ModuleState, OverridesStore, PersistenceError, PersistentState, PersistentStateBuilder,
    RestartState,
};

use crate::resolver::{Resolver, with_resolver};

/// Error returned by a [`ModuleActivator`].
pub type ActivationError = Box<dyn std::error::Error + Send + Sync>;

/// Module-specific start/stop logic.
pub trait ModuleActivator: Send + Sync {
    fn activate(&self, module: &ModuleId) -> Result<(), ActivationError>;

    fn deactivate(&self, module: &ModuleId) -> Result<(), ActivationError>;
}

/// Activator for modules that carry no code of their own.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopActivator;

impl ModuleActivator for NoopActivator {
    fn activate(&self, _module: &ModuleId) -> Result<(), ActivationError> {
        Ok(())
    }

    fn deactivate(&self, _module: &ModuleId) -> Result<(), ActivationError> {
        Ok(())
    }
}

/// Lifecycle error types
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LifecycleError {
    #[error("Illegal transition of {module} from {from} to {to}")]
    IllegalTransition {
        module: ModuleId,
        from: ModuleState,
        to: ModuleState,
    },

    #[error("Module {0} cannot be disabled")]
    NotDisableable(ModuleId),

    #[error("Activation of {module} failed: {reason}")]
    ActivationFailed { module: ModuleId, reason: String },

    #[error("Deactivation of {module} failed: {reason}")]
    DeactivationFailed { module: ModuleId, reason: String },

    #[error("Framework is {0}; module work is not accepted")]
    FrameworkUnavailable(FrameworkState),

    #[error("Unknown module: {0}")]
    UnknownModule(ModuleId),

    #[error("Module {0} is already installed")]
    AlreadyInstalled(ModuleId),

    #[error("Failed to persist overrides: {0}")]
    Persistence(#[from] PersistenceError),
}

struct ModuleEntry {
    descriptor: ModuleDescriptor,
    state: ModuleState,
    failure: Option<String>,
    resolver: Option<Arc<dyn Resolver>>,
}

/// Supervisor of all loaded modules.
pub struct ModuleLifecycleManager {
    tracker: Arc<FrameworkStateTracker>,
    activator: Arc<dyn ModuleActivator>,
    sink: Arc<dyn EventSink>,
    store: Arc<dyn OverridesStore>,
    overrides: RwLock<PersistentState>,
    // Serializes read-modify-save of the overrides; readers use `overrides`.
    persist_lock: Mutex<()>,
    modules: RwLock<HashMap<ModuleId, ModuleEntry>>,
}

impl ModuleLifecycleManager {
    /// Create a manager, restoring the persisted overrides from `store`.
    pub fn new(
        tracker: Arc<FrameworkStateTracker>,
        activator: Arc<dyn ModuleActivator>,
        sink: Arc<dyn EventSink>,
        store: Arc<dyn OverridesStore>,
    ) -> Result<Self, LifecycleError> {
        let overrides = store.load()?;
        debug!(
            overrides = overrides.overrides().count(),
            markers = overrides.restart_markers().count(),
            "restored enablement overrides"
        );
        Ok(Self {
            tracker,
            activator,
            sink,
            store,
            overrides: RwLock::new(overrides),
            persist_lock: Mutex::new(()),
            modules: RwLock::new(HashMap::new()),
        })
    }

    fn ensure_accepts_work(&self) -> Result<(), LifecycleError> {
        let state = self.tracker.current();
        if state.accepts_module_work() {
            Ok(())
        } else {
            Err(LifecycleError::FrameworkUnavailable(state))
        }
    }

    /// Add a module in the `Installed` state.
    pub fn install(&self, descriptor: ModuleDescriptor) -> Result<(), LifecycleError> {
        self.install_with_resolver(descriptor, None)
    }

    /// Add a module whose activation runs with `resolver` as the current resolver.
    pub fn install_with_resolver(
        &self,
        descriptor: ModuleDescriptor,
        resolver: Option<Arc<dyn Resolver>>,
    ) -> Result<(), LifecycleError> {
        self.ensure_accepts_work()?;
        let id = descriptor.id.clone();
        {
            let mut modules = self.modules.write();
            if modules.contains_key(&id) {
                return Err(LifecycleError::AlreadyInstalled(id));
            }
            modules.insert(
                id.clone(),
                ModuleEntry {
                    descriptor,
                    state: ModuleState::Installed,
                    failure: None,
                    resolver,
                },
            );
        }
        info!(module = %id, "module installed");
        self.sink.broadcast(&LifecycleEvent::ModuleInstalled { module: id });
        Ok(())
    }

    /// Enable `id`. Enabling an enabled module does nothing.
    pub fn enable(&self, id: &ModuleId) -> Result<(), LifecycleError> {
        self.ensure_accepts_work()?;
        let (descriptor, resolver) = {
            let modules = self.modules.read();
            let entry = modules.get(id).ok_or_else(|| LifecycleError::UnknownModule(id.clone()))?;
            if entry.state == ModuleState::Enabled {
                debug!(module = %id, "already enabled");
                return Ok(());
            }
            (entry.descriptor.clone(), entry.resolver.clone())
        };

        self.transition(id, ModuleState::Enabling)?;

        if let Err(e) = self.in_scope(resolver.clone(), || self.activator.activate(id)) {
            let reason = e.to_string();
            self.record_failure(id, &reason);
            return Err(LifecycleError::ActivationFailed {
                module: id.clone(),
                reason,
            });
        }

        // The override is durable before the module is reported enabled.
        if let Err(e) = self.update_overrides(|b| b.set_enabled(&descriptor, true)) {
            if let Err(de) = self.in_scope(resolver, || self.activator.deactivate(id)) {
                warn!(module = %id, error = %de, "rollback deactivation failed");
            }
            self.record_failure(id, &e.to_string());
            return Err(e);
        }

        self.transition(id, ModuleState::Enabled)?;
        info!(module = %id, "module enabled");
        self.sink.broadcast(&LifecycleEvent::ModuleEnabled { module: id.clone() });
        Ok(())
    }

    /// Disable `id`. A module that was never enabled goes straight to
    /// `Disabled` without deactivation.
    pub fn disable(&self, id: &ModuleId) -> Result<(), LifecycleError> {
        let (descriptor, state, resolver) = {
            let modules = self.modules.read();
            let entry = modules.get(id).ok_or_else(|| LifecycleError::UnknownModule(id.clone()))?;
            (entry.descriptor.clone(), entry.state, entry.resolver.clone())
        };

        if !descriptor.disableable {
            return Err(LifecycleError::NotDisableable(id.clone()));
        }

        match state {
            ModuleState::Disabled => {
                debug!(module = %id, "already disabled");
                return Ok(());
            }
            ModuleState::Installed => {
                // Nothing ran yet, so a failed save leaves the module Installed.
                self.update_overrides(|b| b.set_enabled(&descriptor, false))?;
                self.transition(id, ModuleState::Disabled)?;
            }
            _ => {
                self.transition(id, ModuleState::Disabling)?;
                if let Err(e) = self.in_scope(resolver, || self.activator.deactivate(id)) {
                    let reason = e.to_string();
                    self.record_failure(id, &reason);
                    return Err(LifecycleError::DeactivationFailed {
                        module: id.clone(),
                        reason,
                    });
                }
                // Deactivated but not durably disabled: report it as failed.
                if let Err(e) = self.update_overrides(|b| b.set_enabled(&descriptor, false)) {
                    self.record_failure(id, &e.to_string());
                    return Err(e);
                }
                self.transition(id, ModuleState::Disabled)?;
            }
        }

        info!(module = %id, "module disabled");
        self.sink.broadcast(&LifecycleEvent::ModuleDisabled { module: id.clone() });
        Ok(())
    }

    /// Remove `id` for good: its override and restart marker are forgotten
    /// once no other version of the key is loaded.
    pub fn uninstall(&self, id: &ModuleId) -> Result<(), LifecycleError> {
        self.remove(id, true)
    }

    /// Remove `id` from the table while keeping its persisted state, as on
    /// shutdown, warm restart or replacement by a newer artifact.
    pub fn unload(&self, id: &ModuleId) -> Result<(), LifecycleError> {
        self.remove(id, false)
    }

    fn remove(&self, id: &ModuleId, forget: bool) -> Result<(), LifecycleError> {
        let (state, resolver) = {
            let modules = self.modules.read();
            let entry = modules.get(id).ok_or_else(|| LifecycleError::UnknownModule(id.clone()))?;
            (entry.state, entry.resolver.clone())
        };

        if state == ModuleState::Enabled
            && let Err(e) = self.in_scope(resolver, || self.activator.deactivate(id))
        {
            warn!(module = %id, error = %e, "deactivation before removal failed");
        }

        self.transition(id, ModuleState::Uninstalled)?;
        let key_still_loaded = {
            let mut modules = self.modules.write();
            modules.remove(id);
            modules.keys().any(|other| other.key == id.key)
        };

        if forget && !key_still_loaded {
            self.update_overrides(|b| b.remove_state(&id.key))?;
        }

        info!(module = %id, forget, "module uninstalled");
        self.sink.broadcast(&LifecycleEvent::ModuleUninstalled { module: id.clone() });
        Ok(())
    }

    fn transition(&self, id: &ModuleId, to: ModuleState) -> Result<ModuleState, LifecycleError> {
        let mut modules = self.modules.write();
        let entry = modules
            .get_mut(id)
            .ok_or_else(|| LifecycleError::UnknownModule(id.clone()))?;
        let from = entry.state;
        if !from.can_transition_to(to) {
            return Err(LifecycleError::IllegalTransition {
                module: id.clone(),
                from,
                to,
            });
        }
        entry.state = to;
        if to != ModuleState::Failed {
            entry.failure = None;
        }
        debug!(module = %id, %from, %to, "module transition");
        Ok(from)
    }

    fn record_failure(&self, id: &ModuleId, reason: &str) {
        if let Err(e) = self.transition(id, ModuleState::Failed) {
            error!(module = %id, error = %e, "cannot mark module failed");
        }
        if let Some(entry) = self.modules.write().get_mut(id) {
            entry.failure = Some(reason.to_string());
        }
        error!(module = %id, reason, "module failed");
        self.sink.broadcast(&LifecycleEvent::ModuleFailed {
            module: id.clone(),
            error: reason.to_string(),
        });
    }

    fn in_scope<R>(&self, resolver: Option<Arc<dyn Resolver>>, f: impl FnOnce() -> R) -> R {
        match resolver {
            Some(resolver) => with_resolver(resolver, f),
            None => f(),
        }
    }

    fn update_overrides(
        &self,
        f: impl FnOnce(PersistentStateBuilder) -> PersistentStateBuilder,
    ) -> Result<(), LifecycleError> {
        let _guard = self.persist_lock.lock();
        let current = self.overrides.read().clone();
        let next = f(PersistentStateBuilder::from_state(&current)).to_state();
        if next == current {
            return Ok(());
        }
        self.store.save(&next)?;
        *self.overrides.write() = next;
        Ok(())
    }

    /// Effective enablement: the override if any, else the coded default.
    pub fn is_enabled(&self, descriptor: &ModuleDescriptor) -> bool {
        self.overrides.read().is_enabled(descriptor)
    }

    pub fn restart_state(&self, key: &ModuleKey) -> RestartState {
        self.overrides.read().restart_state(key)
    }

    pub fn set_restart_state(&self, key: &ModuleKey, state: RestartState) -> Result<(), LifecycleError> {
        self.update_overrides(|b| b.set_restart_state(key, state))
    }

    pub fn clear_restart_states(&self) -> Result<(), LifecycleError> {
        self.update_overrides(PersistentStateBuilder::clear_restart_states)
    }

    /// Current persisted overrides.
    pub fn persistent_state(&self) -> PersistentState {
        self.overrides.read().clone()
    }

    pub fn state(&self, id: &ModuleId) -> Option<ModuleState> {
        self.modules.read().get(id).map(|e| e.state)
    }

    /// Cause of the last activation or deactivation failure of `id`.
    pub fn failure(&self, id: &ModuleId) -> Option<String> {
        self.modules.read().get(id).and_then(|e| e.failure.clone())
    }

    pub fn descriptor(&self, id: &ModuleId) -> Option<ModuleDescriptor> {
        self.modules.read().get(id).map(|e| e.descriptor.clone())
    }

    pub fn resolver(&self, id: &ModuleId) -> Option<Arc<dyn Resolver>> {
        self.modules.read().get(id).and_then(|e| e.resolver.clone())
    }

    /// Loaded modules, sorted.
    pub fn modules(&self) -> Vec<ModuleId> {
        let mut ids: Vec<ModuleId> = self.modules.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Loaded versions of `key`, sorted.
    pub fn modules_for_key(&self, key: &ModuleKey) -> Vec<ModuleId> {
        let mut ids: Vec<ModuleId> = self
            .modules
            .read()
            .keys()
            .filter(|id| &id.key == key)
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}
