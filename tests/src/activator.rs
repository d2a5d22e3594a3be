use hotswap_kernel::ModuleId;
use hotswap_plugins::{ActivationError, ModuleActivator, current_resolver};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// One recorded activator call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivatorCall {
    Activate(ModuleId),
    Deactivate(ModuleId),
}

/// A mock activator with scripted failures.
///
/// Records every call and, for activations, which units the current
/// resolver could see while it ran.
#[derive(Clone, Default)]
pub struct ScriptedActivator {
    failing_activation: Arc<Mutex<HashSet<ModuleId>>>,
    failing_deactivation: Arc<Mutex<HashSet<ModuleId>>>,
    /// Unit names probed through the current resolver on activation
    probes: Arc<Mutex<Vec<String>>>,
    /// `(module, probe, bytes)` seen during activation
    pub observed: Arc<Mutex<Vec<(ModuleId, String, Option<Vec<u8>>)>>>,
    /// Track all calls made to this activator
    pub call_history: Arc<Mutex<Vec<ActivatorCall>>>,
}

impl ScriptedActivator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make activation of `module` fail until [`Self::heal`] is called.
    pub fn fail_activation(&self, module: &ModuleId) {
        self.failing_activation.lock().insert(module.clone());
    }

    pub fn fail_deactivation(&self, module: &ModuleId) {
        self.failing_deactivation.lock().insert(module.clone());
    }

    /// Clear every scripted failure.
    pub fn heal(&self) {
        self.failing_activation.lock().clear();
        self.failing_deactivation.lock().clear();
    }

    /// Resolve `name` through the current resolver on each activation.
    pub fn probe(&self, name: impl Into<String>) {
        self.probes.lock().push(name.into());
    }

    pub fn history(&self) -> Vec<ActivatorCall> {
        self.call_history.lock().clone()
    }

    pub fn activation_count(&self, module: &ModuleId) -> usize {
        self.call_history
            .lock()
            .iter()
            .filter(|c| matches!(c, ActivatorCall::Activate(m) if m == module))
            .count()
    }

    /// Bytes the probe `name` resolved to while `module` activated last.
    pub fn observed_bytes(&self, module: &ModuleId, name: &str) -> Option<Vec<u8>> {
        self.observed
            .lock()
            .iter()
            .rev()
            .find(|(m, probe, _)| m == module && probe == name)
            .and_then(|(_, _, bytes)| bytes.clone())
    }
}

impl ModuleActivator for ScriptedActivator {
    fn activate(&self, module: &ModuleId) -> Result<(), ActivationError> {
        self.call_history.lock().push(ActivatorCall::Activate(module.clone()));

        if let Some(resolver) = current_resolver() {
            let probes = self.probes.lock().clone();
            let mut observed = self.observed.lock();
            for name in probes {
                let bytes = resolver.resolve(&name).ok().map(|u| u.bytes.to_vec());
                observed.push((module.clone(), name, bytes));
            }
        }

        if self.failing_activation.lock().contains(module) {
            return Err(format!("scripted activation failure for {module}").into());
        }
        Ok(())
    }

    fn deactivate(&self, module: &ModuleId) -> Result<(), ActivationError> {
        self.call_history.lock().push(ActivatorCall::Deactivate(module.clone()));
        if self.failing_deactivation.lock().contains(module) {
            return Err(format!("scripted deactivation failure for {module}").into());
        }
        Ok(())
    }
}

#[macro_export]
macro_rules! assert_activated {
    ($activator:expr, $module:expr, $expected_count:expr) => {
        let count = $activator.activation_count($module);
        assert_eq!(
            count, $expected_count,
            "Expected {} to be activated {} times, but it was activated {} times",
            $module, $expected_count, count
        );
    };
}
