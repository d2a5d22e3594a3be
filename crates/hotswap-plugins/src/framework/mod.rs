//! Plugin framework orchestration
//!
//! [`PluginFramework`] ties the pieces together: scanners discover
//! deployment units, each unit gets its own [`ModuleResolver`] chained to
//! the host resolver, the [`DescriptorProvider`] names it, and the
//! [`ModuleLifecycleManager`] installs and enables it. The framework state
//! tracker gates all of it.
//!
//! Per-unit failures while loading are logged and skipped so one broken
//! artifact never keeps the rest of the plugins from starting.

use error_stack::{Report, ResultExt};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use hotswap_kernel::{
    EventSink, FrameworkConfig, FrameworkSnapshot, FrameworkState, FrameworkStateTracker,
    LifecycleEvent, ModuleId, ModuleKey, NoopEventSink, OverridesStore, open_overrides_store,
};

use crate::bundle::conditionally_extract;
use crate::deployment::DeploymentUnit;
use crate::descriptor::{ArtifactNameDescriptors, DescriptorProvider};
use crate::error::{IntoPluginsReport, PluginsError, PluginsResult};
use crate::installer::{DirectoryInstaller, PluginArtifact};
use crate::lifecycle::{LifecycleError, ModuleActivator, ModuleLifecycleManager, NoopActivator};
use crate::resolver::{HostResolver, ModuleResolver, NestedArchiveLayout, Resolver};
use crate::scanner::{DirectoryScanner, ScanPoller, Scanner};

struct LoadedModule {
    id: ModuleId,
    resolver: Arc<ModuleResolver>,
}

/// Builder for [`PluginFramework`].
pub struct PluginFrameworkBuilder {
    config: FrameworkConfig,
    activator: Arc<dyn ModuleActivator>,
    sink: Arc<dyn EventSink>,
    store: Option<Arc<dyn OverridesStore>>,
    descriptors: Arc<dyn DescriptorProvider>,
    host: Arc<HostResolver>,
}

impl PluginFrameworkBuilder {
    pub fn activator(mut self, activator: Arc<dyn ModuleActivator>) -> Self {
        self.activator = activator;
        self
    }

    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Overrides store; defaults to the configured JSON file, or memory.
    pub fn overrides_store(mut self, store: Arc<dyn OverridesStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn descriptors(mut self, descriptors: Arc<dyn DescriptorProvider>) -> Self {
        self.descriptors = descriptors;
        self
    }

    pub fn host_resolver(mut self, host: Arc<HostResolver>) -> Self {
        self.host = host;
        self
    }

    pub fn build(self) -> PluginsResult<PluginFramework> {
        let config = self.config;
        config
            .validate()
            .into_report()
            .attach("validating framework configuration")?;

        let store = match self.store {
            Some(store) => store,
            None => open_overrides_store(&config).change_context(PluginsError::Setup)?,
        };

        let tracker = Arc::new(FrameworkStateTracker::new());
        let lifecycle = ModuleLifecycleManager::new(Arc::clone(&tracker), self.activator, Arc::clone(&self.sink), store)
            .into_report()
            .attach("restoring enablement overrides")?;

        let plugin_scanner: Arc<dyn Scanner> = Arc::new(DirectoryScanner::from_config(&config));
        let mut scanners = Vec::new();
        if config.bundled_archive.is_some() {
            scanners.push(Arc::new(DirectoryScanner::new(
                config.bundled_dir(),
                config.artifact_extensions.clone(),
            )) as Arc<dyn Scanner>);
        }
        scanners.push(Arc::clone(&plugin_scanner));

        Ok(PluginFramework {
            installer: DirectoryInstaller::from_config(&config),
            layout: NestedArchiveLayout::from_config(&config),
            config,
            tracker,
            lifecycle,
            plugin_scanner,
            scanners,
            descriptors: self.descriptors,
            host: self.host,
            sink: self.sink,
            loaded: Mutex::new(BTreeMap::new()),
        })
    }
}

/// Hot-swap plugin framework.
pub struct PluginFramework {
    config: FrameworkConfig,
    tracker: Arc<FrameworkStateTracker>,
    lifecycle: ModuleLifecycleManager,
    plugin_scanner: Arc<dyn Scanner>,
    // bundled directory first, so installed artifacts load last
    scanners: Vec<Arc<dyn Scanner>>,
    installer: DirectoryInstaller,
    descriptors: Arc<dyn DescriptorProvider>,
    host: Arc<HostResolver>,
    sink: Arc<dyn EventSink>,
    layout: NestedArchiveLayout,
    loaded: Mutex<BTreeMap<PathBuf, LoadedModule>>,
}

impl PluginFramework {
    pub fn builder(config: FrameworkConfig) -> PluginFrameworkBuilder {
        PluginFrameworkBuilder {
            config,
            activator: Arc::new(NoopActivator),
            sink: Arc::new(NoopEventSink),
            store: None,
            descriptors: Arc::new(ArtifactNameDescriptors::new()),
            host: Arc::new(HostResolver::new()),
        }
    }

    pub fn config(&self) -> &FrameworkConfig {
        &self.config
    }

    pub fn state(&self) -> FrameworkState {
        self.tracker.current()
    }

    pub fn tracker(&self) -> &Arc<FrameworkStateTracker> {
        &self.tracker
    }

    pub fn lifecycle(&self) -> &ModuleLifecycleManager {
        &self.lifecycle
    }

    pub fn installer(&self) -> &DirectoryInstaller {
        &self.installer
    }

    pub fn host_resolver(&self) -> &Arc<HostResolver> {
        &self.host
    }

    pub fn snapshot(&self) -> FrameworkSnapshot {
        FrameworkSnapshot {
            state: self.tracker.current(),
            modules: self.lifecycle.modules(),
        }
    }

    /// Start the framework and load every artifact present.
    pub fn start(&self) -> PluginsResult<()> {
        let previous = self
            .tracker
            .transition_to(FrameworkState::Starting)
            .into_report()
            .attach("starting plugin framework")?;
        info!(from = %previous, plugin_dir = %self.config.plugin_dir.display(), "starting plugin framework");

        if let Some(archive) = &self.config.bundled_archive {
            match conditionally_extract(archive, &self.config.bundled_dir()) {
                Ok(true) => info!(archive = %archive.display(), "unpacked bundled modules"),
                Ok(false) => {}
                Err(e) => error!(archive = %archive.display(), error = %e, "cannot unpack bundled modules"),
            }
        }

        // Pending restart work is applied by this start.
        if let Err(e) = self.lifecycle.clear_restart_states() {
            warn!(error = %e, "failed to clear restart markers");
        }

        let loaded = self.load_all();
        self.finish_transition(FrameworkState::Started)?;
        info!(modules = loaded, "plugin framework started");
        self.sink.broadcast(&LifecycleEvent::FrameworkStarted(self.snapshot()));
        Ok(())
    }

    /// Scan for new or changed artifacts and load them. Modules whose
    /// artifact disappeared are unloaded.
    pub fn scan_for_new_modules(&self) -> PluginsResult<usize> {
        self.ensure_accepts_work()?;
        let mut units = Vec::new();
        for scanner in &self.scanners {
            units.extend(scanner.scan().into_report().attach("scanning for new modules")?);
        }
        Ok(self.apply_units(units))
    }

    /// Install `artifact` for `key` through the backup/revert installer and
    /// pick it up immediately.
    pub fn install_plugin(&self, key: &ModuleKey, artifact: &dyn PluginArtifact) -> PluginsResult<PathBuf> {
        self.ensure_accepts_work()?;
        let path = self
            .installer
            .install_plugin(key, artifact)
            .into_report()
            .attach(format!("installing plugin {key}"))?;
        self.scan_for_new_modules()?;
        Ok(path)
    }

    /// Revert every install of `key` since the first one and rescan.
    pub fn revert_plugin(&self, key: &ModuleKey) -> PluginsResult<bool> {
        let reverted = self
            .installer
            .revert_installed_plugin(key)
            .into_report()
            .attach(format!("reverting plugin {key}"))?;
        if reverted && self.tracker.accepts_module_work() {
            self.scan_for_new_modules()?;
        }
        Ok(reverted)
    }

    /// Forget all backups once the current deployment is trusted.
    pub fn clear_backups(&self) -> PluginsResult<()> {
        self.installer
            .clear_backups()
            .into_report()
            .attach("clearing plugin backups")
    }

    /// Unload and reload every module without stopping the framework.
    pub fn warm_restart(&self) -> PluginsResult<()> {
        self.tracker
            .transition_to(FrameworkState::WarmRestarting)
            .into_report()
            .attach("warm restarting plugin framework")?;
        info!("warm restart");

        self.unload_all();
        if let Err(e) = self.lifecycle.clear_restart_states() {
            warn!(error = %e, "failed to clear restart markers");
        }
        let loaded = self.load_all();

        self.finish_transition(FrameworkState::Started)?;
        info!(modules = loaded, "warm restart complete");
        self.sink
            .broadcast(&LifecycleEvent::FrameworkWarmRestarted(self.snapshot()));
        Ok(())
    }

    /// Unload every module and stop.
    pub fn shutdown(&self) -> PluginsResult<()> {
        self.tracker
            .transition_to(FrameworkState::ShuttingDown)
            .into_report()
            .attach("shutting down plugin framework")?;
        info!("shutting down plugin framework");

        self.unload_all();
        self.finish_transition(FrameworkState::Shutdown)?;
        self.sink.broadcast(&LifecycleEvent::FrameworkShutdown(self.snapshot()));
        info!("plugin framework shut down");
        Ok(())
    }

    /// Live resolver of the newest loaded version of `key`.
    pub fn resolver(&self, key: &ModuleKey) -> Option<Arc<ModuleResolver>> {
        let loaded = self.loaded.lock();
        loaded
            .values()
            .filter(|m| &m.id.key == key)
            .max_by(|a, b| a.id.cmp(&b.id))
            .map(|m| Arc::clone(&m.resolver))
    }

    /// Module loaded from `artifact`, if any.
    pub fn module_at(&self, artifact: &Path) -> Option<ModuleId> {
        self.loaded.lock().get(artifact).map(|m| m.id.clone())
    }

    /// Poll the plugin directory in the background, loading what appears.
    ///
    /// Dropping or stopping the returned poller ends the loading task too.
    pub fn spawn_poller(self: &Arc<Self>) -> (ScanPoller, JoinHandle<()>) {
        let (poller, mut units_rx) = ScanPoller::spawn(Arc::clone(&self.plugin_scanner), self.config.scan_interval());
        let framework = Arc::clone(self);
        let loader = tokio::spawn(async move {
            while let Some(units) = units_rx.recv().await {
                if !framework.tracker.accepts_module_work() {
                    debug!(count = units.len(), "framework not running, ignoring polled units");
                    continue;
                }
                let fw = Arc::clone(&framework);
                if let Err(e) = tokio::task::spawn_blocking(move || fw.apply_units(units)).await {
                    error!(error = %e, "loading polled units panicked");
                }
            }
        });
        (poller, loader)
    }

    fn ensure_accepts_work(&self) -> PluginsResult<()> {
        let state = self.tracker.current();
        if state.accepts_module_work() {
            return Ok(());
        }
        Err(Report::new(PluginsError::from(LifecycleError::FrameworkUnavailable(state))))
    }

    fn finish_transition(&self, target: FrameworkState) -> PluginsResult<()> {
        self.tracker
            .transition_to(target)
            .into_report()
            .attach(format!("completing transition to {target}"))?;
        Ok(())
    }

    fn load_all(&self) -> usize {
        let mut units = Vec::new();
        for scanner in &self.scanners {
            scanner.reset();
            match scanner.scan() {
                Ok(found) => units.extend(found),
                Err(e) => error!(error = %e, "initial scan failed"),
            }
        }
        self.apply_units(units)
    }

    /// Bring the loaded set in line with the scanners: unload vanished
    /// artifacts, then load `units`. Returns how many modules were loaded.
    fn apply_units(&self, units: Vec<DeploymentUnit>) -> usize {
        let mut loaded = self.loaded.lock();

        let present: BTreeSet<PathBuf> = self
            .scanners
            .iter()
            .flat_map(|s| s.deployment_units())
            .map(|u| u.path().to_path_buf())
            .collect();
        let vanished: Vec<PathBuf> = loaded.keys().filter(|p| !present.contains(*p)).cloned().collect();
        for path in vanished {
            if let Some(module) = loaded.remove(&path) {
                info!(module = %module.id, artifact = %path.display(), "artifact removed, unloading module");
                self.unload(module);
            }
        }

        let mut count = 0;
        for unit in units {
            if let Some(previous) = loaded.remove(unit.path()) {
                info!(module = %previous.id, "artifact changed, replacing module");
                self.unload(previous);
            }
            match self.load(&unit) {
                Ok(module) => {
                    loaded.insert(unit.path().to_path_buf(), module);
                    count += 1;
                }
                Err(e) => error!(artifact = %unit.path().display(), error = ?e, "failed to load module"),
            }
        }
        count
    }

    fn load(&self, unit: &DeploymentUnit) -> PluginsResult<LoadedModule> {
        let delegate: Arc<dyn Resolver> = self.host.clone();
        let resolver = Arc::new(
            ModuleResolver::open(unit.path(), &self.layout, Some(delegate))
                .into_report()
                .attach(format!("opening {}", unit.path().display()))?,
        );

        let descriptor = self
            .descriptors
            .describe(unit, resolver.as_ref())
            .into_report()?;
        let id = descriptor.id.clone();

        let module_resolver: Arc<dyn Resolver> = resolver.clone();
        self.lifecycle
            .install_with_resolver(descriptor.clone(), Some(module_resolver))
            .into_report()
            .attach(format!("installing module {id}"))?;

        if self.lifecycle.is_enabled(&descriptor)
            && let Err(e) = self.lifecycle.enable(&id)
        {
            // The module stays loaded in its failed state for inspection.
            warn!(module = %id, error = %e, "module failed to enable");
        }

        debug!(module = %id, artifact = %unit.path().display(), "module loaded");
        Ok(LoadedModule { id, resolver })
    }

    fn unload(&self, module: LoadedModule) {
        if let Err(e) = self.lifecycle.unload(&module.id) {
            warn!(module = %module.id, error = %e, "failed to unload module");
        }
        module.resolver.close();
    }

    fn unload_all(&self) {
        let modules = std::mem::take(&mut *self.loaded.lock());
        // reverse load order
        for (_, module) in modules.into_iter().rev() {
            self.unload(module);
        }
    }
}
