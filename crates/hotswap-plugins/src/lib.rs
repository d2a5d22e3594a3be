//! hotswap plugins
//!
//! Runtime side of the hot-swap framework:
//!
//! - [`resolver`]: child-first unit resolution over module artifacts and
//!   their nested archives, chained to a host resolver
//! - [`scanner`]: change detection over a plugin directory, plus a tokio poller
//! - [`installer`]: copy-in installation with a pristine backup and revert
//! - [`lifecycle`]: per-module state machine and persisted enablement
//! - [`framework`]: the orchestrator tying them together
//!
//! ```rust,ignore
//! use hotswap_kernel::FrameworkConfig;
//! use hotswap_plugins::PluginFramework;
//!
//! let framework = PluginFramework::builder(FrameworkConfig::new("plugins")).build()?;
//! framework.start()?;
//! let loaded = framework.scan_for_new_modules()?;
//! framework.shutdown()?;
//! ```

pub mod bundle;
pub mod deployment;
pub mod descriptor;
pub mod error;
pub mod framework;
pub mod installer;
pub mod lifecycle;
pub mod resolver;
pub mod scanner;

#[cfg(test)]
pub(crate) mod testing;

pub use bundle::{BundleError, conditionally_extract};
pub use deployment::DeploymentUnit;
pub use descriptor::{ArtifactNameDescriptors, DescriptorError, DescriptorProvider};
pub use error::{IntoPluginsReport, PluginsError, PluginsResult};
pub use framework::{PluginFramework, PluginFrameworkBuilder};
pub use installer::{
    BackupRecord, BytesArtifact, DirectoryInstaller, FileArtifact, InstallError, PluginArtifact,
};
pub use lifecycle::{
    ActivationError, LifecycleError, ModuleActivator, ModuleLifecycleManager, NoopActivator,
};
pub use resolver::{
    ArchiveEntryMap, EntryLocation, EntryReadError, HostResolver, ModuleResolver,
    NestedArchiveLayout, ResolveError, Resolver, Unit, current_resolver, scope_resolver,
    with_resolver,
};
pub use scanner::{DirectoryScanner, ScanError, ScanPoller, Scanner};
