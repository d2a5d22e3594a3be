//! Crate-level error types for `hotswap-plugins`.
//!
//! Every subsystem keeps its own typed error; [`PluginsError`] composes them
//! for the orchestration layer, whose operations return [`PluginsResult`] so
//! context can be attached on the way up.

use error_stack::Report;
use thiserror::Error;

use hotswap_kernel::config::ConfigError;
use hotswap_kernel::{PersistenceError, TransitionError};

use crate::bundle::BundleError;
use crate::descriptor::DescriptorError;
use crate::installer::InstallError;
use crate::lifecycle::LifecycleError;
use crate::resolver::ResolveError;
use crate::scanner::ScanError;

/// Crate-level error type for `hotswap-plugins`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PluginsError {
    #[error("Framework state error: {0}")]
    Transition(#[from] TransitionError),

    #[error("Resolve error: {0}")]
    Resolve(#[from] ResolveError),

    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    #[error("Install error: {0}")]
    Install(#[from] InstallError),

    #[error("Scan error: {0}")]
    Scan(#[from] ScanError),

    #[error("Bundle error: {0}")]
    Bundle(#[from] BundleError),

    #[error("Descriptor error: {0}")]
    Descriptor(#[from] DescriptorError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Framework assembly failed; the kernel report underneath has the cause
    #[error("Framework setup failed")]
    Setup,
}

/// Equivalent to `Result<T, error_stack::Report<PluginsError>>`.
pub type PluginsResult<T> = ::std::result::Result<T, Report<PluginsError>>;

/// Extension trait to convert a subsystem result into [`PluginsResult<T>`].
pub trait IntoPluginsReport<T> {
    /// Wrap the error in an `error_stack::Report`.
    fn into_report(self) -> PluginsResult<T>;
}

impl<T, E> IntoPluginsReport<T> for ::std::result::Result<T, E>
where
    E: Into<PluginsError>,
{
    #[inline]
    fn into_report(self) -> PluginsResult<T> {
        self.map_err(|e| Report::new(e.into()))
    }
}
