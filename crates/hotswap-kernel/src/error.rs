//! Crate-level error types for `hotswap-kernel`.
//!
//! [`KernelError`] composes the typed errors of every sub-module so that `?`
//! converts them automatically; [`KernelResult`] wraps it in an
//! [`error_stack::Report`] for context-carrying propagation.
//!
//! ```rust,ignore
//! use error_stack::ResultExt;
//! use hotswap_kernel::error::{KernelError, KernelResult};
//!
//! fn restore(store: &dyn OverridesStore) -> KernelResult<PersistentState> {
//!     store
//!         .load()
//!         .map_err(KernelError::from)
//!         .map_err(error_stack::Report::new)
//!         .attach("loading enablement overrides")
//! }
//! ```

use thiserror::Error;

use crate::config::ConfigError;
use crate::framework::TransitionError;
use crate::module::KeyError;
use crate::store::PersistenceError;

/// Crate-level error type for `hotswap-kernel`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KernelError {
    #[error("Framework state error: {0}")]
    Transition(#[from] TransitionError),

    #[error("Invalid module key: {0}")]
    Key(#[from] KeyError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Internal(String),
}

/// Convenience result alias using [`error_stack::Report`].
pub type KernelResult<T> = Result<T, error_stack::Report<KernelError>>;
