//! Module identity, descriptors and the per-module state table.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub mod persistent;
pub use persistent::{PersistentState, PersistentStateBuilder, RestartState};

/// Prefix reserved for restart markers in the persisted overrides map.
pub const RESERVED_KEY_PREFIX: char = '.';

/// Invalid module key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum KeyError {
    #[error("Module key cannot be empty")]
    Empty,

    #[error("Module key '{0}' uses the reserved '.' prefix")]
    Reserved(String),
}

/// Unique key of a module, stable across versions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ModuleKey(String);

impl ModuleKey {
    pub fn new(key: impl Into<String>) -> Result<Self, KeyError> {
        let key = key.into();
        let trimmed = key.trim();
        if trimmed.is_empty() {
            return Err(KeyError::Empty);
        }
        if trimmed.starts_with(RESERVED_KEY_PREFIX) {
            return Err(KeyError::Reserved(trimmed.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ModuleKey {
    type Error = KeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ModuleKey> for String {
    fn from(key: ModuleKey) -> Self {
        key.0
    }
}

impl fmt::Display for ModuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one loaded module instance.
///
/// Two versions of the same key can coexist briefly while an upgrade is
/// being swapped in, so the version is part of the identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModuleId {
    pub key: ModuleKey,
    pub version: String,
}

impl ModuleId {
    pub fn new(key: ModuleKey, version: impl Into<String>) -> Self {
        Self {
            key,
            version: version.into(),
        }
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.key, self.version)
    }
}

/// What the descriptor collaborator tells the core about a module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    pub id: ModuleId,
    /// Coded default: enabled unless an override says otherwise
    pub enabled_by_default: bool,
    /// `false` for modules that must never be disabled
    pub disableable: bool,
}

impl ModuleDescriptor {
    pub fn new(id: ModuleId) -> Self {
        Self {
            id,
            enabled_by_default: true,
            disableable: true,
        }
    }

    pub fn with_enabled_by_default(mut self, enabled: bool) -> Self {
        self.enabled_by_default = enabled;
        self
    }

    pub fn with_disableable(mut self, disableable: bool) -> Self {
        self.disableable = disableable;
        self
    }

    pub fn key(&self) -> &ModuleKey {
        &self.id.key
    }
}

/// Per-module lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModuleState {
    Installed,
    Enabling,
    Enabled,
    Disabling,
    Disabled,
    /// Activation or deactivation failed; the cause is kept by the manager
    Failed,
    /// Terminal
    Uninstalled,
}

impl ModuleState {
    /// Whether `self -> target` is structurally legal.
    pub fn can_transition_to(self, target: ModuleState) -> bool {
        use ModuleState::*;
        if self == Uninstalled {
            return false;
        }
        if target == Uninstalled {
            return true;
        }
        matches!(
            (self, target),
            (Installed, Enabling)
                | (Installed, Disabled)
                | (Enabling, Enabled)
                | (Enabling, Failed)
                | (Enabled, Disabling)
                | (Disabling, Disabled)
                | (Disabling, Failed)
                | (Disabled, Enabling)
                | (Failed, Enabling)
        )
    }

    /// Transitional states that an operation is currently driving.
    pub fn is_transitional(self) -> bool {
        matches!(self, ModuleState::Enabling | ModuleState::Disabling)
    }
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
