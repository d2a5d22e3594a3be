//! Persisted enable/disable overrides and restart markers.
//!
//! Only keys whose effective state differs from the module's coded default
//! are stored; an absent key means "use the default". A [`PersistentState`]
//! is immutable and freely shared between threads. Changes go through a
//! [`PersistentStateBuilder`], which is deliberately `!Sync` and meant to be
//! used from a single call stack before being frozen again with
//! [`PersistentStateBuilder::to_state`].

use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use super::{ModuleDescriptor, ModuleKey};
use crate::store::PersistenceError;

/// Key prefix of restart markers in the flat persisted form.
pub const RESTART_STATE_PREFIX: &str = ".restart.";

/// Change that takes effect for a module on the next restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestartState {
    #[default]
    None,
    Install,
    Upgrade,
    Remove,
}

impl RestartState {
    pub fn as_str(self) -> &'static str {
        match self {
            RestartState::None => "none",
            RestartState::Install => "install",
            RestartState::Upgrade => "upgrade",
            RestartState::Remove => "remove",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "none" => Some(RestartState::None),
            "install" => Some(RestartState::Install),
            "upgrade" => Some(RestartState::Upgrade),
            "remove" => Some(RestartState::Remove),
            _ => None,
        }
    }
}

impl fmt::Display for RestartState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable snapshot of the persisted overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    into = "BTreeMap<String, String>",
    try_from = "BTreeMap<String, String>"
)]
pub struct PersistentState {
    enabled: Arc<BTreeMap<ModuleKey, bool>>,
    restart: Arc<BTreeMap<ModuleKey, RestartState>>,
}

impl PersistentState {
    /// State with no overrides and no restart markers.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Effective enabled flag: the override if one exists, else the coded default.
    pub fn is_enabled(&self, descriptor: &ModuleDescriptor) -> bool {
        self.enabled_override(descriptor.key())
            .unwrap_or(descriptor.enabled_by_default)
    }

    /// Stored override for `key`, if any.
    pub fn enabled_override(&self, key: &ModuleKey) -> Option<bool> {
        self.enabled.get(key).copied()
    }

    pub fn restart_state(&self, key: &ModuleKey) -> RestartState {
        self.restart.get(key).copied().unwrap_or_default()
    }

    /// All enablement overrides, ordered by key.
    pub fn overrides(&self) -> impl Iterator<Item = (&ModuleKey, bool)> {
        self.enabled.iter().map(|(k, v)| (k, *v))
    }

    /// All pending restart markers, ordered by key.
    pub fn restart_markers(&self) -> impl Iterator<Item = (&ModuleKey, RestartState)> {
        self.restart.iter().map(|(k, v)| (k, *v))
    }

    pub fn is_empty(&self) -> bool {
        self.enabled.is_empty() && self.restart.is_empty()
    }

    /// Flat persisted form: bare keys hold enablement diffs, keys under
    /// [`RESTART_STATE_PREFIX`] hold restart markers.
    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        for (key, enabled) in self.enabled.iter() {
            map.insert(key.to_string(), enabled.to_string());
        }
        for (key, state) in self.restart.iter() {
            map.insert(format!("{RESTART_STATE_PREFIX}{key}"), state.as_str().to_string());
        }
        map
    }

    /// Parse the flat persisted form produced by [`PersistentState::to_map`].
    pub fn from_map(map: BTreeMap<String, String>) -> Result<Self, PersistenceError> {
        let mut enabled = BTreeMap::new();
        let mut restart = BTreeMap::new();

        for (raw_key, value) in map {
            if let Some(stripped) = raw_key.strip_prefix(RESTART_STATE_PREFIX) {
                let key = ModuleKey::new(stripped)
                    .map_err(|e| PersistenceError::Format(format!("{raw_key}: {e}")))?;
                let state = RestartState::parse(&value).ok_or_else(|| {
                    PersistenceError::Format(format!("{raw_key}: unknown restart marker '{value}'"))
                })?;
                if state != RestartState::None {
                    restart.insert(key, state);
                }
            } else {
                let key = ModuleKey::new(raw_key.as_str())
                    .map_err(|e| PersistenceError::Format(format!("{raw_key}: {e}")))?;
                let flag = value.parse::<bool>().map_err(|_| {
                    PersistenceError::Format(format!("{raw_key}: expected true/false, got '{value}'"))
                })?;
                enabled.insert(key, flag);
            }
        }

        Ok(Self {
            enabled: Arc::new(enabled),
            restart: Arc::new(restart),
        })
    }
}

impl From<PersistentState> for BTreeMap<String, String> {
    fn from(state: PersistentState) -> Self {
        state.to_map()
    }
}

impl TryFrom<BTreeMap<String, String>> for PersistentState {
    type Error = PersistenceError;

    fn try_from(map: BTreeMap<String, String>) -> Result<Self, Self::Error> {
        Self::from_map(map)
    }
}

/// Mutation scope for a [`PersistentState`].
///
/// Not `Sync`: a builder belongs to one call stack at a time.
#[derive(Debug, Default)]
pub struct PersistentStateBuilder {
    enabled: BTreeMap<ModuleKey, bool>,
    restart: BTreeMap<ModuleKey, RestartState>,
    _single_stack: PhantomData<Cell<()>>,
}

impl PersistentStateBuilder {
    /// Builder with no overrides.
    pub fn create() -> Self {
        Self::default()
    }

    /// Builder seeded with the contents of `state`.
    pub fn from_state(state: &PersistentState) -> Self {
        Self {
            enabled: (*state.enabled).clone(),
            restart: (*state.restart).clone(),
            _single_stack: PhantomData,
        }
    }

    /// Record the desired enabled flag; a value equal to the coded default
    /// removes the override.
    pub fn set_enabled(mut self, descriptor: &ModuleDescriptor, enabled: bool) -> Self {
        if enabled == descriptor.enabled_by_default {
            self.enabled.remove(descriptor.key());
        } else {
            self.enabled.insert(descriptor.key().clone(), enabled);
        }
        self
    }

    /// Set or clear (with [`RestartState::None`]) the restart marker of `key`.
    pub fn set_restart_state(mut self, key: &ModuleKey, state: RestartState) -> Self {
        if state == RestartState::None {
            self.restart.remove(key);
        } else {
            self.restart.insert(key.clone(), state);
        }
        self
    }

    pub fn clear_restart_states(mut self) -> Self {
        self.restart.clear();
        self
    }

    /// Forget everything stored for `key`.
    pub fn remove_state(mut self, key: &ModuleKey) -> Self {
        self.enabled.remove(key);
        self.restart.remove(key);
        self
    }

    pub fn to_state(self) -> PersistentState {
        PersistentState {
            enabled: Arc::new(self.enabled),
            restart: Arc::new(self.restart),
        }
    }
}
