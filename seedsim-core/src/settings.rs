//! Settings injection.
//!
//! Components receive configuration through a [`SettingsProvider`] instead
//! of reading globals. Changes are whole-config replacements and only ever
//! published after validation.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::config::{ConfigurationError, SeedSimConfig};

/// A validated configuration replacing the previous one.
#[derive(Debug, Clone, PartialEq)]
pub struct SettingsChange {
    /// Increments with every accepted update
    pub revision: u64,
    pub config: SeedSimConfig,
}

/// Source of the active configuration.
pub trait SettingsProvider: Send + Sync {
    fn current(&self) -> SeedSimConfig;

    /// Receives every accepted change from now on.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<SettingsChange>;
}

struct SettingsState {
    config: SeedSimConfig,
    revision: u64,
    subscribers: Vec<mpsc::UnboundedSender<SettingsChange>>,
}

/// Process-local settings with an explicit subscriber list.
#[derive(Clone)]
pub struct InMemorySettings {
    state: Arc<Mutex<SettingsState>>,
}

impl InMemorySettings {
    /// # Errors
    ///
    /// - `ConfigurationError` - The initial configuration is invalid
    pub fn new(config: SeedSimConfig) -> Result<Self, ConfigurationError> {
        config.validate()?;
        Ok(Self {
            state: Arc::new(Mutex::new(SettingsState {
                config,
                revision: 0,
                subscribers: Vec::new(),
            })),
        })
    }

    /// Replaces the configuration and notifies subscribers.
    ///
    /// # Errors
    ///
    /// - `ConfigurationError` - Validation failed; the active config is kept
    pub fn update(&self, config: SeedSimConfig) -> Result<u64, ConfigurationError> {
        config.validate()?;

        let mut state = self.state.lock();
        state.revision += 1;
        state.config = config;
        let change = SettingsChange {
            revision: state.revision,
            config: state.config.clone(),
        };
        state
            .subscribers
            .retain(|subscriber| subscriber.send(change.clone()).is_ok());
        tracing::info!(
            "Settings revision {} applied ({} subscribers)",
            change.revision,
            state.subscribers.len()
        );
        Ok(change.revision)
    }

    /// Applies `edit` to a copy of the current configuration, then updates.
    ///
    /// # Errors
    ///
    /// - `ConfigurationError` - The edited configuration is invalid
    pub fn modify(&self, edit: impl FnOnce(&mut SeedSimConfig)) -> Result<u64, ConfigurationError> {
        let mut config = self.current();
        edit(&mut config);
        self.update(config)
    }

    pub fn revision(&self) -> u64 {
        self.state.lock().revision
    }
}

impl SettingsProvider for InMemorySettings {
    fn current(&self) -> SeedSimConfig {
        self.state.lock().config.clone()
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<SettingsChange> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.state.lock().subscribers.push(sender);
        receiver
    }
}
