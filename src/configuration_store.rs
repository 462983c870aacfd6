use std::sync::{Arc, PoisonError, RwLock};

use crate::{config::PrimaryConfig, Error, Result};

/// Holds the active [`PrimaryConfig`] of a client.
///
/// Readers get an `Arc` snapshot, so a trigger or notification plan that is running keeps
/// seeing the config it started with while a newer one is installed.
#[derive(Debug, Default)]
pub(crate) struct ConfigurationStore {
    active: RwLock<Option<Arc<PrimaryConfig>>>,
}

impl ConfigurationStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the active config, if one was installed.
    pub(crate) fn get_configuration(&self) -> Option<Arc<PrimaryConfig>> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Active config for operations that need one. Nothing is installed before the client
    /// starts.
    pub(crate) fn require(&self) -> Result<Arc<PrimaryConfig>> {
        self.get_configuration().ok_or(Error::NotStarted)
    }

    /// Install `config`, returning the config it replaces.
    pub(crate) fn set_configuration(&self, config: PrimaryConfig) -> Option<Arc<PrimaryConfig>> {
        let config = Arc::new(config);
        let previous = std::mem::replace(
            &mut *self.active.write().unwrap_or_else(PoisonError::into_inner),
            Some(config.clone()),
        );
        match &previous {
            Some(previous) => log::debug!(target: "critical_moments",
                app_id = config.app_id(),
                previous_version = previous.config_version(),
                config_version = config.config_version();
                "replaced active config"),
            None => log::debug!(target: "critical_moments",
                app_id = config.app_id(), config_version = config.config_version();
                "installed config"),
        }
        previous
    }
}
