//! Signed config files: the container format, the config model and the local cache.
use thiserror::Error;

mod actions;
mod cache;
mod container;
mod primary;

pub use actions::{Action, ActionContainer, ConditionalAction, Trigger};
pub use cache::{CacheConfig, ConfigCache};
pub use container::{decode_container, encode_container, CONTAINER_VERSION};
pub use primary::PrimaryConfig;

/// Problems with a config file. Messages are meant to be shown to the config author.
#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum ConfigError {
    /// No `CM` head block.
    #[error("Config file not signed: no valid CM block found in config file")]
    NotSigned,
    /// No `CONFIG` block.
    #[error("No CONFIG block found in config file")]
    MissingConfigBlock,
    /// The container was written by an incompatible release.
    #[error("Unsupported container version: {0}")]
    UnsupportedContainerVersion(String),
    /// The `CONFIG` block has no `Signature` header.
    #[error("Missing Config Signature. Please sign your config at https://criticalmoments.io")]
    MissingSignature,
    /// The signature does not match the body bytes.
    #[error("Configuration file invalid. The signature does not match the JSON body. Please re-sign your config at https://criticalmoments.io")]
    InvalidSignature,
    /// The body is not valid JSON, or has the wrong shape.
    #[error("Unable to parse config -- invalid json: {0}")]
    Json(String),
    /// The config parsed but its content is inconsistent.
    #[error("{0}")]
    Invalid(String),
    /// The config was written for a different app.
    #[error("this config file isn't valid for this app. Config file is for app id '{config_app_id}', but this app has bundle ID '{bundle_id}'")]
    AppIdMismatch {
        /// `appId` in the config.
        config_app_id: String,
        /// Bundle id of the running app.
        bundle_id: String,
    },
    /// The app is older than the config's `minAppVersion`.
    #[error("this version of the App ({version}) is too old for this config file. The minimum version is {minimum}")]
    AppTooOld {
        /// Running app version.
        version: String,
        /// Minimum version from the config.
        minimum: String,
    },
    /// This library is older than the config's `minCMVersion` or `minCMVersionInternal`.
    #[error("this version of the CM SDK ({version}) is too old for this config file. The minimum version is {minimum}")]
    LibraryTooOld {
        /// Running library version.
        version: String,
        /// Minimum version from the config.
        minimum: String,
    },
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        ConfigError::Json(err.to_string())
    }
}
