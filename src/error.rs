use std::sync::Arc;

use crate::{conditions::ConditionError, config::ConfigError, properties::PropertyKind};

/// Result type used throughout the crate.
///
/// Alias of the standard `Result` with the crate's [`Error`] as the error variant.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the Critical Moments core.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// A condition failed to parse, validate or evaluate.
    #[error(transparent)]
    Condition(#[from] ConditionError),

    /// The config file is malformed, unsigned or not meant for this app.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A property was registered or queried with a type other than its declared one.
    #[error("property \"{key}\" has the wrong type, expected {expected}")]
    TypeMismatch {
        /// Property name.
        key: String,
        /// Declared kind of the property.
        expected: PropertyKind,
    },

    /// The property name is not usable.
    #[error("invalid property: {0}")]
    InvalidProperty(String),

    /// The event name is not usable in its namespace.
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    /// The history store was used before it was opened.
    #[error("history store not started")]
    StoreNotStarted,

    /// The API key failed to parse or its signature did not verify.
    #[error("invalid API key. Please make sure you get your key from criticalmoments.io")]
    InvalidApiKey,

    /// The API key is valid but was issued for a different app.
    #[error("this API key isn't valid for this app. API key is for {key_bundle_id}, but this app has bundle ID {bundle_id}")]
    ApiKeyBundleMismatch {
        /// Bundle id the key was issued for.
        key_bundle_id: String,
        /// Bundle id of the running app.
        bundle_id: String,
    },

    /// A signing key could not be parsed, or signing was attempted without a private key.
    #[error("invalid signing key: {0}")]
    InvalidKey(String),

    /// The config url is not a `https://` or `file://` url.
    #[error("config URL must start with https:// or file://")]
    InvalidConfigUrl,

    /// The config host answered with something other than 200 OK.
    #[error("failed to fetch config file: HTTP status {0}")]
    HttpStatus(u16),

    /// Nothing with this name exists in the active config.
    #[error("no {kind} found named '{name}'")]
    NotFound {
        /// What was looked up: "condition", "action" and so on.
        kind: &'static str,
        /// The name looked up.
        name: String,
    },

    /// A setting the client can't start without was not provided.
    #[error("a {0} must be provided before starting critical moments")]
    MissingSetting(&'static str),

    /// The registered properties are incomplete or of the wrong kinds.
    #[error("invalid properties: {}", .0.join("; "))]
    InvalidProperties(Vec<String>),

    /// The client was used before `start`.
    #[error("client not started")]
    NotStarted,

    /// `start` was called more than once.
    #[error("client already started. Start should only be called once")]
    AlreadyStarted,

    /// The host action dispatcher reported a failure.
    #[error("action \"{name}\" failed: {message}")]
    Action {
        /// Name of the action.
        name: String,
        /// Message from the dispatcher.
        message: String,
    },

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),

    /// Network error.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),

    /// Error from the embedded database.
    #[error(transparent)]
    Storage(Arc<rusqlite::Error>),
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(value: rusqlite::Error) -> Self {
        Error::Storage(Arc::new(value))
    }
}
