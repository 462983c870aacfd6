//! Core of Critical Moments, a library for showing the right in-app message to the right user
//! at the right moment.
//!
//! # Overview
//!
//! The library revolves around a [`Client`] that loads a signed config file, records app events
//! and property samples into a local history, and runs the config's triggers, actions, named
//! conditions and notifications against typed properties of the device, the app and the user.
//!
//! Targeting is written as [conditions](crate::conditions), small boolean expressions such as
//! `platform == 'ios' && eventCount('checkout') >= 3`. An [`ActionDispatcher`] provided by the
//! host presents the resulting actions and schedules notifications.
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum.
//!
//! In production, it is recommended to ignore most errors, as a failed message should never
//! break the host app. However, the returned errors are valuable for debugging and usually
//! indicate that developer's attention is needed, for example a config with an invalid
//! condition or a property registered with the wrong type.
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging messages,
//! with target `critical_moments`. Consider integrating a `log`-compatible logger
//! implementation for better visibility into library operations.

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

mod action_dispatcher;
mod client;
mod client_config;
pub mod conditions;
pub mod config;
mod configuration_store;
mod error;
pub mod history;
pub mod notifications;
pub mod properties;
pub mod signing;

pub use action_dispatcher::ActionDispatcher;
pub use client::Client;
pub use client_config::ClientConfig;
pub use error::{Error, Result};

/// Version of this library, compared against the minimum versions a config may require.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
