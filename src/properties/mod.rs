//! Typed device, app and user facts exposed to conditions.
use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use derive_more::From;
use serde::{Deserialize, Serialize};

use crate::{history::HistoryStore, Result};

pub mod catalog;
mod registry;

pub use registry::PropertyRegistry;

/// Value of a property.
#[derive(Debug, Clone, PartialEq, From, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    /// Boolean property.
    Bool(bool),
    /// Integer property.
    Int(i64),
    /// Floating point property.
    Float(f64),
    /// String property.
    String(String),
    /// Point in time.
    Timestamp(DateTime<Utc>),
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl PropertyValue {
    /// Kind of this value.
    pub fn kind(&self) -> PropertyKind {
        match self {
            PropertyValue::Bool(_) => PropertyKind::Bool,
            PropertyValue::Int(_) => PropertyKind::Int,
            PropertyValue::Float(_) => PropertyKind::Float,
            PropertyValue::String(_) => PropertyKind::String,
            PropertyValue::Timestamp(_) => PropertyKind::Timestamp,
        }
    }
}

/// The type a property is declared with. A property keeps its kind for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyKind {
    #[allow(missing_docs)]
    String,
    #[allow(missing_docs)]
    Int,
    #[allow(missing_docs)]
    Float,
    #[allow(missing_docs)]
    Bool,
    #[allow(missing_docs)]
    Timestamp,
}

impl fmt::Display for PropertyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PropertyKind::String => "string",
            PropertyKind::Int => "int",
            PropertyKind::Float => "float",
            PropertyKind::Bool => "bool",
            PropertyKind::Timestamp => "timestamp",
        })
    }
}

type DynamicRead = Arc<dyn Fn() -> Option<PropertyValue> + Send + Sync>;
type HistoryRead = Arc<dyn Fn(&HistoryStore) -> Result<Option<PropertyValue>> + Send + Sync>;

/// Where a property's value comes from.
#[derive(Clone)]
pub enum PropertyProvider {
    /// Fixed value, set once.
    Static(PropertyValue),
    /// Host callback, called on every read. `None` means the value is currently unavailable.
    Dynamic {
        /// Declared kind of the values the callback returns.
        kind: PropertyKind,
        /// The callback.
        read: DynamicRead,
    },
    /// Value computed from the event and property history.
    History {
        /// Declared kind of the computed value.
        kind: PropertyKind,
        /// The computation.
        read: HistoryRead,
    },
}

impl PropertyProvider {
    /// Provider backed by a host callback.
    pub fn dynamic(
        kind: PropertyKind,
        read: impl Fn() -> Option<PropertyValue> + Send + Sync + 'static,
    ) -> Self {
        PropertyProvider::Dynamic {
            kind,
            read: Arc::new(read),
        }
    }

    /// Provider computed from the history store.
    pub fn history(
        kind: PropertyKind,
        read: impl Fn(&HistoryStore) -> Result<Option<PropertyValue>> + Send + Sync + 'static,
    ) -> Self {
        PropertyProvider::History {
            kind,
            read: Arc::new(read),
        }
    }

    /// Declared kind of this provider.
    pub fn kind(&self) -> PropertyKind {
        match self {
            PropertyProvider::Static(value) => value.kind(),
            PropertyProvider::Dynamic { kind, .. } | PropertyProvider::History { kind, .. } => {
                *kind
            }
        }
    }

    /// Whether this provider holds a fixed value.
    pub fn is_static(&self) -> bool {
        matches!(self, PropertyProvider::Static(_))
    }
}

impl fmt::Debug for PropertyProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyProvider::Static(value) => f.debug_tuple("Static").field(value).finish(),
            PropertyProvider::Dynamic { kind, .. } => {
                f.debug_struct("Dynamic").field("kind", kind).finish()
            }
            PropertyProvider::History { kind, .. } => {
                f.debug_struct("History").field("kind", kind).finish()
            }
        }
    }
}
