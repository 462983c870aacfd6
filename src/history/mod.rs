//! Durable local history of events and sampled property values.
use crate::{Error, Result};

mod store;

pub use store::{HistoryStore, HistoryStoreConfig};

/// Namespace reserved for events sent by the library itself.
pub const BUILT_IN_NAMESPACE: &str = "io.criticalmoments.events.built_in.";
/// Namespace reserved for events the library knows about but the app sends.
pub const WELL_KNOWN_NAMESPACE: &str = "io.criticalmoments.events.well_known.";

/// Events sent by the library.
pub mod built_in {
    /// The client started.
    pub const APP_START: &str = "io.criticalmoments.events.built_in.app_start";
    /// The app came to the foreground.
    pub const APP_ENTERED_FOREGROUND: &str =
        "io.criticalmoments.events.built_in.app_entered_foreground";
    /// The app went to the background.
    pub const APP_ENTERED_BACKGROUND: &str =
        "io.criticalmoments.events.built_in.app_entered_background";
    /// A new session started.
    pub const SESSION_START: &str = "io.criticalmoments.events.built_in.session_start";

    pub(crate) const ALL: [&str; 4] = [
        APP_START,
        APP_ENTERED_FOREGROUND,
        APP_ENTERED_BACKGROUND,
        SESSION_START,
    ];
}

/// Events the library knows about, sent by the app.
pub mod well_known {
    /// The user signed in.
    pub const SIGNED_IN: &str = "io.criticalmoments.events.well_known.signed_in";

    pub(crate) const ALL: [&str; 1] = [SIGNED_IN];
}

/// Who may send an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventClassification {
    /// Sent only by the library.
    BuiltIn,
    /// Known to the library, sent by the app.
    WellKnown,
    /// Any other app event.
    Custom,
}

impl EventClassification {
    pub(crate) fn code(self) -> i64 {
        match self {
            EventClassification::BuiltIn => 1,
            EventClassification::WellKnown => 2,
            EventClassification::Custom => 3,
        }
    }
}

/// A named occurrence recorded in history. The store assigns the timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Event {
    name: String,
    classification: EventClassification,
}

impl Event {
    /// Built-in events can only be created inside the library.
    pub(crate) fn built_in(name: &str) -> Result<Event> {
        if !built_in::ALL.contains(&name) {
            return Err(Error::InvalidEvent(format!("Unknown built in event: {name}")));
        }
        Ok(Event {
            name: name.to_owned(),
            classification: EventClassification::BuiltIn,
        })
    }

    /// A well-known event such as [`well_known::SIGNED_IN`].
    pub fn well_known(name: &str) -> Result<Event> {
        if !well_known::ALL.contains(&name) {
            return Err(Error::InvalidEvent(format!("Unknown well known event: {name}")));
        }
        Ok(Event {
            name: name.to_owned(),
            classification: EventClassification::WellKnown,
        })
    }

    /// An app event. Names in the reserved namespaces are rejected.
    pub fn custom(name: &str) -> Result<Event> {
        if name.is_empty() {
            return Err(Error::InvalidEvent("event name is empty".to_owned()));
        }
        if name.starts_with(BUILT_IN_NAMESPACE) || name.starts_with(WELL_KNOWN_NAMESPACE) {
            return Err(Error::InvalidEvent(format!(
                "Attempted to log custom event matching built in or well known event: {name}"
            )));
        }
        Ok(Event {
            name: name.to_owned(),
            classification: EventClassification::Custom,
        })
    }

    /// An app event, classified as well-known when the name is in that namespace.
    pub fn from_app(name: &str) -> Result<Event> {
        if name.starts_with(WELL_KNOWN_NAMESPACE) {
            Event::well_known(name)
        } else {
            Event::custom(name)
        }
    }

    /// Event name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Event classification.
    pub fn classification(&self) -> EventClassification {
        self.classification
    }
}

/// When a property value is recorded into history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleType {
    /// Once when the client starts.
    AppStart,
    /// When a condition reads the property; rate limited per name.
    OnUse,
    /// When the app sets the property.
    OnCustomSet,
    /// Never recorded.
    DoNotSample,
}

impl SampleType {
    pub(crate) fn code(self) -> i64 {
        match self {
            SampleType::AppStart => 1,
            SampleType::OnUse => 2,
            SampleType::OnCustomSet => 3,
            SampleType::DoNotSample => 4,
        }
    }
}
