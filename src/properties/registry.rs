use std::{collections::HashMap, str::FromStr, sync::Arc};

use crate::{
    conditions::functions::version::Version,
    history::{HistoryStore, SampleType},
    properties::{
        catalog::{self, Requirement, CUSTOM_PREFIX, VERSION_COMPONENTS},
        PropertyKind, PropertyProvider, PropertyValue,
    },
    Error, Result,
};

/// Named, typed property providers.
///
/// Names must be built-in properties from the [catalog](crate::properties::catalog) or custom
/// properties (`custom_<name>`). The kind of a name never changes once registered.
#[derive(Debug, Default)]
pub struct PropertyRegistry {
    providers: HashMap<String, PropertyProvider>,
    history: Option<Arc<HistoryStore>>,
}

impl PropertyRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the history store used by history-derived providers.
    pub fn set_history_store(&mut self, history: Arc<HistoryStore>) {
        self.history = Some(history);
    }

    fn expected_kind(&self, name: &str) -> Option<PropertyKind> {
        catalog::kind_of(name).or_else(|| self.providers.get(name).map(PropertyProvider::kind))
    }

    /// Register a provider for `name`.
    ///
    /// Registering a static string for a version property (such as `app_version`) also
    /// registers `<name>_string` and the numeric components `<name>_major`, `<name>_minor`
    /// and so on.
    pub fn register(&mut self, name: &str, provider: PropertyProvider) -> Result<()> {
        if name.is_empty() {
            return Err(Error::InvalidProperty("property name is empty".to_owned()));
        }
        if catalog::kind_of(name).is_none() && !catalog::is_custom(name) {
            return Err(Error::InvalidProperty(format!(
                "\"{name}\" is not a known property. App specific properties must be set as custom properties"
            )));
        }
        if let Some(expected) = self.expected_kind(name) {
            if provider.kind() != expected {
                return Err(Error::TypeMismatch {
                    key: name.to_owned(),
                    expected,
                });
            }
        }

        let version_string = match (&provider, catalog::schema_for(name)) {
            (PropertyProvider::Static(PropertyValue::String(s)), Some(schema)) if schema.version => {
                Some(s.clone())
            }
            _ => None,
        };

        if self.providers.insert(name.to_owned(), provider).is_some() {
            log::debug!(target: "critical_moments", property = name; "re-registered property provider");
        }

        match version_string {
            Some(version) => self.register_version_components(name, &version),
            None => Ok(()),
        }
    }

    /// Register a fixed value.
    pub fn register_static(&mut self, name: &str, value: impl Into<PropertyValue>) -> Result<()> {
        self.register(name, PropertyProvider::Static(value.into()))
    }

    fn register_version_components(&mut self, name: &str, version: &str) -> Result<()> {
        // The raw string is kept even when it doesn't parse, so exact matches still work.
        self.providers.insert(
            format!("{name}_string"),
            PropertyProvider::Static(version.into()),
        );
        for component in VERSION_COMPONENTS {
            self.providers.remove(&format!("{name}_{component}"));
        }

        let parsed = Version::from_str(version).map_err(|_| {
            Error::InvalidProperty(format!("Invalid version number format: \"{version}\""))
        })?;
        for (component, value) in VERSION_COMPONENTS.iter().zip(parsed.components()) {
            self.providers.insert(
                format!("{name}_{component}"),
                PropertyProvider::Static(PropertyValue::Int(*value)),
            );
        }
        Ok(())
    }

    /// Set a property provided by the app. Well-known names (such as `user_signup_date`) keep
    /// their name; anything else is namespaced as `custom_<name>`. Returns the name the value
    /// is readable under from conditions.
    pub fn set_custom(&mut self, name: &str, value: impl Into<PropertyValue>) -> Result<String> {
        let valid_name = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid_name {
            return Err(Error::InvalidProperty(format!(
                "\"{name}\" is not a valid custom property name. Use letters, numbers and underscores"
            )));
        }

        let full_name = match catalog::schema_for(name) {
            Some(schema) if schema.requirement == Requirement::WellKnown => name.to_owned(),
            _ => format!("{CUSTOM_PREFIX}{name}"),
        };
        self.register(&full_name, PropertyProvider::Static(value.into()))?;
        Ok(full_name)
    }

    /// Set custom properties from a JSON object of string, number and bool values.
    ///
    /// All valid entries are set even when some fail; the first failure is returned.
    pub fn set_custom_from_json(&mut self, json: &[u8]) -> Result<Vec<String>> {
        let object: serde_json::Map<String, serde_json::Value> = serde_json::from_slice(json)
            .map_err(|err| Error::InvalidProperty(format!("invalid custom properties json: {err}")))?;

        let mut names = Vec::with_capacity(object.len());
        let mut first_error = None;
        for (name, value) in object {
            let value = match value {
                serde_json::Value::Bool(b) => PropertyValue::Bool(b),
                serde_json::Value::String(s) => PropertyValue::String(s),
                serde_json::Value::Number(n) => match n.as_i64() {
                    Some(i) => PropertyValue::Int(i),
                    None => PropertyValue::Float(n.as_f64().unwrap_or(f64::NAN)),
                },
                _ => {
                    first_error.get_or_insert(Error::InvalidProperty(format!(
                        "unsupported type for key: {name}"
                    )));
                    continue;
                }
            };
            match self.set_custom(&name, value) {
                Ok(full_name) => names.push(full_name),
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(names),
        }
    }

    /// Provider registered for `name`.
    pub fn provider(&self, name: &str) -> Option<&PropertyProvider> {
        self.providers.get(name)
    }

    /// Whether a provider is registered for `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    /// Current value of `name`. Dynamic and history-derived providers are evaluated on every
    /// call. `None` when not registered, currently unavailable, or when a provider returns a
    /// value of the wrong kind.
    pub fn value(&self, name: &str) -> Option<PropertyValue> {
        let provider = self.providers.get(name)?;
        let value = match provider {
            PropertyProvider::Static(value) => Some(value.clone()),
            PropertyProvider::Dynamic { read, .. } => read(),
            PropertyProvider::History { read, .. } => {
                let Some(history) = &self.history else {
                    log::debug!(target: "critical_moments", property = name;
                        "history-derived property read without a history store");
                    return None;
                };
                read(history)
                    .inspect_err(|err| {
                        log::warn!(target: "critical_moments", property = name;
                            "failed to compute property from history: {err}");
                    })
                    .ok()
                    .flatten()
            }
        }?;

        if value.kind() != provider.kind() {
            log::warn!(target: "critical_moments", property = name;
                "provider returned {} instead of {}", value.kind(), provider.kind());
            return None;
        }
        Some(value)
    }

    /// Declared kind of `name`, from the catalog or the registered provider.
    pub fn kind(&self, name: &str) -> Option<PropertyKind> {
        self.expected_kind(name)
    }

    /// How reads of `name` are recorded into property history.
    pub fn sample_type(&self, name: &str) -> SampleType {
        match catalog::schema_for(name) {
            Some(schema) => schema.sample_type,
            None if catalog::is_custom(name) => SampleType::OnCustomSet,
            None => SampleType::DoNotSample,
        }
    }

    /// Readable problems with the registered properties: missing required properties and
    /// providers of the wrong kind. Empty when everything is in order.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        for (name, schema) in catalog::all() {
            let provider = self.providers.get(name);
            match provider {
                None if schema.requirement == Requirement::Required => {
                    problems.push(format!("Missing required property: {name}"));
                }
                Some(provider) if provider.kind() != schema.kind => {
                    problems.push(format!(
                        "Property \"{name}\" of wrong kind. Expected {}",
                        schema.kind
                    ));
                }
                _ => {}
            }
        }
        problems
    }

    /// Values to record when the app starts: every registered property sampled at app start.
    pub fn startup_samples(&self) -> Vec<(String, PropertyValue)> {
        let mut samples: Vec<(String, PropertyValue)> = self
            .providers
            .keys()
            .filter(|name| self.sample_type(name) == SampleType::AppStart)
            .filter_map(|name| Some((name.clone(), self.value(name)?)))
            .collect();
        samples.sort_by(|a, b| a.0.cmp(&b.0));
        samples
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    };

    use chrono::{TimeZone, Utc};

    use super::PropertyRegistry;
    use crate::{
        history::SampleType,
        properties::{PropertyKind, PropertyProvider, PropertyValue},
        Error,
    };

    #[test]
    fn registers_static_properties() {
        let mut registry = PropertyRegistry::new();
        registry.register_static("platform", "ios").unwrap();
        registry.register_static("screen_width_pixels", 1170i64).unwrap();

        assert_eq!(registry.value("platform"), Some(PropertyValue::from("ios")));
        assert_eq!(
            registry.value("screen_width_pixels"),
            Some(PropertyValue::Int(1170))
        );
        assert_eq!(registry.value("dark_mode"), None);
    }

    #[test]
    fn rejects_mismatched_kinds() {
        let mut registry = PropertyRegistry::new();
        let err = registry.register_static("platform", 5i64).unwrap_err();
        assert!(matches!(
            err,
            Error::TypeMismatch { ref key, expected: PropertyKind::String } if key == "platform"
        ));
        assert_eq!(
            err.to_string(),
            "property \"platform\" has the wrong type, expected string"
        );

        assert!(matches!(
            registry.register_static("not_a_property", "x"),
            Err(Error::InvalidProperty(_))
        ));
    }

    #[test]
    fn dynamic_providers_are_read_every_time() {
        let counter = Arc::new(AtomicI64::new(0));
        let mut registry = PropertyRegistry::new();
        {
            let counter = counter.clone();
            registry
                .register(
                    "timezone_gmt_offset",
                    PropertyProvider::dynamic(PropertyKind::Int, move || {
                        Some(PropertyValue::Int(counter.fetch_add(1, Ordering::SeqCst)))
                    }),
                )
                .unwrap();
        }

        assert_eq!(registry.value("timezone_gmt_offset"), Some(PropertyValue::Int(0)));
        assert_eq!(registry.value("timezone_gmt_offset"), Some(PropertyValue::Int(1)));
    }

    #[test]
    fn dynamic_provider_with_wrong_kind_is_unavailable() {
        let mut registry = PropertyRegistry::new();
        registry
            .register(
                "device_battery_level",
                PropertyProvider::dynamic(PropertyKind::Float, || Some(PropertyValue::Int(1))),
            )
            .unwrap();
        assert_eq!(registry.value("device_battery_level"), None);
    }

    #[test]
    fn expands_version_numbers() {
        let mut registry = PropertyRegistry::new();
        registry.register_static("app_version", "2.3.1").unwrap();

        assert_eq!(registry.value("app_version"), Some(PropertyValue::from("2.3.1")));
        assert_eq!(
            registry.value("app_version_string"),
            Some(PropertyValue::from("2.3.1"))
        );
        assert_eq!(registry.value("app_version_major"), Some(PropertyValue::Int(2)));
        assert_eq!(registry.value("app_version_minor"), Some(PropertyValue::Int(3)));
        assert_eq!(registry.value("app_version_patch"), Some(PropertyValue::Int(1)));
        assert_eq!(registry.value("app_version_mini"), None);

        let err = registry.register_static("os_version", "beta").unwrap_err();
        assert!(matches!(err, Error::InvalidProperty(_)));
        assert_eq!(
            registry.value("os_version_string"),
            Some(PropertyValue::from("beta"))
        );
    }

    #[test]
    fn custom_properties_are_namespaced() {
        let mut registry = PropertyRegistry::new();
        assert_eq!(registry.set_custom("paid", true).unwrap(), "custom_paid");
        assert_eq!(registry.value("custom_paid"), Some(PropertyValue::Bool(true)));
        assert_eq!(registry.sample_type("custom_paid"), SampleType::OnCustomSet);

        // Kind is fixed after the first set.
        assert!(matches!(
            registry.set_custom("paid", "yes"),
            Err(Error::TypeMismatch { .. })
        ));
        assert!(registry.set_custom("has space", 1i64).is_err());

        let signup = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        assert_eq!(
            registry.set_custom("user_signup_date", signup).unwrap(),
            "user_signup_date"
        );
        assert_eq!(
            registry.value("user_signup_date"),
            Some(PropertyValue::Timestamp(signup))
        );
    }

    #[test]
    fn custom_properties_from_json() {
        let mut registry = PropertyRegistry::new();
        let mut names = registry
            .set_custom_from_json(br#"{"plan": "pro", "seats": 3, "ratio": 0.5, "trial": false}"#)
            .unwrap();
        names.sort();
        assert_eq!(
            names,
            ["custom_plan", "custom_ratio", "custom_seats", "custom_trial"]
        );
        assert_eq!(registry.value("custom_seats"), Some(PropertyValue::Int(3)));
        assert_eq!(registry.value("custom_ratio"), Some(PropertyValue::Float(0.5)));

        assert!(registry
            .set_custom_from_json(br#"{"nested": {"a": 1}, "ok": 1}"#)
            .is_err());
        assert_eq!(registry.value("custom_ok"), Some(PropertyValue::Int(1)));
    }

    #[test]
    fn validate_reports_missing_required() {
        let registry = PropertyRegistry::new();
        let problems = registry.validate();
        assert!(problems.contains(&"Missing required property: platform".to_owned()));
        assert!(!problems.iter().any(|p| p.contains("user_signup_date")));
    }

    #[test]
    fn history_provider_without_store_is_unavailable() {
        let mut registry = PropertyRegistry::new();
        registry
            .register(
                "session_start_time",
                PropertyProvider::history(PropertyKind::Timestamp, |_| Ok(None)),
            )
            .unwrap();
        assert_eq!(registry.value("session_start_time"), None);
    }

    #[test]
    fn startup_samples_cover_app_start_properties() {
        let mut registry = PropertyRegistry::new();
        registry.register_static("platform", "ios").unwrap();
        registry.register_static("app_start_time", Utc::now()).unwrap();
        registry.set_custom("paid", true).unwrap();

        let samples = registry.startup_samples();
        assert_eq!(
            samples,
            vec![("platform".to_owned(), PropertyValue::from("ios"))]
        );
    }
}
