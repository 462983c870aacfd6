//! Properties known to the library, with their kinds and how they are sampled into history.

use crate::{history::SampleType, properties::PropertyKind};

/// Prefix for app-specific properties set by the host.
pub const CUSTOM_PREFIX: &str = "custom_";

/// Names of the components registered for version-number properties, in order.
pub const VERSION_COMPONENTS: [&str; 7] = ["major", "minor", "patch", "mini", "micro", "nano", "smol"];

/// Who provides a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertySource {
    /// Provided by the library integration.
    Library,
    /// Provided by the app (well-known properties).
    Client,
}

/// How a property may be registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requirement {
    /// Must be registered before starting.
    Required,
    /// May be registered.
    Optional,
    /// Provided by the app when known; type-checked when present.
    WellKnown,
}

/// Declaration of a built-in property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertySchema {
    /// Declared kind.
    pub kind: PropertyKind,
    /// Who provides it.
    pub source: PropertySource,
    /// Whether it must be registered.
    pub requirement: Requirement,
    /// How values are recorded into property history.
    pub sample_type: SampleType,
    /// Version string, expanded into `_string` and numeric component properties.
    pub version: bool,
}

const fn schema(
    kind: PropertyKind,
    requirement: Requirement,
    sample_type: SampleType,
) -> PropertySchema {
    PropertySchema {
        kind,
        source: match requirement {
            Requirement::WellKnown => PropertySource::Client,
            _ => PropertySource::Library,
        },
        requirement,
        sample_type,
        version: false,
    }
}

const fn required(kind: PropertyKind) -> PropertySchema {
    schema(kind, Requirement::Required, SampleType::AppStart)
}

const fn optional(kind: PropertyKind) -> PropertySchema {
    schema(kind, Requirement::Optional, SampleType::AppStart)
}

const fn version(requirement: Requirement) -> PropertySchema {
    let mut schema = schema(PropertyKind::String, requirement, SampleType::AppStart);
    schema.version = true;
    schema
}

use PropertyKind::{Bool, Float, Int, String, Timestamp};

static CATALOG: &[(&str, PropertySchema)] = &[
    ("platform", required(String)),
    ("os_version", version(Requirement::Required)),
    ("device_manufacturer", required(String)),
    ("device_model", required(String)),
    ("device_model_class", required(String)),
    ("locale_language_code", required(String)),
    ("locale_country_code", required(String)),
    ("locale_currency_code", required(String)),
    ("app_version", version(Requirement::Required)),
    ("user_interface_idiom", required(String)),
    ("app_id", required(String)),
    ("screen_width_pixels", required(Int)),
    ("screen_height_pixels", required(Int)),
    ("screen_width_points", required(Int)),
    ("screen_height_points", required(Int)),
    ("screen_scale", required(Float)),
    ("device_battery_state", required(String)),
    ("device_battery_level", required(Float)),
    ("device_low_power_mode", required(Bool)),
    ("device_orientation", required(String)),
    ("interface_orientation", required(String)),
    ("dark_mode", required(Bool)),
    ("network_connection_type", required(String)),
    ("has_wifi_connection", required(Bool)),
    ("has_cell_connection", required(Bool)),
    ("has_active_network", required(Bool)),
    ("expensive_network", required(Bool)),
    ("cm_version", required(String)),
    ("foreground", required(Bool)),
    ("app_install_date", required(Timestamp)),
    ("timezone_gmt_offset", required(Int)),
    ("app_state", required(String)),
    ("has_watch", required(Bool)),
    ("screen_brightness", required(Float)),
    ("screen_captured", required(Bool)),
    // Audio
    ("other_audio_playing", required(Bool)),
    ("has_headphones", required(Bool)),
    ("has_bt_headphones", required(Bool)),
    ("has_bt_headset", required(Bool)),
    ("has_wired_headset", required(Bool)),
    ("has_car_audio", required(Bool)),
    ("on_call", required(Bool)),
    // Location
    ("location_permission", required(Bool)),
    ("location_permission_detailed", required(String)),
    ("location_latitude", required(Float)),
    ("location_longitude", required(Float)),
    ("location_city", required(String)),
    ("location_region", required(String)),
    ("location_country", required(String)),
    ("location_approx_city", required(String)),
    ("location_approx_region", required(String)),
    ("location_approx_country", required(String)),
    ("location_approx_latitude", required(Float)),
    ("location_approx_longitude", required(Float)),
    // Permissions
    ("notifications_permission", required(String)),
    ("microphone_permission", required(String)),
    ("camera_permission", required(String)),
    ("contacts_permission", required(String)),
    ("photo_library_permission", required(String)),
    ("add_photo_permission", required(String)),
    ("calendar_permission", required(String)),
    ("reminders_permission", required(String)),
    ("bluetooth_permission", required(String)),
    // Optional
    ("device_model_version", version(Requirement::Optional)),
    ("low_data_mode", optional(Bool)),
    // Set by the client itself when it starts
    (
        "app_start_time",
        schema(Timestamp, Requirement::Optional, SampleType::DoNotSample),
    ),
    (
        "session_start_time",
        schema(Timestamp, Requirement::Optional, SampleType::DoNotSample),
    ),
    // Well known, provided by the app
    (
        "user_signup_date",
        schema(Timestamp, Requirement::WellKnown, SampleType::OnCustomSet),
    ),
    (
        "user_signed_in",
        schema(Bool, Requirement::WellKnown, SampleType::OnCustomSet),
    ),
];

/// Schema of a built-in property.
pub fn schema_for(name: &str) -> Option<&'static PropertySchema> {
    CATALOG
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, schema)| schema)
}

/// All built-in properties.
pub fn all() -> impl Iterator<Item = (&'static str, &'static PropertySchema)> {
    CATALOG.iter().map(|(name, schema)| (*name, schema))
}

/// Splits `<prefix>_<suffix>` where `prefix` is a version property, returning the prefix and
/// the declared kind of the derived property.
fn version_derived(name: &str) -> Option<(&'static str, PropertyKind)> {
    let (prefix, suffix) = name.rsplit_once('_')?;
    let (prefix, _) = CATALOG
        .iter()
        .find(|(n, schema)| schema.version && *n == prefix)?;
    if suffix == "string" {
        Some((prefix, PropertyKind::String))
    } else if VERSION_COMPONENTS.contains(&suffix) {
        Some((prefix, PropertyKind::Int))
    } else {
        None
    }
}

/// Declared kind of any library-known property name, including version-derived names.
pub fn kind_of(name: &str) -> Option<PropertyKind> {
    schema_for(name)
        .map(|schema| schema.kind)
        .or_else(|| version_derived(name).map(|(_, kind)| kind))
}

/// Whether a condition may reference `name` under strict validation.
pub fn is_declared(name: &str) -> bool {
    kind_of(name).is_some() || is_custom(name)
}

/// Whether `name` is in the custom property namespace.
pub fn is_custom(name: &str) -> bool {
    name.strip_prefix(CUSTOM_PREFIX)
        .is_some_and(|rest| !rest.is_empty())
}

#[cfg(test)]
mod tests {
    use super::{is_declared, kind_of, schema_for, PropertySource, Requirement};
    use crate::{history::SampleType, properties::PropertyKind};

    #[test]
    fn looks_up_built_in_properties() {
        let schema = schema_for("platform").unwrap();
        assert_eq!(schema.kind, PropertyKind::String);
        assert_eq!(schema.requirement, Requirement::Required);
        assert_eq!(schema.sample_type, SampleType::AppStart);

        let schema = schema_for("user_signup_date").unwrap();
        assert_eq!(schema.kind, PropertyKind::Timestamp);
        assert_eq!(schema.source, PropertySource::Client);
        assert_eq!(schema.sample_type, SampleType::OnCustomSet);

        assert!(schema_for("nope").is_none());
    }

    #[test]
    fn version_properties_expand() {
        assert_eq!(kind_of("app_version"), Some(PropertyKind::String));
        assert_eq!(kind_of("app_version_string"), Some(PropertyKind::String));
        assert_eq!(kind_of("app_version_major"), Some(PropertyKind::Int));
        assert_eq!(kind_of("os_version_smol"), Some(PropertyKind::Int));
        assert_eq!(kind_of("device_model_version_patch"), Some(PropertyKind::Int));
        assert_eq!(kind_of("app_version_huge"), None);
        assert_eq!(kind_of("platform_string"), None);
    }

    #[test]
    fn custom_namespace() {
        assert!(is_declared("custom_paid"));
        assert!(!is_declared("custom_"));
        assert!(!is_declared("paid"));
    }
}
