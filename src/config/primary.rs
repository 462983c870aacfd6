use std::{
    cmp::Ordering,
    collections::{BTreeMap, BTreeSet},
};

use serde::Deserialize;
use serde_json::Value;

use crate::{
    conditions::{
        functions::version::{version_compare_expecting, Version},
        Condition, ConditionEngine,
    },
    config::{
        actions::ActionContainerJson, decode_container, Action, ActionContainer, ConfigError,
        Trigger,
    },
    notifications::{Notification, NotificationJson},
    signing::SignUtil,
};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThemesJson {
    #[serde(default)]
    default_theme_name: Option<String>,
    #[serde(default)]
    named_themes: BTreeMap<String, Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActionsJson {
    #[serde(default)]
    named_actions: BTreeMap<String, ActionContainerJson>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TriggersJson {
    #[serde(default)]
    named_triggers: BTreeMap<String, Trigger>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConditionsJson {
    #[serde(default)]
    named_conditions: BTreeMap<String, Condition>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PrimaryConfigJson {
    #[serde(default)]
    config_version: String,
    #[serde(default)]
    app_id: String,
    #[serde(default)]
    min_app_version: Option<String>,
    #[serde(default, rename = "minCMVersion")]
    min_library_version: Option<String>,
    #[serde(default, rename = "minCMVersionInternal")]
    min_library_version_internal: Option<String>,
    #[serde(default)]
    themes: Option<ThemesJson>,
    #[serde(default)]
    actions: Option<ActionsJson>,
    #[serde(default)]
    triggers: Option<TriggersJson>,
    #[serde(default)]
    conditions: Option<ConditionsJson>,
    #[serde(default)]
    notifications: Option<BTreeMap<String, NotificationJson>>,
}

/// The app's config: named actions, triggers, conditions, themes and notifications.
///
/// All conditions are prepared while parsing, so invalid ones have either failed the parse
/// (strict) or been degraded to always-false (lenient).
#[derive(Debug, Clone, PartialEq)]
pub struct PrimaryConfig {
    config_version: String,
    app_id: String,
    min_app_version: Option<String>,
    min_library_version: Option<String>,
    min_library_version_internal: Option<String>,
    default_theme_name: Option<String>,
    themes: BTreeMap<String, Value>,
    actions: BTreeMap<String, ActionContainer>,
    triggers: BTreeMap<String, Trigger>,
    conditions: BTreeMap<String, Condition>,
    notifications: BTreeMap<String, Notification>,
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.is_empty())
}

fn check_version_field(field: &str, value: &Option<String>) -> Result<(), ConfigError> {
    match value {
        Some(version) if version.parse::<Version>().is_err() => {
            Err(invalid(format!("Config had invalid {field}: {version}")))
        }
        _ => Ok(()),
    }
}

impl PrimaryConfig {
    /// Config with no content, used when an app runs without a config file.
    pub fn empty(app_id: &str) -> PrimaryConfig {
        PrimaryConfig {
            config_version: "v1".to_owned(),
            app_id: app_id.to_owned(),
            min_app_version: None,
            min_library_version: None,
            min_library_version_internal: None,
            default_theme_name: None,
            themes: BTreeMap::new(),
            actions: BTreeMap::new(),
            triggers: BTreeMap::new(),
            conditions: BTreeMap::new(),
            notifications: BTreeMap::new(),
        }
    }

    /// Verify and parse a signed container.
    pub fn decode(
        data: &[u8],
        verifier: &SignUtil,
        engine: &ConditionEngine,
    ) -> Result<PrimaryConfig, ConfigError> {
        let body = decode_container(data, verifier)?;
        PrimaryConfig::from_json(&body, engine)
    }

    /// Parse and validate config JSON. Problems are reported as user-presentable
    /// [`ConfigError`]s.
    pub fn from_json(json: &[u8], engine: &ConditionEngine) -> Result<PrimaryConfig, ConfigError> {
        let json: PrimaryConfigJson = serde_json::from_slice(json)?;

        if json.config_version != "v1" && !json.config_version.starts_with("v1.") {
            return Err(invalid("Config must have a config version of v1"));
        }
        if json.app_id.is_empty() {
            return Err(invalid("Config must have an appId"));
        }
        let min_app_version = non_empty(json.min_app_version);
        let min_library_version = non_empty(json.min_library_version);
        let min_library_version_internal = non_empty(json.min_library_version_internal);
        check_version_field("minAppVersion", &min_app_version)?;
        check_version_field("minCMVersion", &min_library_version)?;
        check_version_field("minCMVersionInternal", &min_library_version_internal)?;

        // Nested problems are reported after the cross-reference checks, so parse everything
        // first and keep the first failure.
        let mut nested_issue: Option<ConfigError> = None;

        let themes = json.themes.unwrap_or_default();
        let named_actions = json.actions.unwrap_or_default().named_actions;
        let action_names: BTreeSet<String> = named_actions.keys().cloned().collect();
        let mut actions = BTreeMap::new();
        for (name, action) in named_actions {
            match ActionContainer::from_json(action, engine) {
                Ok(action) => {
                    actions.insert(name, action);
                }
                Err(issue) => {
                    nested_issue.get_or_insert_with(|| {
                        invalid(format!("Action \"{name}\" had issue: {issue}"))
                    });
                }
            }
        }

        let mut triggers = json.triggers.unwrap_or_default().named_triggers;
        for (name, trigger) in &mut triggers {
            if let Err(issue) = trigger.prepare(engine) {
                nested_issue.get_or_insert_with(|| {
                    invalid(format!("Trigger \"{name}\" had issue: {issue}"))
                });
            }
        }

        let mut conditions = json.conditions.unwrap_or_default().named_conditions;
        for (name, condition) in &mut conditions {
            if let Err(issue) = condition.prepare(engine) {
                nested_issue.get_or_insert_with(|| {
                    invalid(format!("Condition \"{name}\" had issue: {issue}"))
                });
            }
        }

        let mut notifications = BTreeMap::new();
        for (id, notification) in json.notifications.unwrap_or_default() {
            match Notification::from_json(&id, notification, engine) {
                Ok(notification) => {
                    notifications.insert(id, notification);
                }
                Err(issue) => {
                    nested_issue.get_or_insert_with(|| {
                        invalid(format!("Notification \"{id}\" had issue: {issue}"))
                    });
                }
            }
        }

        let config = PrimaryConfig {
            config_version: json.config_version,
            app_id: json.app_id,
            min_app_version,
            min_library_version,
            min_library_version_internal,
            default_theme_name: non_empty(themes.default_theme_name),
            themes: themes.named_themes,
            actions,
            triggers,
            conditions,
            notifications,
        };
        config.check_references(&action_names)?;
        if action_names.contains("")
            || config.themes.contains_key("")
            || config.triggers.contains_key("")
        {
            return Err(invalid(
                "The empty string \"\" is not a valid name for actions/themes/triggers",
            ));
        }
        match nested_issue {
            Some(issue) => Err(issue),
            None => Ok(config),
        }
    }

    /// Every named action referenced by a trigger, another action or a notification exists.
    /// `action_names` includes actions that failed to parse.
    fn check_references(&self, action_names: &BTreeSet<String>) -> Result<(), ConfigError> {
        for (name, trigger) in &self.triggers {
            if !trigger.action_name.is_empty() && !action_names.contains(&trigger.action_name) {
                return Err(invalid(format!(
                    "Trigger \"{name}\" included named action \"{}\", which doesn't exist",
                    trigger.action_name
                )));
            }
        }
        for (source, container) in &self.actions {
            for name in container.action.embedded_action_names() {
                if !action_names.contains(name) {
                    return Err(invalid(format!(
                        "Action \"{source}\" specified named action \"{name}\", which doesn't exist"
                    )));
                }
            }
        }
        for (id, notification) in &self.notifications {
            if let Some(name) = &notification.tap_action_name {
                if !action_names.contains(name) {
                    return Err(invalid(format!(
                        "Notification '{id}' has action name '{name}', which does not exist"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Rejects configs that require a newer app or a newer version of this library.
    /// Versions that can't be parsed never count as too old.
    pub fn check_client_versions(
        &self,
        app_version: &str,
        library_version: &str,
    ) -> Result<(), ConfigError> {
        if let Some(minimum) = &self.min_app_version {
            if version_compare_expecting(app_version, minimum, Ordering::Less) {
                return Err(ConfigError::AppTooOld {
                    version: app_version.to_owned(),
                    minimum: minimum.clone(),
                });
            }
        }
        for minimum in [&self.min_library_version, &self.min_library_version_internal]
            .into_iter()
            .flatten()
        {
            if version_compare_expecting(library_version, minimum, Ordering::Less) {
                return Err(ConfigError::LibraryTooOld {
                    version: library_version.to_owned(),
                    minimum: minimum.clone(),
                });
            }
        }
        Ok(())
    }

    /// `configVersion`.
    pub fn config_version(&self) -> &str {
        &self.config_version
    }

    /// Bundle id of the app this config is for.
    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// `minAppVersion`.
    pub fn min_app_version(&self) -> Option<&str> {
        self.min_app_version.as_deref()
    }

    /// `minCMVersion`.
    pub fn min_library_version(&self) -> Option<&str> {
        self.min_library_version.as_deref()
    }

    /// `minCMVersionInternal`.
    pub fn min_library_version_internal(&self) -> Option<&str> {
        self.min_library_version_internal.as_deref()
    }

    /// Name of the default theme. It may name a theme built into the host rather than one in
    /// this config.
    pub fn default_theme_name(&self) -> Option<&str> {
        self.default_theme_name.as_deref()
    }

    /// Raw payload of a named theme.
    pub fn theme(&self, name: &str) -> Option<&Value> {
        self.themes.get(name)
    }

    /// Named action.
    pub fn action(&self, name: &str) -> Option<&ActionContainer> {
        self.actions.get(name)
    }

    /// All named actions, ordered by name.
    pub fn actions(&self) -> impl Iterator<Item = (&str, &ActionContainer)> {
        self.actions.iter().map(|(name, action)| (name.as_str(), action))
    }

    /// Named condition.
    pub fn condition(&self, name: &str) -> Option<&Condition> {
        self.conditions.get(name)
    }

    /// Triggers fired by `event_name`, ordered by trigger name.
    pub fn triggers_for_event<'a>(&'a self, event_name: &'a str) -> impl Iterator<Item = &'a Trigger> {
        self.triggers
            .values()
            .filter(move |trigger| trigger.event_name == event_name)
    }

    /// Notifications, ordered by id.
    pub fn notifications(&self) -> impl Iterator<Item = &Notification> {
        self.notifications.values()
    }

    /// Notification by id.
    pub fn notification(&self, id: &str) -> Option<&Notification> {
        self.notifications.get(id)
    }

    /// Every condition in the config: named conditions, action guards, conditional actions,
    /// trigger guards and notification conditions.
    pub fn all_conditions(&self) -> Vec<&Condition> {
        let mut all: Vec<&Condition> = self.conditions.values().collect();
        for container in self.actions.values() {
            all.extend(&container.condition);
            if let Action::Conditional(conditional) = &container.action {
                all.push(&conditional.condition);
            }
        }
        all.extend(self.triggers.values().filter_map(|trigger| trigger.condition.as_ref()));
        for notification in self.notifications.values() {
            all.extend(&notification.schedule_condition);
            all.extend(notification.ideal_delivery.as_ref().map(|ideal| &ideal.condition));
        }
        all
    }
}
