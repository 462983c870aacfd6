use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::conditions::{Condition, ConditionEngine, ValidationMode};

/// Runs a named action when an event is sent, if its condition passes.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Trigger {
    /// Event that fires the trigger.
    #[serde(default)]
    pub event_name: String,
    /// Action to perform.
    #[serde(default)]
    pub action_name: String,
    /// Optional guard evaluated when the event is sent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
}

impl Trigger {
    pub(crate) fn prepare(&mut self, engine: &ConditionEngine) -> Result<(), String> {
        if self.event_name.is_empty() {
            return Err("All triggers require an event".to_owned());
        }
        if self.action_name.is_empty() {
            return Err("All triggers require an action name".to_owned());
        }
        prepare_optional(&mut self.condition, engine)
            .map_err(|err| format!("Invalid condition in trigger: {err}"))
    }
}

/// Runs one of two named actions depending on a condition.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionalAction {
    /// Decides which action runs.
    #[serde(default = "empty_condition")]
    pub condition: Condition,
    /// Action run when the condition is true.
    #[serde(default)]
    pub passed_action_name: String,
    /// Action run when the condition is false. Nothing runs when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_action_name: Option<String>,
}

fn empty_condition() -> Condition {
    Condition::from("")
}

impl ConditionalAction {
    fn prepare(&mut self, engine: &ConditionEngine) -> Result<(), String> {
        if self.condition.source().is_empty() {
            return Err("Conditional actions must have a condition".to_owned());
        }
        self.condition.prepare(engine).map_err(|_| {
            format!(
                "Condition in conditional action is not valid: [[{}]]",
                self.condition
            )
        })?;
        if self.passed_action_name.is_empty() {
            return Err("Conditional actions must include a passedActionName to run if condition passes (failedActionName is optional)".to_owned());
        }
        if self.failed_action_name.as_deref() == Some("") {
            self.failed_action_name = None;
        }
        Ok(())
    }

    /// Name of the action to run for a condition result.
    pub fn action_for(&self, passed: bool) -> Option<&str> {
        if passed {
            Some(&self.passed_action_name)
        } else {
            self.failed_action_name.as_deref()
        }
    }
}

/// What an action does. User interface payloads are kept as raw JSON for the host to render.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum Action {
    /// In-app banner.
    Banner(Value),
    /// System alert.
    Alert(Value),
    /// Open a url.
    Link(Value),
    /// Full screen modal.
    Modal(Value),
    /// System review prompt.
    ReviewPrompt,
    /// Resolved inside the library.
    Conditional(ConditionalAction),
    /// Type added in a newer release. Performing it does nothing.
    Unknown {
        /// The unrecognized `actionType`.
        action_type: String,
        /// Raw payload.
        data: Value,
    },
}

impl Action {
    pub(crate) const BANNER: &'static str = "banner";
    pub(crate) const ALERT: &'static str = "alert";
    pub(crate) const LINK: &'static str = "link";
    pub(crate) const MODAL: &'static str = "modal";
    pub(crate) const REVIEW_PROMPT: &'static str = "review_prompt";
    pub(crate) const CONDITIONAL: &'static str = "conditional_action";

    /// `actionType` as written in configs.
    pub fn action_type(&self) -> &str {
        match self {
            Action::Banner(_) => Self::BANNER,
            Action::Alert(_) => Self::ALERT,
            Action::Link(_) => Self::LINK,
            Action::Modal(_) => Self::MODAL,
            Action::ReviewPrompt => Self::REVIEW_PROMPT,
            Action::Conditional(_) => Self::CONDITIONAL,
            Action::Unknown { action_type, .. } => action_type,
        }
    }

    /// Raw payload handed to the host, if the action has one.
    pub fn data(&self) -> Option<&Value> {
        match self {
            Action::Banner(data)
            | Action::Alert(data)
            | Action::Link(data)
            | Action::Modal(data)
            | Action::Unknown { data, .. } => Some(data),
            Action::ReviewPrompt | Action::Conditional(_) => None,
        }
    }

    /// Other named actions this action may run, such as button targets.
    pub fn embedded_action_names(&self) -> Vec<&str> {
        fn strings<'a>(data: &'a Value, pointers: &[&str]) -> Vec<&'a str> {
            pointers
                .iter()
                .filter_map(|pointer| data.pointer(pointer).and_then(Value::as_str))
                .filter(|name| !name.is_empty())
                .collect()
        }
        fn button_names<'a>(data: &'a Value, pointer: &str) -> Vec<&'a str> {
            data.pointer(pointer)
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter_map(|button| button.get("actionName").and_then(Value::as_str))
                .filter(|name| !name.is_empty())
                .collect()
        }

        match self {
            Action::Banner(data) => strings(data, &["/tapActionName"]),
            Action::Alert(data) => {
                let mut names = strings(data, &["/okButtonActionName"]);
                names.extend(button_names(data, "/customButtons"));
                names
            }
            Action::Modal(data) => button_names(data, "/content/pageData/buttons"),
            Action::Conditional(conditional) => {
                let mut names = vec![conditional.passed_action_name.as_str()];
                names.extend(conditional.failed_action_name.as_deref());
                names
            }
            Action::Link(_) | Action::ReviewPrompt | Action::Unknown { .. } => Vec::new(),
        }
    }
}

/// A named action from the config: the action plus an optional guard condition.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionContainer {
    /// The action is skipped (without error) when this evaluates to false.
    pub condition: Option<Condition>,
    /// What to do.
    pub action: Action,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ActionContainerJson {
    #[serde(default)]
    action_type: String,
    #[serde(default)]
    condition: Option<Condition>,
    #[serde(default)]
    action_data: Value,
}

impl ActionContainer {
    pub(crate) fn from_json(
        json: ActionContainerJson,
        engine: &ConditionEngine,
    ) -> Result<ActionContainer, String> {
        let ActionContainerJson {
            action_type,
            condition,
            action_data,
        } = json;

        let action = match action_type.as_str() {
            "" => return Err("Empty actionType not permitted".to_owned()),
            Action::BANNER => Action::Banner(action_data),
            Action::ALERT => Action::Alert(action_data),
            Action::LINK => Action::Link(action_data),
            Action::MODAL => Action::Modal(action_data),
            Action::REVIEW_PROMPT => Action::ReviewPrompt,
            Action::CONDITIONAL => {
                let mut conditional: ConditionalAction = serde_json::from_value(action_data)
                    .map_err(|err| {
                        format!("Issue unpacking type \"{action_type}\": {err}")
                    })?;
                conditional.prepare(engine)?;
                Action::Conditional(conditional)
            }
            _ if engine.mode() == ValidationMode::Strict => {
                return Err(format!(
                    "Unsupported action type: \"{action_type}\" found in config file."
                ))
            }
            _ => {
                log::warn!(target: "critical_moments", action_type = action_type.as_str();
                    "unsupported action type found in config file, this action will be a no-op");
                Action::Unknown {
                    action_type,
                    data: action_data,
                }
            }
        };

        let mut condition = condition;
        prepare_optional(&mut condition, engine)
            .map_err(|err| format!("Invalid condition: {err}"))?;
        Ok(ActionContainer { condition, action })
    }
}

/// Empty strings mean "no condition".
fn prepare_optional(condition: &mut Option<Condition>, engine: &ConditionEngine) -> Result<(), String> {
    if condition.as_ref().is_some_and(|c| c.source().is_empty()) {
        *condition = None;
    }
    match condition {
        Some(condition) => condition
            .prepare(engine)
            .map_err(|err| format!("[[ {condition} ]] {err}")),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{Action, ActionContainer, ActionContainerJson, Trigger};
    use crate::conditions::{ConditionEngine, ValidationMode};

    fn parse(value: serde_json::Value, mode: ValidationMode) -> Result<ActionContainer, String> {
        let json: ActionContainerJson = serde_json::from_value(value).unwrap();
        ActionContainer::from_json(json, &ConditionEngine::new(mode))
    }

    #[test]
    fn parses_known_types() {
        let banner = parse(
            json!({"actionType": "banner", "actionData": {"body": "Hi", "tapActionName": "next"}}),
            ValidationMode::Strict,
        )
        .unwrap();
        assert_eq!(banner.action.action_type(), "banner");
        assert_eq!(banner.action.embedded_action_names(), ["next"]);
        assert!(banner.condition.is_none());

        let review = parse(
            json!({"actionType": "review_prompt", "condition": "platform == 'ios'"}),
            ValidationMode::Strict,
        )
        .unwrap();
        assert_eq!(review.action, Action::ReviewPrompt);
        assert_eq!(review.condition.unwrap().source(), "platform == 'ios'");
    }

    #[test]
    fn collects_button_targets() {
        let alert = parse(
            json!({"actionType": "alert", "actionData": {
                "title": "t",
                "okButtonActionName": "ok",
                "customButtons": [{"label": "a", "actionName": "custom"}, {"label": "b"}]
            }}),
            ValidationMode::Strict,
        )
        .unwrap();
        assert_eq!(alert.action.embedded_action_names(), ["ok", "custom"]);

        let modal = parse(
            json!({"actionType": "modal", "actionData": {"content": {"pageType": "stack", "pageData": {
                "buttons": [{"title": "go", "actionName": "next"}]
            }}}}),
            ValidationMode::Strict,
        )
        .unwrap();
        assert_eq!(modal.action.embedded_action_names(), ["next"]);
    }

    #[test]
    fn conditional_actions() {
        let action = parse(
            json!({"actionType": "conditional_action", "actionData": {
                "condition": "true", "passedActionName": "a", "failedActionName": "b"
            }}),
            ValidationMode::Strict,
        )
        .unwrap();
        let Action::Conditional(conditional) = &action.action else {
            panic!("expected conditional action");
        };
        assert_eq!(conditional.action_for(true), Some("a"));
        assert_eq!(conditional.action_for(false), Some("b"));
        assert_eq!(action.action.embedded_action_names(), ["a", "b"]);

        let no_condition = parse(
            json!({"actionType": "conditional_action", "actionData": {"passedActionName": "a"}}),
            ValidationMode::Lenient,
        );
        assert_eq!(
            no_condition.unwrap_err(),
            "Conditional actions must have a condition"
        );

        let no_passed = parse(
            json!({"actionType": "conditional_action", "actionData": {"condition": "true"}}),
            ValidationMode::Lenient,
        );
        assert!(no_passed.unwrap_err().contains("passedActionName"));
    }

    #[test]
    fn unknown_types_depend_on_mode() {
        let value = json!({"actionType": "hologram", "actionData": {"x": 1}});
        assert!(parse(value.clone(), ValidationMode::Strict)
            .unwrap_err()
            .contains("Unsupported action type"));

        let action = parse(value, ValidationMode::Lenient).unwrap();
        assert_eq!(action.action.action_type(), "hologram");
        assert!(action.action.embedded_action_names().is_empty());

        assert_eq!(
            parse(json!({"actionData": {}}), ValidationMode::Lenient).unwrap_err(),
            "Empty actionType not permitted"
        );
    }

    #[test]
    fn invalid_guard_conditions() {
        let value = json!({"actionType": "review_prompt", "condition": "1 +"});
        assert!(parse(value.clone(), ValidationMode::Strict).is_err());

        let degraded = parse(value, ValidationMode::Lenient).unwrap();
        assert!(degraded.condition.unwrap().degraded_reason().is_some());

        let empty = parse(
            json!({"actionType": "review_prompt", "condition": ""}),
            ValidationMode::Strict,
        )
        .unwrap();
        assert!(empty.condition.is_none());
    }

    #[test]
    fn triggers_require_event_and_action() {
        let engine = ConditionEngine::new(ValidationMode::Strict);
        let mut trigger: Trigger =
            serde_json::from_value(json!({"eventName": "e", "actionName": "a"})).unwrap();
        trigger.prepare(&engine).unwrap();

        let mut trigger: Trigger = serde_json::from_value(json!({"actionName": "a"})).unwrap();
        assert_eq!(trigger.prepare(&engine).unwrap_err(), "All triggers require an event");

        let mut trigger: Trigger = serde_json::from_value(json!({"eventName": "e"})).unwrap();
        assert_eq!(
            trigger.prepare(&engine).unwrap_err(),
            "All triggers require an action name"
        );
    }
}
