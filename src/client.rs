use std::{
    fs,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError, RwLock, RwLockReadGuard,
    },
};

use chrono::{DateTime, Local, TimeDelta, Utc};
use rand::Rng;

use crate::{
    conditions::{Condition, ConditionEngine, Environment, Value},
    config::{Action, ConfigCache, ConfigError, PrimaryConfig},
    configuration_store::ConfigurationStore,
    history::{built_in, Event, EventClassification, HistoryStore, SampleType},
    notifications::{NotificationPlan, NotificationPlanner},
    properties::{PropertyKind, PropertyProvider, PropertyRegistry, PropertyValue},
    signing::SignUtil,
    ActionDispatcher, ClientConfig, Error, Result, VERSION,
};

/// Logical name of the main config file in the cache.
const PRIMARY_CONFIG_NAME: &str = "primary";

/// The Critical Moments client: loads the config, records events and runs triggers, actions,
/// named conditions and notifications against the registered properties.
///
/// In order to create a client instance, first create [`ClientConfig`]. Properties are
/// registered before calling [`Client::start`].
///
/// # Examples
/// ```no_run
/// # use critical_moments::{signing::SignUtil, ClientConfig};
/// # fn run(verifier: SignUtil) -> critical_moments::Result<()> {
/// let mut config = ClientConfig::from_api_key("CM1-...", "com.example.app");
/// config
///     .config_url("https://example.com/cm.config")?
///     .data_dir("/var/lib/example")
///     .verifier(verifier);
/// let client = config.to_client()?;
/// client.register_static_property("platform", "ios")?;
/// // ... every required property
/// client.start()?;
/// client.send_event("checkout")?;
/// # Ok(())
/// # }
/// ```
pub struct Client<'a> {
    bundle_id: String,
    config_url: String,
    allow_debug_load: bool,
    session_gap: TimeDelta,
    engine: ConditionEngine,
    verifier: SignUtil,
    cache: ConfigCache,
    history: Arc<HistoryStore>,
    properties: RwLock<PropertyRegistry>,
    configuration_store: ConfigurationStore,
    action_dispatcher: Box<dyn ActionDispatcher + Send + Sync + 'a>,
    starting: AtomicBool,
    started: AtomicBool,
    session_start: Arc<Mutex<Option<DateTime<Utc>>>>,
    notification_plan: Mutex<Option<NotificationPlan>>,
    session_random: i64,
}

impl<'a> Client<'a> {
    pub(crate) fn new(config: ClientConfig<'a>) -> Result<Self> {
        let ClientConfig {
            bundle_id,
            config_url,
            data_dir,
            verifier,
            validation_mode,
            history,
            cache,
            session_gap,
            allow_debug_load,
            action_dispatcher,
            ..
        } = config;
        let config_url = config_url.ok_or(Error::MissingSetting("config URL"))?;
        let data_dir: PathBuf = data_dir.ok_or(Error::MissingSetting("data directory"))?;
        let verifier = verifier.ok_or(Error::MissingSetting("verifier"))?;

        let cache = ConfigCache::new(&data_dir, cache)?;
        let history = Arc::new(HistoryStore::new(history));
        history.start(&data_dir)?;

        let mut properties = PropertyRegistry::new();
        properties.set_history_store(history.clone());

        Ok(Client {
            bundle_id,
            config_url,
            allow_debug_load,
            session_gap: TimeDelta::from_std(session_gap).unwrap_or(TimeDelta::MAX),
            engine: ConditionEngine::new(validation_mode),
            verifier,
            cache,
            history,
            properties: RwLock::new(properties),
            configuration_store: ConfigurationStore::new(),
            action_dispatcher,
            starting: AtomicBool::new(false),
            started: AtomicBool::new(false),
            session_start: Arc::new(Mutex::new(None)),
            notification_plan: Mutex::new(None),
            session_random: rand::thread_rng().gen_range(0..i64::MAX),
        })
    }

    /// Register a fixed value for a built-in or `custom_` property.
    pub fn register_static_property(
        &self,
        name: &str,
        value: impl Into<PropertyValue>,
    ) -> Result<()> {
        self.properties
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register_static(name, value)
    }

    /// Register a provider, such as a host callback read on every use.
    pub fn register_property_provider(&self, name: &str, provider: PropertyProvider) -> Result<()> {
        self.properties
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register(name, provider)
    }

    /// Set an app property. Conditions read it as `custom_<name>`, or under its own name for
    /// well-known properties like `user_signup_date`. The value is recorded in history.
    pub fn set_custom_property(&self, name: &str, value: impl Into<PropertyValue>) -> Result<()> {
        let value = value.into();
        let (full_name, sample_type) = {
            let mut properties = self.properties.write().unwrap_or_else(PoisonError::into_inner);
            let full_name = properties.set_custom(name, value.clone())?;
            let sample_type = properties.sample_type(&full_name);
            (full_name, sample_type)
        };
        self.history
            .insert_property_sample(&full_name, &value, sample_type)
    }

    /// Set app properties from a JSON object of string, number and bool values.
    pub fn set_custom_properties_from_json(&self, json: &[u8]) -> Result<()> {
        let samples: Vec<(String, PropertyValue, SampleType)> = {
            let mut properties = self.properties.write().unwrap_or_else(PoisonError::into_inner);
            let names = properties.set_custom_from_json(json)?;
            names
                .into_iter()
                .filter_map(|name| {
                    let value = properties.value(&name)?;
                    let sample_type = properties.sample_type(&name);
                    Some((name, value, sample_type))
                })
                .collect()
        };
        for (name, value, sample_type) in samples {
            self.history
                .insert_property_sample(&name, &value, sample_type)?;
        }
        Ok(())
    }

    /// Validate the registered properties, load the config and send the app start event.
    /// Should only be called once.
    pub fn start(&self) -> Result<()> {
        if self
            .starting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::AlreadyStarted);
        }
        let result = self.start_inner();
        if result.is_err() {
            self.starting.store(false, Ordering::SeqCst);
        }
        result
    }

    fn start_inner(&self) -> Result<()> {
        {
            let mut properties = self.properties.write().unwrap_or_else(PoisonError::into_inner);
            properties.register_static("app_start_time", Utc::now())?;
            let session_start = self.session_start.clone();
            properties.register(
                "session_start_time",
                PropertyProvider::dynamic(PropertyKind::Timestamp, move || {
                    let start = *session_start.lock().unwrap_or_else(PoisonError::into_inner);
                    Some(PropertyValue::Timestamp(start.unwrap_or_else(Utc::now)))
                }),
            )?;
            let problems = properties.validate();
            if !problems.is_empty() {
                return Err(Error::InvalidProperties(problems));
            }
        }

        let config = self.load_config()?;
        self.configuration_store.set_configuration(config);

        self.sample_properties_for_startup();
        self.started.store(true, Ordering::SeqCst);

        if let Err(err) = self.send_built_in_event(built_in::APP_START) {
            log::warn!(target: "critical_moments",
                event_name = built_in::APP_START;
                "failed to send built in event, continuing: {err}");
        }
        // Usually done by the app start event already.
        self.initialize_notification_plan();
        Ok(())
    }

    /// Whether [`Client::start`] completed.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn require_started(&self) -> Result<()> {
        if self.is_started() {
            Ok(())
        } else {
            Err(Error::NotStarted)
        }
    }

    /// The active config, once started.
    pub fn configuration(&self) -> Option<Arc<PrimaryConfig>> {
        self.configuration_store.get_configuration()
    }

    /// The event and property history.
    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    fn load_config(&self) -> Result<PrimaryConfig> {
        let file_path = ClientConfig::file_path(&self.config_url);
        let path = match file_path {
            Some(path) => PathBuf::from(path),
            None => self
                .cache
                .verify_or_fetch(&self.config_url, PRIMARY_CONFIG_NAME)?,
        };
        let data = fs::read(&path)?;

        let config = match PrimaryConfig::decode(&data, &self.verifier, &self.engine) {
            Ok(config) => config,
            // An empty config doesn't need a signature.
            Err(_) if data.trim_ascii() == b"{}" => PrimaryConfig::empty(&self.bundle_id),
            Err(err) if self.allow_debug_load && file_path.is_some() => {
                log::warn!(target: "critical_moments",
                    path:? = path;
                    "loading unsigned config file in debug mode: {err}");
                PrimaryConfig::from_json(&data, &self.engine)?
            }
            Err(err) => return Err(err.into()),
        };

        if config.app_id() != self.bundle_id {
            return Err(ConfigError::AppIdMismatch {
                config_app_id: config.app_id().to_owned(),
                bundle_id: self.bundle_id.clone(),
            }
            .into());
        }
        let app_version = match self.property_value("app_version") {
            Some(PropertyValue::String(version)) => version,
            _ => String::new(),
        };
        config.check_client_versions(&app_version, VERSION)?;
        Ok(config)
    }

    fn property_value(&self, name: &str) -> Option<PropertyValue> {
        self.read_properties().value(name)
    }

    fn read_properties(&self) -> RwLockReadGuard<'_, PropertyRegistry> {
        self.properties.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn sample_properties_for_startup(&self) {
        let samples = self.read_properties().startup_samples();
        for (name, value) in samples {
            if let Err(err) = self
                .history
                .insert_property_sample(&name, &value, SampleType::AppStart)
            {
                log::warn!(target: "critical_moments",
                    property = name.as_str();
                    "failed to sample property for startup, continuing: {err}");
            }
        }
    }

    /// Record an app event and run the triggers listening for it. Names in the well-known
    /// namespace must be well-known events; other reserved names are rejected.
    pub fn send_event(&self, name: &str) -> Result<()> {
        self.process_event(Event::from_app(name)?)
    }

    /// Notify the library that the app came to the foreground.
    pub fn app_entered_foreground(&self) -> Result<()> {
        self.send_built_in_event(built_in::APP_ENTERED_FOREGROUND)
    }

    /// Notify the library that the app went to the background.
    pub fn app_entered_background(&self) -> Result<()> {
        self.send_built_in_event(built_in::APP_ENTERED_BACKGROUND)
    }

    fn send_built_in_event(&self, name: &str) -> Result<()> {
        self.process_event(Event::built_in(name)?)
    }

    fn process_event(&self, event: Event) -> Result<()> {
        self.require_started()?;

        if event.classification() == EventClassification::BuiltIn
            && event.name() == built_in::APP_ENTERED_FOREGROUND
        {
            if let Err(err) = self.update_session_for_foreground() {
                log::warn!(target: "critical_moments",
                    "failed to update session for foreground: {err}");
            }
        }

        self.history.insert_event(&event)?;
        log::debug!(target: "critical_moments", event_name = event.name(); "recorded event");

        let result = self.perform_triggers_for_event(event.name());
        self.update_notifications_for_event(event.name());
        result
    }

    fn update_session_for_foreground(&self) -> Result<()> {
        let now = Utc::now();
        let last_start = *self
            .session_start
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if last_start.is_some_and(|start| now - start < self.session_gap) {
            return Ok(());
        }

        let new_session = match self
            .history
            .latest_event_time(built_in::APP_ENTERED_BACKGROUND)?
        {
            None => true,
            Some(background) if now - background > self.session_gap => true,
            // Backgrounded recently but never foregrounded before this event.
            Some(_) => self
                .history
                .latest_event_time(built_in::APP_ENTERED_FOREGROUND)?
                .is_none(),
        };
        if new_session {
            self.start_session()?;
        }
        Ok(())
    }

    fn start_session(&self) -> Result<()> {
        self.send_built_in_event(built_in::SESSION_START)?;
        *self
            .session_start
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
        Ok(())
    }

    /// Runs every trigger for `event_name`. A failing trigger doesn't stop the others; the
    /// last failure is returned.
    fn perform_triggers_for_event(&self, event_name: &str) -> Result<()> {
        let config = self.configuration_store.require()?;
        let mut last_error = None;
        for trigger in config.triggers_for_event(event_name) {
            if let Some(condition) = &trigger.condition {
                match self.evaluate_condition(condition) {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(err) => {
                        log::warn!(target: "critical_moments",
                            event_name, action_name = trigger.action_name.as_str();
                            "failed to evaluate trigger condition: {err}");
                        last_error = Some(err);
                        continue;
                    }
                }
            }
            if let Err(err) = self.perform_named_action(&trigger.action_name) {
                log::warn!(target: "critical_moments",
                    event_name, action_name = trigger.action_name.as_str();
                    "failed to perform action for event: {err}");
                last_error = Some(err);
            }
        }
        last_error.map_or(Ok(()), Err)
    }

    /// Perform the named action from the config. Actions whose condition is false are skipped
    /// without error. Performed actions are recorded as `action:<name>` events, failed ones
    /// as `action_error:<name>`.
    pub fn perform_named_action(&self, name: &str) -> Result<()> {
        self.require_started()?;
        let config = self.configuration_store.require()?;
        let container = config.action(name).ok_or_else(|| Error::NotFound {
            kind: "action",
            name: name.to_owned(),
        })?;

        if let Some(condition) = &container.condition {
            if !self.evaluate_condition(condition)? {
                log::debug!(target: "critical_moments", action_name = name;
                    "action condition not met, skipping");
                return Ok(());
            }
        }

        let result = self.run_action(name, &container.action);
        let event_name = match &result {
            Ok(()) => format!("action:{name}"),
            Err(_) => format!("action_error:{name}"),
        };
        if let Err(err) = self.send_event(&event_name) {
            log::warn!(target: "critical_moments", event_name = event_name.as_str();
                "failed to record performed action: {err}");
        }
        result
    }

    fn run_action(&self, name: &str, action: &Action) -> Result<()> {
        match action {
            Action::Conditional(conditional) => {
                let passed = self.evaluate_condition(&conditional.condition)?;
                match conditional.action_for(passed) {
                    Some(next) => self.perform_named_action(next),
                    None => Ok(()),
                }
            }
            Action::Unknown { action_type, .. } => {
                log::warn!(target: "critical_moments",
                    action_name = name, action_type = action_type.as_str();
                    "action type not supported by this version, skipping");
                Ok(())
            }
            action => {
                log::trace!(target: "critical_moments",
                    action_name = name, action_type = action.action_type();
                    "dispatching action");
                self.action_dispatcher
                    .dispatch(name, action)
                    .map_err(|message| Error::Action {
                        name: name.to_owned(),
                        message,
                    })
            }
        }
    }

    /// Evaluate the named condition from the config. The result is recorded as an
    /// `ff_true:<name>`, `ff_false:<name>` or `ff_error:<name>` event.
    pub fn check_named_condition(&self, name: &str) -> Result<bool> {
        self.require_started()?;
        let config = self.configuration_store.require()?;
        let condition = config.condition(name).ok_or_else(|| Error::NotFound {
            kind: "condition",
            name: name.to_owned(),
        })?;

        let result = self.evaluate_condition(condition);
        let event_name = match &result {
            Ok(true) => format!("ff_true:{name}"),
            Ok(false) => format!("ff_false:{name}"),
            Err(_) => format!("ff_error:{name}"),
        };
        if let Err(err) = self.send_event(&event_name) {
            log::warn!(target: "critical_moments", event_name = event_name.as_str();
                "failed to record named condition result: {err}");
        }
        result
    }

    /// Compile and evaluate a condition that is not part of the config. Nothing is recorded.
    pub fn check_condition(&self, source: &str) -> Result<bool> {
        let condition = self.engine.condition(source)?;
        self.evaluate_condition(&condition)
    }

    /// Evaluate `condition` against the registered properties and history.
    pub fn evaluate_condition(&self, condition: &Condition) -> Result<bool> {
        let properties = self.read_properties();
        let env = self.environment(&properties);
        let result = condition.evaluate(&env);
        log::trace!(target: "critical_moments",
            condition = condition.source();
            "evaluated condition: {result:?}");
        Ok(result?)
    }

    fn environment<'c>(&'c self, properties: &'c PropertyRegistry) -> ClientEnvironment<'c> {
        ClientEnvironment {
            properties,
            history: &self.history,
            action_dispatcher: &*self.action_dispatcher,
            session_random: self.session_random,
        }
    }

    /// Named theme from the config, as raw JSON for the host to apply.
    pub fn theme(&self, name: &str) -> Option<serde_json::Value> {
        if !self.is_started() {
            return None;
        }
        self.configuration()?.theme(name).cloned()
    }

    /// Run the tap action of the notification with `unique_id`, if it has one.
    pub fn action_for_notification(&self, unique_id: &str) -> Result<()> {
        let config = self.configuration_store.require()?;
        let action_name = config
            .notifications()
            .find(|notification| notification.unique_id() == unique_id)
            .and_then(|notification| notification.tap_action_name.clone());
        match action_name {
            Some(action_name) => self.perform_named_action(&action_name),
            None => Ok(()),
        }
    }

    /// Work to do when the host wakes the app in the background: replans notifications, so
    /// ideal delivery conditions are checked again.
    pub fn perform_background_work(&self) -> Result<()> {
        self.require_started()?;
        self.update_notification_plan();
        Ok(())
    }

    /// The most recent notification plan.
    pub fn notification_plan(&self) -> Option<NotificationPlan> {
        self.notification_plan
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn initialize_notification_plan(&self) {
        if self.notification_plan().is_none() {
            self.update_notification_plan();
        }
    }

    fn update_notifications_for_event(&self, event_name: &str) {
        let Some(config) = self.configuration() else {
            return;
        };
        let needs_update = match &*self
            .notification_plan
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
        {
            Some(plan) => plan.needs_update_for_event(event_name, config.notifications()),
            None => true,
        };
        if needs_update {
            self.update_notification_plan();
        }
    }

    fn update_notification_plan(&self) {
        let Some(config) = self.configuration() else {
            return;
        };
        let plan = {
            let properties = self.read_properties();
            let env = self.environment(&properties);
            NotificationPlanner::new(&self.history, &env).plan(config.notifications(), &Local::now())
        };
        self.action_dispatcher.update_notification_plan(&plan);
        *self
            .notification_plan
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(plan);
    }
}

/// Properties, history functions and host capabilities as seen by conditions.
struct ClientEnvironment<'c> {
    properties: &'c PropertyRegistry,
    history: &'c HistoryStore,
    action_dispatcher: &'c dyn ActionDispatcher,
    session_random: i64,
}

impl ClientEnvironment<'_> {
    fn history_function(&self, name: &str, args: &[Value]) -> std::result::Result<Value, String> {
        let wrong_arguments = || format!("invalid arguments for {name}");
        let str_arg = |i: usize| args.get(i).and_then(Value::as_str).ok_or_else(wrong_arguments);
        let history = |err: Error| err.to_string();

        Ok(match name {
            "eventCount" => Value::Int(self.history.event_count(str_arg(0)?).map_err(history)?),
            "eventCountWithLimit" => {
                let limit = args
                    .get(1)
                    .and_then(Value::as_int)
                    .ok_or_else(wrong_arguments)?;
                Value::Int(
                    self.history
                        .event_count_with_limit(str_arg(0)?, limit)
                        .map_err(history)?,
                )
            }
            "propertyHistoryLatestValue" => Value::from(
                self.history
                    .latest_property_value(str_arg(0)?)
                    .map_err(history)?,
            ),
            "propertyEver" | "propertyEverHadValue" => {
                let property = str_arg(0)?;
                let value = args
                    .get(1)
                    .and_then(Value::to_property_value)
                    .ok_or_else(wrong_arguments)?;
                Value::Bool(
                    self.history
                        .property_ever_had_value(property, &value)
                        .map_err(history)?,
                )
            }
            "stableRand" => Value::Int(self.history.stable_random().map_err(history)?),
            _ => return Err(format!("function {name} is not available")),
        })
    }
}

impl Environment for ClientEnvironment<'_> {
    fn property(&self, name: &str) -> Value {
        let Some(value) = self.properties.value(name) else {
            return Value::Nil;
        };
        if self.properties.sample_type(name) == SampleType::OnUse {
            if let Err(err) = self
                .history
                .insert_property_sample(name, &value, SampleType::OnUse)
            {
                log::warn!(target: "critical_moments", property = name;
                    "failed to sample property on use: {err}");
            }
        }
        Value::from(value)
    }

    fn call_function(
        &self,
        name: &str,
        args: &[Value],
    ) -> Option<std::result::Result<Value, String>> {
        match name {
            "canOpenUrl" => Some(match args.first().and_then(Value::as_str) {
                Some(url) => Ok(Value::Bool(self.action_dispatcher.can_open_url(url))),
                None => Err("invalid arguments for canOpenUrl".to_owned()),
            }),
            "eventCount" | "eventCountWithLimit" | "propertyHistoryLatestValue"
            | "propertyEver" | "propertyEverHadValue" | "stableRand" => {
                Some(self.history_function(name, args))
            }
            _ => None,
        }
    }

    fn session_random(&self) -> i64 {
        self.session_random
    }
}

#[cfg(test)]
mod tests {
    use std::{
        fs,
        path::Path,
        sync::{Arc, Mutex},
        time::Duration,
    };

    use chrono::Utc;
    use tempfile::TempDir;

    use crate::{
        config::{encode_container, Action},
        history::built_in,
        notifications::NotificationPlan,
        properties::{
            catalog::{self, Requirement},
            PropertyKind, PropertyValue,
        },
        signing::{ApiKey, SignUtil},
        ActionDispatcher, Client, ClientConfig, Error,
    };

    const BUNDLE_ID: &str = "com.example.app";

    const CONFIG: &str = r##"{
        "configVersion": "v1",
        "appId": "com.example.app",
        "minAppVersion": "1.0",
        "themes": {
            "namedThemes": {
                "dark": { "bannerBackgroundColor": "#000000" }
            }
        },
        "actions": {
            "namedActions": {
                "hello": {
                    "actionType": "banner",
                    "actionData": { "body": "Hello" }
                },
                "paid_link": {
                    "actionType": "link",
                    "condition": "custom_paid == true",
                    "actionData": { "url": "https://example.com" }
                },
                "broken_guard": {
                    "actionType": "link",
                    "condition": "custom_missing > 3",
                    "actionData": { "url": "https://example.com" }
                },
                "choose": {
                    "actionType": "conditional_action",
                    "actionData": {
                        "condition": "eventCount('checkout') >= 2",
                        "passedActionName": "review",
                        "failedActionName": "hello"
                    }
                },
                "review": { "actionType": "review_prompt" }
            }
        },
        "triggers": {
            "namedTriggers": {
                "on_start": {
                    "eventName": "io.criticalmoments.events.built_in.app_start",
                    "actionName": "hello"
                },
                "on_checkout": {
                    "eventName": "checkout",
                    "actionName": "choose"
                },
                "on_share": {
                    "eventName": "share",
                    "actionName": "hello",
                    "condition": "custom_missing > 3"
                }
            }
        },
        "conditions": {
            "namedConditions": {
                "paid": "custom_paid == true",
                "broken": "custom_missing > 3",
                "ios": "platform == 'ios' && app_version_major >= 2"
            }
        },
        "notifications": {
            "reminder": {
                "title": "Come back",
                "tapActionName": "hello",
                "deliveryTime": {
                    "eventName": "checkout",
                    "eventOffsetSeconds": 3600
                }
            }
        }
    }"##;

    #[derive(Default)]
    struct Recorded {
        actions: Mutex<Vec<String>>,
        plans: Mutex<Vec<NotificationPlan>>,
    }

    #[derive(Clone, Default)]
    struct Recorder(Arc<Recorded>);

    impl ActionDispatcher for Recorder {
        fn dispatch(&self, name: &str, _action: &Action) -> Result<(), String> {
            self.0.actions.lock().unwrap().push(name.to_owned());
            if name == "review" {
                return Err("review prompt unavailable".to_owned());
            }
            Ok(())
        }

        fn can_open_url(&self, url: &str) -> bool {
            url.starts_with("https://")
        }

        fn update_notification_plan(&self, plan: &NotificationPlan) {
            self.0.plans.lock().unwrap().push(plan.clone());
        }
    }

    impl Recorder {
        fn actions(&self) -> Vec<String> {
            self.0.actions.lock().unwrap().clone()
        }

        fn last_plan(&self) -> Option<NotificationPlan> {
            self.0.plans.lock().unwrap().last().cloned()
        }
    }

    struct Fixture {
        _dir: TempDir,
        client: Client<'static>,
        recorder: Recorder,
    }

    fn write_config(dir: &Path, signer: &SignUtil, json: &str) -> String {
        let path = dir.join("cm.config");
        fs::write(&path, encode_container(json.as_bytes(), signer).unwrap()).unwrap();
        format!("file://{}", path.display())
    }

    fn client_with(configure: impl FnOnce(&Path, &SignUtil, &mut ClientConfig<'static>)) -> Fixture {
        let _ = env_logger::builder().is_test(true).try_init();

        let dir = TempDir::new().unwrap();
        let signer = SignUtil::generate();
        let api_key = ApiKey::new_signed(BUNDLE_ID, &signer).unwrap().to_string();
        let recorder = Recorder::default();

        let mut config = ClientConfig::from_api_key(api_key, BUNDLE_ID);
        config
            .data_dir(dir.path())
            .verifier(signer.clone())
            .action_dispatcher(recorder.clone());
        configure(dir.path(), &signer, &mut config);
        let client = config.to_client().unwrap();
        register_required_properties(&client);

        Fixture {
            _dir: dir,
            client,
            recorder,
        }
    }

    fn started_client() -> Fixture {
        let fixture = client_with(|dir, signer, config| {
            config.config_url(write_config(dir, signer, CONFIG)).unwrap();
        });
        fixture.client.start().unwrap();
        fixture
    }

    fn register_required_properties(client: &Client) {
        for (name, schema) in catalog::all() {
            if schema.requirement != Requirement::Required {
                continue;
            }
            let value = match schema.kind {
                PropertyKind::String if schema.version => PropertyValue::from("2.1.0"),
                PropertyKind::String if name == "platform" => PropertyValue::from("ios"),
                PropertyKind::String => PropertyValue::from("test"),
                PropertyKind::Int => PropertyValue::Int(1),
                PropertyKind::Float => PropertyValue::Float(0.5),
                PropertyKind::Bool => PropertyValue::Bool(true),
                PropertyKind::Timestamp => PropertyValue::Timestamp(Utc::now()),
            };
            client.register_static_property(name, value).unwrap();
        }
    }

    fn count(client: &Client, event_name: &str) -> i64 {
        client.history().event_count(event_name).unwrap()
    }

    #[test]
    fn start_runs_app_start_triggers() {
        let Fixture {
            client, recorder, ..
        } = started_client();

        assert!(client.is_started());
        assert_eq!(count(&client, built_in::APP_START), 1);
        assert_eq!(recorder.actions(), ["hello"]);
        assert_eq!(count(&client, "action:hello"), 1);
        assert_eq!(
            client.history().latest_property_value("platform").unwrap(),
            Some(PropertyValue::from("ios"))
        );
        assert!(client.notification_plan().is_some());
        assert_eq!(client.configuration().unwrap().app_id(), BUNDLE_ID);
        assert_eq!(
            client.theme("dark").unwrap()["bannerBackgroundColor"],
            "#000000"
        );
        assert!(client.theme("light").is_none());
    }

    #[test]
    fn start_only_once() {
        let Fixture { client, .. } = started_client();
        assert!(matches!(client.start(), Err(Error::AlreadyStarted)));
    }

    #[test]
    fn start_requires_properties() {
        let dir = TempDir::new().unwrap();
        let signer = SignUtil::generate();
        let api_key = ApiKey::new_signed(BUNDLE_ID, &signer).unwrap().to_string();
        let mut config = ClientConfig::from_api_key(api_key, BUNDLE_ID);
        config
            .config_url(write_config(dir.path(), &signer, CONFIG))
            .unwrap()
            .data_dir(dir.path())
            .verifier(signer);
        let client = config.to_client().unwrap();

        let Err(Error::InvalidProperties(problems)) = client.start() else {
            panic!("expected missing properties");
        };
        assert!(problems.contains(&"Missing required property: platform".to_owned()));
        assert!(!client.is_started());

        register_required_properties(&client);
        client.start().unwrap();
    }

    #[test]
    fn events_require_start() {
        let fixture = client_with(|dir, signer, config| {
            config.config_url(write_config(dir, signer, CONFIG)).unwrap();
        });
        assert!(matches!(
            fixture.client.send_event("checkout"),
            Err(Error::NotStarted)
        ));
        assert!(matches!(
            fixture.client.check_named_condition("paid"),
            Err(Error::NotStarted)
        ));
    }

    #[test]
    fn rejects_config_for_another_app() {
        let fixture = client_with(|dir, signer, config| {
            let json = CONFIG.replace("com.example.app", "com.example.other");
            config.config_url(write_config(dir, signer, &json)).unwrap();
        });
        assert!(matches!(
            fixture.client.start(),
            Err(Error::Config(crate::config::ConfigError::AppIdMismatch { .. }))
        ));
    }

    #[test]
    fn rejects_config_for_newer_app() {
        let fixture = client_with(|dir, signer, config| {
            let json = CONFIG.replace(r#""minAppVersion": "1.0""#, r#""minAppVersion": "3.0""#);
            config.config_url(write_config(dir, signer, &json)).unwrap();
        });
        assert!(matches!(
            fixture.client.start(),
            Err(Error::Config(crate::config::ConfigError::AppTooOld { .. }))
        ));
    }

    #[test]
    fn rejects_config_signed_by_another_key() {
        let fixture = client_with(|dir, _signer, config| {
            let other = SignUtil::generate();
            config.config_url(write_config(dir, &other, CONFIG)).unwrap();
        });
        assert!(matches!(
            fixture.client.start(),
            Err(Error::Config(crate::config::ConfigError::InvalidSignature))
        ));
    }

    #[test]
    fn empty_config_needs_no_signature() {
        let fixture = client_with(|dir, _signer, config| {
            let path = dir.join("empty.config");
            fs::write(&path, "{}").unwrap();
            config.config_url(format!("file://{}", path.display())).unwrap();
        });
        fixture.client.start().unwrap();
        assert_eq!(
            fixture.client.configuration().unwrap().app_id(),
            BUNDLE_ID
        );
    }

    #[test]
    fn unsigned_config_only_in_debug_mode() {
        let unsigned = |allow_debug_load: bool| {
            client_with(move |dir, _signer, config| {
                let path = dir.join("unsigned.json");
                fs::write(&path, CONFIG).unwrap();
                config
                    .config_url(format!("file://{}", path.display()))
                    .unwrap()
                    .allow_debug_load(allow_debug_load);
            })
        };

        assert!(unsigned(false).client.start().is_err());

        let fixture = unsigned(true);
        fixture.client.start().unwrap();
        assert_eq!(fixture.recorder.actions(), ["hello"]);
    }

    #[test]
    fn conditional_actions_are_resolved_in_core() {
        let Fixture {
            client, recorder, ..
        } = started_client();

        client.send_event("checkout").unwrap();
        assert_eq!(recorder.actions(), ["hello", "hello"]);
        assert_eq!(count(&client, "action:choose"), 1);

        // The second checkout passes the condition and runs the review prompt, which fails.
        assert!(matches!(
            client.send_event("checkout"),
            Err(Error::Action { ref name, .. }) if name == "review"
        ));
        assert_eq!(recorder.actions(), ["hello", "hello", "review"]);
        assert_eq!(count(&client, "action_error:review"), 1);
        assert_eq!(count(&client, "action_error:choose"), 1);
    }

    #[test]
    fn guarded_actions_are_skipped_without_error() {
        let Fixture {
            client, recorder, ..
        } = started_client();

        client.perform_named_action("paid_link").unwrap();
        assert_eq!(recorder.actions(), ["hello"]);
        assert_eq!(count(&client, "action:paid_link"), 0);

        client.set_custom_property("paid", true).unwrap();
        client.perform_named_action("paid_link").unwrap();
        assert_eq!(recorder.actions(), ["hello", "paid_link"]);
        assert_eq!(count(&client, "action:paid_link"), 1);

        assert!(matches!(
            client.perform_named_action("broken_guard"),
            Err(Error::Condition(_))
        ));
        assert!(matches!(
            client.perform_named_action("nope"),
            Err(Error::NotFound { kind: "action", .. })
        ));
    }

    #[test]
    fn trigger_condition_errors_are_reported() {
        let Fixture {
            client, recorder, ..
        } = started_client();

        assert!(matches!(client.send_event("share"), Err(Error::Condition(_))));
        assert_eq!(count(&client, "share"), 1);
        assert_eq!(recorder.actions(), ["hello"]);
    }

    #[test]
    fn named_conditions_record_results() {
        let Fixture { client, .. } = started_client();

        assert_eq!(client.check_named_condition("paid").unwrap(), false);
        assert_eq!(count(&client, "ff_false:paid"), 1);

        client.set_custom_property("paid", true).unwrap();
        assert_eq!(client.check_named_condition("paid").unwrap(), true);
        assert_eq!(count(&client, "ff_true:paid"), 1);

        assert!(client.check_named_condition("ios").unwrap());

        assert!(client.check_named_condition("broken").is_err());
        assert_eq!(count(&client, "ff_error:broken"), 1);

        assert!(matches!(
            client.check_named_condition("nope"),
            Err(Error::NotFound { kind: "condition", .. })
        ));
        assert!(client.check_named_condition("").is_err());
    }

    #[test]
    fn conditions_see_history_and_host() {
        let Fixture { client, .. } = started_client();

        client.send_event("opened").unwrap();
        client.send_event("opened").unwrap();
        assert!(client.check_condition("eventCount('opened') == 2").unwrap());
        assert!(client
            .check_condition("eventCountWithLimit('opened', 1) == 1")
            .unwrap());
        assert!(client
            .check_condition("propertyHistoryLatestValue('platform') == 'ios'")
            .unwrap());
        assert!(client
            .check_condition("propertyEverHadValue('platform', 'ios')")
            .unwrap());
        assert!(!client
            .check_condition("propertyEver('platform', 'android')")
            .unwrap());
        assert!(client
            .check_condition("stableRand() == stableRand()")
            .unwrap());
        assert!(client
            .check_condition("canOpenUrl('https://example.com')")
            .unwrap());
        assert!(!client.check_condition("canOpenUrl('tel:123')").unwrap());
        assert!(client.check_condition("sessionRand() >= 0").unwrap());
        assert!(client
            .check_condition("app_start_time <= now() && session_start_time <= now()")
            .unwrap());
    }

    #[test]
    fn custom_properties_are_recorded() {
        let Fixture { client, .. } = started_client();

        client
            .set_custom_properties_from_json(br#"{"plan": "pro", "seats": 3}"#)
            .unwrap();
        assert!(client
            .check_condition("custom_plan == 'pro' && custom_seats == 3")
            .unwrap());
        assert_eq!(
            client.history().latest_property_value("custom_seats").unwrap(),
            Some(PropertyValue::Int(3))
        );
    }

    #[test]
    fn foreground_starts_sessions() {
        let Fixture { client, .. } = started_client();

        client.app_entered_foreground().unwrap();
        assert_eq!(count(&client, built_in::SESSION_START), 1);

        // Short trips to the background keep the session.
        client.app_entered_background().unwrap();
        client.app_entered_foreground().unwrap();
        assert_eq!(count(&client, built_in::SESSION_START), 1);
    }

    #[test]
    fn long_backgrounds_start_new_sessions() {
        let fixture = client_with(|dir, signer, config| {
            config
                .config_url(write_config(dir, signer, CONFIG))
                .unwrap()
                .session_gap(Duration::ZERO);
        });
        let client = &fixture.client;
        client.start().unwrap();

        client.app_entered_foreground().unwrap();
        assert_eq!(count(client, built_in::SESSION_START), 1);

        client.app_entered_background().unwrap();
        std::thread::sleep(Duration::from_millis(20));
        client.app_entered_foreground().unwrap();
        assert_eq!(count(client, built_in::SESSION_START), 2);
    }

    #[test]
    fn notification_plan_follows_events() {
        let Fixture {
            client, recorder, ..
        } = started_client();

        let plan = client.notification_plan().unwrap();
        assert!(plan.scheduled.is_empty());
        assert_eq!(plan.unscheduled.len(), 1);

        client.send_event("checkout").unwrap();
        let plan = client.notification_plan().unwrap();
        assert_eq!(plan.scheduled.len(), 1);
        let scheduled = &plan.scheduled[0];
        assert_eq!(scheduled.notification.id, "reminder");
        assert!(scheduled.scheduled_at > Utc::now());
        assert_eq!(recorder.last_plan(), Some(plan.clone()));

        client.perform_background_work().unwrap();
        assert_eq!(client.notification_plan().unwrap().scheduled.len(), 1);

        let unique_id = scheduled.notification.unique_id();
        let before = recorder.actions().len();
        client.action_for_notification(&unique_id).unwrap();
        assert_eq!(recorder.actions().len(), before + 1);
        assert_eq!(recorder.actions().last().map(String::as_str), Some("hello"));
        client.action_for_notification("unknown").unwrap();
    }

    #[test]
    fn reserved_event_names_are_rejected() {
        let Fixture { client, .. } = started_client();
        assert!(matches!(
            client.send_event(built_in::APP_START),
            Err(Error::InvalidEvent(_))
        ));
        assert!(matches!(client.send_event(""), Err(Error::InvalidEvent(_))));
    }
}
