//! Local notifications from the config and the planner deciding when they are delivered.
use chrono::{DateTime, Datelike, TimeDelta, TimeZone, Timelike, Utc, Weekday};
use serde::Deserialize;

use crate::conditions::{Condition, ConditionEngine, ValidationMode};

mod planner;

pub use planner::{NotificationPlan, NotificationPlanner, ScheduledNotification};

/// Prefix of [`Notification::unique_id`].
pub const UNIQUE_ID_PREFIX: &str = "io.criticalmoments.notifications.";

/// Days in the order they are stored, Sunday first.
const ALL_DAYS: [(Weekday, &str); 7] = [
    (Weekday::Sun, "Sunday"),
    (Weekday::Mon, "Monday"),
    (Weekday::Tue, "Tuesday"),
    (Weekday::Wed, "Wednesday"),
    (Weekday::Thu, "Thursday"),
    (Weekday::Fri, "Friday"),
    (Weekday::Sat, "Saturday"),
];

/// Last minute of the day, 23:59.
const LAST_MINUTE: u32 = 23 * 60 + 59;

const INTERRUPTION_LEVELS: [&str; 4] = ["active", "critical", "passive", "timeSensitive"];

/// Which occurrence of an event an event-relative delivery time is measured from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventInstance {
    /// The latest occurrence, but a notification that was already due does not fire again.
    LatestOnce,
    /// The latest occurrence.
    Latest,
    /// The first occurrence.
    First,
    /// Value from a newer release. Never scheduled.
    Unknown(String),
}

impl EventInstance {
    fn parse(value: Option<&str>) -> EventInstance {
        match value.unwrap_or_default() {
            "" | "latest-once" => EventInstance::LatestOnce,
            "latest" => EventInstance::Latest,
            "first" => EventInstance::First,
            other => EventInstance::Unknown(other.to_owned()),
        }
    }
}

/// When a notification is due, before delivery-window filters are applied.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryTime {
    /// Fixed point in time.
    At(DateTime<Utc>),
    /// Relative to an event in history.
    AfterEvent {
        /// Event name.
        event_name: String,
        /// Added to the event time.
        offset: TimeDelta,
        /// Which occurrence to measure from.
        instance: EventInstance,
    },
}

/// Delivery is sped up when a condition passes, or held back until it passes.
#[derive(Debug, Clone, PartialEq)]
pub struct IdealDelivery {
    /// Delivery happens as soon as this is true once the notification is due.
    pub condition: Condition,
    /// How long to wait for the condition before delivering anyway. `None` waits forever.
    pub max_wait: Option<TimeDelta>,
}

/// A local notification.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    /// Key in the config's `notifications` map.
    pub id: String,
    /// Title text.
    pub title: Option<String>,
    /// Body text.
    pub body: Option<String>,
    /// App badge count to set.
    pub badge_count: Option<i64>,
    /// Named action run when the notification is tapped.
    pub tap_action_name: Option<String>,
    /// Sound name.
    pub sound: Option<String>,
    /// Launch image name.
    pub launch_image_name: Option<String>,
    /// Relevance between 0 and 1.
    pub relevance_score: Option<f64>,
    /// One of `active`, `critical`, `passive` or `timeSensitive`.
    pub interruption_level: Option<String>,
    /// Never scheduled unless this is true.
    pub schedule_condition: Option<Condition>,
    /// When the notification is due.
    pub delivery_time: DeliveryTime,
    /// Days delivery is allowed on, in the notification's local time. Sunday first.
    pub delivery_days_of_week: Vec<Weekday>,
    /// First minute of the day delivery is allowed.
    pub delivery_start_minute: u32,
    /// Last minute of the day delivery is allowed.
    pub delivery_end_minute: u32,
    /// Condition-driven delivery.
    pub ideal_delivery: Option<IdealDelivery>,
    /// Any of these events in history cancels the notification.
    pub cancelation_events: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DeliveryTimeJson {
    timestamp: Option<i64>,
    event_name: Option<String>,
    event_offset_seconds: Option<i64>,
    event_instance: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct IdealDeliveryJson {
    #[serde(default)]
    condition: Option<Condition>,
    #[serde(default)]
    max_wait_time_seconds: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct NotificationJson {
    title: Option<String>,
    body: Option<String>,
    badge_count: Option<i64>,
    tap_action_name: Option<String>,
    sound: Option<String>,
    launch_image_name: Option<String>,
    relevance_score: Option<f64>,
    interruption_level: Option<String>,
    schedule_condition: Option<Condition>,
    #[serde(default)]
    delivery_time: DeliveryTimeJson,
    delivery_days_of_week: Option<String>,
    delivery_time_of_day_start: Option<String>,
    delivery_time_of_day_end: Option<String>,
    ideal_delivery_conditions: Option<IdealDeliveryJson>,
    cancelation_events: Option<Vec<String>>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.is_empty())
}

/// Minutes since midnight for `HH:MM`.
fn parse_time_of_day(value: &str) -> Option<u32> {
    let (hours, minutes) = value.split_once(':')?;
    let hours: u32 = hours.parse().ok()?;
    let minutes: u32 = minutes.parse().ok()?;
    (hours <= 23 && minutes <= 59).then_some(hours * 60 + minutes)
}

/// Comma separated full day names, deduplicated and ordered Sunday first. Unknown names are
/// dropped.
fn parse_days_of_week(value: &str) -> Vec<Weekday> {
    let names: Vec<&str> = value.split(',').map(str::trim).collect();
    ALL_DAYS
        .iter()
        .filter(|(_, name)| names.contains(name))
        .map(|(day, _)| *day)
        .collect()
}

impl DeliveryTime {
    fn from_json(json: DeliveryTimeJson, strict: bool) -> Result<DeliveryTime, String> {
        let event_name = non_empty(json.event_name);
        match (json.timestamp, event_name) {
            (None, None) => {
                Err("DeliveryTime must have either a Timestamp or an EventName defined.".to_owned())
            }
            (Some(_), Some(_)) => {
                Err("DeliveryTime cannot have both a Timestamp and an EventName defined.".to_owned())
            }
            (Some(_), None) if json.event_offset_seconds.is_some() => {
                Err("DeliveryTime cannot have both a Timestamp and an EventOffset defined.".to_owned())
            }
            (Some(timestamp), None) => DateTime::from_timestamp(timestamp, 0)
                .map(DeliveryTime::At)
                .ok_or_else(|| format!("DeliveryTime timestamp out of range: {timestamp}")),
            (None, Some(event_name)) => {
                let instance = EventInstance::parse(json.event_instance.as_deref());
                if let (true, EventInstance::Unknown(value)) = (strict, &instance) {
                    return Err(format!(
                        "Notification event instance must be 'first', 'latest' or 'latest-once' (default), got '{value}'"
                    ));
                }
                let offset = TimeDelta::try_seconds(json.event_offset_seconds.unwrap_or(0))
                    .ok_or_else(|| "DeliveryTime eventOffsetSeconds out of range".to_owned())?;
                Ok(DeliveryTime::AfterEvent {
                    event_name,
                    offset,
                    instance,
                })
            }
        }
    }
}

impl Notification {
    pub(crate) fn from_json(
        id: &str,
        json: NotificationJson,
        engine: &ConditionEngine,
    ) -> Result<Notification, String> {
        let strict = engine.mode() == ValidationMode::Strict;
        if id.is_empty() {
            return Err("Notification must have ID".to_owned());
        }

        let title = non_empty(json.title);
        let body = non_empty(json.body);
        let badge_count = match json.badge_count {
            Some(count) if count < 0 && strict => {
                return Err("Notification badgeCount must be greater than or equal to 0".to_owned())
            }
            Some(count) if count < 0 => None,
            count => count,
        };
        if title.is_none() && body.is_none() && badge_count.is_none() {
            return Err(
                "Notifications must have one or more of: title, body, or badgeCount.".to_owned(),
            );
        }

        let delivery_days_of_week = match non_empty(json.delivery_days_of_week) {
            Some(days) => parse_days_of_week(&days),
            None => ALL_DAYS.iter().map(|(day, _)| *day).collect(),
        };
        if delivery_days_of_week.is_empty() {
            return Err(
                "Notifications must have at least one day of week valid for delivery.".to_owned(),
            );
        }

        let start = non_empty(json.delivery_time_of_day_start);
        let end = non_empty(json.delivery_time_of_day_end);
        if start.is_some() != end.is_some() {
            return Err("DeliveryTime must have both deliveryTimeOfDayStart and deliveryTimeOfDayEnd defined if either is defined.".to_owned());
        }
        let time_of_day = |value: Option<String>, field: &str, default: u32| match value {
            None => Ok(default),
            Some(value) => match parse_time_of_day(&value) {
                Some(minutes) => Ok(minutes),
                None if strict => Err(format!("Invalid {field}. Expect HH:MM format. Was: {value}")),
                None => {
                    log::warn!(target: "critical_moments", notification = id, field, value = value.as_str();
                        "invalid time of day, using default");
                    Ok(default)
                }
            },
        };
        let delivery_start_minute = time_of_day(start, "deliveryTimeOfDayStart", 0)?;
        let delivery_end_minute = time_of_day(end, "deliveryTimeOfDayEnd", LAST_MINUTE)?;
        if delivery_start_minute > delivery_end_minute {
            return Err("Notifications must have a deliveryTimeOfDayStart before deliveryTimeOfDayEnd.".to_owned());
        }

        if json
            .relevance_score
            .is_some_and(|score| !(0.0..=1.0).contains(&score))
        {
            return Err("Relevance score must be between 0 and 1 if provided.".to_owned());
        }
        let interruption_level = non_empty(json.interruption_level);
        if let (true, Some(level)) = (strict, &interruption_level) {
            if !INTERRUPTION_LEVELS.contains(&level.as_str()) {
                return Err(format!(
                    "Interruption level must be one of {INTERRUPTION_LEVELS:?}, got {level}"
                ));
            }
        }

        let mut schedule_condition = json
            .schedule_condition
            .filter(|condition| !condition.source().is_empty());
        if let Some(condition) = &mut schedule_condition {
            condition
                .prepare(engine)
                .map_err(|_| format!("Invalid condition in notification [{id}]"))?;
        }

        let cancelation_events = json.cancelation_events.unwrap_or_default();
        if cancelation_events.iter().any(String::is_empty) {
            return Err(format!("Notification '{id}' has an blank cancelation event"));
        }

        let ideal_delivery = match json.ideal_delivery_conditions {
            None => None,
            Some(ideal) => {
                let invalid_condition =
                    || format!("Ideal delivery condition invalid for notification with id '{id}'");
                let mut condition = ideal
                    .condition
                    .filter(|condition| !condition.source().is_empty())
                    .ok_or_else(invalid_condition)?;
                condition.prepare(engine).map_err(|_| invalid_condition())?;
                let max_wait = match ideal.max_wait_time_seconds {
                    -1 => None,
                    seconds if seconds >= 1 => TimeDelta::try_seconds(seconds),
                    _ => return Err("Notifications must have a max wait time for ideal delivery condition. Valid values are -1 (forever) or values greater than 0.".to_owned()),
                };
                Some(IdealDelivery {
                    condition,
                    max_wait,
                })
            }
        };

        let delivery_time = DeliveryTime::from_json(json.delivery_time, strict)
            .map_err(|err| format!("Notification has invalid delivery time: {err}"))?;

        Ok(Notification {
            id: id.to_owned(),
            title,
            body,
            badge_count,
            tap_action_name: non_empty(json.tap_action_name),
            sound: non_empty(json.sound),
            launch_image_name: non_empty(json.launch_image_name),
            relevance_score: json.relevance_score,
            interruption_level,
            schedule_condition,
            delivery_time,
            delivery_days_of_week,
            delivery_start_minute,
            delivery_end_minute,
            ideal_delivery,
            cancelation_events,
        })
    }

    /// Identifier for the host's notification system.
    pub fn unique_id(&self) -> String {
        format!("{UNIQUE_ID_PREFIX}{}", self.id)
    }

    /// Event the host sends when the notification is delivered.
    pub fn delivered_event_name(&self) -> String {
        format!("notifications:delivered:{}", self.unique_id())
    }

    /// Whether `time` is on an allowed day and within the allowed time of day.
    pub fn allows_delivery_at<Tz: TimeZone>(&self, time: &DateTime<Tz>) -> bool {
        if !self.delivery_days_of_week.contains(&time.weekday()) {
            return false;
        }
        let minute = time.hour() * 60 + time.minute();
        (self.delivery_start_minute..=self.delivery_end_minute).contains(&minute)
    }
}
