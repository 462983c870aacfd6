use chrono::{DateTime, Days, NaiveDate, TimeDelta, TimeZone, Utc};

use crate::{
    conditions::Environment,
    history::HistoryStore,
    notifications::{DeliveryTime, EventInstance, IdealDelivery, Notification},
};

/// Background checks run at most this often.
const CHECK_DELAY_MINUTES: i64 = 15;
/// Margin after a delivery window opens before a background check runs.
const FILTER_BUFFER_MINUTES: i64 = 2;

/// A notification and when to deliver it.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledNotification {
    /// The notification.
    pub notification: Notification,
    /// Delivery time. Times in the past mean the notification was due already.
    pub scheduled_at: DateTime<Utc>,
}

/// What the host should have scheduled with the system notification center.
///
/// Plans are derived from history alone, so planning again for the same instant produces the
/// same plan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NotificationPlan {
    /// Notifications to schedule.
    pub scheduled: Vec<ScheduledNotification>,
    /// Notifications to remove if they are scheduled.
    pub unscheduled: Vec<Notification>,
    /// When the host should wake up and plan again, to evaluate ideal delivery conditions.
    pub earliest_background_check: Option<DateTime<Utc>>,
}

impl NotificationPlan {
    /// Whether `event_name` can change the plan: it cancels a scheduled notification, or it
    /// is the delivery event of a notification.
    pub fn needs_update_for_event<'n>(
        &self,
        event_name: &str,
        notifications: impl IntoIterator<Item = &'n Notification>,
    ) -> bool {
        let cancels_scheduled = self.scheduled.iter().any(|scheduled| {
            scheduled
                .notification
                .cancelation_events
                .iter()
                .any(|name| name == event_name)
        });
        if cancels_scheduled {
            return true;
        }

        notifications.into_iter().any(|notification| {
            let DeliveryTime::AfterEvent {
                event_name: name,
                instance,
                ..
            } = &notification.delivery_time
            else {
                return false;
            };
            if name != event_name {
                return false;
            }
            match instance {
                EventInstance::Latest | EventInstance::LatestOnce => true,
                EventInstance::First => !self
                    .scheduled
                    .iter()
                    .any(|scheduled| scheduled.notification.id == notification.id),
                EventInstance::Unknown(_) => false,
            }
        })
    }
}

/// Computes delivery times from history and the current properties.
pub struct NotificationPlanner<'a> {
    history: &'a HistoryStore,
    env: &'a dyn Environment,
}

impl<'a> NotificationPlanner<'a> {
    /// Planner reading events from `history` and evaluating conditions against `env`.
    pub fn new(history: &'a HistoryStore, env: &'a dyn Environment) -> Self {
        NotificationPlanner { history, env }
    }

    /// Plan every notification as of `now`. Delivery windows are in `now`'s time zone.
    pub fn plan<'n, Tz: TimeZone>(
        &self,
        notifications: impl IntoIterator<Item = &'n Notification>,
        now: &DateTime<Tz>,
    ) -> NotificationPlan {
        let mut plan = NotificationPlan::default();
        for notification in notifications {
            let (delivery, check) = self.delivery_time(notification, now);
            match delivery {
                Some(at) => plan.scheduled.push(ScheduledNotification {
                    notification: notification.clone(),
                    scheduled_at: at.with_timezone(&Utc),
                }),
                None => plan.unscheduled.push(notification.clone()),
            }
            if let Some(check) = check.map(|check| check.with_timezone(&Utc)) {
                plan.earliest_background_check = Some(match plan.earliest_background_check {
                    Some(earliest) => earliest.min(check),
                    None => check,
                });
            }
        }
        log::debug!(target: "critical_moments",
            scheduled = plan.scheduled.len(), unscheduled = plan.unscheduled.len();
            "planned notifications");
        plan
    }

    /// Delivery time of `notification` and when to check again in the background. The base
    /// time comes from the delivery time and history, is moved by the ideal delivery window
    /// and finally moved forward into the allowed days and times.
    pub fn delivery_time<Tz: TimeZone>(
        &self,
        notification: &Notification,
        now: &DateTime<Tz>,
    ) -> (Option<DateTime<Tz>>, Option<DateTime<Tz>>) {
        let base = self.base_delivery_time(notification, now);
        let (ideal, check) = self.shift_for_ideal_window(notification, base, now);
        (ideal.map(|time| shift_for_filters(notification, time)), check)
    }

    fn is_canceled(&self, notification: &Notification) -> bool {
        notification.cancelation_events.iter().any(|name| {
            match self.history.event_count_with_limit(name, 1) {
                Ok(count) => count > 0,
                Err(err) => {
                    log::warn!(target: "critical_moments",
                        notification = notification.id.as_str(), event = name.as_str();
                        "failed to check cancelation event, treating as canceled: {err}");
                    true
                }
            }
        })
    }

    fn base_delivery_time<Tz: TimeZone>(
        &self,
        notification: &Notification,
        now: &DateTime<Tz>,
    ) -> Option<DateTime<Tz>> {
        if self.is_canceled(notification) {
            return None;
        }
        if let Some(condition) = &notification.schedule_condition {
            match condition.evaluate(self.env) {
                Ok(true) => {}
                Ok(false) => return None,
                Err(err) => {
                    log::warn!(target: "critical_moments", notification = notification.id.as_str();
                        "schedule condition failed: {err}");
                    return None;
                }
            }
        }

        let tz = now.timezone();
        match &notification.delivery_time {
            DeliveryTime::At(at) => (*now <= *at).then(|| at.with_timezone(&tz)),
            DeliveryTime::AfterEvent {
                event_name,
                offset,
                instance,
            } => {
                let event_time = match instance {
                    EventInstance::Latest => self.history.latest_event_time(event_name),
                    EventInstance::First => self.history.first_event_time(event_name),
                    EventInstance::LatestOnce if offset.is_zero() => {
                        self.history.first_event_time(event_name)
                    }
                    EventInstance::LatestOnce => self
                        .history
                        .all_event_times(event_name)
                        .map(|times| latest_once_event_time(&times, *offset)),
                    EventInstance::Unknown(_) => return None,
                };
                match event_time {
                    Ok(time) => time?
                        .checked_add_signed(*offset)
                        .map(|time| time.with_timezone(&tz)),
                    Err(err) => {
                        log::warn!(target: "critical_moments",
                            notification = notification.id.as_str(), event = event_name.as_str();
                            "failed to read delivery event time: {err}");
                        None
                    }
                }
            }
        }
    }

    /// Inside the ideal window with a passing condition the notification is delivered now.
    /// Otherwise it waits until the end of the window, or forever.
    fn shift_for_ideal_window<Tz: TimeZone>(
        &self,
        notification: &Notification,
        base: Option<DateTime<Tz>>,
        now: &DateTime<Tz>,
    ) -> (Option<DateTime<Tz>>, Option<DateTime<Tz>>) {
        let Some(base) = base else {
            return (None, None);
        };
        let Some(ideal) = &notification.ideal_delivery else {
            return (Some(base), None);
        };

        if in_ideal_window(notification, ideal, &base, now)
            && matches!(ideal.condition.evaluate(self.env), Ok(true))
        {
            return (Some(now.clone()), None);
        }

        let shifted = ideal
            .max_wait
            .and_then(|max_wait| base.checked_add_signed(max_wait));
        let check = background_check_time(notification, now, shifted.as_ref());
        (shifted, check)
    }
}

fn in_ideal_window<Tz: TimeZone>(
    notification: &Notification,
    ideal: &IdealDelivery,
    base: &DateTime<Tz>,
    now: &DateTime<Tz>,
) -> bool {
    if base > now {
        return false;
    }
    if let Some(max_wait) = ideal.max_wait {
        if now.clone().signed_duration_since(base) > max_wait {
            return false;
        }
    }
    notification.allows_delivery_at(now)
}

/// First background check at least 15 minutes from now that falls in the delivery
/// window. `None` when that is after the notification is delivered anyway.
pub(crate) fn background_check_time<Tz: TimeZone>(
    notification: &Notification,
    now: &DateTime<Tz>,
    delivery: Option<&DateTime<Tz>>,
) -> Option<DateTime<Tz>> {
    let mut check = now.clone().checked_add_signed(TimeDelta::minutes(CHECK_DELAY_MINUTES))?;
    let filtered = shift_for_filters(notification, check.clone());
    if filtered > check {
        check = filtered.checked_add_signed(TimeDelta::minutes(FILTER_BUFFER_MINUTES))?;
    }
    match delivery {
        Some(delivery) if check > *delivery => None,
        _ => Some(check),
    }
}

/// Event time a `latest-once` notification is measured from: the first event that is not
/// followed by another event before its delivery time.
pub(crate) fn latest_once_event_time(
    times: &[DateTime<Utc>],
    offset: TimeDelta,
) -> Option<DateTime<Utc>> {
    let (&first, rest) = times.split_first()?;
    let mut last = first;
    for &time in rest {
        match last.checked_add_signed(offset) {
            Some(delivery) if time > delivery => break,
            _ => last = time,
        }
    }
    Some(last)
}

fn at_minute_of_day<Tz: TimeZone>(tz: &Tz, date: NaiveDate, minute: u32) -> Option<DateTime<Tz>> {
    let naive = date.and_hms_opt(minute / 60, minute % 60, 0)?;
    // Wall times skipped by a DST change resolve to an hour later.
    tz.from_local_datetime(&naive)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(naive + TimeDelta::hours(1))).earliest())
}

/// Move `time` forward, never back, until it is in the notification's allowed time of day and
/// day of week.
pub(crate) fn shift_for_filters<Tz: TimeZone>(
    notification: &Notification,
    time: DateTime<Tz>,
) -> DateTime<Tz> {
    use chrono::{Datelike, Timelike};

    if notification.allows_delivery_at(&time) {
        return time;
    }

    let tz = time.timezone();
    let local = time.naive_local();
    let minute = time.hour() * 60 + time.minute();
    let shifted = if minute < notification.delivery_start_minute {
        at_minute_of_day(&tz, local.date(), notification.delivery_start_minute)
    } else if minute > notification.delivery_end_minute {
        local
            .date()
            .succ_opt()
            .and_then(|date| at_minute_of_day(&tz, date, notification.delivery_start_minute))
    } else {
        None
    };
    let mut time = shifted.unwrap_or(time);

    for _ in 0..7 {
        if notification.delivery_days_of_week.contains(&time.weekday()) {
            break;
        }
        let next = time
            .clone()
            .checked_add_days(Days::new(1))
            .or_else(|| time.clone().checked_add_signed(TimeDelta::days(1)));
        match next {
            Some(next) => time = next,
            None => break,
        }
    }
    time
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeDelta, TimeZone, Utc};
    use serde_json::json;

    use super::{
        background_check_time, latest_once_event_time, shift_for_filters, NotificationPlan,
        NotificationPlanner, ScheduledNotification,
    };
    use crate::{
        conditions::{ConditionEngine, Environment, Value},
        history::{Event, HistoryStore, HistoryStoreConfig},
        notifications::Notification,
    };

    struct Env;

    impl Environment for Env {
        fn property(&self, _name: &str) -> Value {
            Value::Nil
        }

        fn session_random(&self) -> i64 {
            0
        }
    }

    fn notification(id: &str, value: serde_json::Value) -> Notification {
        let json = serde_json::from_value(value).unwrap();
        Notification::from_json(id, json, &ConditionEngine::default()).unwrap()
    }

    fn weekday_mornings() -> Notification {
        // 2024-01-01 was a Monday.
        notification(
            "n",
            json!({
                "title": "t",
                "deliveryTime": {"timestamp": 1},
                "deliveryDaysOfWeek": "Monday",
                "deliveryTimeOfDayStart": "09:00",
                "deliveryTimeOfDayEnd": "17:00"
            }),
        )
    }

    fn utc(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, hour, minute, 0).unwrap()
    }

    fn started_store() -> (tempfile::TempDir, HistoryStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(HistoryStoreConfig::default());
        store.start(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn shifts_into_delivery_window() {
        let n = weekday_mornings();
        assert_eq!(shift_for_filters(&n, utc(1, 10, 30)), utc(1, 10, 30));
        assert_eq!(shift_for_filters(&n, utc(1, 8, 0)), utc(1, 9, 0));
        assert_eq!(shift_for_filters(&n, utc(1, 18, 0)), utc(8, 9, 0));
        assert_eq!(shift_for_filters(&n, utc(2, 8, 0)), utc(8, 9, 0));
        assert_eq!(shift_for_filters(&n, utc(3, 12, 15)), utc(8, 12, 15));
    }

    #[test]
    fn latest_once_picks_first_undelivered_event() {
        let base = utc(1, 0, 0);
        let times = [
            base,
            base + TimeDelta::seconds(10),
            base + TimeDelta::seconds(100),
        ];
        assert_eq!(
            latest_once_event_time(&times, TimeDelta::seconds(60)),
            Some(base + TimeDelta::seconds(10))
        );
        assert_eq!(
            latest_once_event_time(&times, TimeDelta::seconds(1000)),
            Some(base + TimeDelta::seconds(100))
        );
        assert_eq!(latest_once_event_time(&[], TimeDelta::seconds(60)), None);
    }

    #[test]
    fn background_checks_respect_window() {
        let anytime = notification("a", json!({"title": "t", "deliveryTime": {"timestamp": 1}}));
        let now = utc(1, 12, 0);
        assert_eq!(
            background_check_time(&anytime, &now, None),
            Some(utc(1, 12, 15))
        );
        assert_eq!(
            background_check_time(&anytime, &now, Some(&utc(1, 12, 10))),
            None
        );

        let n = weekday_mornings();
        assert_eq!(
            background_check_time(&n, &utc(1, 16, 50), None),
            Some(utc(8, 9, 2))
        );
    }

    #[test]
    fn plans_static_notifications() {
        let (_dir, store) = started_store();
        let future = notification("future", json!({"title": "t", "deliveryTime": {"timestamp": 4102444800i64}}));
        let past = notification("past", json!({"title": "t", "deliveryTime": {"timestamp": 1}}));

        let plan = NotificationPlanner::new(&store, &Env).plan([&future, &past], &Utc::now());
        assert_eq!(
            plan.scheduled,
            [ScheduledNotification {
                notification: future.clone(),
                scheduled_at: DateTime::from_timestamp(4_102_444_800, 0).unwrap(),
            }]
        );
        assert_eq!(plan.unscheduled, [past]);
        assert_eq!(plan.earliest_background_check, None);
    }

    #[test]
    fn plans_event_notifications() {
        let (_dir, store) = started_store();
        let n = notification(
            "follow_up",
            json!({
                "title": "t",
                "deliveryTime": {"eventName": "signup", "eventOffsetSeconds": 3600},
                "cancelationEvents": ["purchase"]
            }),
        );
        let env = Env;
        let planner = NotificationPlanner::new(&store, &env);

        assert_eq!(planner.plan([&n], &Utc::now()).unscheduled.len(), 1);

        store.insert_event(&Event::custom("signup").unwrap()).unwrap();
        let signed_up = store.first_event_time("signup").unwrap().unwrap();
        let plan = planner.plan([&n], &Utc::now());
        assert_eq!(plan.scheduled.len(), 1);
        assert_eq!(plan.scheduled[0].scheduled_at, signed_up + TimeDelta::seconds(3600));

        store.insert_event(&Event::custom("purchase").unwrap()).unwrap();
        assert_eq!(planner.plan([&n], &Utc::now()).unscheduled.len(), 1);
    }

    #[test]
    fn schedule_condition_gates_delivery() {
        let (_dir, store) = started_store();
        let blocked = notification(
            "blocked",
            json!({"title": "t", "deliveryTime": {"timestamp": 4102444800i64}, "scheduleCondition": "false"}),
        );
        let plan = NotificationPlanner::new(&store, &Env).plan([&blocked], &Utc::now());
        assert_eq!(plan.unscheduled, [blocked]);
    }

    #[test]
    fn ideal_delivery_conditions() {
        let (_dir, store) = started_store();
        store.insert_event(&Event::custom("opened").unwrap()).unwrap();
        let opened = store.first_event_time("opened").unwrap().unwrap();
        let ideal = |condition: &str| {
            notification(
                condition,
                json!({
                    "title": "t",
                    "deliveryTime": {"eventName": "opened"},
                    "idealDeliveryConditions": {"condition": condition, "maxWaitTimeSeconds": 3600}
                }),
            )
        };
        let now = Utc::now();
        let planner = NotificationPlanner::new(&store, &Env);

        let plan = planner.plan([&ideal("true")], &now);
        assert_eq!(plan.scheduled[0].scheduled_at, now);
        assert_eq!(plan.earliest_background_check, None);

        let plan = planner.plan([&ideal("false")], &now);
        assert_eq!(plan.scheduled[0].scheduled_at, opened + TimeDelta::seconds(3600));
        assert_eq!(
            plan.earliest_background_check,
            Some(now + TimeDelta::minutes(15))
        );
    }

    #[test]
    fn event_updates() {
        let first = notification(
            "first",
            json!({"title": "t", "deliveryTime": {"eventName": "a", "eventInstance": "first"}}),
        );
        let latest = notification(
            "latest",
            json!({"title": "t", "deliveryTime": {"eventName": "b", "eventInstance": "latest"}, "cancelationEvents": ["c"]}),
        );
        let all = [&first, &latest];

        let empty = NotificationPlan::default();
        assert!(empty.needs_update_for_event("a", all));
        assert!(empty.needs_update_for_event("b", all));
        assert!(!empty.needs_update_for_event("c", all));
        assert!(!empty.needs_update_for_event("other", all));

        let scheduled = |n: &Notification| ScheduledNotification {
            notification: n.clone(),
            scheduled_at: Utc::now(),
        };
        let plan = NotificationPlan {
            scheduled: vec![scheduled(&first), scheduled(&latest)],
            ..NotificationPlan::default()
        };
        assert!(!plan.needs_update_for_event("a", all));
        assert!(plan.needs_update_for_event("b", all));
        assert!(plan.needs_update_for_event("c", all));
    }
}
