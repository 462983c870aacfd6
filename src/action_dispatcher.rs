use crate::{config::Action, notifications::NotificationPlan};

/// Host side of the library: presents actions and schedules notifications.
///
/// Conditional actions and actions of unknown types are resolved by the [`Client`](crate::Client)
/// and never reach the dispatcher.
///
/// A closure `Fn(&str, &Action) -> Result<(), String>` can be used as a dispatcher:
///
/// ```
/// # use critical_moments::{config::Action, ActionDispatcher};
/// let dispatcher = |name: &str, action: &Action| -> Result<(), String> {
///     println!("show {name}: {}", action.action_type());
///     Ok(())
/// };
/// # fn takes(_: impl ActionDispatcher) {}
/// # takes(dispatcher);
/// ```
pub trait ActionDispatcher {
    /// Present `action`. `name` is the action's name in the config. Errors are reported
    /// back to the caller and recorded as `action_error:<name>` events.
    fn dispatch(&self, name: &str, action: &Action) -> Result<(), String>;

    /// Whether the device has an app that can open `url`. Backs the `canOpenUrl()` condition
    /// function.
    fn can_open_url(&self, url: &str) -> bool {
        let _ = url;
        false
    }

    /// Called whenever the notification plan changes. The host should schedule every
    /// notification in `plan.scheduled` and remove those in `plan.unscheduled`.
    fn update_notification_plan(&self, plan: &NotificationPlan) {
        let _ = plan;
    }
}

pub(crate) struct NoopActionDispatcher;
impl ActionDispatcher for NoopActionDispatcher {
    fn dispatch(&self, _name: &str, _action: &Action) -> Result<(), String> {
        Ok(())
    }
}

impl<T: Fn(&str, &Action) -> Result<(), String>> ActionDispatcher for T {
    fn dispatch(&self, name: &str, action: &Action) -> Result<(), String> {
        self(name, action)
    }
}
