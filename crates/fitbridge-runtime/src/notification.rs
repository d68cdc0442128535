//! Status notification
//!
//! One line summarizing the fleet, taken from the connected manager whose
//! device kind has the highest notification priority.

use tracing::info;

use crate::manager::DeviceManager;

/// Platform surface the status line is pushed to
pub trait NotificationSink: Send {
    fn notify(&mut self, text: &str);

    /// Nothing connected anymore
    fn clear(&mut self) {}
}

/// Logs the status line whenever it changes
#[derive(Debug, Default)]
pub struct TracingNotifications {
    last: Option<String>,
}

impl NotificationSink for TracingNotifications {
    fn notify(&mut self, text: &str) {
        if self.last.as_deref() != Some(text) {
            info!("Notification: {}", text);
            self.last = Some(text.to_string());
        }
    }

    fn clear(&mut self) {
        if self.last.take().is_some() {
            info!("Notification cleared");
        }
    }
}

/// Text for the notification, if any manager is connected with a sample
///
/// Ties on priority go to the lower `Device.order`.
pub fn pick_notification<'a, I>(managers: I) -> Option<String>
where
    I: IntoIterator<Item = &'a DeviceManager>,
{
    managers
        .into_iter()
        .filter(|m| m.state().is_connected())
        .filter_map(|m| {
            let sample = m.last_sample()?;
            let text = m.kind().notification_text(&m.device().alias, sample)?;
            Some((m.kind().notification_priority(), -m.device().order, text))
        })
        .max_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)))
        .map(|(_, _, text)| text)
}
