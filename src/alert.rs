use crate::telemetry::{local_today, Today};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// Receives alert descriptions for display.
///
/// Called while the connection manager holds its state lock; implementations
/// must not call back into the manager.
pub trait AlertNotifier: Send + Sync {
    fn notify(&self, description: &str);
}

impl<F> AlertNotifier for F
where
    F: Fn(&str) + Send + Sync,
{
    fn notify(&self, description: &str) {
        self(description)
    }
}

/// Default notifier: alerts end up in the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl AlertNotifier for LogNotifier {
    fn notify(&self, description: &str) {
        warn!(alert = %description, "meter alert");
    }
}

/// When the session alert count is reset besides an explicit `reset()`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertResetPolicy {
    #[default]
    Never,
    OnTargetChange,
    Daily,
}

/// Session alert counter plus forwarding hook.
pub struct AlertSink {
    count: u64,
    policy: AlertResetPolicy,
    counted_day: Option<NaiveDate>,
    notifier: Arc<dyn AlertNotifier>,
    today: Today,
}

impl AlertSink {
    pub fn new(policy: AlertResetPolicy, notifier: Arc<dyn AlertNotifier>) -> Self {
        Self::with_clock(policy, notifier, Arc::new(local_today))
    }

    pub fn with_clock(
        policy: AlertResetPolicy,
        notifier: Arc<dyn AlertNotifier>,
        today: Today,
    ) -> Self {
        Self {
            count: 0,
            policy,
            counted_day: None,
            notifier,
            today,
        }
    }

    /// Count one alert and forward its description. Returns the new count.
    pub fn push_alert(&mut self, description: &str) -> u64 {
        if self.policy == AlertResetPolicy::Daily {
            let today = (self.today)();
            if self.counted_day != Some(today) {
                self.count = 0;
                self.counted_day = Some(today);
            }
        }

        self.count += 1;
        self.notifier.notify(description);
        self.count
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn policy(&self) -> AlertResetPolicy {
        self.policy
    }

    /// Explicit session clear.
    pub fn reset(&mut self) {
        self.count = 0;
        self.counted_day = None;
    }

    pub(crate) fn on_target_change(&mut self) {
        if self.policy == AlertResetPolicy::OnTargetChange {
            self.reset();
        }
    }
}

impl fmt::Debug for AlertSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlertSink")
            .field("count", &self.count)
            .field("policy", &self.policy)
            .field("counted_day", &self.counted_day)
            .finish_non_exhaustive()
    }
}
