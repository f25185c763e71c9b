//! Notification surface: the presentation side of errors, open circuits and
//! alerts. The core only decides *when* to notify; rendering and dismissal
//! belong to the [`Notifier`] implementation.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info, warn};

use crate::alert::Alert;
use crate::util::lock;
use crate::TtsError;

/// Manual retry hook attached to an error notice.
pub type RetryAction = Arc<dyn Fn() + Send + Sync>;

const ALERT_NOTICE_DURATION: Duration = Duration::from_secs(10);
const MAX_NOTICES: usize = 20;

pub trait Notifier: Send + Sync {
    fn show_error(&self, error: &TtsError, on_retry: RetryAction);

    fn show_circuit_open(&self, provider: &str, cooldown: Duration);

    fn show_alert(&self, alert: &Alert);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// A rendered notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub title: String,
    pub message: String,
    /// Zero means sticky until dismissed
    pub duration: Duration,
    pub retryable: bool,
}

impl Notice {
    pub fn error(error: &TtsError) -> Self {
        Self {
            level: NoticeLevel::Error,
            title: "Voice playback failed".to_string(),
            message: error.to_string(),
            duration: Duration::ZERO,
            retryable: true,
        }
    }

    pub fn circuit_open(provider: &str, cooldown: Duration) -> Self {
        let secs = cooldown.as_millis().div_ceil(1000);
        Self {
            level: NoticeLevel::Warning,
            title: "Voice service paused".to_string(),
            message: format!("{} is temporarily unavailable, retrying in {}s", provider, secs),
            duration: cooldown,
            retryable: false,
        }
    }

    /// `None` for alert kinds that have their own notice (circuit open).
    pub fn alert(alert: &Alert) -> Option<Self> {
        match alert {
            Alert::HighErrorRate { rate, .. } => Some(Self {
                level: NoticeLevel::Warning,
                title: "Voice service unstable".to_string(),
                message: format!(
                    "service unstable, recovering automatically ({:.0}% errors)",
                    rate * 100.0
                ),
                duration: ALERT_NOTICE_DURATION,
                retryable: false,
            }),
            Alert::CircuitOpen { .. } => None,
        }
    }
}

/// Headless notifier that renders notices to the log and keeps the most
/// recent ones (with their retry hook) for inspection.
#[derive(Default)]
pub struct TracingNotifier {
    notices: Mutex<VecDeque<Notice>>,
    last_retry: Mutex<Option<RetryAction>>,
}

impl TracingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn notices(&self) -> Vec<Notice> {
        lock(&self.notices).iter().cloned().collect()
    }

    /// Invoke the retry hook of the latest error notice, as a user clicking
    /// "retry" would. Returns false when there is nothing to retry.
    pub fn retry_last(&self) -> bool {
        let action = lock(&self.last_retry).take();
        match action {
            Some(action) => {
                action();
                true
            }
            None => false,
        }
    }

    pub fn dismiss_all(&self) {
        lock(&self.notices).clear();
        *lock(&self.last_retry) = None;
    }

    fn push(&self, notice: Notice) {
        match notice.level {
            NoticeLevel::Error => {
                error!(target: "tts.notify", title = %notice.title, "{}", notice.message)
            }
            NoticeLevel::Warning => {
                warn!(target: "tts.notify", title = %notice.title, duration_ms = notice.duration.as_millis() as u64, "{}", notice.message)
            }
            NoticeLevel::Info | NoticeLevel::Success => {
                info!(target: "tts.notify", title = %notice.title, "{}", notice.message)
            }
        }
        let mut notices = lock(&self.notices);
        notices.push_back(notice);
        while notices.len() > MAX_NOTICES {
            notices.pop_front();
        }
    }
}

impl Notifier for TracingNotifier {
    fn show_error(&self, error: &TtsError, on_retry: RetryAction) {
        self.push(Notice::error(error));
        *lock(&self.last_retry) = Some(on_retry);
    }

    fn show_circuit_open(&self, provider: &str, cooldown: Duration) {
        self.push(Notice::circuit_open(provider, cooldown));
    }

    fn show_alert(&self, alert: &Alert) {
        if let Some(notice) = Notice::alert(alert) {
            self.push(notice);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn circuit_notice_names_provider_and_seconds() {
        let n = Notice::circuit_open("cloud", Duration::from_millis(5000));
        assert_eq!(n.level, NoticeLevel::Warning);
        assert!(n.message.contains("cloud"));
        assert!(n.message.contains('5'));
        assert_eq!(n.duration, Duration::from_millis(5000));
    }

    #[test]
    fn error_notice_is_sticky_and_retryable() {
        let notifier = TracingNotifier::new();
        let clicked = Arc::new(AtomicBool::new(false));
        let flag = clicked.clone();
        notifier.show_error(
            &TtsError::AllProvidersFailed,
            Arc::new(move || flag.store(true, Ordering::SeqCst)),
        );

        let notices = notifier.notices();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].duration, Duration::ZERO);
        assert!(notices[0].retryable);

        assert!(notifier.retry_last());
        assert!(clicked.load(Ordering::SeqCst));
        assert!(!notifier.retry_last());
    }

    #[test]
    fn only_error_rate_alerts_render() {
        let notifier = TracingNotifier::new();
        notifier.show_alert(&Alert::CircuitOpen {
            provider: "cloud".into(),
            cooldown_ms: 1000,
            until_ms: None,
            timestamp_ms: 0,
        });
        notifier.show_alert(&Alert::HighErrorRate {
            rate: 0.8,
            failures: 4,
            total: 5,
            timestamp_ms: 0,
        });
        let notices = notifier.notices();
        assert_eq!(notices.len(), 1);
        assert!(notices[0].message.contains("recovering automatically"));
        assert_eq!(notices[0].duration, Duration::from_secs(10));
    }
}
