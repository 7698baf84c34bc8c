use crate::email_client::EmailClient;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

// Repeats of the same alert context inside this window only hit the log.
const EMAIL_QUIET_PERIOD: Duration = Duration::from_secs(15 * 60);

static ALERT_NOTIFIER: Lazy<AlertNotifier> = Lazy::new(AlertNotifier::new);

/// Raise an operator alert: an `[ALERT]` error line plus an email when SMTP
/// is configured.
pub fn notify_alert(context: &str, detail: &str) {
    ALERT_NOTIFIER.notify(context, detail);
}

struct AlertNotifier {
    agent_name: String,
    last_sent: Mutex<HashMap<String, Instant>>,
}

impl AlertNotifier {
    fn new() -> Self {
        let agent_name = std::env::var("STATARB_AGENT_NAME").unwrap_or_default();
        Self {
            agent_name,
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    fn should_email(&self, context: &str, now: Instant) -> bool {
        let mut last_sent = match self.last_sent.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match last_sent.get(context) {
            Some(prev) if now.duration_since(*prev) < EMAIL_QUIET_PERIOD => false,
            _ => {
                last_sent.insert(context.to_string(), now);
                true
            }
        }
    }

    fn notify(&self, context: &str, detail: &str) {
        log::error!("[ALERT] {}: {}", context, detail);
        if !self.should_email(context, Instant::now()) {
            return;
        }
        let subject = if self.agent_name.is_empty() {
            format!("[statarb] {}", context)
        } else {
            format!("[{}] {}", self.agent_name, context)
        };
        let body = format!(
            "Manual attention may be required.\nContext: {}\nDetail: {}",
            context, detail
        );
        let client = EmailClient::new();
        if client.is_configured() {
            client.send(&subject, &body);
            log::warn!("[ALERT] email notification sent for '{}'", context);
        }
    }
}
