use anyhow::{Context, Result};
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use std::env;

#[derive(Debug, Clone)]
struct SmtpSettings {
    host: String,
    username: String,
    password: String,
    from: String,
    to: String,
}

impl SmtpSettings {
    fn from_env() -> Option<Self> {
        let var = |key: &str| env::var(key).ok().filter(|v| !v.trim().is_empty());
        Some(Self {
            host: var("SMTP_HOST")?,
            username: var("SMTP_USERNAME")?,
            password: var("SMTP_PASSWORD")?,
            from: var("ALERT_EMAIL_FROM")?,
            to: var("ALERT_EMAIL_TO")?,
        })
    }
}

/// Plain-text alert mail over SMTP. Without SMTP settings in the environment
/// every send is a no-op.
#[derive(Debug, Clone)]
pub struct EmailClient {
    settings: Option<SmtpSettings>,
}

impl Default for EmailClient {
    fn default() -> Self {
        Self::new()
    }
}

impl EmailClient {
    pub fn new() -> Self {
        Self {
            settings: SmtpSettings::from_env(),
        }
    }

    pub fn disabled() -> Self {
        Self { settings: None }
    }

    pub fn is_configured(&self) -> bool {
        self.settings.is_some()
    }

    pub fn send(&self, subject: &str, body: &str) {
        let settings = match &self.settings {
            Some(s) => s,
            None => {
                log::debug!("[ALERT] SMTP not configured, email '{}' not sent", subject);
                return;
            }
        };
        if let Err(err) = Self::deliver(settings, subject, body) {
            log::warn!("[ALERT] failed to send email '{}': {:?}", subject, err);
        }
    }

    fn deliver(settings: &SmtpSettings, subject: &str, body: &str) -> Result<()> {
        let from: Mailbox = settings
            .from
            .parse()
            .with_context(|| format!("invalid ALERT_EMAIL_FROM {}", settings.from))?;
        let mut builder = Message::builder()
            .from(from)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN);
        for to in settings.to.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let mailbox: Mailbox = to
                .parse()
                .with_context(|| format!("invalid ALERT_EMAIL_TO {}", to))?;
            builder = builder.to(mailbox);
        }
        let email = builder
            .body(body.to_string())
            .context("failed to build alert email")?;

        let mailer = SmtpTransport::relay(&settings.host)
            .with_context(|| format!("invalid SMTP_HOST {}", settings.host))?
            .credentials(Credentials::new(
                settings.username.clone(),
                settings.password.clone(),
            ))
            .build();
        mailer.send(&email).context("SMTP send failed")?;
        Ok(())
    }
}
