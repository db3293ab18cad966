use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use log::debug;

use crate::config::SmtpConfig;
use crate::notify::{Notification, Notifier, NotifyError};

/// Port on which relays expect TLS from the first byte.
const IMPLICIT_TLS_PORT: u16 = 465;

pub struct EmailNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl EmailNotifier {
    pub fn new(config: &SmtpConfig) -> Result<Self, NotifyError> {
        let host = config
            .host
            .as_deref()
            .filter(|h| !h.is_empty())
            .ok_or(NotifyError::NotConfigured)?;
        let sender = config.sender().ok_or(NotifyError::NotConfigured)?;
        let from: Mailbox = sender
            .parse()
            .map_err(|_| NotifyError::Address(sender.to_string()))?;

        let builder = if config.port == IMPLICIT_TLS_PORT {
            AsyncSmtpTransport::<Tokio1Executor>::relay(host)
        } else if config.starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
        } else {
            Ok(AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host))
        }
        .map_err(|e| NotifyError::Transport(e.to_string()))?;

        let mut builder = builder.port(config.port);
        if let (Some(user), Some(password)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(user.clone(), password.clone()));
        }

        Ok(EmailNotifier {
            transport: builder.build(),
            from,
        })
    }

    pub fn message(&self, to: &str, notification: &Notification) -> Result<Message, NotifyError> {
        let to: Mailbox = to.parse().map_err(|_| NotifyError::Address(to.to_string()))?;
        Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(notification.subject())
            .header(ContentType::TEXT_PLAIN)
            .body(notification.body())
            .map_err(|e| NotifyError::Message(e.to_string()))
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    fn channel(&self) -> &'static str {
        "email"
    }

    async fn send(&self, to: &str, notification: &Notification) -> Result<(), NotifyError> {
        let message = self.message(to, notification)?;
        let response = self
            .transport
            .send(message)
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;
        debug!("SMTP accepted message to {}: {:?}", to, response.code());
        Ok(())
    }
}
