//! SMTP transport — relays rendered messages through an SMTP server via
//! async lettre with STARTTLS. Gmail, Outlook, and custom relays all work
//! with host/port/credentials from the config.

use async_trait::async_trait;

use lettre::message::{header::ContentType, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use evermail_core::config::SmtpConfig;
use evermail_core::error::{DeliveryError, EvermailError, Result};
use evermail_core::traits::MailTransport;
use evermail_core::types::{Receipt, RenderedMessage};

pub struct SmtpTransport {
    from: Mailbox,
    mailer: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpTransport {
    pub fn new(config: SmtpConfig) -> Result<Self> {
        let from: Mailbox = config
            .from
            .parse()
            .map_err(|e| EvermailError::Config(format!("invalid smtp.from: {e}")))?;

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
            .map_err(|e| EvermailError::Config(format!("SMTP relay {}: {e}", config.host)))?
            .port(config.port);
        if !config.username.is_empty() {
            builder = builder.credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ));
        }

        Ok(Self {
            from,
            mailer: builder.build(),
        })
    }

    fn build_email(&self, message: &RenderedMessage) -> std::result::Result<Message, DeliveryError> {
        let to: Mailbox = message
            .to
            .parse()
            .map_err(|e| DeliveryError::Permanent(format!("invalid address '{}': {e}", message.to)))?;

        let builder = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(message.subject.clone());

        let email = match &message.text {
            Some(text) => builder.multipart(
                MultiPart::alternative()
                    .singlepart(SinglePart::plain(text.clone()))
                    .singlepart(SinglePart::html(message.html.clone())),
            ),
            None => builder
                .header(ContentType::TEXT_HTML)
                .body(message.html.clone()),
        };
        email.map_err(|e| DeliveryError::Permanent(format!("build email: {e}")))
    }
}

#[async_trait]
impl MailTransport for SmtpTransport {
    fn name(&self) -> &str {
        "smtp"
    }

    async fn send(
        &self,
        message: &RenderedMessage,
    ) -> std::result::Result<Receipt, DeliveryError> {
        let email = self.build_email(message)?;
        let response = self.mailer.send(email).await.map_err(|e| {
            // lettre classifies 5xx SMTP responses as permanent.
            if e.is_permanent() {
                DeliveryError::Permanent(format!("SMTP rejected: {e}"))
            } else {
                DeliveryError::Transient(format!("SMTP send: {e}"))
            }
        })?;

        // Queue id from the server's 250 line when it sends one.
        let reply = response.message().collect::<Vec<_>>().join(" ");
        let message_id = reply
            .split_whitespace()
            .last()
            .map(String::from)
            .unwrap_or_else(|| format!("smtp-{}", uuid::Uuid::new_v4()));
        tracing::info!("📤 SMTP accepted message for {}", message.to);
        Ok(Receipt { message_id })
    }
}
