use async_trait::async_trait;
use lettre::message::{header, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use crate::config::SmtpConfig;
use crate::db::models::{Channel, EmailProviderConfig, Notification, Template, User};

use super::{Provider, ProviderError, ProviderErrorKind, ProviderSendResult, SendContext};

/// Email delivery. Per-app `ApplicationSettings::email_provider_config`
/// overrides the process-wide `SmtpConfig` default; `Sendgrid` is an
/// interface contract only, its call is simulated.
pub struct EmailProvider {
    default_config: SmtpConfig,
}

impl EmailProvider {
    pub fn new(default_config: SmtpConfig) -> Self {
        Self { default_config }
    }

    fn build_message(
        &self,
        from_address: &str,
        to: &str,
        subject: &str,
        body: &str,
    ) -> Result<Message, ProviderError> {
        let from = from_address
            .parse()
            .map_err(|e| ProviderError::new(ProviderErrorKind::Invalid, format!("bad from address: {e}")))?;
        let to = to
            .parse()
            .map_err(|e| ProviderError::new(ProviderErrorKind::Invalid, format!("bad recipient address: {e}")))?;

        let multipart = MultiPart::alternative().singlepart(
            SinglePart::builder()
                .header(header::ContentType::TEXT_PLAIN)
                .body(body.to_string()),
        );

        Message::builder()
            .from(from)
            .to(to)
            .subject(subject)
            .multipart(multipart)
            .map_err(|e| ProviderError::new(ProviderErrorKind::Invalid, e.to_string()))
    }

    async fn send_via_smtp(
        &self,
        host: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
        message: Message,
    ) -> Result<(), ProviderError> {
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
            .map_err(|e| ProviderError::new(ProviderErrorKind::Network, e.to_string()))?
            .port(port);

        if let (Some(user), Some(pass)) = (username, password) {
            builder = builder.credentials(Credentials::new(user.to_string(), pass.to_string()));
        }

        let mailer = builder.build();

        mailer
            .send(message)
            .await
            .map(|_| ())
            .map_err(classify_smtp_error)
    }

    async fn send_via_sendgrid(
        &self,
        notification_id: &str,
        _api_key: &str,
    ) -> Result<ProviderSendResult, ProviderError> {
        Ok(ProviderSendResult::accepted(Some(format!(
            "sendgrid-sim-{notification_id}"
        ))))
    }
}

#[async_trait]
impl Provider for EmailProvider {
    async fn send(
        &self,
        ctx: &SendContext,
        notification: &Notification,
        user: &User,
        _template: Option<&Template>,
        rendered_subject: Option<&str>,
        rendered_body: &str,
    ) -> Result<ProviderSendResult, ProviderError> {
        let recipient = user
            .email
            .as_deref()
            .ok_or_else(|| ProviderError::new(ProviderErrorKind::Invalid, "user has no email on file"))?;

        let subject = rendered_subject.unwrap_or("Notification");

        if let Some(EmailProviderConfig::Sendgrid { api_key }) = &ctx.app_email_provider_config {
            return self.send_via_sendgrid(&notification.id, api_key).await;
        }

        let (host, port, username, password, from_address) =
            match &ctx.app_email_provider_config {
                Some(EmailProviderConfig::Smtp {
                    host,
                    port,
                    username,
                    password,
                }) => (
                    host.clone(),
                    *port,
                    username.clone(),
                    password.clone(),
                    self.default_config.from_address.clone(),
                ),
                _ => {
                    let host = self.default_config.host.clone().ok_or_else(|| {
                        ProviderError::new(ProviderErrorKind::Auth, "no SMTP host configured")
                    })?;
                    (
                        host,
                        self.default_config.port,
                        self.default_config.username.clone(),
                        self.default_config.password.clone(),
                        self.default_config.from_address.clone(),
                    )
                }
            };

        let message = self.build_message(&from_address, recipient, subject, rendered_body)?;
        self.send_via_smtp(&host, port, username.as_deref(), password.as_deref(), message)
            .await?;

        Ok(ProviderSendResult::accepted(None))
    }

    fn supported_channel(&self) -> Channel {
        Channel::Email
    }
}

fn classify_smtp_error(e: lettre::transport::smtp::Error) -> ProviderError {
    if e.is_permanent() {
        ProviderError::new(ProviderErrorKind::Auth, e.to_string())
    } else if e.is_timeout() {
        ProviderError::new(ProviderErrorKind::Timeout, e.to_string())
    } else {
        ProviderError::new(ProviderErrorKind::Network, e.to_string())
    }
}
