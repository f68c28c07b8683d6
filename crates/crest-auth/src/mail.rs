//! Outbound mail port.
//!
//! Injectable so the core never depends on a live SMTP relay: production
//! wires [`SmtpMailSender`], dev setups without a relay get
//! [`NoopMailSender`], which logs and skips. Preference gating happens at
//! call sites via `User::wants(kind)` — this port just delivers.

use async_trait::async_trait;
use crest_common::config::MailConfig;
use crest_common::models::user::MailKind;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::sync::Arc;

#[async_trait]
pub trait MailSender: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str, kind: MailKind)
    -> anyhow::Result<()>;
}

/// Real SMTP delivery through lettre.
pub struct SmtpMailSender {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailSender {
    pub fn new(config: &MailConfig) -> anyhow::Result<Self> {
        let mut builder =
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)?
                .port(config.smtp_port);
        if !config.smtp_user.is_empty() {
            builder = builder.credentials(Credentials::new(
                config.smtp_user.clone(),
                config.smtp_pass.clone(),
            ));
        }
        Ok(Self {
            transport: builder.build(),
            from: config.from_address.parse()?,
        })
    }
}

#[async_trait]
impl MailSender for SmtpMailSender {
    async fn send(
        &self,
        to: &str,
        subject: &str,
        body: &str,
        kind: MailKind,
    ) -> anyhow::Result<()> {
        let email = Message::builder()
            .from(self.from.clone())
            .to(to.parse()?)
            .subject(subject)
            .body(body.to_string())?;
        self.transport.send(email).await?;
        tracing::debug!(to, ?kind, "mail dispatched");
        Ok(())
    }
}

/// No relay configured: log the mail and move on. The warning carries the
/// body so operators can read codes out-of-band in dev.
pub struct NoopMailSender;

#[async_trait]
impl MailSender for NoopMailSender {
    async fn send(
        &self,
        to: &str,
        subject: &str,
        body: &str,
        kind: MailKind,
    ) -> anyhow::Result<()> {
        tracing::warn!(to, subject, body, ?kind, "no mail sender configured; skipping delivery");
        Ok(())
    }
}

/// Build the sender the config asks for.
pub fn from_config(config: &MailConfig) -> anyhow::Result<Arc<dyn MailSender>> {
    if config.enabled() {
        Ok(Arc::new(SmtpMailSender::new(config)?))
    } else {
        tracing::warn!("mail.smtp_host is empty; outbound mail disabled");
        Ok(Arc::new(NoopMailSender))
    }
}
