//! SMTP email channel.

use super::{Message, Sender};
use crate::config::ChannelConfig;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use lettre::message::{header::ContentType, Mailbox};
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use std::fmt;
use tracing::{debug, instrument};

const DEFAULT_SUBJECT: &str = "Modem Relay Notification";

/// How STARTTLS is negotiated when implicit TLS is off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsPolicy {
    Mandatory,
    Opportunistic,
    None,
}

impl TlsPolicy {
    /// Parses a `tls_policy` value. Blank means `Mandatory`.
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_lowercase().as_str() {
            "" | "mandatory" => Ok(Self::Mandatory),
            "opportunistic" => Ok(Self::Opportunistic),
            "none" | "notls" | "no_tls" => Ok(Self::None),
            _ => bail!("unsupported email tls_policy: {:?}", raw),
        }
    }
}

/// Mails the plain-text message to every configured recipient.
pub struct Email {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    host: String,
    port: u16,
    from: Mailbox,
    recipients: Vec<Mailbox>,
    subject: String,
    tls_policy: TlsPolicy,
    ssl: bool,
    authenticated: bool,
}

impl fmt::Debug for Email {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Email")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("from", &self.from.to_string())
            .field("recipients", &self.recipients.len())
            .field("tls_policy", &self.tls_policy)
            .field("ssl", &self.ssl)
            .field("authenticated", &self.authenticated)
            .finish()
    }
}

impl Email {
    pub fn new(config: &ChannelConfig) -> Result<Self> {
        let host = config.smtp_host.trim();
        if host.is_empty() {
            bail!("email smtp_host is required");
        }
        if config.smtp_port == 0 {
            bail!("email smtp_port is required");
        }
        let from = config.from.trim();
        if from.is_empty() {
            bail!("email from is required");
        }
        let from: Mailbox = from
            .parse()
            .with_context(|| format!("invalid email from address {:?}", from))?;
        let recipients = config.recipient_strings();
        if recipients.is_empty() {
            bail!("email recipients are required");
        }
        let recipients = recipients
            .iter()
            .map(|r| {
                r.parse::<Mailbox>()
                    .with_context(|| format!("invalid email recipient {:?}", r))
            })
            .collect::<Result<Vec<_>>>()?;
        let tls_policy = TlsPolicy::parse(&config.tls_policy)?;

        let username = config.smtp_username.trim();
        let password = config.smtp_password.trim();
        if username.is_empty() != password.is_empty() {
            bail!("email smtp_username and smtp_password must be set together");
        }
        let authenticated = !username.is_empty();

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
            .port(config.smtp_port)
            .tls(tls_for(host, config.ssl, tls_policy)?)
            .timeout(Some(config.timeout()));
        if authenticated {
            builder = builder.credentials(Credentials::new(
                username.to_string(),
                password.to_string(),
            ));
        }

        Ok(Self {
            transport: builder.build(),
            host: host.to_string(),
            port: config.smtp_port,
            from,
            recipients,
            subject: config.title_or(DEFAULT_SUBJECT),
            tls_policy,
            ssl: config.ssl,
            authenticated,
        })
    }
}

fn tls_for(host: &str, ssl: bool, policy: TlsPolicy) -> Result<Tls> {
    if !ssl && policy == TlsPolicy::None {
        return Ok(Tls::None);
    }
    let parameters = TlsParameters::new(host.to_string()).context("configuring email TLS")?;
    Ok(match (ssl, policy) {
        (true, _) => Tls::Wrapper(parameters),
        (false, TlsPolicy::Opportunistic) => Tls::Opportunistic(parameters),
        (false, _) => Tls::Required(parameters),
    })
}

#[async_trait]
impl Sender for Email {
    #[instrument(skip_all, fields(host = %self.host, recipients = self.recipients.len()))]
    async fn send(&self, message: &dyn Message) -> Result<()> {
        let mut builder = lettre::Message::builder()
            .from(self.from.clone())
            .subject(self.subject.clone())
            .header(ContentType::TEXT_PLAIN);
        for recipient in &self.recipients {
            builder = builder.to(recipient.clone());
        }
        let email = builder
            .body(message.to_string())
            .context("building email message")?;
        self.transport.send(email).await.context("sending email")?;
        debug!("Email notification sent");
        Ok(())
    }
}
