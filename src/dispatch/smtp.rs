//! SMTP delivery via lettre.
//!
//! lettre's blocking transport is driven from `spawn_blocking`. The pooled
//! connection lives as long as the [`SmtpMailer`] and is closed on shutdown.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{Message, SmtpTransport, Transport};

use crate::config::{DispatchConfig, SmtpEndpoint};
use crate::dispatch::transport::{Connector, MailTransport, OutboundEmail};
use crate::error::MailError;

const XLSX_CONTENT_TYPE: &str =
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

/// Build a lettre transport for an endpoint.
///
/// `use_ssl` selects implicit TLS; otherwise `use_tls` upgrades with
/// STARTTLS when the server offers it. Certificate checks are relaxed to
/// match the internal relays this tool is deployed against.
fn build_transport(
    endpoint: &SmtpEndpoint,
    config: &DispatchConfig,
) -> Result<SmtpTransport, MailError> {
    let tls = if endpoint.use_ssl || endpoint.use_tls {
        let params = TlsParameters::builder(endpoint.host.clone())
            .dangerous_accept_invalid_certs(true)
            .build_rustls()
            .map_err(|e| MailError::Transport(format!("TLS setup failed: {e}")))?;
        if endpoint.use_ssl {
            Tls::Wrapper(params)
        } else {
            Tls::Opportunistic(params)
        }
    } else {
        Tls::None
    };

    let creds = Credentials::new(endpoint.username.clone(), endpoint.password().to_string());

    Ok(SmtpTransport::builder_dangerous(&endpoint.host)
        .port(endpoint.port)
        .tls(tls)
        .credentials(creds)
        .timeout(Some(config.smtp_timeout))
        .build())
}

fn parse_mailbox(address: &str) -> Result<Mailbox, MailError> {
    address.parse().map_err(|e| MailError::InvalidAddress {
        address: address.to_string(),
        reason: format!("{e}"),
    })
}

/// Convert an [`OutboundEmail`] plus loaded attachment bytes into a lettre message.
fn build_message(
    email: &OutboundEmail,
    attachments: Vec<(String, Vec<u8>)>,
) -> Result<Message, MailError> {
    let mut builder = Message::builder()
        .from(parse_mailbox(&email.from)?)
        .subject(email.subject.clone());
    for to in &email.to {
        builder = builder.to(parse_mailbox(to)?);
    }
    if let Some(cc) = &email.cc {
        builder = builder.cc(parse_mailbox(cc)?);
    }

    let content_type = ContentType::parse(XLSX_CONTENT_TYPE)
        .map_err(|e| MailError::Build(format!("content type: {e}")))?;

    let mut body = MultiPart::mixed().singlepart(SinglePart::html(email.html_body.clone()));
    for (name, bytes) in attachments {
        body = body.singlepart(Attachment::new(name).body(bytes, content_type.clone()));
    }

    builder
        .multipart(body)
        .map_err(|e| MailError::Build(e.to_string()))
}

/// SMTP transport for one run.
pub struct SmtpMailer {
    transport: Mutex<Option<SmtpTransport>>,
}

impl SmtpMailer {
    pub fn new(endpoint: &SmtpEndpoint, config: &DispatchConfig) -> Result<Self, MailError> {
        Ok(Self {
            transport: Mutex::new(Some(build_transport(endpoint, config)?)),
        })
    }

    fn transport(&self) -> Result<SmtpTransport, MailError> {
        self.transport
            .lock()
            .map_err(|_| MailError::Transport("transport lock poisoned".into()))?
            .clone()
            .ok_or_else(|| MailError::Transport("transport already shut down".into()))
    }
}

#[async_trait]
impl MailTransport for SmtpMailer {
    async fn send(&self, email: &OutboundEmail) -> Result<(), MailError> {
        let mut attachments = Vec::with_capacity(email.attachments.len());
        for (path, name) in email.attachments.iter().zip(email.attachment_names()) {
            let bytes = tokio::fs::read(path)
                .await
                .map_err(|source| MailError::Attachment {
                    path: path.clone(),
                    source,
                })?;
            attachments.push((name, bytes));
        }

        let message = build_message(email, attachments)?;
        let transport = self.transport()?;

        tokio::task::spawn_blocking(move || transport.send(&message))
            .await
            .map_err(|e| MailError::SendFailed(format!("send task panicked: {e}")))?
            .map_err(|e| MailError::SendFailed(e.to_string()))?;

        tracing::debug!(subject = %email.subject, "Email sent to {}", email.to.join(", "));
        Ok(())
    }

    async fn shutdown(&self) {
        let transport = match self.transport.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(transport) = transport {
            // Dropping the last handle closes pooled connections, which may block on QUIT.
            let _ = tokio::task::spawn_blocking(move || drop(transport)).await;
        }
    }
}

/// Connector producing [`SmtpMailer`] transports.
#[derive(Debug, Default, Clone, Copy)]
pub struct SmtpConnector;

impl Connector for SmtpConnector {
    fn connect(
        &self,
        endpoint: &SmtpEndpoint,
        config: &DispatchConfig,
    ) -> Result<Arc<dyn MailTransport>, MailError> {
        Ok(Arc::new(SmtpMailer::new(endpoint, config)?))
    }
}

/// Open a connection, authenticate, and close it again.
pub async fn test_connection(
    endpoint: &SmtpEndpoint,
    config: &DispatchConfig,
) -> Result<(), MailError> {
    let transport = build_transport(endpoint, config)?;
    let connected = tokio::task::spawn_blocking(move || transport.test_connection())
        .await
        .map_err(|e| MailError::ConnectionFailed(format!("test task panicked: {e}")))?
        .map_err(|e| MailError::ConnectionFailed(e.to_string()))?;

    if connected {
        Ok(())
    } else {
        Err(MailError::ConnectionFailed("server did not accept the connection".into()))
    }
}
