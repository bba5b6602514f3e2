//! Email delivery for the email notification sink.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use minijinja::{context, Environment};
use std::sync::LazyLock;
use tracing::debug;

use ingest_core::{Error, JobEvent, Result};

use crate::config::{EmailConfig, SmtpConfig};

/// A rendered HTML email.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub subject: String,
    pub html: String,
}

impl EmailMessage {
    /// Render the summary email for one job event.
    pub fn for_event(event: &JobEvent, config: &EmailConfig) -> Result<Self> {
        Ok(Self {
            from: config.from.clone(),
            to: config.recipients(),
            cc: config.cc_recipients(),
            subject: format!("{} [{}] {}", config.subject, event.status, event.label()),
            html: render_html(event)?,
        })
    }
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> Result<()>;
}

/// Plain SMTP without TLS or auth, as used with MailHog.
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpMailer {
    pub fn new(config: &SmtpConfig) -> Self {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(config.host.as_str())
            .port(config.port)
            .build();
        Self { transport }
    }
}

fn mailbox(address: &str) -> Result<Mailbox> {
    address
        .parse()
        .map_err(|e| Error::sink(format!("invalid address {address:?}: {e}")))
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, message: &EmailMessage) -> Result<()> {
        let mut builder = Message::builder()
            .from(mailbox(&message.from)?)
            .subject(message.subject.clone())
            .header(ContentType::TEXT_HTML);
        for to in &message.to {
            builder = builder.to(mailbox(to)?);
        }
        for cc in &message.cc {
            builder = builder.cc(mailbox(cc)?);
        }

        let email = builder
            .body(message.html.clone())
            .map_err(|e| Error::sink(format!("failed to build email: {e}")))?;

        self.transport
            .send(email)
            .await
            .map_err(|e| Error::sink(format!("smtp send failed: {e}")))?;

        debug!(to = ?message.to, cc = ?message.cc, "Email sent");
        Ok(())
    }
}

const JOB_EVENT_TEMPLATE: &str = "job_event.html";

// `.html` templates are auto-escaped.
static TEMPLATES: LazyLock<Environment<'static>> = LazyLock::new(|| {
    let mut env = Environment::new();
    if let Err(e) = env.add_template(
        JOB_EVENT_TEMPLATE,
        r#"<html><body><h3>Stop and search ingest: {{ label }}</h3><table>
{%- for name, value in rows %}<tr><th align="left">{{ name }}</th><td>{{ value }}</td></tr>{% endfor -%}
</table></body></html>"#,
    ) {
        tracing::error!(error = %e, "Email template failed to compile");
    }
    env
});

pub fn render_html(event: &JobEvent) -> Result<String> {
    let mut rows = vec![
        ("Force", event.partition_key.clone().unwrap_or_default()),
        ("Month", event.period.clone().unwrap_or_default()),
        ("Status", event.status.to_string()),
        ("Rows fetched", event.rows_fetched.to_string()),
        ("Rows inserted", event.rows_inserted.to_string()),
    ];
    if let Some(message) = &event.message {
        rows.push(("Message", message.clone()));
    }

    TEMPLATES
        .get_template(JOB_EVENT_TEMPLATE)
        .and_then(|template| template.render(context! { label => event.label(), rows => rows }))
        .map_err(|e| Error::sink(format!("failed to render email: {e}")))
}
