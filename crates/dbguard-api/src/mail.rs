//! Outbound mail transports.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use dbguard_core::MailSender;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::{MailConfig, MailTransportKind};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(15);

/// Build the transport selected in `config`.
///
/// # Errors
/// Returns an error when the webhook transport is selected without a URL or
/// the HTTP client cannot be built.
pub fn mail_sender(config: &MailConfig) -> Result<Arc<dyn MailSender>> {
    let sender: Arc<dyn MailSender> = match config.transport {
        MailTransportKind::Sendmail => Arc::new(SendmailTransport::new(
            config.sendmail_path.clone(),
            config.from.clone(),
        )),
        MailTransportKind::Webhook => {
            let url = config
                .webhook_url
                .clone()
                .ok_or_else(|| anyhow!("mail.webhook_url is required for the webhook transport"))?;
            Arc::new(WebhookTransport::new(url)?)
        }
        MailTransportKind::Disabled => Arc::new(DisabledTransport),
    };
    Ok(sender)
}

/// Pipes an RFC 5322 message into a local `sendmail -t -i`.
#[derive(Debug, Clone)]
pub struct SendmailTransport {
    program: PathBuf,
    from: String,
}

impl SendmailTransport {
    #[must_use]
    pub fn new(program: PathBuf, from: String) -> Self {
        Self { program, from }
    }
}

#[async_trait]
impl MailSender for SendmailTransport {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<()> {
        let message = format_message(&self.from, to, subject, body);
        let mut child = Command::new(&self.program)
            .arg("-t")
            .arg("-i")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.program.display()))?;

        let mut stdin = child.stdin.take().ok_or_else(|| anyhow!("sendmail stdin unavailable"))?;
        stdin.write_all(message.as_bytes()).await.context("failed to write message to sendmail")?;
        drop(stdin);

        let output = child.wait_with_output().await.context("failed to wait for sendmail")?;
        if !output.status.success() {
            return Err(anyhow!(
                "sendmail exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    to: &'a str,
    subject: &'a str,
    body: &'a str,
}

/// Posts `{to, subject, body}` as JSON to a mail relay.
#[derive(Debug, Clone)]
pub struct WebhookTransport {
    client: reqwest::Client,
    url: String,
}

impl WebhookTransport {
    /// # Errors
    /// Returns an error when the HTTP client cannot be built.
    pub fn new(url: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .context("failed to build webhook HTTP client")?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl MailSender for WebhookTransport {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<()> {
        self.client
            .post(&self.url)
            .json(&WebhookPayload { to, subject, body })
            .send()
            .await
            .with_context(|| format!("failed to reach mail relay {}", self.url))?
            .error_for_status()
            .context("mail relay rejected the message")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledTransport;

#[async_trait]
impl MailSender for DisabledTransport {
    async fn send(&self, _to: &str, _subject: &str, _body: &str) -> Result<()> {
        Err(anyhow!("mail transport disabled"))
    }
}

fn format_message(from: &str, to: &str, subject: &str, body: &str) -> String {
    let body = body.replace("\r\n", "\n").replace('\n', "\r\n");
    format!(
        "From: {}\r\nTo: {}\r\nSubject: {}\r\nMIME-Version: 1.0\r\n\
         Content-Type: text/plain; charset=UTF-8\r\nContent-Transfer-Encoding: 8bit\r\n\r\n{body}\r\n",
        header_value(from),
        header_value(to),
        encode_subject(&header_value(subject)),
    )
}

/// Header values never carry line breaks.
fn header_value(value: &str) -> String {
    value.chars().filter(|c| *c != '\r' && *c != '\n').collect::<String>().trim().to_string()
}

fn encode_subject(subject: &str) -> String {
    if subject.is_ascii() {
        subject.to_string()
    } else {
        format!("=?UTF-8?B?{}?=", STANDARD.encode(subject.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_has_plain_text_headers_and_crlf_body() {
        let message = format_message("a@x", "b@y", "Alert - Site", "line one\nline two");
        assert!(message.starts_with("From: a@x\r\nTo: b@y\r\nSubject: Alert - Site\r\n"));
        assert!(message.contains("Content-Type: text/plain; charset=UTF-8\r\n"));
        assert!(message.ends_with("\r\n\r\nline one\r\nline two\r\n"));
    }

    #[test]
    fn header_injection_is_neutralized() {
        let message = format_message("a@x", "b@y\r\nBcc: evil@z", "hi", "");
        assert!(message.contains("To: b@yBcc: evil@z\r\n"));
        assert!(!message.contains("\r\nBcc:"));
    }

    #[test]
    fn non_ascii_subject_is_encoded() {
        let encoded = encode_subject("Alert - Café");
        assert!(encoded.starts_with("=?UTF-8?B?"));
        assert_eq!(encode_subject("plain"), "plain");
    }

    #[tokio::test]
    async fn disabled_transport_always_fails() {
        assert!(DisabledTransport.send("a@b", "s", "b").await.is_err());
    }

    #[tokio::test]
    async fn missing_sendmail_binary_is_reported() {
        let transport = SendmailTransport::new(
            PathBuf::from("/nonexistent/dbguard-sendmail"),
            "dbguard@localhost".to_string(),
        );
        let err = transport.send("a@b", "s", "b").await.err();
        assert!(err.is_some_and(|err| format!("{err:#}").contains("failed to spawn")));
    }

    #[test]
    fn webhook_without_url_is_rejected() {
        let config = MailConfig {
            transport: MailTransportKind::Webhook,
            webhook_url: None,
            ..MailConfig::default()
        };
        assert!(mail_sender(&config).is_err());
    }
}
