//! Email adapter: IMAP fetch (inbound) + SMTP delivery (outbound).
//!
//! The wire clients sit behind `Mailbox` and `MailSender` so sources and
//! destinations can be exercised without a mail server.

use std::io::Write as IoWrite;
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{SmtpTransport, Transport};
use mail_parser::{MessageParser, MimeHeaders};
use secrecy::{ExposeSecret, SecretString};
use uuid::Uuid;

use crate::error::{ChannelError, ConfigError, PipelineError};
use crate::pipeline::formatter::Formatter;
use crate::pipeline::message::{Message, Platform, keys, now_millis};
use crate::pipeline::traits::{Destination, Source, fetched_or_empty};

/// Metadata key holding the RFC 5322 Message-ID.
pub const MESSAGE_ID: &str = "message_id";

/// Subject used when the payload carries no `Subject:` line.
const DEFAULT_SUBJECT: &str = "relayflow";

// ── Configuration ───────────────────────────────────────────────────

/// Mail account configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub imap_host: String,
    pub imap_port: u16,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
}

impl EmailConfig {
    /// Build config from `EMAIL_*` variables.
    /// Returns `Ok(None)` when `EMAIL_IMAP_HOST` is unset (adapter disabled).
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        let Ok(imap_host) = std::env::var("EMAIL_IMAP_HOST") else {
            return Ok(None);
        };

        let imap_port = parse_port("EMAIL_IMAP_PORT", 993)?;
        let smtp_host =
            std::env::var("EMAIL_SMTP_HOST").unwrap_or_else(|_| imap_host.replace("imap", "smtp"));
        let smtp_port = parse_port("EMAIL_SMTP_PORT", 587)?;

        let username = std::env::var("EMAIL_USERNAME")
            .map_err(|_| ConfigError::MissingEnvVar("EMAIL_USERNAME".into()))?;
        let password = std::env::var("EMAIL_PASSWORD")
            .map_err(|_| ConfigError::MissingEnvVar("EMAIL_PASSWORD".into()))?;
        let from_address = std::env::var("EMAIL_FROM_ADDRESS").unwrap_or_else(|_| username.clone());

        Ok(Some(Self {
            imap_host,
            imap_port,
            smtp_host,
            smtp_port,
            username,
            password: SecretString::from(password),
            from_address,
        }))
    }
}

fn parse_port(key: &str, default: u16) -> Result<u16, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::invalid(key, format!("not a port: {raw}"))),
        Err(_) => Ok(default),
    }
}

// ── Backend seams ───────────────────────────────────────────────────

/// One email as read from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedEmail {
    pub message_id: String,
    pub sender: String,
    pub subject: String,
    pub body: String,
    /// Epoch millis.
    pub timestamp: i64,
}

/// Reads mail from an account.
#[async_trait]
pub trait Mailbox: Send + Sync {
    /// Up to `count` unseen messages, oldest first. Returned messages are
    /// marked seen.
    async fn fetch_recent(&self, count: usize) -> Result<Vec<FetchedEmail>, ChannelError>;

    /// The account address, used as the message recipient.
    fn address(&self) -> &str;
}

/// Sends mail from an account.
#[async_trait]
pub trait MailSender: Send + Sync {
    async fn send(&self, to: &str, subject: &str, html_body: &str) -> Result<(), ChannelError>;
}

// ── IMAP ────────────────────────────────────────────────────────────

/// Raw IMAP over TLS. Each fetch opens a fresh session.
pub struct ImapMailbox {
    config: Arc<EmailConfig>,
}

impl ImapMailbox {
    pub fn new(config: Arc<EmailConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Mailbox for ImapMailbox {
    async fn fetch_recent(&self, count: usize) -> Result<Vec<FetchedEmail>, ChannelError> {
        let config = Arc::clone(&self.config);
        tokio::task::spawn_blocking(move || fetch_unseen_imap(&config, count))
            .await
            .map_err(|e| ChannelError::FetchFailed {
                name: "email".into(),
                reason: format!("IMAP task failed: {e}"),
            })?
            .map_err(|e| ChannelError::FetchFailed {
                name: "email".into(),
                reason: e.to_string(),
            })
    }

    fn address(&self) -> &str {
        &self.config.username
    }
}

/// Error type for IMAP fetch operations.
type ImapError = Box<dyn std::error::Error + Send + Sync>;

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

fn read_line(tls: &mut TlsStream) -> Result<String, ImapError> {
    let mut buf = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        match std::io::Read::read(tls, &mut byte) {
            Ok(0) => return Err("IMAP connection closed".into()),
            Ok(_) => {
                buf.push(byte[0]);
                if buf.ends_with(b"\r\n") {
                    return Ok(String::from_utf8_lossy(&buf).to_string());
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn send_cmd(tls: &mut TlsStream, tag: &str, cmd: &str) -> Result<Vec<String>, ImapError> {
    IoWrite::write_all(tls, format!("{tag} {cmd}\r\n").as_bytes())?;
    IoWrite::flush(tls)?;
    let mut lines = Vec::new();
    loop {
        let line = read_line(tls)?;
        let done = completes(&line, tag);
        lines.push(line);
        if done {
            return Ok(lines);
        }
    }
}

/// Whether `line` is the tagged completion for `tag`. "A4" must not
/// match "A42 OK" or a literal line that happens to start with the tag.
fn completes(line: &str, tag: &str) -> bool {
    line.strip_prefix(tag)
        .and_then(|rest| rest.strip_prefix(' '))
        .is_some_and(|rest| ["OK", "NO", "BAD"].iter().any(|status| rest.starts_with(status)))
}

/// Fetch up to `limit` unseen emails (blocking; run in spawn_blocking).
fn fetch_unseen_imap(config: &EmailConfig, limit: usize) -> Result<Vec<FetchedEmail>, ImapError> {
    let tcp = TcpStream::connect((config.imap_host.as_str(), config.imap_port))?;
    tcp.set_read_timeout(Some(Duration::from_secs(30)))?;

    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    );
    let server_name = rustls::pki_types::ServerName::try_from(config.imap_host.clone())?;
    let conn = rustls::ClientConnection::new(tls_config, server_name)?;
    let mut tls = rustls::StreamOwned::new(conn, tcp);

    let _greeting = read_line(&mut tls)?;

    let login = send_cmd(
        &mut tls,
        "A1",
        &format!(
            "LOGIN \"{}\" \"{}\"",
            config.username,
            config.password.expose_secret()
        ),
    )?;
    if !login.last().is_some_and(|l| l.contains("OK")) {
        return Err("IMAP login failed".into());
    }

    send_cmd(&mut tls, "A2", "SELECT \"INBOX\"")?;

    let search = send_cmd(&mut tls, "A3", "SEARCH UNSEEN")?;
    let ids = newest_ids(&search, limit);

    let mut results = Vec::new();
    let mut tag_counter = 4_u32;

    for id in &ids {
        let fetch_tag = format!("A{tag_counter}");
        tag_counter += 1;
        let fetch = send_cmd(&mut tls, &fetch_tag, &format!("FETCH {id} RFC822"))?;

        // Drop the "* n FETCH (RFC822 {len}" prefix line and the closing
        // paren plus tagged status.
        let raw: String = fetch
            .iter()
            .skip(1)
            .take(fetch.len().saturating_sub(3))
            .cloned()
            .collect();

        if let Some(email) = parse_email(raw.as_bytes()) {
            results.push(email);
        }

        let store_tag = format!("A{tag_counter}");
        tag_counter += 1;
        if let Err(e) = send_cmd(&mut tls, &store_tag, &format!("STORE {id} +FLAGS (\\Seen)")) {
            tracing::warn!(id = %id, error = %e, "Failed to mark email seen");
        }
    }

    let _ = send_cmd(&mut tls, &format!("A{tag_counter}"), "LOGOUT");

    Ok(results)
}

/// Sequence numbers from `* SEARCH` lines, keeping the newest `limit`
/// in ascending order.
fn newest_ids(search_resp: &[String], limit: usize) -> Vec<String> {
    let mut ids: Vec<String> = search_resp
        .iter()
        .filter(|line| line.starts_with("* SEARCH"))
        .flat_map(|line| line.split_whitespace().skip(2).map(String::from))
        .collect();
    if ids.len() > limit {
        ids.drain(..ids.len() - limit);
    }
    ids
}

/// Parse an RFC 822 message into a `FetchedEmail`.
fn parse_email(raw: &[u8]) -> Option<FetchedEmail> {
    let parsed = MessageParser::default().parse(raw)?;

    let timestamp = parsed
        .date()
        .and_then(|d| {
            chrono::NaiveDate::from_ymd_opt(i32::from(d.year), u32::from(d.month), u32::from(d.day))
                .and_then(|date| {
                    date.and_hms_opt(u32::from(d.hour), u32::from(d.minute), u32::from(d.second))
                })
        })
        .map_or_else(now_millis, |n| n.and_utc().timestamp_millis());

    Some(FetchedEmail {
        message_id: parsed
            .message_id()
            .map(str::to_string)
            .unwrap_or_else(|| format!("gen-{}", Uuid::new_v4())),
        sender: extract_sender(&parsed),
        subject: parsed.subject().unwrap_or("(no subject)").to_string(),
        body: strip_quoted_text(&extract_text(&parsed)),
        timestamp,
    })
}

fn extract_sender(parsed: &mail_parser::Message) -> String {
    parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(str::to_string)
        .unwrap_or_else(|| "unknown".into())
}

fn extract_text(parsed: &mail_parser::Message) -> String {
    if let Some(text) = parsed.body_text(0) {
        return text.to_string();
    }
    if let Some(html) = parsed.body_html(0) {
        return strip_html(html.as_ref());
    }
    for part in parsed.attachments() {
        if let Some(ct) = MimeHeaders::content_type(part)
            && ct.ctype() == "text"
            && let Ok(text) = std::str::from_utf8(part.contents())
        {
            let name = MimeHeaders::attachment_name(part).unwrap_or("file");
            return format!("[Attachment: {name}]\n{text}");
        }
    }
    "(no readable content)".to_string()
}

// ── SMTP ────────────────────────────────────────────────────────────

/// SMTP sender with STARTTLS relay and HTML bodies.
pub struct SmtpMailer {
    config: Arc<EmailConfig>,
}

impl SmtpMailer {
    pub fn new(config: Arc<EmailConfig>) -> Self {
        Self { config }
    }
}

fn send_failed(reason: String) -> ChannelError {
    ChannelError::SendFailed {
        name: "email".into(),
        reason,
    }
}

fn send_smtp(config: &EmailConfig, to: &str, subject: &str, html: &str) -> Result<(), ChannelError> {
    let creds = Credentials::new(
        config.username.clone(),
        config.password.expose_secret().to_string(),
    );

    let transport = SmtpTransport::starttls_relay(&config.smtp_host)
        .map_err(|e| send_failed(format!("SMTP relay error: {e}")))?
        .port(config.smtp_port)
        .credentials(creds)
        .build();

    let email = lettre::Message::builder()
        .from(
            config
                .from_address
                .parse()
                .map_err(|e| send_failed(format!("Invalid from address: {e}")))?,
        )
        .to(to
            .parse()
            .map_err(|e| send_failed(format!("Invalid to address: {e}")))?)
        .subject(subject)
        .header(ContentType::TEXT_HTML)
        .body(html.to_string())
        .map_err(|e| send_failed(format!("Failed to build email: {e}")))?;

    transport
        .send(&email)
        .map_err(|e| send_failed(format!("SMTP send failed: {e}")))?;

    tracing::info!(to = %to, "Email sent");
    Ok(())
}

#[async_trait]
impl MailSender for SmtpMailer {
    async fn send(&self, to: &str, subject: &str, html_body: &str) -> Result<(), ChannelError> {
        let config = Arc::clone(&self.config);
        let (to, subject, html) = (to.to_string(), subject.to_string(), html_body.to_string());
        tokio::task::spawn_blocking(move || send_smtp(&config, &to, &subject, &html))
            .await
            .map_err(|e| send_failed(format!("SMTP task failed: {e}")))?
    }
}

// ── Source / Destination ────────────────────────────────────────────

/// Reads unseen mail as workflow input.
pub struct EmailSource {
    mailbox: Arc<dyn Mailbox>,
    allowed_senders: Vec<String>,
}

impl EmailSource {
    pub fn new(mailbox: Arc<dyn Mailbox>, allowed_senders: Vec<String>) -> Self {
        Self {
            mailbox,
            allowed_senders,
        }
    }

    fn accepts(&self, sender: &str) -> bool {
        self.allowed_senders.is_empty() || is_sender_allowed(&self.allowed_senders, sender)
    }

    fn to_message(&self, email: FetchedEmail) -> Message {
        Message::new(
            format!("email-{}", email.message_id.trim_matches(['<', '>'])),
            Platform::Email,
            email.sender,
            self.mailbox.address(),
            email.body,
            email.timestamp,
        )
        .with_metadata(keys::SUBJECT, email.subject)
        .with_metadata(MESSAGE_ID, email.message_id)
    }
}

#[async_trait]
impl Source for EmailSource {
    fn name(&self) -> &str {
        "email"
    }

    async fn fetch_one(&self) -> Message {
        // Newest wins: the batch is ordered oldest first.
        self.fetch_many(1).await.pop().unwrap_or_else(|| Message::empty(Platform::Email))
    }

    async fn fetch_many(&self, count: usize) -> Vec<Message> {
        let result = self
            .mailbox
            .fetch_recent(count.max(1))
            .await
            .map(|emails| {
                let total = emails.len();
                let kept: Vec<Message> = emails
                    .into_iter()
                    .filter(|e| self.accepts(&e.sender))
                    .map(|e| self.to_message(e))
                    .collect();
                if kept.len() < total {
                    tracing::debug!(dropped = total - kept.len(), "Ignored emails from senders not on the allowlist");
                }
                kept
            })
            .map_err(PipelineError::from);
        fetched_or_empty(self.name(), Platform::Email, result)
    }
}

/// Delivers formatted payloads as HTML email to one recipient.
pub struct EmailDestination {
    sender: Arc<dyn MailSender>,
    recipient: String,
    formatter: Arc<dyn Formatter>,
}

impl EmailDestination {
    pub fn new(
        sender: Arc<dyn MailSender>,
        recipient: impl Into<String>,
        formatter: Arc<dyn Formatter>,
    ) -> Self {
        Self {
            sender,
            recipient: recipient.into(),
            formatter,
        }
    }
}

#[async_trait]
impl Destination for EmailDestination {
    fn name(&self) -> &str {
        "email"
    }

    fn formatter(&self) -> &dyn Formatter {
        self.formatter.as_ref()
    }

    async fn deliver(&self, payload: &str) -> Result<(), ChannelError> {
        let (subject, body) = extract_subject(payload);
        self.sender.send(&self.recipient, &subject, body).await
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Check if a sender email is in the allowlist.
///
/// - Empty list → deny all
/// - `*` in list → allow all
/// - `@domain.com` or `domain.com` → domain match
/// - `user@domain.com` → exact email match
pub fn is_sender_allowed(allowed: &[String], email: &str) -> bool {
    if allowed.iter().any(|a| a == "*") {
        return true;
    }
    let email_lower = email.to_lowercase();
    allowed.iter().any(|a| {
        if a.starts_with('@') {
            email_lower.ends_with(&a.to_lowercase())
        } else if a.contains('@') {
            a.eq_ignore_ascii_case(email)
        } else {
            email_lower.ends_with(&format!("@{}", a.to_lowercase()))
        }
    })
}

/// Strip HTML tags and collapse whitespace.
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Split a leading `Subject: ...` line off a payload.
pub fn extract_subject(content: &str) -> (String, &str) {
    if let Some(rest) = content.strip_prefix("Subject: ")
        && let Some(pos) = rest.find('\n')
    {
        return (rest[..pos].trim().to_string(), rest[pos + 1..].trim_start());
    }
    (DEFAULT_SUBJECT.to_string(), content)
}

/// Remove quoted reply lines and everything after an attribution line.
pub fn strip_quoted_text(body: &str) -> String {
    let mut result = Vec::new();

    for line in body.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with('>') {
            continue;
        }
        // "On Mon, Jan 1, 2026 at 10:00 AM Alice <alice@ex.com> wrote:"
        if trimmed.starts_with("On ") && trimmed.ends_with("wrote:") {
            break;
        }
        if trimmed.starts_with("---") && trimmed.contains("Original Message") {
            break;
        }
        result.push(line);
    }

    while result.last().is_some_and(|l| l.trim().is_empty()) {
        result.pop();
    }

    result.join("\n")
}
