//! Notification system
//!
//! Leveled events fan out to every configured channel whose minimum level is
//! at or below the event's level, in channel-registration order. Channels are
//! looked up by URI scheme in a [`ChannelRegistry`]; delivery failures are
//! logged and never affect the run's outcome.
//!
//! Built-in channels: `console` (stderr echo), `file://`, `irc://`,
//! `mailto://` (deferred, flushed at run end), and — registered by the
//! `webhook` extension — `http://`/`https://` JSON POST.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::split_uri;
use crate::{Error, Result};

// ============================================================================
// Events
// ============================================================================

/// Event severity, ordered
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

impl FromStr for Level {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(Level::Debug),
            "info" => Ok(Level::Info),
            "warn" | "warning" => Ok(Level::Warn),
            "error" => Ok(Level::Error),
            "fatal" => Ok(Level::Fatal),
            other => Err(Error::OptionError(format!("unknown level '{}'", other))),
        }
    }
}

/// One progress event
#[derive(Debug, Clone, Serialize)]
pub struct NotificationEvent {
    pub level: Level,
    pub message: String,
    /// Originating component ("steer", "executor", ...)
    pub component: String,
    pub timestamp: DateTime<Utc>,
}

impl NotificationEvent {
    pub fn new(level: Level, component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            component: component.into(),
            timestamp: Utc::now(),
        }
    }

    /// One-line rendering used by the line-oriented channels
    pub fn render_line(&self) -> String {
        format!(
            "{} [{}] {}: {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.level,
            self.component,
            self.message
        )
    }
}

// ============================================================================
// Channel capability
// ============================================================================

/// Notification delivery capability, identified by URI scheme
#[async_trait]
pub trait Channel: Send + Sync {
    /// Channel name, for logs
    fn name(&self) -> &str;

    /// Deliver one event, or queue it for a deferred flush
    async fn send(&self, event: &NotificationEvent) -> Result<()>;

    /// Flush anything queued and close. Called exactly once at run end.
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Factory for a channel, given the full URI it was requested with
pub type ChannelFactory = Box<dyn Fn(&str) -> Result<Box<dyn Channel>> + Send + Sync>;

/// Registry of channel factories, keyed by URI scheme
pub struct ChannelRegistry {
    factories: HashMap<String, ChannelFactory>,
}

impl ChannelRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with the built-in schemes registered
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("file", Box::new(|uri| Ok(Box::new(FileChannel::from_uri(uri)?))));
        registry.register("irc", Box::new(|uri| Ok(Box::new(IrcChannel::from_uri(uri)?))));
        registry.register("mailto", Box::new(|uri| Ok(Box::new(MailChannel::from_uri(uri)?))));
        registry
    }

    /// Register a factory for a scheme, replacing any existing one
    pub fn register(&mut self, scheme: impl Into<String>, factory: ChannelFactory) {
        let scheme = scheme.into();
        debug!(scheme = %scheme, "Registering notification channel scheme");
        self.factories.insert(scheme, factory);
    }

    /// Register the `webhook` extension: `http://` and `https://` POST
    pub fn register_webhook(&mut self) {
        self.register("http", Box::new(|uri| Ok(Box::new(WebhookChannel::new(uri)))));
        self.register("https", Box::new(|uri| Ok(Box::new(WebhookChannel::new(uri)))));
    }

    /// Build a channel from a URI
    pub fn create(&self, uri: &str) -> Result<Box<dyn Channel>> {
        let (scheme, _) = split_uri(uri);
        let factory = self
            .factories
            .get(scheme)
            .ok_or_else(|| Error::UnknownScheme(scheme.to_string()))?;
        factory(uri)
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

struct ChannelEntry {
    min_level: Level,
    channel: Box<dyn Channel>,
}

/// Fans events out to the configured channels, in registration order.
///
/// Delivery errors are logged and swallowed; notification is advisory, never
/// load-bearing for the run's verdict.
pub struct NotificationDispatcher {
    entries: Vec<ChannelEntry>,
}

impl NotificationDispatcher {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Add a channel with its minimum level, at the end of the order
    pub fn add_channel(&mut self, min_level: Level, channel: Box<dyn Channel>) {
        debug!(channel = %channel.name(), min_level = %min_level, "Adding notification channel");
        self.entries.push(ChannelEntry { min_level, channel });
    }

    pub fn channel_count(&self) -> usize {
        self.entries.len()
    }

    /// Deliver an event to every channel whose minimum level admits it
    pub async fn dispatch(&self, event: &NotificationEvent) {
        for entry in &self.entries {
            if event.level < entry.min_level {
                continue;
            }
            if let Err(e) = entry.channel.send(event).await {
                warn!(channel = %entry.channel.name(), error = %e, "Notification delivery failed");
            }
        }
    }

    /// Build and dispatch an event in one call
    pub async fn emit(&self, level: Level, component: &str, message: impl Into<String>) {
        self.dispatch(&NotificationEvent::new(level, component, message))
            .await;
    }

    /// Flush every channel once, at run end. Deferred channels deliver here.
    pub async fn close(&self) {
        for entry in &self.entries {
            if let Err(e) = entry.channel.flush().await {
                warn!(channel = %entry.channel.name(), error = %e, "Notification flush failed");
            }
        }
    }
}

impl Default for NotificationDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Console channel (default stderr echo)
// ============================================================================

/// The default channel: one line per event on stderr
pub struct ConsoleChannel;

#[async_trait]
impl Channel for ConsoleChannel {
    fn name(&self) -> &str {
        "console"
    }

    async fn send(&self, event: &NotificationEvent) -> Result<()> {
        eprintln!("steer [{}] {}", event.level, event.message);
        Ok(())
    }
}

// ============================================================================
// File channel
// ============================================================================

/// Appends one timestamped line per event to a file
pub struct FileChannel {
    path: PathBuf,
}

impl FileChannel {
    pub fn from_uri(uri: &str) -> Result<Self> {
        let (_, path) = split_uri(uri);
        if path.is_empty() {
            return Err(Error::NotificationError(format!("empty file path in '{}'", uri)));
        }
        Ok(Self {
            path: PathBuf::from(path),
        })
    }
}

#[async_trait]
impl Channel for FileChannel {
    fn name(&self) -> &str {
        "file"
    }

    async fn send(&self, event: &NotificationEvent) -> Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| {
                Error::NotificationError(format!("cannot open {}: {}", self.path.display(), e))
            })?;
        file.write_all(format!("{}\n", event.render_line()).as_bytes())
            .await
            .map_err(|e| {
                Error::NotificationError(format!("cannot write {}: {}", self.path.display(), e))
            })?;
        Ok(())
    }
}

// ============================================================================
// IRC channel
// ============================================================================

/// Delivers events as PRIVMSGs to an IRC channel.
///
/// Connects lazily on the first event and QUITs on flush. Write-only: server
/// replies are not consumed, which is enough for fire-and-forget progress
/// lines.
pub struct IrcChannel {
    host: String,
    port: u16,
    channel: String,
    nick: String,
    stream: Mutex<Option<tokio::net::TcpStream>>,
}

impl IrcChannel {
    /// Parse `irc://host[:port]/channel`
    pub fn from_uri(uri: &str) -> Result<Self> {
        let (_, rest) = split_uri(uri);
        let (authority, channel) = rest
            .split_once('/')
            .ok_or_else(|| Error::NotificationError(format!("missing channel in '{}'", uri)))?;
        if authority.is_empty() || channel.is_empty() {
            return Err(Error::NotificationError(format!("invalid IRC URI '{}'", uri)));
        }

        let (host, port) = match authority.split_once(':') {
            Some((host, port)) => {
                let port = port.parse().map_err(|_| {
                    Error::NotificationError(format!("invalid IRC port in '{}'", uri))
                })?;
                (host.to_string(), port)
            }
            None => (authority.to_string(), 6667),
        };

        let channel = if channel.starts_with('#') {
            channel.to_string()
        } else {
            format!("#{}", channel)
        };

        Ok(Self {
            host,
            port,
            channel,
            nick: "fleetsteer".to_string(),
            stream: Mutex::new(None),
        })
    }

    async fn connect(&self) -> Result<tokio::net::TcpStream> {
        let mut stream = tokio::net::TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| {
                Error::NotificationError(format!("irc connect {}:{}: {}", self.host, self.port, e))
            })?;

        let registration = format!(
            "NICK {nick}\r\nUSER {nick} 0 * :fleetsteer\r\nJOIN {channel}\r\n",
            nick = self.nick,
            channel = self.channel,
        );
        stream
            .write_all(registration.as_bytes())
            .await
            .map_err(|e| Error::NotificationError(format!("irc register: {}", e)))?;

        Ok(stream)
    }
}

#[async_trait]
impl Channel for IrcChannel {
    fn name(&self) -> &str {
        "irc"
    }

    async fn send(&self, event: &NotificationEvent) -> Result<()> {
        let mut guard = self.stream.lock().await;
        if guard.is_none() {
            *guard = Some(self.connect().await?);
        }

        let line = format!(
            "PRIVMSG {} :[{}] {}\r\n",
            self.channel, event.level, event.message
        );
        // A send failure drops the connection so the next event reconnects.
        if let Some(stream) = guard.as_mut() {
            if let Err(e) = stream.write_all(line.as_bytes()).await {
                *guard = None;
                return Err(Error::NotificationError(format!("irc send: {}", e)));
            }
        }
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        let mut guard = self.stream.lock().await;
        if let Some(mut stream) = guard.take() {
            let _ = stream.write_all(b"QUIT :done\r\n").await;
            let _ = stream.shutdown().await;
        }
        Ok(())
    }
}

// ============================================================================
// Mail channel (deferred)
// ============================================================================

/// Buffers events and flushes one message through `sendmail -t` at run end
pub struct MailChannel {
    recipient: String,
    buffer: Mutex<Vec<String>>,
}

impl MailChannel {
    /// Parse `mailto://address` (or `mailto:address`)
    pub fn from_uri(uri: &str) -> Result<Self> {
        let (_, rest) = split_uri(uri);
        let recipient = rest.strip_prefix("mailto:").unwrap_or(rest).trim();
        if recipient.is_empty() || !recipient.contains('@') {
            return Err(Error::NotificationError(format!(
                "invalid mail recipient in '{}'",
                uri
            )));
        }
        Ok(Self {
            recipient: recipient.to_string(),
            buffer: Mutex::new(Vec::new()),
        })
    }

    /// Buffered line count (deferred channels deliver nothing until flush)
    pub async fn pending(&self) -> usize {
        self.buffer.lock().await.len()
    }
}

#[async_trait]
impl Channel for MailChannel {
    fn name(&self) -> &str {
        "mailto"
    }

    async fn send(&self, event: &NotificationEvent) -> Result<()> {
        self.buffer.lock().await.push(event.render_line());
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        let lines = std::mem::take(&mut *self.buffer.lock().await);
        if lines.is_empty() {
            return Ok(());
        }

        let message = format!(
            "To: {}\nSubject: fleetsteer run report\n\n{}\n",
            self.recipient,
            lines.join("\n")
        );

        let mut child = tokio::process::Command::new("sendmail")
            .arg("-t")
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .map_err(|e| Error::NotificationError(format!("sendmail spawn: {}", e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(message.as_bytes())
                .await
                .map_err(|e| Error::NotificationError(format!("sendmail write: {}", e)))?;
        }

        let status = child
            .wait()
            .await
            .map_err(|e| Error::NotificationError(format!("sendmail wait: {}", e)))?;
        if !status.success() {
            return Err(Error::NotificationError(format!(
                "sendmail exited with {}",
                status
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Webhook channel (extension)
// ============================================================================

/// POSTs each event as JSON to an HTTP endpoint
pub struct WebhookChannel {
    client: reqwest::Client,
    url: String,
}

impl WebhookChannel {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl Channel for WebhookChannel {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, event: &NotificationEvent) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({
                "level": event.level,
                "component": event.component,
                "message": event.message,
                "timestamp": event.timestamp.to_rfc3339(),
            }))
            .send()
            .await
            .map_err(|e| Error::NotificationError(format!("webhook request failed: {}", e)))?;

        response
            .error_for_status()
            .map_err(|e| Error::NotificationError(format!("webhook error: {}", e)))?;
        Ok(())
    }
}
