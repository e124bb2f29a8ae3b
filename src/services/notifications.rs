//! Run notifications
//!
//! Best effort: a channel that fails to deliver is logged and skipped, never surfaced to
//! the run.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

/// Discord rejects embed descriptions longer than this
const DISCORD_DESCRIPTION_LIMIT: usize = 4000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
}

impl NotificationLevel {
    fn discord_color(&self) -> u32 {
        match self {
            NotificationLevel::Info => 0x00FF00,
            NotificationLevel::Warning => 0xFFA500,
            NotificationLevel::Error => 0xFF0000,
        }
    }

    fn icon(&self) -> &'static str {
        match self {
            NotificationLevel::Info => "🟢",
            NotificationLevel::Warning => "🟠",
            NotificationLevel::Error => "🔴",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    RunStarted,
    RunFinished,
    RunAborted,
    DeadItems,
    Warnings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub level: NotificationLevel,
    pub title: String,
    pub body: String,
}

impl Notification {
    pub fn new(
        kind: NotificationKind,
        level: NotificationLevel,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            level,
            title: title.into(),
            body: body.into(),
        }
    }
}

/// One delivery channel
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;
    async fn send(&self, notification: &Notification) -> Result<()>;
}

/// Discord incoming webhook
pub struct DiscordWebhook {
    client: Client,
    url: String,
}

impl DiscordWebhook {
    pub fn new(url: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client, url })
    }
}

fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let cut: String = text.chars().take(limit).collect();
    format!("{cut}\n… (truncated)")
}

#[async_trait]
impl Notifier for DiscordWebhook {
    fn name(&self) -> &str {
        "discord"
    }

    async fn send(&self, notification: &Notification) -> Result<()> {
        let payload = json!({
            "embeds": [{
                "title": notification.title,
                "description": truncate(&notification.body, DISCORD_DESCRIPTION_LIMIT),
                "color": notification.level.discord_color(),
                "timestamp": chrono::Utc::now().to_rfc3339(),
            }]
        });

        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .context("Discord webhook request failed")?;
        if !response.status().is_success() {
            bail!("Discord webhook returned {}", response.status());
        }
        Ok(())
    }
}

/// Telegram bot `sendMessage`
pub struct TelegramBot {
    client: Client,
    token: String,
    chat_id: String,
}

impl TelegramBot {
    pub fn new(token: String, chat_id: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            token,
            chat_id,
        })
    }
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[async_trait]
impl Notifier for TelegramBot {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn send(&self, notification: &Notification) -> Result<()> {
        let text = format!(
            "{} <b>{}</b>\n\n{}",
            notification.level.icon(),
            escape_html(&notification.title),
            escape_html(&notification.body)
        );
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.token);

        let response = self
            .client
            .post(url)
            .json(&json!({
                "chat_id": self.chat_id,
                "text": text,
                "parse_mode": "HTML",
                "disable_web_page_preview": true,
            }))
            .send()
            .await
            .context("Telegram request failed")?;
        if !response.status().is_success() {
            bail!("Telegram returned {}", response.status());
        }
        Ok(())
    }
}

/// Fans notifications out to every configured channel
#[derive(Clone, Default)]
pub struct NotificationService {
    channels: Vec<Arc<dyn Notifier>>,
}

impl NotificationService {
    pub fn new(channels: Vec<Arc<dyn Notifier>>) -> Self {
        Self { channels }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        !self.channels.is_empty()
    }

    pub async fn notify(&self, notification: Notification) {
        for channel in &self.channels {
            match channel.send(&notification).await {
                Ok(()) => debug!(channel = %channel.name(), kind = ?notification.kind, "Notification sent"),
                Err(e) => warn!(
                    channel = %channel.name(),
                    kind = ?notification.kind,
                    error = %e,
                    "Notification delivery failed"
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    struct Recording(Mutex<Vec<Notification>>);

    #[async_trait]
    impl Notifier for Recording {
        fn name(&self) -> &str {
            "recording"
        }

        async fn send(&self, notification: &Notification) -> Result<()> {
            self.0.lock().push(notification.clone());
            Ok(())
        }
    }

    struct Broken;

    #[async_trait]
    impl Notifier for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        async fn send(&self, _: &Notification) -> Result<()> {
            bail!("no route to host")
        }
    }

    #[tokio::test]
    async fn test_failing_channel_does_not_block_others() {
        let recording = Arc::new(Recording(Mutex::new(Vec::new())));
        let service = NotificationService::new(vec![Arc::new(Broken), recording.clone()]);

        service
            .notify(Notification::new(
                NotificationKind::RunFinished,
                NotificationLevel::Info,
                "Refresh finished",
                "checked=3",
            ))
            .await;

        let sent = recording.0.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, NotificationKind::RunFinished);
    }

    #[test]
    fn test_truncate_and_escape() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdef", 3), "abc\n… (truncated)");
        assert_eq!(escape_html("a<b>&c"), "a&lt;b&gt;&amp;c");
    }
}
