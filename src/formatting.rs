//! Rendering of relayed SMS messages for the notification channels.

use crate::notification::Message;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::fmt;

/// Characters that must be escaped in Telegram MarkdownV2 text.
const MARKDOWN_V2_RESERVED: &[char] = &[
    '_', '*', '[', ']', '(', ')', '~', '`', '>', '#', '+', '-', '=', '|', '{', '}', '.', '!',
    '\\',
];

/// A shaped, channel-agnostic SMS notification.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SmsMessage {
    /// Display label of the modem (alias or model), may be empty.
    pub modem: String,
    pub from: String,
    pub to: String,
    pub time: Option<DateTime<Utc>>,
    /// Message body, already trimmed.
    pub text: String,
    pub incoming: bool,
}

impl SmsMessage {
    fn headline(&self) -> &'static str {
        if self.incoming {
            "Incoming SMS"
        } else {
            "Outgoing SMS"
        }
    }

    fn formatted_time(&self) -> String {
        match self.time {
            Some(time) => time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            None => "unknown".to_string(),
        }
    }
}

impl fmt::Display for SmsMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.modem.is_empty() {
            writeln!(f, "{}", self.headline())?;
        } else {
            writeln!(f, "[{}] {}", self.modem, self.headline())?;
        }
        writeln!(f, "From: {}", self.from)?;
        writeln!(f, "To: {}", self.to)?;
        writeln!(f, "Time: {}", self.formatted_time())?;
        write!(f, "\n{}", self.text)
    }
}

impl Message for SmsMessage {
    fn markdown(&self) -> String {
        let mut out = String::new();
        if !self.modem.is_empty() {
            out.push_str(&format!("*{}* ", escape_markdown_v2(&self.modem)));
        }
        out.push_str(&format!("_{}_\n", escape_markdown_v2(self.headline())));
        out.push_str(&format!("*From:* {}\n", escape_markdown_v2(&self.from)));
        out.push_str(&format!("*To:* {}\n", escape_markdown_v2(&self.to)));
        out.push_str(&format!(
            "*Time:* {}\n\n",
            escape_markdown_v2(&self.formatted_time())
        ));
        out.push_str(&escape_markdown_v2(&self.text));
        out
    }

    fn to_json(&self) -> serde_json::Value {
        json!({
            "modem": self.modem,
            "from": self.from,
            "to": self.to,
            "time": self.time.map(|t| t.to_rfc3339()),
            "text": self.text,
            "incoming": self.incoming,
            "message": self.to_string(),
        })
    }
}

/// Escapes `text` for use inside a Telegram MarkdownV2 message.
pub fn escape_markdown_v2(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if MARKDOWN_V2_RESERVED.contains(&c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
