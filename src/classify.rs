//! Message classification and free-text field extraction.
//!
//! The upstream source has no typed discriminator, so cancellations are told
//! apart from ordinary cabinet messages by a marker phrase in the body. All of
//! that string matching lives here.

use crate::models::{AlertKind, RawMessage, StreamKind};
use regex::Regex;
use std::sync::LazyLock;

/// Marker phrase of a failed/cancelled operation (matched case-insensitively)
pub const CANCELLATION_MARKER: &str = "невозможно обработать";

/// Boilerplate the chat bot prepends to every automatic alert
pub const BOILERPLATE_PREFIX: &str = "Автоматическое оповещение:";

/// `[Cabinet name#id]` header at the start of a message
static HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*\[(?P<name>[^\]#]*)#(?P<id>[^\]]+)\]").expect("valid header regex")
});

/// Optional header followed by the boilerplate prefix
static BOILERPLATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"^(?P<header>\s*\[[^\]]*\])?\s*{}\s*",
        regex::escape(BOILERPLATE_PREFIX)
    ))
    .expect("valid boilerplate regex")
});

/// Upstream message tagged with its classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classified<'a> {
    Notification(&'a RawMessage),
    Cancellation(&'a RawMessage),
}

impl Classified<'_> {
    pub fn kind(&self) -> AlertKind {
        match self {
            Classified::Notification(_) => AlertKind::Notification,
            Classified::Cancellation(_) => AlertKind::Cancellation,
        }
    }
}

/// Whether the text carries the cancellation marker
pub fn is_cancellation_text(text: &str) -> bool {
    text.to_lowercase().contains(CANCELLATION_MARKER)
}

/// Classify a message. Everything on the cancellation stream is a
/// cancellation; on the notification stream only marker-bearing messages are.
pub fn classify(message: &RawMessage, stream: StreamKind) -> Classified<'_> {
    if stream == StreamKind::Cancellations || is_cancellation_text(&message.message) {
        Classified::Cancellation(message)
    } else {
        Classified::Notification(message)
    }
}

/// Remove the boilerplate prefix, keeping any `[..]` header in front of it.
pub fn display_text(message: &str) -> String {
    match BOILERPLATE.captures(message) {
        Some(caps) => {
            let rest = &message[caps.get(0).map_or(0, |m| m.end())..];
            match caps.name("header") {
                Some(header) => format!("{} {}", header.as_str().trim(), rest.trim_end()),
                None => rest.trim_end().to_string(),
            }
        }
        None => message.trim().to_string(),
    }
}

/// Fill `cabinet_name`/`cabinet_id` from the `[Name#Id]` header when the
/// upstream left them empty.
pub fn extract_fields(message: &mut RawMessage) {
    if !message.cabinet_id.trim().is_empty() && !message.cabinet_name.trim().is_empty() {
        return;
    }

    let Some(caps) = HEADER.captures(&message.message) else {
        return;
    };

    if message.cabinet_name.trim().is_empty() {
        if let Some(name) = caps.name("name") {
            message.cabinet_name = name.as_str().trim().to_string();
        }
    }
    if message.cabinet_id.trim().is_empty() {
        if let Some(id) = caps.name("id") {
            message.cabinet_id = id.as_str().trim().to_string();
        }
    }
}
