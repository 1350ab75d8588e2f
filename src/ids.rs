//! Stable identifier derivation for upstream messages.
//!
//! Upstream message ids are only unique within their chat, so the persisted id
//! is a SHA-256 hash over the chat id and the upstream id (or the content when
//! the upstream id is missing). The same upstream message always maps to the
//! same id across polls and restarts.

use crate::models::{AlertId, MessageId, RawMessage, MAX_CHAT_ID};
use ring::digest::{Context, SHA256};

/// Derive the persisted id of a message.
pub fn derive_id(message: &RawMessage) -> AlertId {
    let chat = message.chat_id.to_be_bytes();
    match &message.message_id {
        Some(MessageId::Number(n)) => numeric_id(&chat, *n),
        Some(MessageId::Text(text)) => match text.trim().parse::<i64>() {
            Ok(n) => numeric_id(&chat, n),
            Err(_) => hash_id(&[&b"text"[..], &chat[..], text.as_bytes()]),
        },
        None => hash_id(&[
            &b"content"[..],
            &chat[..],
            &message.timestamp_seconds.to_be_bytes()[..],
            message.message.as_bytes(),
        ]),
    }
}

/// Key used by clients to remember which messages were already surfaced.
///
/// Matches the persisted id, so a raw upstream message and the stored
/// notification it became share one key.
pub fn dedup_key(message: &RawMessage) -> String {
    derive_id(message).to_string()
}

/// `42` and `"42"` name the same upstream message
fn numeric_id(chat: &[u8], n: i64) -> AlertId {
    hash_id(&[&b"num"[..], chat, &n.to_be_bytes()[..]])
}

/// Map an external chat id into `1..=MAX_CHAT_ID`.
pub fn bound_chat_id(chat_id: i64) -> i32 {
    if (1..=MAX_CHAT_ID).contains(&chat_id) {
        return chat_id as i32;
    }
    match chat_id.unsigned_abs() % MAX_CHAT_ID as u64 {
        0 => 1,
        n => n as i32,
    }
}

/// Length-prefixed SHA-256 over `parts`, truncated to a positive 63-bit id.
fn hash_id(parts: &[&[u8]]) -> AlertId {
    let mut ctx = Context::new(&SHA256);
    for part in parts {
        ctx.update(&(part.len() as u64).to_be_bytes());
        ctx.update(part);
    }
    let digest = ctx.finish();

    let mut head = [0u8; 8];
    head.copy_from_slice(&digest.as_ref()[..8]);
    match (u64::from_be_bytes(head) >> 1) as i64 {
        0 => 1,
        id => id,
    }
}
