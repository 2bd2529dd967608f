//! Channel-specific text shaping.

use herald_common::types::{OutboundMessage, Priority};

/// Single-segment SMS length.
pub const SMS_MAX_CHARS: usize = 160;
pub const PUSH_TITLE_MAX_CHARS: usize = 65;
pub const PUSH_BODY_MAX_CHARS: usize = 240;
/// Telegram `sendMessage` text limit.
pub const CHAT_MAX_CHARS: usize = 4096;

const ELLIPSIS: &str = "...";

/// Truncate to at most `max_chars` characters, ending in `...` when cut.
///
/// Counts Unicode scalar values, not bytes, so multi-byte text is never split
/// inside a character.
pub fn truncate_with_ellipsis(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    if max_chars <= ELLIPSIS.len() {
        return text.chars().take(max_chars).collect();
    }

    let kept: String = text.chars().take(max_chars - ELLIPSIS.len()).collect();
    format!("{}{}", kept.trim_end(), ELLIPSIS)
}

/// `Title: body`, truncated to one SMS segment.
pub fn sms_text(message: &OutboundMessage) -> String {
    let text = if message.title.is_empty() {
        message.body.clone()
    } else {
        format!("{}: {}", message.title, message.body)
    };
    truncate_with_ellipsis(&text, SMS_MAX_CHARS)
}

pub fn push_title(message: &OutboundMessage) -> String {
    truncate_with_ellipsis(&message.title, PUSH_TITLE_MAX_CHARS)
}

pub fn push_body(message: &OutboundMessage) -> String {
    truncate_with_ellipsis(&message.body, PUSH_BODY_MAX_CHARS)
}

/// Chat text with an urgency marker for high-priority messages.
pub fn chat_text(message: &OutboundMessage) -> String {
    let marker = match message.priority {
        Priority::Urgent => "[URGENT] ",
        Priority::High => "[!] ",
        Priority::Normal | Priority::Low => "",
    };
    let text = format!("{}{}\n\n{}", marker, message.title, message.body);
    truncate_with_ellipsis(&text, CHAT_MAX_CHARS)
}

pub fn email_subject(message: &OutboundMessage) -> String {
    match message.priority {
        Priority::Urgent => format!("[Urgent] {}", message.title),
        _ => message.title.clone(),
    }
}
