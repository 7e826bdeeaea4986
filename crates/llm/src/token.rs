//! Heuristic token estimation for context budget checks.
//!
//! These are pre-flight approximations, not exact counts: CJK text runs
//! much denser than Latin text per token, and image costs are fixed
//! per-provider averages to avoid reading image dimensions.

use crate::ChatMessage;

fn is_cjk(ch: char) -> bool {
    matches!(ch as u32,
        0x3000..=0x303F      // CJK symbols and punctuation
        | 0x3040..=0x309F    // hiragana
        | 0x30A0..=0x30FF    // katakana
        | 0x3400..=0x4DBF    // CJK extension A
        | 0x4E00..=0x9FFF    // CJK unified ideographs
        | 0xF900..=0xFAFF    // CJK compatibility ideographs
        | 0xFF66..=0xFF9D    // halfwidth katakana
        | 0x1100..=0x11FF    // hangul jamo
        | 0xAC00..=0xD7AF    // hangul syllables
        | 0x20000..=0x2FA1F  // CJK extensions B+
    )
}

/// Estimate token count for a text string.
///
/// CJK characters ≈ 1.5 tokens each; everything else ≈ 0.25 tokens each
/// (4 chars per token).
pub fn estimate_text_tokens(text: &str) -> u64 {
    let mut cjk = 0u64;
    let mut other = 0u64;
    for ch in text.chars() {
        if is_cjk(ch) {
            cjk += 1;
        } else {
            other += 1;
        }
    }
    (cjk as f64 * 1.5 + other as f64 * 0.25) as u64
}

/// Fixed per-image token cost for a provider.
pub fn estimate_image_tokens(provider: &str) -> u64 {
    match provider {
        "openai" => 765,     // high detail, ~2 tiles
        "anthropic" => 1600, // ~1000x1200 image
        "gemini" => 258,     // 768px = 1 tile
        _ => 500,
    }
}

fn count_images(msg: &ChatMessage) -> u64 {
    msg.metadata
        .get("media")
        .and_then(|v| v.as_array())
        .map(|media| {
            media
                .iter()
                .filter(|m| m.get("type").and_then(|t| t.as_str()) == Some("image"))
                .count() as u64
        })
        .unwrap_or(0)
}

/// Estimate total tokens for a message array, including image attachments
/// and ~4 tokens of per-message role/formatting overhead.
pub fn estimate_messages_tokens(messages: &[ChatMessage], provider: &str) -> u64 {
    messages
        .iter()
        .map(|msg| {
            estimate_text_tokens(msg.content_str())
                + count_images(msg) * estimate_image_tokens(provider)
                + 4
        })
        .sum()
}
