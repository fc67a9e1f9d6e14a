//! Local content derivation for messages.
//!
//! Turns a message body into the sanitized, display-ready form stored
//! alongside the event. Results are stamped with
//! [`CURRENT_SANITIZER_VERSION`] so entries produced by an older sanitizer
//! can be recomputed lazily.

mod emoji;
mod linkify;
mod markdown;
mod sanitize;

pub use emoji::is_only_emojis;
pub use linkify::{escape_html, linkify};
pub use markdown::html_to_markdown;
pub use sanitize::{sanitize_html, SanitizedHtml, MATH_MARKER_TAG, MAX_NESTING_DEPTH};

use larch_sync_types::{ContentUri, LocalContent, RelationType};
use serde_json::Value;
use thiserror::Error;

/// Version of the sanitizer output format.
pub const CURRENT_SANITIZER_VERSION: u32 = 1;

/// `format` value of HTML message bodies.
pub const FORMAT_HTML: &str = "org.matrix.custom.html";

/// Default length limit for big-emoji messages, in characters.
pub const DEFAULT_BIG_EMOJI_MAX_LEN: usize = 100;

/// Errors from content derivation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContentError {
    /// The HTML body nests elements too deeply.
    #[error("HTML nesting exceeds {0} levels")]
    TooDeep(usize),
}

/// Tuning for local content derivation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentOptions {
    /// Plain-text messages shorter than this may be shown as big emoji.
    pub big_emoji_max_len: usize,
    /// Wrap URLs in anchors.
    pub linkify: bool,
}

impl Default for ContentOptions {
    fn default() -> Self {
        Self {
            big_emoji_max_len: DEFAULT_BIG_EMOJI_MAX_LEN,
            linkify: true,
        }
    }
}

/// Output of [`derive_local_content`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedContent {
    /// The derived entry.
    pub local_content: LocalContent,
    /// Inline images found in the HTML body.
    pub inline_images: Vec<ContentUri>,
    /// Sanitizing failed; `local_content` has no HTML.
    pub sanitize_error: Option<ContentError>,
}

/// True if a stored entry was produced by an older sanitizer.
pub fn needs_reprocess(local_content: Option<&LocalContent>) -> bool {
    local_content.is_some_and(|lc| lc.html_version < CURRENT_SANITIZER_VERSION)
}

/// Derive local content for `m.room.message` content.
///
/// Edits use `m.new_content`. The edit source is only reconstructed for our
/// own HTML messages, and a non-empty cached one in `existing` is reused.
pub fn derive_local_content(
    content: &Value,
    relation_type: Option<RelationType>,
    own_message: bool,
    existing: Option<&LocalContent>,
    options: &ContentOptions,
) -> Option<DerivedContent> {
    let content = match content.get("m.new_content") {
        Some(new_content) if relation_type == Some(RelationType::Replace) => new_content,
        _ => content,
    };
    if !content.is_object() {
        return None;
    }
    let msgtype = content.get("msgtype").and_then(Value::as_str).unwrap_or_default();
    let body = content.get("body").and_then(Value::as_str).unwrap_or_default();
    let formatted_body = content
        .get("formatted_body")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let is_html = content.get("format").and_then(Value::as_str) == Some(FORMAT_HTML)
        && !formatted_body.is_empty();

    let mut local_content = LocalContent {
        html_version: CURRENT_SANITIZER_VERSION,
        ..LocalContent::default()
    };
    let mut inline_images = Vec::new();
    let mut sanitize_error = None;

    if is_html {
        match sanitize_html(formatted_body, options.linkify) {
            Ok(sanitized) => {
                local_content.has_math = sanitized.has_math;
                local_content.sanitized_html = sanitized.html;
                inline_images = sanitized.inline_images;
            }
            Err(err) => sanitize_error = Some(err),
        }
        local_content.edit_source = match existing.map(|lc| lc.edit_source.as_str()) {
            Some(cached) if !cached.is_empty() => cached.to_string(),
            _ if own_message => with_command_prefix(msgtype, &html_to_markdown(formatted_body)),
            _ => String::new(),
        };
    } else {
        let has_special_characters = body
            .chars()
            .any(|c| matches!(c, '<' | '>' | '&' | '.' | ':'));
        if has_special_characters {
            local_content.sanitized_html = if options.linkify {
                linkify(body)
            } else {
                escape_html(body)
            };
        } else if body.chars().count() < options.big_emoji_max_len && is_only_emojis(body) {
            local_content.big_emoji = true;
        }
        if matches!(msgtype, "m.emote" | "m.notice") {
            local_content.edit_source = with_command_prefix(msgtype, body);
        }
        local_content.was_plaintext = true;
    }

    Some(DerivedContent {
        local_content,
        inline_images,
        sanitize_error,
    })
}

fn with_command_prefix(msgtype: &str, source: &str) -> String {
    match msgtype {
        "m.emote" => format!("/me {}", source),
        "m.notice" => format!("/notice {}", source),
        _ => source.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn derive(content: Value, own: bool) -> DerivedContent {
        derive_local_content(&content, None, own, None, &ContentOptions::default()).unwrap()
    }

    // ===========================================
    // HTML Body Tests
    // ===========================================

    #[test]
    fn html_body_is_sanitized() {
        let out = derive(
            json!({"msgtype": "m.text", "body": "hi", "format": FORMAT_HTML, "formatted_body": "<b>hi</b><script>x</script>"}),
            false,
        );
        assert_eq!(out.local_content.sanitized_html, "<b>hi</b>");
        assert_eq!(out.local_content.html_version, CURRENT_SANITIZER_VERSION);
        assert!(!out.local_content.was_plaintext);
        assert!(out.local_content.edit_source.is_empty());
    }

    #[test]
    fn own_html_message_gets_edit_source() {
        let out = derive(
            json!({"msgtype": "m.emote", "body": "waves", "format": FORMAT_HTML, "formatted_body": "<i>waves</i>"}),
            true,
        );
        assert_eq!(out.local_content.edit_source, "/me _waves_");
    }

    #[test]
    fn cached_edit_source_is_reused() {
        let existing = LocalContent {
            edit_source: "original **source**".into(),
            ..LocalContent::default()
        };
        let out = derive_local_content(
            &json!({"msgtype": "m.text", "body": "x", "format": FORMAT_HTML, "formatted_body": "<b>x</b>"}),
            None,
            true,
            Some(&existing),
            &ContentOptions::default(),
        )
        .unwrap();
        assert_eq!(out.local_content.edit_source, "original **source**");
    }

    #[test]
    fn math_and_inline_images() {
        let out = derive(
            json!({"msgtype": "m.text", "body": "x", "format": FORMAT_HTML,
                   "formatted_body": "<div data-mx-maths=\"e=mc^2\">e=mc^2</div><img src=\"mxc://x/y\">"}),
            false,
        );
        assert!(out.local_content.has_math);
        assert_eq!(out.inline_images, vec![ContentUri::parse("mxc://x/y").unwrap()]);
    }

    #[test]
    fn edits_use_new_content() {
        let content = json!({
            "msgtype": "m.text",
            "body": "* new",
            "m.new_content": {"msgtype": "m.text", "body": "new", "format": FORMAT_HTML, "formatted_body": "<b>new</b>"},
            "m.relates_to": {"rel_type": "m.replace", "event_id": "$orig"}
        });
        let out = derive_local_content(
            &content,
            Some(RelationType::Replace),
            false,
            None,
            &ContentOptions::default(),
        )
        .unwrap();
        assert_eq!(out.local_content.sanitized_html, "<b>new</b>");
    }

    // ===========================================
    // Plain Text Body Tests
    // ===========================================

    #[test]
    fn plain_text_fast_path() {
        let out = derive(json!({"msgtype": "m.text", "body": "hello there"}), false);
        assert!(out.local_content.was_plaintext);
        assert!(out.local_content.sanitized_html.is_empty());
        assert!(!out.local_content.big_emoji);
    }

    #[test]
    fn plain_text_with_url_is_linkified() {
        let out = derive(json!({"msgtype": "m.text", "body": "see https://example.org"}), false);
        assert!(out
            .local_content
            .sanitized_html
            .contains("<a href=\"https://example.org\""));
    }

    #[test]
    fn short_emoji_message_is_big() {
        let out = derive(json!({"msgtype": "m.text", "body": "🎉🎉"}), false);
        assert!(out.local_content.big_emoji);
    }

    #[test]
    fn long_emoji_message_is_not_big() {
        let body = "🎉".repeat(120);
        let out = derive(json!({"msgtype": "m.text", "body": body}), false);
        assert!(!out.local_content.big_emoji);
    }

    #[test]
    fn notice_prefix_in_edit_source() {
        let out = derive(json!({"msgtype": "m.notice", "body": "beep"}), false);
        assert_eq!(out.local_content.edit_source, "/notice beep");
    }

    #[test]
    fn non_object_content_is_ignored() {
        assert!(derive_local_content(
            &json!("nope"),
            None,
            false,
            None,
            &ContentOptions::default()
        )
        .is_none());
    }

    #[test]
    fn version_check() {
        let old = LocalContent::default();
        assert!(needs_reprocess(Some(&old)));
        let current = LocalContent {
            html_version: CURRENT_SANITIZER_VERSION,
            ..LocalContent::default()
        };
        assert!(!needs_reprocess(Some(&current)));
        assert!(!needs_reprocess(None));
    }
}
