//! Legacy reply fallback removal.
//!
//! Older clients prefix replies with a quoted copy of the parent message:
//! `> ` lines in `body` and an `<mx-reply>` block in `formatted_body`.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

static HTML_REPLY_FALLBACK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^<mx-reply>[\s\S]+?</mx-reply>").expect("reply fallback regex should compile")
});

/// Remove the `<mx-reply>` block from the start of an HTML body.
pub fn trim_reply_fallback_html(html: &str) -> String {
    HTML_REPLY_FALLBACK.replace(html, "").into_owned()
}

/// Remove the leading `> ` quote lines from a plain-text body.
pub fn trim_reply_fallback_text(text: &str) -> String {
    if !(text.starts_with("> <") || text.starts_with("> * <")) || !text.contains('\n') {
        return text.to_string();
    }
    let lines: Vec<&str> = text
        .split('\n')
        .skip_while(|line| line.starts_with("> "))
        .collect();
    lines.join("\n").trim().to_string()
}

/// Return a copy of message content with the reply fallback removed.
///
/// Returns `None` when the content is not an HTML reply or carries no
/// fallback, so callers can keep using the original content.
pub fn strip_reply_fallback(content: &Value) -> Option<Value> {
    content.get("m.relates_to")?.get("m.in_reply_to")?.get("event_id")?;
    if content.get("format")?.as_str()? != "org.matrix.custom.html" {
        return None;
    }
    let formatted = content.get("formatted_body")?.as_str()?;
    let trimmed_html = trim_reply_fallback_html(formatted);
    if trimmed_html == formatted {
        return None;
    }
    let mut stripped = content.clone();
    let object = stripped.as_object_mut()?;
    if let Some(body) = object.get("body").and_then(Value::as_str) {
        let trimmed_body = trim_reply_fallback_text(body);
        object.insert("body".to_string(), Value::String(trimmed_body));
    }
    object.insert("formatted_body".to_string(), Value::String(trimmed_html));
    Some(stripped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strips_both_bodies() {
        let content = json!({
            "msgtype": "m.text",
            "body": "> <@a:x> original\n> more\n\nmy reply",
            "format": "org.matrix.custom.html",
            "formatted_body": "<mx-reply><blockquote>original</blockquote></mx-reply>my <b>reply</b>",
            "m.relates_to": {"m.in_reply_to": {"event_id": "$parent"}}
        });
        let stripped = strip_reply_fallback(&content).unwrap();
        assert_eq!(stripped["body"], "my reply");
        assert_eq!(stripped["formatted_body"], "my <b>reply</b>");
        assert_eq!(stripped["m.relates_to"], content["m.relates_to"]);
    }

    #[test]
    fn not_a_reply_is_untouched() {
        let content = json!({
            "body": "> quote",
            "format": "org.matrix.custom.html",
            "formatted_body": "<mx-reply>x</mx-reply>y"
        });
        assert!(strip_reply_fallback(&content).is_none());
    }

    #[test]
    fn reply_without_fallback_is_untouched() {
        let content = json!({
            "body": "just text",
            "format": "org.matrix.custom.html",
            "formatted_body": "just <i>text</i>",
            "m.relates_to": {"m.in_reply_to": {"event_id": "$parent"}}
        });
        assert!(strip_reply_fallback(&content).is_none());
    }

    #[test]
    fn text_without_quote_prefix_is_kept() {
        assert_eq!(trim_reply_fallback_text("> not a reply"), "> not a reply");
        assert_eq!(trim_reply_fallback_text("hello\nworld"), "hello\nworld");
    }
}
