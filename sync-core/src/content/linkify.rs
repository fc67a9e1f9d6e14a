//! URL detection and HTML escaping for plain text segments.

use std::sync::LazyLock;

use regex::Regex;

/// Regex for matching linkable URLs in text content.
static URL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(?:https?://|mailto:)[^\s<>"]+"#).expect("URL regex should compile")
});

/// Characters stripped from the end of a detected URL.
const TRAILING_PUNCTUATION: &[char] = &['.', ',', ';', ':', '!', '?', '\'', ')', ']', '}'];

/// Append `text` to `out` with HTML special characters escaped.
pub fn escape_html_into(text: &str, out: &mut String) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
}

/// Escape HTML special characters.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    escape_html_into(text, &mut out);
    out
}

/// Append `text` to `out`, escaped, with URLs wrapped in anchors.
pub fn linkify_into(text: &str, out: &mut String) {
    let mut last = 0;
    for found in URL_REGEX.find_iter(text) {
        let url = trim_trailing_punctuation(found.as_str());
        let has_target = url
            .split_once(':')
            .is_some_and(|(_, rest)| !rest.trim_start_matches('/').is_empty());
        if !has_target {
            continue;
        }
        let start = found.start();
        let end = start + url.len();
        escape_html_into(&text[last..start], out);
        out.push_str("<a href=\"");
        escape_html_into(url, out);
        out.push_str("\" target=\"_blank\" rel=\"noreferrer noopener\">");
        escape_html_into(url, out);
        out.push_str("</a>");
        last = end;
    }
    escape_html_into(&text[last..], out);
}

/// Escape `text` and wrap URLs in anchors.
pub fn linkify(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 64);
    linkify_into(text, &mut out);
    out
}

fn trim_trailing_punctuation(url: &str) -> &str {
    let mut trimmed = url;
    while let Some(last) = trimmed.chars().last() {
        if !TRAILING_PUNCTUATION.contains(&last) {
            break;
        }
        // keep a closing paren that balances one inside the URL
        if last == ')' && trimmed.matches('(').count() >= trimmed.matches(')').count() {
            break;
        }
        trimmed = &trimmed[..trimmed.len() - last.len_utf8()];
    }
    trimmed
}
