//! Allowlist HTML sanitizer.
//!
//! Parses a message body as an HTML fragment and re-serializes only the
//! allowed tags and attributes. Disallowed tags are unwrapped (their text is
//! kept) except for a few whose content is dropped entirely.

use scraper::{ElementRef, Html, Node};

use super::linkify::{escape_html_into, linkify_into};
use super::ContentError;
use larch_sync_types::ContentUri;

/// Element used in place of `data-mx-maths` markup.
pub const MATH_MARKER_TAG: &str = "larch-math";

/// Deepest element nesting accepted.
pub const MAX_NESTING_DEPTH: usize = 100;

const ALLOWED_TAGS: &[&str] = &[
    "font", "del", "h1", "h2", "h3", "h4", "h5", "h6", "blockquote", "p", "a", "ul", "ol", "sup",
    "sub", "li", "b", "i", "u", "strong", "em", "s", "code", "hr", "br", "div", "table", "thead",
    "tbody", "tr", "th", "td", "caption", "pre", "span", "img", "details", "summary",
];

const VOID_TAGS: &[&str] = &["br", "hr", "img"];

const DROP_WITH_CONTENT: &[&str] = &["mx-reply", "script", "style", "noscript", "template"];

/// Tags whose text must not be linkified.
const NO_LINKIFY_TAGS: &[&str] = &["a", "code", "pre"];

const ALLOWED_LINK_SCHEMES: &[&str] = &["http:", "https:", "mailto:", "matrix:"];

/// Result of sanitizing an HTML body.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SanitizedHtml {
    /// Sanitized HTML.
    pub html: String,
    /// Content URIs of inline images, in document order.
    pub inline_images: Vec<ContentUri>,
    /// A math marker was emitted.
    pub has_math: bool,
}

/// Sanitize an HTML fragment, linkifying text outside links and code.
pub fn sanitize_html(html: &str, linkify: bool) -> Result<SanitizedHtml, ContentError> {
    let fragment = Html::parse_fragment(html);
    let mut sanitizer = Sanitizer {
        out: SanitizedHtml::default(),
        linkify,
        no_linkify_depth: 0,
    };
    sanitizer.walk_children(fragment.root_element(), 0)?;
    Ok(sanitizer.out)
}

struct Sanitizer {
    out: SanitizedHtml,
    linkify: bool,
    no_linkify_depth: usize,
}

impl Sanitizer {
    fn walk_children(&mut self, element: ElementRef<'_>, depth: usize) -> Result<(), ContentError> {
        for child in element.children() {
            match child.value() {
                Node::Text(text) => self.write_text(text),
                Node::Element(_) => {
                    if let Some(child_element) = ElementRef::wrap(child) {
                        self.walk_element(child_element, depth + 1)?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn write_text(&mut self, text: &str) {
        if self.linkify && self.no_linkify_depth == 0 {
            linkify_into(text, &mut self.out.html);
        } else {
            escape_html_into(text, &mut self.out.html);
        }
    }

    fn walk_element(&mut self, element: ElementRef<'_>, depth: usize) -> Result<(), ContentError> {
        if depth > MAX_NESTING_DEPTH {
            return Err(ContentError::TooDeep(MAX_NESTING_DEPTH));
        }
        let value = element.value();
        let name = value.name();

        if DROP_WITH_CONTENT.contains(&name) {
            return Ok(());
        }
        if let Some(latex) = value.attr("data-mx-maths") {
            if name == "div" || name == "span" {
                self.write_math(latex, name == "div");
                return Ok(());
            }
        }
        if !ALLOWED_TAGS.contains(&name) {
            return self.walk_children(element, depth);
        }

        let attrs = match allowed_attributes(element) {
            Some(attrs) => attrs,
            None => return Ok(()),
        };
        if name == "img" {
            if let Some(uri) = value.attr("src").and_then(ContentUri::parse_or_ignore) {
                self.out.inline_images.push(uri);
            }
        }

        let html = &mut self.out.html;
        html.push('<');
        html.push_str(name);
        for (key, val) in &attrs {
            html.push(' ');
            html.push_str(key);
            html.push_str("=\"");
            escape_html_into(val, html);
            html.push('"');
        }
        html.push('>');
        if VOID_TAGS.contains(&name) {
            return Ok(());
        }

        let suppress_linkify = NO_LINKIFY_TAGS.contains(&name);
        if suppress_linkify {
            self.no_linkify_depth += 1;
        }
        let result = self.walk_children(element, depth);
        if suppress_linkify {
            self.no_linkify_depth -= 1;
        }
        result?;

        self.out.html.push_str("</");
        self.out.html.push_str(name);
        self.out.html.push('>');
        Ok(())
    }

    fn write_math(&mut self, latex: &str, block: bool) {
        let html = &mut self.out.html;
        html.push('<');
        html.push_str(MATH_MARKER_TAG);
        html.push_str(if block {
            " displaymode=\"block\">"
        } else {
            " displaymode=\"inline\">"
        });
        escape_html_into(latex, html);
        html.push_str("</");
        html.push_str(MATH_MARKER_TAG);
        html.push('>');
        self.out.has_math = true;
    }
}

/// Filter an allowed element's attributes.
///
/// Returns `None` when the element must be dropped altogether (an image
/// without a valid content URI).
fn allowed_attributes(element: ElementRef<'_>) -> Option<Vec<(&'static str, String)>> {
    let value = element.value();
    let mut attrs: Vec<(&'static str, String)> = Vec::new();
    let copy = |key: &'static str, attrs: &mut Vec<(&'static str, String)>| {
        if let Some(v) = value.attr(key) {
            attrs.push((key, v.to_string()));
        }
    };

    match value.name() {
        "a" => {
            if let Some(href) = value.attr("href").filter(|href| is_allowed_link(href)) {
                attrs.push(("href", href.to_string()));
            }
            attrs.push(("target", "_blank".to_string()));
            attrs.push(("rel", "noreferrer noopener".to_string()));
        }
        "img" => {
            let src = value.attr("src")?;
            ContentUri::parse_or_ignore(src)?;
            attrs.push(("src", src.to_string()));
            for key in ["alt", "title", "width", "height", "data-mx-emoticon"] {
                copy(key, &mut attrs);
            }
        }
        "font" | "span" => {
            for key in ["data-mx-color", "data-mx-bg-color", "color"] {
                if let Some(color) = value.attr(key).filter(|c| is_hex_color(c)) {
                    attrs.push((key, color.to_string()));
                }
            }
            copy("data-mx-spoiler", &mut attrs);
        }
        "ol" => {
            if let Some(start) = value.attr("start").filter(|s| s.parse::<u32>().is_ok()) {
                attrs.push(("start", start.to_string()));
            }
        }
        "code" => {
            if let Some(class) = value.attr("class").filter(|c| c.starts_with("language-")) {
                attrs.push(("class", class.to_string()));
            }
        }
        _ => {}
    }
    Some(attrs)
}

fn is_allowed_link(href: &str) -> bool {
    let lower = href.trim().to_ascii_lowercase();
    ALLOWED_LINK_SCHEMES
        .iter()
        .any(|scheme| lower.starts_with(scheme))
}

fn is_hex_color(value: &str) -> bool {
    value.len() == 7
        && value.starts_with('#')
        && value[1..].chars().all(|c| c.is_ascii_hexdigit())
}
