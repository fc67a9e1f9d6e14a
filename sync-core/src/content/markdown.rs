//! HTML to markdown conversion for edit sources.
//!
//! Produces the text a user would type to get the given formatted body,
//! so an edit can start from it.

use scraper::{ElementRef, Html, Node};

/// Convert a formatted message body to editable markdown.
pub fn html_to_markdown(html: &str) -> String {
    let fragment = Html::parse_fragment(html);
    let raw = render_children(fragment.root_element(), false);
    clean_markdown(&raw)
}

fn render_children(element: ElementRef<'_>, in_pre: bool) -> String {
    let mut out = String::new();
    for child in element.children() {
        match child.value() {
            Node::Text(text) => {
                if in_pre {
                    out.push_str(text);
                } else {
                    escape_markdown_into(text, &mut out);
                }
            }
            Node::Element(_) => {
                if let Some(child_element) = ElementRef::wrap(child) {
                    out.push_str(&render_element(child_element, in_pre));
                }
            }
            _ => {}
        }
    }
    out
}

fn render_element(element: ElementRef<'_>, in_pre: bool) -> String {
    let value = element.value();
    let name = value.name();

    if let Some(latex) = value.attr("data-mx-maths") {
        return if name == "div" {
            format!("\n\n$$\n{}\n$$\n\n", latex)
        } else {
            format!("${}$", latex)
        };
    }

    match name {
        "mx-reply" | "script" | "style" => String::new(),
        "strong" | "b" => wrap_inline("**", &render_children(element, in_pre)),
        "em" | "i" => wrap_inline("_", &render_children(element, in_pre)),
        "del" | "s" | "strike" => wrap_inline("~~", &render_children(element, in_pre)),
        "u" => format!("<u>{}</u>", render_children(element, in_pre)),
        "code" if in_pre => element.text().collect(),
        "code" => {
            let text: String = element.text().collect();
            if text.contains('`') {
                format!("`` {} ``", text)
            } else {
                format!("`{}`", text)
            }
        }
        "pre" => render_code_block(element),
        "a" => {
            let text = render_children(element, in_pre);
            match value.attr("href") {
                Some(href) if href == text || text.is_empty() => href.to_string(),
                Some(href) => format!("[{}]({})", text, href),
                None => text,
            }
        }
        "span" if value.attr("data-mx-spoiler").is_some() => {
            format!("||{}||", render_children(element, in_pre))
        }
        "img" => value
            .attr("alt")
            .or_else(|| value.attr("title"))
            .unwrap_or_default()
            .to_string(),
        "br" => "\n".to_string(),
        "hr" => "\n\n---\n\n".to_string(),
        "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
            let level = name[1..].parse::<usize>().unwrap_or(1);
            format!(
                "\n\n{} {}\n\n",
                "#".repeat(level),
                render_children(element, in_pre).trim()
            )
        }
        "p" | "div" | "details" | "summary" | "table" => {
            format!("\n\n{}\n\n", render_children(element, in_pre).trim())
        }
        "tr" => format!("{}\n", render_children(element, in_pre).trim()),
        "td" | "th" => format!("{} ", render_children(element, in_pre).trim()),
        "blockquote" => {
            let inner = clean_markdown(&render_children(element, in_pre));
            let quoted: Vec<String> = inner.lines().map(|line| format!("> {}", line)).collect();
            format!("\n\n{}\n\n", quoted.join("\n"))
        }
        "ul" | "ol" => render_list(element, name == "ol"),
        _ => render_children(element, in_pre),
    }
}

fn render_code_block(element: ElementRef<'_>) -> String {
    let language = element
        .children()
        .filter_map(ElementRef::wrap)
        .find(|child| child.value().name() == "code")
        .and_then(|code| code.value().attr("class"))
        .and_then(|class| class.strip_prefix("language-"))
        .unwrap_or_default();
    let body: String = element.text().collect();
    format!(
        "\n\n```{}\n{}\n```\n\n",
        language,
        body.trim_end_matches('\n')
    )
}

fn render_list(element: ElementRef<'_>, ordered: bool) -> String {
    let start = element
        .value()
        .attr("start")
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1);
    let mut lines = Vec::new();
    let items = element
        .children()
        .filter_map(ElementRef::wrap)
        .filter(|child| child.value().name() == "li");
    for (i, item) in items.enumerate() {
        let marker = if ordered {
            format!("{}. ", start + i)
        } else {
            "- ".to_string()
        };
        let body = clean_markdown(&render_children(item, false));
        let indent = " ".repeat(marker.len());
        let mut item_lines = body.lines();
        let first = item_lines.next().unwrap_or_default();
        lines.push(format!("{}{}", marker, first));
        for line in item_lines {
            if line.is_empty() {
                lines.push(String::new());
            } else {
                lines.push(format!("{}{}", indent, line));
            }
        }
    }
    format!("\n\n{}\n\n", lines.join("\n"))
}

fn wrap_inline(marker: &str, inner: &str) -> String {
    if inner.trim().is_empty() {
        return inner.to_string();
    }
    format!("{}{}{}", marker, inner, marker)
}

fn escape_markdown_into(text: &str, out: &mut String) {
    for c in text.chars() {
        if matches!(c, '\\' | '*' | '_' | '`' | '~') {
            out.push('\\');
        }
        out.push(c);
    }
}

/// Collapse runs of blank lines and trim.
fn clean_markdown(md: &str) -> String {
    let mut result = String::with_capacity(md.len());
    let mut blank_count = 0;
    for line in md.lines() {
        if line.trim().is_empty() {
            blank_count += 1;
            if blank_count <= 1 {
                result.push('\n');
            }
        } else {
            blank_count = 0;
            result.push_str(line.trim_end());
            result.push('\n');
        }
    }
    result.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_formatting() {
        assert_eq!(
            html_to_markdown("<b>bold</b> <em>it</em> <del>gone</del> <code>x_y</code>"),
            "**bold** _it_ ~~gone~~ `x_y`"
        );
    }

    #[test]
    fn plain_text_is_escaped() {
        assert_eq!(html_to_markdown("snake_case *star*"), "snake\\_case \\*star\\*");
    }

    #[test]
    fn links() {
        assert_eq!(
            html_to_markdown("<a href=\"https://example.org\">site</a>"),
            "[site](https://example.org)"
        );
        assert_eq!(
            html_to_markdown("<a href=\"https://example.org\">https://example.org</a>"),
            "https://example.org"
        );
    }

    #[test]
    fn paragraphs_and_line_breaks() {
        assert_eq!(html_to_markdown("<p>one</p><p>two<br>three</p>"), "one\n\ntwo\nthree");
    }

    #[test]
    fn code_block_keeps_language() {
        assert_eq!(
            html_to_markdown("<pre><code class=\"language-rust\">fn main() {}\n</code></pre>"),
            "```rust\nfn main() {}\n```"
        );
    }

    #[test]
    fn lists() {
        assert_eq!(
            html_to_markdown("<ul><li>a</li><li>b</li></ul>"),
            "- a\n- b"
        );
        assert_eq!(
            html_to_markdown("<ol start=\"3\"><li>c</li><li>d</li></ol>"),
            "3. c\n4. d"
        );
    }

    #[test]
    fn blockquote() {
        assert_eq!(
            html_to_markdown("<blockquote><p>quoted</p></blockquote><p>reply</p>"),
            "> quoted\n\nreply"
        );
    }

    #[test]
    fn spoilers_and_math() {
        assert_eq!(
            html_to_markdown("<span data-mx-spoiler>secret</span> <span data-mx-maths=\"a+b\">a+b</span>"),
            "||secret|| $a+b$"
        );
    }

    #[test]
    fn reply_fallback_is_ignored() {
        assert_eq!(html_to_markdown("<mx-reply>old</mx-reply>new"), "new");
    }
}
