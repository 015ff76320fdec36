use chrono::NaiveDateTime;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};

// ---- Header templating ----

static DATE_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{date(?::([^}]*))?\}\}").expect("date token pattern"));

static UNRESOLVED_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{[^}]+\}\}").expect("unresolved token pattern"));

const DEFAULT_DATE_FORMAT: &str = "YYYY-MM-DD";

/// Translates `YYYY`/`MM`/`DD`/`HH`/`mm`/`ss` tokens into a chrono format
/// string; every other character passes through literally.
fn date_format(tokens: &str) -> String {
    let mut out = String::with_capacity(tokens.len());
    let mut rest = tokens;
    while !rest.is_empty() {
        let (eaten, replacement) = if rest.starts_with("YYYY") {
            (4, "%Y")
        } else if rest.starts_with("MM") {
            (2, "%m")
        } else if rest.starts_with("DD") {
            (2, "%d")
        } else if rest.starts_with("HH") {
            (2, "%H")
        } else if rest.starts_with("mm") {
            (2, "%M")
        } else if rest.starts_with("ss") {
            (2, "%S")
        } else {
            (0, "")
        };
        if eaten > 0 {
            out.push_str(replacement);
            rest = &rest[eaten..];
        } else if let Some(ch) = rest.chars().next() {
            if ch == '%' {
                out.push_str("%%");
            } else {
                out.push(ch);
            }
            rest = &rest[ch.len_utf8()..];
        }
    }
    out
}

/// Backslash-escapes Markdown-significant characters so a substituted value
/// cannot inject formatting into the rendered header.
pub fn escape_markdown(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        if matches!(
            ch,
            '\\' | '`' | '*' | '_' | '{' | '}' | '[' | ']' | '(' | ')' | '#' | '+' | '!' | '|' | '>'
        ) {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

/// Renders a header template, substituting `{{date}}` (with an optional
/// `{{date:FMT}}` sub-format), `{{title}}`, and `{{notebook}}`. Unresolved
/// `{{...}}` tokens are removed.
pub fn render_header(template: &str, title: &str, notebook: &str, now: NaiveDateTime) -> String {
    let rendered = DATE_TOKEN.replace_all(template, |caps: &Captures| {
        let tokens = caps
            .get(1)
            .map(|m| m.as_str())
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_DATE_FORMAT);
        now.format(&date_format(tokens)).to_string()
    });
    let rendered = rendered.replace("{{title}}", &escape_markdown(title));
    let rendered = rendered.replace("{{notebook}}", &escape_markdown(notebook));
    UNRESOLVED_TOKEN.replace_all(&rendered, "").to_string()
}

// ---- Block composition ----

/// Builds the block to insert into the destination: optional header, optional
/// blank line, then the snippet. The result always ends in exactly one
/// newline.
pub fn compose_block(header: Option<&str>, snippet: &str, blank_line_after_header: bool) -> String {
    let mut block = String::new();
    if let Some(header) = header {
        let header = header.trim_end();
        if !header.is_empty() {
            block.push_str(header);
            block.push('\n');
            if blank_line_after_header {
                block.push('\n');
            }
        }
    }
    block.push_str(snippet.trim_end());
    block.push('\n');
    block
}

/// Prepends the composed block to the destination body with exactly one blank
/// line of separation before pre-existing content. Leading newlines in the
/// existing body are stripped so repeated moves cannot accumulate blank lines.
pub fn prepend_to_body(block: &str, existing_body: &str) -> String {
    let existing = existing_body.trim_start_matches('\n');
    if existing.is_empty() {
        return block.to_string();
    }
    format!("{}\n{}", block, existing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn sample_date() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 5)
            .unwrap()
            .and_hms_opt(14, 30, 45)
            .unwrap()
    }

    #[test]
    fn test_render_header_date_and_title() {
        let rendered = render_header(
            "### {{date:YYYY-MM-DD}} — {{title}}",
            "Groceries",
            "Personal",
            sample_date(),
        );
        assert_eq!(rendered, "### 2024-03-05 — Groceries");
    }

    #[test]
    fn test_render_header_default_date_format() {
        assert_eq!(
            render_header("{{date}}", "t", "n", sample_date()),
            "2024-03-05"
        );
    }

    #[test]
    fn test_render_header_time_tokens() {
        assert_eq!(
            render_header("{{date:YYYY-MM-DD HH:mm:ss}}", "t", "n", sample_date()),
            "2024-03-05 14:30:45"
        );
    }

    #[test]
    fn test_render_header_notebook_substitution() {
        assert_eq!(
            render_header("{{notebook}} / {{title}}", "Todo", "Work", sample_date()),
            "Work / Todo"
        );
    }

    #[test]
    fn test_render_header_escapes_markdown_in_values() {
        let rendered = render_header("{{title}}", "My *bold* [note]", "n", sample_date());
        assert_eq!(rendered, "My \\*bold\\* \\[note\\]");
    }

    #[test]
    fn test_render_header_strips_unknown_tokens() {
        assert_eq!(
            render_header("a {{mystery}} b", "t", "n", sample_date()),
            "a  b"
        );
    }

    #[test]
    fn test_render_header_value_cannot_inject_tokens() {
        let rendered = render_header("{{title}}", "{{notebook}}", "secret", sample_date());
        assert_eq!(rendered, "\\{\\{notebook\\}\\}");
    }

    #[test]
    fn test_compose_block_with_header_and_blank_line() {
        let block = compose_block(Some("## Header"), "snippet text\n", true);
        assert_eq!(block, "## Header\n\nsnippet text\n");
    }

    #[test]
    fn test_compose_block_without_blank_line() {
        let block = compose_block(Some("## Header  "), "snippet text", false);
        assert_eq!(block, "## Header\nsnippet text\n");
    }

    #[test]
    fn test_compose_block_without_header() {
        assert_eq!(compose_block(None, "just text\n\n", true), "just text\n");
    }

    #[test]
    fn test_compose_block_blank_header_is_skipped() {
        assert_eq!(compose_block(Some("   "), "text", true), "text\n");
    }

    #[test]
    fn test_prepend_to_empty_body() {
        assert_eq!(prepend_to_body("block\n", ""), "block\n");
    }

    #[test]
    fn test_prepend_to_existing_body_has_one_blank_line() {
        assert_eq!(
            prepend_to_body("block\n", "existing\n"),
            "block\n\nexisting\n"
        );
    }

    #[test]
    fn test_prepend_strips_leading_newlines_from_existing() {
        assert_eq!(
            prepend_to_body("block\n", "\n\n\nexisting\n"),
            "block\n\nexisting\n"
        );
    }

    #[test]
    fn test_prepend_never_builds_three_blank_lines() {
        for existing in ["", "\n", "\n\n\n", "x", "\nx", "\n\n\n\nx\n"] {
            let out = prepend_to_body("block\n", existing);
            assert!(!out.contains("\n\n\n"), "seam too wide for {:?}", existing);
        }
    }

    #[test]
    fn test_repeated_moves_keep_seam_stable() {
        let first = prepend_to_body(&compose_block(None, "one", false), "# Inbox\n\n");
        let second = prepend_to_body(&compose_block(None, "two", false), &first);
        assert_eq!(second, "two\n\none\n\n# Inbox\n\n");
    }
}
