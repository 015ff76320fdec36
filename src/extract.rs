use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

// ---- Spans ----

/// Half-open `[from, to)` byte-offset range into a document's text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub from: usize,
    pub to: usize,
}

impl Span {
    pub fn new(from: usize, to: usize) -> Self {
        Self { from, to }
    }

    pub fn is_empty(&self) -> bool {
        self.from >= self.to
    }

    pub fn len(&self) -> usize {
        self.to.saturating_sub(self.from)
    }

    /// Orders the endpoints so `from <= to`.
    pub fn normalized(self) -> Self {
        if self.from <= self.to {
            self
        } else {
            Self {
                from: self.to,
                to: self.from,
            }
        }
    }
}

// Fallback behavior when a move is requested with no selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FallbackPolicy {
    None,
    Line,
    #[default]
    Task,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FallbackKind {
    ExplicitSelection,
    CurrentLine,
    TaskBlock,
}

/// What the engine decided to move and what the document looks like without it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionResult {
    pub snippet: String,
    pub removal_span: Span,
    pub cursor_after_removal: usize,
    pub document_after_removal: String,
    pub kind: FallbackKind,
}

/// Output of the rich-text before/after diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovedSegment {
    pub snippet: String,
    pub new_body: String,
}

// ---- Line and task-block geometry ----

static TASK_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*[-*+] \[[ xX]\] ").expect("task line pattern"));

static UNCHECKED_TASK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\s*[-*+] )\[ \] ").expect("unchecked task pattern"));

fn snap_to_char_boundary(doc: &str, mut offset: usize) -> usize {
    offset = offset.min(doc.len());
    while offset > 0 && !doc.is_char_boundary(offset) {
        offset -= 1;
    }
    offset
}

fn clamp_span(doc: &str, span: Span) -> Span {
    let span = span.normalized();
    Span {
        from: snap_to_char_boundary(doc, span.from),
        to: snap_to_char_boundary(doc, span.to),
    }
}

/// Span of the line enclosing `offset`, including the terminating newline
/// (absent only at end of document). An offset sitting on a `\n` belongs to
/// the line that newline terminates.
pub fn find_line_span(doc: &str, offset: usize) -> Span {
    let offset = snap_to_char_boundary(doc, offset);
    let from = doc[..offset].rfind('\n').map(|i| i + 1).unwrap_or(0);
    let to = match doc[offset..].find('\n') {
        Some(i) => offset + i + 1,
        None => doc.len(),
    };
    Span { from, to }
}

/// Whether a line is a Markdown checklist item: optional leading whitespace,
/// a `-`/`*`/`+` bullet, a space, `[ ]`/`[x]`/`[X]`, a space.
pub fn is_task_line(line: &str) -> bool {
    TASK_LINE.is_match(line)
}

/// Extends a task-line seed span over the contiguous run of adjacent task
/// lines. The caller checks that the seed itself is a task line.
pub fn expand_task_block(doc: &str, seed: Span) -> Span {
    let mut from = seed.from;
    let mut to = seed.to;

    while from > 0 {
        let prev = find_line_span(doc, from - 1);
        if prev.to != from || !is_task_line(&doc[prev.from..prev.to]) {
            break;
        }
        from = prev.from;
    }

    while to < doc.len() {
        let next = find_line_span(doc, to);
        if next.from != to || !is_task_line(&doc[next.from..next.to]) {
            break;
        }
        to = next.to;
    }

    Span { from, to }
}

// ---- Extraction ----

/// Picks the text to relocate. A non-empty selection wins; otherwise the
/// fallback policy decides between aborting, the current line, and the
/// enclosing task block. Returns `None` when nothing meaningful would move.
pub fn extract_from_selection(
    doc: &str,
    selection: &[Span],
    cursor_offset: usize,
    policy: FallbackPolicy,
) -> Option<ExtractionResult> {
    let primary = selection
        .iter()
        .map(|s| clamp_span(doc, *s))
        .find(|s| !s.is_empty());

    let (span, kind) = match primary {
        Some(span) => (span, FallbackKind::ExplicitSelection),
        None => match policy {
            FallbackPolicy::None => return None,
            FallbackPolicy::Line => (
                find_line_span(doc, cursor_offset),
                FallbackKind::CurrentLine,
            ),
            FallbackPolicy::Task => {
                let seed = find_line_span(doc, cursor_offset);
                if is_task_line(&doc[seed.from..seed.to]) {
                    (expand_task_block(doc, seed), FallbackKind::TaskBlock)
                } else {
                    (seed, FallbackKind::CurrentLine)
                }
            }
        },
    };

    let snippet = normalize_snippet(&doc[span.from..span.to]);
    if snippet.trim().is_empty() {
        return None;
    }

    let document_after_removal = delete_spans(doc, &[span]);
    Some(ExtractionResult {
        snippet,
        removal_span: span,
        cursor_after_removal: span.from,
        document_after_removal,
        kind,
    })
}

/// Strips carriage returns and trailing whitespace, keeping exactly one
/// trailing newline when the input ended in one.
pub fn normalize_snippet(text: &str) -> String {
    let stripped: String = text.chars().filter(|c| *c != '\r').collect();
    let had_newline = stripped.ends_with('\n');
    let mut out = stripped.trim_end().to_string();
    if had_newline {
        out.push('\n');
    }
    out
}

/// Removes the given non-overlapping spans from the document, applying them
/// in descending `from` order so earlier deletions cannot shift later ones.
pub fn delete_spans(doc: &str, spans: &[Span]) -> String {
    let mut ordered: Vec<Span> = spans.iter().map(|s| clamp_span(doc, *s)).collect();
    ordered.sort_by(|a, b| b.from.cmp(&a.from));

    let mut out = doc.to_string();
    for span in ordered {
        if span.is_empty() {
            continue;
        }
        out.replace_range(span.from..span.to, "");
    }
    out
}

/// Recovers a single contiguous deletion from two document snapshots via the
/// longest common prefix and suffix. Only correct when exactly one contiguous
/// region was removed between the snapshots; concurrent edits elsewhere will
/// misattribute text.
pub fn diff_removed_segment(before: &str, after: &str) -> Option<RemovedSegment> {
    if before == after {
        return None;
    }

    let b = before.as_bytes();
    let a = after.as_bytes();

    let mut prefix = 0usize;
    let max_prefix = b.len().min(a.len());
    while prefix < max_prefix && b[prefix] == a[prefix] {
        prefix += 1;
    }
    while prefix > 0 && !(before.is_char_boundary(prefix) && after.is_char_boundary(prefix)) {
        prefix -= 1;
    }

    let mut suffix = 0usize;
    let max_suffix = (b.len() - prefix).min(a.len() - prefix);
    while suffix < max_suffix && b[b.len() - 1 - suffix] == a[a.len() - 1 - suffix] {
        suffix += 1;
    }
    while suffix > 0
        && !(before.is_char_boundary(b.len() - suffix) && after.is_char_boundary(a.len() - suffix))
    {
        suffix -= 1;
    }

    let removed = &before[prefix..before.len() - suffix];
    if removed.is_empty() {
        return None;
    }

    let mut new_body = String::with_capacity(before.len() - removed.len());
    new_body.push_str(&before[..prefix]);
    new_body.push_str(&before[before.len() - suffix..]);

    Some(RemovedSegment {
        snippet: removed.to_string(),
        new_body,
    })
}

/// Checks every unchecked task line in the snippet. Already-checked lines are
/// left alone, so a second pass toggles nothing.
pub fn toggle_task_checkbox(snippet: &str) -> (String, usize) {
    let mut toggled = 0usize;
    let mut out = String::with_capacity(snippet.len());
    for line in snippet.split_inclusive('\n') {
        if UNCHECKED_TASK.is_match(line) {
            out.push_str(&UNCHECKED_TASK.replace(line, "${1}[x] "));
            toggled += 1;
        } else {
            out.push_str(line);
        }
    }
    (out, toggled)
}
