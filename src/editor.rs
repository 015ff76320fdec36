use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

use crate::bridge::{Bridge, BridgeRequest, BridgeResponse, RequestKind, EDITOR_UNAVAILABLE};
use crate::extract::{self, Span};

// ---- Editor identity and capabilities ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EditorImpl {
    PlainTextV5,
    PlainTextV6,
    RichText,
}

/// What an editor backend can do. The rich-text backend has no way to delete
/// an arbitrary offset span; callers feature-detect instead of attempting it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub read_selection: bool,
    pub delete_spans: bool,
    pub set_cursor: bool,
    pub read_document: bool,
}

impl Capabilities {
    pub fn of(implementation: EditorImpl) -> Self {
        match implementation {
            EditorImpl::PlainTextV5 | EditorImpl::PlainTextV6 => Self {
                read_selection: true,
                delete_spans: true,
                set_cursor: true,
                read_document: true,
            },
            EditorImpl::RichText => Self {
                read_selection: true,
                delete_spans: false,
                set_cursor: true,
                read_document: true,
            },
        }
    }
}

/// Snapshot of the live editor's selection state, produced fresh on every
/// request and never cached across moves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionContext {
    pub text: String,
    pub ranges: Vec<Span>,
    #[serde(rename = "cursorIndex")]
    pub cursor_index: usize,
    #[serde(rename = "docText")]
    pub doc_text: String,
    #[serde(rename = "impl")]
    pub implementation: EditorImpl,
}

// ---- Plain text, offset-addressed (CodeMirror 6 model) ----

#[derive(Debug, Clone, Default)]
pub struct OffsetEditor {
    doc: String,
    selections: Vec<Span>,
    cursor: usize,
}

impl OffsetEditor {
    pub fn new(doc: impl Into<String>) -> Self {
        Self {
            doc: doc.into(),
            selections: Vec::new(),
            cursor: 0,
        }
    }

    pub fn doc(&self) -> &str {
        &self.doc
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn select(&mut self, from: usize, to: usize) {
        self.selections = vec![Span::new(from, to)];
        self.cursor = to.min(self.doc.len());
    }

    pub fn set_cursor(&mut self, offset: usize) {
        self.cursor = offset.min(self.doc.len());
        self.selections.clear();
    }

    fn selection_context(&self) -> SelectionContext {
        let text = self
            .selections
            .iter()
            .map(|s| s.normalized())
            .find(|s| !s.is_empty())
            .map(|s| self.doc[s.from.min(self.doc.len())..s.to.min(self.doc.len())].to_string())
            .unwrap_or_default();
        SelectionContext {
            text,
            ranges: self.selections.clone(),
            cursor_index: self.cursor,
            doc_text: self.doc.clone(),
            implementation: EditorImpl::PlainTextV6,
        }
    }

    fn cut_spans(&mut self, spans: &[Span]) -> String {
        self.doc = extract::delete_spans(&self.doc, spans);
        self.cursor = self.cursor.min(self.doc.len());
        self.selections.clear();
        self.doc.clone()
    }

    fn replace_selection(&mut self, text: &str) {
        let Some(span) = self
            .selections
            .iter()
            .map(|s| s.normalized())
            .find(|s| !s.is_empty())
        else {
            return;
        };
        self.doc.replace_range(span.from..span.to, text);
        self.cursor = span.from + text.len();
        self.selections.clear();
    }
}

// ---- Plain text, line/column-addressed (CodeMirror 5 model) ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Pos {
    pub line: usize,
    pub ch: usize,
}

#[derive(Debug, Clone, Default)]
pub struct LineColEditor {
    lines: Vec<String>,
    selections: Vec<(Pos, Pos)>,
    cursor: Pos,
}

impl LineColEditor {
    pub fn new(doc: &str) -> Self {
        Self {
            lines: doc.split('\n').map(String::from).collect(),
            selections: Vec::new(),
            cursor: Pos { line: 0, ch: 0 },
        }
    }

    pub fn doc_text(&self) -> String {
        self.lines.join("\n")
    }

    pub fn select(&mut self, anchor: Pos, head: Pos) {
        self.selections = vec![(anchor, head)];
        self.cursor = head;
    }

    pub fn set_cursor(&mut self, pos: Pos) {
        self.cursor = pos;
        self.selections.clear();
    }

    pub fn cursor_offset(&self) -> usize {
        self.pos_to_offset(self.cursor)
    }

    /// Line/column to flat offset, a linear scan over line lengths.
    pub fn pos_to_offset(&self, pos: Pos) -> usize {
        let line = pos.line.min(self.lines.len().saturating_sub(1));
        let mut offset = 0;
        for text in self.lines.iter().take(line) {
            offset += text.len() + 1;
        }
        offset + pos.ch.min(self.lines.get(line).map_or(0, |l| l.len()))
    }

    /// Flat offset back to line/column; clamps past-the-end offsets to the
    /// end of the last line.
    pub fn offset_to_pos(&self, offset: usize) -> Pos {
        let mut remaining = offset;
        for (line, text) in self.lines.iter().enumerate() {
            if remaining <= text.len() {
                return Pos {
                    line,
                    ch: remaining,
                };
            }
            remaining -= text.len() + 1;
        }
        Pos {
            line: self.lines.len().saturating_sub(1),
            ch: self.lines.last().map_or(0, |l| l.len()),
        }
    }

    fn selection_context(&self) -> SelectionContext {
        let doc = self.doc_text();
        let ranges: Vec<Span> = self
            .selections
            .iter()
            .map(|(anchor, head)| {
                Span::new(self.pos_to_offset(*anchor), self.pos_to_offset(*head)).normalized()
            })
            .collect();
        let text = ranges
            .iter()
            .find(|s| !s.is_empty())
            .map(|s| doc[s.from..s.to].to_string())
            .unwrap_or_default();
        SelectionContext {
            text,
            ranges,
            cursor_index: self.pos_to_offset(self.cursor),
            doc_text: doc,
            implementation: EditorImpl::PlainTextV5,
        }
    }

    fn cut_spans(&mut self, spans: &[Span]) -> String {
        let updated = extract::delete_spans(&self.doc_text(), spans);
        self.lines = updated.split('\n').map(String::from).collect();
        self.cursor = self.offset_to_pos(self.pos_to_offset(self.cursor));
        self.selections.clear();
        updated
    }

    fn replace_selection(&mut self, text: &str) {
        let Some(span) = self
            .selections
            .iter()
            .map(|(anchor, head)| {
                Span::new(self.pos_to_offset(*anchor), self.pos_to_offset(*head)).normalized()
            })
            .find(|s| !s.is_empty())
        else {
            return;
        };
        let mut doc = self.doc_text();
        doc.replace_range(span.from..span.to, text);
        self.lines = doc.split('\n').map(String::from).collect();
        self.cursor = self.offset_to_pos(span.from + text.len());
        self.selections.clear();
    }

    fn set_cursor_offset(&mut self, offset: usize) {
        self.cursor = self.offset_to_pos(offset);
        self.selections.clear();
    }
}

// ---- Rich text (block-element model) ----

static TASK_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*[-*+] \[([ xX])\] ").expect("task marker pattern"));

/// One block-level element of the rendered document. Checklist items carry
/// their checkbox state the way the DOM carries a checkbox input descendant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RichBlock {
    pub text: String,
    pub checkbox: Option<bool>,
}

impl RichBlock {
    pub fn from_line(line: &str) -> Self {
        let checkbox = TASK_MARKER
            .captures(line)
            .map(|caps| caps.get(1).map_or(false, |m| m.as_str() != " "));
        Self {
            text: line.to_string(),
            checkbox,
        }
    }

    /// Task detection walks the checkbox descendant first, then falls back to
    /// the rendered text matching the bullet-marker prefix.
    fn is_task(&self) -> bool {
        self.checkbox.is_some() || extract::is_task_line(&self.text)
    }
}

/// A caret position in block coordinates, retained across one interaction as
/// the bookmark used for cursor restoration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Bookmark {
    pub block: usize,
    pub offset: usize,
}

pub type ChangeHook = Arc<dyn Fn(String) + Send + Sync>;

#[derive(Clone)]
pub struct RichTextEditor {
    blocks: Vec<RichBlock>,
    trailing_newline: bool,
    caret: Bookmark,
    selection: Option<(Bookmark, Bookmark)>,
    bookmark: Option<Bookmark>,
    on_change: Option<ChangeHook>,
}

impl std::fmt::Debug for RichTextEditor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RichTextEditor")
            .field("blocks", &self.blocks)
            .field("caret", &self.caret)
            .field("selection", &self.selection)
            .finish()
    }
}

impl RichTextEditor {
    pub fn from_markdown(body: &str) -> Self {
        let trailing_newline = body.ends_with('\n');
        let trimmed = if trailing_newline {
            &body[..body.len() - 1]
        } else {
            body
        };
        let mut blocks: Vec<RichBlock> = trimmed.split('\n').map(RichBlock::from_line).collect();
        if blocks.is_empty() {
            blocks.push(RichBlock::from_line(""));
        }
        Self {
            blocks,
            trailing_newline,
            caret: Bookmark::default(),
            selection: None,
            bookmark: None,
            on_change: None,
        }
    }

    /// Host hook fired after every mutation with the new plain text, the way
    /// the host app autosaves the rendered document back into the note body.
    pub fn on_change(&mut self, hook: ChangeHook) {
        self.on_change = Some(hook);
    }

    pub fn plain_text(&self) -> String {
        let mut text = self
            .blocks
            .iter()
            .map(|b| b.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        if self.trailing_newline {
            text.push('\n');
        }
        text
    }

    pub fn place_caret(&mut self, block: usize, offset: usize) {
        let block = block.min(self.blocks.len().saturating_sub(1));
        let offset = offset.min(self.blocks[block].text.len());
        self.caret = Bookmark { block, offset };
        self.selection = None;
    }

    pub fn select_range(&mut self, anchor: Bookmark, head: Bookmark) {
        self.selection = Some(order_bookmarks(anchor, head));
        self.bookmark = Some(self.caret);
    }

    pub fn selected_text(&self) -> String {
        let Some((start, end)) = self.selection else {
            return String::new();
        };
        if start.block == end.block {
            let text = &self.blocks[start.block].text;
            return text[start.offset.min(text.len())..end.offset.min(text.len())].to_string();
        }
        let mut parts = Vec::with_capacity(end.block - start.block + 1);
        let first = &self.blocks[start.block].text;
        parts.push(first[start.offset.min(first.len())..].to_string());
        for block in &self.blocks[start.block + 1..end.block] {
            parts.push(block.text.clone());
        }
        let last = &self.blocks[end.block].text;
        parts.push(last[..end.offset.min(last.len())].to_string());
        parts.join("\n")
    }

    /// Selects the block element containing the caret and returns its text,
    /// retaining a bookmark for later cursor restoration.
    pub fn select_caret_block(&mut self) -> String {
        let block = self.caret.block;
        let len = self.blocks[block].text.len();
        self.selection = Some((
            Bookmark { block, offset: 0 },
            Bookmark { block, offset: len },
        ));
        self.bookmark = Some(self.caret);
        self.blocks[block].text.clone()
    }

    /// Walks sibling blocks outward from the caret while they are checklist
    /// items, selects the run, and returns its text. Falls back to the caret
    /// block alone when it is not a checklist item; the bool reports whether
    /// a task run was selected.
    pub fn select_task_run(&mut self) -> (String, bool) {
        if !self.blocks[self.caret.block].is_task() {
            return (self.select_caret_block(), false);
        }

        let mut first = self.caret.block;
        while first > 0 && self.blocks[first - 1].is_task() {
            first -= 1;
        }
        let mut last = self.caret.block;
        while last + 1 < self.blocks.len() && self.blocks[last + 1].is_task() {
            last += 1;
        }

        let len = self.blocks[last].text.len();
        self.selection = Some((
            Bookmark {
                block: first,
                offset: 0,
            },
            Bookmark {
                block: last,
                offset: len,
            },
        ));
        self.bookmark = Some(self.caret);

        let text = self.blocks[first..=last]
            .iter()
            .map(|b| b.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        (text, true)
    }

    /// The editor's own replace-selection command. Whole-block deletions drop
    /// the emptied elements; partial replacements splice within the blocks.
    /// Fires the change hook afterwards. A no-op without a live selection.
    pub fn replace_selection(&mut self, text: &str) {
        let Some((start, end)) = self.selection else {
            return;
        };
        let start_text = self.blocks[start.block].text.clone();
        let end_text = self.blocks[end.block].text.clone();
        let prefix = &start_text[..start.offset.min(start_text.len())];
        let suffix = &end_text[end.offset.min(end_text.len())..];

        let whole_blocks = start.offset == 0 && end.offset >= end_text.len();
        let merged = format!("{}{}{}", prefix, text, suffix);

        let replacement: Vec<RichBlock> = if merged.is_empty() && whole_blocks {
            Vec::new()
        } else {
            merged.split('\n').map(RichBlock::from_line).collect()
        };

        self.blocks.splice(start.block..=end.block, replacement);
        if self.blocks.is_empty() {
            self.blocks.push(RichBlock::from_line(""));
        }

        let block = start.block.min(self.blocks.len() - 1);
        self.caret = Bookmark { block, offset: 0 };
        self.bookmark = Some(self.caret);
        self.selection = None;

        if let Some(hook) = &self.on_change {
            hook(self.plain_text());
        }
    }

    /// Restores the caret from the bookmark retained by the last selection
    /// read. A no-op when no bookmark was retained.
    pub fn restore_bookmark(&mut self) {
        if let Some(bookmark) = self.bookmark {
            let block = bookmark.block.min(self.blocks.len().saturating_sub(1));
            self.caret = Bookmark {
                block,
                offset: bookmark.offset.min(self.blocks[block].text.len()),
            };
        }
        self.selection = None;
    }

    fn selection_context(&mut self) -> SelectionContext {
        self.bookmark = Some(self.caret);
        SelectionContext {
            text: self.selected_text(),
            ranges: Vec::new(),
            cursor_index: 0,
            doc_text: self.plain_text(),
            implementation: EditorImpl::RichText,
        }
    }
}

fn order_bookmarks(a: Bookmark, b: Bookmark) -> (Bookmark, Bookmark) {
    if (a.block, a.offset) <= (b.block, b.offset) {
        (a, b)
    } else {
        (b, a)
    }
}

// ---- Unified handle ----

#[derive(Debug, Clone)]
pub enum Editor {
    Offset(OffsetEditor),
    LineCol(LineColEditor),
    Rich(RichTextEditor),
}

impl Editor {
    pub fn implementation(&self) -> EditorImpl {
        match self {
            Editor::Offset(_) => EditorImpl::PlainTextV6,
            Editor::LineCol(_) => EditorImpl::PlainTextV5,
            Editor::Rich(_) => EditorImpl::RichText,
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities::of(self.implementation())
    }

    pub fn selection_context(&mut self) -> SelectionContext {
        match self {
            Editor::Offset(editor) => editor.selection_context(),
            Editor::LineCol(editor) => editor.selection_context(),
            Editor::Rich(editor) => editor.selection_context(),
        }
    }
}

// ---- Content script ----

/// The editor handle a content script serves. `None` models a view with no
/// supported editor instance.
pub type SharedEditor = Arc<Mutex<Option<Editor>>>;

pub fn shared_editor(editor: Editor) -> SharedEditor {
    Arc::new(Mutex::new(Some(editor)))
}

/// Registers a delivery channel on the bridge and serves requests against the
/// given editor until the bridge goes away. One script per editor view.
pub fn spawn_content_script(bridge: &Bridge, editor: SharedEditor) -> JoinHandle<()> {
    let mut requests = bridge.open_channel();
    let bridge = bridge.clone();
    tokio::spawn(async move {
        while let Some(request) = requests.recv().await {
            if let Some(response) = handle_request(&editor, &request) {
                bridge.deliver(response);
            }
        }
    })
}

/// Serves one request, or stays silent when the request is targeted at a
/// different backend: broadcasts reach every script, and only the one the
/// selection-context probe resolved may answer a follow-up.
fn handle_request(editor: &SharedEditor, request: &BridgeRequest) -> Option<BridgeResponse> {
    let target = request.payload.as_ref().and_then(|p| p.target);

    let mut guard = editor.lock().expect("editor mutex");
    let Some(editor) = guard.as_mut() else {
        return Some(BridgeResponse::failure(
            &request.request_id,
            EDITOR_UNAVAILABLE,
        ));
    };
    if let Some(target) = target {
        if target != editor.implementation() {
            return None;
        }
    }

    let id = &request.request_id;
    let response = match request.kind {
        RequestKind::GetSelectionContext => {
            let context = editor.selection_context();
            match serde_json::to_value(&context) {
                Ok(data) => BridgeResponse::success(id, data),
                Err(e) => BridgeResponse::failure(id, e.to_string()),
            }
        }
        RequestKind::GetCurrentLine => {
            let text = match editor {
                Editor::Rich(rich) => rich.select_caret_block(),
                Editor::Offset(plain) => current_line_text(plain.doc(), plain.cursor()),
                Editor::LineCol(plain) => {
                    let doc = plain.doc_text();
                    current_line_text(&doc, plain.cursor_offset())
                }
            };
            BridgeResponse::success(id, json!({ "text": text }))
        }
        RequestKind::GetTaskBlock => {
            let (text, task_block) = match editor {
                Editor::Rich(rich) => rich.select_task_run(),
                Editor::Offset(plain) => task_block_text(plain.doc(), plain.cursor()),
                Editor::LineCol(plain) => {
                    let doc = plain.doc_text();
                    task_block_text(&doc, plain.cursor_offset())
                }
            };
            BridgeResponse::success(id, json!({ "text": text, "taskBlock": task_block }))
        }
        RequestKind::CutRanges => {
            let ranges = request
                .payload
                .as_ref()
                .and_then(|p| p.ranges.clone())
                .unwrap_or_default();
            match editor {
                Editor::Rich(_) => BridgeResponse::failure(
                    id,
                    "span deletion is not supported in the rich text editor",
                ),
                Editor::Offset(plain) => {
                    let updated = plain.cut_spans(&ranges);
                    BridgeResponse::success(id, json!({ "updatedDocText": updated }))
                }
                Editor::LineCol(plain) => {
                    let updated = plain.cut_spans(&ranges);
                    BridgeResponse::success(id, json!({ "updatedDocText": updated }))
                }
            }
        }
        RequestKind::ReplaceSelection => {
            let text = request
                .payload
                .as_ref()
                .and_then(|p| p.text.clone())
                .unwrap_or_default();
            match editor {
                Editor::Rich(rich) => rich.replace_selection(&text),
                Editor::Offset(plain) => plain.replace_selection(&text),
                Editor::LineCol(plain) => plain.replace_selection(&text),
            }
            BridgeResponse::success(id, json!({}))
        }
        RequestKind::RestoreCursor => {
            let index = request
                .payload
                .as_ref()
                .and_then(|p| p.index)
                .unwrap_or(0);
            match editor {
                Editor::Rich(rich) => rich.restore_bookmark(),
                Editor::Offset(plain) => plain.set_cursor(index),
                Editor::LineCol(plain) => plain.set_cursor_offset(index),
            }
            BridgeResponse::success(id, json!({}))
        }
    };
    Some(response)
}

fn current_line_text(doc: &str, cursor: usize) -> String {
    let span = extract::find_line_span(doc, cursor);
    doc[span.from..span.to].to_string()
}

fn task_block_text(doc: &str, cursor: usize) -> (String, bool) {
    let seed = extract::find_line_span(doc, cursor);
    if extract::is_task_line(&doc[seed.from..seed.to]) {
        let block = extract::expand_task_block(doc, seed);
        (doc[block.from..block.to].to_string(), true)
    } else {
        (doc[seed.from..seed.to].to_string(), false)
    }
}
