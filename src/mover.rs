use serde::Serialize;
use std::time::Duration;

use crate::bridge::{Bridge, BridgeError, RequestKind, RequestPayload};
use crate::compose;
use crate::editor::{Capabilities, EditorImpl, SelectionContext};
use crate::extract::{self, FallbackKind, FallbackPolicy};
use crate::store::{resolve_folder_path, FolderStore, Note, NoteStore, StoreError};
use crate::Settings;

/// Pacing of the rich-text change poll: bounded attempts at a fixed interval,
/// returning the last-seen state on exhaustion.
pub const POLL_INTERVAL: Duration = Duration::from_millis(150);
pub const MAX_POLL_ATTEMPTS: u32 = 20;

// ---- Errors and outcomes ----

#[derive(Debug, thiserror::Error)]
pub enum MoveError {
    #[error("no supported editor instance found")]
    EditorUnavailable,
    #[error("the editor did not answer in time")]
    BridgeTimeout,
    #[error("the editor bridge is unavailable")]
    BridgeChannelUnavailable,
    #[error("nothing to move")]
    NothingToMove,
    #[error("no destination note could be resolved: {0}")]
    DestinationUnresolved(String),
    #[error("the rich text editor reported no removed content")]
    RichTextDiffEmpty,
    #[error("editor request failed: {0}")]
    Editor(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<BridgeError> for MoveError {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::Timeout => MoveError::BridgeTimeout,
            BridgeError::ChannelUnavailable => MoveError::BridgeChannelUnavailable,
            BridgeError::EditorUnavailable => MoveError::EditorUnavailable,
            BridgeError::Request(message) => MoveError::Editor(message),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveOutcome {
    pub destination_id: String,
    pub snippet_len: usize,
    pub toggled_tasks: usize,
    pub kind: FallbackKind,
}

/// Configuration snapshot resolved once per move and passed through the whole
/// flow, so mid-move settings changes cannot split a single operation.
#[derive(Debug, Clone)]
pub struct MoveConfig {
    pub fallback: FallbackPolicy,
    pub destination_note_id: Option<String>,
    pub auto_create: bool,
    pub destination_title: String,
    pub destination_folder: Option<String>,
    pub header_template: Option<String>,
    pub blank_line_after_header: bool,
    pub complete_tasks: bool,
}

impl MoveConfig {
    pub fn snapshot(settings: &Settings) -> Self {
        Self {
            fallback: settings.fallback,
            destination_note_id: settings.destination_note_id.clone(),
            auto_create: settings.auto_create,
            destination_title: settings.destination_title.clone(),
            destination_folder: settings.destination_folder.clone(),
            header_template: settings.header_template.clone(),
            blank_line_after_header: settings.blank_line_after_header,
            complete_tasks: settings.complete_tasks,
        }
    }
}

// ---- Orchestrator ----

pub struct Mover<S> {
    bridge: Bridge,
    store: S,
}

impl<S: NoteStore + FolderStore> Mover<S> {
    pub fn new(bridge: Bridge, store: S) -> Self {
        Self { bridge, store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Moves the current selection (or its fallback) out of the source note
    /// into the configured destination. Nothing is deleted from the source
    /// until a destination note is secured. The recorded per-notebook
    /// destination map in `settings` may be updated; the caller persists it.
    pub async fn move_from(
        &self,
        source_id: &str,
        settings: &mut Settings,
    ) -> Result<MoveOutcome, MoveError> {
        let config = MoveConfig::snapshot(settings);
        let source = self.store.get(source_id)?;

        let context = self.request_selection().await?;
        let capabilities = Capabilities::of(context.implementation);

        if capabilities.delete_spans {
            self.move_structural(&source, &context, &config, settings)
                .await
        } else {
            self.move_by_diff(&source, &context, &config, settings).await
        }
    }

    async fn request_selection(&self) -> Result<SelectionContext, MoveError> {
        let data = self
            .bridge
            .request(RequestKind::GetSelectionContext, None)
            .await?;
        serde_json::from_value(data).map_err(|e| MoveError::Editor(e.to_string()))
    }

    /// Plain-text path: extraction is computed offline on the returned
    /// document text, then applied to the live buffer as a span deletion.
    async fn move_structural(
        &self,
        source: &Note,
        context: &SelectionContext,
        config: &MoveConfig,
        settings: &mut Settings,
    ) -> Result<MoveOutcome, MoveError> {
        let extraction = extract::extract_from_selection(
            &context.doc_text,
            &context.ranges,
            context.cursor_index,
            config.fallback,
        )
        .ok_or(MoveError::NothingToMove)?;

        let (snippet, toggled) = if config.complete_tasks {
            extract::toggle_task_checkbox(&extraction.snippet)
        } else {
            (extraction.snippet.clone(), 0)
        };

        let destination = self.resolve_destination(source, config, settings)?;

        let data = self
            .bridge
            .request(
                RequestKind::CutRanges,
                Some(RequestPayload {
                    ranges: Some(vec![extraction.removal_span]),
                    ..RequestPayload::for_target(context.implementation)
                }),
            )
            .await?;
        let updated_doc = data
            .get("updatedDocText")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| extraction.document_after_removal.clone());

        let outcome = self.deliver_snippet(
            source,
            &destination,
            &snippet,
            toggled,
            extraction.kind,
            config,
            &updated_doc,
        )?;

        self.restore_cursor(extraction.cursor_after_removal, context.implementation)
            .await;
        Ok(outcome)
    }

    /// Rich-text path: there is no span deletion, so the live selection is
    /// cleared through the editor's own replace-selection command and the
    /// removed text is recovered by diffing the persisted body snapshots.
    async fn move_by_diff(
        &self,
        source: &Note,
        context: &SelectionContext,
        config: &MoveConfig,
        settings: &mut Settings,
    ) -> Result<MoveOutcome, MoveError> {
        let before = source.body.clone();

        let target = Some(RequestPayload::for_target(context.implementation));
        let kind = if context.text.trim().is_empty() {
            match config.fallback {
                FallbackPolicy::None => return Err(MoveError::NothingToMove),
                FallbackPolicy::Line => {
                    let data = self
                        .bridge
                        .request(RequestKind::GetCurrentLine, target.clone())
                        .await?;
                    let text = data.get("text").and_then(|v| v.as_str()).unwrap_or("");
                    if text.trim().is_empty() {
                        return Err(MoveError::NothingToMove);
                    }
                    FallbackKind::CurrentLine
                }
                FallbackPolicy::Task => {
                    let data = self
                        .bridge
                        .request(RequestKind::GetTaskBlock, target.clone())
                        .await?;
                    let text = data.get("text").and_then(|v| v.as_str()).unwrap_or("");
                    if text.trim().is_empty() {
                        return Err(MoveError::NothingToMove);
                    }
                    if data
                        .get("taskBlock")
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false)
                    {
                        FallbackKind::TaskBlock
                    } else {
                        FallbackKind::CurrentLine
                    }
                }
            }
        } else {
            FallbackKind::ExplicitSelection
        };

        let destination = self.resolve_destination(source, config, settings)?;

        self.bridge
            .request(
                RequestKind::ReplaceSelection,
                Some(RequestPayload {
                    text: Some(String::new()),
                    ..RequestPayload::for_target(context.implementation)
                }),
            )
            .await?;

        let after = self.poll_for_change(&source.id, &before).await?;
        let removed =
            extract::diff_removed_segment(&before, &after).ok_or(MoveError::RichTextDiffEmpty)?;

        let snippet = extract::normalize_snippet(&removed.snippet);
        if snippet.trim().is_empty() {
            return Err(MoveError::RichTextDiffEmpty);
        }
        let (snippet, toggled) = if config.complete_tasks {
            extract::toggle_task_checkbox(&snippet)
        } else {
            (snippet, 0)
        };

        let outcome = self.deliver_snippet(
            source,
            &destination,
            &snippet,
            toggled,
            kind,
            config,
            &removed.new_body,
        )?;

        self.restore_cursor(0, context.implementation).await;
        Ok(outcome)
    }

    /// Waits for the host to reflect the rich-text edit back into the
    /// persisted note body. Bounded; hands back the last-seen body when the
    /// attempts run out instead of hanging.
    async fn poll_for_change(&self, note_id: &str, before: &str) -> Result<String, MoveError> {
        let mut last_seen = before.to_string();
        for _ in 0..MAX_POLL_ATTEMPTS {
            tokio::time::sleep(POLL_INTERVAL).await;
            let note = self.store.get(note_id)?;
            if note.body != before {
                return Ok(note.body);
            }
            last_seen = note.body;
        }
        Ok(last_seen)
    }

    /// Destination resolution: an explicitly configured note wins; otherwise
    /// a per-notebook note is reused via the recorded mapping or a title
    /// search, and created only when neither exists. Failures here are fatal
    /// to the move.
    fn resolve_destination(
        &self,
        source: &Note,
        config: &MoveConfig,
        settings: &mut Settings,
    ) -> Result<Note, MoveError> {
        let destination = self.resolve_destination_inner(source, config, settings)?;
        if destination.id == source.id {
            return Err(MoveError::DestinationUnresolved(
                "the destination note is the note being edited".to_string(),
            ));
        }
        Ok(destination)
    }

    fn resolve_destination_inner(
        &self,
        source: &Note,
        config: &MoveConfig,
        settings: &mut Settings,
    ) -> Result<Note, MoveError> {
        if let Some(id) = &config.destination_note_id {
            return self
                .store
                .get(id)
                .map_err(|e| MoveError::DestinationUnresolved(e.to_string()));
        }

        if !config.auto_create {
            return Err(MoveError::DestinationUnresolved(
                "no destination note is configured and auto-create is disabled".to_string(),
            ));
        }

        let folder_id = match &config.destination_folder {
            Some(path) => resolve_folder_path(&self.store, path)
                .map_err(|e| MoveError::DestinationUnresolved(e.to_string()))?,
            None => source.parent_id.clone(),
        };

        if let Some(mapped) = settings.destinations.get(&folder_id) {
            if let Ok(note) = self.store.get(mapped) {
                return Ok(note);
            }
        }

        if let Some(existing) = self
            .store
            .search_title(&config.destination_title, &folder_id)?
            .into_iter()
            .next()
        {
            settings
                .destinations
                .insert(folder_id, existing.id.clone());
            return self.store.get(&existing.id).map_err(MoveError::from);
        }

        let note = self
            .store
            .create(&config.destination_title, &folder_id)
            .map_err(|e| MoveError::DestinationUnresolved(e.to_string()))?;
        settings.destinations.insert(folder_id, note.id.clone());
        Ok(note)
    }

    /// Composes the insertion block and writes both notes: destination first
    /// so the snippet can never be lost, then the source without the snippet.
    fn deliver_snippet(
        &self,
        source: &Note,
        destination: &Note,
        snippet: &str,
        toggled: usize,
        kind: FallbackKind,
        config: &MoveConfig,
        new_source_body: &str,
    ) -> Result<MoveOutcome, MoveError> {
        let header = config.header_template.as_deref().map(|template| {
            // A failed notebook lookup is cosmetic; the header renders with
            // an empty name instead of failing the move.
            let notebook = if source.parent_id.is_empty() {
                String::new()
            } else {
                self.store
                    .folder_title(&source.parent_id)
                    .unwrap_or_default()
            };
            compose::render_header(
                template,
                &source.title,
                &notebook,
                chrono::Local::now().naive_local(),
            )
        });

        let block = compose::compose_block(
            header.as_deref(),
            snippet,
            config.blank_line_after_header,
        );
        let destination_body = compose::prepend_to_body(&block, &destination.body);

        self.warn_if_stale(destination);
        self.store.put_body(&destination.id, &destination_body)?;

        self.warn_if_stale(source);
        self.store.put_body(&source.id, new_source_body)?;

        Ok(MoveOutcome {
            destination_id: destination.id.clone(),
            snippet_len: snippet.len(),
            toggled_tasks: toggled,
            kind,
        })
    }

    /// Best-effort staleness check: last-write-wins, but a concurrent change
    /// since the read is reported instead of silently overwritten.
    fn warn_if_stale(&self, note: &Note) {
        if let Ok(current) = self.store.get(&note.id) {
            if current.updated_at != note.updated_at {
                eprintln!(
                    "Warning: note '{}' changed while the move was in flight; overwriting with the move result",
                    note.id
                );
            }
        }
    }

    /// Cursor restoration is cosmetic; failures are reported, not fatal.
    async fn restore_cursor(&self, index: usize, target: EditorImpl) {
        let result = self
            .bridge
            .request(
                RequestKind::RestoreCursor,
                Some(RequestPayload {
                    index: Some(index),
                    ..RequestPayload::for_target(target)
                }),
            )
            .await;
        if let Err(e) = result {
            eprintln!("Warning: could not restore the cursor: {}", e);
        }
    }
}
