use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

pub mod bridge;
pub mod compose;
pub mod editor;
pub mod extract;
pub mod mover;
pub mod store;

pub use bridge::{Bridge, BridgeError, BridgeRequest, BridgeResponse, RequestKind};
pub use editor::{Editor, EditorImpl, SelectionContext};
pub use extract::{FallbackPolicy, Span};
pub use mover::{MoveError, MoveOutcome, Mover};
pub use store::{FolderStore, FsVault, Note, NoteStore};

// App settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// What to move when nothing is selected.
    pub fallback: FallbackPolicy,
    /// Fixed destination note; overrides per-notebook resolution when set.
    pub destination_note_id: Option<String>,
    /// Create a destination note per notebook when none is configured.
    pub auto_create: bool,
    /// Title used to find or create the per-notebook destination.
    pub destination_title: String,
    /// Slash-separated folder path the destination lives in; defaults to the
    /// source note's notebook.
    pub destination_folder: Option<String>,
    pub header_template: Option<String>,
    pub blank_line_after_header: bool,
    /// Check off every open task in the snippet as it moves.
    pub complete_tasks: bool,
    /// Recorded per-notebook destination notes (folder id -> note id).
    pub destinations: HashMap<String, String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            fallback: FallbackPolicy::Task,
            destination_note_id: None,
            auto_create: true,
            destination_title: "Inbox".to_string(),
            destination_folder: None,
            header_template: Some("### {{date}} - {{title}}".to_string()),
            blank_line_after_header: true,
            complete_tasks: false,
            destinations: HashMap::new(),
        }
    }
}

// Load settings from disk
pub fn load_settings(path: &Path) -> Settings {
    if path.exists() {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default()
    } else {
        Settings::default()
    }
}

// Save settings to disk
pub fn save_settings(path: &Path, settings: &Settings) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = serde_json::to_string_pretty(settings)?;
    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let mut settings = Settings::default();
        settings.fallback = FallbackPolicy::Line;
        settings
            .destinations
            .insert("work".to_string(), "work/Inbox".to_string());

        save_settings(&path, &settings).unwrap();
        let loaded = load_settings(&path);
        assert_eq!(loaded.fallback, FallbackPolicy::Line);
        assert_eq!(
            loaded.destinations.get("work"),
            Some(&"work/Inbox".to_string())
        );
    }

    #[test]
    fn test_missing_settings_file_yields_defaults() {
        let loaded = load_settings(Path::new("/nonexistent/settings.json"));
        assert_eq!(loaded.fallback, FallbackPolicy::Task);
        assert!(loaded.auto_create);
        assert_eq!(loaded.destination_title, "Inbox");
    }

    #[test]
    fn test_partial_settings_fill_in_defaults() {
        let parsed: Settings = serde_json::from_str(r#"{ "fallback": "none" }"#).unwrap();
        assert_eq!(parsed.fallback, FallbackPolicy::None);
        assert_eq!(parsed.destination_title, "Inbox");
        assert!(parsed.blank_line_after_header);
    }

    #[test]
    fn test_settings_wire_names_are_camel_case() {
        let wire = serde_json::to_value(Settings::default()).unwrap();
        assert!(wire.get("destinationTitle").is_some());
        assert!(wire.get("blankLineAfterHeader").is_some());
        assert!(wire.get("completeTasks").is_some());
    }
}
