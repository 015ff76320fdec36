use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// ---- Store entities ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Note {
    pub id: String,
    pub title: String,
    pub body: String,
    #[serde(rename = "parentId")]
    pub parent_id: String,
    #[serde(rename = "updatedAt")]
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoteMetadata {
    pub id: String,
    pub title: String,
    #[serde(rename = "parentId")]
    pub parent_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Folder {
    pub id: String,
    pub title: String,
    #[serde(rename = "parentId")]
    pub parent_id: String,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("note '{0}' not found")]
    NoteNotFound(String),
    #[error("folder '{0}' not found")]
    FolderNotFound(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Note CRUD the move orchestrator needs. Ids are opaque to the caller;
/// folder ids are the `parent_id` values notes report.
pub trait NoteStore {
    fn get(&self, id: &str) -> Result<Note, StoreError>;
    fn put_body(&self, id: &str, body: &str) -> Result<(), StoreError>;
    fn create(&self, title: &str, parent_id: &str) -> Result<Note, StoreError>;
    fn search_title(&self, title: &str, folder_id: &str) -> Result<Vec<NoteMetadata>, StoreError>;
}

pub trait FolderStore {
    fn folder_title(&self, folder_id: &str) -> Result<String, StoreError>;
    fn list_folders(&self) -> Result<Vec<Folder>, StoreError>;
}

/// Resolves a slash-separated folder path ("Projects/Inbox") by walking title
/// segments against parent ids. An empty path resolves to the root folder.
pub fn resolve_folder_path(store: &impl FolderStore, path: &str) -> Result<String, StoreError> {
    let folders = store.list_folders()?;
    let mut parent = String::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        let next = folders
            .iter()
            .find(|f| f.parent_id == parent && f.title == segment)
            .ok_or_else(|| StoreError::FolderNotFound(path.to_string()))?;
        parent = next.id.clone();
    }
    Ok(parent)
}

// ---- Filesystem vault ----

/// Markdown notes in a folder tree. Note ids are slash-separated relative
/// paths without the `.md` extension; folder ids are relative directory
/// paths, with the empty string naming the vault root.
#[derive(Debug, Clone)]
pub struct FsVault {
    root: PathBuf,
}

impl FsVault {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn note_path(&self, id: &str) -> Result<PathBuf, StoreError> {
        if id.is_empty() || id.split('/').any(|s| s.is_empty() || s == "." || s == "..") {
            return Err(StoreError::NoteNotFound(id.to_string()));
        }
        Ok(self.root.join(format!("{}.md", id)))
    }

    fn folder_path(&self, id: &str) -> Result<PathBuf, StoreError> {
        if id.split('/').any(|s| s == "." || s == "..") {
            return Err(StoreError::FolderNotFound(id.to_string()));
        }
        Ok(self.root.join(id))
    }

    fn collect_folders(&self, dir: &Path, prefix: &str, out: &mut Vec<Folder>) -> std::io::Result<()> {
        for entry in std::fs::read_dir(dir)?.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) if !name.starts_with('.') => name.to_string(),
                _ => continue,
            };
            let id = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{}/{}", prefix, name)
            };
            out.push(Folder {
                id: id.clone(),
                title: name,
                parent_id: prefix.to_string(),
            });
            self.collect_folders(&path, &id, out)?;
        }
        Ok(())
    }

    fn notes_in_folder(&self, folder_id: &str) -> Result<Vec<NoteMetadata>, StoreError> {
        let dir = self.folder_path(folder_id)?;
        if !dir.is_dir() {
            return Err(StoreError::FolderNotFound(folder_id.to_string()));
        }
        let mut notes = Vec::new();
        for entry in std::fs::read_dir(&dir)?.flatten() {
            let path = entry.path();
            if !path.extension().map_or(false, |ext| ext == "md") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let id = if folder_id.is_empty() {
                stem.to_string()
            } else {
                format!("{}/{}", folder_id, stem)
            };
            let content = std::fs::read_to_string(&path)?;
            notes.push(NoteMetadata {
                id,
                title: note_title(&content, stem),
                parent_id: folder_id.to_string(),
            });
        }
        Ok(notes)
    }
}

impl NoteStore for FsVault {
    fn get(&self, id: &str) -> Result<Note, StoreError> {
        let path = self.note_path(id)?;
        if !path.exists() {
            return Err(StoreError::NoteNotFound(id.to_string()));
        }
        let body = std::fs::read_to_string(&path)?;
        let stem = id.rsplit('/').next().unwrap_or(id);
        Ok(Note {
            id: id.to_string(),
            title: note_title(&body, stem),
            body,
            parent_id: parent_of(id),
            updated_at: mtime_unix(&path),
        })
    }

    fn put_body(&self, id: &str, body: &str) -> Result<(), StoreError> {
        let path = self.note_path(id)?;
        if !path.exists() {
            return Err(StoreError::NoteNotFound(id.to_string()));
        }
        std::fs::write(&path, body)?;
        Ok(())
    }

    fn create(&self, title: &str, parent_id: &str) -> Result<Note, StoreError> {
        let dir = self.folder_path(parent_id)?;
        std::fs::create_dir_all(&dir)?;

        let base = sanitize_filename(title);
        let mut stem = base.clone();
        let mut counter = 1;
        while dir.join(format!("{}.md", stem)).exists() {
            stem = format!("{}-{}", base, counter);
            counter += 1;
        }

        let body = format!("# {}\n\n", title);
        let path = dir.join(format!("{}.md", stem));
        std::fs::write(&path, &body)?;

        let id = if parent_id.is_empty() {
            stem
        } else {
            format!("{}/{}", parent_id, stem)
        };
        Ok(Note {
            id,
            title: title.to_string(),
            body,
            parent_id: parent_id.to_string(),
            updated_at: mtime_unix(&path),
        })
    }

    fn search_title(&self, title: &str, folder_id: &str) -> Result<Vec<NoteMetadata>, StoreError> {
        let needle = title.to_lowercase();
        Ok(self
            .notes_in_folder(folder_id)?
            .into_iter()
            .filter(|note| note.title.to_lowercase() == needle)
            .collect())
    }
}

impl FolderStore for FsVault {
    fn folder_title(&self, folder_id: &str) -> Result<String, StoreError> {
        if folder_id.is_empty() {
            return Ok(String::new());
        }
        let path = self.folder_path(folder_id)?;
        if !path.is_dir() {
            return Err(StoreError::FolderNotFound(folder_id.to_string()));
        }
        Ok(folder_id.rsplit('/').next().unwrap_or(folder_id).to_string())
    }

    fn list_folders(&self) -> Result<Vec<Folder>, StoreError> {
        let mut folders = Vec::new();
        self.collect_folders(&self.root, "", &mut folders)?;
        Ok(folders)
    }
}

// ---- Helpers ----

fn parent_of(id: &str) -> String {
    match id.rsplit_once('/') {
        Some((parent, _)) => parent.to_string(),
        None => String::new(),
    }
}

/// Title of a note: the first `# ` heading anywhere in the body, else the
/// file stem. The heading may sit below prepended content, so the whole body
/// is scanned rather than just the first non-empty line.
fn note_title(body: &str, stem: &str) -> String {
    for line in body.lines() {
        if let Some(title) = line.trim().strip_prefix("# ") {
            let title = title.trim();
            if !title.is_empty() {
                return title.to_string();
            }
        }
    }
    stem.to_string()
}

// Sanitize a note title into a filename stem.
fn sanitize_filename(title: &str) -> String {
    let sanitized: String = title
        .chars()
        .filter(|c| *c != '\u{00A0}' && *c != '\u{FEFF}')
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '-',
            _ => c,
        })
        .collect();

    let trimmed = sanitized.trim();
    if trimmed.is_empty() || trimmed.starts_with('.') {
        "untitled".to_string()
    } else {
        trimmed.to_string()
    }
}

fn mtime_unix(path: &Path) -> i64 {
    std::fs::metadata(path)
        .ok()
        .and_then(|m| m.modified().ok())
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vault() -> (tempfile::TempDir, FsVault) {
        let dir = tempfile::tempdir().expect("tempdir");
        let vault = FsVault::new(dir.path());
        (dir, vault)
    }

    #[test]
    fn test_create_then_get_round_trips() {
        let (_dir, vault) = vault();
        let note = vault.create("Inbox", "").unwrap();
        assert_eq!(note.id, "Inbox");
        assert_eq!(note.body, "# Inbox\n\n");

        let fetched = vault.get("Inbox").unwrap();
        assert_eq!(fetched.title, "Inbox");
        assert_eq!(fetched.parent_id, "");
    }

    #[test]
    fn test_create_avoids_stem_collisions() {
        let (_dir, vault) = vault();
        let first = vault.create("Inbox", "").unwrap();
        let second = vault.create("Inbox", "").unwrap();
        assert_eq!(first.id, "Inbox");
        assert_eq!(second.id, "Inbox-1");
    }

    #[test]
    fn test_create_in_subfolder() {
        let (_dir, vault) = vault();
        let note = vault.create("Todo", "work/projects").unwrap();
        assert_eq!(note.id, "work/projects/Todo");
        assert_eq!(note.parent_id, "work/projects");
        assert_eq!(vault.get("work/projects/Todo").unwrap().title, "Todo");
    }

    #[test]
    fn test_put_body_requires_existing_note() {
        let (_dir, vault) = vault();
        assert!(matches!(
            vault.put_body("missing", "body"),
            Err(StoreError::NoteNotFound(_))
        ));

        vault.create("Note", "").unwrap();
        vault.put_body("Note", "new body\n").unwrap();
        assert_eq!(vault.get("Note").unwrap().body, "new body\n");
    }

    #[test]
    fn test_title_prefers_heading_anywhere_in_body() {
        let (_dir, vault) = vault();
        vault.create("Inbox", "").unwrap();
        vault
            .put_body("Inbox", "moved snippet\n\n# Inbox\n\n")
            .unwrap();
        assert_eq!(vault.get("Inbox").unwrap().title, "Inbox");
    }

    #[test]
    fn test_title_falls_back_to_stem() {
        let (_dir, vault) = vault();
        vault.create("notes", "").unwrap();
        vault.put_body("notes", "no heading here\n").unwrap();
        assert_eq!(vault.get("notes").unwrap().title, "notes");
    }

    #[test]
    fn test_search_title_is_scoped_to_folder() {
        let (_dir, vault) = vault();
        vault.create("Inbox", "").unwrap();
        vault.create("Inbox", "work").unwrap();

        let root_hits = vault.search_title("inbox", "").unwrap();
        assert_eq!(root_hits.len(), 1);
        assert_eq!(root_hits[0].id, "Inbox");

        let work_hits = vault.search_title("Inbox", "work").unwrap();
        assert_eq!(work_hits.len(), 1);
        assert_eq!(work_hits[0].id, "work/Inbox");
    }

    #[test]
    fn test_list_folders_reports_parent_ids() {
        let (_dir, vault) = vault();
        std::fs::create_dir_all(vault.root().join("a/b")).unwrap();
        std::fs::create_dir_all(vault.root().join("c")).unwrap();

        let mut folders = vault.list_folders().unwrap();
        folders.sort_by(|x, y| x.id.cmp(&y.id));
        let ids: Vec<_> = folders.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "a/b", "c"]);
        assert_eq!(folders[1].parent_id, "a");
        assert_eq!(folders[1].title, "b");
    }

    #[test]
    fn test_resolve_folder_path_walks_titles() {
        let (_dir, vault) = vault();
        std::fs::create_dir_all(vault.root().join("work/projects")).unwrap();

        assert_eq!(resolve_folder_path(&vault, "").unwrap(), "");
        assert_eq!(resolve_folder_path(&vault, "work").unwrap(), "work");
        assert_eq!(
            resolve_folder_path(&vault, "work/projects").unwrap(),
            "work/projects"
        );
        assert!(matches!(
            resolve_folder_path(&vault, "work/missing"),
            Err(StoreError::FolderNotFound(_))
        ));
    }

    #[test]
    fn test_note_ids_cannot_escape_the_vault() {
        let (_dir, vault) = vault();
        assert!(vault.get("../outside").is_err());
        assert!(vault.get("").is_err());
    }

    #[test]
    fn test_folder_title_of_nested_folder() {
        let (_dir, vault) = vault();
        std::fs::create_dir_all(vault.root().join("work/projects")).unwrap();
        assert_eq!(vault.folder_title("work/projects").unwrap(), "projects");
        assert_eq!(vault.folder_title("").unwrap(), "");
        assert!(vault.folder_title("nope").is_err());
    }
}
