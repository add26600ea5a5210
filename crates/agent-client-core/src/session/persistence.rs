//! Session persistence - save and load transcripts
//!
//! Each session is one pretty-printed JSON file named after its id. The
//! presence of a file is what `has_local_data` reports.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::session::types::{ChatMessage, SessionHistoryEntry};

/// Maximum characters kept from the first user message as a title
pub const TITLE_MAX_CHARS: usize = 50;

/// Saved session state for persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedSession {
    pub entry: SessionHistoryEntry,
    pub messages: Vec<ChatMessage>,
}

/// Session title derived from the first user message
pub fn title_from_text(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.chars().take(TITLE_MAX_CHARS).collect())
}

#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Store under the platform data directory
    pub fn open_default() -> Result<Self> {
        Ok(Self::new(Self::default_dir()?))
    }

    /// Get the sessions directory path
    pub fn default_dir() -> Result<PathBuf> {
        let base = dirs::data_dir()
            .map(|p| p.join("agent-client"))
            .ok_or_else(|| Error::Config("Could not find data directory".to_string()))?;
        Ok(base.join("sessions"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        let name: String = session_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{}.json", name))
    }

    pub fn save(&self, session: &SavedSession) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(&session.entry.session_id);
        let json = serde_json::to_string_pretty(session)?;
        std::fs::write(&path, json)?;
        debug!(session_id = %session.entry.session_id, "Saved session to {:?}", path);
        Ok(())
    }

    /// Load a saved session by ID
    pub fn load(&self, session_id: &str) -> Result<Option<SavedSession>> {
        let path = self.path_for(session_id);
        if !path.exists() {
            return Ok(None);
        }

        let json = std::fs::read_to_string(&path)?;
        let saved: SavedSession = serde_json::from_str(&json)?;
        Ok(Some(saved))
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.path_for(session_id).exists()
    }

    /// Returns whether a file was removed
    pub fn delete(&self, session_id: &str) -> Result<bool> {
        let path = self.path_for(session_id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// List all saved sessions, most recent first
    pub fn list(&self) -> Result<Vec<SessionHistoryEntry>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                match std::fs::read_to_string(&path) {
                    Ok(json) => match serde_json::from_str::<SavedSession>(&json) {
                        Ok(session) => entries.push(SessionHistoryEntry {
                            has_local_data: true,
                            ..session.entry
                        }),
                        Err(e) => warn!("Failed to parse session {:?}: {}", path, e),
                    },
                    Err(e) => warn!("Failed to read session {:?}: {}", path, e),
                }
            }
        }

        entries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn saved(id: &str, minutes_ago: i64) -> SavedSession {
        SavedSession {
            entry: SessionHistoryEntry {
                session_id: id.into(),
                title: Some(format!("Session {}", id)),
                agent_id: "claude-code-acp".into(),
                working_directory: "/vault".into(),
                updated_at: Some(Utc::now() - Duration::minutes(minutes_ago)),
                has_local_data: true,
            },
            messages: Vec::new(),
        }
    }

    #[test]
    fn test_title_truncation() {
        assert_eq!(title_from_text("   "), None);
        assert_eq!(title_from_text("  hello \n").as_deref(), Some("hello"));

        let long = "é".repeat(80);
        assert_eq!(title_from_text(&long).unwrap().chars().count(), TITLE_MAX_CHARS);
    }

    #[test]
    fn test_save_load_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());

        assert!(store.load("a").unwrap().is_none());
        store.save(&saved("a", 0)).unwrap();
        assert!(store.contains("a"));
        assert_eq!(store.load("a").unwrap().unwrap().entry.session_id, "a");

        assert!(store.delete("a").unwrap());
        assert!(!store.delete("a").unwrap());
        assert!(!store.contains("a"));
    }

    #[test]
    fn test_list_sorted_and_skips_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());

        store.save(&saved("old", 60)).unwrap();
        store.save(&saved("new", 1)).unwrap();
        std::fs::write(dir.path().join("broken.json"), "{not json").unwrap();

        let ids: Vec<_> = store.list().unwrap().into_iter().map(|e| e.session_id).collect();
        assert_eq!(ids, vec!["new", "old"]);
    }

    #[test]
    fn test_ids_are_sanitized() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());

        store.save(&saved("../escape/id", 0)).unwrap();
        assert!(dir.path().join(".._escape_id.json").exists());
        assert!(store.contains("../escape/id"));
    }
}
