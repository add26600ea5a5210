//! Session history
//!
//! Lists persisted sessions independently of any live connection. Pages are
//! fetched from a [`HistorySource`] and cached per agent and filter; the
//! controller invalidates an agent's cache after it creates, forks, deletes
//! or saves a session.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::adapter::{AdapterFactory, AgentAdapter, SessionPage};
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::session::{SessionHistoryEntry, SessionStore};

/// Which sessions a listing includes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct HistoryFilter {
    /// Only sessions whose working directory is the vault
    pub current_vault_only: bool,
    /// Only sessions with a transcript in the local store
    pub hide_without_local_data: bool,
}

/// Every page loaded so far for one agent and filter
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryListing {
    pub entries: Vec<SessionHistoryEntry>,
    pub next_cursor: Option<String>,
}

impl HistoryListing {
    pub fn has_more(&self) -> bool {
        self.next_cursor.is_some()
    }

    fn append(&mut self, page: SessionPage) {
        let known: HashSet<String> = self.entries.iter().map(|e| e.session_id.clone()).collect();
        self.entries.extend(
            page.sessions
                .into_iter()
                .filter(|entry| !known.contains(&entry.session_id)),
        );
        self.next_cursor = page.next_cursor;
    }
}

/// Where listings come from
#[async_trait]
pub trait HistorySource: Send + Sync {
    async fn list(
        &self,
        agent_id: &str,
        filter: HistoryFilter,
        cursor: Option<&str>,
    ) -> Result<SessionPage>;
}

type CacheKey = (String, HistoryFilter);

/// Paginated, cached session listings shared by every view
pub struct SessionHistoryManager {
    source: Arc<dyn HistorySource>,
    cache: Mutex<HashMap<CacheKey, HistoryListing>>,
    /// Bumped on invalidation so fetches started earlier are not cached
    epochs: Mutex<HashMap<String, u64>>,
}

impl SessionHistoryManager {
    pub fn new(source: Arc<dyn HistorySource>) -> Self {
        Self {
            source,
            cache: Mutex::new(HashMap::new()),
            epochs: Mutex::new(HashMap::new()),
        }
    }

    fn epoch(&self, agent_id: &str) -> u64 {
        self.epochs.lock().get(agent_id).copied().unwrap_or(0)
    }

    pub fn cached(&self, agent_id: &str, filter: HistoryFilter) -> Option<HistoryListing> {
        self.cache
            .lock()
            .get(&(agent_id.to_string(), filter))
            .cloned()
    }

    /// First page, served from the cache when present
    pub async fn list_sessions(&self, agent_id: &str, filter: HistoryFilter) -> Result<HistoryListing> {
        if let Some(listing) = self.cached(agent_id, filter) {
            return Ok(listing);
        }
        self.refresh(agent_id, filter).await
    }

    /// Drop cached pages for this filter and fetch the first page again
    pub async fn refresh(&self, agent_id: &str, filter: HistoryFilter) -> Result<HistoryListing> {
        let epoch = self.epoch(agent_id);
        let page = self.fetch(agent_id, filter, None).await?;

        let mut listing = HistoryListing::default();
        listing.append(page);
        self.store(agent_id, filter, epoch, listing.clone());
        Ok(listing)
    }

    /// Append the next page. On failure the pages loaded so far are kept.
    pub async fn load_more(&self, agent_id: &str, filter: HistoryFilter) -> Result<HistoryListing> {
        let Some(current) = self.cached(agent_id, filter) else {
            return self.list_sessions(agent_id, filter).await;
        };
        let Some(cursor) = current.next_cursor.clone() else {
            return Ok(current);
        };

        let epoch = self.epoch(agent_id);
        let page = self.fetch(agent_id, filter, Some(&cursor)).await?;

        let mut listing = current;
        listing.append(page);
        self.store(agent_id, filter, epoch, listing.clone());
        Ok(listing)
    }

    /// Forget every cached listing of an agent
    pub fn invalidate(&self, agent_id: &str) {
        *self.epochs.lock().entry(agent_id.to_string()).or_insert(0) += 1;
        self.cache.lock().retain(|(agent, _), _| agent != agent_id);
        debug!(agent_id, "History cache invalidated");
    }

    async fn fetch(
        &self,
        agent_id: &str,
        filter: HistoryFilter,
        cursor: Option<&str>,
    ) -> Result<SessionPage> {
        self.source
            .list(agent_id, filter, cursor)
            .await
            .map_err(|e| {
                warn!(agent_id, ?cursor, "Failed to load session history: {}", e);
                match e {
                    Error::HistoryLoad(_) => e,
                    other => Error::HistoryLoad(other.to_string()),
                }
            })
    }

    fn store(&self, agent_id: &str, filter: HistoryFilter, epoch: u64, listing: HistoryListing) {
        if self.epoch(agent_id) != epoch {
            debug!(agent_id, "Discarding history page fetched before invalidation");
            return;
        }
        self.cache
            .lock()
            .insert((agent_id.to_string(), filter), listing);
    }
}

/// Listings from the agent's `session/list` merged with the local store
///
/// Keeps one listing connection per agent, separate from live sessions.
pub struct AgentHistorySource {
    factory: Arc<dyn AdapterFactory>,
    settings: Settings,
    store: Option<Arc<SessionStore>>,
    vault_path: PathBuf,
    connections: tokio::sync::Mutex<HashMap<String, Arc<dyn AgentAdapter>>>,
}

impl AgentHistorySource {
    pub fn new(
        factory: Arc<dyn AdapterFactory>,
        settings: Settings,
        store: Option<Arc<SessionStore>>,
        vault_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            factory,
            settings,
            store,
            vault_path: vault_path.into(),
            connections: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    async fn connection(&self, agent_id: &str) -> Result<Arc<dyn AgentAdapter>> {
        let mut connections = self.connections.lock().await;
        if let Some(adapter) = connections.get(agent_id) {
            return Ok(adapter.clone());
        }

        let agent = self
            .settings
            .agent(agent_id)
            .ok_or_else(|| Error::UnknownAgent(agent_id.to_string()))?;
        // Listing connections never carry a live session
        let (notices, _) = mpsc::unbounded_channel();
        let adapter = self.factory.create(&agent, notices)?;
        adapter.connect(&self.vault_path).await?;

        debug!(agent_id, "Opened history listing connection");
        connections.insert(agent_id.to_string(), adapter.clone());
        Ok(adapter)
    }

    async fn drop_connection(&self, agent_id: &str) {
        let adapter = self.connections.lock().await.remove(agent_id);
        if let Some(adapter) = adapter {
            if let Err(e) = adapter.disconnect().await {
                warn!(agent_id, "Error while disconnecting listing connection: {}", e);
            }
        }
    }

    /// Close every listing connection
    pub async fn disconnect_all(&self) {
        let adapters: Vec<_> = self.connections.lock().await.drain().collect();
        for (agent_id, adapter) in adapters {
            if let Err(e) = adapter.disconnect().await {
                warn!(agent_id = %agent_id, "Error while disconnecting listing connection: {}", e);
            }
        }
    }

    fn local_entries(&self, agent_id: &str, cwd: Option<&Path>) -> Vec<SessionHistoryEntry> {
        let Some(store) = &self.store else {
            return Vec::new();
        };
        match store.list() {
            Ok(entries) => entries
                .into_iter()
                .filter(|entry| entry.agent_id == agent_id)
                .filter(|entry| cwd.is_none_or(|cwd| entry.working_directory == cwd))
                .collect(),
            Err(e) => {
                warn!("Failed to list local sessions: {}", e);
                Vec::new()
            }
        }
    }

    async fn agent_page(
        &self,
        agent_id: &str,
        cwd: Option<&Path>,
        cursor: Option<&str>,
    ) -> Result<SessionPage> {
        let adapter = self.connection(agent_id).await?;
        match adapter.list_sessions(cwd, cursor).await {
            Ok(page) => Ok(page),
            Err(Error::UnsupportedCapability(reason)) => {
                debug!(agent_id, "Listing local sessions only: {}", reason);
                Ok(SessionPage::default())
            }
            Err(e) => {
                // The next attempt reconnects
                self.drop_connection(agent_id).await;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl HistorySource for AgentHistorySource {
    async fn list(
        &self,
        agent_id: &str,
        filter: HistoryFilter,
        cursor: Option<&str>,
    ) -> Result<SessionPage> {
        let cwd = filter
            .current_vault_only
            .then_some(self.vault_path.as_path());

        let mut page = self.agent_page(agent_id, cwd, cursor).await?;
        let local = self.local_entries(agent_id, cwd);
        let local_by_id: HashMap<&str, &SessionHistoryEntry> = local
            .iter()
            .map(|entry| (entry.session_id.as_str(), entry))
            .collect();

        for entry in &mut page.sessions {
            if let Some(saved) = local_by_id.get(entry.session_id.as_str()) {
                entry.has_local_data = true;
                if entry.title.is_none() {
                    entry.title = saved.title.clone();
                }
            }
        }

        if cursor.is_none() {
            let listed: HashSet<String> = page
                .sessions
                .iter()
                .map(|entry| entry.session_id.clone())
                .collect();
            page.sessions.extend(
                local
                    .iter()
                    .filter(|entry| !listed.contains(&entry.session_id))
                    .cloned(),
            );
        }

        if filter.hide_without_local_data {
            page.sessions.retain(|entry| entry.has_local_data);
        }
        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str) -> SessionHistoryEntry {
        SessionHistoryEntry {
            session_id: id.into(),
            title: None,
            agent_id: "claude-code-acp".into(),
            working_directory: "/vault".into(),
            updated_at: None,
            has_local_data: false,
        }
    }

    #[test]
    fn test_listing_append_skips_duplicates() {
        let mut listing = HistoryListing::default();
        listing.append(SessionPage {
            sessions: vec![entry("a"), entry("b")],
            next_cursor: Some("c1".into()),
        });
        assert!(listing.has_more());

        listing.append(SessionPage {
            sessions: vec![entry("b"), entry("c")],
            next_cursor: None,
        });
        let ids: Vec<_> = listing.entries.iter().map(|e| e.session_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!(!listing.has_more());
    }
}
