//! Session history tests

mod common;

use async_trait::async_trait;
use common::*;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use agent_client_core::adapter::SessionPage;
use agent_client_core::config::Settings;
use agent_client_core::history::{
    AgentHistorySource, HistoryFilter, HistorySource, SessionHistoryManager,
};
use agent_client_core::session::{SavedSession, SessionController, SessionStore};
use agent_client_core::{Error, Result};

/// Serves numbered pages of three entries each
struct PagedSource {
    pages: usize,
    calls: AtomicUsize,
    failing: AtomicBool,
    cursors: Mutex<Vec<Option<String>>>,
}

impl PagedSource {
    fn new(pages: usize) -> Arc<Self> {
        Arc::new(Self {
            pages,
            calls: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
            cursors: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl HistorySource for PagedSource {
    async fn list(
        &self,
        agent_id: &str,
        _filter: HistoryFilter,
        cursor: Option<&str>,
    ) -> Result<SessionPage> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.cursors.lock().push(cursor.map(str::to_string));
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Agent("listing unavailable".into()));
        }

        let page: usize = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);
        let sessions = (0..3)
            .map(|i| history_entry(&format!("p{}-{}", page, i), agent_id, "/vault"))
            .collect();
        let next_cursor = (page + 1 < self.pages).then(|| (page + 1).to_string());
        Ok(SessionPage {
            sessions,
            next_cursor,
        })
    }
}

fn ids(entries: &[agent_client_core::session::SessionHistoryEntry]) -> Vec<String> {
    entries.iter().map(|e| e.session_id.clone()).collect()
}

mod manager_tests {
    use super::*;

    #[tokio::test]
    async fn test_first_page_is_cached() {
        let source = PagedSource::new(2);
        let manager = SessionHistoryManager::new(source.clone());

        let first = manager.list_sessions(CLAUDE, HistoryFilter::default()).await.unwrap();
        let again = manager.list_sessions(CLAUDE, HistoryFilter::default()).await.unwrap();

        assert_eq!(first, again);
        assert_eq!(source.calls(), 1);
        assert!(first.has_more());
    }

    #[tokio::test]
    async fn test_filters_are_cached_separately() {
        let source = PagedSource::new(1);
        let manager = SessionHistoryManager::new(source.clone());
        let local_only = HistoryFilter {
            hide_without_local_data: true,
            ..Default::default()
        };

        manager.list_sessions(CLAUDE, HistoryFilter::default()).await.unwrap();
        manager.list_sessions(CLAUDE, local_only).await.unwrap();
        manager.list_sessions(CODEX, HistoryFilter::default()).await.unwrap();
        assert_eq!(source.calls(), 3);
    }

    #[tokio::test]
    async fn test_load_more_appends_pages() {
        let source = PagedSource::new(2);
        let manager = SessionHistoryManager::new(source.clone());
        let filter = HistoryFilter::default();

        manager.list_sessions(CLAUDE, filter).await.unwrap();
        let listing = manager.load_more(CLAUDE, filter).await.unwrap();

        assert_eq!(
            ids(&listing.entries),
            vec!["p0-0", "p0-1", "p0-2", "p1-0", "p1-1", "p1-2"]
        );
        assert!(!listing.has_more());
        assert_eq!(*source.cursors.lock(), vec![None, Some("1".to_string())]);

        // Nothing left to load
        manager.load_more(CLAUDE, filter).await.unwrap();
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn test_load_more_failure_keeps_loaded_pages() {
        let source = PagedSource::new(3);
        let manager = SessionHistoryManager::new(source.clone());
        let filter = HistoryFilter::default();
        manager.list_sessions(CLAUDE, filter).await.unwrap();

        source.set_failing(true);
        let err = manager.load_more(CLAUDE, filter).await.unwrap_err();
        assert!(matches!(err, Error::HistoryLoad(_)));
        assert!(err.is_retryable());

        let cached = manager.cached(CLAUDE, filter).unwrap();
        assert_eq!(cached.entries.len(), 3);
        assert!(cached.has_more());

        source.set_failing(false);
        let listing = manager.load_more(CLAUDE, filter).await.unwrap();
        assert_eq!(listing.entries.len(), 6);
    }

    #[tokio::test]
    async fn test_invalidate_refetches() {
        let source = PagedSource::new(2);
        let manager = SessionHistoryManager::new(source.clone());
        let filter = HistoryFilter::default();
        manager.list_sessions(CLAUDE, filter).await.unwrap();
        manager.list_sessions(CODEX, filter).await.unwrap();

        manager.invalidate(CLAUDE);

        assert!(manager.cached(CLAUDE, filter).is_none());
        assert!(manager.cached(CODEX, filter).is_some());
        manager.list_sessions(CLAUDE, filter).await.unwrap();
        assert_eq!(source.calls(), 3);
    }

    #[tokio::test]
    async fn test_controller_invalidates_on_create() {
        let source = PagedSource::new(1);
        let history = Arc::new(SessionHistoryManager::new(source.clone()));
        let filter = HistoryFilter::default();
        history.list_sessions(CLAUDE, filter).await.unwrap();

        let (factory, _harness) = ScriptedFactory::new();
        let controller = SessionController::spawn(config().with_history(history.clone()), factory);
        controller.create_session(CLAUDE, "/vault").await.unwrap();

        assert!(history.cached(CLAUDE, filter).is_none());
        history.list_sessions(CLAUDE, filter).await.unwrap();
        assert_eq!(source.calls(), 2);
    }
}

mod agent_source_tests {
    use super::*;

    fn save(store: &SessionStore, session_id: &str, agent_id: &str, dir: &str, title: &str) {
        let mut entry = history_entry(session_id, agent_id, dir);
        entry.title = Some(title.into());
        entry.has_local_data = true;
        store
            .save(&SavedSession {
                entry,
                messages: Vec::new(),
            })
            .unwrap();
    }

    fn source_with(
        script: AgentScript,
        store: Arc<SessionStore>,
    ) -> (AgentHistorySource, Arc<Harness>) {
        let (factory, harness) =
            ScriptedFactory::with_scripts(HashMap::from([(CLAUDE.to_string(), script)]));
        let source = AgentHistorySource::new(factory, Settings::default(), Some(store), "/vault");
        (source, harness)
    }

    #[tokio::test]
    async fn test_merges_local_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SessionStore::new(dir.path()));
        save(&store, "b", CLAUDE, "/vault", "Saved b");
        save(&store, "c", CLAUDE, "/vault", "Saved c");
        save(&store, "d", CODEX, "/vault", "Other agent");

        let (source, harness) = source_with(
            AgentScript {
                pages: vec![vec![
                    history_entry("a", CLAUDE, "/vault"),
                    history_entry("b", CLAUDE, "/vault"),
                ]],
                ..Default::default()
            },
            store,
        );

        let page = source.list(CLAUDE, HistoryFilter::default(), None).await.unwrap();

        assert_eq!(ids(&page.sessions), vec!["a", "b", "c"]);
        assert!(!page.sessions[0].has_local_data);
        assert!(page.sessions[1].has_local_data);
        assert_eq!(page.sessions[1].title.as_deref(), Some("Saved b"));
        assert!(page.sessions[2].has_local_data);
        assert_eq!(harness.calls(), vec!["connect", "list"]);

        let filtered = source
            .list(
                CLAUDE,
                HistoryFilter {
                    hide_without_local_data: true,
                    ..Default::default()
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(ids(&filtered.sessions), vec!["b", "c"]);
        // The listing connection is reused
        assert_eq!(harness.calls(), vec!["connect", "list", "list"]);
    }

    #[tokio::test]
    async fn test_local_only_entries_on_first_page_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SessionStore::new(dir.path()));
        save(&store, "local", CLAUDE, "/vault", "Local");

        let (source, _harness) = source_with(
            AgentScript {
                pages: vec![
                    vec![history_entry("a", CLAUDE, "/vault")],
                    vec![history_entry("b", CLAUDE, "/vault")],
                ],
                ..Default::default()
            },
            store,
        );

        let first = source.list(CLAUDE, HistoryFilter::default(), None).await.unwrap();
        assert_eq!(ids(&first.sessions), vec!["a", "local"]);
        assert_eq!(first.next_cursor.as_deref(), Some("1"));

        let second = source
            .list(CLAUDE, HistoryFilter::default(), Some("1"))
            .await
            .unwrap();
        assert_eq!(ids(&second.sessions), vec!["b"]);
        assert!(second.next_cursor.is_none());
    }

    #[tokio::test]
    async fn test_current_vault_only_filters_local_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SessionStore::new(dir.path()));
        save(&store, "here", CLAUDE, "/vault", "Here");
        save(&store, "elsewhere", CLAUDE, "/other", "Elsewhere");

        let (source, _harness) = source_with(AgentScript::default(), store);
        let filter = HistoryFilter {
            current_vault_only: true,
            ..Default::default()
        };

        let page = source.list(CLAUDE, filter, None).await.unwrap();
        assert_eq!(ids(&page.sessions), vec!["here"]);
    }

    #[tokio::test]
    async fn test_without_list_capability_only_local_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SessionStore::new(dir.path()));
        save(&store, "local", CLAUDE, "/vault", "Local");

        let mut script = AgentScript::default();
        script.capabilities.session_capabilities.list = None;
        let (source, _harness) = source_with(script, store);

        let page = source.list(CLAUDE, HistoryFilter::default(), None).await.unwrap();
        assert_eq!(ids(&page.sessions), vec!["local"]);
        assert!(page.next_cursor.is_none());
    }

    #[tokio::test]
    async fn test_connection_failure_is_history_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SessionStore::new(dir.path()));
        let (source, _harness) = source_with(
            AgentScript {
                connect_error: Some("spawn failed".into()),
                ..Default::default()
            },
            store,
        );
        let manager = SessionHistoryManager::new(Arc::new(source));

        let err = manager
            .list_sessions(CLAUDE, HistoryFilter::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::HistoryLoad(_)));
        assert!(manager.cached(CLAUDE, HistoryFilter::default()).is_none());
    }
}
