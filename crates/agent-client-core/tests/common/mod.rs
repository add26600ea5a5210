//! Shared helpers for controller and history tests
//!
//! `ScriptedFactory` hands out in-memory adapters that record every call and
//! let the test drive the active turn by pushing events.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

use agent_client_acp::{
    AgentCapabilities, ModelInfo, PermissionOption, PermissionOptionKind, PromptCapabilities,
    SessionCapabilities, SessionMode, SessionModeState, SessionModelState, StopReason,
};
use agent_client_core::adapter::{
    AdapterFactory, AgentAdapter, LoadedSession, NewSession, NoticeSender, PermissionResponse,
    PromptBlock, SessionNotice, SessionPage, TurnEvent, TurnStream,
};
use agent_client_core::config::{AgentConfig, Settings};
use agent_client_core::session::{
    ControllerConfig, ControllerSnapshot, PermissionRequest, SessionController,
    SessionHistoryEntry,
};
use agent_client_core::{Error, Result};

pub const CLAUDE: &str = "claude-code-acp";
pub const CODEX: &str = "codex-acp";

/// Behaviour of the adapters created for one agent
#[derive(Clone)]
pub struct AgentScript {
    pub capabilities: AgentCapabilities,
    pub modes: Option<SessionModeState>,
    pub models: Option<SessionModelState>,
    pub connect_error: Option<String>,
    pub load_error: Option<String>,
    pub fork_error: Option<String>,
    /// Events replayed by `load_session`
    pub transcript: Vec<TurnEvent>,
    pub load_delay: Duration,
    /// Whether `cancel` ends the turn with `Cancelled`
    pub cancel_confirms: bool,
    /// Pages served by `list_sessions`; the cursor is the page index
    pub pages: Vec<Vec<SessionHistoryEntry>>,
}

impl Default for AgentScript {
    fn default() -> Self {
        Self {
            capabilities: AgentCapabilities {
                load_session: true,
                prompt_capabilities: PromptCapabilities::default(),
                session_capabilities: SessionCapabilities {
                    list: Some(serde_json::json!({})),
                    fork: Some(serde_json::json!({})),
                    delete: Some(serde_json::json!({})),
                },
            },
            modes: Some(SessionModeState {
                current_mode_id: "ask".into(),
                available_modes: vec![
                    SessionMode {
                        id: "ask".into(),
                        name: "Ask".into(),
                        description: None,
                    },
                    SessionMode {
                        id: "code".into(),
                        name: "Code".into(),
                        description: None,
                    },
                ],
            }),
            models: Some(SessionModelState {
                current_model_id: "fast".into(),
                available_models: vec![
                    ModelInfo {
                        model_id: "fast".into(),
                        name: "Fast".into(),
                        description: None,
                    },
                    ModelInfo {
                        model_id: "smart".into(),
                        name: "Smart".into(),
                        description: None,
                    },
                ],
            }),
            connect_error: None,
            load_error: None,
            fork_error: None,
            transcript: Vec::new(),
            load_delay: Duration::ZERO,
            cancel_confirms: true,
            pages: Vec::new(),
        }
    }
}

struct ActiveTurn {
    message_id: String,
    events: mpsc::UnboundedSender<TurnEvent>,
}

/// State shared by the factory, its adapters and the test
#[derive(Default)]
pub struct Harness {
    calls: Mutex<Vec<String>>,
    created: Mutex<Vec<String>>,
    responses: Mutex<Vec<(String, PermissionResponse)>>,
    turn: Mutex<Option<ActiveTurn>>,
    notices: Mutex<Option<NoticeSender>>,
    sessions: AtomicUsize,
    turns: AtomicUsize,
}

impl Harness {
    fn record(&self, call: impl Into<String>) {
        self.calls.lock().push(call.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn called(&self, call: &str) -> bool {
        self.calls.lock().iter().any(|c| c == call)
    }

    /// Agent ids adapters were created for, in order
    pub fn created(&self) -> Vec<String> {
        self.created.lock().clone()
    }

    pub fn responses(&self) -> Vec<(String, PermissionResponse)> {
        self.responses.lock().clone()
    }

    pub fn message_id(&self) -> String {
        self.turn
            .lock()
            .as_ref()
            .map(|t| t.message_id.clone())
            .expect("no active turn")
    }

    /// Push an event to the active turn; ignored when there is none
    pub fn emit(&self, event: TurnEvent) {
        if let Some(turn) = self.turn.lock().as_ref() {
            let _ = turn.events.send(event);
        }
    }

    pub fn text(&self, text: &str) {
        let message_id = self.message_id();
        self.emit(TurnEvent::TextDelta {
            message_id,
            text: text.into(),
        });
    }

    pub fn request_permission(&self, request_id: &str) {
        let message_id = self.message_id();
        self.emit(TurnEvent::PermissionRequest {
            message_id,
            request: permission_request(request_id),
        });
    }

    pub fn end_turn(&self) {
        if let Some(turn) = self.turn.lock().take() {
            let _ = turn.events.send(TurnEvent::TurnEnd {
                stop_reason: StopReason::EndTurn,
            });
        }
    }

    pub fn fail_turn(&self, message: &str) {
        if let Some(turn) = self.turn.lock().take() {
            let _ = turn.events.send(TurnEvent::Error {
                message: message.into(),
            });
        }
    }

    pub fn notice(&self, notice: SessionNotice) {
        if let Some(notices) = self.notices.lock().as_ref() {
            let _ = notices.send(notice);
        }
    }
}

pub struct ScriptedFactory {
    harness: Arc<Harness>,
    scripts: HashMap<String, AgentScript>,
}

impl ScriptedFactory {
    pub fn new() -> (Arc<Self>, Arc<Harness>) {
        Self::with_scripts(HashMap::new())
    }

    pub fn with_script(script: AgentScript) -> (Arc<Self>, Arc<Harness>) {
        Self::with_scripts(HashMap::from([(CLAUDE.to_string(), script)]))
    }

    pub fn with_scripts(scripts: HashMap<String, AgentScript>) -> (Arc<Self>, Arc<Harness>) {
        let harness = Arc::new(Harness::default());
        let factory = Arc::new(Self {
            harness: harness.clone(),
            scripts,
        });
        (factory, harness)
    }
}

impl AdapterFactory for ScriptedFactory {
    fn create(&self, agent: &AgentConfig, notices: NoticeSender) -> Result<Arc<dyn AgentAdapter>> {
        self.harness.created.lock().push(agent.id.clone());
        *self.harness.notices.lock() = Some(notices);
        Ok(Arc::new(ScriptedAdapter {
            agent_id: agent.id.clone(),
            script: self.scripts.get(&agent.id).cloned().unwrap_or_default(),
            harness: self.harness.clone(),
        }))
    }
}

pub struct ScriptedAdapter {
    agent_id: String,
    script: AgentScript,
    harness: Arc<Harness>,
}

impl ScriptedAdapter {
    fn next_session_id(&self, prefix: &str) -> String {
        let n = self.harness.sessions.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}-{}", prefix, n)
    }
}

#[async_trait]
impl AgentAdapter for ScriptedAdapter {
    async fn connect(&self, _working_directory: &Path) -> Result<AgentCapabilities> {
        self.harness.record("connect");
        if let Some(message) = &self.script.connect_error {
            return Err(Error::Connection {
                agent_id: self.agent_id.clone(),
                message: message.clone(),
            });
        }
        Ok(self.script.capabilities.clone())
    }

    async fn new_session(&self, _working_directory: &Path) -> Result<NewSession> {
        self.harness.record("new_session");
        Ok(NewSession {
            session_id: self.next_session_id("session"),
            modes: self.script.modes.clone(),
            models: self.script.models.clone(),
        })
    }

    async fn send_prompt(&self, session_id: &str, _content: Vec<PromptBlock>) -> Result<TurnStream> {
        self.harness.record(format!("send_prompt:{}", session_id));
        let n = self.harness.turns.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        let message_id = format!("agent-msg-{}", n);
        *self.harness.turn.lock() = Some(ActiveTurn {
            message_id: message_id.clone(),
            events: tx,
        });
        Ok(TurnStream {
            turn_id: format!("turn-{}", n),
            message_id,
            events: rx,
        })
    }

    async fn cancel(&self, session_id: &str) -> Result<()> {
        self.harness.record(format!("cancel:{}", session_id));
        if self.script.cancel_confirms {
            if let Some(turn) = self.harness.turn.lock().take() {
                let _ = turn.events.send(TurnEvent::Cancelled);
            }
        }
        Ok(())
    }

    // The scripted stream stays open so tests can emit late output
    fn abandon_turn(&self, turn_id: &str) {
        self.harness.record(format!("abandon:{}", turn_id));
    }

    async fn set_mode(&self, _session_id: &str, mode_id: &str) -> Result<()> {
        self.harness.record(format!("set_mode:{}", mode_id));
        Ok(())
    }

    async fn set_model(&self, _session_id: &str, model_id: &str) -> Result<()> {
        self.harness.record(format!("set_model:{}", model_id));
        Ok(())
    }

    async fn respond_permission(&self, request_id: &str, response: PermissionResponse) -> Result<()> {
        self.harness
            .responses
            .lock()
            .push((request_id.to_string(), response));
        Ok(())
    }

    async fn list_sessions(&self, _cwd: Option<&Path>, cursor: Option<&str>) -> Result<SessionPage> {
        self.harness.record("list");
        if !self.script.capabilities.session_capabilities.supports_list() {
            return Err(Error::UnsupportedCapability("list".into()));
        }
        let index: usize = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);
        let sessions = self.script.pages.get(index).cloned().unwrap_or_default();
        let next_cursor = (index + 1 < self.script.pages.len()).then(|| (index + 1).to_string());
        Ok(SessionPage {
            sessions,
            next_cursor,
        })
    }

    async fn load_session(&self, session_id: &str, _working_directory: &Path) -> Result<LoadedSession> {
        self.harness.record(format!("load:{}", session_id));
        if !self.script.load_delay.is_zero() {
            tokio::time::sleep(self.script.load_delay).await;
        }
        if let Some(message) = &self.script.load_error {
            return Err(Error::Agent(message.clone()));
        }
        Ok(LoadedSession {
            session_id: session_id.to_string(),
            modes: self.script.modes.clone(),
            models: self.script.models.clone(),
            transcript: self.script.transcript.clone(),
        })
    }

    async fn fork_session(&self, session_id: &str, _working_directory: &Path) -> Result<NewSession> {
        self.harness.record(format!("fork:{}", session_id));
        if let Some(message) = &self.script.fork_error {
            return Err(Error::Agent(message.clone()));
        }
        Ok(NewSession {
            session_id: self.next_session_id("fork"),
            modes: self.script.modes.clone(),
            models: self.script.models.clone(),
        })
    }

    async fn delete_session(&self, session_id: &str) -> Result<()> {
        if !self.script.capabilities.session_capabilities.supports_delete() {
            return Err(Error::UnsupportedCapability("delete".into()));
        }
        self.harness.record(format!("delete:{}", session_id));
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.harness.record("disconnect");
        self.harness.turn.lock().take();
        Ok(())
    }
}

pub fn permission_request(request_id: &str) -> PermissionRequest {
    PermissionRequest {
        request_id: request_id.into(),
        tool_call_id: "call-1".into(),
        title: "Write note.md".into(),
        options: vec![
            PermissionOption {
                option_id: "allow".into(),
                name: "Allow".into(),
                kind: PermissionOptionKind::AllowOnce,
            },
            PermissionOption {
                option_id: "deny".into(),
                name: "Deny".into(),
                kind: PermissionOptionKind::RejectOnce,
            },
        ],
        created_at: chrono::Utc::now(),
    }
}

pub fn history_entry(session_id: &str, agent_id: &str, dir: &str) -> SessionHistoryEntry {
    SessionHistoryEntry {
        session_id: session_id.into(),
        title: None,
        agent_id: agent_id.into(),
        working_directory: dir.into(),
        updated_at: None,
        has_local_data: false,
    }
}

pub fn config() -> ControllerConfig {
    ControllerConfig::new(Settings::default(), "/vault")
}

pub fn spawn(factory: Arc<ScriptedFactory>) -> SessionController {
    SessionController::spawn(config(), factory)
}

pub async fn ready(factory: Arc<ScriptedFactory>) -> SessionController {
    let controller = spawn(factory);
    controller.create_session(CLAUDE, "/vault").await.unwrap();
    controller
}

/// Wait until a published snapshot satisfies the predicate
pub async fn wait_for(
    controller: &SessionController,
    mut predicate: impl FnMut(&ControllerSnapshot) -> bool,
) -> Arc<ControllerSnapshot> {
    let mut snapshots = controller.subscribe();
    timeout(Duration::from_secs(5), async {
        loop {
            let snapshot = snapshots.borrow_and_update().clone();
            if predicate(&snapshot) {
                return snapshot;
            }
            snapshots.changed().await.expect("controller stopped");
        }
    })
    .await
    .expect("timed out waiting for snapshot")
}
