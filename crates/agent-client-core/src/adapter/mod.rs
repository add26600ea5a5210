//! Transport adapter: the connection to one agent process
//!
//! An [`AgentAdapter`] has no session semantics of its own. It performs the
//! protocol exchanges the controller asks for and turns a prompt into an
//! ordered stream of [`TurnEvent`]s that ends with exactly one terminal
//! event.

mod acp;

pub use acp::{AcpAdapter, AcpAdapterFactory};

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

use agent_client_acp::{
    AgentCapabilities, AvailableCommand, PlanEntry, SessionModeState, SessionModelState,
    StopReason,
};

use crate::config::AgentConfig;
use crate::error::Result;
use crate::session::{ContentBlock, PermissionRequest, SessionHistoryEntry, ToolStatus};

/// Content a user sends in a prompt
#[derive(Debug, Clone, PartialEq)]
pub enum PromptBlock {
    Text(String),
    Image { data: String, mime_type: String },
}

impl PromptBlock {
    pub fn text(text: impl Into<String>) -> Self {
        PromptBlock::Text(text.into())
    }
}

impl From<PromptBlock> for ContentBlock {
    fn from(block: PromptBlock) -> Self {
        match block {
            PromptBlock::Text(text) => ContentBlock::Text { text },
            PromptBlock::Image { data, mime_type } => ContentBlock::Image { data, mime_type },
        }
    }
}

/// A tool call as first announced by the agent
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallStart {
    pub tool_call_id: String,
    pub title: String,
    pub kind: Option<String>,
    pub status: ToolStatus,
    pub content: Vec<ContentBlock>,
    pub raw_input: Option<serde_json::Value>,
}

/// Partial update of a tool call; `None` fields are left unchanged
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolCallPatch {
    pub tool_call_id: String,
    pub title: Option<String>,
    pub kind: Option<String>,
    pub status: Option<ToolStatus>,
    /// Replaces the payload when present
    pub content: Option<Vec<ContentBlock>>,
}

/// One event of a turn, in emission order
///
/// Content events carry the id of the message they belong to. A turn ends
/// with exactly one of `TurnEnd`, `Error` or `Cancelled`.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    /// User-authored text; only produced while replaying a transcript
    UserText { message_id: String, text: String },
    TextDelta { message_id: String, text: String },
    ThoughtDelta { message_id: String, text: String },
    ToolCallStart { message_id: String, tool_call: ToolCallStart },
    ToolCallUpdate { message_id: String, patch: ToolCallPatch },
    PlanUpdate { message_id: String, entries: Vec<PlanEntry> },
    PermissionRequest { message_id: String, request: PermissionRequest },
    TurnEnd { stop_reason: StopReason },
    Error { message: String },
    Cancelled,
}

impl TurnEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TurnEvent::TurnEnd { .. } | TurnEvent::Error { .. } | TurnEvent::Cancelled
        )
    }
}

/// Events of one in-flight prompt
#[derive(Debug)]
pub struct TurnStream {
    pub turn_id: String,
    /// Id of the agent message the turn's content belongs to
    pub message_id: String,
    pub events: mpsc::UnboundedReceiver<TurnEvent>,
}

/// Session-level updates that are not part of any turn
#[derive(Debug, Clone, PartialEq)]
pub enum SessionNotice {
    CommandsUpdated {
        session_id: String,
        commands: Vec<AvailableCommand>,
    },
    ModeChanged {
        session_id: String,
        mode_id: String,
    },
}

impl SessionNotice {
    pub fn session_id(&self) -> &str {
        match self {
            SessionNotice::CommandsUpdated { session_id, .. }
            | SessionNotice::ModeChanged { session_id, .. } => session_id,
        }
    }
}

pub type NoticeSender = mpsc::UnboundedSender<SessionNotice>;

/// How the user answered a permission request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionResponse {
    Selected(String),
    Rejected,
    Cancelled,
}

/// A session created by `session/new` or `session/fork`
#[derive(Debug, Clone, PartialEq)]
pub struct NewSession {
    pub session_id: String,
    pub modes: Option<SessionModeState>,
    pub models: Option<SessionModelState>,
}

/// A session loaded from the agent together with its replayed transcript
#[derive(Debug, Clone)]
pub struct LoadedSession {
    pub session_id: String,
    pub modes: Option<SessionModeState>,
    pub models: Option<SessionModelState>,
    pub transcript: Vec<TurnEvent>,
}

/// One page of agent-side session listings
#[derive(Debug, Clone, Default)]
pub struct SessionPage {
    pub sessions: Vec<SessionHistoryEntry>,
    pub next_cursor: Option<String>,
}

/// Connection to one agent process
///
/// Operations other than `cancel` are never invoked concurrently on the same
/// instance. `cancel` may be called at any time; once it returns no further
/// content events of the cancelled turn are delivered.
#[async_trait]
pub trait AgentAdapter: Send + Sync {
    /// Launch the agent and negotiate capabilities
    async fn connect(&self, working_directory: &Path) -> Result<AgentCapabilities>;

    async fn new_session(&self, working_directory: &Path) -> Result<NewSession>;

    async fn send_prompt(&self, session_id: &str, content: Vec<PromptBlock>) -> Result<TurnStream>;

    /// Idempotent; a no-op when nothing is in flight
    async fn cancel(&self, session_id: &str) -> Result<()>;

    /// Release a cancelled turn the agent never confirmed so the connection
    /// accepts a new prompt
    fn abandon_turn(&self, turn_id: &str);

    async fn set_mode(&self, session_id: &str, mode_id: &str) -> Result<()>;

    async fn set_model(&self, session_id: &str, model_id: &str) -> Result<()>;

    async fn respond_permission(&self, request_id: &str, response: PermissionResponse) -> Result<()>;

    async fn list_sessions(&self, cwd: Option<&Path>, cursor: Option<&str>) -> Result<SessionPage>;

    async fn load_session(&self, session_id: &str, working_directory: &Path) -> Result<LoadedSession>;

    async fn fork_session(&self, session_id: &str, working_directory: &Path) -> Result<NewSession>;

    async fn delete_session(&self, session_id: &str) -> Result<()>;

    /// Best-effort teardown; the agent process is killed
    async fn disconnect(&self) -> Result<()>;
}

/// Creates adapters for configured agents
pub trait AdapterFactory: Send + Sync {
    fn create(&self, agent: &AgentConfig, notices: NoticeSender) -> Result<Arc<dyn AgentAdapter>>;
}

/// Working directory fallback when none was given
pub fn default_working_directory() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}
