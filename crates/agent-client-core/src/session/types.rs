//! Session data model: the live session, the message timeline and the
//! persisted history entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;

use agent_client_acp::{
    AgentCapabilities, AvailableCommand, PermissionOption, PlanEntry, SessionModeState,
    SessionModelState,
};

/// Lifecycle status of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Uninitialized,
    Connecting,
    Ready,
    Busy,
    Restoring,
    Errored,
    Closed,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Uninitialized => "uninitialized",
            SessionStatus::Connecting => "connecting",
            SessionStatus::Ready => "ready",
            SessionStatus::Busy => "busy",
            SessionStatus::Restoring => "restoring",
            SessionStatus::Errored => "errored",
            SessionStatus::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// One logical conversation with one agent
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    /// Absent until the agent assigned one
    pub id: Option<String>,
    pub agent_id: String,
    pub working_directory: PathBuf,
    pub available_commands: Vec<AvailableCommand>,
    pub modes: Option<SessionModeState>,
    pub models: Option<SessionModelState>,
    pub capabilities: AgentCapabilities,
    pub status: SessionStatus,
    pub created_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn uninitialized(agent_id: impl Into<String>, working_directory: impl Into<PathBuf>) -> Self {
        Self {
            id: None,
            agent_id: agent_id.into(),
            working_directory: working_directory.into(),
            available_commands: Vec::new(),
            modes: None,
            models: None,
            capabilities: AgentCapabilities::default(),
            status: SessionStatus::Uninitialized,
            created_at: None,
        }
    }

    pub fn supports_mode(&self, mode_id: &str) -> bool {
        self.modes
            .as_ref()
            .is_some_and(|m| m.available_modes.iter().any(|mode| mode.id == mode_id))
    }

    pub fn supports_model(&self, model_id: &str) -> bool {
        self.models
            .as_ref()
            .is_some_and(|m| m.available_models.iter().any(|model| model.model_id == model_id))
    }

    pub fn current_mode_id(&self) -> Option<&str> {
        self.modes.as_ref().map(|m| m.current_mode_id.as_str())
    }

    pub fn current_model_id(&self) -> Option<&str> {
        self.models.as_ref().map(|m| m.current_model_id.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Agent,
    System,
}

/// One entry of the timeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub role: MessageRole,
    /// Position in the timeline; strictly increasing, never reused
    pub sequence: u64,
    pub content: Vec<ContentBlock>,
    pub is_streaming: bool,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    /// Concatenated text blocks
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl From<agent_client_acp::ToolCallStatus> for ToolStatus {
    fn from(status: agent_client_acp::ToolCallStatus) -> Self {
        use agent_client_acp::ToolCallStatus;
        match status {
            ToolCallStatus::Pending => ToolStatus::Pending,
            ToolCallStatus::InProgress => ToolStatus::Running,
            ToolCallStatus::Completed => ToolStatus::Completed,
            ToolCallStatus::Failed => ToolStatus::Failed,
        }
    }
}

/// A tool invocation and its output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallBlock {
    pub tool_call_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub status: ToolStatus,
    /// Text, diff and terminal output produced by the tool
    #[serde(default)]
    pub payload: Vec<ContentBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_input: Option<Value>,
}

/// How a permission request was answered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PermissionResolution {
    Approved { option_id: String },
    Rejected,
    Cancelled,
}

/// An agent-issued approval gate for a tool call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub request_id: String,
    pub tool_call_id: String,
    pub title: String,
    pub options: Vec<PermissionOption>,
    pub created_at: DateTime<Utc>,
}

impl PermissionRequest {
    pub fn option(&self, option_id: &str) -> Option<&PermissionOption> {
        self.options.iter().find(|o| o.option_id == option_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionBlock {
    pub request: PermissionRequest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<PermissionResolution>,
}

/// Typed content of a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    /// Agent reasoning shown separately from the answer
    Thought {
        text: String,
    },
    Image {
        data: String,
        mime_type: String,
    },
    ToolCall(ToolCallBlock),
    Plan {
        entries: Vec<PlanEntry>,
    },
    Diff {
        path: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        old_text: Option<String>,
        new_text: String,
    },
    TerminalOutput {
        terminal_id: String,
    },
    PermissionRequest(PermissionBlock),
    /// Marks a turn that ended in an error
    Error {
        message: String,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }
}

impl From<agent_client_acp::ToolCallContent> for ContentBlock {
    fn from(content: agent_client_acp::ToolCallContent) -> Self {
        use agent_client_acp::{ContentBlock as Wire, ToolCallContent};
        match content {
            ToolCallContent::Content { content } => match content {
                Wire::Text { text } => ContentBlock::Text { text },
                Wire::Image { data, mime_type } => ContentBlock::Image { data, mime_type },
                Wire::ResourceLink { uri, name } => ContentBlock::Text {
                    text: format!("[{}]({})", name, uri),
                },
                Wire::Audio { .. } | Wire::Unsupported => ContentBlock::Text {
                    text: "[unsupported content]".to_string(),
                },
            },
            ToolCallContent::Diff {
                path,
                old_text,
                new_text,
            } => ContentBlock::Diff {
                path,
                old_text,
                new_text,
            },
            ToolCallContent::Terminal { terminal_id } => ContentBlock::TerminalOutput { terminal_id },
        }
    }
}

/// Persisted session metadata, independent of a live connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionHistoryEntry {
    pub session_id: String,
    #[serde(default)]
    pub title: Option<String>,
    pub agent_id: String,
    pub working_directory: PathBuf,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    /// Full transcript is cached locally
    #[serde(default)]
    pub has_local_data: bool,
}

/// Immutable view of a controller's state, broadcast to every subscriber
#[derive(Debug, Clone)]
pub struct ControllerSnapshot {
    pub session: Session,
    pub messages: Vec<ChatMessage>,
    pub pending_permission: Option<PermissionRequest>,
    pub last_error: Option<String>,
}

impl ControllerSnapshot {
    pub fn status(&self) -> SessionStatus {
        self.session.status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_display() {
        assert_eq!(SessionStatus::Restoring.to_string(), "restoring");
        assert_eq!(
            serde_json::to_value(SessionStatus::Uninitialized).unwrap(),
            json!("uninitialized")
        );
    }

    #[test]
    fn test_content_block_tags() {
        let block = ContentBlock::TerminalOutput {
            terminal_id: "t1".into(),
        };
        assert_eq!(
            serde_json::to_value(&block).unwrap(),
            json!({ "type": "terminal-output", "terminal_id": "t1" })
        );
    }

    #[test]
    fn test_tool_call_content_conversion() {
        let diff = agent_client_acp::ToolCallContent::Diff {
            path: "/vault/a.md".into(),
            old_text: None,
            new_text: "new".into(),
        };
        assert!(matches!(
            ContentBlock::from(diff),
            ContentBlock::Diff { old_text: None, .. }
        ));
    }

    #[test]
    fn test_session_capability_lookup() {
        let mut session = Session::uninitialized("claude", "/vault");
        assert!(!session.supports_mode("plan"));

        session.modes = Some(SessionModeState {
            current_mode_id: "default".into(),
            available_modes: vec![agent_client_acp::SessionMode {
                id: "plan".into(),
                name: "Plan".into(),
                description: None,
            }],
        });
        assert!(session.supports_mode("plan"));
        assert_eq!(session.current_mode_id(), Some("default"));
    }
}
