//! Agent Client Core - chat session controller for ACP agents
//!
//! This crate provides the core functionality behind every Agent Client view:
//! - Transport adapters that drive an external agent process
//! - The session controller actor and its state machine
//! - Streaming aggregation of turn events into a message timeline
//! - The permission gate
//! - Session history listing and the local session store
//! - Settings and agent resolution

pub mod adapter;
pub mod config;
pub mod error;
pub mod history;
pub mod session;

pub use adapter::{
    AcpAdapter, AcpAdapterFactory, AdapterFactory, AgentAdapter, PermissionResponse, PromptBlock,
    TurnEvent,
};
pub use config::{AgentConfig, ConfigManager, Settings};
pub use error::{Error, Result};
pub use history::{
    AgentHistorySource, HistoryFilter, HistoryListing, HistorySource, SessionHistoryManager,
};

// Session exports (controller actor architecture)
pub use session::{
    ChatMessage, ContentBlock, ControllerConfig, ControllerSnapshot, MessageRole,
    PermissionRequest, Session, SessionController, SessionHistoryEntry, SessionStatus,
    SessionStore,
};
