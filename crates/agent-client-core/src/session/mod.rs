//! Session module - one controller per live chat session
//!
//! Key components:
//!
//! - `SessionController`: cloneable handle; commands go in, snapshots come out
//! - `MessageAggregator`: folds turn events into the message timeline
//! - `PermissionGate`: the single outstanding permission request
//! - `SessionStore`: transcripts persisted on disk
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │  view ──command──▶ SessionController ──▶ [ControllerActor] │
//! │                                              │    ▲        │
//! │                                   AgentAdapter    TurnEvent│
//! │                                              ▼    │        │
//! │  view ◀──watch<Arc<ControllerSnapshot>>── aggregator + gate│
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example Usage
//!
//! ```ignore
//! use agent_client_core::session::{ControllerConfig, SessionController};
//! use agent_client_core::adapter::{AcpAdapterFactory, PromptBlock};
//!
//! let controller = SessionController::spawn(config, Arc::new(AcpAdapterFactory::default()));
//! controller.create_session("claude-code-acp", vault_path).await?;
//! controller.send_message(vec![PromptBlock::text("Hello!")]).await?;
//!
//! let mut snapshots = controller.subscribe();
//! while snapshots.changed().await.is_ok() {
//!     let snapshot = snapshots.borrow_and_update().clone();
//!     render(&snapshot.messages);
//! }
//! ```

mod aggregator;
mod controller;
mod permission;
pub mod persistence;
mod types;

pub use aggregator::MessageAggregator;
pub use controller::{ControllerConfig, SessionController};
pub use permission::{GateState, PermissionGate};
pub use persistence::{SavedSession, SessionStore};
pub use types::{
    ChatMessage, ContentBlock, ControllerSnapshot, MessageRole, PermissionBlock,
    PermissionRequest, PermissionResolution, Session, SessionHistoryEntry, SessionStatus,
    ToolCallBlock, ToolStatus,
};
