//! Session controller
//!
//! [`SessionController`] is a cloneable handle to a single actor task that
//! owns the live session, its adapter, the message timeline and the
//! permission gate. Commands are applied in the order they are received; the
//! actor republishes an immutable [`ControllerSnapshot`] after every change.
//!
//! State machine:
//!
//! ```text
//! uninitialized ─▶ connecting ─▶ ready ◀──▶ busy
//!                      │          │  ▲
//!                      ▼          ▼  │
//!                   errored    restoring ─▶ errored / prior state
//! any ─▶ closed (shutdown)
//! ```

use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use agent_client_acp::{AgentCapabilities, SessionModeState, SessionModelState};

use crate::adapter::{
    AdapterFactory, AgentAdapter, NoticeSender, PermissionResponse, PromptBlock, SessionNotice,
    TurnEvent,
};
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::history::SessionHistoryManager;
use crate::session::aggregator::MessageAggregator;
use crate::session::permission::PermissionGate;
use crate::session::persistence::{SavedSession, SessionStore, title_from_text};
use crate::session::types::{
    ChatMessage, ControllerSnapshot, PermissionRequest, PermissionResolution, Session,
    SessionHistoryEntry, SessionStatus,
};

/// How long a cancelled turn may take to confirm before it is closed locally
pub const DEFAULT_CANCEL_TIMEOUT: Duration = Duration::from_secs(10);

/// Quiet period before a finished turn is written to the session store
pub const DEFAULT_PERSIST_DEBOUNCE: Duration = Duration::from_millis(500);

/// Controller configuration
#[derive(Clone)]
pub struct ControllerConfig {
    pub settings: Settings,
    /// Used for sessions created without an explicit directory
    pub working_directory: PathBuf,
    pub cancel_timeout: Duration,
    pub persist_debounce: Duration,
    pub store: Option<Arc<SessionStore>>,
    pub history: Option<Arc<SessionHistoryManager>>,
}

impl ControllerConfig {
    pub fn new(settings: Settings, working_directory: impl Into<PathBuf>) -> Self {
        Self {
            settings,
            working_directory: working_directory.into(),
            cancel_timeout: DEFAULT_CANCEL_TIMEOUT,
            persist_debounce: DEFAULT_PERSIST_DEBOUNCE,
            store: None,
            history: None,
        }
    }

    pub fn with_store(mut self, store: Arc<SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_history(mut self, history: Arc<SessionHistoryManager>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn with_cancel_timeout(mut self, timeout: Duration) -> Self {
        self.cancel_timeout = timeout;
        self
    }

    pub fn with_persist_debounce(mut self, debounce: Duration) -> Self {
        self.persist_debounce = debounce;
        self
    }
}

type Reply<T> = oneshot::Sender<Result<T>>;

enum Command {
    CreateSession {
        agent_id: String,
        working_directory: Option<PathBuf>,
        reply: Reply<()>,
    },
    SendMessage {
        content: Vec<PromptBlock>,
        reply: Reply<()>,
    },
    StopGeneration {
        reply: Reply<()>,
    },
    SwitchAgent {
        agent_id: String,
        reply: Reply<()>,
    },
    RestartAgent {
        reply: Reply<()>,
    },
    NewChat {
        reply: Reply<()>,
    },
    RestoreSession {
        session_id: String,
        reply: Reply<()>,
    },
    ForkSession {
        session_id: String,
        reply: Reply<()>,
    },
    DeleteSession {
        session_id: String,
        reply: Reply<()>,
    },
    SetMode {
        mode_id: String,
        reply: Reply<()>,
    },
    SetModel {
        model_id: String,
        reply: Reply<()>,
    },
    ApprovePermission {
        request_id: String,
        option_id: String,
        reply: Reply<()>,
    },
    RejectPermission {
        request_id: String,
        reply: Reply<()>,
    },
    ClearError {
        reply: Reply<()>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

/// Handle to a session controller task
///
/// Cheap to clone; every clone drives the same session. Views read state
/// through [`SessionController::snapshot`] or [`SessionController::subscribe`]
/// and never mutate it directly.
#[derive(Clone)]
pub struct SessionController {
    commands: mpsc::UnboundedSender<Command>,
    snapshots: watch::Receiver<Arc<ControllerSnapshot>>,
}

impl SessionController {
    /// Start the controller task. Must be called from within a tokio runtime.
    pub fn spawn(config: ControllerConfig, factory: Arc<dyn AdapterFactory>) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();

        let session = Session::uninitialized(
            config.settings.default_agent_id.clone(),
            config.working_directory.clone(),
        );
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(ControllerSnapshot {
            session: session.clone(),
            messages: Vec::new(),
            pending_permission: None,
            last_error: None,
        }));

        let actor = ControllerActor {
            config,
            factory,
            commands: command_rx,
            notices: notice_rx,
            notice_tx,
            snapshots: snapshot_tx,
            session,
            adapter: None,
            aggregator: MessageAggregator::new(),
            gate: PermissionGate::new(),
            turn: None,
            restore: None,
            held_notices: Vec::new(),
            persist_at: None,
            last_error: None,
        };
        tokio::spawn(actor.run());

        Self {
            commands: command_tx,
            snapshots: snapshot_rx,
        }
    }

    async fn call(&self, make: impl FnOnce(Reply<()>) -> Command) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .map_err(|_| Error::ControllerClosed)?;
        rx.await.map_err(|_| Error::ControllerClosed)?
    }

    /// Latest published state
    pub fn snapshot(&self) -> Arc<ControllerSnapshot> {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<ControllerSnapshot>> {
        self.snapshots.clone()
    }

    /// Connect to an agent and open a fresh session
    pub async fn create_session(
        &self,
        agent_id: impl Into<String>,
        working_directory: impl Into<PathBuf>,
    ) -> Result<()> {
        let agent_id = agent_id.into();
        let working_directory = Some(working_directory.into());
        self.call(|reply| Command::CreateSession {
            agent_id,
            working_directory,
            reply,
        })
        .await
    }

    /// Send a prompt. Resolves once the turn has started; follow its
    /// progress through snapshots.
    pub async fn send_message(&self, content: Vec<PromptBlock>) -> Result<()> {
        self.call(|reply| Command::SendMessage { content, reply }).await
    }

    /// Cancel the in-flight turn. Resolves once the session is ready again.
    pub async fn stop_generation(&self) -> Result<()> {
        self.call(|reply| Command::StopGeneration { reply }).await
    }

    pub async fn switch_agent(&self, agent_id: impl Into<String>) -> Result<()> {
        let agent_id = agent_id.into();
        self.call(|reply| Command::SwitchAgent { agent_id, reply })
            .await
    }

    pub async fn restart_agent(&self) -> Result<()> {
        self.call(|reply| Command::RestartAgent { reply }).await
    }

    /// Start a new session on the current connection
    pub async fn new_chat(&self) -> Result<()> {
        self.call(|reply| Command::NewChat { reply }).await
    }

    pub async fn restore_session(&self, session_id: impl Into<String>) -> Result<()> {
        let session_id = session_id.into();
        self.call(|reply| Command::RestoreSession { session_id, reply })
            .await
    }

    pub async fn fork_session(&self, session_id: impl Into<String>) -> Result<()> {
        let session_id = session_id.into();
        self.call(|reply| Command::ForkSession { session_id, reply })
            .await
    }

    pub async fn delete_session(&self, session_id: impl Into<String>) -> Result<()> {
        let session_id = session_id.into();
        self.call(|reply| Command::DeleteSession { session_id, reply })
            .await
    }

    pub async fn set_mode(&self, mode_id: impl Into<String>) -> Result<()> {
        let mode_id = mode_id.into();
        self.call(|reply| Command::SetMode { mode_id, reply }).await
    }

    pub async fn set_model(&self, model_id: impl Into<String>) -> Result<()> {
        let model_id = model_id.into();
        self.call(|reply| Command::SetModel { model_id, reply })
            .await
    }

    pub async fn approve_permission(
        &self,
        request_id: impl Into<String>,
        option_id: impl Into<String>,
    ) -> Result<()> {
        let request_id = request_id.into();
        let option_id = option_id.into();
        self.call(|reply| Command::ApprovePermission {
            request_id,
            option_id,
            reply,
        })
        .await
    }

    pub async fn reject_permission(&self, request_id: impl Into<String>) -> Result<()> {
        let request_id = request_id.into();
        self.call(|reply| Command::RejectPermission { request_id, reply })
            .await
    }

    pub async fn clear_error(&self) -> Result<()> {
        self.call(|reply| Command::ClearError { reply }).await
    }

    /// Disconnect and stop the controller task
    pub async fn shutdown(&self) -> Result<()> {
        self.call(|reply| Command::Shutdown { reply }).await
    }
}

struct ActiveTurn {
    turn_id: String,
    events: mpsc::UnboundedReceiver<TurnEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RestoreKind {
    Restore,
    Fork,
}

impl RestoreKind {
    fn operation(self) -> &'static str {
        match self {
            RestoreKind::Restore => "restore a session",
            RestoreKind::Fork => "fork a session",
        }
    }

    fn error(self, session_id: &str, message: impl Into<String>) -> Error {
        match self {
            RestoreKind::Restore => Error::Restore {
                session_id: session_id.to_string(),
                message: message.into(),
            },
            RestoreKind::Fork => Error::Fork {
                session_id: session_id.to_string(),
                message: message.into(),
            },
        }
    }
}

struct PendingRestore {
    kind: RestoreKind,
    session_id: String,
    /// Status to return to if the restore fails
    prior_status: SessionStatus,
    task: JoinHandle<Result<RestoreOutcome>>,
    reply: Reply<()>,
}

struct RestoreOutcome {
    adapter: Arc<dyn AgentAdapter>,
    capabilities: AgentCapabilities,
    session_id: String,
    modes: Option<SessionModeState>,
    models: Option<SessionModelState>,
    messages: MessageAggregator,
}

struct RestoreJob {
    kind: RestoreKind,
    source_id: String,
    adapter: Arc<dyn AgentAdapter>,
    /// Known when the adapter is already connected
    capabilities: Option<AgentCapabilities>,
    working_directory: PathBuf,
    store: Option<Arc<SessionStore>>,
    /// Timeline of the source when it is the live session
    live_transcript: Option<Vec<ChatMessage>>,
}

impl RestoreJob {
    async fn run(self) -> Result<RestoreOutcome> {
        let kind = self.kind;
        let source_id = self.source_id.clone();
        let fresh = self.capabilities.is_none();
        let adapter = self.adapter.clone();

        let result = self.load().await;
        if result.is_err() && fresh {
            if let Err(e) = adapter.disconnect().await {
                warn!("Failed to disconnect after failed {}: {}", kind.operation(), e);
            }
        }
        result.map_err(|e| match e {
            Error::Restore { .. } | Error::Fork { .. } => e,
            other => kind.error(&source_id, other.to_string()),
        })
    }

    async fn load(self) -> Result<RestoreOutcome> {
        let capabilities = match self.capabilities {
            Some(capabilities) => capabilities,
            None => self.adapter.connect(&self.working_directory).await?,
        };

        let local = self.store.as_ref().and_then(|store| {
            store
                .load(&self.source_id)
                .map_err(|e| warn!(session_id = %self.source_id, "Failed to read local transcript: {}", e))
                .ok()
                .flatten()
        });

        match self.kind {
            RestoreKind::Restore => {
                let loaded = self
                    .adapter
                    .load_session(&self.source_id, &self.working_directory)
                    .await?;
                let messages = match (loaded.transcript.is_empty(), local) {
                    (true, Some(saved)) => {
                        debug!(session_id = %self.source_id, "Agent replayed nothing; using local transcript");
                        MessageAggregator::from_messages(saved.messages)
                    }
                    _ => MessageAggregator::replay(loaded.transcript),
                };
                Ok(RestoreOutcome {
                    adapter: self.adapter,
                    capabilities,
                    session_id: loaded.session_id,
                    modes: loaded.modes,
                    models: loaded.models,
                    messages,
                })
            }
            RestoreKind::Fork => {
                let forked = self
                    .adapter
                    .fork_session(&self.source_id, &self.working_directory)
                    .await?;
                let transcript = self
                    .live_transcript
                    .or_else(|| local.map(|saved| saved.messages))
                    .unwrap_or_default();
                Ok(RestoreOutcome {
                    adapter: self.adapter,
                    capabilities,
                    session_id: forked.session_id,
                    modes: forked.modes,
                    models: forked.models,
                    messages: MessageAggregator::from_messages(transcript),
                })
            }
        }
    }
}

struct ControllerActor {
    config: ControllerConfig,
    factory: Arc<dyn AdapterFactory>,
    commands: mpsc::UnboundedReceiver<Command>,
    notices: mpsc::UnboundedReceiver<SessionNotice>,
    notice_tx: NoticeSender,
    snapshots: watch::Sender<Arc<ControllerSnapshot>>,

    session: Session,
    adapter: Option<Arc<dyn AgentAdapter>>,
    aggregator: MessageAggregator,
    gate: PermissionGate,
    turn: Option<ActiveTurn>,
    restore: Option<PendingRestore>,
    /// Notices for sessions other than the live one, held while a restore runs
    held_notices: Vec<SessionNotice>,
    persist_at: Option<Instant>,
    last_error: Option<String>,
}

async fn next_event(turn: &mut Option<ActiveTurn>) -> Option<TurnEvent> {
    match turn {
        Some(turn) => turn.events.recv().await,
        None => std::future::pending().await,
    }
}

async fn restore_finished(
    restore: &mut Option<PendingRestore>,
) -> std::result::Result<Result<RestoreOutcome>, JoinError> {
    match restore {
        Some(pending) => (&mut pending.task).await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl ControllerActor {
    async fn run(mut self) {
        debug!(agent_id = %self.session.agent_id, "Session controller started");

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        // Every handle is gone
                        self.close().await;
                        break;
                    };
                    if !self.handle_command(command).await {
                        break;
                    }
                }

                event = next_event(&mut self.turn) => {
                    self.on_turn_event(event).await;
                }

                result = restore_finished(&mut self.restore) => {
                    self.on_restore_finished(result).await;
                }

                Some(notice) = self.notices.recv() => {
                    self.on_notice(notice);
                }

                _ = sleep_until_opt(self.persist_at) => {
                    self.persist_at = None;
                    self.save_transcript();
                }
            }

            self.publish();
        }

        self.publish();
        debug!("Session controller stopped");
    }

    /// Returns false when the controller should stop
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::CreateSession {
                agent_id,
                working_directory,
                reply,
            } => {
                let result = self.create_session(agent_id, working_directory).await;
                self.respond(reply, result);
            }
            Command::SendMessage { content, reply } => {
                let result = self.send_message(content).await;
                self.respond(reply, result);
            }
            Command::StopGeneration { reply } => {
                if let Some(turn) = self.turn.take() {
                    self.cancel_turn(turn).await;
                }
                self.respond(reply, Ok(()));
            }
            Command::SwitchAgent { agent_id, reply } => {
                let result = self.switch_agent(agent_id).await;
                self.respond(reply, result);
            }
            Command::RestartAgent { reply } => {
                let agent_id = self.session.agent_id.clone();
                let result = self.switch_agent(agent_id).await;
                self.respond(reply, result);
            }
            Command::NewChat { reply } => {
                let result = self.new_chat().await;
                self.respond(reply, result);
            }
            Command::RestoreSession { session_id, reply } => {
                self.start_restore(RestoreKind::Restore, session_id, reply);
            }
            Command::ForkSession { session_id, reply } => {
                self.start_restore(RestoreKind::Fork, session_id, reply);
            }
            Command::DeleteSession { session_id, reply } => {
                let result = self.delete_session(&session_id).await;
                self.respond(reply, result);
            }
            Command::SetMode { mode_id, reply } => {
                let result = self.set_mode(mode_id).await;
                self.respond(reply, result);
            }
            Command::SetModel { model_id, reply } => {
                let result = self.set_model(model_id).await;
                self.respond(reply, result);
            }
            Command::ApprovePermission {
                request_id,
                option_id,
                reply,
            } => {
                let result = self.approve_permission(&request_id, &option_id).await;
                self.respond(reply, result);
            }
            Command::RejectPermission { request_id, reply } => {
                let result = self.reject_permission(&request_id).await;
                self.respond(reply, result);
            }
            Command::ClearError { reply } => {
                self.last_error = None;
                self.respond(reply, Ok(()));
            }
            Command::Shutdown { reply } => {
                self.close().await;
                self.respond(reply, Ok(()));
                return false;
            }
        }
        true
    }

    fn publish(&self) {
        let snapshot = ControllerSnapshot {
            session: self.session.clone(),
            messages: self.aggregator.messages().to_vec(),
            pending_permission: self.gate.pending().cloned(),
            last_error: self.last_error.clone(),
        };
        self.snapshots.send_replace(Arc::new(snapshot));
    }

    /// Callers see the state their command produced
    fn respond(&self, reply: Reply<()>, result: Result<()>) {
        self.publish();
        let _ = reply.send(result);
    }

    fn invalid_state(&self, operation: &'static str) -> Error {
        Error::InvalidState {
            operation,
            status: self.session.status,
        }
    }

    /// Adapter and id of the live session
    fn live(&self) -> Result<(Arc<dyn AgentAdapter>, String)> {
        match (&self.adapter, &self.session.id) {
            (Some(adapter), Some(session_id)) => Ok((adapter.clone(), session_id.clone())),
            _ => Err(Error::NoActiveSession),
        }
    }

    fn create_adapter(&self, agent_id: &str) -> Result<Arc<dyn AgentAdapter>> {
        let agent = self
            .config
            .settings
            .agent(agent_id)
            .ok_or_else(|| Error::UnknownAgent(agent_id.to_string()))?;
        self.factory.create(&agent, self.notice_tx.clone())
    }

    fn invalidate_history(&self) {
        if let Some(history) = &self.config.history {
            history.invalidate(&self.session.agent_id);
        }
    }

    // ------------------------------------------------------------------
    // lifecycle
    // ------------------------------------------------------------------

    async fn create_session(
        &mut self,
        agent_id: String,
        working_directory: Option<PathBuf>,
    ) -> Result<()> {
        match self.session.status {
            SessionStatus::Uninitialized | SessionStatus::Closed | SessionStatus::Errored => {}
            _ => return Err(self.invalid_state("create a session")),
        }
        // A previous errored attempt may have left a connection behind
        self.teardown().await;

        let working_directory =
            working_directory.unwrap_or_else(|| self.session.working_directory.clone());
        self.open_session(agent_id, working_directory).await
    }

    /// Connect and run `session/new`; the timeline starts empty
    async fn open_session(&mut self, agent_id: String, working_directory: PathBuf) -> Result<()> {
        self.session = Session::uninitialized(&agent_id, &working_directory);
        self.session.status = SessionStatus::Connecting;
        self.aggregator.clear();
        self.gate = PermissionGate::new();
        self.last_error = None;
        self.publish();

        info!(agent_id = %agent_id, cwd = ?working_directory, "Creating session");

        let result = async {
            let adapter = self.create_adapter(&agent_id)?;
            let capabilities = match adapter.connect(&working_directory).await {
                Ok(capabilities) => capabilities,
                Err(e) => {
                    if let Err(d) = adapter.disconnect().await {
                        warn!(agent_id = %agent_id, "Error while disconnecting agent: {}", d);
                    }
                    return Err(e);
                }
            };
            match adapter.new_session(&working_directory).await {
                Ok(new_session) => Ok((adapter, capabilities, new_session)),
                Err(e) => {
                    if let Err(d) = adapter.disconnect().await {
                        warn!(agent_id = %agent_id, "Error while disconnecting agent: {}", d);
                    }
                    Err(e)
                }
            }
        }
        .await;

        match result {
            Ok((adapter, capabilities, new_session)) => {
                info!(agent_id = %agent_id, session_id = %new_session.session_id, "Session ready");
                self.adapter = Some(adapter);
                self.session.id = Some(new_session.session_id);
                self.session.modes = new_session.modes;
                self.session.models = new_session.models;
                self.session.capabilities = capabilities;
                self.session.status = SessionStatus::Ready;
                self.session.created_at = Some(Utc::now());
                self.invalidate_history();
                Ok(())
            }
            Err(e) => {
                warn!(agent_id = %agent_id, "Failed to create session: {}", e);
                self.session.status = SessionStatus::Errored;
                let error = Error::SessionCreation {
                    agent_id,
                    source: Box::new(e),
                };
                self.last_error = Some(error.to_string());
                Err(error)
            }
        }
    }

    /// Best-effort disconnect and reset of the live state
    async fn teardown(&mut self) {
        if self.persist_at.take().is_some() {
            self.save_transcript();
        }
        self.turn = None;
        self.gate = PermissionGate::new();
        self.aggregator.clear();

        if let Some(adapter) = self.adapter.take() {
            debug!(agent_id = %self.session.agent_id, "Tearing down agent connection");
            if let Err(e) = adapter.disconnect().await {
                warn!(agent_id = %self.session.agent_id, "Error while disconnecting agent: {}", e);
            }
        }
    }

    fn abort_restore(&mut self) {
        if let Some(pending) = self.restore.take() {
            pending.task.abort();
            warn!(session_id = %pending.session_id, "Abandoning in-flight {}", pending.kind.operation());
            self.session.status = pending.prior_status;
            self.held_notices.clear();
            let _ = pending.reply.send(Err(Error::Superseded));
        }
    }

    async fn switch_agent(&mut self, agent_id: String) -> Result<()> {
        if let Some(turn) = self.turn.take() {
            self.cancel_turn(turn).await;
        }
        self.abort_restore();
        self.teardown().await;

        let working_directory = self.session.working_directory.clone();
        self.open_session(agent_id, working_directory).await
    }

    async fn new_chat(&mut self) -> Result<()> {
        if let Some(turn) = self.turn.take() {
            self.cancel_turn(turn).await;
        }
        let Some(adapter) = self.adapter.clone() else {
            return Err(Error::NoActiveSession);
        };
        if self.session.status != SessionStatus::Ready {
            return Err(self.invalid_state("start a new chat"));
        }
        if self.persist_at.take().is_some() {
            self.save_transcript();
        }

        let new_session = adapter
            .new_session(&self.session.working_directory)
            .await
            .map_err(|e| Error::SessionCreation {
                agent_id: self.session.agent_id.clone(),
                source: Box::new(e),
            })?;

        info!(session_id = %new_session.session_id, "Started new chat");
        self.aggregator.clear();
        self.gate = PermissionGate::new();
        self.session.id = Some(new_session.session_id);
        self.session.modes = new_session.modes;
        self.session.models = new_session.models;
        self.session.available_commands.clear();
        self.session.created_at = Some(Utc::now());
        self.invalidate_history();
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(turn) = self.turn.take() {
            self.cancel_turn(turn).await;
        }
        self.abort_restore();
        self.teardown().await;
        self.session.id = None;
        self.session.status = SessionStatus::Closed;
        info!(agent_id = %self.session.agent_id, "Session closed");
    }

    // ------------------------------------------------------------------
    // turns
    // ------------------------------------------------------------------

    async fn send_message(&mut self, content: Vec<PromptBlock>) -> Result<()> {
        if self.session.id.is_none() || self.adapter.is_none() {
            return Err(Error::NoActiveSession);
        }
        self.gate.ensure_idle()?;
        if self.session.status != SessionStatus::Ready {
            return Err(self.invalid_state("send a message"));
        }
        let has_image = content
            .iter()
            .any(|block| matches!(block, PromptBlock::Image { .. }));
        if has_image && !self.session.capabilities.prompt_capabilities.image {
            return Err(Error::UnsupportedCapability(format!(
                "agent '{}' does not accept images",
                self.session.agent_id
            )));
        }
        let (adapter, session_id) = self.live()?;

        self.aggregator
            .push_user(content.iter().cloned().map(Into::into).collect());

        match adapter.send_prompt(&session_id, content).await {
            Ok(stream) => {
                debug!(session_id = %session_id, turn_id = %stream.turn_id, "Turn started");
                self.aggregator.begin_agent(&stream.message_id);
                self.turn = Some(ActiveTurn {
                    turn_id: stream.turn_id,
                    events: stream.events,
                });
                self.session.status = SessionStatus::Busy;
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                warn!(session_id = %session_id, "Failed to send prompt: {}", message);
                self.aggregator.fail(&message);
                self.last_error = Some(message.clone());
                Err(Error::Send(message))
            }
        }
    }

    async fn on_turn_event(&mut self, event: Option<TurnEvent>) {
        let event = event.unwrap_or_else(|| TurnEvent::Error {
            message: "agent stopped sending turn events".to_string(),
        });

        match event {
            TurnEvent::PermissionRequest {
                message_id,
                request,
            } => self.on_permission_request(message_id, request).await,
            TurnEvent::TurnEnd { stop_reason } => {
                debug!(?stop_reason, "Turn ended");
                self.aggregator.finish();
                self.end_turn();
            }
            TurnEvent::Cancelled => {
                debug!("Turn cancelled by agent");
                self.aggregator.finish();
                self.end_turn();
            }
            TurnEvent::Error { message } => {
                warn!("Turn failed: {}", message);
                self.aggregator.fail(&message);
                self.last_error = Some(message);
                self.end_turn();
            }
            content => self.aggregator.apply(content),
        }
    }

    fn end_turn(&mut self) {
        self.turn = None;
        self.gate.cancel();
        if self.session.status == SessionStatus::Busy {
            self.session.status = SessionStatus::Ready;
        }
        self.schedule_persist();
    }

    async fn on_permission_request(&mut self, message_id: String, request: PermissionRequest) {
        if let Err(e) = self.gate.register(request.clone()) {
            self.aggregator
                .push_system(format!("Ignored permission request for '{}': {}", request.title, e));
            if let Some(adapter) = self.adapter.clone() {
                if let Err(e) = adapter
                    .respond_permission(&request.request_id, PermissionResponse::Cancelled)
                    .await
                {
                    warn!("Failed to cancel duplicate permission request: {}", e);
                }
            }
            return;
        }

        let auto_option = self
            .config
            .settings
            .auto_allow_permissions
            .then(|| {
                request
                    .options
                    .iter()
                    .find(|option| option.kind.is_allow())
                    .or_else(|| request.options.first())
                    .map(|option| option.option_id.clone())
            })
            .flatten();
        let request_id = request.request_id.clone();

        self.aggregator
            .apply(TurnEvent::PermissionRequest { message_id, request });

        if let Some(option_id) = auto_option {
            debug!(request_id = %request_id, option_id = %option_id, "Auto-approving permission request");
            if let Err(e) = self.approve_permission(&request_id, &option_id).await {
                warn!("Auto-approval failed: {}", e);
            }
        }
    }

    /// Cancel the turn and wait for its terminal event
    async fn cancel_turn(&mut self, mut turn: ActiveTurn) {
        info!(turn_id = %turn.turn_id, "Stopping generation");

        if let Ok((adapter, session_id)) = self.live() {
            if let Err(e) = adapter.cancel(&session_id).await {
                warn!(turn_id = %turn.turn_id, "Cancel request failed: {}", e);
            }
        }
        if let Some(request) = self.gate.cancel() {
            self.aggregator
                .resolve_permission(&request.request_id, PermissionResolution::Cancelled);
        }
        self.publish();

        // Content still in flight is dropped; only the terminal event matters
        let deadline = Instant::now() + self.config.cancel_timeout;
        loop {
            match tokio::time::timeout_at(deadline, turn.events.recv()).await {
                Ok(Some(event)) if event.is_terminal() => {
                    debug!(turn_id = %turn.turn_id, ?event, "Cancelled turn finished");
                    break;
                }
                Ok(Some(_)) => {
                    debug!(turn_id = %turn.turn_id, "Dropping event from cancelled turn");
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        turn_id = %turn.turn_id,
                        timeout = ?self.config.cancel_timeout,
                        "Agent did not confirm cancellation; closing turn"
                    );
                    // Release the turn so the connection accepts the next prompt
                    if let Some(adapter) = &self.adapter {
                        adapter.abandon_turn(&turn.turn_id);
                    }
                    self.last_error = Some(Error::Timeout(self.config.cancel_timeout).to_string());
                    break;
                }
            }
        }

        self.aggregator.finish();
        self.end_turn();
    }

    async fn approve_permission(&mut self, request_id: &str, option_id: &str) -> Result<()> {
        self.gate.validate_approval(request_id, option_id)?;
        let adapter = self.adapter.clone().ok_or(Error::NoActiveSession)?;
        adapter
            .respond_permission(request_id, PermissionResponse::Selected(option_id.to_string()))
            .await?;

        self.gate.approve(request_id, option_id)?;
        self.aggregator.resolve_permission(
            request_id,
            PermissionResolution::Approved {
                option_id: option_id.to_string(),
            },
        );
        Ok(())
    }

    async fn reject_permission(&mut self, request_id: &str) -> Result<()> {
        if self.gate.pending().is_none_or(|p| p.request_id != request_id) {
            return Err(Error::UnknownPermission(request_id.to_string()));
        }
        let adapter = self.adapter.clone().ok_or(Error::NoActiveSession)?;
        adapter
            .respond_permission(request_id, PermissionResponse::Rejected)
            .await?;

        self.gate.reject(request_id)?;
        self.aggregator
            .resolve_permission(request_id, PermissionResolution::Rejected);
        Ok(())
    }

    async fn set_mode(&mut self, mode_id: String) -> Result<()> {
        match self.session.status {
            SessionStatus::Ready | SessionStatus::Busy => {}
            _ => return Err(self.invalid_state("change mode")),
        }
        if !self.session.supports_mode(&mode_id) {
            return Err(Error::UnsupportedCapability(format!("mode '{}'", mode_id)));
        }
        let (adapter, session_id) = self.live()?;
        adapter.set_mode(&session_id, &mode_id).await?;

        if let Some(modes) = self.session.modes.as_mut() {
            modes.current_mode_id = mode_id;
        }
        Ok(())
    }

    async fn set_model(&mut self, model_id: String) -> Result<()> {
        match self.session.status {
            SessionStatus::Ready | SessionStatus::Busy => {}
            _ => return Err(self.invalid_state("change model")),
        }
        if !self.session.supports_model(&model_id) {
            return Err(Error::UnsupportedCapability(format!("model '{}'", model_id)));
        }
        let (adapter, session_id) = self.live()?;
        adapter.set_model(&session_id, &model_id).await?;

        if let Some(models) = self.session.models.as_mut() {
            models.current_model_id = model_id;
        }
        Ok(())
    }

    fn on_notice(&mut self, notice: SessionNotice) {
        // A restore or fork may be about to install the session this is for
        if self.restore.is_some() && self.session.id.as_deref() != Some(notice.session_id()) {
            debug!(session_id = notice.session_id(), "Holding notice until restore finishes");
            self.held_notices.push(notice);
            return;
        }
        match notice {
            SessionNotice::CommandsUpdated {
                session_id,
                commands,
            } if self.session.id.as_deref() == Some(session_id.as_str()) => {
                debug!(count = commands.len(), "Available commands updated");
                self.session.available_commands = commands;
            }
            SessionNotice::ModeChanged {
                session_id,
                mode_id,
            } if self.session.id.as_deref() == Some(session_id.as_str()) => {
                if let Some(modes) = self.session.modes.as_mut() {
                    modes.current_mode_id = mode_id;
                }
            }
            other => debug!(?other, "Ignoring notice for another session"),
        }
    }

    // ------------------------------------------------------------------
    // restore / fork / delete
    // ------------------------------------------------------------------

    fn start_restore(&mut self, kind: RestoreKind, session_id: String, reply: Reply<()>) {
        let prior_status = match (&self.restore, self.session.status) {
            (Some(pending), _) => pending.prior_status,
            (
                None,
                status @ (SessionStatus::Ready | SessionStatus::Errored | SessionStatus::Uninitialized),
            ) => status,
            (None, _) => {
                let _ = reply.send(Err(self.invalid_state(kind.operation())));
                return;
            }
        };

        if let Some(previous) = self.restore.take() {
            previous.task.abort();
            warn!(
                superseded = %previous.session_id,
                session_id = %session_id,
                "Discarding in-flight {} for a newer request",
                previous.kind.operation()
            );
            let _ = previous.reply.send(Err(Error::Superseded));
        }
        if self.persist_at.take().is_some() {
            self.save_transcript();
        }

        let (adapter, capabilities) = match self.adapter.clone() {
            Some(adapter) => (adapter, Some(self.session.capabilities.clone())),
            None => match self.create_adapter(&self.session.agent_id) {
                Ok(adapter) => (adapter, None),
                Err(e) => {
                    self.session.status = prior_status;
                    let _ = reply.send(Err(kind.error(&session_id, e.to_string())));
                    return;
                }
            },
        };

        let live_transcript = (kind == RestoreKind::Fork
            && self.session.id.as_deref() == Some(session_id.as_str()))
        .then(|| self.aggregator.messages().to_vec());

        let job = RestoreJob {
            kind,
            source_id: session_id.clone(),
            adapter,
            capabilities,
            working_directory: self.session.working_directory.clone(),
            store: self.config.store.clone(),
            live_transcript,
        };

        info!(session_id = %session_id, "Starting {}", kind.operation());
        self.session.status = SessionStatus::Restoring;
        self.restore = Some(PendingRestore {
            kind,
            session_id,
            prior_status,
            task: tokio::spawn(job.run()),
            reply,
        });
    }

    async fn on_restore_finished(&mut self, result: std::result::Result<Result<RestoreOutcome>, JoinError>) {
        let Some(pending) = self.restore.take() else {
            return;
        };
        let held = std::mem::take(&mut self.held_notices);
        let outcome = result.unwrap_or_else(|e| {
            Err(pending
                .kind
                .error(&pending.session_id, format!("task failed: {}", e)))
        });

        match outcome {
            Ok(outcome) => {
                if let Some(previous) = self.adapter.take() {
                    if !Arc::ptr_eq(&previous, &outcome.adapter) {
                        if let Err(e) = previous.disconnect().await {
                            warn!("Error while disconnecting agent: {}", e);
                        }
                    }
                }

                info!(
                    source = %pending.session_id,
                    session_id = %outcome.session_id,
                    messages = outcome.messages.messages().len(),
                    "{} finished",
                    pending.kind.operation()
                );
                self.adapter = Some(outcome.adapter);
                self.turn = None;
                self.gate = PermissionGate::new();
                self.aggregator = outcome.messages;
                self.session.id = Some(outcome.session_id);
                self.session.modes = outcome.modes;
                self.session.models = outcome.models;
                self.session.capabilities = outcome.capabilities;
                self.session.available_commands.clear();
                self.session.status = SessionStatus::Ready;
                self.session.created_at = Some(Utc::now());
                self.last_error = None;
                for notice in held {
                    self.on_notice(notice);
                }

                if pending.kind == RestoreKind::Fork {
                    self.invalidate_history();
                    self.schedule_persist();
                }
                self.respond(pending.reply, Ok(()));
            }
            Err(e) => {
                warn!(session_id = %pending.session_id, "{} failed: {}", pending.kind.operation(), e);
                self.session.status = pending.prior_status;
                self.last_error = Some(e.to_string());
                self.respond(pending.reply, Err(e));
            }
        }
    }

    async fn delete_session(&mut self, session_id: &str) -> Result<()> {
        // The restore job owns the adapter until it reports back
        if self.restore.is_some() {
            return Err(self.invalid_state("delete a session"));
        }
        let is_live = self.session.id.as_deref() == Some(session_id);
        if is_live {
            if let Some(turn) = self.turn.take() {
                self.cancel_turn(turn).await;
            }
            self.persist_at = None;
        }

        if let Some(store) = &self.config.store {
            match store.delete(session_id) {
                Ok(removed) => debug!(session_id, removed, "Removed local transcript"),
                Err(e) => warn!(session_id, "Failed to remove local transcript: {}", e),
            }
        }

        let result = match self.adapter.clone() {
            Some(adapter) => adapter.delete_session(session_id).await,
            None => self.delete_with_temporary_adapter(session_id).await,
        };
        let result = match result {
            Err(Error::UnsupportedCapability(reason)) => {
                debug!(session_id, "Agent-side delete skipped: {}", reason);
                Ok(())
            }
            other => other,
        };

        if is_live {
            self.teardown().await;
            self.session = Session::uninitialized(
                self.session.agent_id.clone(),
                self.session.working_directory.clone(),
            );
            info!(session_id, "Deleted live session");
        }
        self.invalidate_history();
        result
    }

    async fn delete_with_temporary_adapter(&self, session_id: &str) -> Result<()> {
        let adapter = self.create_adapter(&self.session.agent_id)?;
        let result = async {
            adapter.connect(&self.session.working_directory).await?;
            adapter.delete_session(session_id).await
        }
        .await;
        if let Err(e) = adapter.disconnect().await {
            warn!("Error while disconnecting agent: {}", e);
        }
        result
    }

    // ------------------------------------------------------------------
    // persistence
    // ------------------------------------------------------------------

    fn schedule_persist(&mut self) {
        if self.config.store.is_some() && self.session.id.is_some() {
            self.persist_at = Some(Instant::now() + self.config.persist_debounce);
        }
    }

    fn save_transcript(&self) {
        let (Some(store), Some(session_id)) = (&self.config.store, &self.session.id) else {
            return;
        };
        if self.aggregator.is_empty() {
            return;
        }

        let saved = SavedSession {
            entry: SessionHistoryEntry {
                session_id: session_id.clone(),
                title: self
                    .aggregator
                    .first_user_text()
                    .and_then(|text| title_from_text(&text)),
                agent_id: self.session.agent_id.clone(),
                working_directory: self.session.working_directory.clone(),
                updated_at: Some(Utc::now()),
                has_local_data: true,
            },
            messages: self.aggregator.messages().to_vec(),
        };

        match store.save(&saved) {
            Ok(()) => self.invalidate_history(),
            Err(e) => warn!(session_id = %session_id, "Failed to save session: {}", e),
        }
    }
}
