//! ACP implementation of [`AgentAdapter`]
//!
//! One router task consumes everything the agent sends on its own
//! initiative and routes it to the active turn, to a replay collector while
//! a session is loading, or to the notice channel. Prompt completion is fed
//! through the same task so a turn's terminal event is always emitted after
//! every update the agent sent before answering the prompt.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use agent_client_acp::protocol::RequestId;
use agent_client_acp::{
    AcpClient, AcpError, AgentCapabilities, AgentCommand, AgentMessage, ClientInfo,
    ContentBlock as WireBlock, PermissionOption, PromptResponse, RequestPermissionOutcome,
    MessageReader, MessageWriter, SessionNotification, SessionUpdate, StdioTransport, StopReason,
};

use super::{
    AdapterFactory, AgentAdapter, LoadedSession, NewSession, NoticeSender, PermissionResponse,
    PromptBlock, SessionNotice, SessionPage, ToolCallPatch, ToolCallStart, TurnEvent, TurnStream,
};
use crate::config::AgentConfig;
use crate::error::{Error, Result};
use crate::session::{PermissionRequest, SessionHistoryEntry, ToolStatus};

/// Creates [`AcpAdapter`]s that launch agents as child processes
#[derive(Debug, Clone, Default)]
pub struct AcpAdapterFactory {
    client_info: ClientInfo,
}

impl AcpAdapterFactory {
    pub fn new(client_info: ClientInfo) -> Self {
        Self { client_info }
    }
}

impl AdapterFactory for AcpAdapterFactory {
    fn create(&self, agent: &AgentConfig, notices: NoticeSender) -> Result<Arc<dyn AgentAdapter>> {
        Ok(Arc::new(AcpAdapter::new(
            agent.clone(),
            self.client_info.clone(),
            notices,
        )))
    }
}

struct ActiveTurn {
    session_id: String,
    turn_id: String,
    message_id: String,
    events: mpsc::UnboundedSender<TurnEvent>,
    cancelled: bool,
    /// Task awaiting the `session/prompt` response
    prompt_task: Option<JoinHandle<()>>,
}

struct PendingPermission {
    rpc_id: RequestId,
    turn_id: String,
    options: Vec<PermissionOption>,
}

/// Collects the updates an agent replays during `session/load`
struct ReplayCollector {
    session_id: String,
    events: Vec<TurnEvent>,
    /// Current message id and whether it is a user message
    current: Option<(String, bool)>,
}

impl ReplayCollector {
    fn message_id(&mut self, user: bool) -> String {
        match &self.current {
            Some((id, is_user)) if *is_user == user => id.clone(),
            _ => {
                let id = Uuid::new_v4().to_string();
                self.current = Some((id.clone(), user));
                id
            }
        }
    }
}

#[derive(Default)]
struct Routes {
    turn: Option<ActiveTurn>,
    replay: Option<ReplayCollector>,
    permissions: HashMap<String, PendingPermission>,
}

impl Routes {
    /// Forget everything; an in-flight turn's stream ends without a terminal event
    fn clear(&mut self) {
        if let Some(task) = self.turn.take().and_then(|turn| turn.prompt_task) {
            task.abort();
        }
        self.replay = None;
        self.permissions.clear();
    }
}

enum RouterInput {
    PromptFinished {
        turn_id: String,
        result: std::result::Result<PromptResponse, AcpError>,
    },
    /// Acknowledged once every message received so far has been routed
    Sync(oneshot::Sender<()>),
}

struct Connection {
    client: Arc<AcpClient>,
    routes: Arc<Mutex<Routes>>,
    control: mpsc::UnboundedSender<RouterInput>,
    router: JoinHandle<()>,
    capabilities: AgentCapabilities,
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.router.abort();
        self.routes.lock().clear();
    }
}

/// Adapter speaking ACP to one agent process
pub struct AcpAdapter {
    agent: AgentConfig,
    client_info: ClientInfo,
    notices: NoticeSender,
    connection: Mutex<Option<Arc<Connection>>>,
}

impl AcpAdapter {
    pub fn new(agent: AgentConfig, client_info: ClientInfo, notices: NoticeSender) -> Self {
        Self {
            agent,
            client_info,
            notices,
            connection: Mutex::new(None),
        }
    }

    fn connection(&self) -> Result<Arc<Connection>> {
        self.connection
            .lock()
            .clone()
            .ok_or_else(|| Error::Send(format!("agent '{}' is not connected", self.agent.id)))
    }

    fn connection_error(&self, message: impl Into<String>) -> Error {
        Error::Connection {
            agent_id: self.agent.id.clone(),
            message: message.into(),
        }
    }

    /// Wait until the router has handled everything received so far
    async fn sync(connection: &Connection) {
        let (tx, rx) = oneshot::channel();
        if connection.control.send(RouterInput::Sync(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Run the handshake over an already open transport and start routing
    pub async fn attach<W, R>(&self, writer: W, reader: R) -> Result<AgentCapabilities>
    where
        W: MessageWriter + 'static,
        R: MessageReader + 'static,
    {
        let (client, messages) = AcpClient::new(writer, reader);
        let client = Arc::new(client);

        let init = match client.initialize(&self.client_info).await {
            Ok(init) => init,
            Err(e) => {
                let _ = client.shutdown().await;
                return Err(self.connection_error(format!("initialize failed: {}", e)));
            }
        };

        let routes = Arc::new(Mutex::new(Routes::default()));
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let router = Router {
            client: client.clone(),
            routes: routes.clone(),
            notices: self.notices.clone(),
        };
        let router = tokio::spawn(router.run(messages, control_rx));

        info!(
            agent_id = %self.agent.id,
            agent = ?init.agent_info.as_ref().map(|i| i.name.as_str()),
            "Connected to agent"
        );

        let connection = Arc::new(Connection {
            client,
            routes,
            control: control_tx,
            router,
            capabilities: init.agent_capabilities.clone(),
        });
        *self.connection.lock() = Some(connection);

        Ok(init.agent_capabilities)
    }
}

#[async_trait]
impl AgentAdapter for AcpAdapter {
    async fn connect(&self, working_directory: &Path) -> Result<AgentCapabilities> {
        if let Some(connection) = self.connection.lock().clone() {
            return Ok(connection.capabilities.clone());
        }

        let command = AgentCommand::new(&self.agent.command)
            .with_args(self.agent.args.clone())
            .with_env(self.agent.env.clone())
            .with_cwd(working_directory);

        let transport = StdioTransport::spawn(&command)
            .map_err(|e| self.connection_error(format!("failed to launch '{}': {}", command.program, e)))?;
        let (writer, reader) = transport.into_split();
        self.attach(writer, reader).await
    }

    async fn new_session(&self, working_directory: &Path) -> Result<NewSession> {
        let connection = self.connection()?;
        let response = connection.client.new_session(working_directory).await?;
        debug!(agent_id = %self.agent.id, session_id = %response.session_id, "Created session");
        Ok(NewSession {
            session_id: response.session_id,
            modes: response.modes,
            models: response.models,
        })
    }

    async fn send_prompt(&self, session_id: &str, content: Vec<PromptBlock>) -> Result<TurnStream> {
        let connection = self.connection()?;

        let turn_id = Uuid::new_v4().to_string();
        let message_id = Uuid::new_v4().to_string();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        {
            let mut routes = connection.routes.lock();
            if routes.turn.is_some() {
                return Err(Error::ProtocolViolation(
                    "a prompt is already in flight on this connection".to_string(),
                ));
            }
            routes.turn = Some(ActiveTurn {
                session_id: session_id.to_string(),
                turn_id: turn_id.clone(),
                message_id: message_id.clone(),
                events: events_tx,
                cancelled: false,
                prompt_task: None,
            });
        }

        let prompt: Vec<WireBlock> = content
            .into_iter()
            .map(|block| match block {
                PromptBlock::Text(text) => WireBlock::Text { text },
                PromptBlock::Image { data, mime_type } => WireBlock::Image { data, mime_type },
            })
            .collect();

        let client = connection.client.clone();
        let control = connection.control.clone();
        let session = session_id.to_string();
        let finished_turn = turn_id.clone();
        let task = tokio::spawn(async move {
            let result = client.prompt(&session, prompt).await;
            let _ = control.send(RouterInput::PromptFinished {
                turn_id: finished_turn,
                result,
            });
        });
        if let Some(turn) = connection
            .routes
            .lock()
            .turn
            .as_mut()
            .filter(|t| t.turn_id == turn_id)
        {
            turn.prompt_task = Some(task);
        }

        debug!(session_id, turn_id = %turn_id, "Prompt sent");
        Ok(TurnStream {
            turn_id,
            message_id,
            events: events_rx,
        })
    }

    async fn cancel(&self, session_id: &str) -> Result<()> {
        let Ok(connection) = self.connection() else {
            return Ok(());
        };

        let orphaned: Vec<RequestId> = {
            let mut routes = connection.routes.lock();
            let Routes {
                turn, permissions, ..
            } = &mut *routes;
            match turn {
                Some(turn) if turn.session_id == session_id && !turn.cancelled => {
                    turn.cancelled = true;
                    let turn_id = turn.turn_id.clone();
                    let ids: Vec<String> = permissions
                        .iter()
                        .filter(|(_, p)| p.turn_id == turn_id)
                        .map(|(id, _)| id.clone())
                        .collect();
                    ids.into_iter()
                        .filter_map(|id| permissions.remove(&id))
                        .map(|p| p.rpc_id)
                        .collect()
                }
                _ => return Ok(()),
            }
        };

        // The agent must see every pending permission answered as cancelled
        for rpc_id in orphaned {
            if let Err(e) = connection
                .client
                .respond_permission(rpc_id, RequestPermissionOutcome::Cancelled)
                .await
            {
                warn!("Failed to cancel permission request: {}", e);
            }
        }

        connection.client.cancel(session_id).await?;
        debug!(session_id, "Cancel sent");
        Ok(())
    }

    fn abandon_turn(&self, turn_id: &str) {
        let Ok(connection) = self.connection() else {
            return;
        };
        let mut routes = connection.routes.lock();
        let Some(turn) = routes.turn.take_if(|t| t.turn_id == turn_id) else {
            return;
        };
        if let Some(task) = turn.prompt_task {
            task.abort();
        }
        routes.permissions.retain(|_, p| p.turn_id != turn_id);
        warn!(turn_id, session_id = %turn.session_id, "Abandoned turn the agent did not finish");
    }

    async fn set_mode(&self, session_id: &str, mode_id: &str) -> Result<()> {
        let connection = self.connection()?;
        connection.client.set_mode(session_id, mode_id).await?;
        Ok(())
    }

    async fn set_model(&self, session_id: &str, model_id: &str) -> Result<()> {
        let connection = self.connection()?;
        connection.client.set_model(session_id, model_id).await?;
        Ok(())
    }

    async fn respond_permission(&self, request_id: &str, response: PermissionResponse) -> Result<()> {
        let connection = self.connection()?;
        let pending = connection
            .routes
            .lock()
            .permissions
            .remove(request_id)
            .ok_or_else(|| Error::UnknownPermission(request_id.to_string()))?;

        let outcome = match response {
            PermissionResponse::Selected(option_id) => RequestPermissionOutcome::Selected { option_id },
            PermissionResponse::Rejected => pending
                .options
                .iter()
                .find(|o| o.kind.is_reject())
                .map(|o| RequestPermissionOutcome::Selected {
                    option_id: o.option_id.clone(),
                })
                .unwrap_or(RequestPermissionOutcome::Cancelled),
            PermissionResponse::Cancelled => RequestPermissionOutcome::Cancelled,
        };

        connection
            .client
            .respond_permission(pending.rpc_id, outcome)
            .await?;
        Ok(())
    }

    async fn list_sessions(&self, cwd: Option<&Path>, cursor: Option<&str>) -> Result<SessionPage> {
        let connection = self.connection()?;
        if !connection.capabilities.session_capabilities.supports_list() {
            return Err(Error::UnsupportedCapability(format!(
                "agent '{}' cannot list sessions",
                self.agent.id
            )));
        }

        let response = connection.client.list_sessions(cwd, cursor).await?;
        let sessions = response
            .sessions
            .into_iter()
            .map(|info| SessionHistoryEntry {
                session_id: info.session_id,
                title: info.title,
                agent_id: self.agent.id.clone(),
                working_directory: info
                    .cwd
                    .or_else(|| cwd.map(Path::to_path_buf))
                    .unwrap_or_default(),
                updated_at: info
                    .updated_at
                    .as_deref()
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|t| t.with_timezone(&Utc)),
                has_local_data: false,
            })
            .collect();

        Ok(SessionPage {
            sessions,
            next_cursor: response.next_cursor,
        })
    }

    async fn load_session(&self, session_id: &str, working_directory: &Path) -> Result<LoadedSession> {
        let connection = self.connection()?;
        if !connection.capabilities.load_session {
            return Err(Error::UnsupportedCapability(format!(
                "agent '{}' cannot load sessions",
                self.agent.id
            )));
        }

        connection.routes.lock().replay = Some(ReplayCollector {
            session_id: session_id.to_string(),
            events: Vec::new(),
            current: None,
        });

        let result = connection
            .client
            .load_session(session_id, working_directory)
            .await;
        Self::sync(&connection).await;
        let collected = connection.routes.lock().replay.take();
        let response = result?;

        let transcript = collected.map(|c| c.events).unwrap_or_default();
        debug!(session_id, events = transcript.len(), "Loaded session");
        Ok(LoadedSession {
            session_id: session_id.to_string(),
            modes: response.modes,
            models: response.models,
            transcript,
        })
    }

    async fn fork_session(&self, session_id: &str, working_directory: &Path) -> Result<NewSession> {
        let connection = self.connection()?;
        if !connection.capabilities.session_capabilities.supports_fork() {
            return Err(Error::UnsupportedCapability(format!(
                "agent '{}' cannot fork sessions",
                self.agent.id
            )));
        }

        let response = connection
            .client
            .fork_session(session_id, working_directory)
            .await?;
        Ok(NewSession {
            session_id: response.session_id,
            modes: response.modes,
            models: response.models,
        })
    }

    async fn delete_session(&self, session_id: &str) -> Result<()> {
        let connection = self.connection()?;
        if !connection.capabilities.session_capabilities.supports_delete() {
            return Err(Error::UnsupportedCapability(format!(
                "agent '{}' cannot delete sessions",
                self.agent.id
            )));
        }
        connection.client.delete_session(session_id).await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let Some(connection) = self.connection.lock().take() else {
            return Ok(());
        };
        info!(agent_id = %self.agent.id, "Disconnecting agent");

        connection.routes.lock().clear();
        connection.router.abort();
        connection.client.shutdown().await?;
        Ok(())
    }
}

/// Routes agent-initiated messages; see the module docs
struct Router {
    client: Arc<AcpClient>,
    routes: Arc<Mutex<Routes>>,
    notices: NoticeSender,
}

impl Router {
    async fn run(
        self,
        mut messages: mpsc::UnboundedReceiver<AgentMessage>,
        mut control: mpsc::UnboundedReceiver<RouterInput>,
    ) {
        loop {
            tokio::select! {
                biased;

                message = messages.recv() => match message {
                    Some(message) => self.route(message).await,
                    None => break,
                },

                input = control.recv() => {
                    let Some(input) = input else { break };
                    // Anything queued before the input belongs before it
                    while let Ok(message) = messages.try_recv() {
                        self.route(message).await;
                    }
                    match input {
                        RouterInput::PromptFinished { turn_id, result } => {
                            self.finish_turn(&turn_id, result)
                        }
                        RouterInput::Sync(ack) => {
                            let _ = ack.send(());
                        }
                    }
                }
            }
        }
        debug!("Agent router stopped");
    }

    async fn route(&self, message: AgentMessage) {
        match message {
            AgentMessage::Update(notification) => self.route_update(notification),
            AgentMessage::PermissionRequest { id, request } => {
                let registered = {
                    let mut routes = self.routes.lock();
                    let Routes {
                        turn, permissions, ..
                    } = &mut *routes;
                    match turn {
                        Some(turn) if turn.session_id == request.session_id && !turn.cancelled => {
                            let request_id = Uuid::new_v4().to_string();
                            permissions.insert(
                                request_id.clone(),
                                PendingPermission {
                                    rpc_id: id.clone(),
                                    turn_id: turn.turn_id.clone(),
                                    options: request.options.clone(),
                                },
                            );
                            let event = TurnEvent::PermissionRequest {
                                message_id: turn.message_id.clone(),
                                request: PermissionRequest {
                                    request_id,
                                    tool_call_id: request.tool_call.tool_call_id.clone(),
                                    title: request
                                        .tool_call
                                        .title
                                        .clone()
                                        .unwrap_or_else(|| request.tool_call.tool_call_id.clone()),
                                    options: request.options.clone(),
                                    created_at: Utc::now(),
                                },
                            };
                            let _ = turn.events.send(event);
                            true
                        }
                        _ => false,
                    }
                };

                if !registered {
                    debug!(session_id = %request.session_id, "Permission request outside an active turn");
                    if let Err(e) = self
                        .client
                        .respond_permission(id, RequestPermissionOutcome::Cancelled)
                        .await
                    {
                        warn!("Failed to answer permission request: {}", e);
                    }
                }
            }
            AgentMessage::Closed => {
                let mut routes = self.routes.lock();
                if let Some(turn) = routes.turn.take() {
                    warn!(turn_id = %turn.turn_id, "Agent exited during a turn");
                    let event = if turn.cancelled {
                        TurnEvent::Cancelled
                    } else {
                        TurnEvent::Error {
                            message: "agent process exited".to_string(),
                        }
                    };
                    let _ = turn.events.send(event);
                }
                routes.permissions.clear();
            }
        }
    }

    fn route_update(&self, notification: SessionNotification) {
        let SessionNotification { session_id, update } = notification;

        match update {
            SessionUpdate::AvailableCommandsUpdate { available_commands } => {
                let _ = self.notices.send(SessionNotice::CommandsUpdated {
                    session_id,
                    commands: available_commands,
                });
                return;
            }
            SessionUpdate::CurrentModeUpdate { current_mode_id } => {
                let _ = self.notices.send(SessionNotice::ModeChanged {
                    session_id,
                    mode_id: current_mode_id,
                });
                return;
            }
            SessionUpdate::Unknown => {
                debug!(%session_id, "Ignoring unknown session update");
                return;
            }
            _ => {}
        }

        let mut routes = self.routes.lock();

        if let Some(replay) = routes
            .replay
            .as_mut()
            .filter(|r| r.session_id == session_id)
        {
            let user = matches!(update, SessionUpdate::UserMessageChunk { .. });
            let message_id = replay.message_id(user);
            if let Some(event) = translate(update, message_id, true) {
                replay.events.push(event);
            }
            return;
        }

        match routes.turn.as_ref() {
            Some(turn) if turn.session_id == session_id => {
                if turn.cancelled {
                    debug!(turn_id = %turn.turn_id, "Dropping update for cancelled turn");
                    return;
                }
                if let Some(event) = translate(update, turn.message_id.clone(), false) {
                    let _ = turn.events.send(event);
                }
            }
            _ => debug!(%session_id, "Dropping update outside an active turn"),
        }
    }

    fn finish_turn(&self, turn_id: &str, result: std::result::Result<PromptResponse, AcpError>) {
        let mut routes = self.routes.lock();
        let Some(turn) = routes.turn.take_if(|t| t.turn_id == turn_id) else {
            debug!(turn_id, "Prompt finished for a turn that is no longer active");
            return;
        };
        routes.permissions.retain(|_, p| p.turn_id != turn_id);

        let event = match result {
            _ if turn.cancelled => TurnEvent::Cancelled,
            Ok(response) if response.stop_reason == StopReason::Cancelled => TurnEvent::Cancelled,
            Ok(response) => TurnEvent::TurnEnd {
                stop_reason: response.stop_reason,
            },
            Err(e) => TurnEvent::Error {
                message: e.to_string(),
            },
        };
        debug!(turn_id, ?event, "Turn finished");
        let _ = turn.events.send(event);
    }
}

/// Map a session update to a turn event. `replay` allows user chunks.
fn translate(update: SessionUpdate, message_id: String, replay: bool) -> Option<TurnEvent> {
    match update {
        SessionUpdate::UserMessageChunk { content } if replay => {
            text_of(content).map(|text| TurnEvent::UserText { message_id, text })
        }
        SessionUpdate::UserMessageChunk { .. } => None,
        SessionUpdate::AgentMessageChunk { content } => {
            text_of(content).map(|text| TurnEvent::TextDelta { message_id, text })
        }
        SessionUpdate::AgentThoughtChunk { content } => {
            text_of(content).map(|text| TurnEvent::ThoughtDelta { message_id, text })
        }
        SessionUpdate::ToolCall(call) => Some(TurnEvent::ToolCallStart {
            message_id,
            tool_call: ToolCallStart {
                tool_call_id: call.tool_call_id,
                title: call.title,
                kind: call.kind,
                status: call.status.map(ToolStatus::from).unwrap_or(ToolStatus::Pending),
                content: call.content.into_iter().map(Into::into).collect(),
                raw_input: call.raw_input,
            },
        }),
        SessionUpdate::ToolCallUpdate(update) => Some(TurnEvent::ToolCallUpdate {
            message_id,
            patch: ToolCallPatch {
                tool_call_id: update.tool_call_id,
                title: update.title,
                kind: update.kind,
                status: update.status.map(ToolStatus::from),
                content: update
                    .content
                    .map(|content| content.into_iter().map(Into::into).collect()),
            },
        }),
        SessionUpdate::Plan { entries } => Some(TurnEvent::PlanUpdate {
            message_id,
            entries,
        }),
        SessionUpdate::AvailableCommandsUpdate { .. }
        | SessionUpdate::CurrentModeUpdate { .. }
        | SessionUpdate::Unknown => None,
    }
}

fn text_of(content: WireBlock) -> Option<String> {
    match content {
        WireBlock::Text { text } => Some(text),
        WireBlock::ResourceLink { uri, name } => Some(format!("[{}]({})", name, uri)),
        other => {
            debug!(?other, "Skipping non-text message content");
            None
        }
    }
}
