//! ACP client: request/response correlation over a split transport
//!
//! A background reader task owns the incoming half. Responses are routed to
//! the waiting request by id; `session/update` notifications and
//! `session/request_permission` requests are forwarded to the
//! [`AgentMessage`] channel returned by [`AcpClient::new`]. Any other
//! agent-initiated request is answered with "method not found".

use parking_lot::Mutex as SyncMutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::protocol::{
    IncomingMessage, JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    RequestId, methods,
};
use crate::transport::{MessageReader, MessageWriter};
use crate::{
    ContentBlock, InitializeResponse, ListSessionsResponse, LoadSessionResponse,
    NewSessionResponse, PROTOCOL_VERSION, PromptResponse, RequestPermissionOutcome,
    RequestPermissionRequest, RequestPermissionResponse, SessionNotification,
};

type SharedWriter = Arc<Mutex<Box<dyn MessageWriter>>>;
type PendingMap = Arc<SyncMutex<HashMap<RequestId, oneshot::Sender<JsonRpcResponse>>>>;

/// Messages the agent sends on its own initiative
#[derive(Debug, Clone)]
pub enum AgentMessage {
    /// A `session/update` notification
    Update(SessionNotification),
    /// A `session/request_permission` request; answer with
    /// [`AcpClient::respond_permission`] using the same id
    PermissionRequest {
        id: RequestId,
        request: RequestPermissionRequest,
    },
    /// The agent closed its output stream
    Closed,
}

#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// ACP errors
#[derive(Debug, thiserror::Error)]
pub enum AcpError {
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Agent error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("Connection closed")]
    Closed,
}

/// Client side of one ACP connection
pub struct AcpClient {
    writer: SharedWriter,
    pending: PendingMap,
    request_id: AtomicI64,
    closed: Arc<AtomicBool>,
    reader_task: JoinHandle<()>,
}

impl AcpClient {
    /// Start the client over a split transport.
    ///
    /// Returns the client and the receiver for agent-initiated messages.
    /// Must be called from within a tokio runtime.
    pub fn new<W, R>(writer: W, reader: R) -> (Self, mpsc::UnboundedReceiver<AgentMessage>)
    where
        W: MessageWriter + 'static,
        R: MessageReader + 'static,
    {
        let writer: SharedWriter = Arc::new(Mutex::new(Box::new(writer)));
        let pending: PendingMap = Arc::new(SyncMutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let (message_tx, message_rx) = mpsc::unbounded_channel();

        let reader_task = tokio::spawn(read_loop(
            Box::new(reader),
            writer.clone(),
            pending.clone(),
            closed.clone(),
            message_tx,
        ));

        let client = Self {
            writer,
            pending,
            request_id: AtomicI64::new(1),
            closed,
            reader_task,
        };

        (client, message_rx)
    }

    fn next_id(&self) -> RequestId {
        RequestId::Number(self.request_id.fetch_add(1, Ordering::SeqCst))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Send a request and wait for its response
    pub async fn request<P, R>(&self, method: &str, params: P) -> Result<R, AcpError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let id = self.next_id();
        let params = serde_json::to_value(params).map_err(|e| AcpError::Protocol(e.to_string()))?;
        let request = JsonRpcRequest::new(id.clone(), method).with_params(params);

        let (response_tx, response_rx) = oneshot::channel();
        self.pending.lock().insert(id.clone(), response_tx);

        // The reader may have shut down between the check and the insert
        if self.is_closed() {
            self.pending.lock().remove(&id);
            return Err(AcpError::Closed);
        }

        let value = serde_json::to_value(&request).map_err(|e| AcpError::Protocol(e.to_string()))?;
        if let Err(e) = self.send_value(value).await {
            self.pending.lock().remove(&id);
            return Err(e);
        }
        debug!(%id, method, "Sent request");

        let response = response_rx.await.map_err(|_| AcpError::Closed)?;

        if let Some(error) = response.error {
            return Err(AcpError::Rpc {
                code: error.code,
                message: error.message,
            });
        }

        serde_json::from_value(response.result.unwrap_or(Value::Null))
            .map_err(|e| AcpError::Protocol(format!("Invalid {} response: {}", method, e)))
    }

    /// Send a notification (no response expected)
    pub async fn notify<P: Serialize>(&self, method: &str, params: P) -> Result<(), AcpError> {
        let params = serde_json::to_value(params).map_err(|e| AcpError::Protocol(e.to_string()))?;
        let notification = JsonRpcNotification::new(method, Some(params));
        let value =
            serde_json::to_value(&notification).map_err(|e| AcpError::Protocol(e.to_string()))?;
        self.send_value(value).await
    }

    async fn send_value(&self, value: Value) -> Result<(), AcpError> {
        let mut writer = self.writer.lock().await;
        writer
            .send(value)
            .await
            .map_err(|e| AcpError::Transport(e.to_string()))
    }

    /// Negotiate protocol version and capabilities
    pub async fn initialize(&self, client_info: &ClientInfo) -> Result<InitializeResponse, AcpError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "clientCapabilities": {
                "fs": { "readTextFile": false, "writeTextFile": false },
                "terminal": false
            },
            "clientInfo": {
                "name": client_info.name,
                "version": client_info.version
            }
        });

        let response: InitializeResponse = self.request(methods::INITIALIZE, params).await?;
        if response.protocol_version != PROTOCOL_VERSION {
            warn!(
                agent_version = response.protocol_version,
                client_version = PROTOCOL_VERSION,
                "Agent negotiated a different protocol version"
            );
        }
        Ok(response)
    }

    pub async fn new_session(&self, cwd: &Path) -> Result<NewSessionResponse, AcpError> {
        self.request(methods::SESSION_NEW, json!({ "cwd": cwd, "mcpServers": [] }))
            .await
    }

    /// Load an existing session. The agent replays the conversation as
    /// `session/update` notifications before answering.
    pub async fn load_session(
        &self,
        session_id: &str,
        cwd: &Path,
    ) -> Result<LoadSessionResponse, AcpError> {
        self.request(
            methods::SESSION_LOAD,
            json!({ "sessionId": session_id, "cwd": cwd, "mcpServers": [] }),
        )
        .await
    }

    pub async fn fork_session(
        &self,
        session_id: &str,
        cwd: &Path,
    ) -> Result<NewSessionResponse, AcpError> {
        self.request(
            methods::SESSION_FORK,
            json!({ "sessionId": session_id, "cwd": cwd, "mcpServers": [] }),
        )
        .await
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<(), AcpError> {
        let _: Value = self
            .request(methods::SESSION_DELETE, json!({ "sessionId": session_id }))
            .await?;
        Ok(())
    }

    pub async fn list_sessions(
        &self,
        cwd: Option<&Path>,
        cursor: Option<&str>,
    ) -> Result<ListSessionsResponse, AcpError> {
        let mut params = serde_json::Map::new();
        if let Some(cwd) = cwd {
            params.insert("cwd".into(), json!(cwd));
        }
        if let Some(cursor) = cursor {
            params.insert("cursor".into(), json!(cursor));
        }
        self.request(methods::SESSION_LIST, Value::Object(params)).await
    }

    /// Send a prompt; resolves when the turn ends
    pub async fn prompt(
        &self,
        session_id: &str,
        prompt: Vec<ContentBlock>,
    ) -> Result<PromptResponse, AcpError> {
        self.request(
            methods::SESSION_PROMPT,
            json!({ "sessionId": session_id, "prompt": prompt }),
        )
        .await
    }

    pub async fn cancel(&self, session_id: &str) -> Result<(), AcpError> {
        self.notify(methods::SESSION_CANCEL, json!({ "sessionId": session_id }))
            .await
    }

    pub async fn set_mode(&self, session_id: &str, mode_id: &str) -> Result<(), AcpError> {
        let _: Value = self
            .request(
                methods::SESSION_SET_MODE,
                json!({ "sessionId": session_id, "modeId": mode_id }),
            )
            .await?;
        Ok(())
    }

    pub async fn set_model(&self, session_id: &str, model_id: &str) -> Result<(), AcpError> {
        let _: Value = self
            .request(
                methods::SESSION_SET_MODEL,
                json!({ "sessionId": session_id, "modelId": model_id }),
            )
            .await?;
        Ok(())
    }

    /// Answer a `session/request_permission` request
    pub async fn respond_permission(
        &self,
        id: RequestId,
        outcome: RequestPermissionOutcome,
    ) -> Result<(), AcpError> {
        let result = serde_json::to_value(RequestPermissionResponse { outcome })
            .map_err(|e| AcpError::Protocol(e.to_string()))?;
        let response = JsonRpcResponse::success(id, result);
        let value = serde_json::to_value(&response).map_err(|e| AcpError::Protocol(e.to_string()))?;
        self.send_value(value).await
    }

    /// Close the connection; the agent process (if any) is killed
    pub async fn shutdown(&self) -> Result<(), AcpError> {
        self.reader_task.abort();
        self.closed.store(true, Ordering::SeqCst);
        self.pending.lock().clear();
        let mut writer = self.writer.lock().await;
        writer
            .close()
            .await
            .map_err(|e| AcpError::Transport(e.to_string()))
    }
}

impl Drop for AcpClient {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

async fn read_loop(
    mut reader: Box<dyn MessageReader>,
    writer: SharedWriter,
    pending: PendingMap,
    closed: Arc<AtomicBool>,
    message_tx: mpsc::UnboundedSender<AgentMessage>,
) {
    loop {
        let value = match reader.receive().await {
            Ok(Some(value)) => value,
            Ok(None) => {
                debug!("Agent closed its output stream");
                break;
            }
            Err(e) => {
                warn!("Failed to read from agent: {}", e);
                break;
            }
        };

        let message = match IncomingMessage::parse(value) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping malformed JSON-RPC message: {}", e);
                continue;
            }
        };

        match message {
            IncomingMessage::Response(response) => {
                let waiter = pending.lock().remove(&response.id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => warn!(id = %response.id, "Response for unknown request"),
                }
            }
            IncomingMessage::Notification(notification) => {
                if notification.method != methods::SESSION_UPDATE {
                    debug!(method = %notification.method, "Ignoring notification");
                    continue;
                }
                let params = notification.params.unwrap_or(Value::Null);
                match serde_json::from_value::<SessionNotification>(params) {
                    Ok(update) => {
                        let _ = message_tx.send(AgentMessage::Update(update));
                    }
                    Err(e) => warn!("Malformed session/update: {}", e),
                }
            }
            IncomingMessage::Request(request) => {
                let reply = if request.method == methods::SESSION_REQUEST_PERMISSION {
                    let params = request.params.unwrap_or(Value::Null);
                    match serde_json::from_value::<RequestPermissionRequest>(params) {
                        Ok(permission) => {
                            let _ = message_tx.send(AgentMessage::PermissionRequest {
                                id: request.id,
                                request: permission,
                            });
                            None
                        }
                        Err(e) => Some(JsonRpcResponse::failure(
                            request.id,
                            JsonRpcError::invalid_params(e.to_string()),
                        )),
                    }
                } else {
                    debug!(method = %request.method, "Rejecting unsupported agent request");
                    Some(JsonRpcResponse::failure(
                        request.id,
                        JsonRpcError::method_not_found(&request.method),
                    ))
                };

                if let Some(reply) = reply {
                    if let Ok(value) = serde_json::to_value(&reply) {
                        if let Err(e) = writer.lock().await.send(value).await {
                            warn!("Failed to answer agent request: {}", e);
                        }
                    }
                }
            }
        }
    }

    // Dropping the senders wakes every waiting request with `Closed`
    closed.store(true, Ordering::SeqCst);
    pending.lock().clear();
    let _ = message_tx.send(AgentMessage::Closed);
}
