//! ACP adapter integration tests
//!
//! The adapter is attached to an in-process agent over duplex pipes and
//! driven through a session controller.

use std::sync::Arc;
use std::time::Duration;

use agent_client_acp::{ClientInfo, LineReader, LineWriter, MessageReader, MessageWriter};
use agent_client_core::adapter::{AdapterFactory, AgentAdapter, NoticeSender, PromptBlock};
use agent_client_core::session::{ControllerConfig, SessionController, SessionStatus};
use agent_client_core::{AcpAdapter, AgentConfig, Result, Settings};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::timeout;

/// Hands out one adapter that is already attached to the agent
struct AttachedFactory {
    adapter: Arc<AcpAdapter>,
}

impl AdapterFactory for AttachedFactory {
    fn create(&self, _agent: &AgentConfig, _notices: NoticeSender) -> Result<Arc<dyn AgentAdapter>> {
        Ok(self.adapter.clone())
    }
}

/// Agent that opens sessions but never answers a prompt
fn spawn_silent_agent() -> (
    LineWriter<tokio::io::DuplexStream>,
    LineReader<tokio::io::DuplexStream>,
    mpsc::UnboundedReceiver<String>,
) {
    let (client_out, agent_in) = tokio::io::duplex(64 * 1024);
    let (agent_out, client_in) = tokio::io::duplex(64 * 1024);
    let (methods_tx, methods_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut reader = LineReader::new(agent_in);
        let mut writer = LineWriter::new(agent_out);
        while let Ok(Some(message)) = reader.receive().await {
            let method = message["method"].as_str().unwrap_or_default().to_string();
            let result = match method.as_str() {
                "initialize" => Some(json!({
                    "protocolVersion": 1,
                    "agentCapabilities": {
                        "loadSession": true,
                        "promptCapabilities": { "image": true },
                        "sessionCapabilities": { "list": {} }
                    },
                    "agentInfo": { "name": "silent-agent", "version": "0.0.1" }
                })),
                "session/new" => Some(json!({ "sessionId": "sess-1" })),
                _ => None,
            };
            if let (Some(result), Some(id)) = (result, message.get("id")) {
                let reply: Value = json!({ "jsonrpc": "2.0", "id": id, "result": result });
                if writer.send(reply).await.is_err() {
                    break;
                }
            }
            let _ = methods_tx.send(method);
        }
    });

    (LineWriter::new(client_out), LineReader::new(client_in), methods_rx)
}

async fn next_method(methods: &mut mpsc::UnboundedReceiver<String>, wanted: &str) {
    timeout(Duration::from_secs(5), async {
        while let Some(method) = methods.recv().await {
            if method == wanted {
                return;
            }
        }
        panic!("agent stream closed before {}", wanted);
    })
    .await
    .unwrap_or_else(|_| panic!("agent never received {}", wanted));
}

mod cancel_tests {
    use super::*;

    #[tokio::test]
    async fn test_prompt_accepted_after_unconfirmed_cancel() {
        let settings = Settings::default();
        let agent_id = settings.default_agent_id.clone();
        let agent = settings.agent(&agent_id).expect("built-in agent");

        let (notices, _notices_rx) = mpsc::unbounded_channel();
        let adapter = Arc::new(AcpAdapter::new(agent, ClientInfo::default(), notices));
        let (writer, reader, mut methods) = spawn_silent_agent();
        adapter.attach(writer, reader).await.unwrap();

        let config = ControllerConfig::new(settings, "/vault")
            .with_cancel_timeout(Duration::from_millis(200));
        let controller = SessionController::spawn(config, Arc::new(AttachedFactory { adapter }));
        controller
            .create_session(agent_id.as_str(), "/vault")
            .await
            .unwrap();

        controller
            .send_message(vec![PromptBlock::text("one")])
            .await
            .unwrap();
        next_method(&mut methods, "session/prompt").await;

        controller.stop_generation().await.unwrap();
        next_method(&mut methods, "session/cancel").await;
        let snapshot = controller.snapshot();
        assert_eq!(snapshot.status(), SessionStatus::Ready);
        assert_eq!(
            snapshot.last_error.as_deref(),
            Some("Operation timed out after 200ms")
        );

        controller
            .send_message(vec![PromptBlock::text("two")])
            .await
            .unwrap();
        next_method(&mut methods, "session/prompt").await;
        assert_eq!(controller.snapshot().status(), SessionStatus::Busy);
    }
}
