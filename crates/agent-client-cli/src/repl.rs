//! Interactive chat loop
//!
//! Line editing runs on its own thread since rustyline blocks; lines reach the
//! async side over a channel and become controller commands.

use std::path::Path;
use std::sync::Arc;

use console::style;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use agent_client_core::adapter::PromptBlock;
use agent_client_core::config::ConfigManager;
use agent_client_core::history::{AgentHistorySource, HistoryFilter, SessionHistoryManager};
use agent_client_core::session::{ControllerConfig, SessionController, SessionStore};
use agent_client_core::{AcpAdapterFactory, Error};

use crate::print_history;
use crate::render::TranscriptView;

const HELP: &str = "\
Commands:
  /stop              Stop the current response
  /new               Start a new chat with the same agent
  /agent <ID>        Switch to another agent
  /restart           Restart the agent process
  /mode <ID>         Set the session mode
  /model <ID>        Set the session model
  /allow [OPTION]    Approve the pending permission request
  /deny              Reject the pending permission request
  /history           List previous sessions
  /more              Load more sessions
  /load <ID>         Restore a previous session
  /fork <ID>         Continue a previous session in a new one
  /delete <ID>       Delete a session
  /help              Show this help
  /quit              Exit";

/// One line of user input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplCommand {
    Message(String),
    Stop,
    New,
    Agent(String),
    Restart,
    Mode(String),
    Model(String),
    Allow(Option<String>),
    Deny,
    History,
    More,
    Load(String),
    Fork(String),
    Delete(String),
    Help,
    Quit,
}

impl ReplCommand {
    /// Parse a line; `None` for blank input
    pub fn parse(line: &str) -> Option<Result<Self, String>> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Some(Ok(Self::Message(line.to_string())));
        };

        let mut parts = rest.splitn(2, char::is_whitespace);
        let name = parts.next().unwrap_or_default();
        let arg = parts.next().map(str::trim).filter(|a| !a.is_empty());

        let required = |build: fn(String) -> Self| match arg {
            Some(arg) => Ok(build(arg.to_string())),
            None => Err(format!("/{} needs an argument", name)),
        };

        let command = match name {
            "stop" => Ok(Self::Stop),
            "new" => Ok(Self::New),
            "agent" => required(Self::Agent),
            "restart" => Ok(Self::Restart),
            "mode" => required(Self::Mode),
            "model" => required(Self::Model),
            "allow" => Ok(Self::Allow(arg.map(str::to_string))),
            "deny" => Ok(Self::Deny),
            "history" => Ok(Self::History),
            "more" => Ok(Self::More),
            "load" => required(Self::Load),
            "fork" => required(Self::Fork),
            "delete" => required(Self::Delete),
            "help" | "?" => Ok(Self::Help),
            "quit" | "exit" => Ok(Self::Quit),
            other => Err(format!("Unknown command: /{}", other)),
        };
        Some(command)
    }
}

enum Input {
    Line(String),
    Interrupted,
    Eof,
}

/// Read lines on a dedicated thread
fn spawn_reader() -> mpsc::UnboundedReceiver<Input> {
    let (tx, rx) = mpsc::unbounded_channel();

    std::thread::spawn(move || {
        let mut editor = match DefaultEditor::new() {
            Ok(editor) => editor,
            Err(e) => {
                eprintln!("{}", style(format!("Cannot read input: {}", e)).red());
                let _ = tx.send(Input::Eof);
                return;
            }
        };
        loop {
            let input = match editor.readline("> ") {
                Ok(line) => {
                    if !line.trim().is_empty() {
                        let _ = editor.add_history_entry(line.as_str());
                    }
                    Input::Line(line)
                }
                Err(ReadlineError::Interrupted) => Input::Interrupted,
                Err(ReadlineError::Eof) => Input::Eof,
                Err(e) => {
                    warn!("Readline error: {}", e);
                    Input::Eof
                }
            };
            let done = matches!(input, Input::Eof);
            if tx.send(input).is_err() || done {
                break;
            }
        }
    });

    rx
}

struct ChatRepl {
    controller: SessionController,
    history: Arc<SessionHistoryManager>,
    filter: HistoryFilter,
}

impl ChatRepl {
    fn agent_id(&self) -> String {
        self.controller.snapshot().session.agent_id.clone()
    }

    async fn execute(&self, command: ReplCommand) -> agent_client_core::Result<()> {
        match command {
            ReplCommand::Message(text) => {
                self.controller.send_message(vec![PromptBlock::text(text)]).await
            }
            ReplCommand::Stop => self.controller.stop_generation().await,
            ReplCommand::New => self.controller.new_chat().await,
            ReplCommand::Agent(agent_id) => self.controller.switch_agent(agent_id).await,
            ReplCommand::Restart => self.controller.restart_agent().await,
            ReplCommand::Mode(mode_id) => self.controller.set_mode(mode_id).await,
            ReplCommand::Model(model_id) => self.controller.set_model(model_id).await,
            ReplCommand::Allow(option_id) => {
                let snapshot = self.controller.snapshot();
                let request = snapshot
                    .pending_permission
                    .as_ref()
                    .ok_or_else(|| Error::UnknownPermission("(none)".into()))?;
                let option_id = match option_id {
                    Some(id) => id,
                    None => request
                        .options
                        .iter()
                        .find(|o| o.kind.is_allow())
                        .or_else(|| request.options.first())
                        .map(|o| o.option_id.clone())
                        .ok_or_else(|| Error::InvalidOption {
                            request_id: request.request_id.clone(),
                            option_id: String::new(),
                        })?,
                };
                self.controller
                    .approve_permission(request.request_id.clone(), option_id)
                    .await
            }
            ReplCommand::Deny => {
                let snapshot = self.controller.snapshot();
                let request = snapshot
                    .pending_permission
                    .as_ref()
                    .ok_or_else(|| Error::UnknownPermission("(none)".into()))?;
                self.controller
                    .reject_permission(request.request_id.clone())
                    .await
            }
            ReplCommand::History => {
                let listing = self.history.refresh(&self.agent_id(), self.filter).await?;
                print_history(&listing.entries);
                if listing.has_more() {
                    println!("  {}", style("/more for older sessions").dim());
                }
                Ok(())
            }
            ReplCommand::More => {
                let agent_id = self.agent_id();
                let before = self
                    .history
                    .cached(&agent_id, self.filter)
                    .map(|l| l.entries.len())
                    .unwrap_or(0);
                let listing = if before == 0 {
                    self.history.list_sessions(&agent_id, self.filter).await?
                } else {
                    self.history.load_more(&agent_id, self.filter).await?
                };
                print_history(&listing.entries[before.min(listing.entries.len())..]);
                if !listing.has_more() {
                    println!("  {}", style("No more sessions").dim());
                }
                Ok(())
            }
            ReplCommand::Load(session_id) => self.controller.restore_session(session_id).await,
            ReplCommand::Fork(session_id) => self.controller.fork_session(session_id).await,
            ReplCommand::Delete(session_id) => {
                self.controller.delete_session(session_id.clone()).await?;
                println!("{}", style(format!("Deleted session {}", session_id)).dim());
                Ok(())
            }
            ReplCommand::Help => {
                println!("{}", style(HELP).dim());
                Ok(())
            }
            // Handled by the loop
            ReplCommand::Quit => Ok(()),
        }
    }
}

pub async fn run_chat(
    config_manager: ConfigManager,
    agent: Option<String>,
    cwd: &Path,
) -> anyhow::Result<()> {
    let settings = config_manager.config().clone();
    let agent_id = agent.unwrap_or_else(|| settings.default_agent_id.clone());
    let factory = Arc::new(AcpAdapterFactory::default());
    let store = Arc::new(SessionStore::open_default()?);

    let source = Arc::new(AgentHistorySource::new(
        factory.clone(),
        settings.clone(),
        Some(store.clone()),
        cwd,
    ));
    let history = Arc::new(SessionHistoryManager::new(source.clone()));

    let config = ControllerConfig::new(settings, cwd)
        .with_store(store)
        .with_history(history.clone());
    let controller = SessionController::spawn(config, factory);

    println!("{}", style("Agent Client").bold().cyan());
    println!(
        "{}",
        style(format!("Working directory: {}", cwd.display())).dim()
    );
    println!("{}", style("Type /help for commands, /quit to exit.").dim());

    // Render snapshots as they are published
    let mut snapshots = controller.subscribe();
    let renderer = tokio::spawn(async move {
        let mut view = TranscriptView::default();
        loop {
            let snapshot = snapshots.borrow_and_update().clone();
            view.render(&snapshot);
            if snapshots.changed().await.is_err() {
                break;
            }
        }
    });

    if let Err(e) = controller.create_session(agent_id.clone(), cwd).await {
        eprintln!("{}", style(format!("Failed to start {}: {}", agent_id, e)).red());
    }

    let repl = ChatRepl {
        controller: controller.clone(),
        history,
        filter: HistoryFilter {
            current_vault_only: true,
            hide_without_local_data: false,
        },
    };

    let mut input = spawn_reader();
    while let Some(line) = input.recv().await {
        let command = match line {
            Input::Line(line) => match ReplCommand::parse(&line) {
                None => continue,
                Some(Err(message)) => {
                    println!("{}", style(message).yellow());
                    continue;
                }
                Some(Ok(command)) => command,
            },
            // Ctrl-C stops generation instead of exiting
            Input::Interrupted => ReplCommand::Stop,
            Input::Eof => ReplCommand::Quit,
        };
        if command == ReplCommand::Quit {
            break;
        }

        debug!(?command, "REPL command");
        if let Err(e) = repl.execute(command).await {
            eprintln!("{}", style(format!("Error: {}", e)).red());
        }
    }

    if let Err(e) = controller.shutdown().await {
        warn!("Shutdown failed: {}", e);
    }
    source.disconnect_all().await;
    renderer.abort();
    println!("{}", style("Goodbye!").green());
    Ok(())
}
