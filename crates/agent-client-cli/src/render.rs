//! Terminal rendering of controller snapshots
//!
//! Snapshots are full copies of the timeline; the view remembers what it has
//! already printed and writes only the difference.

use std::collections::{HashMap, HashSet};
use std::io::Write;

use console::style;

use agent_client_core::session::{
    ChatMessage, ContentBlock, ControllerSnapshot, MessageRole, PermissionRequest, SessionStatus,
    ToolStatus,
};

#[derive(Default)]
pub struct TranscriptView {
    session_id: Option<String>,
    /// Characters of text already printed per message
    printed: HashMap<String, usize>,
    tool_states: HashMap<String, ToolStatus>,
    permissions: HashSet<String>,
    failures: HashSet<String>,
    status: Option<SessionStatus>,
    last_error: Option<String>,
}

impl TranscriptView {
    pub fn render(&mut self, snapshot: &ControllerSnapshot) {
        if snapshot.session.id != self.session_id {
            self.reset(snapshot);
        }

        for message in &snapshot.messages {
            self.render_message(message);
        }

        if let Some(request) = &snapshot.pending_permission {
            self.render_permission(request);
        }

        if self.status != Some(snapshot.status()) {
            if self.status == Some(SessionStatus::Busy) {
                println!();
            }
            match snapshot.status() {
                SessionStatus::Connecting => println!("{}", style("Connecting...").dim()),
                SessionStatus::Restoring => println!("{}", style("Restoring session...").dim()),
                SessionStatus::Errored => println!("{}", style("Session errored; /restart to retry").red()),
                SessionStatus::Uninitialized => println!("{}", style("No active session; /new to start one").dim()),
                _ => {}
            }
            self.status = Some(snapshot.status());
        }

        if snapshot.last_error != self.last_error {
            if let Some(error) = &snapshot.last_error {
                println!("{}", style(format!("Error: {}", error)).red());
            }
            self.last_error = snapshot.last_error.clone();
        }

        let _ = std::io::stdout().flush();
    }

    /// A different session: print its whole timeline
    fn reset(&mut self, snapshot: &ControllerSnapshot) {
        self.printed.clear();
        self.tool_states.clear();
        self.permissions.clear();
        self.failures.clear();
        self.session_id = snapshot.session.id.clone();

        if let Some(id) = &self.session_id {
            println!();
            println!(
                "{} {} {}",
                style("Session").bold(),
                style(id).cyan(),
                style(format!("({})", snapshot.session.agent_id)).dim()
            );
            // Restored transcripts include user messages the REPL never echoed
            for message in snapshot.messages.iter().filter(|m| m.role == MessageRole::User) {
                println!("{} {}", style(">").green().bold(), message.text());
                self.printed.insert(message.id.clone(), usize::MAX);
            }
        }
    }

    fn render_message(&mut self, message: &ChatMessage) {
        match message.role {
            // The REPL echoes user input itself
            MessageRole::User => {
                self.printed.entry(message.id.clone()).or_insert(usize::MAX);
            }
            MessageRole::System => {
                if self.printed.insert(message.id.clone(), usize::MAX).is_none() {
                    println!("{}", style(message.text()).yellow());
                }
            }
            MessageRole::Agent => self.render_agent(message),
        }
    }

    fn render_agent(&mut self, message: &ChatMessage) {
        let text = message.text();
        let printed = self.printed.entry(message.id.clone()).or_insert(0);
        if *printed == 0 && !text.is_empty() {
            print!("{} ", style("Agent:").bold().green());
        }
        if let Some(delta) = text.get(*printed..) {
            print!("{}", delta);
            *printed = text.len();
        }

        for block in &message.content {
            match block {
                ContentBlock::ToolCall(call) => {
                    if self.tool_states.get(&call.tool_call_id) == Some(&call.status) {
                        continue;
                    }
                    self.tool_states.insert(call.tool_call_id.clone(), call.status);
                    let marker = match call.status {
                        ToolStatus::Pending => style("…").dim(),
                        ToolStatus::Running => style("▶").yellow(),
                        ToolStatus::Completed => style("✓").green(),
                        ToolStatus::Failed => style("✗").red(),
                    };
                    println!();
                    println!("  {} {}", marker, style(&call.title).dim());
                }
                ContentBlock::Error { message: error } => {
                    if self.failures.insert(message.id.clone()) {
                        println!();
                        println!("{}", style(format!("Turn failed: {}", error)).red());
                    }
                }
                _ => {}
            }
        }
    }

    fn render_permission(&mut self, request: &PermissionRequest) {
        if !self.permissions.insert(request.request_id.clone()) {
            return;
        }
        println!();
        println!(
            "{} {}",
            style("Permission requested:").yellow().bold(),
            request.title
        );
        for option in &request.options {
            println!(
                "    /allow {}  {}",
                style(&option.option_id).cyan(),
                style(&option.name).dim()
            );
        }
        println!("    {}", style("/deny").cyan());
    }
}
