//! Streaming message aggregator
//!
//! Folds turn events into the ordered message timeline. Messages live in an
//! append-only arena; side indexes map protocol message ids and tool call ids
//! to their position so streaming updates are applied in place.
//!
//! Rules:
//! - content blocks are never reordered once committed
//! - text and thought deltas extend the last block of their message only
//! - tool call updates and permission resolutions patch their own block
//! - a message stops accepting content once `is_streaming` is false

use chrono::Utc;
use std::collections::HashMap;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::adapter::{ToolCallPatch, ToolCallStart, TurnEvent};
use crate::session::types::{
    ChatMessage, ContentBlock, MessageRole, PermissionBlock, PermissionRequest,
    PermissionResolution, ToolCallBlock, ToolStatus,
};

#[derive(Debug, Default, Clone)]
pub struct MessageAggregator {
    messages: Vec<ChatMessage>,
    /// Protocol message id -> arena index
    by_id: HashMap<String, usize>,
    /// Tool call id -> (arena index, block index)
    tool_calls: HashMap<String, (usize, usize)>,
    /// An update that arrived before its tool call start
    orphan: Option<(String, ToolCallPatch)>,
    next_sequence: u64,
}

impl MessageAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a frozen timeline from a replayed transcript
    pub fn replay(events: impl IntoIterator<Item = TurnEvent>) -> Self {
        let mut aggregator = Self::new();
        for event in events {
            match event {
                TurnEvent::TurnEnd { .. } | TurnEvent::Cancelled => aggregator.finish(),
                TurnEvent::Error { message } => aggregator.fail(&message),
                other => aggregator.apply(other),
            }
        }
        aggregator.finish();
        aggregator
    }

    /// Start from an existing timeline, e.g. one loaded from disk
    pub fn from_messages(messages: Vec<ChatMessage>) -> Self {
        let mut aggregator = Self::new();
        for mut message in messages {
            message.is_streaming = false;
            message.sequence = aggregator.take_sequence();
            aggregator.insert(message);
        }
        aggregator
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn into_messages(self) -> Vec<ChatMessage> {
        self.messages
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Drop the timeline and reset the sequence counter
    pub fn clear(&mut self) {
        *self = Self::new();
    }

    /// First user-authored text, used as a session title
    pub fn first_user_text(&self) -> Option<String> {
        self.messages
            .iter()
            .filter(|m| m.role == MessageRole::User)
            .map(|m| m.text())
            .find(|text| !text.trim().is_empty())
    }

    fn take_sequence(&mut self) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        sequence
    }

    fn insert(&mut self, message: ChatMessage) -> usize {
        let index = self.messages.len();
        self.by_id.insert(message.id.clone(), index);
        self.messages.push(message);
        index
    }

    fn open(&mut self, id: String, role: MessageRole, content: Vec<ContentBlock>, streaming: bool) -> usize {
        let message = ChatMessage {
            id,
            role,
            sequence: self.take_sequence(),
            content,
            is_streaming: streaming,
            timestamp: Utc::now(),
        };
        self.insert(message)
    }

    /// Append a complete user message
    pub fn push_user(&mut self, content: Vec<ContentBlock>) -> &ChatMessage {
        let index = self.open(Uuid::new_v4().to_string(), MessageRole::User, content, false);
        &self.messages[index]
    }

    /// Append a controller notice to the timeline
    pub fn push_system(&mut self, text: impl Into<String>) -> &ChatMessage {
        let index = self.open(
            Uuid::new_v4().to_string(),
            MessageRole::System,
            vec![ContentBlock::text(text)],
            false,
        );
        &self.messages[index]
    }

    /// Open an empty streaming agent message for a new turn
    pub fn begin_agent(&mut self, message_id: &str) {
        if self.by_id.contains_key(message_id) {
            warn!(message_id, "Agent message already exists");
            return;
        }
        self.open(message_id.to_string(), MessageRole::Agent, Vec::new(), true);
    }

    /// Index of the streaming message with this id, opening it if unseen
    fn streaming_message(&mut self, message_id: &str, role: MessageRole) -> Option<usize> {
        match self.by_id.get(message_id) {
            Some(&index) if self.messages[index].is_streaming => Some(index),
            Some(_) => {
                warn!(message_id, "Dropping content for a finished message");
                None
            }
            None => Some(self.open(message_id.to_string(), role, Vec::new(), true)),
        }
    }

    /// Apply one non-terminal event
    pub fn apply(&mut self, event: TurnEvent) {
        match event {
            TurnEvent::UserText { message_id, text } => {
                self.append_text(&message_id, MessageRole::User, text, false)
            }
            TurnEvent::TextDelta { message_id, text } => {
                self.append_text(&message_id, MessageRole::Agent, text, false)
            }
            TurnEvent::ThoughtDelta { message_id, text } => {
                self.append_text(&message_id, MessageRole::Agent, text, true)
            }
            TurnEvent::ToolCallStart {
                message_id,
                tool_call,
            } => self.start_tool_call(&message_id, tool_call),
            TurnEvent::ToolCallUpdate { message_id, patch } => self.update_tool_call(&message_id, patch),
            TurnEvent::PlanUpdate {
                message_id,
                entries,
            } => {
                let Some(index) = self.streaming_message(&message_id, MessageRole::Agent) else {
                    return;
                };
                let content = &mut self.messages[index].content;
                match content.last_mut() {
                    Some(ContentBlock::Plan { entries: current }) => *current = entries,
                    _ => content.push(ContentBlock::Plan { entries }),
                }
            }
            TurnEvent::PermissionRequest {
                message_id,
                request,
            } => {
                let Some(index) = self.streaming_message(&message_id, MessageRole::Agent) else {
                    return;
                };
                self.messages[index]
                    .content
                    .push(ContentBlock::PermissionRequest(PermissionBlock {
                        request,
                        resolution: None,
                    }));
            }
            TurnEvent::TurnEnd { .. } | TurnEvent::Error { .. } | TurnEvent::Cancelled => {
                debug!("Terminal event passed to apply; use finish/fail");
            }
        }
    }

    fn append_text(&mut self, message_id: &str, role: MessageRole, text: String, thought: bool) {
        let Some(index) = self.streaming_message(message_id, role) else {
            return;
        };
        let content = &mut self.messages[index].content;
        match (content.last_mut(), thought) {
            (Some(ContentBlock::Text { text: current }), false)
            | (Some(ContentBlock::Thought { text: current }), true) => current.push_str(&text),
            (_, false) => content.push(ContentBlock::Text { text }),
            (_, true) => content.push(ContentBlock::Thought { text }),
        }
    }

    fn start_tool_call(&mut self, message_id: &str, tool_call: ToolCallStart) {
        if self.tool_calls.contains_key(&tool_call.tool_call_id) {
            warn!(tool_call_id = %tool_call.tool_call_id, "Duplicate tool call start");
            return;
        }
        let Some(index) = self.streaming_message(message_id, MessageRole::Agent) else {
            return;
        };

        let tool_call_id = tool_call.tool_call_id.clone();
        let content = &mut self.messages[index].content;
        content.push(ContentBlock::ToolCall(ToolCallBlock {
            tool_call_id: tool_call.tool_call_id,
            title: tool_call.title,
            kind: tool_call.kind,
            status: tool_call.status,
            payload: tool_call.content,
            raw_input: tool_call.raw_input,
        }));
        self.tool_calls
            .insert(tool_call_id.clone(), (index, content.len() - 1));

        // A buffered update gets one chance: the next start
        if let Some((orphan_message, patch)) = self.orphan.take() {
            if patch.tool_call_id == tool_call_id {
                self.update_tool_call(&orphan_message, patch);
            } else {
                warn!(
                    tool_call_id = %patch.tool_call_id,
                    "Discarding tool call update that never got a start"
                );
            }
        }
    }

    fn update_tool_call(&mut self, message_id: &str, patch: ToolCallPatch) {
        let Some(&(index, block)) = self.tool_calls.get(&patch.tool_call_id) else {
            if let Some((_, old)) = self.orphan.replace((message_id.to_string(), patch)) {
                warn!(
                    tool_call_id = %old.tool_call_id,
                    "Discarding tool call update that never got a start"
                );
            }
            return;
        };

        let message = &mut self.messages[index];
        if !message.is_streaming {
            warn!(tool_call_id = %patch.tool_call_id, "Dropping update for a finished tool call");
            return;
        }
        if let Some(ContentBlock::ToolCall(call)) = message.content.get_mut(block) {
            if let Some(title) = patch.title {
                call.title = title;
            }
            if patch.kind.is_some() {
                call.kind = patch.kind;
            }
            if let Some(status) = patch.status {
                call.status = status;
            }
            if let Some(content) = patch.content {
                call.payload = content;
            }
        }
    }

    /// Record how a permission request was answered
    pub fn resolve_permission(&mut self, request_id: &str, resolution: PermissionResolution) -> bool {
        for message in self.messages.iter_mut().rev() {
            for block in message.content.iter_mut().rev() {
                if let ContentBlock::PermissionRequest(permission) = block {
                    if permission.request.request_id == request_id {
                        if permission.resolution.is_none() {
                            permission.resolution = Some(resolution);
                            return true;
                        }
                        return false;
                    }
                }
            }
        }
        false
    }

    /// Unresolved permission requests still shown in the timeline
    pub fn unresolved_permissions(&self) -> Vec<PermissionRequest> {
        self.messages
            .iter()
            .flat_map(|m| m.content.iter())
            .filter_map(|block| match block {
                ContentBlock::PermissionRequest(p) if p.resolution.is_none() => Some(p.request.clone()),
                _ => None,
            })
            .collect()
    }

    /// Freeze every streaming message
    pub fn finish(&mut self) {
        if let Some((_, patch)) = self.orphan.take() {
            warn!(
                tool_call_id = %patch.tool_call_id,
                "Discarding tool call update that never got a start"
            );
        }
        for message in self.messages.iter_mut().filter(|m| m.is_streaming) {
            for block in message.content.iter_mut() {
                match block {
                    ContentBlock::PermissionRequest(p) if p.resolution.is_none() => {
                        p.resolution = Some(PermissionResolution::Cancelled)
                    }
                    ContentBlock::ToolCall(call)
                        if matches!(call.status, ToolStatus::Pending | ToolStatus::Running) =>
                    {
                        debug!(tool_call_id = %call.tool_call_id, "Turn ended with tool call still open");
                    }
                    _ => {}
                }
            }
            message.is_streaming = false;
        }
    }

    /// Freeze the turn and mark it as failed, keeping partial content
    pub fn fail(&mut self, error: &str) {
        let marker = ContentBlock::Error {
            message: error.to_string(),
        };
        match self.messages.iter_mut().rev().find(|m| m.is_streaming) {
            Some(message) => message.content.push(marker),
            None => {
                self.open(Uuid::new_v4().to_string(), MessageRole::Agent, vec![marker], false);
            }
        }
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_client_acp::{PermissionOption, PermissionOptionKind, PlanEntry, PlanEntryPriority, PlanEntryStatus, StopReason};

    fn delta(message_id: &str, text: &str) -> TurnEvent {
        TurnEvent::TextDelta {
            message_id: message_id.into(),
            text: text.into(),
        }
    }

    fn tool_start(message_id: &str, id: &str) -> TurnEvent {
        TurnEvent::ToolCallStart {
            message_id: message_id.into(),
            tool_call: ToolCallStart {
                tool_call_id: id.into(),
                title: "Read note".into(),
                kind: Some("read".into()),
                status: ToolStatus::Pending,
                content: Vec::new(),
                raw_input: None,
            },
        }
    }

    fn tool_update(message_id: &str, id: &str, status: ToolStatus) -> TurnEvent {
        TurnEvent::ToolCallUpdate {
            message_id: message_id.into(),
            patch: ToolCallPatch {
                tool_call_id: id.into(),
                status: Some(status),
                ..Default::default()
            },
        }
    }

    fn plan(message_id: &str, step: &str) -> TurnEvent {
        TurnEvent::PlanUpdate {
            message_id: message_id.into(),
            entries: vec![PlanEntry {
                content: step.into(),
                priority: PlanEntryPriority::Medium,
                status: PlanEntryStatus::Pending,
            }],
        }
    }

    fn tool_status(message: &ChatMessage, index: usize) -> ToolStatus {
        match &message.content[index] {
            ContentBlock::ToolCall(call) => call.status,
            other => panic!("Expected tool call, got {:?}", other),
        }
    }

    #[test]
    fn test_deltas_append_to_open_text_block() {
        let mut agg = MessageAggregator::new();
        agg.apply(delta("m1", "Hel"));
        agg.apply(delta("m1", "lo"));

        let messages = agg.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, vec![ContentBlock::text("Hello")]);
        assert!(messages[0].is_streaming);
        assert_eq!(messages[0].role, MessageRole::Agent);
    }

    #[test]
    fn test_sequences_strictly_increase() {
        let mut agg = MessageAggregator::new();
        agg.push_user(vec![ContentBlock::text("hi")]);
        agg.apply(delta("a", "one"));
        agg.apply(delta("b", "two"));
        agg.push_system("note");
        agg.apply(delta("a", " more"));

        let sequences: Vec<_> = agg.messages().iter().map(|m| m.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2, 3]);
        assert_eq!(agg.messages()[1].text(), "one more");
    }

    #[test]
    fn test_text_after_tool_call_opens_new_block() {
        let mut agg = MessageAggregator::new();
        agg.apply(delta("m", "before"));
        agg.apply(tool_start("m", "t1"));
        agg.apply(delta("m", "after"));

        let content = &agg.messages()[0].content;
        assert_eq!(content.len(), 3);
        assert_eq!(content[0], ContentBlock::text("before"));
        assert!(matches!(content[1], ContentBlock::ToolCall(_)));
        assert_eq!(content[2], ContentBlock::text("after"));
    }

    #[test]
    fn test_thoughts_are_separate_blocks() {
        let mut agg = MessageAggregator::new();
        agg.apply(TurnEvent::ThoughtDelta {
            message_id: "m".into(),
            text: "thinking".into(),
        });
        agg.apply(delta("m", "answer"));

        let content = &agg.messages()[0].content;
        assert!(matches!(&content[0], ContentBlock::Thought { text } if text == "thinking"));
        assert_eq!(content[1], ContentBlock::text("answer"));
    }

    #[test]
    fn test_tool_call_updated_in_place() {
        let mut agg = MessageAggregator::new();
        agg.apply(tool_start("m", "t1"));
        agg.apply(delta("m", "working"));
        agg.apply(tool_update("m", "t1", ToolStatus::Running));
        agg.apply(TurnEvent::ToolCallUpdate {
            message_id: "m".into(),
            patch: ToolCallPatch {
                tool_call_id: "t1".into(),
                status: Some(ToolStatus::Completed),
                content: Some(vec![ContentBlock::Diff {
                    path: "/vault/a.md".into(),
                    old_text: Some("a".into()),
                    new_text: "b".into(),
                }]),
                ..Default::default()
            },
        });

        let message = &agg.messages()[0];
        assert_eq!(tool_status(message, 0), ToolStatus::Completed);
        match &message.content[0] {
            ContentBlock::ToolCall(call) => {
                assert_eq!(call.payload.len(), 1);
                assert_eq!(call.title, "Read note");
            }
            _ => unreachable!(),
        }
        assert_eq!(message.content[1], ContentBlock::text("working"));
    }

    #[test]
    fn test_update_before_start_is_buffered() {
        let mut agg = MessageAggregator::new();
        agg.apply(tool_update("m", "t1", ToolStatus::Running));
        assert!(agg.messages().is_empty());

        agg.apply(tool_start("m", "t1"));
        assert_eq!(tool_status(&agg.messages()[0], 0), ToolStatus::Running);
    }

    #[test]
    fn test_orphan_update_discarded_when_other_start_arrives() {
        let mut agg = MessageAggregator::new();
        agg.apply(tool_update("m", "ghost", ToolStatus::Failed));
        agg.apply(tool_start("m", "t1"));
        agg.apply(tool_start("m", "ghost"));

        let message = &agg.messages()[0];
        assert_eq!(tool_status(message, 0), ToolStatus::Pending);
        assert_eq!(tool_status(message, 1), ToolStatus::Pending);
    }

    #[test]
    fn test_plan_replaces_trailing_plan() {
        let mut agg = MessageAggregator::new();
        agg.apply(plan("m", "step 1"));
        agg.apply(plan("m", "step 2"));
        assert_eq!(agg.messages()[0].content.len(), 1);

        agg.apply(delta("m", "text"));
        agg.apply(plan("m", "step 3"));
        assert_eq!(agg.messages()[0].content.len(), 3);
    }

    #[test]
    fn test_finish_freezes_message() {
        let mut agg = MessageAggregator::new();
        agg.begin_agent("m");
        agg.apply(delta("m", "done"));
        agg.finish();
        agg.apply(delta("m", " late"));

        let message = &agg.messages()[0];
        assert!(!message.is_streaming);
        assert_eq!(message.text(), "done");
    }

    #[test]
    fn test_fail_keeps_partial_content() {
        let mut agg = MessageAggregator::new();
        agg.begin_agent("m");
        agg.apply(delta("m", "partial"));
        agg.fail("connection lost");

        let message = &agg.messages()[0];
        assert!(!message.is_streaming);
        assert_eq!(message.content[0], ContentBlock::text("partial"));
        assert!(matches!(&message.content[1], ContentBlock::Error { message } if message == "connection lost"));
    }

    #[test]
    fn test_permission_block_resolution() {
        let mut agg = MessageAggregator::new();
        let request = PermissionRequest {
            request_id: "p1".into(),
            tool_call_id: "t1".into(),
            title: "Write file".into(),
            options: vec![PermissionOption {
                option_id: "allow".into(),
                name: "Allow".into(),
                kind: PermissionOptionKind::AllowOnce,
            }],
            created_at: Utc::now(),
        };
        agg.apply(TurnEvent::PermissionRequest {
            message_id: "m".into(),
            request,
        });
        assert_eq!(agg.unresolved_permissions().len(), 1);

        assert!(agg.resolve_permission(
            "p1",
            PermissionResolution::Approved {
                option_id: "allow".into()
            }
        ));
        assert!(!agg.resolve_permission("p1", PermissionResolution::Rejected));
        assert!(agg.unresolved_permissions().is_empty());
        assert!(agg.messages()[0].is_streaming);
    }

    #[test]
    fn test_replay_builds_frozen_timeline() {
        let agg = MessageAggregator::replay(vec![
            TurnEvent::UserText {
                message_id: "u1".into(),
                text: "hello".into(),
            },
            delta("a1", "hi there"),
            TurnEvent::TurnEnd {
                stop_reason: StopReason::EndTurn,
            },
            TurnEvent::UserText {
                message_id: "u2".into(),
                text: "again".into(),
            },
            delta("a2", "sure"),
        ]);

        let messages = agg.messages();
        assert_eq!(messages.len(), 4);
        assert!(messages.iter().all(|m| !m.is_streaming));
        assert_eq!(messages[0].role, MessageRole::User);
        assert_eq!(messages[3].text(), "sure");
        assert_eq!(agg.first_user_text().as_deref(), Some("hello"));
    }

    #[test]
    fn test_from_messages_resequences() {
        let mut original = MessageAggregator::new();
        original.push_user(vec![ContentBlock::text("a")]);
        original.apply(delta("m", "b"));
        let restored = MessageAggregator::from_messages(original.into_messages());

        assert!(restored.messages().iter().all(|m| !m.is_streaming));
        assert_eq!(restored.messages()[1].sequence, 1);
    }
}
