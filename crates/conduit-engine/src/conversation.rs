//! Append-only conversation owned by one query.

use conduit_llm::{ContentBlock, Message, Role};
use serde_json::{Map, Value};

use crate::decoder::ToolCallRequest;

/// Ordered messages for one query. Messages are never edited once appended.
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Continue from earlier turns.
    pub fn from_history(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Record what the assistant produced in one provider turn.
    ///
    /// Nothing is appended for a turn with neither text nor tool calls.
    /// Arguments that failed to parse are recorded as an empty object so the
    /// history stays acceptable to every provider.
    pub fn push_assistant_turn(&mut self, text: &str, calls: &[ToolCallRequest]) {
        if calls.is_empty() {
            if !text.is_empty() {
                self.push(Message::assistant(text));
            }
            return;
        }

        let mut blocks = Vec::with_capacity(calls.len() + 1);
        if !text.is_empty() {
            blocks.push(ContentBlock::text(text));
        }
        for call in calls {
            let input = match &call.arguments {
                Value::Object(_) => call.arguments.clone(),
                _ => Value::Object(Map::new()),
            };
            blocks.push(ContentBlock::tool_use(&call.id, &call.name, input));
        }
        self.push(Message::assistant_blocks(blocks));
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Number of tool-role messages.
    pub fn tool_results(&self) -> usize {
        self.messages.iter().filter(|m| m.role == Role::Tool).count()
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_empty_turn_is_not_recorded() {
        let mut conversation = Conversation::new();
        conversation.push_assistant_turn("", &[]);
        assert!(conversation.is_empty());
    }

    #[test]
    fn test_tool_turn_records_blocks() {
        let mut conversation = Conversation::from_history(vec![Message::user("hi")]);
        let calls = [
            ToolCallRequest::new("c1", "db__query", json!({"sql": "select 1"})),
            ToolCallRequest::new("c2", "db__query", Value::String("{bad".into())),
        ];
        conversation.push_assistant_turn("Checking.", &calls);
        conversation.push(Message::tool_result("c1", "1", false));
        conversation.push(Message::tool_result("c2", "malformed", true));

        assert_eq!(conversation.len(), 4);
        assert_eq!(conversation.tool_results(), 2);

        let blocks = conversation.messages()[1].content.blocks();
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0], ContentBlock::text("Checking."));
        assert_eq!(
            blocks[2],
            ContentBlock::tool_use("c2", "db__query", json!({}))
        );
    }
}
