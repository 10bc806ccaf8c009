//! Lifecycle of a single tool call requested by the model (or forced by the
//! user). Status transitions only ever move forward; once a call reaches a
//! terminal status it stays there.

use serde_json::{Map, Value};

use crate::api::ChatToolCall;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolCallStatus {
    Requested,
    Approved,
    Rejected,
    Executing,
    Completed,
    Failed,
}

impl ToolCallStatus {
    /// Position along the forward-only lifecycle. Terminal states share the
    /// highest rank so no terminal can replace another.
    fn rank(self) -> u8 {
        match self {
            ToolCallStatus::Requested => 0,
            ToolCallStatus::Approved => 1,
            ToolCallStatus::Executing => 2,
            ToolCallStatus::Rejected | ToolCallStatus::Completed | ToolCallStatus::Failed => 3,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ToolCallStatus::Rejected | ToolCallStatus::Completed | ToolCallStatus::Failed
        )
    }
}

#[derive(Debug)]
pub struct PendingToolCall {
    pub id: String,
    /// Name as requested by the model; may be a registry-qualified name.
    pub tool_name: String,
    /// Arguments exactly as the model produced them.
    pub raw_arguments: String,
    /// Parsed argument object, when the raw form was a JSON object.
    pub arguments: Option<Map<String, Value>>,
    /// Forced calls come from the user, skip approval, and resolve even
    /// against disabled servers.
    pub forced: bool,
    status: ToolCallStatus,
}

impl PendingToolCall {
    pub fn from_request(call: &ChatToolCall) -> Self {
        let arguments = parse_argument_object(&call.function.arguments);
        Self {
            id: call.id.clone(),
            tool_name: call.function.name.clone(),
            raw_arguments: call.function.arguments.clone(),
            arguments,
            forced: false,
            status: ToolCallStatus::Requested,
        }
    }

    pub fn forced(id: impl Into<String>, tool_name: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            tool_name: tool_name.into(),
            raw_arguments: Value::Object(arguments.clone()).to_string(),
            arguments: Some(arguments),
            forced: true,
            status: ToolCallStatus::Requested,
        }
    }

    pub fn status(&self) -> ToolCallStatus {
        self.status
    }

    pub fn approve(&mut self) {
        self.advance(ToolCallStatus::Approved);
    }

    pub fn reject(&mut self) {
        self.advance(ToolCallStatus::Rejected);
    }

    pub fn begin_execution(&mut self) {
        self.advance(ToolCallStatus::Executing);
    }

    pub fn complete(&mut self) {
        self.advance(ToolCallStatus::Completed);
    }

    pub fn fail(&mut self) {
        self.advance(ToolCallStatus::Failed);
    }

    /// Moves to `next` if that is a forward transition; backward or
    /// terminal-to-terminal moves are ignored.
    fn advance(&mut self, next: ToolCallStatus) {
        if self.status.is_terminal() {
            return;
        }
        if next.rank() > self.status.rank() {
            self.status = next;
        }
    }

    /// Argument object to send to the server; tools with no arguments (or
    /// unparsable raw arguments) get an empty object.
    pub fn argument_object(&self) -> Map<String, Value> {
        self.arguments.clone().unwrap_or_default()
    }
}

fn parse_argument_object(raw: &str) -> Option<Map<String, Value>> {
    if raw.trim().is_empty() {
        return Some(Map::new());
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}
