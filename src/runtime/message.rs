use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// A request, made by a decision procedure, to invoke one capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityRequest {
    pub id: String,
    /// Capability symbol (or, failing that, its declared name).
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

impl CapabilityRequest {
    pub fn new(id: &str, name: &str, arguments: Value) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            arguments,
        }
    }
}

/// One turn of a conversation log. Logs are stored in state as JSON arrays of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum Message {
    System {
        content: String,
    },
    Human {
        content: String,
    },
    Assistant {
        content: String,
        #[serde(default)]
        requests: Vec<CapabilityRequest>,
    },
    Tool {
        #[serde(default)]
        request_id: String,
        name: String,
        content: String,
    },
}

impl Message {
    pub fn system(content: &str) -> Self {
        Message::System {
            content: content.to_string(),
        }
    }

    pub fn human(content: &str) -> Self {
        Message::Human {
            content: content.to_string(),
        }
    }

    /// A final answer with no capability requests.
    pub fn answer(content: &str) -> Self {
        Message::Assistant {
            content: content.to_string(),
            requests: Vec::new(),
        }
    }

    pub fn requesting(content: &str, requests: Vec<CapabilityRequest>) -> Self {
        Message::Assistant {
            content: content.to_string(),
            requests,
        }
    }

    pub fn content(&self) -> &str {
        match self {
            Message::System { content }
            | Message::Human { content }
            | Message::Assistant { content, .. }
            | Message::Tool { content, .. } => content,
        }
    }

    /// Pending capability requests; empty for everything but an assistant turn that asked for tools.
    pub fn requests(&self) -> &[CapabilityRequest] {
        match self {
            Message::Assistant { requests, .. } => requests,
            _ => &[],
        }
    }

    pub fn has_requests(&self) -> bool {
        !self.requests().is_empty()
    }

    /// The JSON form stored in state.
    pub fn to_value(&self) -> Value {
        match self {
            Message::System { content } => json!({"role": "system", "content": content}),
            Message::Human { content } => json!({"role": "human", "content": content}),
            Message::Assistant { content, requests } => {
                let requests: Vec<Value> = requests
                    .iter()
                    .map(|r| json!({"id": r.id, "name": r.name, "arguments": r.arguments}))
                    .collect();
                json!({"role": "assistant", "content": content, "requests": requests})
            }
            Message::Tool {
                request_id,
                name,
                content,
            } => json!({"role": "tool", "request_id": request_id, "name": name, "content": content}),
        }
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}

/// Reads a conversation log out of a state value, skipping entries that are not messages.
pub fn messages_from(value: Option<&Value>) -> Vec<Message> {
    match value {
        Some(Value::Array(items)) => items.iter().filter_map(Message::from_value).collect(),
        _ => Vec::new(),
    }
}

/// Encodes messages for an append-policy state update.
pub fn messages_value(messages: &[Message]) -> Value {
    Value::Array(messages.iter().map(Message::to_value).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_json_shape_reads_back() {
        let message = Message::requesting(
            "",
            vec![CapabilityRequest::new("1", "search", json!({"q": "rust"}))],
        );
        let value = message.to_value();
        assert_eq!(value["role"], "assistant");
        assert_eq!(value["requests"][0]["name"], "search");
        assert_eq!(Message::from_value(&value), Some(message));
    }

    #[test]
    fn test_foreign_entries_are_skipped() {
        let log = json!([{"role": "human", "content": "hi"}, 42, {"role": "alien"}]);
        let messages = messages_from(Some(&log));
        assert_eq!(messages, vec![Message::human("hi")]);
    }
}
