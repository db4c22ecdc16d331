use serde::{Deserialize, Serialize};

use crate::event::StreamTarget;

pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";
pub const RAG_STREAM_PATH: &str = "/api/v1/chat/rag/stream";
pub const AGENT_STREAM_PATH: &str = "/api/v1/chat/agent/stream";
pub const RAG_PROMPT_PATH: &str = "/api/v1/chat/rag/prompt";
pub const UPLOAD_PATH: &str = "/api/v1/upload";
pub const HEALTH_PATH: &str = "/api/v1/health";

/// Endpoint selector for a chat turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatMode {
    #[default]
    Rag,
    Agent,
}

impl ChatMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "rag" => Some(Self::Rag),
            "agent" => Some(Self::Agent),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rag => "rag",
            Self::Agent => "agent",
        }
    }

    pub fn stream_path(self) -> &'static str {
        match self {
            Self::Rag => RAG_STREAM_PATH,
            Self::Agent => AGENT_STREAM_PATH,
        }
    }
}

/// JSON body posted to the stream endpoints.
///
/// `conversation_id` is always present (as `null` before the server assigns
/// one); the optional fields are omitted when unset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatRequest {
    pub message: String,
    pub conversation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rag_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl ChatRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            conversation_id: None,
            rag_prompt: None,
            user_id: None,
        }
    }

    pub fn with_conversation_id(mut self, conversation_id: Option<String>) -> Self {
        self.conversation_id = conversation_id;
        self
    }

    pub fn with_rag_prompt(mut self, rag_prompt: impl Into<String>) -> Self {
        self.rag_prompt = Some(rag_prompt.into());
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// One stream invocation: where to send it, what to send, and the turn it feeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    pub target: StreamTarget,
    pub mode: ChatMode,
    pub body: ChatRequest,
}

impl StreamRequest {
    pub fn new(target: StreamTarget, mode: ChatMode, body: ChatRequest) -> Self {
        Self { target, mode, body }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PromptPayload {
    pub prompt: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HealthPayload {
    pub status: String,
}

/// Knowledge-base entry created by an upload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DocumentReceipt {
    pub doc_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn first_turn_body_sends_null_conversation_id() {
        let body = ChatRequest::new("What is RAG?").with_rag_prompt("Context: {context}");

        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({
                "message": "What is RAG?",
                "conversation_id": null,
                "rag_prompt": "Context: {context}",
            })
        );
    }

    #[test]
    fn follow_up_body_carries_conversation_and_user() {
        let body = ChatRequest::new("and then?")
            .with_conversation_id(Some("abc-123".to_string()))
            .with_user_id("test-user");

        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({
                "message": "and then?",
                "conversation_id": "abc-123",
                "user_id": "test-user",
            })
        );
    }

    #[test]
    fn modes_select_their_endpoint() {
        assert_eq!(ChatMode::Rag.stream_path(), "/api/v1/chat/rag/stream");
        assert_eq!(ChatMode::Agent.stream_path(), "/api/v1/chat/agent/stream");
        assert_eq!(ChatMode::parse(" Agent "), Some(ChatMode::Agent));
        assert_eq!(ChatMode::parse("human"), None);
    }
}
