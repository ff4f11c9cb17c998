// ============================
// crates/backend-lib/src/validation/mod.rs
// ============================
//! Send-request validation.

use chathub_common::{MessageKind, NewMessage, SendMessageRequest, MAX_CONTENT_LENGTH};
use thiserror::Error;

/// Possible validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Receiver ID is required")]
    MissingReceiver,

    #[error("Message content is required")]
    EmptyContent,

    #[error("Message too long ({0} bytes, max {MAX_CONTENT_LENGTH})")]
    ContentTooLong(usize),

    #[error("Cannot send a message to yourself")]
    SelfMessage,

    #[error("Invalid message type: {0}")]
    InvalidKind(String),
}

impl ValidationError {
    /// Short label used for metrics and structured logs
    pub fn label(&self) -> &'static str {
        match self {
            Self::MissingReceiver => "missing_receiver",
            Self::EmptyContent => "empty_content",
            Self::ContentTooLong(_) => "content_too_long",
            Self::SelfMessage => "self_message",
            Self::InvalidKind(_) => "invalid_kind",
        }
    }
}

/// Result type for validation operations
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validate message content
pub fn validate_content(content: &str) -> ValidationResult<&str> {
    if content.is_empty() {
        return Err(ValidationError::EmptyContent);
    }

    // UTF-8 bytes, not characters
    let length = content.len();
    if length > MAX_CONTENT_LENGTH {
        return Err(ValidationError::ContentTooLong(length));
    }

    Ok(content)
}

/// Validate a message kind, empty or missing means text
pub fn validate_kind(kind: Option<&str>) -> ValidationResult<MessageKind> {
    kind.unwrap_or_default()
        .parse()
        .map_err(|e: chathub_common::UnknownKind| ValidationError::InvalidKind(e.0))
}

/// Validate a send request from `sender_id` and turn it into a message ready to persist
pub fn validate_send_request(
    sender_id: &str,
    request: SendMessageRequest,
) -> ValidationResult<NewMessage> {
    if request.receiver_id.is_empty() {
        return Err(ValidationError::MissingReceiver);
    }

    validate_content(&request.content)?;
    let kind = validate_kind(request.kind.as_deref())?;

    if request.receiver_id == sender_id {
        return Err(ValidationError::SelfMessage);
    }

    Ok(NewMessage {
        sender_id: sender_id.to_string(),
        receiver_id: request.receiver_id,
        content: request.content,
        kind,
    })
}
