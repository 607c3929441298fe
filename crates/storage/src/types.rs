use std::time::{SystemTime, UNIX_EPOCH};

use super::ids::{ConversationId, MessageId, UserId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub id: UserId,
    /// Trimmed and lowercased at registration.
    pub email: String,
    pub created_at_unix_millis: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactRecord {
    pub owner_id: UserId,
    pub contact_user_id: UserId,
    /// Copied from the contact's user record when the contact was added.
    pub email: String,
}

/// Denormalized summary of a conversation, used for list display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationRecord {
    pub id: ConversationId,
    pub participant_ids: [UserId; 2],
    pub last_message_text: Option<String>,
    pub last_updated_at_unix_millis: Option<u64>,
}

impl ConversationRecord {
    pub fn includes(&self, user_id: &UserId) -> bool {
        self.participant_ids.contains(user_id)
    }

    pub fn counterpart(&self, user_id: &UserId) -> Option<&UserId> {
        if !self.includes(user_id) {
            return None;
        }
        self.participant_ids.iter().find(|id| *id != user_id)
    }
}

/// Merge write for a conversation summary. `None` fields keep their stored value.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SummaryUpdate {
    pub participant_ids: Option<[UserId; 2]>,
    pub last_message_text: Option<String>,
    pub last_updated_at_unix_millis: Option<u64>,
}

impl SummaryUpdate {
    pub fn for_participants(left: UserId, right: UserId) -> Self {
        Self {
            participant_ids: Some([left, right]),
            ..Self::default()
        }
    }

    pub fn with_last_message(mut self, text: impl Into<String>) -> Self {
        self.last_message_text = Some(text.into());
        self
    }

    pub fn touched_at(mut self, unix_millis: u64) -> Self {
        self.last_updated_at_unix_millis = Some(unix_millis);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub text: String,
}

impl NewMessage {
    pub fn new(sender_id: UserId, receiver_id: UserId, text: impl Into<String>) -> Self {
        Self {
            sender_id,
            receiver_id,
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub text: String,
    pub created_at_unix_millis: u64,
}

/// Published on the change feed after a write commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChange {
    Conversation {
        conversation_id: ConversationId,
        participant_ids: [UserId; 2],
    },
    Message {
        conversation_id: ConversationId,
    },
    User {
        user_id: UserId,
    },
    Contact {
        owner_id: UserId,
    },
}

pub fn normalize_email(raw: &str) -> String {
    raw.trim().to_lowercase()
}

pub fn now_unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis() as u64)
}
