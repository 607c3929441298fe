use std::fmt;
use std::str::FromStr;

use snafu::{ResultExt, ensure};
use uuid::Uuid;

use super::error::{
    InvalidIdSnafu, InvalidParticipantsSnafu, MalformedIdSnafu, StorageError, StorageResult,
};

/// Joins the two participant ids of a conversation id.
pub const CONVERSATION_ID_SEPARATOR: char = '_';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new(raw: Uuid) -> Self {
        Self(raw)
    }

    pub fn new_v7() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn parse(raw: &str) -> StorageResult<Self> {
        let parsed = Uuid::parse_str(raw).context(InvalidIdSnafu {
            stage: "parse-message-id",
            id_type: "message-id",
            raw: raw.to_string(),
        })?;
        Ok(Self(parsed))
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

impl From<Uuid> for MessageId {
    fn from(value: Uuid) -> Self {
        Self::new(value)
    }
}

impl FromStr for MessageId {
    type Err = StorageError;

    fn from_str(raw: &str) -> StorageResult<Self> {
        Self::parse(raw)
    }
}

/// Opaque identity issued by the authentication provider.
///
/// Ids must be non-empty and free of whitespace, `/` and the conversation
/// separator, so that every conversation id splits back into exactly one pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(String);

impl UserId {
    pub fn parse(raw: impl Into<String>) -> StorageResult<Self> {
        let raw = raw.into();
        let reason = if raw.is_empty() {
            Some("empty")
        } else if raw.chars().any(char::is_whitespace) {
            Some("contains whitespace")
        } else if raw.contains('/') {
            Some("contains '/'")
        } else if raw.contains(CONVERSATION_ID_SEPARATOR) {
            Some("contains the conversation separator '_'")
        } else {
            None
        };

        if let Some(reason) = reason {
            return MalformedIdSnafu {
                stage: "parse-user-id",
                id_type: "user-id",
                raw,
                reason,
            }
            .fail();
        }

        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

impl AsRef<str> for UserId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for UserId {
    type Err = StorageError;

    fn from_str(raw: &str) -> StorageResult<Self> {
        Self::parse(raw)
    }
}

/// Canonical address of the single conversation between two users.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConversationId(String);

impl ConversationId {
    /// Greater id first, so `derive(a, b) == derive(b, a)`.
    pub fn derive(left: &UserId, right: &UserId) -> StorageResult<Self> {
        ensure!(
            left != right,
            InvalidParticipantsSnafu {
                stage: "derive-conversation-id",
                details: format!("'{left}' cannot start a conversation with itself"),
            }
        );

        let (high, low) = if left > right {
            (left, right)
        } else {
            (right, left)
        };
        Ok(Self(format!("{high}{CONVERSATION_ID_SEPARATOR}{low}")))
    }

    pub fn parse(raw: &str) -> StorageResult<Self> {
        let Some((high, low)) = raw.split_once(CONVERSATION_ID_SEPARATOR) else {
            return MalformedIdSnafu {
                stage: "parse-conversation-id",
                id_type: "conversation-id",
                raw: raw.to_string(),
                reason: "missing separator",
            }
            .fail();
        };

        let derived = Self::derive(&UserId::parse(high)?, &UserId::parse(low)?)?;
        ensure!(
            derived.0 == raw,
            MalformedIdSnafu {
                stage: "parse-conversation-id",
                id_type: "conversation-id",
                raw: raw.to_string(),
                reason: "participants are not in canonical order",
            }
        );

        Ok(derived)
    }

    /// Both participants, greater id first.
    pub fn participants(&self) -> [UserId; 2] {
        // Construction guarantees exactly one separator between two valid user ids.
        let (high, low) = self
            .0
            .split_once(CONVERSATION_ID_SEPARATOR)
            .unwrap_or((self.0.as_str(), ""));
        [UserId(high.to_string()), UserId(low.to_string())]
    }

    pub fn includes(&self, user_id: &UserId) -> bool {
        self.participants().contains(user_id)
    }

    /// The participant that is not `user_id`, or `None` when `user_id` is not part of it.
    pub fn counterpart(&self, user_id: &UserId) -> Option<UserId> {
        let [high, low] = self.participants();
        if &high == user_id {
            Some(low)
        } else if &low == user_id {
            Some(high)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

impl FromStr for ConversationId {
    type Err = StorageError;

    fn from_str(raw: &str) -> StorageResult<Self> {
        Self::parse(raw)
    }
}

pub fn derive_conversation_id(left: &UserId, right: &UserId) -> StorageResult<ConversationId> {
    ConversationId::derive(left, right)
}
