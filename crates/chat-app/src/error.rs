use pairchat_storage::{StorageError, StorageErrorKind};
use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ChatError {
    #[snafu(display("storage operation failed on `{stage}`: {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("message text must not be blank"))]
    BlankMessage { stage: &'static str },
    #[snafu(display("email must not be blank"))]
    BlankEmail { stage: &'static str },
    #[snafu(display("no user is registered with email '{email}'"))]
    UserNotFound { stage: &'static str, email: String },
    #[snafu(display("user '{user_id}' cannot add itself as a contact"))]
    SelfContact { stage: &'static str, user_id: String },
    #[snafu(display("user '{user_id}' is not a participant of conversation '{conversation_id}'"))]
    NotParticipant {
        stage: &'static str,
        user_id: String,
        conversation_id: String,
    },
    #[snafu(display("session of '{session_user}' cannot send as '{sender_id}'"))]
    SenderMismatch {
        stage: &'static str,
        session_user: String,
        sender_id: String,
    },
}

pub type ChatResult<T> = Result<T, ChatError>;

impl ChatError {
    pub fn kind(&self) -> StorageErrorKind {
        match self {
            Self::Storage { source, .. } => source.kind(),
            Self::BlankMessage { .. } | Self::BlankEmail { .. } => StorageErrorKind::Validation,
            Self::UserNotFound { .. } => StorageErrorKind::NotFound,
            Self::SelfContact { .. } => StorageErrorKind::SelfReference,
            Self::NotParticipant { .. } | Self::SenderMismatch { .. } => {
                StorageErrorKind::Permission
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == StorageErrorKind::StoreUnavailable
    }

    pub fn stage(&self) -> &'static str {
        match self {
            Self::Storage { stage, .. }
            | Self::BlankMessage { stage }
            | Self::BlankEmail { stage }
            | Self::UserNotFound { stage, .. }
            | Self::SelfContact { stage, .. }
            | Self::NotParticipant { stage, .. }
            | Self::SenderMismatch { stage, .. } => stage,
        }
    }
}
