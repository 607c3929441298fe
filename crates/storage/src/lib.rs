use std::future::Future;
use std::pin::Pin;

use tokio::sync::broadcast;

pub mod error;
pub mod ids;
pub mod live;
pub mod sqlite;
pub mod types;

pub use error::{StorageError, StorageErrorKind, StorageResult};
pub use ids::{ConversationId, MessageId, UserId, derive_conversation_id};
pub use live::{
    LiveEvent, Subscription, subscribe_contacts, subscribe_conversations_for, subscribe_messages,
};
pub use sqlite::{SqliteOptions, SqliteStorage};
pub use types::{
    ContactRecord, ConversationRecord, MessageRecord, NewMessage, StoreChange, SummaryUpdate,
    UserRecord, normalize_email, now_unix_millis,
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub trait ConversationStore: Send + Sync {
    /// Merge write; creates the summary on first use.
    fn upsert_summary<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
        update: SummaryUpdate,
    ) -> BoxFuture<'a, StorageResult<ConversationRecord>>;

    fn append_message<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
        input: NewMessage,
    ) -> BoxFuture<'a, StorageResult<MessageRecord>>;

    /// Summary merge and message append in one transaction.
    fn record_message<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
        update: SummaryUpdate,
        input: NewMessage,
    ) -> BoxFuture<'a, StorageResult<(ConversationRecord, MessageRecord)>>;

    fn get_conversation<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
    ) -> BoxFuture<'a, StorageResult<Option<ConversationRecord>>>;

    fn list_conversations_for<'a>(
        &'a self,
        user_id: &'a UserId,
    ) -> BoxFuture<'a, StorageResult<Vec<ConversationRecord>>>;

    /// Newest first: `created_at` descending, then id descending.
    fn list_messages<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
    ) -> BoxFuture<'a, StorageResult<Vec<MessageRecord>>>;
}

pub trait UserDirectory: Send + Sync {
    fn register_user<'a>(
        &'a self,
        user_id: &'a UserId,
        email: &'a str,
    ) -> BoxFuture<'a, StorageResult<UserRecord>>;

    fn get_user<'a>(&'a self, user_id: &'a UserId)
    -> BoxFuture<'a, StorageResult<Option<UserRecord>>>;

    /// Earliest registration first.
    fn find_users_by_email<'a>(
        &'a self,
        email: &'a str,
    ) -> BoxFuture<'a, StorageResult<Vec<UserRecord>>>;
}

pub trait ContactStore: Send + Sync {
    fn upsert_contact<'a>(
        &'a self,
        owner_id: &'a UserId,
        contact: &'a UserRecord,
    ) -> BoxFuture<'a, StorageResult<ContactRecord>>;

    fn list_contacts<'a>(
        &'a self,
        owner_id: &'a UserId,
    ) -> BoxFuture<'a, StorageResult<Vec<ContactRecord>>>;
}

pub trait ChangeFeed: Send + Sync {
    fn subscribe_changes(&self) -> broadcast::Receiver<StoreChange>;
}

pub trait Storage: ConversationStore + UserDirectory + ContactStore + ChangeFeed {}

impl<T> Storage for T where T: ConversationStore + UserDirectory + ContactStore + ChangeFeed {}
