use std::sync::Arc;

use pairchat_storage::{
    ContactRecord, ConversationId, ConversationRecord, ConversationStore, MessageRecord,
    NewMessage, SqliteStorage, Storage, Subscription, SummaryUpdate, UserId, UserRecord,
    now_unix_millis, subscribe_conversations_for, subscribe_messages,
};
use snafu::{ResultExt, ensure};
use tracing::{debug, info, warn};

use crate::chat_list::{ChatListAggregator, ChatListRow};
use crate::contacts::ContactDirectory;
use crate::error::{
    BlankMessageSnafu, ChatError, ChatResult, NotParticipantSnafu, SenderMismatchSnafu,
    StorageSnafu,
};
use crate::settings::{ChatSettings, SendMode};

/// Entry point holding the shared store and the settings it was opened with.
#[derive(Clone)]
pub struct ChatClient {
    storage: Arc<dyn Storage>,
    settings: Arc<ChatSettings>,
}

impl ChatClient {
    pub fn new(storage: Arc<dyn Storage>, settings: Arc<ChatSettings>) -> Self {
        Self { storage, settings }
    }

    /// Opens the SQLite store named by `settings.database_location`.
    pub async fn open(settings: Arc<ChatSettings>) -> ChatResult<Self> {
        let storage = SqliteStorage::open_with_options(
            &settings.database_location,
            settings.sqlite_options(),
        )
        .await
        .context(StorageSnafu {
            stage: "client-open-storage",
        })?;

        Ok(Self::new(Arc::new(storage), settings))
    }

    pub fn settings(&self) -> &ChatSettings {
        &self.settings
    }

    pub fn storage(&self) -> Arc<dyn Storage> {
        self.storage.clone()
    }

    pub fn directory(&self) -> ContactDirectory {
        ContactDirectory::new(self.storage.clone())
    }

    pub async fn register_user(&self, user_id: &UserId, email: &str) -> ChatResult<UserRecord> {
        self.directory().register_user(user_id, email).await
    }

    /// Binds all further calls to the authenticated `user_id`.
    pub fn session(&self, user_id: UserId) -> ChatSession {
        ChatSession {
            user_id,
            storage: self.storage.clone(),
            directory: self.directory(),
            chat_list: ChatListAggregator::new(
                self.storage.clone(),
                self.settings.chat_list_labels(),
            ),
            send_mode: self.settings.send_mode,
        }
    }
}

/// Operations on behalf of one signed-in user.
#[derive(Clone)]
pub struct ChatSession {
    user_id: UserId,
    storage: Arc<dyn Storage>,
    directory: ContactDirectory,
    chat_list: ChatListAggregator,
    send_mode: SendMode,
}

impl ChatSession {
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn send_mode(&self) -> SendMode {
        self.send_mode
    }

    pub fn conversation_with(&self, other: &UserId) -> ChatResult<ConversationId> {
        ConversationId::derive(&self.user_id, other).context(StorageSnafu {
            stage: "conversation-with-derive",
        })
    }

    /// Updates the conversation summary and appends the message.
    ///
    /// In sequential mode a failed append leaves the summary already updated;
    /// the error is still returned.
    pub async fn send_message(
        &self,
        conversation_id: &ConversationId,
        sender_id: &UserId,
        receiver_id: &UserId,
        text: &str,
    ) -> ChatResult<MessageRecord> {
        ensure!(
            !text.trim().is_empty(),
            BlankMessageSnafu {
                stage: "send-message-validate",
            }
        );
        ensure!(
            *sender_id == self.user_id,
            SenderMismatchSnafu {
                stage: "send-message-sender",
                session_user: self.user_id.to_string(),
                sender_id: sender_id.to_string(),
            }
        );

        let update = SummaryUpdate::for_participants(sender_id.clone(), receiver_id.clone())
            .with_last_message(text)
            .touched_at(now_unix_millis());
        let message = NewMessage::new(sender_id.clone(), receiver_id.clone(), text);

        let record = match self.send_mode {
            SendMode::Transactional => {
                let (_, record) = self
                    .storage
                    .record_message(conversation_id, update, message)
                    .await
                    .context(StorageSnafu {
                        stage: "send-message-record",
                    })?;
                record
            }
            SendMode::Sequential => {
                self.storage
                    .upsert_summary(conversation_id, update)
                    .await
                    .context(StorageSnafu {
                        stage: "send-message-summary",
                    })?;

                match self.storage.append_message(conversation_id, message).await {
                    Ok(record) => record,
                    Err(source) => {
                        warn!(
                            %conversation_id,
                            error = %source,
                            "summary was updated but the message append failed"
                        );
                        return Err(ChatError::Storage {
                            stage: "send-message-append",
                            source,
                        });
                    }
                }
            }
        };

        debug!(%conversation_id, message_id = %record.id, "message sent");
        Ok(record)
    }

    pub async fn send_to(&self, receiver_id: &UserId, text: &str) -> ChatResult<MessageRecord> {
        let conversation_id = self.conversation_with(receiver_id)?;
        self.send_message(&conversation_id, &self.user_id, receiver_id, text)
            .await
    }

    /// Live history of one conversation, newest first.
    pub fn subscribe_messages(
        &self,
        conversation_id: &ConversationId,
    ) -> ChatResult<Subscription<Vec<MessageRecord>>> {
        self.ensure_participant(conversation_id, "subscribe-messages-participant")?;
        Ok(subscribe_messages(
            self.storage.clone(),
            conversation_id.clone(),
        ))
    }

    pub async fn messages(
        &self,
        conversation_id: &ConversationId,
    ) -> ChatResult<Vec<MessageRecord>> {
        self.ensure_participant(conversation_id, "messages-participant")?;
        self.storage
            .list_messages(conversation_id)
            .await
            .context(StorageSnafu {
                stage: "messages-query",
            })
    }

    pub fn subscribe_conversations(&self) -> Subscription<Vec<ConversationRecord>> {
        subscribe_conversations_for(self.storage.clone(), self.user_id.clone())
    }

    pub fn subscribe_chat_list(&self) -> Subscription<Vec<ChatListRow>> {
        self.chat_list.subscribe(&self.user_id)
    }

    pub async fn chat_list(&self) -> ChatResult<Vec<ChatListRow>> {
        self.chat_list.snapshot(&self.user_id).await
    }

    pub async fn add_contact(&self, email: &str) -> ChatResult<ContactRecord> {
        self.directory.add_contact(&self.user_id, email).await
    }

    pub fn list_contacts(&self) -> Subscription<Vec<ContactRecord>> {
        self.directory.list_contacts(&self.user_id)
    }

    pub async fn contacts(&self) -> ChatResult<Vec<ContactRecord>> {
        self.directory.contacts(&self.user_id).await
    }

    pub async fn lookup_user_by_email(&self, email: &str) -> ChatResult<Option<UserRecord>> {
        self.directory.lookup_user_by_email(email).await
    }

    fn ensure_participant(
        &self,
        conversation_id: &ConversationId,
        stage: &'static str,
    ) -> ChatResult<()> {
        if !conversation_id.includes(&self.user_id) {
            info!(user_id = %self.user_id, %conversation_id, "rejected access to foreign conversation");
            return NotParticipantSnafu {
                stage,
                user_id: self.user_id.to_string(),
                conversation_id: conversation_id.to_string(),
            }
            .fail();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pairchat_storage::{
        BoxFuture, ChangeFeed, ContactStore, StorageError, StorageErrorKind, StorageResult,
        StoreChange, UserDirectory, derive_conversation_id,
    };
    use tokio::sync::broadcast;

    use super::*;

    fn user(raw: &str) -> UserId {
        UserId::parse(raw).unwrap()
    }

    async fn client(send_mode: SendMode) -> ChatClient {
        let storage = SqliteStorage::open(":memory:").await.unwrap();
        client_over(Arc::new(storage), send_mode).await
    }

    async fn client_over(storage: Arc<dyn Storage>, send_mode: SendMode) -> ChatClient {
        let settings = ChatSettings {
            database_location: ":memory:".to_string(),
            send_mode,
            ..ChatSettings::default()
        };
        let client = ChatClient::new(storage, Arc::new(settings));
        client.register_user(&user("U1"), "a@x.com").await.unwrap();
        client.register_user(&user("U2"), "b@x.com").await.unwrap();
        client
    }

    /// Delegates to SQLite but every message append times out waiting for a connection.
    struct UnavailableAppends {
        inner: SqliteStorage,
    }

    fn append_unavailable() -> StorageError {
        StorageError::SqliteQuery {
            stage: "append-message",
            source: sqlx::Error::PoolTimedOut,
        }
    }

    impl ConversationStore for UnavailableAppends {
        fn upsert_summary<'a>(
            &'a self,
            conversation_id: &'a ConversationId,
            update: SummaryUpdate,
        ) -> BoxFuture<'a, StorageResult<ConversationRecord>> {
            self.inner.upsert_summary(conversation_id, update)
        }

        fn append_message<'a>(
            &'a self,
            _conversation_id: &'a ConversationId,
            _input: NewMessage,
        ) -> BoxFuture<'a, StorageResult<MessageRecord>> {
            Box::pin(async { Err(append_unavailable()) })
        }

        fn record_message<'a>(
            &'a self,
            _conversation_id: &'a ConversationId,
            _update: SummaryUpdate,
            _input: NewMessage,
        ) -> BoxFuture<'a, StorageResult<(ConversationRecord, MessageRecord)>> {
            Box::pin(async { Err(append_unavailable()) })
        }

        fn get_conversation<'a>(
            &'a self,
            conversation_id: &'a ConversationId,
        ) -> BoxFuture<'a, StorageResult<Option<ConversationRecord>>> {
            self.inner.get_conversation(conversation_id)
        }

        fn list_conversations_for<'a>(
            &'a self,
            user_id: &'a UserId,
        ) -> BoxFuture<'a, StorageResult<Vec<ConversationRecord>>> {
            self.inner.list_conversations_for(user_id)
        }

        fn list_messages<'a>(
            &'a self,
            conversation_id: &'a ConversationId,
        ) -> BoxFuture<'a, StorageResult<Vec<MessageRecord>>> {
            self.inner.list_messages(conversation_id)
        }
    }

    impl UserDirectory for UnavailableAppends {
        fn register_user<'a>(
            &'a self,
            user_id: &'a UserId,
            email: &'a str,
        ) -> BoxFuture<'a, StorageResult<UserRecord>> {
            self.inner.register_user(user_id, email)
        }

        fn get_user<'a>(
            &'a self,
            user_id: &'a UserId,
        ) -> BoxFuture<'a, StorageResult<Option<UserRecord>>> {
            self.inner.get_user(user_id)
        }

        fn find_users_by_email<'a>(
            &'a self,
            email: &'a str,
        ) -> BoxFuture<'a, StorageResult<Vec<UserRecord>>> {
            self.inner.find_users_by_email(email)
        }
    }

    impl ContactStore for UnavailableAppends {
        fn upsert_contact<'a>(
            &'a self,
            owner_id: &'a UserId,
            contact: &'a UserRecord,
        ) -> BoxFuture<'a, StorageResult<ContactRecord>> {
            self.inner.upsert_contact(owner_id, contact)
        }

        fn list_contacts<'a>(
            &'a self,
            owner_id: &'a UserId,
        ) -> BoxFuture<'a, StorageResult<Vec<ContactRecord>>> {
            self.inner.list_contacts(owner_id)
        }
    }

    impl ChangeFeed for UnavailableAppends {
        fn subscribe_changes(&self) -> broadcast::Receiver<StoreChange> {
            self.inner.subscribe_changes()
        }
    }

    async fn next<T>(subscription: &mut Subscription<T>) -> T {
        tokio::time::timeout(Duration::from_secs(5), subscription.next_snapshot())
            .await
            .unwrap()
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn first_message_creates_conversation_visible_to_both() {
        let client = client(SendMode::Sequential).await;
        let alice = client.session(user("U1"));
        let bob = client.session(user("U2"));

        let conversation_id = alice.conversation_with(&user("U2")).unwrap();
        assert_eq!(conversation_id, bob.conversation_with(&user("U1")).unwrap());
        assert_eq!(conversation_id.as_str(), "U2_U1");

        alice
            .send_message(&conversation_id, &user("U1"), &user("U2"), "hi")
            .await
            .unwrap();

        let rows = alice.chat_list().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].other_user_email, "b@x.com");
        assert_eq!(rows[0].last_message, "hi");

        let rows = bob.chat_list().await.unwrap();
        assert_eq!(rows[0].other_user_email, "a@x.com");
        assert_eq!(rows[0].last_message, "hi");

        bob.send_to(&user("U1"), "there").await.unwrap();
        let texts = alice
            .messages(&conversation_id)
            .await
            .unwrap()
            .into_iter()
            .map(|message| message.text)
            .collect::<Vec<_>>();
        assert_eq!(texts, ["there", "hi"]);
        assert_eq!(alice.chat_list().await.unwrap()[0].last_message, "there");
    }

    #[tokio::test]
    async fn transactional_mode_matches_sequential_results() {
        let client = client(SendMode::Transactional).await;
        let alice = client.session(user("U1"));
        assert_eq!(alice.send_mode(), SendMode::Transactional);

        alice.send_to(&user("U2"), "one").await.unwrap();
        alice.send_to(&user("U2"), "two").await.unwrap();

        let conversation_id = alice.conversation_with(&user("U2")).unwrap();
        assert_eq!(alice.messages(&conversation_id).await.unwrap().len(), 2);
        assert_eq!(alice.chat_list().await.unwrap()[0].last_message, "two");
    }

    #[tokio::test]
    async fn sequential_send_keeps_summary_when_append_fails() {
        let inner = SqliteStorage::open(":memory:").await.unwrap();
        let client = client_over(
            Arc::new(UnavailableAppends { inner }),
            SendMode::Sequential,
        )
        .await;
        let alice = client.session(user("U1"));
        let conversation_id = alice.conversation_with(&user("U2")).unwrap();

        let error = alice.send_to(&user("U2"), "lost").await.unwrap_err();
        assert_eq!(error.kind(), StorageErrorKind::StoreUnavailable);
        assert!(error.is_retryable());

        let summary = client
            .storage()
            .get_conversation(&conversation_id)
            .await
            .unwrap()
            .expect("summary written before the append");
        assert_eq!(summary.last_message_text.as_deref(), Some("lost"));
        assert!(alice.messages(&conversation_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn transactional_send_rolls_back_when_append_fails() {
        let storage = SqliteStorage::open(":memory:").await.unwrap();
        sqlx::query(
            "CREATE TRIGGER reject_messages BEFORE INSERT ON messages
             BEGIN SELECT RAISE(ABORT, 'messages are read only'); END",
        )
        .execute(storage.pool())
        .await
        .unwrap();
        let client = client_over(Arc::new(storage), SendMode::Transactional).await;
        let alice = client.session(user("U1"));
        let conversation_id = alice.conversation_with(&user("U2")).unwrap();

        assert!(alice.send_to(&user("U2"), "lost").await.is_err());

        let summary = client
            .storage()
            .get_conversation(&conversation_id)
            .await
            .unwrap();
        assert_eq!(summary, None);
        assert!(alice.messages(&conversation_id).await.unwrap().is_empty());
        assert!(alice.chat_list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn send_rejects_invalid_input_without_writing() {
        let client = client(SendMode::Sequential).await;
        let alice = client.session(user("U1"));
        let conversation_id = alice.conversation_with(&user("U2")).unwrap();

        let blank = alice
            .send_message(&conversation_id, &user("U1"), &user("U2"), "  \n")
            .await
            .unwrap_err();
        assert_eq!(blank.kind(), StorageErrorKind::Validation);

        let impersonation = alice
            .send_message(&conversation_id, &user("U2"), &user("U1"), "hi")
            .await
            .unwrap_err();
        assert_eq!(impersonation.kind(), StorageErrorKind::Permission);

        let misaddressed = alice
            .send_message(&conversation_id, &user("U1"), &user("U3"), "hi")
            .await
            .unwrap_err();
        assert_eq!(misaddressed.kind(), StorageErrorKind::InvalidParticipants);

        let to_self = alice.send_to(&user("U1"), "hi").await.unwrap_err();
        assert_eq!(to_self.kind(), StorageErrorKind::InvalidParticipants);

        assert!(alice.chat_list().await.unwrap().is_empty());
        assert!(alice.messages(&conversation_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn outsiders_cannot_read_a_conversation() {
        let client = client(SendMode::Sequential).await;
        let outsider = client.session(user("U3"));
        let conversation_id = derive_conversation_id(&user("U1"), &user("U2")).unwrap();

        let error = outsider.subscribe_messages(&conversation_id).unwrap_err();
        assert_eq!(error.kind(), StorageErrorKind::Permission);
        let error = outsider.messages(&conversation_id).await.unwrap_err();
        assert_eq!(error.kind(), StorageErrorKind::Permission);
    }

    #[tokio::test]
    async fn live_views_follow_sends() {
        let client = client(SendMode::Sequential).await;
        let alice = client.session(user("U1"));
        let bob = client.session(user("U2"));
        let conversation_id = alice.conversation_with(&user("U2")).unwrap();

        let mut messages = bob.subscribe_messages(&conversation_id).unwrap();
        let mut chat_list = bob.subscribe_chat_list();
        assert!(next(&mut messages).await.is_empty());
        assert!(next(&mut chat_list).await.is_empty());

        alice.send_to(&user("U2"), "ping").await.unwrap();

        let mut snapshot = next(&mut messages).await;
        while snapshot.is_empty() {
            snapshot = next(&mut messages).await;
        }
        assert_eq!(snapshot[0].text, "ping");

        let mut rows = next(&mut chat_list).await;
        while rows.is_empty() {
            rows = next(&mut chat_list).await;
        }
        assert_eq!(rows[0].other_user_id, user("U1"));
        assert_eq!(rows[0].last_message, "ping");

        assert!(messages.cancel());
        assert!(!messages.cancel());
    }

    #[tokio::test]
    async fn contacts_are_managed_per_session() {
        let client = client(SendMode::Sequential).await;
        let alice = client.session(user("U1"));

        let contact = alice.add_contact("B@x.com").await.unwrap();
        assert_eq!(contact.contact_user_id, user("U2"));
        assert_eq!(alice.contacts().await.unwrap(), vec![contact]);
        assert!(client.session(user("U2")).contacts().await.unwrap().is_empty());

        let found = alice.lookup_user_by_email("a@x.com").await.unwrap();
        assert_eq!(found.map(|record| record.id), Some(user("U1")));

        let error = alice.add_contact("a@x.com").await.unwrap_err();
        assert_eq!(error.kind(), StorageErrorKind::SelfReference);
    }
}
