use std::sync::Arc;

use futures::future::join_all;
use pairchat_storage::live::spawn_live_view;
use pairchat_storage::{
    ConversationId, ConversationRecord, ConversationStore, Storage, StorageError, StoreChange,
    Subscription, UserDirectory, UserId,
};
use snafu::ResultExt;
use tracing::{debug, warn};

use crate::error::{ChatResult, StorageSnafu};

pub const DEFAULT_UNKNOWN_USER_LABEL: &str = "Unknown User";
pub const DEFAULT_EMPTY_PREVIEW_LABEL: &str = "No messages yet";

/// One entry of a user's conversation list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatListRow {
    pub conversation_id: ConversationId,
    pub other_user_id: UserId,
    pub other_user_email: String,
    pub last_message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatListLabels {
    /// Shown when the other participant's email cannot be resolved.
    pub unknown_user: String,
    /// Shown for a conversation without a last message.
    pub empty_preview: String,
}

impl Default for ChatListLabels {
    fn default() -> Self {
        Self {
            unknown_user: DEFAULT_UNKNOWN_USER_LABEL.to_string(),
            empty_preview: DEFAULT_EMPTY_PREVIEW_LABEL.to_string(),
        }
    }
}

#[derive(Clone)]
pub struct ChatListAggregator {
    storage: Arc<dyn Storage>,
    labels: Arc<ChatListLabels>,
}

impl ChatListAggregator {
    pub fn new(storage: Arc<dyn Storage>, labels: ChatListLabels) -> Self {
        Self {
            storage,
            labels: Arc::new(labels),
        }
    }

    pub fn labels(&self) -> &ChatListLabels {
        &self.labels
    }

    pub async fn snapshot(&self, user_id: &UserId) -> ChatResult<Vec<ChatListRow>> {
        let conversations = self
            .storage
            .list_conversations_for(user_id)
            .await
            .context(StorageSnafu {
                stage: "chat-list-conversations",
            })?;

        Ok(build_rows(
            self.storage.clone(),
            self.labels.clone(),
            user_id.clone(),
            conversations,
        )
        .await)
    }

    /// Live chat list, rebuilt when one of the user's conversations changes or
    /// when a user registers, so a counterpart's email replaces the fallback label.
    pub fn subscribe(&self, user_id: &UserId) -> Subscription<Vec<ChatListRow>> {
        let storage = self.storage.clone();
        let labels = self.labels.clone();
        let owner = user_id.clone();
        let watched = user_id.clone();

        spawn_live_view(
            self.storage.as_ref(),
            "live-chat-list",
            move |change| match change {
                StoreChange::Conversation {
                    participant_ids, ..
                } => participant_ids.contains(&watched),
                StoreChange::User { user_id } => *user_id != watched,
                _ => false,
            },
            move || {
                let storage = storage.clone();
                let labels = labels.clone();
                let owner = owner.clone();
                Box::pin(async move {
                    let conversations = storage.list_conversations_for(&owner).await?;
                    Ok::<_, StorageError>(build_rows(storage, labels, owner, conversations).await)
                })
            },
        )
    }
}

async fn build_rows(
    storage: Arc<dyn Storage>,
    labels: Arc<ChatListLabels>,
    user_id: UserId,
    conversations: Vec<ConversationRecord>,
) -> Vec<ChatListRow> {
    let rows = conversations.into_iter().filter_map(|conversation| {
        let Some(other_user_id) = conversation.counterpart(&user_id).cloned() else {
            debug!(conversation_id = %conversation.id, %user_id, "conversation has no other participant, skipping");
            return None;
        };
        let storage = storage.clone();
        let labels = labels.clone();

        Some(async move {
            let other_user_email = match storage.get_user(&other_user_id).await {
                Ok(Some(user)) => user.email,
                Ok(None) => labels.unknown_user.clone(),
                Err(error) => {
                    warn!(%error, user_id = %other_user_id, "chat list email lookup failed");
                    labels.unknown_user.clone()
                }
            };

            ChatListRow {
                conversation_id: conversation.id,
                other_user_id,
                other_user_email,
                last_message: conversation
                    .last_message_text
                    .unwrap_or_else(|| labels.empty_preview.clone()),
            }
        })
    });

    join_all(rows).await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pairchat_storage::{
        NewMessage, SqliteStorage, SummaryUpdate, derive_conversation_id, now_unix_millis,
    };

    use super::*;

    fn user(raw: &str) -> UserId {
        UserId::parse(raw).unwrap()
    }

    async fn memory_store() -> Arc<dyn Storage> {
        Arc::new(SqliteStorage::open(":memory:").await.unwrap())
    }

    async fn send(storage: &Arc<dyn Storage>, from: &str, to: &str, text: &str) {
        let conversation_id = derive_conversation_id(&user(from), &user(to)).unwrap();
        storage
            .upsert_summary(
                &conversation_id,
                SummaryUpdate::for_participants(user(from), user(to))
                    .with_last_message(text)
                    .touched_at(now_unix_millis()),
            )
            .await
            .unwrap();
        storage
            .append_message(&conversation_id, NewMessage::new(user(from), user(to), text))
            .await
            .unwrap();
    }

    async fn next(rows: &mut Subscription<Vec<ChatListRow>>) -> Vec<ChatListRow> {
        tokio::time::timeout(Duration::from_secs(5), rows.next_snapshot())
            .await
            .unwrap()
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn rows_resolve_the_other_participant() {
        let storage = memory_store().await;
        storage.register_user(&user("u1"), "a@x.com").await.unwrap();
        storage.register_user(&user("u2"), "b@x.com").await.unwrap();
        send(&storage, "u1", "u2", "hi").await;

        let aggregator = ChatListAggregator::new(storage, ChatListLabels::default());
        let rows = aggregator.snapshot(&user("u1")).await.unwrap();
        assert_eq!(
            rows,
            vec![ChatListRow {
                conversation_id: derive_conversation_id(&user("u1"), &user("u2")).unwrap(),
                other_user_id: user("u2"),
                other_user_email: "b@x.com".to_string(),
                last_message: "hi".to_string(),
            }]
        );

        let rows = aggregator.snapshot(&user("u2")).await.unwrap();
        assert_eq!(rows[0].other_user_email, "a@x.com");
    }

    #[tokio::test]
    async fn rows_fall_back_to_labels() {
        let storage = memory_store().await;
        let conversation_id = derive_conversation_id(&user("u1"), &user("ghost")).unwrap();
        storage
            .upsert_summary(
                &conversation_id,
                SummaryUpdate::for_participants(user("u1"), user("ghost")),
            )
            .await
            .unwrap();

        let aggregator = ChatListAggregator::new(storage.clone(), ChatListLabels::default());
        let rows = aggregator.snapshot(&user("u1")).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].other_user_email, DEFAULT_UNKNOWN_USER_LABEL);
        assert_eq!(rows[0].last_message, DEFAULT_EMPTY_PREVIEW_LABEL);

        let custom = ChatListAggregator::new(
            storage,
            ChatListLabels {
                unknown_user: "?".to_string(),
                empty_preview: "-".to_string(),
            },
        );
        let rows = custom.snapshot(&user("u1")).await.unwrap();
        assert_eq!(rows[0].other_user_email, "?");
        assert_eq!(rows[0].last_message, "-");
    }

    #[tokio::test]
    async fn rows_follow_conversation_order() {
        let storage = memory_store().await;
        send(&storage, "u1", "u3", "to three").await;
        send(&storage, "u2", "u1", "from two").await;

        let aggregator = ChatListAggregator::new(storage, ChatListLabels::default());
        let others = aggregator
            .snapshot(&user("u1"))
            .await
            .unwrap()
            .into_iter()
            .map(|row| row.other_user_id)
            .collect::<Vec<_>>();
        // "u2_u1" sorts before "u3_u1".
        assert_eq!(others, [user("u2"), user("u3")]);
    }

    #[tokio::test]
    async fn live_chat_list_resolves_late_registrations() {
        let storage = memory_store().await;
        storage.register_user(&user("u1"), "a@x.com").await.unwrap();
        send(&storage, "u1", "u2", "before signup").await;

        let aggregator = ChatListAggregator::new(storage.clone(), ChatListLabels::default());
        let mut rows = aggregator.subscribe(&user("u1"));
        let snapshot = next(&mut rows).await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].other_user_email, DEFAULT_UNKNOWN_USER_LABEL);

        storage.register_user(&user("u2"), "b@x.com").await.unwrap();
        let snapshot = next(&mut rows).await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].other_user_email, "b@x.com");
        assert_eq!(snapshot[0].last_message, "before signup");
    }

    #[tokio::test]
    async fn live_chat_list_tracks_new_messages() {
        let storage = memory_store().await;
        storage.register_user(&user("u1"), "a@x.com").await.unwrap();
        storage.register_user(&user("u2"), "b@x.com").await.unwrap();

        let aggregator = ChatListAggregator::new(storage.clone(), ChatListLabels::default());
        let mut rows = aggregator.subscribe(&user("u1"));

        assert!(next(&mut rows).await.is_empty());

        send(&storage, "u2", "u1", "hello").await;
        let mut snapshot = next(&mut rows).await;
        while snapshot.is_empty() {
            snapshot = next(&mut rows).await;
        }
        assert_eq!(snapshot[0].last_message, "hello");
        assert_eq!(snapshot[0].other_user_email, "b@x.com");

        send(&storage, "u1", "u2", "again").await;
        let mut snapshot = next(&mut rows).await;
        while snapshot[0].last_message != "again" {
            snapshot = next(&mut rows).await;
        }
        assert_eq!(snapshot.len(), 1);
    }
}
