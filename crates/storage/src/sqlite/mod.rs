use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use snafu::{OptionExt, ResultExt, ensure};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqliteConnection, SqlitePool};
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::error::{
    CreateSqliteDirectorySnafu, InvalidParticipantsSnafu, InvariantViolationSnafu, NotFoundSnafu,
    SelfReferenceSnafu, SqliteConnectOptionsSnafu, SqliteConnectSnafu, SqliteMigrateSnafu,
    SqliteQuerySnafu, StorageError, StorageResult, ValidationSnafu,
};
use super::ids::{ConversationId, MessageId, UserId};
use super::types::{
    ContactRecord, ConversationRecord, MessageRecord, NewMessage, StoreChange, SummaryUpdate,
    UserRecord, normalize_email, now_unix_millis,
};
use super::{BoxFuture, ChangeFeed, ContactStore, ConversationStore, UserDirectory};

pub const DEFAULT_MAX_CONNECTIONS: u32 = 4;
pub const DEFAULT_CHANGE_FEED_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqliteOptions {
    /// Ignored for in-memory databases, which always use a single connection.
    pub max_connections: u32,
    pub change_feed_capacity: usize,
}

impl Default for SqliteOptions {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            change_feed_capacity: DEFAULT_CHANGE_FEED_CAPACITY,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
    changes: broadcast::Sender<StoreChange>,
}

impl SqliteStorage {
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        Self::open_with_options(database_location, SqliteOptions::default()).await
    }

    pub async fn open_with_options(
        database_location: &str,
        options: SqliteOptions,
    ) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        // An in-memory database lives as long as its connection, so keep exactly one open.
        let pool_options = if is_in_memory(&database_url) {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(options.max_connections.max(1))
        };

        let pool = pool_options
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        let (changes, _) = broadcast::channel(options.change_feed_capacity.max(1));
        info!(%database_url, "opened conversation store");

        Ok(Self { pool, changes })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn publish(&self, change: StoreChange) {
        // Sending only fails when nobody is listening.
        let receivers = self.changes.send(change).unwrap_or(0);
        debug!(receivers, "published store change");
    }
}

impl ChangeFeed for SqliteStorage {
    fn subscribe_changes(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }
}

impl ConversationStore for SqliteStorage {
    fn upsert_summary<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
        update: SummaryUpdate,
    ) -> BoxFuture<'a, StorageResult<ConversationRecord>> {
        Box::pin(async move {
            let mut connection = self.pool.acquire().await.context(SqliteQuerySnafu {
                stage: "summary-upsert-acquire",
            })?;
            let record = upsert_summary_on(&mut connection, conversation_id, update).await?;

            self.publish(StoreChange::Conversation {
                conversation_id: record.id.clone(),
                participant_ids: record.participant_ids.clone(),
            });
            Ok(record)
        })
    }

    fn append_message<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
        input: NewMessage,
    ) -> BoxFuture<'a, StorageResult<MessageRecord>> {
        Box::pin(async move {
            let mut connection = self.pool.acquire().await.context(SqliteQuerySnafu {
                stage: "message-append-acquire",
            })?;
            let record = append_message_on(&mut connection, conversation_id, input).await?;

            self.publish(StoreChange::Message {
                conversation_id: record.conversation_id.clone(),
            });
            Ok(record)
        })
    }

    fn record_message<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
        update: SummaryUpdate,
        input: NewMessage,
    ) -> BoxFuture<'a, StorageResult<(ConversationRecord, MessageRecord)>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
                stage: "message-record-begin",
            })?;

            let summary = upsert_summary_on(&mut tx, conversation_id, update).await?;
            let message = append_message_on(&mut tx, conversation_id, input).await?;

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "message-record-commit",
            })?;

            self.publish(StoreChange::Conversation {
                conversation_id: summary.id.clone(),
                participant_ids: summary.participant_ids.clone(),
            });
            self.publish(StoreChange::Message {
                conversation_id: message.conversation_id.clone(),
            });
            Ok((summary, message))
        })
    }

    fn get_conversation<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
    ) -> BoxFuture<'a, StorageResult<Option<ConversationRecord>>> {
        Box::pin(async move {
            let row = sqlx::query_as::<_, ConversationRow>(
                "SELECT id, participant_low, participant_high, last_message_text, last_updated_at FROM conversations WHERE id = ?",
            )
            .bind(conversation_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-get-query",
            })?;

            row.map(conversation_row_to_record).transpose()
        })
    }

    fn list_conversations_for<'a>(
        &'a self,
        user_id: &'a UserId,
    ) -> BoxFuture<'a, StorageResult<Vec<ConversationRecord>>> {
        Box::pin(async move {
            let rows = sqlx::query_as::<_, ConversationRow>(
                "SELECT id, participant_low, participant_high, last_message_text, last_updated_at FROM conversations WHERE participant_low = ? OR participant_high = ? ORDER BY id ASC",
            )
            .bind(user_id.as_str())
            .bind(user_id.as_str())
            .fetch_all(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-list-query",
            })?;

            rows.into_iter().map(conversation_row_to_record).collect()
        })
    }

    fn list_messages<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
    ) -> BoxFuture<'a, StorageResult<Vec<MessageRecord>>> {
        Box::pin(async move {
            let rows = sqlx::query_as::<_, MessageRow>(
                "SELECT id, conversation_id, sender_id, receiver_id, text, created_at FROM messages WHERE conversation_id = ? ORDER BY created_at DESC, id DESC",
            )
            .bind(conversation_id.as_str())
            .fetch_all(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-list-query",
            })?;

            rows.into_iter().map(message_row_to_record).collect()
        })
    }
}

impl UserDirectory for SqliteStorage {
    fn register_user<'a>(
        &'a self,
        user_id: &'a UserId,
        email: &'a str,
    ) -> BoxFuture<'a, StorageResult<UserRecord>> {
        Box::pin(async move {
            let email = normalize_email(email);
            ensure!(
                !email.is_empty(),
                ValidationSnafu {
                    stage: "user-register-validate",
                    field: "email",
                    details: "email must not be blank".to_string(),
                }
            );

            let now = u64_to_i64(now_unix_millis(), "user-register-created-at")?;
            let row = sqlx::query_as::<_, UserRow>(
                "INSERT INTO users (id, email, created_at) VALUES (?, ?, ?) ON CONFLICT(id) DO UPDATE SET email = excluded.email RETURNING id, email, created_at",
            )
            .bind(user_id.as_str())
            .bind(email)
            .bind(now)
            .fetch_one(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "user-register-upsert",
            })?;

            let record = user_row_to_record(row)?;
            self.publish(StoreChange::User {
                user_id: record.id.clone(),
            });
            Ok(record)
        })
    }

    fn get_user<'a>(
        &'a self,
        user_id: &'a UserId,
    ) -> BoxFuture<'a, StorageResult<Option<UserRecord>>> {
        Box::pin(async move {
            let row =
                sqlx::query_as::<_, UserRow>("SELECT id, email, created_at FROM users WHERE id = ?")
                    .bind(user_id.as_str())
                    .fetch_optional(&self.pool)
                    .await
                    .context(SqliteQuerySnafu {
                        stage: "user-get-query",
                    })?;

            row.map(user_row_to_record).transpose()
        })
    }

    fn find_users_by_email<'a>(
        &'a self,
        email: &'a str,
    ) -> BoxFuture<'a, StorageResult<Vec<UserRecord>>> {
        Box::pin(async move {
            let rows = sqlx::query_as::<_, UserRow>(
                "SELECT id, email, created_at FROM users WHERE email = ? ORDER BY created_at ASC, id ASC",
            )
            .bind(normalize_email(email))
            .fetch_all(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "user-find-by-email-query",
            })?;

            rows.into_iter().map(user_row_to_record).collect()
        })
    }
}

impl ContactStore for SqliteStorage {
    fn upsert_contact<'a>(
        &'a self,
        owner_id: &'a UserId,
        contact: &'a UserRecord,
    ) -> BoxFuture<'a, StorageResult<ContactRecord>> {
        Box::pin(async move {
            ensure!(
                *owner_id != contact.id,
                SelfReferenceSnafu {
                    stage: "contact-upsert-self",
                    user_id: owner_id.to_string(),
                }
            );

            let row = sqlx::query_as::<_, ContactRow>(
                "INSERT INTO contacts (owner_id, contact_user_id, email) VALUES (?, ?, ?) ON CONFLICT(owner_id, contact_user_id) DO UPDATE SET email = excluded.email RETURNING owner_id, contact_user_id, email",
            )
            .bind(owner_id.as_str())
            .bind(contact.id.as_str())
            .bind(contact.email.as_str())
            .fetch_one(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "contact-upsert-query",
            })?;

            let record = contact_row_to_record(row)?;
            self.publish(StoreChange::Contact {
                owner_id: record.owner_id.clone(),
            });
            Ok(record)
        })
    }

    fn list_contacts<'a>(
        &'a self,
        owner_id: &'a UserId,
    ) -> BoxFuture<'a, StorageResult<Vec<ContactRecord>>> {
        Box::pin(async move {
            let rows = sqlx::query_as::<_, ContactRow>(
                "SELECT owner_id, contact_user_id, email FROM contacts WHERE owner_id = ? ORDER BY email ASC, contact_user_id ASC",
            )
            .bind(owner_id.as_str())
            .fetch_all(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "contact-list-query",
            })?;

            rows.into_iter().map(contact_row_to_record).collect()
        })
    }
}

#[derive(Debug, FromRow)]
struct ConversationRow {
    id: String,
    participant_low: String,
    participant_high: String,
    last_message_text: Option<String>,
    last_updated_at: Option<i64>,
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: String,
    conversation_id: String,
    sender_id: String,
    receiver_id: String,
    text: String,
    created_at: i64,
}

#[derive(Debug, FromRow)]
struct UserRow {
    id: String,
    email: String,
    created_at: i64,
}

#[derive(Debug, FromRow)]
struct ContactRow {
    owner_id: String,
    contact_user_id: String,
    email: String,
}

async fn upsert_summary_on(
    connection: &mut SqliteConnection,
    conversation_id: &ConversationId,
    update: SummaryUpdate,
) -> StorageResult<ConversationRecord> {
    let last_updated_at = update
        .last_updated_at_unix_millis
        .map(|value| u64_to_i64(value, "summary-upsert-updated-at"))
        .transpose()?;

    let row = match update.participant_ids {
        Some([left, right]) => {
            let derived = ConversationId::derive(&left, &right)?;
            ensure!(
                derived == *conversation_id,
                InvalidParticipantsSnafu {
                    stage: "summary-upsert-participants",
                    details: format!(
                        "participants '{left}' and '{right}' address '{derived}', not '{conversation_id}'"
                    ),
                }
            );
            let (low, high) = if left < right {
                (left, right)
            } else {
                (right, left)
            };

            sqlx::query_as::<_, ConversationRow>(
                "INSERT INTO conversations (id, participant_low, participant_high, last_message_text, last_updated_at) VALUES (?, ?, ?, ?, ?) \
                 ON CONFLICT(id) DO UPDATE SET \
                 last_message_text = COALESCE(excluded.last_message_text, conversations.last_message_text), \
                 last_updated_at = COALESCE(excluded.last_updated_at, conversations.last_updated_at) \
                 RETURNING id, participant_low, participant_high, last_message_text, last_updated_at",
            )
            .bind(conversation_id.as_str())
            .bind(low.as_str())
            .bind(high.as_str())
            .bind(update.last_message_text)
            .bind(last_updated_at)
            .fetch_one(&mut *connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "summary-upsert-insert",
            })?
        }
        None => sqlx::query_as::<_, ConversationRow>(
            "UPDATE conversations SET \
             last_message_text = COALESCE(?, last_message_text), \
             last_updated_at = COALESCE(?, last_updated_at) \
             WHERE id = ? \
             RETURNING id, participant_low, participant_high, last_message_text, last_updated_at",
        )
        .bind(update.last_message_text)
        .bind(last_updated_at)
        .bind(conversation_id.as_str())
        .fetch_optional(&mut *connection)
        .await
        .context(SqliteQuerySnafu {
            stage: "summary-upsert-update",
        })?
        .context(NotFoundSnafu {
            stage: "summary-upsert-missing",
            entity: "conversation",
            id: conversation_id.to_string(),
        })?,
    };

    conversation_row_to_record(row)
}

async fn append_message_on(
    connection: &mut SqliteConnection,
    conversation_id: &ConversationId,
    input: NewMessage,
) -> StorageResult<MessageRecord> {
    let addressed = ConversationId::derive(&input.sender_id, &input.receiver_id)?;
    ensure!(
        addressed == *conversation_id,
        InvalidParticipantsSnafu {
            stage: "message-append-participants",
            details: format!(
                "message from '{}' to '{}' belongs to '{addressed}', not '{conversation_id}'",
                input.sender_id, input.receiver_id
            ),
        }
    );

    let message_id = MessageId::new_v7();
    let now = u64_to_i64(now_unix_millis(), "message-append-now")?;

    // created_at is strictly increasing across the whole store, even when the clock stalls.
    let created_at = sqlx::query_scalar::<_, i64>(
        "INSERT INTO messages (id, conversation_id, sender_id, receiver_id, text, created_at) \
         SELECT ?, ?, ?, ?, ?, MAX(?, COALESCE(MAX(created_at), 0) + 1) FROM messages \
         RETURNING created_at",
    )
    .bind(message_id.to_string())
    .bind(conversation_id.as_str())
    .bind(input.sender_id.as_str())
    .bind(input.receiver_id.as_str())
    .bind(input.text.as_str())
    .bind(now)
    .fetch_one(&mut *connection)
    .await
    .context(SqliteQuerySnafu {
        stage: "message-append-insert",
    })?;

    Ok(MessageRecord {
        id: message_id,
        conversation_id: conversation_id.clone(),
        sender_id: input.sender_id,
        receiver_id: input.receiver_id,
        text: input.text,
        created_at_unix_millis: i64_to_u64(created_at, "message-append-created-at")?,
    })
}

fn conversation_row_to_record(row: ConversationRow) -> StorageResult<ConversationRecord> {
    let id = ConversationId::parse(&row.id)?;
    let low = UserId::parse(row.participant_low)?;
    let high = UserId::parse(row.participant_high)?;
    ensure!(
        ConversationId::derive(&low, &high)? == id,
        InvariantViolationSnafu {
            stage: "conversation-row-participants",
            details: format!("conversation '{id}' stores participants '{low}' and '{high}'"),
        }
    );

    Ok(ConversationRecord {
        id,
        participant_ids: [low, high],
        last_message_text: row.last_message_text,
        last_updated_at_unix_millis: row
            .last_updated_at
            .map(|value| i64_to_u64(value, "conversation-row-updated-at"))
            .transpose()?,
    })
}

fn message_row_to_record(row: MessageRow) -> StorageResult<MessageRecord> {
    Ok(MessageRecord {
        id: MessageId::parse(&row.id)?,
        conversation_id: ConversationId::parse(&row.conversation_id)?,
        sender_id: UserId::parse(row.sender_id)?,
        receiver_id: UserId::parse(row.receiver_id)?,
        text: row.text,
        created_at_unix_millis: i64_to_u64(row.created_at, "message-row-created-at")?,
    })
}

fn user_row_to_record(row: UserRow) -> StorageResult<UserRecord> {
    Ok(UserRecord {
        id: UserId::parse(row.id)?,
        email: row.email,
        created_at_unix_millis: i64_to_u64(row.created_at, "user-row-created-at")?,
    })
}

fn contact_row_to_record(row: ContactRow) -> StorageResult<ContactRecord> {
    Ok(ContactRecord {
        owner_id: UserId::parse(row.owner_id)?,
        contact_user_id: UserId::parse(row.contact_user_id)?,
        email: row.email,
    })
}

fn i64_to_u64(value: i64, stage: &'static str) -> StorageResult<u64> {
    value.try_into().map_err(|_| StorageError::InvariantViolation {
        stage,
        details: format!("negative sqlite integer '{value}' cannot map to u64"),
    })
}

fn u64_to_i64(value: u64, stage: &'static str) -> StorageResult<i64> {
    value.try_into().map_err(|_| StorageError::InvariantViolation {
        stage,
        details: format!("u64 '{value}' cannot map to sqlite i64"),
    })
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") || database_location == ":memory:" {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    if database_location == ":memory:" {
        return "sqlite::memory:".to_string();
    }

    format!("sqlite://{database_location}")
}

fn is_in_memory(database_url: &str) -> bool {
    database_url == "sqlite::memory:" || database_url.contains("mode=memory")
}
