use std::collections::HashSet;
use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use snafu::{OptionExt, ResultExt, Snafu};

use pairchat_storage::{
    ChangeFeed, ContactStore, ConversationId, ConversationStore, MessageId, NewMessage,
    SqliteStorage, StorageError, StorageErrorKind, StoreChange, SummaryUpdate, UserDirectory,
    UserId, derive_conversation_id,
};

const MEMORY_DATABASE: &str = ":memory:";

#[derive(Debug, Clone)]
struct RunnerArgs {
    scenario: Scenario,
    db_path: Option<String>,
}

#[derive(Debug, Clone, Copy)]
enum Scenario {
    IdRoundtrip,
    IdInvalid,
    ConversationIdentity,
    SchemaInit,
    SummaryMerge,
    MessageOrder,
    ParticipantGuard,
    ContactUpsert,
    EmailLookup,
    ChangeFeed,
    All,
}

impl Scenario {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "id_roundtrip" => Some(Self::IdRoundtrip),
            "id_invalid" => Some(Self::IdInvalid),
            "conversation_identity" => Some(Self::ConversationIdentity),
            "schema_init" => Some(Self::SchemaInit),
            "summary_merge" => Some(Self::SummaryMerge),
            "message_order" => Some(Self::MessageOrder),
            "participant_guard" => Some(Self::ParticipantGuard),
            "contact_upsert" => Some(Self::ContactUpsert),
            "email_lookup" => Some(Self::EmailLookup),
            "change_feed" => Some(Self::ChangeFeed),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::IdRoundtrip => "id_roundtrip",
            Self::IdInvalid => "id_invalid",
            Self::ConversationIdentity => "conversation_identity",
            Self::SchemaInit => "schema_init",
            Self::SummaryMerge => "summary_merge",
            Self::MessageOrder => "message_order",
            Self::ParticipantGuard => "participant_guard",
            Self::ContactUpsert => "contact_upsert",
            Self::EmailLookup => "email_lookup",
            Self::ChangeFeed => "change_feed",
            Self::All => "all",
        }
    }
}

#[derive(Debug, Snafu)]
enum RunnerError {
    #[snafu(display("missing required --scenario argument"))]
    MissingScenario { stage: &'static str },
    #[snafu(display("missing value for argument '{arg}'"))]
    MissingArgumentValue {
        stage: &'static str,
        arg: &'static str,
    },
    #[snafu(display("unknown scenario '{raw}'"))]
    UnknownScenario { stage: &'static str, raw: String },
    #[snafu(display("unknown argument '{raw}'"))]
    UnknownArgument { stage: &'static str, raw: String },
    #[snafu(display("storage validation failed: {source}"))]
    StorageValidation {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("sqlite query failed: {source}"))]
    SqliteQuery {
        stage: &'static str,
        source: sqlx::Error,
    },
    #[snafu(display("scenario '{scenario}' failed: {reason}"))]
    ScenarioFailed {
        stage: &'static str,
        scenario: &'static str,
        reason: String,
    },
    #[snafu(display("file operation failed at '{path}': {source}"))]
    FileIo {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
}

type RunnerResult<T> = Result<T, RunnerError>;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    if let Err(error) = run().await {
        println!("runner_ok=false");
        eprintln!("runner_error={error}");
        std::process::exit(1);
    }
}

async fn run() -> RunnerResult<()> {
    let args = parse_args(env::args().skip(1))?;
    let db_path = args.db_path.as_deref().unwrap_or(MEMORY_DATABASE);
    println!("scenario={}", args.scenario.name());
    println!("db_path={db_path}");

    match args.scenario {
        Scenario::IdRoundtrip => run_id_roundtrip(),
        Scenario::IdInvalid => run_id_invalid(),
        Scenario::ConversationIdentity => run_conversation_identity(),
        Scenario::SchemaInit => run_schema_init(db_path).await,
        Scenario::SummaryMerge => run_summary_merge(db_path).await,
        Scenario::MessageOrder => run_message_order(db_path).await,
        Scenario::ParticipantGuard => run_participant_guard(db_path).await,
        Scenario::ContactUpsert => run_contact_upsert(db_path).await,
        Scenario::EmailLookup => run_email_lookup(db_path).await,
        Scenario::ChangeFeed => run_change_feed(db_path).await,
        Scenario::All => run_all(db_path).await,
    }
}

fn parse_args(args: impl IntoIterator<Item = String>) -> RunnerResult<RunnerArgs> {
    let mut scenario = None;
    let mut db_path = None;
    let mut pending = args.into_iter();

    while let Some(argument) = pending.next() {
        match argument.as_str() {
            "--scenario" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-scenario-value",
                    arg: "--scenario",
                })?;

                let parsed = Scenario::parse(&value).context(UnknownScenarioSnafu {
                    stage: "parse-args-scenario",
                    raw: value,
                })?;
                scenario = Some(parsed);
            }
            "--db" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-db-value",
                    arg: "--db",
                })?;
                db_path = Some(value);
            }
            _ => {
                return UnknownArgumentSnafu {
                    stage: "parse-args",
                    raw: argument,
                }
                .fail();
            }
        }
    }

    Ok(RunnerArgs {
        scenario: scenario.context(MissingScenarioSnafu {
            stage: "parse-args-scenario-required",
        })?,
        db_path,
    })
}

async fn run_all(db_path: &str) -> RunnerResult<()> {
    run_id_roundtrip()?;
    run_id_invalid()?;
    run_conversation_identity()?;
    run_schema_init(db_path).await?;
    run_summary_merge(db_path).await?;
    run_message_order(db_path).await?;
    run_participant_guard(db_path).await?;
    run_contact_upsert(db_path).await?;
    run_email_lookup(db_path).await?;
    run_change_feed(db_path).await?;

    println!("all_passed=true");
    Ok(())
}

fn run_id_roundtrip() -> RunnerResult<()> {
    let message_id = MessageId::new_v7();
    let decoded = message_id
        .to_string()
        .parse::<MessageId>()
        .context(StorageValidationSnafu {
            stage: "scenario-id-roundtrip-message",
        })?;
    ensure_scenario(
        decoded == message_id,
        "scenario-id-roundtrip-message-compare",
        "id_roundtrip",
        "message id parse/format roundtrip mismatch",
    )?;

    let conversation_id = derive_conversation_id(&user("u1")?, &user("u2")?).context(
        StorageValidationSnafu {
            stage: "scenario-id-roundtrip-derive",
        },
    )?;
    let decoded = conversation_id
        .to_string()
        .parse::<ConversationId>()
        .context(StorageValidationSnafu {
            stage: "scenario-id-roundtrip-conversation",
        })?;
    ensure_scenario(
        decoded == conversation_id,
        "scenario-id-roundtrip-conversation-compare",
        "id_roundtrip",
        "conversation id parse/format roundtrip mismatch",
    )?;

    println!("message_id_roundtrip=true");
    println!("conversation_id_roundtrip=true");
    println!("runner_ok=true");
    Ok(())
}

fn run_id_invalid() -> RunnerResult<()> {
    let invalid_id_error = is_rejected::<MessageId>("not-a-valid-uuid")
        && is_rejected::<UserId>("")
        && is_rejected::<UserId>("has_separator")
        && is_rejected::<UserId>("has space")
        && is_rejected::<ConversationId>("u1_u2")
        && is_rejected::<ConversationId>("u1");

    println!("invalid_id_error={invalid_id_error}");
    ensure_scenario(
        invalid_id_error,
        "scenario-id-invalid",
        "id_invalid",
        "at least one id type accepted malformed input",
    )?;

    println!("runner_ok=true");
    Ok(())
}

fn run_conversation_identity() -> RunnerResult<()> {
    let (u1, u2) = (user("u1")?, user("u2")?);
    let forward = derive_conversation_id(&u1, &u2).context(StorageValidationSnafu {
        stage: "scenario-identity-forward",
    })?;
    let backward = derive_conversation_id(&u2, &u1).context(StorageValidationSnafu {
        stage: "scenario-identity-backward",
    })?;
    let self_rejected = matches!(
        derive_conversation_id(&u1, &u1),
        Err(ref error) if error.kind() == StorageErrorKind::InvalidParticipants
    );

    println!("conversation_id={forward}");
    println!("symmetric={}", forward == backward);
    println!("self_rejected={self_rejected}");

    ensure_scenario(
        forward == backward && forward.as_str() == "u2_u1",
        "scenario-identity-assert-symmetric",
        "conversation_identity",
        format!("expected u2_u1 both ways but got {forward} and {backward}"),
    )?;
    ensure_scenario(
        self_rejected,
        "scenario-identity-assert-self",
        "conversation_identity",
        "self conversation was accepted",
    )?;

    println!("runner_ok=true");
    Ok(())
}

async fn run_schema_init(db_path: &str) -> RunnerResult<()> {
    let storage = open_fresh(db_path, "scenario-schema-init-open").await?;
    let pool = storage.pool();

    let discovered_tables = sqlx::query_scalar::<_, String>(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name IN ('users', 'contacts', 'conversations', 'messages')",
    )
    .fetch_all(pool)
    .await
    .context(SqliteQuerySnafu {
        stage: "scenario-schema-init-list-tables",
    })?;

    let available_tables: HashSet<String> = discovered_tables.into_iter().collect();
    let schema_ok = ["users", "contacts", "conversations", "messages"]
        .iter()
        .all(|table_name| available_tables.contains(*table_name));

    let journal_mode = sqlx::query_scalar::<_, String>("PRAGMA journal_mode;")
        .fetch_one(pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "scenario-schema-init-journal-mode",
        })?
        .to_lowercase();
    let foreign_keys = sqlx::query_scalar::<_, i64>("PRAGMA foreign_keys;")
        .fetch_one(pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "scenario-schema-init-foreign-keys",
        })?;

    println!("schema_ok={schema_ok}");
    println!("journal_mode={journal_mode}");
    println!("foreign_keys={foreign_keys}");

    ensure_scenario(
        schema_ok,
        "scenario-schema-init-assert-schema",
        "schema_init",
        "expected migration tables are missing",
    )?;
    // In-memory databases cannot switch to WAL.
    ensure_scenario(
        db_path == MEMORY_DATABASE || journal_mode == "wal",
        "scenario-schema-init-assert-journal-mode",
        "schema_init",
        format!("expected journal_mode=wal but was {journal_mode}"),
    )?;
    ensure_scenario(
        foreign_keys == 1,
        "scenario-schema-init-assert-foreign-keys",
        "schema_init",
        format!("expected foreign_keys=1 but was {foreign_keys}"),
    )?;

    println!("runner_ok=true");
    Ok(())
}

async fn run_summary_merge(db_path: &str) -> RunnerResult<()> {
    let storage = open_fresh(db_path, "scenario-summary-merge-open").await?;
    let (u1, u2) = (user("u1")?, user("u2")?);
    let conversation_id = conversation(&u1, &u2)?;

    storage
        .upsert_summary(
            &conversation_id,
            SummaryUpdate::for_participants(u1.clone(), u2.clone())
                .with_last_message("hello")
                .touched_at(100),
        )
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-summary-merge-create",
        })?;
    let merged = storage
        .upsert_summary(&conversation_id, SummaryUpdate::default().touched_at(200))
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-summary-merge-touch",
        })?;

    let text_kept = merged.last_message_text.as_deref() == Some("hello");
    let time_updated = merged.last_updated_at_unix_millis == Some(200);
    println!("last_message_kept={text_kept}");
    println!("last_updated_at_changed={time_updated}");

    ensure_scenario(
        text_kept && time_updated,
        "scenario-summary-merge-assert",
        "summary_merge",
        format!("unexpected merged summary: {merged:?}"),
    )?;

    println!("runner_ok=true");
    Ok(())
}

async fn run_message_order(db_path: &str) -> RunnerResult<()> {
    let storage = open_fresh(db_path, "scenario-message-order-open").await?;
    let (u1, u2) = (user("u1")?, user("u2")?);
    let conversation_id = conversation(&u1, &u2)?;

    for (sender, receiver, text) in [(&u1, &u2, "one"), (&u2, &u1, "two"), (&u1, &u2, "three")] {
        storage
            .append_message(
                &conversation_id,
                NewMessage::new(sender.clone(), receiver.clone(), text),
            )
            .await
            .context(StorageValidationSnafu {
                stage: "scenario-message-order-append",
            })?;
    }

    let messages = storage
        .list_messages(&conversation_id)
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-message-order-list",
        })?;
    let texts = messages
        .iter()
        .map(|message| message.text.as_str())
        .collect::<Vec<_>>();
    let newest_first = texts == ["three", "two", "one"];
    let strictly_increasing = messages
        .windows(2)
        .all(|pair| pair[0].created_at_unix_millis > pair[1].created_at_unix_millis);

    println!("message_count={}", messages.len());
    println!("newest_first={newest_first}");
    println!("created_at_strictly_increasing={strictly_increasing}");

    ensure_scenario(
        newest_first && strictly_increasing,
        "scenario-message-order-assert",
        "message_order",
        format!("unexpected message order: {texts:?}"),
    )?;

    println!("runner_ok=true");
    Ok(())
}

async fn run_participant_guard(db_path: &str) -> RunnerResult<()> {
    let storage = open_fresh(db_path, "scenario-participant-guard-open").await?;
    let (u1, u2, u3) = (user("u1")?, user("u2")?, user("u3")?);
    let conversation_id = conversation(&u1, &u2)?;

    let rejected = matches!(
        storage
            .append_message(&conversation_id, NewMessage::new(u1, u3, "misdirected"))
            .await,
        Err(ref error) if error.kind() == StorageErrorKind::InvalidParticipants
    );
    let remaining = storage
        .list_messages(&conversation_id)
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-participant-guard-list",
        })?
        .len();

    println!("misdirected_rejected={rejected}");
    println!("message_count={remaining}");

    ensure_scenario(
        rejected && remaining == 0,
        "scenario-participant-guard-assert",
        "participant_guard",
        "message addressed to another pair was stored",
    )?;

    println!("runner_ok=true");
    Ok(())
}

async fn run_contact_upsert(db_path: &str) -> RunnerResult<()> {
    let storage = open_fresh(db_path, "scenario-contact-upsert-open").await?;
    let (u1, u2) = (user("u1")?, user("u2")?);

    storage
        .register_user(&u1, "one@example.com")
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-contact-upsert-register-owner",
        })?;
    let contact = storage
        .register_user(&u2, "two@example.com")
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-contact-upsert-register-contact",
        })?;

    for _ in 0..2 {
        storage
            .upsert_contact(&u1, &contact)
            .await
            .context(StorageValidationSnafu {
                stage: "scenario-contact-upsert-write",
            })?;
    }
    let contacts = storage
        .list_contacts(&u1)
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-contact-upsert-list",
        })?;

    let owner = storage
        .get_user(&u1)
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-contact-upsert-owner",
        })?;
    let self_rejected = match owner {
        Some(owner) => matches!(
            storage.upsert_contact(&u1, &owner).await,
            Err(ref error) if error.kind() == StorageErrorKind::SelfReference
        ),
        None => false,
    };

    println!("contact_count={}", contacts.len());
    println!("self_rejected={self_rejected}");

    ensure_scenario(
        contacts.len() == 1 && self_rejected,
        "scenario-contact-upsert-assert",
        "contact_upsert",
        format!("unexpected contacts: {contacts:?}"),
    )?;

    println!("runner_ok=true");
    Ok(())
}

async fn run_email_lookup(db_path: &str) -> RunnerResult<()> {
    let storage = open_fresh(db_path, "scenario-email-lookup-open").await?;
    let u1 = user("u1")?;

    storage
        .register_user(&u1, " Mixed@Example.COM ")
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-email-lookup-register",
        })?;
    let found = storage
        .find_users_by_email("mixed@example.com")
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-email-lookup-find",
        })?;
    let missing = storage
        .find_users_by_email("nobody@example.com")
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-email-lookup-missing",
        })?;

    let matched = found.first().map(|record| &record.id) == Some(&u1);
    println!("email_matched={matched}");
    println!("unknown_email_empty={}", missing.is_empty());

    ensure_scenario(
        matched && missing.is_empty(),
        "scenario-email-lookup-assert",
        "email_lookup",
        format!("unexpected lookup result: {found:?}"),
    )?;

    println!("runner_ok=true");
    Ok(())
}

async fn run_change_feed(db_path: &str) -> RunnerResult<()> {
    let storage = open_fresh(db_path, "scenario-change-feed-open").await?;
    let (u1, u2) = (user("u1")?, user("u2")?);
    let conversation_id = conversation(&u1, &u2)?;
    let mut changes = storage.subscribe_changes();

    storage
        .append_message(&conversation_id, NewMessage::new(u1, u2, "ping"))
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-change-feed-append",
        })?;

    let received = tokio::time::timeout(Duration::from_secs(1), changes.recv()).await;
    let observed = matches!(
        received,
        Ok(Ok(StoreChange::Message { conversation_id: ref id })) if *id == conversation_id
    );
    println!("message_change_observed={observed}");

    ensure_scenario(
        observed,
        "scenario-change-feed-assert",
        "change_feed",
        format!("unexpected change feed result: {received:?}"),
    )?;

    println!("runner_ok=true");
    Ok(())
}

async fn open_fresh(db_path: &str, stage: &'static str) -> RunnerResult<SqliteStorage> {
    if db_path != MEMORY_DATABASE {
        reset_sqlite_files(db_path)?;
    }
    SqliteStorage::open(db_path)
        .await
        .context(StorageValidationSnafu { stage })
}

fn user(raw: &str) -> RunnerResult<UserId> {
    UserId::parse(raw).context(StorageValidationSnafu {
        stage: "scenario-parse-user-id",
    })
}

fn conversation(left: &UserId, right: &UserId) -> RunnerResult<ConversationId> {
    derive_conversation_id(left, right).context(StorageValidationSnafu {
        stage: "scenario-derive-conversation-id",
    })
}

fn ensure_scenario(
    condition: bool,
    stage: &'static str,
    scenario: &'static str,
    reason: impl Into<String>,
) -> RunnerResult<()> {
    if condition {
        return Ok(());
    }
    ScenarioFailedSnafu {
        stage,
        scenario,
        reason: reason.into(),
    }
    .fail()
}

fn reset_sqlite_files(db_path: &str) -> RunnerResult<()> {
    remove_file_if_exists(Path::new(db_path), "scenario-reset-sqlite-db")?;
    let wal_path = format!("{db_path}-wal");
    remove_file_if_exists(Path::new(&wal_path), "scenario-reset-sqlite-wal")?;
    let shm_path = format!("{db_path}-shm");
    remove_file_if_exists(Path::new(&shm_path), "scenario-reset-sqlite-shm")?;
    Ok(())
}

fn remove_file_if_exists(path: &Path, stage: &'static str) -> RunnerResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(source) if source.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(RunnerError::FileIo {
            stage,
            path: path.display().to_string(),
            source,
        }),
    }
}

fn is_rejected<T>(raw: &str) -> bool
where
    T: FromStr<Err = StorageError>,
{
    raw.parse::<T>()
        .is_err_and(|error| error.kind() == StorageErrorKind::Validation)
}
