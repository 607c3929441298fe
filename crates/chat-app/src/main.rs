use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use pairchat::{ChatClient, ChatError, ChatListRow, ChatSession, SettingsStore};
use pairchat_storage::{LiveEvent, StorageError, UserId};
use snafu::{OptionExt, ResultExt, Snafu};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: pairchat [--config <path>] <command> --user <id> [options]

commands:
  register     --user <id> --email <email>
  add-contact  --user <id> --email <email>
  contacts     --user <id>
  send         --user <id> --to <id> --text <text>
  messages     --user <id> --with <id>
  chats        --user <id>
  watch-chats  --user <id>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Register,
    AddContact,
    Contacts,
    Send,
    Messages,
    Chats,
    WatchChats,
}

impl Command {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "register" => Some(Self::Register),
            "add-contact" => Some(Self::AddContact),
            "contacts" => Some(Self::Contacts),
            "send" => Some(Self::Send),
            "messages" => Some(Self::Messages),
            "chats" => Some(Self::Chats),
            "watch-chats" => Some(Self::WatchChats),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct CliArgs {
    config_path: Option<PathBuf>,
    command: Option<Command>,
    user: Option<String>,
    email: Option<String>,
    to: Option<String>,
    with: Option<String>,
    text: Option<String>,
}

#[derive(Debug, Snafu)]
enum CliError {
    #[snafu(display("missing command\n\n{USAGE}"))]
    MissingCommand { stage: &'static str },
    #[snafu(display("unknown command '{raw}'\n\n{USAGE}"))]
    UnknownCommand { stage: &'static str, raw: String },
    #[snafu(display("unknown argument '{raw}'\n\n{USAGE}"))]
    UnknownArgument { stage: &'static str, raw: String },
    #[snafu(display("missing value for argument '{arg}'"))]
    MissingArgumentValue {
        stage: &'static str,
        arg: &'static str,
    },
    #[snafu(display("missing required argument '{arg}'"))]
    MissingArgument {
        stage: &'static str,
        arg: &'static str,
    },
    #[snafu(display("invalid user id: {source}"))]
    InvalidUser {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("{source}"))]
    Chat {
        stage: &'static str,
        source: ChatError,
    },
    #[snafu(display("failed to listen for ctrl-c: {source}"))]
    Signal {
        stage: &'static str,
        source: std::io::Error,
    },
}

type CliResult<T> = Result<T, CliError>;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> CliResult<()> {
    let args = parse_args(env::args().skip(1))?;

    let settings_store = match &args.config_path {
        Some(path) => SettingsStore::new(path.clone()),
        None => SettingsStore::load(),
    };
    let settings = settings_store.settings();
    init_tracing(&settings.log_filter);

    let command = args.command.context(MissingCommandSnafu {
        stage: "run-command-required",
    })?;
    let user_id = parse_user(required(&args.user, "--user")?)?;

    let client = ChatClient::open(Arc::clone(&settings))
        .await
        .context(ChatSnafu {
            stage: "run-open-client",
        })?;

    match command {
        Command::Register => {
            let record = client
                .register_user(&user_id, required(&args.email, "--email")?)
                .await
                .context(ChatSnafu {
                    stage: "run-register",
                })?;
            println!("user_id={}", record.id);
            println!("email={}", record.email);
        }
        Command::AddContact => {
            let session = client.session(user_id);
            let record = session
                .add_contact(required(&args.email, "--email")?)
                .await
                .context(ChatSnafu {
                    stage: "run-add-contact",
                })?;
            println!("contact_user_id={}", record.contact_user_id);
            println!("email={}", record.email);
        }
        Command::Contacts => {
            let session = client.session(user_id);
            let contacts = session.contacts().await.context(ChatSnafu {
                stage: "run-contacts",
            })?;
            println!("contact_count={}", contacts.len());
            for contact in contacts {
                println!("contact={} email={}", contact.contact_user_id, contact.email);
            }
        }
        Command::Send => {
            let session = client.session(user_id);
            let receiver_id = parse_user(required(&args.to, "--to")?)?;
            let record = session
                .send_to(&receiver_id, required(&args.text, "--text")?)
                .await
                .context(ChatSnafu { stage: "run-send" })?;
            println!("conversation_id={}", record.conversation_id);
            println!("message_id={}", record.id);
            println!("created_at={}", record.created_at_unix_millis);
        }
        Command::Messages => {
            let session = client.session(user_id);
            let other = parse_user(required(&args.with, "--with")?)?;
            let conversation_id = session.conversation_with(&other).context(ChatSnafu {
                stage: "run-messages-conversation",
            })?;
            let messages = session.messages(&conversation_id).await.context(ChatSnafu {
                stage: "run-messages",
            })?;
            println!("conversation_id={conversation_id}");
            println!("message_count={}", messages.len());
            for message in messages {
                println!(
                    "message={} sender={} created_at={} text={}",
                    message.id, message.sender_id, message.created_at_unix_millis, message.text
                );
            }
        }
        Command::Chats => {
            let session = client.session(user_id);
            let rows = session.chat_list().await.context(ChatSnafu {
                stage: "run-chats",
            })?;
            print_rows(&rows);
        }
        Command::WatchChats => watch_chats(client.session(user_id)).await?,
    }

    Ok(())
}

async fn watch_chats(session: ChatSession) -> CliResult<()> {
    let mut chat_list = session.subscribe_chat_list();

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context(SignalSnafu { stage: "watch-chats-signal" })?;
                chat_list.cancel();
                return Ok(());
            }
            event = chat_list.recv() => match event {
                Some(LiveEvent::Snapshot(rows)) => print_rows(&rows),
                Some(LiveEvent::Failed(source)) => {
                    return Err(ChatError::Storage { stage: "watch-chats-event", source })
                        .context(ChatSnafu { stage: "watch-chats" });
                }
                None => return Ok(()),
            },
        }
    }
}

fn print_rows(rows: &[ChatListRow]) {
    println!("chat_count={}", rows.len());
    for row in rows {
        println!(
            "chat={} other_user={} email={} last_message={}",
            row.conversation_id, row.other_user_id, row.other_user_email, row.last_message
        );
    }
}

fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn parse_args(args: impl IntoIterator<Item = String>) -> CliResult<CliArgs> {
    let mut parsed = CliArgs::default();
    let mut pending = args.into_iter();

    while let Some(argument) = pending.next() {
        let (slot, flag) = match argument.as_str() {
            "--config" => {
                let value = next_value(&mut pending, "--config")?;
                parsed.config_path = Some(PathBuf::from(value));
                continue;
            }
            "--user" => (&mut parsed.user, "--user"),
            "--email" => (&mut parsed.email, "--email"),
            "--to" => (&mut parsed.to, "--to"),
            "--with" => (&mut parsed.with, "--with"),
            "--text" => (&mut parsed.text, "--text"),
            raw if raw.starts_with("--") => {
                return UnknownArgumentSnafu {
                    stage: "parse-args",
                    raw: argument,
                }
                .fail();
            }
            raw if parsed.command.is_none() => {
                parsed.command = Some(Command::parse(raw).context(UnknownCommandSnafu {
                    stage: "parse-args-command",
                    raw: argument.clone(),
                })?);
                continue;
            }
            _ => {
                return UnknownArgumentSnafu {
                    stage: "parse-args",
                    raw: argument,
                }
                .fail();
            }
        };

        *slot = Some(next_value(&mut pending, flag)?);
    }

    Ok(parsed)
}

fn next_value(
    pending: &mut impl Iterator<Item = String>,
    arg: &'static str,
) -> CliResult<String> {
    pending.next().context(MissingArgumentValueSnafu {
        stage: "parse-args-value",
        arg,
    })
}

fn required<'a>(value: &'a Option<String>, arg: &'static str) -> CliResult<&'a str> {
    value.as_deref().context(MissingArgumentSnafu {
        stage: "required-argument",
        arg,
    })
}

fn parse_user(raw: &str) -> CliResult<UserId> {
    UserId::parse(raw).context(InvalidUserSnafu {
        stage: "parse-user-id",
    })
}
