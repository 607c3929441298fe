use snafu::Snafu;

const SQLITE_PERM: i32 = 3;
const SQLITE_READONLY: i32 = 8;
const SQLITE_CONSTRAINT: i32 = 19;
const SQLITE_AUTH: i32 = 23;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    #[snafu(display("storage entity '{entity}' with id '{id}' was not found"))]
    NotFound {
        stage: &'static str,
        entity: &'static str,
        id: String,
    },
    #[snafu(display("invalid {field}: {details}"))]
    Validation {
        stage: &'static str,
        field: &'static str,
        details: String,
    },
    #[snafu(display("user '{user_id}' cannot reference itself"))]
    SelfReference {
        stage: &'static str,
        user_id: String,
    },
    #[snafu(display("invalid conversation participants: {details}"))]
    InvalidParticipants {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("user '{user_id}' is not allowed to {action}"))]
    PermissionDenied {
        stage: &'static str,
        user_id: String,
        action: String,
    },
    #[snafu(display("storage id '{raw}' is invalid for {id_type}"))]
    InvalidId {
        stage: &'static str,
        id_type: &'static str,
        raw: String,
        source: uuid::Error,
    },
    #[snafu(display("storage id '{raw}' is malformed for {id_type}: {reason}"))]
    MalformedId {
        stage: &'static str,
        id_type: &'static str,
        raw: String,
        reason: &'static str,
    },
    #[snafu(display("storage invariant violation: {details}"))]
    InvariantViolation {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("failed to create sqlite directory at {path}"))]
    CreateSqliteDirectory {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("failed to parse sqlite connection URL '{database_url}'"))]
    SqliteConnectOptions {
        stage: &'static str,
        database_url: String,
        source: sqlx::Error,
    },
    #[snafu(display("failed to connect sqlite database '{database_url}'"))]
    SqliteConnect {
        stage: &'static str,
        database_url: String,
        source: sqlx::Error,
    },
    #[snafu(display("failed to run sqlite migrations"))]
    SqliteMigrate {
        stage: &'static str,
        source: sqlx::migrate::MigrateError,
    },
    #[snafu(display("sqlite query failed at {stage}: {source}"))]
    SqliteQuery {
        stage: &'static str,
        source: sqlx::Error,
    },
    #[snafu(display("store change feed closed at {stage}"))]
    ChangeFeedClosed { stage: &'static str },
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Caller-facing classification of a [`StorageError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageErrorKind {
    Validation,
    NotFound,
    SelfReference,
    InvalidParticipants,
    /// Transient transport failure; the caller may retry.
    StoreUnavailable,
    Permission,
    Internal,
}

impl StorageError {
    pub fn kind(&self) -> StorageErrorKind {
        match self {
            Self::NotFound { .. } => StorageErrorKind::NotFound,
            Self::Validation { .. } | Self::InvalidId { .. } | Self::MalformedId { .. } => {
                StorageErrorKind::Validation
            }
            Self::SelfReference { .. } => StorageErrorKind::SelfReference,
            Self::InvalidParticipants { .. } => StorageErrorKind::InvalidParticipants,
            Self::PermissionDenied { .. } => StorageErrorKind::Permission,
            Self::SqliteConnect { source, .. } | Self::SqliteQuery { source, .. } => {
                classify_driver_error(source)
            }
            Self::ChangeFeedClosed { .. } => StorageErrorKind::StoreUnavailable,
            Self::InvariantViolation { .. }
            | Self::CreateSqliteDirectory { .. }
            | Self::SqliteConnectOptions { .. }
            | Self::SqliteMigrate { .. } => StorageErrorKind::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == StorageErrorKind::StoreUnavailable
    }

    pub fn stage(&self) -> &'static str {
        match self {
            Self::NotFound { stage, .. }
            | Self::Validation { stage, .. }
            | Self::SelfReference { stage, .. }
            | Self::InvalidParticipants { stage, .. }
            | Self::PermissionDenied { stage, .. }
            | Self::InvalidId { stage, .. }
            | Self::MalformedId { stage, .. }
            | Self::InvariantViolation { stage, .. }
            | Self::CreateSqliteDirectory { stage, .. }
            | Self::SqliteConnectOptions { stage, .. }
            | Self::SqliteConnect { stage, .. }
            | Self::SqliteMigrate { stage, .. }
            | Self::SqliteQuery { stage, .. }
            | Self::ChangeFeedClosed { stage } => stage,
        }
    }
}

fn classify_driver_error(source: &sqlx::Error) -> StorageErrorKind {
    // SQLite reports extended result codes; the low byte is the primary code.
    let primary_code = source
        .as_database_error()
        .and_then(|error| error.code())
        .and_then(|code| code.parse::<i32>().ok())
        .map(|code| code & 0xff);

    match primary_code {
        Some(SQLITE_PERM | SQLITE_READONLY | SQLITE_AUTH) => StorageErrorKind::Permission,
        Some(SQLITE_CONSTRAINT) => StorageErrorKind::Validation,
        _ => StorageErrorKind::StoreUnavailable,
    }
}
