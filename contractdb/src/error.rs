use thiserror::Error;

#[derive(Error, Debug)]
pub enum ContractDbError {
    #[error("Compile error: {0}")]
    Compile(String),

    #[error("Permissions error: {0}")]
    Permissions(String),

    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("Invalid patch: {0}")]
    InvalidPatch(String),

    #[error("Database timeout: {0}")]
    DatabaseTimeout(String),

    #[error("No such element: {0}")]
    NoElement(String),

    #[error("Element already exists: {0}")]
    ElementAlreadyExists(String),

    #[error("Invalid slug: {0}")]
    InvalidSlug(String),

    #[error("Invalid version: {0}")]
    InvalidVersion(String),

    #[error("Invalid id: {0}")]
    InvalidId(String),

    #[error("Invalid limit: {0}")]
    InvalidLimit(String),

    #[error("Invalid session: {0}")]
    InvalidSession(String),

    #[error("Unknown contract type: {0}")]
    UnknownType(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl ContractDbError {
    /// Errors the caller is expected to run into during normal operation.
    /// These are reported back without being logged as bugs.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            ContractDbError::Permissions(_)
                | ContractDbError::SchemaMismatch(_)
                | ContractDbError::InvalidPatch(_)
                | ContractDbError::NoElement(_)
                | ContractDbError::ElementAlreadyExists(_)
        )
    }
}

impl From<regex::Error> for ContractDbError {
    fn from(e: regex::Error) -> Self {
        ContractDbError::Compile(format!("invalid regular expression: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, ContractDbError>;
