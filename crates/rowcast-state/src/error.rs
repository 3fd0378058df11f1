use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("offset store lock poisoned")]
    Poisoned,

    #[error("invalid offset for source '{source_id}': {message}")]
    InvalidOffset { source_id: String, message: String },
}

pub type StateResult<T> = Result<T, StateError>;

impl From<StateError> for rowcast_core::Error {
    fn from(err: StateError) -> Self {
        rowcast_core::Error::OffsetStore(err.to_string())
    }
}
