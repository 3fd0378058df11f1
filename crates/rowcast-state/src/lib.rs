mod error;
mod sqlite;

pub use error::{StateError, StateResult};
pub use sqlite::SqliteOffsetStore;
