mod connect;
mod error;
mod ident;
pub mod offsets;
pub mod source;

pub use connect::connect_postgres;
pub use error::{PgError, PgResult};
pub use ident::TableName;
pub use offsets::PostgresOffsetStore;
pub use source::{ChangeRecord, PgChangeSource};
