pub mod error;
pub mod postgresql;
pub mod store;

pub use error::{ErrorClass, StorageError};
pub use postgresql::PostgresStore;
pub use store::SeriesStore;
