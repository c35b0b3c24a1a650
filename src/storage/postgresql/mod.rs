pub mod postgresql;

pub use postgresql::PostgresStore;
