// Pipeline storage: the SQLite warehouse

pub mod sqlite;

pub use sqlite::{LoadBatch, SqliteStore, StagedStore, TableCount};
