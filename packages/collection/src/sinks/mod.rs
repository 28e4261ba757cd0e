//! Sink implementations: JSON files, PostgreSQL tables, MongoDB
//! collections.

pub mod file;
pub mod mongodb;
pub mod postgres;

pub use file::FileSink;
pub use mongodb::MongoSink;
pub use postgres::PostgresSink;
