//! Collector implementations: HTTP API, source database, web-RPA.

pub mod api;
pub mod database;
pub mod rpa;
pub mod session;

pub use api::ApiCollector;
pub use database::DatabaseCollector;
pub use rpa::RpaCollector;
pub use session::SessionCache;
