//! PostgreSQL persistence for shelfwatch: durable crawl tasks and
//! classified error records behind the [`shelfwatch_core::TaskStore`]
//! trait.

pub mod config;
pub mod database;
pub mod task_repository;

pub use config::{AppConfig, DatabaseConfig};
pub use database::Database;
pub use task_repository::PgTaskStore;
