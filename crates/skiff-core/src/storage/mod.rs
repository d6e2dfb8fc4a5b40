//! Storage layer: SQLite pool, migrations and small key/value settings

pub mod database;
pub mod migrations;
pub mod settings;

pub use database::{Database, default_database_path};
pub use settings::SettingsRepository;
