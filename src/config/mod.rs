//! Configuration management for database and application settings.

/// Database configuration and connection management
pub mod database;

/// Application settings loaded from `topsheet.toml` and the environment
pub mod settings;
