//! Database configuration module.
//!
//! This module handles `SQLite` database connection and table creation using `SeaORM`.
//! It provides functions for establishing database connections and creating all necessary
//! tables based on the entity definitions. The module uses `SeaORM`'s
//! `Schema::create_table_from_entity` method to automatically generate SQL statements from
//! the entity models, ensuring that the database schema matches the Rust struct definitions
//! without requiring manual SQL.

use crate::entities::{
    Account, Actual, Budget, Collaborator, Event, Fringe, Group, Markup, MarkupChild, Subaccount,
    SubaccountFringe,
};
use crate::errors::Result;
use sea_orm::{ConnectionTrait, Database, DatabaseConnection, Schema};

/// Gets the database URL from environment variable or returns default `SQLite` path.
///
/// This function looks for `DATABASE_URL` in the environment and falls back to
/// a default local `SQLite` file if not found.
#[must_use]
pub fn get_database_url() -> String {
    std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://data/topsheet.sqlite".to_string())
}

/// Establishes a connection to the `SQLite` database using the `DATABASE_URL`
/// environment variable.
///
/// Falls back to a default local `SQLite` file if no environment variable is set.
pub async fn create_connection() -> Result<DatabaseConnection> {
    Database::connect(get_database_url()).await.map_err(Into::into)
}

/// Creates all necessary database tables using `SeaORM`'s schema generation from
/// entity definitions.
///
/// This function uses the `DeriveEntityModel` macros to automatically generate proper
/// SQL statements for table creation, ensuring the database schema matches the Rust
/// struct definitions.
pub async fn create_tables(db: &DatabaseConnection) -> Result<()> {
    let builder = db.get_database_backend();
    let schema = Schema::new(builder);

    db.execute(builder.build(&schema.create_table_from_entity(Budget)))
        .await?;
    db.execute(builder.build(&schema.create_table_from_entity(Account)))
        .await?;
    db.execute(builder.build(&schema.create_table_from_entity(Subaccount)))
        .await?;
    db.execute(builder.build(&schema.create_table_from_entity(Fringe)))
        .await?;
    db.execute(builder.build(&schema.create_table_from_entity(SubaccountFringe)))
        .await?;
    db.execute(builder.build(&schema.create_table_from_entity(Markup)))
        .await?;
    db.execute(builder.build(&schema.create_table_from_entity(MarkupChild)))
        .await?;
    db.execute(builder.build(&schema.create_table_from_entity(Group)))
        .await?;
    db.execute(builder.build(&schema.create_table_from_entity(Actual)))
        .await?;
    db.execute(builder.build(&schema.create_table_from_entity(Collaborator)))
        .await?;
    db.execute(builder.build(&schema.create_table_from_entity(Event)))
        .await?;

    Ok(())
}
