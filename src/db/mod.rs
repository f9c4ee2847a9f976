mod models;

pub use models::*;

use anyhow::Result;
use serde::{de::DeserializeOwned, Serialize};
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;
use tracing::info;

pub type DbPool = SqlitePool;

/// Execute a SQL migration file, properly handling comments
async fn execute_sql(pool: &SqlitePool, sql: &str) -> Result<()> {
    // Comments go first so a ';' inside one never splits a statement
    let cleaned: String = sql.lines().map(strip_comment).collect::<Vec<_>>().join("\n");
    for statement in cleaned.split(';') {
        let trimmed = statement.trim();
        if !trimmed.is_empty() {
            sqlx::query(trimmed).execute(pool).await?;
        }
    }
    Ok(())
}

/// Drop a `--` comment from a line, ignoring dashes inside string literals
fn strip_comment(line: &str) -> &str {
    let mut in_string = false;
    let mut previous_dash = false;
    for (i, c) in line.char_indices() {
        match c {
            '\'' => {
                in_string = !in_string;
                previous_dash = false;
            }
            '-' if !in_string && previous_dash => return &line[..i - 1],
            '-' if !in_string => previous_dash = true,
            _ => previous_dash = false,
        }
    }
    line
}

pub async fn init(data_dir: &Path) -> Result<DbPool> {
    let db_path = data_dir.join("conveyor.db");
    let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

    info!("Initializing database at {}", db_path.display());

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&db_url)
        .await?;

    // Enable WAL mode for better concurrency
    sqlx::query("PRAGMA journal_mode = WAL")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous = NORMAL")
        .execute(&pool)
        .await?;

    configure_and_migrate(&pool).await?;

    info!("Database initialized successfully");
    Ok(pool)
}

/// In-memory database with the full schema.
///
/// A single connection that never expires, since every new connection to
/// `sqlite::memory:` would open an empty database.
pub async fn init_memory() -> Result<DbPool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;

    configure_and_migrate(&pool).await?;
    Ok(pool)
}

async fn configure_and_migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::query("PRAGMA foreign_keys = ON").execute(pool).await?;
    run_migrations(pool).await
}

async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    info!("Running database migrations...");

    // Migration 001: Initial schema
    execute_sql(pool, include_str!("../../migrations/001_initial.sql")).await?;

    Ok(())
}

/// Serialize a record into its stored JSON document
pub(crate) fn to_document<T: Serialize>(value: &T) -> Result<String, sqlx::Error> {
    serde_json::to_string(value).map_err(|e| sqlx::Error::Encode(Box::new(e)))
}

/// Parse a stored JSON document back into a record
pub(crate) fn from_document<T: DeserializeOwned>(document: &str) -> Result<T, sqlx::Error> {
    serde_json::from_str(document).map_err(|e| sqlx::Error::Decode(Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_init_memory_creates_schema() {
        let pool = init_memory().await.unwrap();
        let tables: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
                .fetch_all(&pool)
                .await
                .unwrap();
        let names: Vec<&str> = tables.iter().map(|(n,)| n.as_str()).collect();
        for expected in [
            "deployment_configs",
            "deployments",
            "jobs",
            "pipeline_configs",
            "pipeline_executions",
        ] {
            assert!(names.contains(&expected), "missing table {}", expected);
        }
    }

    #[tokio::test]
    async fn test_semicolons_inside_comments_do_not_split_statements() {
        let pool = init_memory().await.unwrap();
        let sql = "-- scratch table; used only here\n\
                   CREATE TABLE scratch (\n\
                       id TEXT PRIMARY KEY, -- key; never reused\n\
                       note TEXT NOT NULL DEFAULT 'a--b'\n\
                   );\n\
                   INSERT INTO scratch (id) VALUES ('one');";
        execute_sql(&pool, sql).await.unwrap();

        let (note,): (String,) = sqlx::query_as("SELECT note FROM scratch WHERE id = 'one'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(note, "a--b");
    }

    #[test]
    fn test_strip_comment_keeps_string_literals() {
        assert_eq!(strip_comment("-- whole line; gone"), "");
        assert_eq!(strip_comment("a INTEGER, -- trailing"), "a INTEGER, ");
        assert_eq!(strip_comment("b TEXT DEFAULT '--'"), "b TEXT DEFAULT '--'");
        assert_eq!(strip_comment("c INTEGER - 1"), "c INTEGER - 1");
    }

    #[tokio::test]
    async fn test_file_database_in_temp_dir() {
        let dir = tempfile::tempdir().unwrap();
        let pool = init(dir.path()).await.unwrap();
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM jobs")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
        assert!(dir.path().join("conveyor.db").exists());
    }
}
