use sqlx::sqlite::SqlitePoolOptions;

/// A SqliteStore backed by a fresh in-memory database with migrations applied
pub async fn test_sqlite_store() -> super::SqliteStore {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory SQLite pool");

    crate::db::run_migrations(&pool)
        .await
        .expect("Failed to run migrations");

    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&pool)
        .await
        .expect("Failed to enable foreign keys");

    super::SqliteStore::new(pool)
}
