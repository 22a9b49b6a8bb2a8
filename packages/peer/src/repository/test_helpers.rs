use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

/// Fresh in-memory SQLite pool with all migrations applied.
pub async fn test_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory SQLite pool");

    crate::db::run_migrations(&pool)
        .await
        .expect("Failed to run migrations");

    pool
}

/// Create a fresh ChatRepository backed by an in-memory SQLite database.
/// Each call returns an isolated database.
pub async fn test_repository() -> super::ChatRepository {
    super::ChatRepository::new(test_pool().await)
}
