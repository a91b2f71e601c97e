//! Shared Postgres plumbing: migrations and error mapping.

use sqlx::PgPool;

/// Apply the embedded schema migrations.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

/// Whether an error is a Postgres unique-constraint violation (code 23505),
/// optionally narrowed to constraints whose name contains `fragment`.
pub(crate) fn is_unique_violation(err: &sqlx::Error, fragment: Option<&str>) -> bool {
    let sqlx::Error::Database(db) = err else {
        return false;
    };
    if db.code().as_deref() != Some("23505") {
        return false;
    }
    match fragment {
        Some(fragment) => db
            .constraint()
            .is_some_and(|name| name.contains(fragment)),
        None => true,
    }
}

/// Render a storage-layer failure for the transient `Unavailable` bucket.
///
/// Unique violations and the like are matched explicitly at call sites
/// before this runs; everything that falls through here (connection loss,
/// pool exhaustion, timeouts, unexpected rows) is something the caller
/// should treat as retryable.
pub(crate) fn unavailable(operation: &str, err: sqlx::Error) -> String {
    format!("{operation}: {err}")
}
