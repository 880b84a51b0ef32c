//! SQLite connection pool and the bridge from async jobs to sync Diesel.
//!
//! Diesel's SQLite backend is synchronous; every query runs on the blocking
//! thread pool through [`run_blocking`].

use std::path::Path;
use std::time::Duration;

use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool};
use diesel::result::DatabaseErrorKind;

pub type DieselError = diesel::result::Error;

pub type R2D2Error = diesel::r2d2::PoolError;

pub type SqlitePool = Pool<ConnectionManager<SqliteConnection>>;

/// Each of the `request_concurrency` workers holds at most one connection.
const MAX_CONNECTIONS: u32 = 10;

/// Pragmas set on every new connection.
const CONNECTION_PRAGMAS: &[&str] = &[
    "PRAGMA journal_mode = WAL",
    "PRAGMA synchronous = NORMAL",
    "PRAGMA foreign_keys = ON",
    "PRAGMA busy_timeout = 30000",
    "PRAGMA cache_size = -32000",
    "PRAGMA temp_store = MEMORY",
];

#[derive(Debug, Clone, Copy)]
struct PragmaCustomizer;

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for PragmaCustomizer {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), diesel::r2d2::Error> {
        init_connection_pragmas(conn).map_err(diesel::r2d2::Error::QueryError)
    }
}

/// Pool over the database file at `db_path`.
pub fn create_diesel_pool(db_path: &Path) -> Result<SqlitePool, R2D2Error> {
    create_diesel_pool_from_url(&db_path.display().to_string())
}

/// Pool over a database URL; a leading `sqlite:` is accepted.
pub fn create_diesel_pool_from_url(database_url: &str) -> Result<SqlitePool, R2D2Error> {
    let path = database_url.strip_prefix("sqlite:").unwrap_or(database_url);

    Pool::builder()
        .max_size(MAX_CONNECTIONS)
        .connection_timeout(Duration::from_secs(30))
        .connection_customizer(Box::new(PragmaCustomizer))
        .build(ConnectionManager::<SqliteConnection>::new(path))
}

pub fn init_connection_pragmas(conn: &mut SqliteConnection) -> Result<(), DieselError> {
    for pragma in CONNECTION_PRAGMAS {
        diesel::sql_query(*pragma).execute(conn)?;
    }
    Ok(())
}

/// Pool checkout and task join failures, as a database error.
fn infrastructure_error(message: String) -> DieselError {
    DieselError::DatabaseError(DatabaseErrorKind::Unknown, Box::new(message))
}

/// Run `f` with a pooled connection on the blocking thread pool.
pub async fn run_blocking<F, T>(pool: SqlitePool, f: F) -> Result<T, DieselError>
where
    F: FnOnce(&mut SqliteConnection) -> Result<T, DieselError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut conn = pool
            .get()
            .map_err(|e| infrastructure_error(format!("connection pool: {}", e)))?;
        f(&mut conn)
    })
    .await
    .map_err(|e| infrastructure_error(format!("database task: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use diesel::sql_types::Integer;

    #[derive(QueryableByName)]
    struct Flag {
        #[diesel(sql_type = Integer)]
        foreign_keys: i32,
    }

    #[tokio::test]
    async fn test_pool_applies_pragmas() {
        let dir = tempfile::tempdir().unwrap();
        let pool = create_diesel_pool(&dir.path().join("pool.db")).unwrap();

        let flag = run_blocking(pool, |conn| {
            diesel::sql_query("PRAGMA foreign_keys").get_result::<Flag>(conn)
        })
        .await
        .unwrap();
        assert_eq!(flag.foreign_keys, 1);
    }

    #[test]
    fn test_url_prefix_is_optional() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("url.db");
        assert!(create_diesel_pool_from_url(&format!("sqlite:{}", path.display())).is_ok());
        assert!(create_diesel_pool_from_url(&path.display().to_string()).is_ok());
    }
}
