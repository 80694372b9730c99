use crate::cache::CacheError;

pub fn map_sqlx_error(err: sqlx::Error) -> CacheError {
    match err {
        sqlx::Error::Database(db)
            if db
                .message()
                .contains("canceling statement due to user request") =>
        {
            CacheError::ledger(format!("statement timed out: {}", db.message()))
        }
        sqlx::Error::Database(db) => CacheError::ledger(db.message()),
        sqlx::Error::PoolTimedOut => CacheError::ledger("timed out waiting for a connection"),
        other => CacheError::ledger(other),
    }
}
