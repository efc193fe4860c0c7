use anyhow::Result;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::time::Duration;
use time::OffsetDateTime;

pub type DbPool = Pool<SqliteConnectionManager>;

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  username TEXT UNIQUE NOT NULL,
  password_hash TEXT NOT NULL,
  display_name TEXT NOT NULL,
  avatar TEXT NOT NULL DEFAULT '👤',
  phone TEXT UNIQUE NOT NULL,
  status TEXT,
  is_online INTEGER NOT NULL DEFAULT 0,
  last_seen INTEGER
);

CREATE TABLE IF NOT EXISTS messages (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  sender_id INTEGER NOT NULL REFERENCES users(id),
  receiver_id INTEGER NOT NULL REFERENCES users(id),
  message_text TEXT NOT NULL,
  is_read INTEGER NOT NULL DEFAULT 0,
  created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_thread ON messages (sender_id, receiver_id, created_at);
CREATE INDEX IF NOT EXISTS idx_messages_unread ON messages (receiver_id, is_read);

CREATE TABLE IF NOT EXISTS contacts (
  user_id INTEGER NOT NULL REFERENCES users(id),
  contact_phone TEXT NOT NULL,
  PRIMARY KEY (user_id, contact_phone)
);

CREATE TABLE IF NOT EXISTS meta (
  id INTEGER PRIMARY KEY CHECK (id = 1),
  jwt_secret BLOB NOT NULL,
  created_at INTEGER NOT NULL
);
"#;

/// Open a single SQLite connection and run migrations. Used by tests;
/// the server goes through [`open_pool`].
pub fn init_db<P: AsRef<Path>>(path: P) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "foreign_keys", true)?;
    conn.execute_batch(SCHEMA)?;
    Ok(conn)
}

/// Build the connection pool backing the server. Every connection gets
/// foreign keys enforced and a busy timeout so concurrent writers queue
/// at the store instead of failing immediately.
pub fn open_pool<P: AsRef<Path>>(path: P) -> Result<DbPool> {
    let manager = SqliteConnectionManager::file(path).with_init(|conn| {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update(None, "foreign_keys", true)
    });
    let pool = Pool::new(manager)?;
    pool.get()?.execute_batch(SCHEMA)?;
    Ok(pool)
}

/// Load the token-signing secret, generating and persisting one on first
/// startup. Concurrent first boots race on the insert; the reread makes
/// them all agree on whichever row won.
pub fn signing_secret(conn: &Connection) -> Result<Vec<u8>> {
    if let Some(secret) = conn
        .query_row("SELECT jwt_secret FROM meta WHERE id = 1", [], |row| {
            row.get::<_, Vec<u8>>(0)
        })
        .optional()?
    {
        return Ok(secret);
    }
    use rand::RngCore;
    let mut secret = vec![0u8; 32];
    rand::thread_rng().fill_bytes(&mut secret);
    let now = OffsetDateTime::now_utc().unix_timestamp();
    conn.execute(
        "INSERT INTO meta (id, jwt_secret, created_at) VALUES (1, ?1, ?2) \
         ON CONFLICT(id) DO NOTHING",
        rusqlite::params![secret, now],
    )?;
    let secret = conn.query_row("SELECT jwt_secret FROM meta WHERE id = 1", [], |row| {
        row.get(0)
    })?;
    Ok(secret)
}

/// Classify a rusqlite error as a UNIQUE/foreign-key constraint failure.
pub fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e.sqlite_error_code(),
        Some(rusqlite::ErrorCode::ConstraintViolation)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_is_idempotent() {
        let conn = init_db(":memory:").unwrap();
        conn.execute_batch(SCHEMA).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn secret_is_stable_across_loads() {
        let conn = init_db(":memory:").unwrap();
        let first = signing_secret(&conn).unwrap();
        let second = signing_secret(&conn).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 32);
    }

    #[test]
    fn foreign_keys_are_enforced() {
        let conn = init_db(":memory:").unwrap();
        let res = conn.execute(
            "INSERT INTO messages (sender_id, receiver_id, message_text, created_at) \
             VALUES (1, 2, 'hi', 0)",
            [],
        );
        assert!(matches!(res, Err(ref e) if is_constraint_violation(e)));
    }
}
