use crate::error::ApiError;
use crate::model::DirectoryEntry;
use rusqlite::{params, Connection};
use time::OffsetDateTime;

/// A ping older than this no longer counts as online; nothing ever
/// writes `is_online = 0`.
pub const PRESENCE_TTL_SECS: i64 = 300;

/// Users whose phone number appears in the caller's contact list,
/// optionally filtered by a case-insensitive substring match on display
/// name or username, ordered by display name.
pub fn list_directory(
    conn: &Connection,
    caller_id: i64,
    search: Option<&str>,
) -> Result<Vec<DirectoryEntry>, ApiError> {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let search = search.map(str::trim).filter(|s| !s.is_empty());

    let mut sql = String::from(
        "SELECT u.id, u.display_name, u.avatar, u.status, u.is_online, u.last_seen \
         FROM users u \
         JOIN contacts c ON c.contact_phone = u.phone \
         WHERE c.user_id = ?1",
    );
    let pattern = search.map(|s| format!("%{}%", s.to_lowercase()));
    if pattern.is_some() {
        sql.push_str(" AND (lower(u.display_name) LIKE ?2 OR lower(u.username) LIKE ?2)");
    }
    sql.push_str(" ORDER BY u.display_name");

    let mut stmt = conn.prepare(&sql)?;
    let mut entries = Vec::new();
    match &pattern {
        Some(p) => {
            let rows = stmt.query_map(params![caller_id, p], |row| row_to_entry(row, now))?;
            for e in rows {
                entries.push(e?);
            }
        }
        None => {
            let rows = stmt.query_map([caller_id], |row| row_to_entry(row, now))?;
            for e in rows {
                entries.push(e?);
            }
        }
    }
    Ok(entries)
}

fn row_to_entry(row: &rusqlite::Row<'_>, now: i64) -> rusqlite::Result<DirectoryEntry> {
    let is_online: bool = row.get(4)?;
    let last_seen: Option<i64> = row.get(5)?;
    Ok(DirectoryEntry {
        id: row.get(0)?,
        name: row.get(1)?,
        avatar: row.get(2)?,
        status: row.get(3)?,
        online: is_online && last_seen.map_or(false, |t| now - t <= PRESENCE_TTL_SECS),
        last_seen,
    })
}

/// Record phone numbers as contacts of the caller. Duplicates are
/// ignored, so re-syncing the same book is harmless.
pub fn sync_contacts(
    conn: &mut Connection,
    caller_id: i64,
    phones: &[String],
) -> Result<(), ApiError> {
    let tx = conn.transaction()?;
    {
        let mut stmt =
            tx.prepare("INSERT OR IGNORE INTO contacts (user_id, contact_phone) VALUES (?1, ?2)")?;
        for phone in phones {
            let phone = phone.trim();
            if phone.is_empty() {
                continue;
            }
            stmt.execute(params![caller_id, phone])?;
        }
    }
    tx.commit()?;
    Ok(())
}

/// Mark the caller online now.
pub fn ping_online(conn: &Connection, caller_id: i64) -> Result<(), ApiError> {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    conn.execute(
        "UPDATE users SET is_online = 1, last_seen = ?2 WHERE id = ?1",
        params![caller_id, now],
    )?;
    Ok(())
}
