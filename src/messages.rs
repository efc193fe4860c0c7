use crate::db;
use crate::error::ApiError;
use crate::model::{ChatDigest, Message, ThreadMessage};
use rusqlite::{params, Connection};
use time::OffsetDateTime;

/// Create a message from `sender_id` to `receiver_id`. The receiver must
/// exist; the foreign key reports it if not.
pub fn send_message(
    conn: &Connection,
    sender_id: i64,
    receiver_id: Option<i64>,
    text: &str,
) -> Result<Message, ApiError> {
    let text = text.trim();
    let Some(receiver_id) = receiver_id else {
        return Err(ApiError::validation("Receiver ID and message text required"));
    };
    if text.is_empty() {
        return Err(ApiError::validation("Receiver ID and message text required"));
    }
    let now = OffsetDateTime::now_utc().unix_timestamp();
    if let Err(e) = conn.execute(
        "INSERT INTO messages (sender_id, receiver_id, message_text, created_at) \
         VALUES (?1, ?2, ?3, ?4)",
        params![sender_id, receiver_id, text, now],
    ) {
        if db::is_constraint_violation(&e) {
            return Err(ApiError::validation("Receiver not found"));
        }
        return Err(e.into());
    }
    Ok(Message {
        id: conn.last_insert_rowid(),
        sender_id,
        receiver_id,
        message_text: text.into(),
        is_read: false,
        created_at: now,
    })
}

/// All messages between the caller and a peer, oldest first, with display
/// metadata for both ends. Unread messages from the peer are marked read
/// in the same transaction as the fetch, so the returned set and the
/// mark cannot diverge; the snapshot still shows them as they were.
pub fn list_thread(
    conn: &mut Connection,
    caller_id: i64,
    peer_id: i64,
) -> Result<Vec<ThreadMessage>, ApiError> {
    let tx = conn.transaction()?;
    let mut msgs = Vec::new();
    {
        let mut stmt = tx.prepare(
            "SELECT m.id, m.sender_id, m.receiver_id, m.message_text, m.is_read, m.created_at, \
                    s.display_name, s.avatar, r.display_name, r.avatar \
             FROM messages m \
             JOIN users s ON s.id = m.sender_id \
             JOIN users r ON r.id = m.receiver_id \
             WHERE (m.sender_id = ?1 AND m.receiver_id = ?2) \
                OR (m.sender_id = ?2 AND m.receiver_id = ?1) \
             ORDER BY m.created_at ASC, m.id ASC",
        )?;
        let rows = stmt.query_map(params![caller_id, peer_id], |row| {
            Ok(ThreadMessage {
                message: Message {
                    id: row.get(0)?,
                    sender_id: row.get(1)?,
                    receiver_id: row.get(2)?,
                    message_text: row.get(3)?,
                    is_read: row.get(4)?,
                    created_at: row.get(5)?,
                },
                sender_name: row.get(6)?,
                sender_avatar: row.get(7)?,
                receiver_name: row.get(8)?,
                receiver_avatar: row.get(9)?,
            })
        })?;
        for m in rows {
            msgs.push(m?);
        }
    }
    tx.execute(
        "UPDATE messages SET is_read = 1 \
         WHERE receiver_id = ?1 AND sender_id = ?2 AND is_read = 0",
        params![caller_id, peer_id],
    )?;
    tx.commit()?;
    Ok(msgs)
}

/// One row per conversation partner: the latest exchanged message plus
/// the caller's unread count for that partner, newest conversations
/// first. Partners with no exchanged messages produce no row.
pub fn list_chats(conn: &Connection, caller_id: i64) -> Result<Vec<ChatDigest>, ApiError> {
    let mut stmt = conn.prepare(
        "SELECT CASE WHEN m.sender_id = ?1 THEN m.receiver_id ELSE m.sender_id END AS partner_id, \
                u.display_name, u.avatar, u.status, m.message_text, m.created_at, \
                (SELECT COUNT(*) FROM messages x \
                  WHERE x.receiver_id = ?1 AND x.is_read = 0 \
                    AND x.sender_id = \
                        CASE WHEN m.sender_id = ?1 THEN m.receiver_id ELSE m.sender_id END) \
         FROM messages m \
         JOIN users u \
           ON u.id = CASE WHEN m.sender_id = ?1 THEN m.receiver_id ELSE m.sender_id END \
         WHERE m.id IN ( \
             SELECT id FROM ( \
                 SELECT id, row_number() OVER ( \
                     PARTITION BY CASE WHEN sender_id = ?1 THEN receiver_id ELSE sender_id END \
                     ORDER BY created_at DESC, id DESC) AS rn \
                 FROM messages \
                 WHERE sender_id = ?1 OR receiver_id = ?1) \
             WHERE rn = 1) \
         ORDER BY m.created_at DESC, m.id DESC",
    )?;
    let rows = stmt.query_map([caller_id], |row| {
        Ok(ChatDigest {
            id: row.get(0)?,
            name: row.get(1)?,
            avatar: row.get(2)?,
            status: row.get(3)?,
            last_message: row.get(4)?,
            time: row.get(5)?,
            unread: row.get(6)?,
        })
    })?;
    let mut chats = Vec::new();
    for c in rows {
        chats.push(c?);
    }
    Ok(chats)
}

/// Delete a message the caller sent. Returns whether a row was actually
/// removed; a non-existent or non-owned id is a no-op, not an error.
pub fn delete_message(conn: &Connection, caller_id: i64, message_id: i64) -> Result<bool, ApiError> {
    let n = conn.execute(
        "DELETE FROM messages WHERE id = ?1 AND sender_id = ?2",
        params![message_id, caller_id],
    )?;
    Ok(n > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn add_user(conn: &Connection, username: &str, phone: &str) -> i64 {
        conn.execute(
            "INSERT INTO users (username, password_hash, display_name, avatar, phone) \
             VALUES (?1, 'x', ?1, '👤', ?2)",
            params![username, phone],
        )
        .unwrap();
        conn.last_insert_rowid()
    }

    #[test]
    fn send_validates_input() {
        let conn = db::init_db(":memory:").unwrap();
        let ann = add_user(&conn, "ann", "+1");
        let bob = add_user(&conn, "bob", "+2");
        assert!(matches!(
            send_message(&conn, ann, Some(bob), "   "),
            Err(ApiError::Validation(_))
        ));
        assert!(matches!(
            send_message(&conn, ann, None, "hi"),
            Err(ApiError::Validation(_))
        ));
        // receiver must reference an existing user
        assert!(matches!(
            send_message(&conn, ann, Some(999), "hi"),
            Err(ApiError::Validation(_))
        ));
        let m = send_message(&conn, ann, Some(bob), " hi ").unwrap();
        assert_eq!(m.message_text, "hi");
        assert!(!m.is_read);
    }

    #[test]
    fn thread_order_and_mark_read() {
        let mut conn = db::init_db(":memory:").unwrap();
        let ann = add_user(&conn, "ann", "+1");
        let bob = add_user(&conn, "bob", "+2");
        let cal = add_user(&conn, "cal", "+3");
        send_message(&conn, ann, Some(bob), "one").unwrap();
        send_message(&conn, bob, Some(ann), "two").unwrap();
        send_message(&conn, bob, Some(ann), "three").unwrap();
        send_message(&conn, cal, Some(ann), "unrelated").unwrap();

        let thread = list_thread(&mut conn, ann, bob).unwrap();
        assert_eq!(thread.len(), 3);
        let texts: Vec<_> = thread
            .iter()
            .map(|m| m.message.message_text.as_str())
            .collect();
        assert_eq!(texts, ["one", "two", "three"]);
        // snapshot shows pre-mark state
        assert!(thread.iter().all(|m| !m.message.is_read));
        assert_eq!(thread[0].sender_name, "ann");
        assert_eq!(thread[1].sender_name, "bob");
        assert_eq!(thread[1].receiver_name, "ann");

        // bob -> ann marked read, ann -> bob untouched, cal -> ann untouched
        let unread: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM messages WHERE receiver_id = ?1 AND is_read = 0",
                [ann],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(unread, 1);
        let bob_unread: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM messages WHERE receiver_id = ?1 AND is_read = 0",
                [bob],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(bob_unread, 1);

        // idempotent after the first read
        let again = list_thread(&mut conn, ann, bob).unwrap();
        assert!(again
            .iter()
            .filter(|m| m.message.sender_id == bob)
            .all(|m| m.message.is_read));
    }

    #[test]
    fn chat_digest_per_partner() {
        let conn = db::init_db(":memory:").unwrap();
        let ann = add_user(&conn, "ann", "+1");
        let bob = add_user(&conn, "bob", "+2");
        let cal = add_user(&conn, "cal", "+3");
        send_message(&conn, ann, Some(bob), "to bob").unwrap();
        send_message(&conn, bob, Some(ann), "from bob 1").unwrap();
        send_message(&conn, bob, Some(ann), "from bob 2").unwrap();
        send_message(&conn, cal, Some(ann), "from cal").unwrap();

        let chats = list_chats(&conn, ann).unwrap();
        assert_eq!(chats.len(), 2);
        // same-second inserts tie-break by id, so cal's later message leads
        assert_eq!(chats[0].id, cal);
        assert_eq!(chats[0].last_message, "from cal");
        assert_eq!(chats[0].unread, 1);
        assert_eq!(chats[1].id, bob);
        assert_eq!(chats[1].last_message, "from bob 2");
        assert_eq!(chats[1].unread, 2);

        // no row for a partner with no exchanged messages
        let bob_chats = list_chats(&conn, bob).unwrap();
        assert_eq!(bob_chats.len(), 1);
        assert_eq!(bob_chats[0].id, ann);
    }

    #[test]
    fn delete_requires_ownership() {
        let conn = db::init_db(":memory:").unwrap();
        let ann = add_user(&conn, "ann", "+1");
        let bob = add_user(&conn, "bob", "+2");
        let m = send_message(&conn, ann, Some(bob), "hi").unwrap();

        assert!(!delete_message(&conn, bob, m.id).unwrap());
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM messages", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);

        assert!(delete_message(&conn, ann, m.id).unwrap());
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM messages", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);

        // deleting again is a silent no-op
        assert!(!delete_message(&conn, ann, m.id).unwrap());
    }
}
