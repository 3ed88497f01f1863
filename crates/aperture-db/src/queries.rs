use crate::Database;
use crate::models::{ConversationRow, MessageRow, ParticipantRow, ReadReceiptRow, UserRow};
use anyhow::{Result, anyhow};

/// Canonical storage format for timestamps: RFC 3339 with microsecond
/// precision in UTC, so lexicographic order matches chronological order.
pub fn format_timestamp(dt: chrono::DateTime<chrono::Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

impl Database {
    // -- Users --

    /// Identity rows are provisioned from validated token claims, so the
    /// first request a user makes creates their row and later requests keep
    /// the username current.
    pub fn ensure_user(&self, id: &str, username: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, username) VALUES (?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET username = excluded.username",
                (id, username),
            )?;
            Ok(())
        })
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT id, username, created_at FROM users WHERE id = ?1")?;
            let row = stmt
                .query_row([id], |row| {
                    Ok(UserRow {
                        id: row.get(0)?,
                        username: row.get(1)?,
                        created_at: row.get(2)?,
                    })
                })
                .optional()?;
            Ok(row)
        })
    }

    // -- Conversations --

    /// Create a conversation with exactly two distinct participants. The
    /// two-party shape is a hard invariant enforced here, not at call sites.
    pub fn create_conversation(&self, id: &str, participants: [&str; 2], now: &str) -> Result<()> {
        let [first, second] = participants;
        if first == second {
            return Err(anyhow!("conversation requires two distinct participants"));
        }

        self.with_conn(|conn| {
            conn.execute("BEGIN IMMEDIATE", [])?;
            let result = (|| -> Result<()> {
                conn.execute(
                    "INSERT INTO conversations (id, created_at, updated_at) VALUES (?1, ?2, ?2)",
                    (id, now),
                )?;
                for user_id in [first, second] {
                    conn.execute(
                        "INSERT INTO conversation_participants (conversation_id, user_id)
                         VALUES (?1, ?2)",
                        (id, user_id),
                    )?;
                }
                Ok(())
            })();
            match result {
                Ok(()) => {
                    conn.execute("COMMIT", [])?;
                    Ok(())
                }
                Err(e) => {
                    let _ = conn.execute("ROLLBACK", []);
                    Err(e)
                }
            }
        })
    }

    pub fn get_conversation(&self, id: &str) -> Result<Option<ConversationRow>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT id, created_at, updated_at FROM conversations WHERE id = ?1")?;
            let row = stmt
                .query_row([id], |row| {
                    Ok(ConversationRow {
                        id: row.get(0)?,
                        created_at: row.get(1)?,
                        updated_at: row.get(2)?,
                    })
                })
                .optional()?;
            Ok(row)
        })
    }

    pub fn list_conversations_for_user(&self, user_id: &str) -> Result<Vec<ConversationRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id, c.created_at, c.updated_at
                 FROM conversations c
                 JOIN conversation_participants cp ON cp.conversation_id = c.id
                 WHERE cp.user_id = ?1
                 ORDER BY c.updated_at DESC",
            )?;
            let rows = stmt
                .query_map([user_id], |row| {
                    Ok(ConversationRow {
                        id: row.get(0)?,
                        created_at: row.get(1)?,
                        updated_at: row.get(2)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Participants --

    pub fn is_participant(&self, conversation_id: &str, user_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let exists: i64 = conn.query_row(
                "SELECT EXISTS(
                     SELECT 1 FROM conversation_participants
                     WHERE conversation_id = ?1 AND user_id = ?2
                 )",
                (conversation_id, user_id),
                |row| row.get(0),
            )?;
            Ok(exists == 1)
        })
    }

    pub fn get_participants(&self, conversation_id: &str) -> Result<Vec<ParticipantRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT cp.user_id, u.username, cp.last_read_at, cp.is_muted
                 FROM conversation_participants cp
                 JOIN users u ON u.id = cp.user_id
                 WHERE cp.conversation_id = ?1
                 ORDER BY u.username",
            )?;
            let rows = stmt
                .query_map([conversation_id], |row| {
                    Ok(ParticipantRow {
                        user_id: row.get(0)?,
                        username: row.get(1)?,
                        last_read_at: row.get(2)?,
                        is_muted: row.get(3)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Advance the caller's conversation-level read marker. Monotonic: the
    /// guard in the WHERE clause means an older timestamp is a no-op.
    pub fn advance_last_read(&self, conversation_id: &str, user_id: &str, now: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE conversation_participants SET last_read_at = ?3
                 WHERE conversation_id = ?1 AND user_id = ?2 AND last_read_at < ?3",
                (conversation_id, user_id, now),
            )?;
            Ok(())
        })
    }

    pub fn set_muted(&self, conversation_id: &str, user_id: &str, is_muted: bool) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE conversation_participants SET is_muted = ?3
                 WHERE conversation_id = ?1 AND user_id = ?2",
                (conversation_id, user_id, is_muted),
            )?;
            Ok(())
        })
    }

    // -- Messages --

    pub fn insert_message(
        &self,
        id: &str,
        conversation_id: &str,
        sender_id: &str,
        text: &str,
        attachment: Option<&str>,
        created_at: &str,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (id, conversation_id, sender_id, text, attachment, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![id, conversation_id, sender_id, text, attachment, created_at],
            )?;
            conn.execute(
                "UPDATE conversations SET updated_at = ?2 WHERE id = ?1",
                (conversation_id, created_at),
            )?;
            Ok(())
        })
    }

    /// Newest `limit` messages for a conversation, newest first. Callers that
    /// want chronological order reverse the result.
    pub fn get_messages(&self, conversation_id: &str, limit: u32) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT m.id, m.conversation_id, m.sender_id, u.username, m.text, m.attachment, m.created_at
                 FROM messages m
                 LEFT JOIN users u ON m.sender_id = u.id
                 WHERE m.conversation_id = ?1
                 ORDER BY m.created_at DESC
                 LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(rusqlite::params![conversation_id, limit], map_message_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn get_message(&self, id: &str) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT m.id, m.conversation_id, m.sender_id, u.username, m.text, m.attachment, m.created_at
                 FROM messages m
                 LEFT JOIN users u ON m.sender_id = u.id
                 WHERE m.id = ?1",
            )?;
            let row = stmt.query_row([id], map_message_row).optional()?;
            Ok(row)
        })
    }

    pub fn last_message(&self, conversation_id: &str) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT m.id, m.conversation_id, m.sender_id, u.username, m.text, m.attachment, m.created_at
                 FROM messages m
                 LEFT JOIN users u ON m.sender_id = u.id
                 WHERE m.conversation_id = ?1
                 ORDER BY m.created_at DESC
                 LIMIT 1",
            )?;
            let row = stmt.query_row([conversation_id], map_message_row).optional()?;
            Ok(row)
        })
    }

    /// Messages newer than the user's conversation-level read marker.
    pub fn unread_count(&self, conversation_id: &str, user_id: &str) -> Result<u32> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*)
                 FROM messages m
                 JOIN conversation_participants cp
                   ON cp.conversation_id = m.conversation_id AND cp.user_id = ?2
                 WHERE m.conversation_id = ?1 AND m.created_at > cp.last_read_at",
                (conversation_id, user_id),
                |row| row.get(0),
            )?;
            Ok(count as u32)
        })
    }

    // -- Read receipts --

    /// Append-only and idempotent: re-marking an already-read message keeps
    /// the original receipt.
    pub fn mark_read(&self, id: &str, message_id: &str, user_id: &str, read_at: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO message_read_receipts (id, message_id, user_id, read_at)
                 VALUES (?1, ?2, ?3, ?4)",
                (id, message_id, user_id, read_at),
            )?;
            Ok(())
        })
    }

    /// Batch-fetch read receipts for a set of message IDs.
    pub fn get_read_receipts_for_messages(
        &self,
        message_ids: &[String],
    ) -> Result<Vec<ReadReceiptRow>> {
        if message_ids.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            let placeholders: Vec<String> =
                (1..=message_ids.len()).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "SELECT r.message_id, r.user_id, u.username, r.read_at
                 FROM message_read_receipts r
                 JOIN users u ON u.id = r.user_id
                 WHERE r.message_id IN ({})",
                placeholders.join(", ")
            );

            let mut stmt = conn.prepare(&sql)?;
            let params: Vec<&dyn rusqlite::types::ToSql> = message_ids
                .iter()
                .map(|id| id as &dyn rusqlite::types::ToSql)
                .collect();

            let rows = stmt
                .query_map(params.as_slice(), |row| {
                    Ok(ReadReceiptRow {
                        message_id: row.get(0)?,
                        user_id: row.get(1)?,
                        username: row.get(2)?,
                        read_at: row.get(3)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }
}

fn map_message_row(row: &rusqlite::Row<'_>) -> std::result::Result<MessageRow, rusqlite::Error> {
    Ok(MessageRow {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sender_id: row.get(2)?,
        sender_username: row
            .get::<_, Option<String>>(3)?
            .unwrap_or_else(|| "unknown".to_string()),
        text: row.get(4)?,
        attachment: row.get(5)?,
        created_at: row.get(6)?,
    })
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
