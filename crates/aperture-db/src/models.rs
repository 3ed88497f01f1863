/// Database row types — these map directly to SQLite rows.
/// Distinct from aperture-types API shapes to keep the DB layer independent.

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub created_at: String,
}

pub struct ConversationRow {
    pub id: String,
    pub created_at: String,
    pub updated_at: String,
}

pub struct ParticipantRow {
    pub user_id: String,
    pub username: String,
    pub last_read_at: String,
    pub is_muted: bool,
}

pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub sender_username: String,
    pub text: String,
    pub attachment: Option<String>,
    pub created_at: String,
}

pub struct ReadReceiptRow {
    pub message_id: String,
    pub user_id: String,
    pub username: String,
    pub read_at: String,
}
