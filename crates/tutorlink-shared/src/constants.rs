/// Application name
pub const APP_NAME: &str = "Tutorlink";

/// Separator placed between the two identifiers of a conversation key.
/// Identifiers containing it are rejected.
pub const KEY_SEPARATOR: char = '|';

/// Maximum chat message length in characters, after trimming
pub const MAX_MESSAGE_CHARS: usize = 4_000;

/// Collection holding every chat message, partitioned by conversation key
pub const MESSAGES_COLLECTION: &str = "messages";

/// Collection holding supervision requests
pub const REQUESTS_COLLECTION: &str = "requests";

/// Append-only log of supervisor decisions on requests
pub const RESPONSES_COLLECTION: &str = "responses";

/// Record field names shared by every writer of the store
pub mod fields {
    pub const CONVERSATION_KEY: &str = "conversationKey";
    pub const SENDER_ID: &str = "senderId";
    pub const RECEIVER_ID: &str = "receiverId";
    pub const TEXT: &str = "text";
    pub const CREATED_AT: &str = "createdAt";
    pub const READ: &str = "read";

    pub const STUDENT_ID: &str = "studentId";
    pub const SUPERVISOR_ID: &str = "supervisorId";
    pub const NOTE: &str = "note";
    pub const STATUS: &str = "status";
    pub const COMMENT: &str = "supervisorComment";
    pub const REQUEST_ID: &str = "requestId";
}
