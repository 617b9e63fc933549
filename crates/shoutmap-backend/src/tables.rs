//! Table, function and bucket names used by the app.

/// Likes on shouts.
pub const SHOUT_LIKES_TABLE: &str = "shout_likes";

/// Likes on events.
pub const EVENT_LIKES_TABLE: &str = "event_likes";

/// Likes on comments (shout and event comments share ids).
pub const COMMENT_LIKES_TABLE: &str = "comment_likes";

/// Comments attached to shouts.
pub const SHOUT_COMMENTS_TABLE: &str = "shout_comments";

/// Comments attached to events.
pub const EVENT_COMMENTS_TABLE: &str = "event_comments";

/// In-app notifications.
pub const NOTIFICATIONS_TABLE: &str = "notifications";

/// Direct messages.
pub const MESSAGES_TABLE: &str = "messages";

/// Per-participant read markers for conversations.
pub const CONVERSATION_PARTICIPANTS_TABLE: &str = "conversation_participants";

// =============================================================================
// RPC functions
// =============================================================================

/// Unread direct message count for a user.
pub const UNREAD_MESSAGE_COUNT_RPC: &str = "get_unread_message_count";

/// Unread notification count for a user.
pub const UNREAD_NOTIFICATION_COUNT_RPC: &str = "get_unread_notification_count";

/// Privacy-safe bulk profile lookup.
pub const PUBLIC_PROFILES_RPC: &str = "get_public_profiles";

// =============================================================================
// Storage
// =============================================================================

/// Bucket for images attached to shouts and events.
pub const MEDIA_BUCKET: &str = "shout-media";
