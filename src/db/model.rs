//! Row models returned by repositories.

/// A notification key already surfaced on this client installation.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct SeenKey {
    pub key: String,
    pub first_seen_at: String,
    pub last_seen_at: String,
    /// Monotonic recency counter; the smallest values are pruned first.
    pub touch_seq: i64,
}
