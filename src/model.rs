use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Certificate generation lifecycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GenerationStatus {
    NotGenerated,
    Pending,
    Generated,
    Failed,
}

impl GenerationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationStatus::NotGenerated => "NOT_GENERATED",
            GenerationStatus::Pending => "PENDING",
            GenerationStatus::Generated => "GENERATED",
            GenerationStatus::Failed => "FAILED",
        }
    }

    pub fn is_transitional(&self) -> bool {
        matches!(self, GenerationStatus::Pending)
    }

    /// Local transitions only. Terminal states are left exclusively through a
    /// retry that re-enters `Pending`.
    pub fn can_transition_to(&self, next: GenerationStatus) -> bool {
        use GenerationStatus::*;
        match (self, next) {
            (a, b) if *a == b => true,
            (NotGenerated, Pending) => true,
            (Pending, Generated) | (Pending, Failed) => true,
            (Generated, Pending) | (Failed, Pending) => true,
            _ => false,
        }
    }
}

/// Lifecycle shared by the per-certificate email and the broadcast update email.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EmailStatus {
    NotSent,
    Sending,
    Sent,
    Failed,
}

impl EmailStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmailStatus::NotSent => "NOT_SENT",
            EmailStatus::Sending => "SENDING",
            EmailStatus::Sent => "SENT",
            EmailStatus::Failed => "FAILED",
        }
    }

    pub fn is_transitional(&self) -> bool {
        matches!(self, EmailStatus::Sending)
    }

    /// `Sent` and `Failed` may both be re-sent.
    pub fn can_transition_to(&self, next: EmailStatus) -> bool {
        use EmailStatus::*;
        match (self, next) {
            (a, b) if *a == b => true,
            (NotSent, Sending) | (Sent, Sending) | (Failed, Sending) => true,
            (Sending, Sent) | (Sending, Failed) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    Pending,
    Accepted,
    Declined,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "PENDING",
            RequestStatus::Accepted => "ACCEPTED",
            RequestStatus::Declined => "DECLINED",
        }
    }
}

/// One certificate-bearing participant as reported by the status endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusRecord {
    pub id: i64,
    pub participant_name: String,
    pub email: String,
    pub generation_status: GenerationStatus,
    pub email_status: EmailStatus,
    pub update_email_status: EmailStatus,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl JobStatusRecord {
    pub fn is_transitional(&self) -> bool {
        self.generation_status.is_transitional()
            || self.email_status.is_transitional()
            || self.update_email_status.is_transitional()
    }

    /// Certificate emails require a generated certificate.
    pub fn email_permitted(&self) -> bool {
        self.generation_status == GenerationStatus::Generated
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CollaborationRequest {
    pub id: i64,
    pub event_id: i64,
    pub event_name: String,
    pub sender_name: String,
    #[serde(default)]
    pub sender_email: Option<String>,
    pub status: RequestStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UnreadMessage {
    pub id: i64,
    pub sender_name: String,
    pub content: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    pub event_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ActionLogEntry {
    pub id: i64,
    pub user_id: i64,
    pub user_name: String,
    pub action: String,
    pub event_id: i64,
    #[serde(default)]
    pub details: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// Projection of an event the current user can manage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EventSummary {
    pub id: i64,
    pub event_name: String,
    #[serde(default)]
    pub event_date: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Success,
    Error,
    Info,
}

/// Tab of the event detail view a notification deep-links into.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TargetView {
    Overview,
    Messages,
    Collaborators,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notification {
    pub id: String,
    pub kind: NotificationKind,
    pub message: String,
    pub display_time: String,
    pub related_event_id: Option<i64>,
    pub target_view: Option<TargetView>,
}

/// A raw polled item before it is folded into the feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEvent {
    Message(UnreadMessage),
    SentRequest(CollaborationRequest),
    ReceivedRequest(CollaborationRequest),
    ActionLog(ActionLogEntry),
}

impl SourceEvent {
    /// Stable identity of the server-side event, independent of polling cadence.
    /// Sent requests include their status so each outcome is a distinct identity.
    pub fn key(&self) -> String {
        match self {
            SourceEvent::Message(m) => format!("message:{}", m.id),
            SourceEvent::SentRequest(r) => format!("sentRequest:{}:{}", r.id, r.status.as_str()),
            SourceEvent::ReceivedRequest(r) => format!("receivedRequest:{}", r.id),
            SourceEvent::ActionLog(l) => format!("actionLog:{}", l.id),
        }
    }
}

pub const JUST_NOW: &str = "Just now";

/// Render a server timestamp (`2024-05-01T10:15:30` with optional fraction)
/// for display. Anything unparseable falls back to "Just now".
pub fn display_time(timestamp: Option<&str>) -> String {
    timestamp
        .and_then(|ts| NaiveDateTime::parse_from_str(ts, "%Y-%m-%dT%H:%M:%S%.f").ok())
        .map(|dt| dt.format("%b %-d, %H:%M").to_string())
        .unwrap_or_else(|| JUST_NOW.to_string())
}
