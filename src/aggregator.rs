//! Notification feed: folds polled source events and local action outcomes
//! into one bounded, newest-first, deduplicated sequence.
//!
//! Identity is the source event's stable key, so redelivery of the same
//! server-side event on every poll is a no-op. Whether an inserted entry also
//! raises the attention cue is decided by the persistent dedup store: a replay
//! after restart fills the feed silently.
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::cue::AttentionCue;
use crate::dedup::DedupStore;
use crate::model::{
    display_time, Notification, NotificationKind, RequestStatus, SourceEvent, TargetView, JUST_NOW,
};

pub const DEFAULT_CAPACITY: usize = 10;

/// Identities remembered for the session after eviction from the feed.
const SESSION_MEMORY_LIMIT: usize = 1024;

/// Where the viewer goes when a notification is selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Navigation {
    pub event_id: i64,
    pub tab: Option<TargetView>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestReport {
    pub inserted: usize,
    pub alerted: usize,
    pub skipped: usize,
}

/// Bounded FIFO set of identities ingested during this session.
#[derive(Debug, Default)]
struct SessionMemory {
    keys: HashSet<String>,
    order: VecDeque<String>,
}

impl SessionMemory {
    fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    fn remember(&mut self, key: &str) {
        if !self.keys.insert(key.to_string()) {
            return;
        }
        self.order.push_back(key.to_string());
        while self.order.len() > SESSION_MEMORY_LIMIT {
            if let Some(old) = self.order.pop_front() {
                self.keys.remove(&old);
            }
        }
    }
}

pub struct NotificationAggregator {
    store: Arc<dyn DedupStore>,
    cue: Arc<dyn AttentionCue>,
    capacity: usize,
    current_user_id: Option<i64>,
    entries: HashMap<String, Notification>,
    /// Front is newest.
    order: VecDeque<String>,
    session: SessionMemory,
}

impl NotificationAggregator {
    pub fn new(store: Arc<dyn DedupStore>, cue: Arc<dyn AttentionCue>) -> Self {
        Self {
            store,
            cue,
            capacity: DEFAULT_CAPACITY,
            current_user_id: None,
            entries: HashMap::new(),
            order: VecDeque::new(),
            session: SessionMemory::default(),
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Action-log entries authored by this user are not surfaced.
    pub fn with_current_user(mut self, user_id: Option<i64>) -> Self {
        self.current_user_id = user_id;
        self
    }

    /// Fold a batch into the feed, sequentially in batch order.
    #[instrument(skip_all, fields(batch = batch.len()))]
    pub async fn ingest(&mut self, batch: Vec<SourceEvent>) -> IngestReport {
        let mut report = IngestReport::default();
        for event in batch {
            let key = event.key();
            if self.entries.contains_key(&key) || self.session.contains(&key) {
                report.skipped += 1;
                continue;
            }
            let Some(notification) = self.render(&event, &key) else {
                report.skipped += 1;
                continue;
            };

            let alert = match self.store.has(&key).await {
                Ok(seen) => !seen,
                Err(err) => {
                    // Unknown history: show it, but never risk a second alert.
                    warn!(?err, %key, "dedup lookup failed; inserting silently");
                    false
                }
            };
            if alert {
                if let Err(err) = self.store.mark_seen(&key).await {
                    warn!(?err, %key, "failed to persist seen key");
                }
                self.cue.raise(&notification);
                report.alerted += 1;
            } else {
                debug!(%key, "replayed notification inserted silently");
            }

            self.session.remember(&key);
            self.insert(notification);
            report.inserted += 1;
        }
        report
    }

    /// Outcome of a user-triggered action. Always new, never persisted.
    pub fn push_local(
        &mut self,
        kind: NotificationKind,
        message: impl Into<String>,
        related_event_id: Option<i64>,
    ) -> Notification {
        let notification = Notification {
            id: format!("local:{}", Uuid::new_v4()),
            kind,
            message: message.into(),
            display_time: JUST_NOW.to_string(),
            related_event_id,
            target_view: None,
        };
        self.cue.raise(&notification);
        self.insert(notification.clone());
        notification
    }

    /// Newest-first projection.
    pub fn feed(&self) -> Vec<Notification> {
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn dismiss(&mut self, id: &str) -> bool {
        if self.entries.remove(id).is_none() {
            return false;
        }
        self.order.retain(|k| k != id);
        true
    }

    /// Empties the feed. Identities already ingested this session stay
    /// suppressed so the next poll does not refill it.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    /// Deep-link target of a notification, if it points at an event.
    pub fn select(&self, id: &str) -> Option<Navigation> {
        let n = self.entries.get(id)?;
        n.related_event_id.map(|event_id| Navigation {
            event_id,
            tab: n.target_view,
        })
    }

    fn insert(&mut self, notification: Notification) {
        let id = notification.id.clone();
        if self.entries.insert(id.clone(), notification).is_some() {
            self.order.retain(|k| k != &id);
        }
        self.order.push_front(id);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_back() {
                self.entries.remove(&evicted);
            }
        }
    }

    fn render(&self, event: &SourceEvent, key: &str) -> Option<Notification> {
        let (kind, message, related_event_id, target_view, time) = match event {
            SourceEvent::Message(m) => (
                NotificationKind::Info,
                format!("New message from {}: {}", m.sender_name, m.content),
                Some(m.event_id),
                Some(TargetView::Messages),
                display_time(m.timestamp.as_deref()),
            ),
            SourceEvent::SentRequest(r) => match r.status {
                RequestStatus::Pending => return None,
                RequestStatus::Accepted => (
                    NotificationKind::Success,
                    format!("Your invitation to \"{}\" was accepted", r.event_name),
                    Some(r.event_id),
                    Some(TargetView::Overview),
                    JUST_NOW.to_string(),
                ),
                RequestStatus::Declined => (
                    NotificationKind::Info,
                    format!("Your invitation to \"{}\" was declined", r.event_name),
                    Some(r.event_id),
                    Some(TargetView::Overview),
                    JUST_NOW.to_string(),
                ),
            },
            SourceEvent::ReceivedRequest(r) => {
                if r.status != RequestStatus::Pending {
                    return None;
                }
                (
                    NotificationKind::Info,
                    format!(
                        "{} invited you to collaborate on \"{}\"",
                        r.sender_name, r.event_name
                    ),
                    None,
                    None,
                    JUST_NOW.to_string(),
                )
            }
            SourceEvent::ActionLog(l) => {
                if Some(l.user_id) == self.current_user_id {
                    return None;
                }
                let message = match l.details.as_deref() {
                    Some(details) if !details.is_empty() => {
                        format!("{} {}: {}", l.user_name, l.action, details)
                    }
                    _ => format!("{} {}", l.user_name, l.action),
                };
                (
                    NotificationKind::Info,
                    message,
                    Some(l.event_id),
                    Some(TargetView::Collaborators),
                    display_time(l.timestamp.as_deref()),
                )
            }
        };
        Some(Notification {
            id: key.to_string(),
            kind,
            message,
            display_time: time,
            related_event_id,
            target_view,
        })
    }
}
