//! Wires the sync components onto one scheduler.
//!
//! Poll tasks: collaboration requests, unread messages, collaborator action
//! log, and certificate status for the event currently being viewed. The
//! status task runs fast while any job is generating or sending and idles
//! otherwise. After shutdown, results of fetches still in flight are dropped.
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::aggregator::{Navigation, NotificationAggregator, DEFAULT_CAPACITY};
use crate::backend::{BackendError, ConsoleBackend};
use crate::collaboration::CollaborationRequestManager;
use crate::config::{Config, Polling};
use crate::cue::AttentionCue;
use crate::dedup::DedupStore;
use crate::error::ActionError;
use crate::model::{
    CollaborationRequest, JobStatusRecord, Notification, NotificationKind, SourceEvent,
};
use crate::reconciler::{JobAction, StatusReconciler};
use crate::scheduler::{PollingScheduler, TaskHandle};

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub polling: Polling,
    pub feed_capacity: usize,
    pub current_user_id: Option<i64>,
}

impl EngineOptions {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            polling: cfg.polling.clone(),
            feed_capacity: cfg.feed.capacity,
            current_user_id: cfg.app.current_user_id,
        }
    }
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            polling: Polling {
                requests_interval_ms: 10_000,
                messages_interval_ms: 10_000,
                action_log_interval_ms: 15_000,
                status_fast_interval_ms: 3_000,
                status_idle_interval_ms: 30_000,
                max_backoff_seconds: 60,
            },
            feed_capacity: DEFAULT_CAPACITY,
            current_user_id: None,
        }
    }
}

struct Shared {
    backend: Arc<dyn ConsoleBackend>,
    aggregator: Arc<Mutex<NotificationAggregator>>,
    reconciler: Mutex<StatusReconciler>,
    requests: CollaborationRequestManager,
    watched: Mutex<Option<i64>>,
    status_task: std::sync::Mutex<Option<TaskHandle>>,
    polling: Polling,
    cancel: CancellationToken,
}

pub struct SyncEngine {
    shared: Arc<Shared>,
    scheduler: PollingScheduler,
}

impl SyncEngine {
    pub fn new(
        backend: Arc<dyn ConsoleBackend>,
        store: Arc<dyn DedupStore>,
        cue: Arc<dyn AttentionCue>,
        options: EngineOptions,
    ) -> Self {
        let scheduler = PollingScheduler::new(options.polling.max_backoff());
        let cancel = scheduler.token();
        let aggregator = Arc::new(Mutex::new(
            NotificationAggregator::new(store, cue)
                .with_capacity(options.feed_capacity)
                .with_current_user(options.current_user_id),
        ));
        let requests =
            CollaborationRequestManager::new(backend.clone(), aggregator.clone(), cancel.clone());
        let shared = Arc::new(Shared {
            backend,
            aggregator,
            reconciler: Mutex::new(StatusReconciler::new()),
            requests,
            watched: Mutex::new(None),
            status_task: std::sync::Mutex::new(None),
            polling: options.polling,
            cancel,
        });
        Self { shared, scheduler }
    }

    /// Schedule the always-on poll loops and load the event list.
    pub async fn start(&self) -> Vec<TaskHandle> {
        if let Err(err) = self.shared.requests.refresh_events().await {
            warn!(?err, "initial event list load failed");
        }
        let polling = &self.shared.polling;

        let shared = self.shared.clone();
        let requests = self.scheduler.schedule(
            "collaboration_requests",
            polling.requests_interval(),
            move || {
                let shared = shared.clone();
                async move { shared.requests.refresh_requests().await }
            },
        );

        let shared = self.shared.clone();
        let messages = self.scheduler.schedule(
            "unread_messages",
            polling.messages_interval(),
            move || {
                let shared = shared.clone();
                async move { shared.poll_messages().await }
            },
        );

        let shared = self.shared.clone();
        let action_log = self.scheduler.schedule(
            "action_log",
            polling.action_log_interval(),
            move || {
                let shared = shared.clone();
                async move { shared.poll_action_log().await }
            },
        );

        vec![requests, messages, action_log]
    }

    /// Open an event's detail view: status polling follows this event.
    pub async fn watch_event(&self, event_id: i64) {
        {
            let mut watched = self.shared.watched.lock().await;
            if *watched == Some(event_id) {
                return;
            }
            *watched = Some(event_id);
        }
        self.shared.reconciler.lock().await.reset();

        let shared = self.shared.clone();
        let handle = self.scheduler.schedule(
            "certificate_status",
            self.shared.polling.status_idle_interval(),
            move || {
                let shared = shared.clone();
                async move { shared.poll_status().await }
            },
        );
        if let Some(old) = self.shared.swap_status_task(Some(handle)) {
            self.scheduler.cancel(&old);
        }
        info!(event_id, "watching event");
    }

    pub async fn unwatch_event(&self) {
        *self.shared.watched.lock().await = None;
        self.shared.reconciler.lock().await.reset();
        if let Some(old) = self.shared.swap_status_task(None) {
            self.scheduler.cancel(&old);
        }
    }

    pub async fn watched_event(&self) -> Option<i64> {
        *self.shared.watched.lock().await
    }

    /// Optimistic write, then the backend call, then a fresh authoritative
    /// reconcile whether the call succeeded or not.
    #[instrument(skip_all, fields(action = action.name(), event_id = action.event_id()))]
    pub async fn run_action(&self, action: JobAction) -> Result<(), ActionError> {
        if self.shared.cancel.is_cancelled() {
            return Err(ActionError::ShutDown);
        }
        let event_id = action.event_id();
        let watching = *self.shared.watched.lock().await == Some(event_id);

        if watching {
            let mut reconciler = self.shared.reconciler.lock().await;
            if matches!(action, JobAction::GenerateCertificates { .. })
                && reconciler.is_loaded()
                && reconciler.is_empty()
            {
                drop(reconciler);
                self.shared.aggregator.lock().await.push_local(
                    NotificationKind::Error,
                    ActionError::EmptyRoster.to_string(),
                    Some(event_id),
                );
                return Err(ActionError::EmptyRoster);
            }
            let changed = reconciler.apply_action(&action);
            debug!(changed, "optimistic state applied");
        }
        if watching {
            self.shared.set_status_cadence(true);
        }

        let outcome = issue(self.shared.backend.as_ref(), &action).await;

        if watching {
            if let Err(err) = self.shared.poll_status().await {
                warn!(?err, "reconcile after action failed; next poll will retry");
            }
        }
        if self.shared.cancel.is_cancelled() {
            return outcome.map_err(|source| ActionError::Failed {
                action: action.name(),
                message: action.failure_message(source.server_message()),
                source,
            });
        }

        let event_name = self
            .shared
            .requests
            .event_name(event_id)
            .await
            .unwrap_or_else(|| format!("event #{event_id}"));
        match outcome {
            Ok(()) => {
                if let Some(message) = action.success_message(&event_name) {
                    self.shared.aggregator.lock().await.push_local(
                        NotificationKind::Success,
                        message,
                        Some(event_id),
                    );
                }
                Ok(())
            }
            Err(source) => {
                let message = action.failure_message(source.server_message());
                warn!(?source, "action failed");
                self.shared.aggregator.lock().await.push_local(
                    NotificationKind::Error,
                    message.clone(),
                    Some(event_id),
                );
                Err(ActionError::Failed {
                    action: action.name(),
                    message,
                    source,
                })
            }
        }
    }

    pub async fn accept_request(&self, request_id: i64) -> Result<(), ActionError> {
        self.shared.requests.accept(request_id).await
    }

    pub async fn decline_request(&self, request_id: i64) -> Result<(), ActionError> {
        self.shared.requests.decline(request_id).await
    }

    pub async fn pending_requests(&self) -> Vec<CollaborationRequest> {
        self.shared.requests.pending_received().await
    }

    pub fn requests(&self) -> &CollaborationRequestManager {
        &self.shared.requests
    }

    pub async fn feed(&self) -> Vec<Notification> {
        self.shared.aggregator.lock().await.feed()
    }

    pub async fn dismiss(&self, id: &str) -> bool {
        self.shared.aggregator.lock().await.dismiss(id)
    }

    pub async fn clear_feed(&self) {
        self.shared.aggregator.lock().await.clear();
    }

    /// Follow a notification's deep link: the linked event becomes the watched
    /// one and the target tab is returned for the caller to open.
    pub async fn open_notification(&self, id: &str) -> Option<Navigation> {
        let navigation = self.shared.aggregator.lock().await.select(id)?;
        self.watch_event(navigation.event_id).await;
        Some(navigation)
    }

    pub async fn job_statuses(&self) -> Vec<JobStatusRecord> {
        self.shared.reconciler.lock().await.current().to_vec()
    }

    pub fn status_task(&self) -> Option<TaskHandle> {
        self.shared.status_task()
    }

    pub async fn poll_messages(&self) -> Result<()> {
        self.shared.poll_messages().await
    }

    pub async fn poll_action_log(&self) -> Result<()> {
        self.shared.poll_action_log().await
    }

    pub async fn poll_requests(&self) -> Result<()> {
        self.shared.requests.refresh_requests().await
    }

    pub async fn poll_status(&self) -> Result<()> {
        self.shared.poll_status().await
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Cancel every poll loop; no state changes after this returns.
    pub fn cancel(&self) {
        self.scheduler.cancel_all();
    }

    /// Cancel and wait for fetches already in flight to finish.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
    }
}

impl Shared {
    async fn poll_messages(&self) -> Result<()> {
        let messages = self
            .backend
            .unread_messages()
            .await
            .context("failed to fetch unread messages")?;
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        let batch = messages.into_iter().map(SourceEvent::Message).collect();
        let report = self.aggregator.lock().await.ingest(batch).await;
        debug!(?report, "messages ingested");
        Ok(())
    }

    async fn poll_action_log(&self) -> Result<()> {
        let entries = self
            .backend
            .action_log()
            .await
            .context("failed to fetch action log")?;
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        let batch = entries.into_iter().map(SourceEvent::ActionLog).collect();
        let report = self.aggregator.lock().await.ingest(batch).await;
        debug!(?report, "action log ingested");
        Ok(())
    }

    async fn poll_status(&self) -> Result<()> {
        let Some(event_id) = *self.watched.lock().await else {
            return Ok(());
        };
        let ticket = self.reconciler.lock().await.ticket();
        let snapshot = self
            .backend
            .certificate_status(event_id)
            .await
            .with_context(|| format!("failed to fetch certificate status for event {event_id}"))?;

        if self.cancel.is_cancelled() || *self.watched.lock().await != Some(event_id) {
            return Ok(());
        }
        let fast = {
            let mut reconciler = self.reconciler.lock().await;
            reconciler.reconcile_since(ticket, snapshot);
            reconciler.needs_fast_poll()
        };
        self.set_status_cadence(fast);
        Ok(())
    }

    fn set_status_cadence(&self, fast: bool) {
        let period = if fast {
            self.polling.status_fast_interval()
        } else {
            self.polling.status_idle_interval()
        };
        if let Some(handle) = self.status_task() {
            handle.set_interval(period);
        }
    }

    fn status_task(&self) -> Option<TaskHandle> {
        self.status_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn swap_status_task(&self, next: Option<TaskHandle>) -> Option<TaskHandle> {
        let mut slot = self
            .status_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::replace(&mut *slot, next)
    }
}

async fn issue(backend: &dyn ConsoleBackend, action: &JobAction) -> Result<(), BackendError> {
    match action {
        JobAction::GenerateCertificates { event_id } => {
            backend.generate_certificates(*event_id).await
        }
        JobAction::SendEmail { certificate_id, .. } => {
            backend.send_certificate_email(*certificate_id).await
        }
        JobAction::SendAllEmails { event_id } => backend.send_all_emails(*event_id).await,
        JobAction::SendUpdates {
            event_id,
            subject,
            content,
        } => backend.send_update_emails(*event_id, subject, content).await,
    }
}
