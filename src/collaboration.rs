//! Team invitations: received requests the user can act on, sent requests
//! whose outcomes are surfaced through the notification feed, and the event
//! list an accepted invitation extends.
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::aggregator::NotificationAggregator;
use crate::backend::{BackendError, ConsoleBackend};
use crate::error::ActionError;
use crate::model::{
    CollaborationRequest, EventSummary, NotificationKind, RequestStatus, SourceEvent,
};

#[derive(Debug, Default)]
struct RequestState {
    received: Vec<CollaborationRequest>,
    events: Vec<EventSummary>,
}

pub struct CollaborationRequestManager {
    backend: Arc<dyn ConsoleBackend>,
    aggregator: Arc<Mutex<NotificationAggregator>>,
    cancel: CancellationToken,
    state: Mutex<RequestState>,
}

impl CollaborationRequestManager {
    pub fn new(
        backend: Arc<dyn ConsoleBackend>,
        aggregator: Arc<Mutex<NotificationAggregator>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            backend,
            aggregator,
            cancel,
            state: Mutex::new(RequestState::default()),
        }
    }

    pub async fn pending_received(&self) -> Vec<CollaborationRequest> {
        self.state
            .lock()
            .await
            .received
            .iter()
            .filter(|r| r.status == RequestStatus::Pending)
            .cloned()
            .collect()
    }

    pub async fn events(&self) -> Vec<EventSummary> {
        self.state.lock().await.events.clone()
    }

    pub async fn event_name(&self, event_id: i64) -> Option<String> {
        self.state
            .lock()
            .await
            .events
            .iter()
            .find(|e| e.id == event_id)
            .map(|e| e.event_name.clone())
    }

    /// Poll received and sent requests together. Whichever fetch succeeds is
    /// applied; the first failure is returned for the scheduler to log.
    #[instrument(skip_all)]
    pub async fn refresh_requests(&self) -> Result<()> {
        let (received, sent) =
            tokio::join!(self.backend.received_requests(), self.backend.sent_requests());
        if self.cancel.is_cancelled() {
            return Ok(());
        }

        let mut batch = Vec::new();
        let mut first_err: Option<BackendError> = None;
        match received {
            Ok(received) => {
                batch.extend(received.iter().cloned().map(SourceEvent::ReceivedRequest));
                self.state.lock().await.received = received;
            }
            Err(err) => first_err = Some(err),
        }
        match sent {
            Ok(sent) => batch.extend(sent.into_iter().map(SourceEvent::SentRequest)),
            Err(err) => {
                first_err.get_or_insert(err);
            }
        }

        if !batch.is_empty() {
            self.aggregator.lock().await.ingest(batch).await;
        }
        match first_err {
            Some(err) => Err(err).context("failed to fetch collaboration requests"),
            None => Ok(()),
        }
    }

    #[instrument(skip_all)]
    pub async fn refresh_events(&self) -> Result<()> {
        let events = self
            .backend
            .events()
            .await
            .context("failed to fetch events")?;
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        self.state.lock().await.events = events;
        Ok(())
    }

    /// Accept an invitation, then refresh requests, events and the feed
    /// whatever the outcome. Repeat accepts are resolved by the backend.
    #[instrument(skip(self))]
    pub async fn accept(&self, request_id: i64) -> Result<(), ActionError> {
        let outcome = self.backend.accept_request(request_id).await;
        self.confirm(request_id, outcome, "accept").await
    }

    #[instrument(skip(self))]
    pub async fn decline(&self, request_id: i64) -> Result<(), ActionError> {
        let outcome = self.backend.decline_request(request_id).await;
        self.confirm(request_id, outcome, "decline").await
    }

    async fn confirm(
        &self,
        request_id: i64,
        outcome: Result<(), BackendError>,
        action: &'static str,
    ) -> Result<(), ActionError> {
        let request = self
            .state
            .lock()
            .await
            .received
            .iter()
            .find(|r| r.id == request_id)
            .cloned();

        if self.cancel.is_cancelled() {
            return Err(ActionError::ShutDown);
        }
        let (requests, events) = tokio::join!(self.refresh_requests(), self.refresh_events());
        if let Err(err) = requests {
            warn!(?err, "request refresh after {action} failed");
        }
        if let Err(err) = events {
            warn!(?err, "event refresh after {action} failed");
        }

        match outcome {
            Ok(()) => {
                info!(request_id, action, "invitation updated");
                if action == "accept" {
                    let (message, event_id) = match &request {
                        Some(r) => (
                            format!("You joined \"{}\"", r.event_name),
                            Some(r.event_id),
                        ),
                        None => ("Invitation accepted".to_string(), None),
                    };
                    self.aggregator
                        .lock()
                        .await
                        .push_local(NotificationKind::Success, message, event_id);
                }
                Ok(())
            }
            Err(err) => {
                let message = err
                    .server_message()
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("Failed to {action} invitation"));
                warn!(request_id, action, ?err, "invitation update failed");
                self.aggregator.lock().await.push_local(
                    NotificationKind::Error,
                    message.clone(),
                    None,
                );
                Err(ActionError::Failed {
                    action,
                    message,
                    source: err,
                })
            }
        }
    }
}
