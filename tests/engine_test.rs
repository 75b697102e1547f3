use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use cert_console_sync::aggregator::Navigation;
use cert_console_sync::backend::{BackendError, ConsoleBackend};
use cert_console_sync::cue::AttentionCue;
use cert_console_sync::dedup::MemoryDedupStore;
use cert_console_sync::model::{
    ActionLogEntry, CollaborationRequest, EmailStatus, EventSummary, GenerationStatus,
    JobStatusRecord, Notification, NotificationKind, RequestStatus, TargetView, UnreadMessage,
};
use cert_console_sync::reconciler::JobAction;
use cert_console_sync::{ActionError, EngineOptions, SyncEngine};
use reqwest::StatusCode;
use tokio::sync::{Mutex, Notify};

#[derive(Clone, Default)]
struct RecordingBackend {
    received: Arc<Mutex<Vec<CollaborationRequest>>>,
    sent: Arc<Mutex<Vec<CollaborationRequest>>>,
    messages: Arc<Mutex<Vec<UnreadMessage>>>,
    log: Arc<Mutex<Vec<ActionLogEntry>>>,
    events: Arc<Mutex<Vec<EventSummary>>>,
    status: Arc<Mutex<Vec<JobStatusRecord>>>,
    action_errors: Arc<Mutex<VecDeque<BackendError>>>,
    read_errors: Arc<Mutex<HashMap<&'static str, VecDeque<BackendError>>>>,
    status_gate: Arc<Mutex<Option<Arc<Notify>>>>,
    messages_gate: Arc<Mutex<Option<Arc<Notify>>>>,
    status_calls: Arc<Mutex<usize>>,
    message_calls: Arc<Mutex<usize>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl RecordingBackend {
    async fn set_status(&self, records: Vec<JobStatusRecord>) {
        *self.status.lock().await = records;
    }

    async fn fail_next_action(&self, err: BackendError) {
        self.action_errors.lock().await.push_back(err);
    }

    async fn fail_next_read(&self, endpoint: &'static str, err: BackendError) {
        self.read_errors
            .lock()
            .await
            .entry(endpoint)
            .or_default()
            .push_back(err);
    }

    async fn read_outcome(&self, endpoint: &'static str) -> Result<(), BackendError> {
        match self
            .read_errors
            .lock()
            .await
            .get_mut(endpoint)
            .and_then(VecDeque::pop_front)
        {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// The next status fetch reads its snapshot, then waits for the gate.
    async fn gate_status(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.status_gate.lock().await = Some(gate.clone());
        gate
    }

    async fn gate_messages(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.messages_gate.lock().await = Some(gate.clone());
        gate
    }

    async fn status_calls(&self) -> usize {
        *self.status_calls.lock().await
    }

    async fn message_calls(&self) -> usize {
        *self.message_calls.lock().await
    }

    async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }

    async fn record_action(&self, call: String) -> Result<(), BackendError> {
        self.calls.lock().await.push(call);
        match self.action_errors.lock().await.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl ConsoleBackend for RecordingBackend {
    async fn received_requests(&self) -> Result<Vec<CollaborationRequest>, BackendError> {
        self.read_outcome("received_requests").await?;
        Ok(self.received.lock().await.clone())
    }

    async fn sent_requests(&self) -> Result<Vec<CollaborationRequest>, BackendError> {
        self.read_outcome("sent_requests").await?;
        Ok(self.sent.lock().await.clone())
    }

    async fn action_log(&self) -> Result<Vec<ActionLogEntry>, BackendError> {
        self.read_outcome("action_log").await?;
        Ok(self.log.lock().await.clone())
    }

    async fn unread_messages(&self) -> Result<Vec<UnreadMessage>, BackendError> {
        *self.message_calls.lock().await += 1;
        self.read_outcome("unread_messages").await?;
        let snapshot = self.messages.lock().await.clone();
        let gate = self.messages_gate.lock().await.take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(snapshot)
    }

    async fn certificate_status(
        &self,
        _event_id: i64,
    ) -> Result<Vec<JobStatusRecord>, BackendError> {
        *self.status_calls.lock().await += 1;
        self.read_outcome("certificate_status").await?;
        let snapshot = self.status.lock().await.clone();
        let gate = self.status_gate.lock().await.take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(snapshot)
    }

    async fn events(&self) -> Result<Vec<EventSummary>, BackendError> {
        self.read_outcome("events").await?;
        Ok(self.events.lock().await.clone())
    }

    async fn accept_request(&self, request_id: i64) -> Result<(), BackendError> {
        self.record_action(format!("accept:{request_id}")).await
    }

    async fn decline_request(&self, request_id: i64) -> Result<(), BackendError> {
        self.record_action(format!("decline:{request_id}")).await
    }

    async fn generate_certificates(&self, event_id: i64) -> Result<(), BackendError> {
        self.record_action(format!("generate:{event_id}")).await
    }

    async fn send_certificate_email(&self, certificate_id: i64) -> Result<(), BackendError> {
        self.record_action(format!("send-email:{certificate_id}"))
            .await
    }

    async fn send_all_emails(&self, event_id: i64) -> Result<(), BackendError> {
        self.record_action(format!("send-all:{event_id}")).await
    }

    async fn send_update_emails(
        &self,
        event_id: i64,
        subject: &str,
        _content: &str,
    ) -> Result<(), BackendError> {
        self.record_action(format!("send-updates:{event_id}:{subject}"))
            .await
    }
}

#[derive(Default)]
struct CountingCue {
    raised: std::sync::Mutex<Vec<String>>,
}

impl CountingCue {
    fn raised(&self) -> Vec<String> {
        self.raised.lock().unwrap().clone()
    }
}

impl AttentionCue for CountingCue {
    fn raise(&self, notification: &Notification) {
        self.raised.lock().unwrap().push(notification.id.clone());
    }
}

fn engine_with(
    backend: &RecordingBackend,
    current_user_id: Option<i64>,
) -> (SyncEngine, Arc<CountingCue>) {
    let cue = Arc::new(CountingCue::default());
    let options = EngineOptions {
        current_user_id,
        ..EngineOptions::default()
    };
    let engine = SyncEngine::new(
        Arc::new(backend.clone()),
        Arc::new(MemoryDedupStore::default()),
        cue.clone(),
        options,
    );
    (engine, cue)
}

fn record(id: i64, generation: GenerationStatus, email: EmailStatus) -> JobStatusRecord {
    JobStatusRecord {
        id,
        participant_name: format!("Participant {id}"),
        email: format!("p{id}@example.com"),
        generation_status: generation,
        email_status: email,
        update_email_status: EmailStatus::NotSent,
        error_message: None,
    }
}

fn request(id: i64, event_id: i64, event_name: &str, status: RequestStatus) -> CollaborationRequest {
    CollaborationRequest {
        id,
        event_id,
        event_name: event_name.to_string(),
        sender_name: "Alice".to_string(),
        sender_email: None,
        status,
    }
}

fn status_error(code: u16, server_error: Option<&str>) -> BackendError {
    BackendError::Status {
        status: StatusCode::from_u16(code).unwrap(),
        body: String::new(),
        server_error: server_error.map(str::to_string),
    }
}

/// Yield to spawned tasks until `check` holds.
async fn until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..1000 {
        if check().await {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}

/// Watch `event_id`, load its table, and let the status task's immediate
/// first tick finish so later gates are only hit by the test's own fetches.
async fn watch_loaded(engine: &SyncEngine, backend: &RecordingBackend, event_id: i64) {
    let before = backend.status_calls().await;
    engine.watch_event(event_id).await;
    engine.poll_status().await.unwrap();
    until(|| async move { backend.status_calls().await >= before + 2 }).await;
}

#[tokio::test]
async fn accepted_sent_request_notifies_once_across_polls() {
    let backend = RecordingBackend::default();
    *backend.sent.lock().await = vec![
        request(7, 3, "Spring Gala", RequestStatus::Accepted),
        request(8, 4, "Hackathon", RequestStatus::Pending),
    ];
    let (engine, cue) = engine_with(&backend, None);

    engine.poll_requests().await.unwrap();
    engine.poll_requests().await.unwrap();

    let feed = engine.feed().await;
    assert_eq!(feed.len(), 1);
    assert_eq!(feed[0].id, "sentRequest:7:ACCEPTED");
    assert_eq!(feed[0].message, "Your invitation to \"Spring Gala\" was accepted");
    assert_eq!(feed[0].kind, NotificationKind::Success);
    assert_eq!(feed[0].target_view, Some(TargetView::Overview));
    assert_eq!(cue.raised(), vec!["sentRequest:7:ACCEPTED".to_string()]);
}

#[tokio::test]
async fn own_action_log_entries_are_not_surfaced() {
    let backend = RecordingBackend::default();
    *backend.log.lock().await = vec![
        ActionLogEntry {
            id: 1,
            user_id: 42,
            user_name: "Me".into(),
            action: "generated certificates".into(),
            event_id: 3,
            details: None,
            timestamp: None,
        },
        ActionLogEntry {
            id: 2,
            user_id: 7,
            user_name: "Bob".into(),
            action: "added participant".into(),
            event_id: 3,
            details: Some("Carol".into()),
            timestamp: Some("2024-05-01T09:30:00".into()),
        },
    ];
    let (engine, _cue) = engine_with(&backend, Some(42));

    engine.poll_action_log().await.unwrap();

    let feed = engine.feed().await;
    assert_eq!(feed.len(), 1);
    assert_eq!(feed[0].message, "Bob added participant: Carol");
    assert_eq!(feed[0].display_time, "May 1, 09:30");
    assert_eq!(feed[0].target_view, Some(TargetView::Collaborators));
}

#[tokio::test]
async fn failed_generation_converges_to_server_state() {
    let backend = RecordingBackend::default();
    backend
        .set_status(vec![record(1, GenerationStatus::NotGenerated, EmailStatus::NotSent)])
        .await;
    *backend.events.lock().await = vec![EventSummary {
        id: 5,
        event_name: "Spring Gala".into(),
        event_date: None,
    }];
    let (engine, _cue) = engine_with(&backend, None);
    engine.requests().refresh_events().await.unwrap();
    engine.watch_event(5).await;
    engine.poll_status().await.unwrap();

    backend
        .fail_next_action(status_error(500, Some("Template missing")))
        .await;
    let err = engine
        .run_action(JobAction::GenerateCertificates { event_id: 5 })
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "Template missing");
    assert_eq!(backend.calls().await, vec!["generate:5".to_string()]);
    let statuses = engine.job_statuses().await;
    assert_eq!(statuses[0].generation_status, GenerationStatus::NotGenerated);
    let feed = engine.feed().await;
    assert_eq!(feed[0].kind, NotificationKind::Error);
    assert_eq!(feed[0].message, "Template missing");
    assert_eq!(feed[0].related_event_id, Some(5));
    engine.shutdown().await;
}

#[tokio::test]
async fn successful_generation_switches_status_cadence() {
    let backend = RecordingBackend::default();
    backend
        .set_status(vec![record(1, GenerationStatus::NotGenerated, EmailStatus::NotSent)])
        .await;
    let (engine, _cue) = engine_with(&backend, None);
    let options = EngineOptions::default();
    engine.watch_event(5).await;
    engine.poll_status().await.unwrap();

    backend
        .set_status(vec![record(1, GenerationStatus::Pending, EmailStatus::NotSent)])
        .await;
    engine
        .run_action(JobAction::GenerateCertificates { event_id: 5 })
        .await
        .unwrap();

    let task = engine.status_task().unwrap();
    assert_eq!(task.interval(), options.polling.status_fast_interval());
    assert_eq!(
        engine.feed().await[0].message,
        "Certificates generated for event #5"
    );

    backend
        .set_status(vec![record(1, GenerationStatus::Generated, EmailStatus::NotSent)])
        .await;
    engine.poll_status().await.unwrap();
    assert_eq!(task.interval(), options.polling.status_idle_interval());
    engine.shutdown().await;
}

#[tokio::test]
async fn stale_snapshot_does_not_overwrite_optimistic_state() {
    let backend = RecordingBackend::default();
    backend
        .set_status(vec![record(1, GenerationStatus::NotGenerated, EmailStatus::NotSent)])
        .await;
    let (engine, _cue) = engine_with(&backend, None);
    let engine = Arc::new(engine);
    watch_loaded(&engine, &backend, 5).await;

    // A status fetch issued before the action reads the old table and stalls.
    let gate = backend.gate_status().await;
    let calls_before = backend.status_calls().await;
    let stale = tokio::spawn({
        let engine = engine.clone();
        async move { engine.poll_status().await }
    });
    let b = &backend;
    until(|| async move { b.status_calls().await > calls_before }).await;

    backend
        .set_status(vec![record(1, GenerationStatus::Pending, EmailStatus::NotSent)])
        .await;
    engine
        .run_action(JobAction::GenerateCertificates { event_id: 5 })
        .await
        .unwrap();

    gate.notify_one();
    stale.await.unwrap().unwrap();

    let statuses = engine.job_statuses().await;
    assert_eq!(statuses[0].generation_status, GenerationStatus::Pending);
    engine.shutdown().await;
}

#[tokio::test]
async fn generation_with_empty_roster_is_rejected_locally() {
    let backend = RecordingBackend::default();
    let (engine, _cue) = engine_with(&backend, None);
    engine.watch_event(5).await;
    engine.poll_status().await.unwrap();

    let err = engine
        .run_action(JobAction::GenerateCertificates { event_id: 5 })
        .await
        .unwrap_err();

    assert!(matches!(err, ActionError::EmptyRoster));
    assert!(backend.calls().await.is_empty());
    assert_eq!(
        engine.feed().await[0].message,
        "Add participants before generating certificates"
    );
    engine.shutdown().await;
}

#[tokio::test]
async fn send_all_only_marks_generated_records_sending() {
    let backend = RecordingBackend::default();
    let snapshot = vec![
        record(1, GenerationStatus::Generated, EmailStatus::NotSent),
        record(2, GenerationStatus::NotGenerated, EmailStatus::NotSent),
    ];
    backend.set_status(snapshot.clone()).await;
    let (engine, _cue) = engine_with(&backend, None);
    watch_loaded(&engine, &backend, 5).await;

    // Freeze the post-action reconcile so the optimistic table is observable.
    let gate = backend.gate_status().await;
    let engine = Arc::new(engine);
    let action = tokio::spawn({
        let engine = engine.clone();
        async move {
            engine
                .run_action(JobAction::SendAllEmails { event_id: 5 })
                .await
        }
    });
    let b = &backend;
    until(|| async move { !b.calls().await.is_empty() }).await;

    let statuses = engine.job_statuses().await;
    assert_eq!(statuses[0].email_status, EmailStatus::Sending);
    assert_eq!(statuses[1].email_status, EmailStatus::NotSent);

    gate.notify_one();
    action.await.unwrap().unwrap();
    // Bulk email success stays out of the feed.
    assert!(engine.feed().await.is_empty());
    engine.shutdown().await;
}

#[tokio::test]
async fn accepting_invitation_refreshes_requests_and_events() {
    let backend = RecordingBackend::default();
    *backend.received.lock().await = vec![request(3, 9, "Robotics Cup", RequestStatus::Pending)];
    let (engine, cue) = engine_with(&backend, None);

    engine.poll_requests().await.unwrap();
    assert_eq!(engine.pending_requests().await.len(), 1);
    assert_eq!(
        engine.feed().await[0].message,
        "Alice invited you to collaborate on \"Robotics Cup\""
    );

    backend.received.lock().await.clear();
    *backend.events.lock().await = vec![EventSummary {
        id: 9,
        event_name: "Robotics Cup".into(),
        event_date: Some("2024-06-01".into()),
    }];
    engine.accept_request(3).await.unwrap();

    assert_eq!(backend.calls().await, vec!["accept:3".to_string()]);
    assert!(engine.pending_requests().await.is_empty());
    assert_eq!(engine.requests().events().await.len(), 1);
    let feed = engine.feed().await;
    assert_eq!(feed[0].message, "You joined \"Robotics Cup\"");
    assert_eq!(feed[0].kind, NotificationKind::Success);
    assert_eq!(cue.raised().len(), 2);
}

#[tokio::test]
async fn failed_decline_surfaces_server_error() {
    let backend = RecordingBackend::default();
    *backend.received.lock().await = vec![request(3, 9, "Robotics Cup", RequestStatus::Pending)];
    let (engine, _cue) = engine_with(&backend, None);
    engine.poll_requests().await.unwrap();

    backend
        .fail_next_action(status_error(409, Some("Request already handled")))
        .await;
    let err = engine.decline_request(3).await.unwrap_err();

    assert_eq!(err.to_string(), "Request already handled");
    let feed = engine.feed().await;
    assert_eq!(feed[0].kind, NotificationKind::Error);
    assert_eq!(feed[0].message, "Request already handled");
    // The roster was refreshed anyway.
    assert_eq!(engine.pending_requests().await.len(), 1);
}

#[tokio::test]
async fn results_arriving_after_cancel_are_discarded() {
    let backend = RecordingBackend::default();
    *backend.messages.lock().await = vec![UnreadMessage {
        id: 1,
        sender_name: "Bob".into(),
        content: "hello".into(),
        timestamp: None,
        event_id: 12,
    }];
    let (engine, cue) = engine_with(&backend, None);
    let engine = Arc::new(engine);

    let gate = backend.gate_messages().await;
    let poll = tokio::spawn({
        let engine = engine.clone();
        async move { engine.poll_messages().await }
    });
    let b = &backend;
    until(|| async move { b.message_calls().await > 0 }).await;

    engine.cancel();
    gate.notify_one();
    poll.await.unwrap().unwrap();

    assert!(engine.is_shut_down());
    assert!(engine.feed().await.is_empty());
    assert!(cue.raised().is_empty());
    assert!(matches!(
        engine
            .run_action(JobAction::SendAllEmails { event_id: 12 })
            .await,
        Err(ActionError::ShutDown)
    ));
}

#[tokio::test]
async fn opening_a_notification_watches_its_event() {
    let backend = RecordingBackend::default();
    *backend.messages.lock().await = vec![UnreadMessage {
        id: 1,
        sender_name: "Bob".into(),
        content: "hello".into(),
        timestamp: None,
        event_id: 12,
    }];
    let (engine, _cue) = engine_with(&backend, None);
    engine.poll_messages().await.unwrap();

    let navigation = engine.open_notification("message:1").await;

    assert_eq!(
        navigation,
        Some(Navigation {
            event_id: 12,
            tab: Some(TargetView::Messages),
        })
    );
    assert_eq!(engine.watched_event().await, Some(12));
    let task = engine.status_task().unwrap();
    assert_eq!(task.name(), "certificate_status");
    assert_eq!(task.interval(), Duration::from_millis(30_000));
    assert_eq!(engine.open_notification("missing").await, None);
    engine.shutdown().await;
}

#[tokio::test]
async fn failed_status_fetch_leaves_job_table_unchanged() {
    let backend = RecordingBackend::default();
    let snapshot = vec![
        record(1, GenerationStatus::Generated, EmailStatus::NotSent),
        record(2, GenerationStatus::NotGenerated, EmailStatus::NotSent),
    ];
    backend.set_status(snapshot.clone()).await;
    let (engine, _cue) = engine_with(&backend, None);
    watch_loaded(&engine, &backend, 5).await;

    backend
        .fail_next_read("certificate_status", status_error(503, None))
        .await;
    assert!(engine.poll_status().await.is_err());

    assert_eq!(engine.job_statuses().await, snapshot);
    // The table is still loaded and non-empty, so generation is not refused.
    engine
        .run_action(JobAction::GenerateCertificates { event_id: 5 })
        .await
        .unwrap();
    assert_eq!(backend.calls().await, vec!["generate:5".to_string()]);
    engine.shutdown().await;
}

#[tokio::test]
async fn failed_message_fetch_leaves_feed_unchanged() {
    let backend = RecordingBackend::default();
    *backend.messages.lock().await = vec![UnreadMessage {
        id: 1,
        sender_name: "Bob".into(),
        content: "hello".into(),
        timestamp: None,
        event_id: 12,
    }];
    let (engine, cue) = engine_with(&backend, None);
    engine.poll_messages().await.unwrap();
    let before = engine.feed().await;

    backend.messages.lock().await.push(UnreadMessage {
        id: 2,
        sender_name: "Bob".into(),
        content: "again".into(),
        timestamp: None,
        event_id: 12,
    });
    backend
        .fail_next_read("unread_messages", status_error(502, None))
        .await;
    assert!(engine.poll_messages().await.is_err());

    assert_eq!(engine.feed().await, before);
    assert_eq!(cue.raised().len(), 1);

    // The next tick retries and picks up what was missed.
    engine.poll_messages().await.unwrap();
    assert_eq!(engine.feed().await[0].id, "message:2");
}
