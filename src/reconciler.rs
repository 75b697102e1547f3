//! Job status table for the event being viewed.
//!
//! User actions write an optimistic overlay immediately; every authoritative
//! snapshot replaces the table wholesale. There is no hand-rolled rollback:
//! a failed action is resolved by the next fresh snapshot like any other.
//!
//! Each optimistic write bumps an epoch. A snapshot whose fetch started before
//! the latest optimistic write is stale and is dropped, otherwise a poll that
//! was already in flight would briefly revert the user's action on screen.
use tracing::debug;

use crate::model::{EmailStatus, GenerationStatus, JobStatusRecord};

/// Fields to overwrite on every matching record. `None` leaves a field alone.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatusPatch {
    pub generation_status: Option<GenerationStatus>,
    pub email_status: Option<EmailStatus>,
    pub update_email_status: Option<EmailStatus>,
}

impl StatusPatch {
    pub fn generation(status: GenerationStatus) -> Self {
        Self {
            generation_status: Some(status),
            ..Default::default()
        }
    }

    pub fn email(status: EmailStatus) -> Self {
        Self {
            email_status: Some(status),
            ..Default::default()
        }
    }

    pub fn update_email(status: EmailStatus) -> Self {
        Self {
            update_email_status: Some(status),
            ..Default::default()
        }
    }
}

/// User-triggered background jobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobAction {
    GenerateCertificates { event_id: i64 },
    SendEmail { event_id: i64, certificate_id: i64 },
    SendAllEmails { event_id: i64 },
    SendUpdates { event_id: i64, subject: String, content: String },
}

impl JobAction {
    pub fn event_id(&self) -> i64 {
        match self {
            JobAction::GenerateCertificates { event_id }
            | JobAction::SendEmail { event_id, .. }
            | JobAction::SendAllEmails { event_id }
            | JobAction::SendUpdates { event_id, .. } => *event_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            JobAction::GenerateCertificates { .. } => "generate_certificates",
            JobAction::SendEmail { .. } => "send_email",
            JobAction::SendAllEmails { .. } => "send_all_emails",
            JobAction::SendUpdates { .. } => "send_updates",
        }
    }

    /// Records the optimistic patch applies to.
    pub fn targets(&self, record: &JobStatusRecord) -> bool {
        match self {
            JobAction::GenerateCertificates { .. } => {
                record.generation_status != GenerationStatus::Generated
            }
            JobAction::SendEmail { certificate_id, .. } => record.id == *certificate_id,
            JobAction::SendAllEmails { .. } => record.email_permitted(),
            JobAction::SendUpdates { .. } => true,
        }
    }

    pub fn optimistic_patch(&self) -> StatusPatch {
        match self {
            JobAction::GenerateCertificates { .. } => {
                StatusPatch::generation(GenerationStatus::Pending)
            }
            JobAction::SendEmail { .. } | JobAction::SendAllEmails { .. } => {
                StatusPatch::email(EmailStatus::Sending)
            }
            JobAction::SendUpdates { .. } => StatusPatch::update_email(EmailStatus::Sending),
        }
    }

    /// Feed entry on success; single and bulk certificate emails stay quiet.
    pub fn success_message(&self, event_name: &str) -> Option<String> {
        match self {
            JobAction::GenerateCertificates { .. } => {
                Some(format!("Certificates generated for {event_name}"))
            }
            JobAction::SendUpdates { .. } => Some(format!("Updates sent for {event_name}")),
            JobAction::SendEmail { .. } | JobAction::SendAllEmails { .. } => None,
        }
    }

    /// User-facing failure text. Email failures are almost always SMTP
    /// misconfiguration, so server text is not shown for them.
    pub fn failure_message(&self, server_error: Option<&str>) -> String {
        match self {
            JobAction::GenerateCertificates { .. } => server_error
                .map(str::to_string)
                .unwrap_or_else(|| "Failed to generate certificates".to_string()),
            JobAction::SendEmail { .. } => {
                "Failed to send email. Check SMTP configuration.".to_string()
            }
            JobAction::SendAllEmails { .. } => {
                "Failed to send emails. Check SMTP configuration.".to_string()
            }
            JobAction::SendUpdates { .. } => server_error
                .map(str::to_string)
                .unwrap_or_else(|| "Failed to send updates".to_string()),
        }
    }
}

#[derive(Debug, Default)]
pub struct StatusReconciler {
    records: Vec<JobStatusRecord>,
    epoch: u64,
    loaded: bool,
}

impl StatusReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite every matching record with `patch`, skipping fields whose
    /// transition is not legal from the record's current state. Returns the
    /// number of records changed.
    pub fn apply_optimistic<P>(&mut self, predicate: P, patch: StatusPatch) -> usize
    where
        P: Fn(&JobStatusRecord) -> bool,
    {
        let mut changed = 0;
        for record in self.records.iter_mut().filter(|r| predicate(r)) {
            if apply_patch(record, patch) {
                changed += 1;
            }
        }
        if changed > 0 {
            self.epoch += 1;
        }
        debug!(changed, epoch = self.epoch, "applied optimistic patch");
        changed
    }

    /// Apply the optimistic half of a user action.
    pub fn apply_action(&mut self, action: &JobAction) -> usize {
        let patch = action.optimistic_patch();
        self.apply_optimistic(|r| action.targets(r), patch)
    }

    /// Token to take before fetching a snapshot; see [`Self::reconcile_since`].
    pub fn ticket(&self) -> u64 {
        self.epoch
    }

    /// Replace local state with the authoritative snapshot.
    pub fn reconcile(&mut self, snapshot: Vec<JobStatusRecord>) {
        for fresh in &snapshot {
            if let Some(old) = self.records.iter().find(|r| r.id == fresh.id) {
                if !old.generation_status.can_transition_to(fresh.generation_status) {
                    debug!(
                        id = fresh.id,
                        from = old.generation_status.as_str(),
                        to = fresh.generation_status.as_str(),
                        "authoritative generation status skipped a state"
                    );
                }
            }
        }
        self.records = snapshot;
        self.loaded = true;
    }

    /// Reconcile unless an optimistic write happened after `ticket` was taken.
    pub fn reconcile_since(&mut self, ticket: u64, snapshot: Vec<JobStatusRecord>) -> bool {
        if ticket < self.epoch {
            debug!(ticket, epoch = self.epoch, "dropping stale status snapshot");
            return false;
        }
        self.reconcile(snapshot);
        true
    }

    pub fn current(&self) -> &[JobStatusRecord] {
        &self.records
    }

    pub fn get(&self, id: i64) -> Option<&JobStatusRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// At least one authoritative snapshot applied since the last reset.
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// True while any record is generating or sending.
    pub fn needs_fast_poll(&self) -> bool {
        self.records.iter().any(JobStatusRecord::is_transitional)
    }

    /// Forget everything, e.g. when the viewer switches events.
    pub fn reset(&mut self) {
        self.records.clear();
        self.loaded = false;
        self.epoch += 1;
    }
}

fn apply_patch(record: &mut JobStatusRecord, patch: StatusPatch) -> bool {
    let mut changed = false;
    if let Some(next) = patch.generation_status {
        if record.generation_status != next && record.generation_status.can_transition_to(next) {
            record.generation_status = next;
            changed = true;
        }
    }
    if let Some(next) = patch.email_status {
        if record.email_permitted()
            && record.email_status != next
            && record.email_status.can_transition_to(next)
        {
            record.email_status = next;
            changed = true;
        }
    }
    if let Some(next) = patch.update_email_status {
        if record.update_email_status != next && record.update_email_status.can_transition_to(next)
        {
            record.update_email_status = next;
            changed = true;
        }
    }
    changed
}
