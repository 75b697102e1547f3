use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::config::Config;
use crate::model::{
    ActionLogEntry, CollaborationRequest, EventSummary, JobStatusRecord, UnreadMessage,
};

pub mod model;

use model::{decode_list, server_error};

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("failed to reach backend: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("backend error {status}: {body}")]
    Status {
        status: StatusCode,
        body: String,
        server_error: Option<String>,
    },
    #[error("invalid endpoint {0}")]
    Endpoint(String),
}

impl BackendError {
    /// The `error` field of a failure body, suitable for showing to the user.
    pub fn server_message(&self) -> Option<&str> {
        match self {
            BackendError::Status { server_error, .. } => server_error.as_deref(),
            _ => None,
        }
    }
}

/// Read and write endpoints of the certificate console consumed by the sync
/// engine. List reads never fail on shape: anything that is not an array is an
/// empty list.
#[async_trait]
pub trait ConsoleBackend: Send + Sync {
    async fn received_requests(&self) -> Result<Vec<CollaborationRequest>, BackendError>;

    async fn sent_requests(&self) -> Result<Vec<CollaborationRequest>, BackendError>;

    async fn action_log(&self) -> Result<Vec<ActionLogEntry>, BackendError>;

    async fn unread_messages(&self) -> Result<Vec<UnreadMessage>, BackendError>;

    async fn certificate_status(&self, event_id: i64)
        -> Result<Vec<JobStatusRecord>, BackendError>;

    async fn events(&self) -> Result<Vec<EventSummary>, BackendError>;

    async fn accept_request(&self, request_id: i64) -> Result<(), BackendError>;

    async fn decline_request(&self, request_id: i64) -> Result<(), BackendError>;

    async fn generate_certificates(&self, event_id: i64) -> Result<(), BackendError>;

    async fn send_certificate_email(&self, certificate_id: i64) -> Result<(), BackendError>;

    async fn send_all_emails(&self, event_id: i64) -> Result<(), BackendError>;

    async fn send_update_emails(
        &self,
        event_id: i64,
        subject: &str,
        content: &str,
    ) -> Result<(), BackendError>;
}

#[derive(Clone)]
pub struct HttpBackend {
    http: Client,
    base_url: Url,
    token: String,
}

impl fmt::Debug for HttpBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpBackend")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpBackend {
    pub fn new(base_url: &str, token: String, timeout: Duration) -> Result<Self, BackendError> {
        let base_url =
            Url::parse(base_url).map_err(|e| BackendError::Endpoint(format!("{base_url}: {e}")))?;
        let http = Client::builder()
            .user_agent(concat!("cert-console-sync/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            base_url,
            token,
        })
    }

    pub fn from_config(cfg: &Config) -> Result<Self, BackendError> {
        Self::new(
            &cfg.backend.base_url,
            cfg.backend.token.clone(),
            Duration::from_millis(cfg.backend.request_timeout_ms),
        )
    }

    fn endpoint(&self, path: &str) -> Result<Url, BackendError> {
        self.base_url
            .join(path)
            .map_err(|e| BackendError::Endpoint(format!("{path}: {e}")))
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<String, BackendError> {
        let url = self.endpoint(path)?;
        let mut req = self
            .http
            .request(method.clone(), url)
            .header("Authorization", format!("Bearer {}", self.token));
        if let Some(body) = body {
            req = req.json(&body);
        }
        let res = req.send().await?;
        let status = res.status();
        debug!(%method, path, %status, "backend response");
        if !status.is_success() {
            let text = res.text().await.unwrap_or_default();
            warn!(%status, path, "backend request failed");
            return Err(BackendError::Status {
                status,
                server_error: server_error(&text),
                body: text,
            });
        }
        // A body cut off mid-read is a failed fetch, not an empty one.
        Ok(res.text().await?)
    }

    async fn get_list<T: DeserializeOwned>(&self, path: &str) -> Result<Vec<T>, BackendError> {
        let text = self.send(Method::GET, path, None).await?;
        let value = match serde_json::from_str::<Value>(&text) {
            Ok(v) => v,
            Err(err) => {
                warn!(path, %err, "response is not JSON; treating as empty");
                Value::Null
            }
        };
        Ok(decode_list(value, path))
    }

    async fn post(&self, path: &str, body: Option<Value>) -> Result<(), BackendError> {
        self.send(Method::POST, path, body).await.map(|_| ())
    }
}

#[async_trait]
impl ConsoleBackend for HttpBackend {
    #[instrument(skip_all)]
    async fn received_requests(&self) -> Result<Vec<CollaborationRequest>, BackendError> {
        self.get_list("api/collaboration/requests").await
    }

    #[instrument(skip_all)]
    async fn sent_requests(&self) -> Result<Vec<CollaborationRequest>, BackendError> {
        self.get_list("api/collaboration/requests/sent").await
    }

    #[instrument(skip_all)]
    async fn action_log(&self) -> Result<Vec<ActionLogEntry>, BackendError> {
        self.get_list("api/collaboration/logs").await
    }

    #[instrument(skip_all)]
    async fn unread_messages(&self) -> Result<Vec<UnreadMessage>, BackendError> {
        self.get_list("collaboration/messages/unread").await
    }

    #[instrument(skip(self))]
    async fn certificate_status(
        &self,
        event_id: i64,
    ) -> Result<Vec<JobStatusRecord>, BackendError> {
        self.get_list(&format!("certificates/events/{event_id}/status"))
            .await
    }

    #[instrument(skip_all)]
    async fn events(&self) -> Result<Vec<EventSummary>, BackendError> {
        self.get_list("events").await
    }

    #[instrument(skip(self))]
    async fn accept_request(&self, request_id: i64) -> Result<(), BackendError> {
        self.post(
            &format!("api/collaboration/requests/{request_id}/accept"),
            None,
        )
        .await
    }

    #[instrument(skip(self))]
    async fn decline_request(&self, request_id: i64) -> Result<(), BackendError> {
        self.post(
            &format!("api/collaboration/requests/{request_id}/decline"),
            None,
        )
        .await
    }

    #[instrument(skip(self))]
    async fn generate_certificates(&self, event_id: i64) -> Result<(), BackendError> {
        self.post(&format!("certificates/events/{event_id}/generate"), None)
            .await
    }

    #[instrument(skip(self))]
    async fn send_certificate_email(&self, certificate_id: i64) -> Result<(), BackendError> {
        self.post(&format!("certificates/{certificate_id}/send-email"), None)
            .await
    }

    #[instrument(skip(self))]
    async fn send_all_emails(&self, event_id: i64) -> Result<(), BackendError> {
        self.post(&format!("certificates/events/{event_id}/send-all"), None)
            .await
    }

    #[instrument(skip(self, content))]
    async fn send_update_emails(
        &self,
        event_id: i64,
        subject: &str,
        content: &str,
    ) -> Result<(), BackendError> {
        self.post(
            &format!("certificates/events/{event_id}/send-updates"),
            Some(json!({ "subject": subject, "content": content })),
        )
        .await
    }
}
