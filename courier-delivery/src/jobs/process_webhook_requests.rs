use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde_json::{Value, json};
use tracing::{Instrument, error, info, info_span, warn};

use super::Job;
use crate::{
    Result,
    context::WorkerContext,
    queue::{WebhookRequest, WebhookRequestRepository},
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Delay before each retry, indexed by the attempt that just failed.
/// A request that fails its last listed attempt is dropped.
pub const WEBHOOK_RETRIES: [TimeDelta; 5] = [
    TimeDelta::minutes(2),
    TimeDelta::minutes(3),
    TimeDelta::minutes(6),
    TimeDelta::minutes(10),
    TimeDelta::minutes(15),
];

/// The delay after failed attempt number `attempt` (1-based), if another
/// attempt should be made.
#[must_use]
pub fn retry_delay_for(attempt: i64) -> Option<TimeDelta> {
    let index = usize::try_from(attempt.checked_sub(1)?).ok()?;
    WEBHOOK_RETRIES.get(index).copied()
}

/// A claimed webhook request and the operations a deliverer may perform on
/// it.
pub struct WebhookRequestHandle<'a> {
    repo: WebhookRequestRepository<'a>,
    request: WebhookRequest,
}

impl<'a> WebhookRequestHandle<'a> {
    #[must_use]
    pub const fn new(repo: WebhookRequestRepository<'a>, request: WebhookRequest) -> Self {
        Self { repo, request }
    }

    #[must_use]
    pub const fn request(&self) -> &WebhookRequest {
        &self.request
    }

    pub async fn record_error(&self, error: &str) -> Result<()> {
        self.repo.record_error(&self.request, error).await?;
        Ok(())
    }

    /// Releases the request to be claimed again after `delay`, or after the
    /// default backoff.
    pub async fn retry_later(self, delay: Option<TimeDelta>) -> Result<DateTime<Utc>> {
        Ok(self.repo.retry_later(&self.request, delay).await?)
    }

    pub async fn delete(self) -> Result<()> {
        self.repo.delete(&self.request).await?;
        Ok(())
    }
}

/// Delivers one claimed webhook request.
///
/// Implementations must leave the row deleted or released: on failure they
/// call [`WebhookRequestHandle::retry_later`].
#[async_trait]
pub trait WebhookDeliverer: Send + Sync {
    async fn deliver(&self, handle: WebhookRequestHandle<'_>) -> Result<()>;
}

/// Posts the request as JSON and follows [`WEBHOOK_RETRIES`] on failure.
#[derive(Debug, Clone)]
pub struct HttpWebhookDeliverer {
    client: reqwest::Client,
}

impl HttpWebhookDeliverer {
    #[must_use]
    pub const fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn body(request: &WebhookRequest) -> Value {
        let payload = serde_json::from_str(&request.payload)
            .unwrap_or_else(|_| Value::String(request.payload.clone()));

        #[allow(clippy::cast_precision_loss)]
        let timestamp = request.created_at.timestamp_micros() as f64 / 1_000_000.0;

        json!({
            "event": request.event,
            "timestamp": timestamp,
            "payload": payload,
            "uuid": request.uuid,
        })
    }
}

#[async_trait]
impl WebhookDeliverer for HttpWebhookDeliverer {
    async fn deliver(&self, handle: WebhookRequestHandle<'_>) -> Result<()> {
        let request = handle.request().clone();
        info!("Sending webhook request to {}", request.url);

        let status = match self
            .client
            .post(&request.url)
            .timeout(REQUEST_TIMEOUT)
            .json(&Self::body(&request))
            .send()
            .await
        {
            Ok(response) => Some(response.status().as_u16()),
            Err(err) => {
                warn!("Webhook request to {} failed: {err}", request.url);
                None
            }
        };

        if let Some(code @ 200..=299) = status {
            info!("Received {code} status code. That's OK.");
            return handle.delete().await;
        }

        let message = match status {
            Some(code) => {
                error!("Received {code} status code. That's not OK.");
                format!("Couldn't send to URL. Code received was {code}")
            }
            None => "Couldn't send to URL. No response was received".to_string(),
        };
        handle.record_error(&message).await?;

        let attempt = request.attempts + 1;
        match retry_delay_for(attempt) {
            Some(delay) => {
                let retry_after = handle.retry_later(Some(delay)).await?;
                info!("Will retry at {retry_after} (this was attempt {attempt})");
                Ok(())
            }
            None => {
                info!("Have tried {attempt} times. Giving up.");
                handle.delete().await
            }
        }
    }
}

/// Claims one webhook request per tick and hands it to a
/// [`WebhookDeliverer`].
pub struct ProcessWebhookRequests {
    context: WorkerContext,
    thread: String,
    deliverer: Arc<dyn WebhookDeliverer>,
}

impl std::fmt::Debug for ProcessWebhookRequests {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessWebhookRequests")
            .field("thread", &self.thread)
            .finish_non_exhaustive()
    }
}

impl ProcessWebhookRequests {
    #[must_use]
    pub fn new(context: WorkerContext, thread: impl Into<String>) -> Self {
        let deliverer = Arc::new(HttpWebhookDeliverer::new(context.http().clone()));
        Self::with_deliverer(context, thread, deliverer)
    }

    #[must_use]
    pub fn with_deliverer(
        context: WorkerContext,
        thread: impl Into<String>,
        deliverer: Arc<dyn WebhookDeliverer>,
    ) -> Self {
        Self {
            context,
            thread: thread.into(),
            deliverer,
        }
    }
}

#[async_trait]
impl Job for ProcessWebhookRequests {
    fn name(&self) -> &'static str {
        "ProcessWebhookRequests"
    }

    async fn call(&mut self) -> Result<bool> {
        let token = self.context.identity().claim_token(&self.thread);
        let repo = self.context.database().webhook_requests();
        let claimed = repo.claim_next(&token).await?;

        let mut worked = false;
        for request in claimed {
            worked = true;
            let span = info_span!(
                "webhook_request",
                id = request.id,
                webhook = request.webhook_id
            );
            let handle = WebhookRequestHandle::new(self.context.database().webhook_requests(), request.clone());

            if let Err(err) = self.deliverer.deliver(handle).instrument(span).await {
                error!(webhook_request = request.id, "Webhook delivery failed: {err}");
                repo.retry_later(&request, None).await?;
                return Err(err);
            }
        }

        Ok(worked)
    }
}

#[cfg(test)]
mod tests {
    use courier_common::identity::ProcessIdentity;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    use super::*;
    use crate::{
        DeliverySettings, MemoryMessageStore,
        queue::{Database, NewWebhookRequest},
        testing::StaticResolver,
    };

    async fn context() -> (tempfile::TempDir, WorkerContext) {
        let dir = tempfile::tempdir().unwrap();
        let database = Database::open_path(&dir.path().join("queue.db"), 4)
            .await
            .unwrap();
        let context = WorkerContext::new(
            ProcessIdentity::new("mx1.example.com", 42),
            database,
            Arc::new(MemoryMessageStore::new()),
            Arc::new(StaticResolver::default()),
            DeliverySettings::default(),
        );
        (dir, context)
    }

    async fn enqueue(context: &WorkerContext, url: &str) -> WebhookRequest {
        context
            .database()
            .webhook_requests()
            .create(&NewWebhookRequest {
                server_id: 1,
                webhook_id: Some(7),
                url: url.to_string(),
                event: "MessageSent".to_string(),
                uuid: "0b5c4a4e-6c6f-4f0b-9a59-8c1f2b8f9a10".to_string(),
                payload: r#"{"message":{"id":12}}"#.to_string(),
            })
            .await
            .unwrap()
    }

    /// Answers one request with `status` and returns its body.
    async fn one_shot_server(status: u16) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/hooks", listener.local_addr().unwrap());

        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let read = stream.read(&mut buf).await.unwrap();
                received.extend_from_slice(&buf[..read]);
                let text = String::from_utf8_lossy(&received).into_owned();
                if let Some((head, body)) = text.split_once("\r\n\r\n") {
                    let length = head
                        .lines()
                        .find_map(|line| {
                            let (name, value) = line.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if body.len() >= length {
                        let response = format!(
                            "HTTP/1.1 {status} Status\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                        );
                        stream.write_all(response.as_bytes()).await.unwrap();
                        return body.to_string();
                    }
                }
                if read == 0 {
                    return String::new();
                }
            }
        });

        (url, handle)
    }

    #[test]
    fn test_retry_schedule() {
        assert_eq!(retry_delay_for(0), None);
        assert_eq!(retry_delay_for(1), Some(TimeDelta::minutes(2)));
        assert_eq!(retry_delay_for(4), Some(TimeDelta::minutes(10)));
        assert_eq!(retry_delay_for(5), Some(TimeDelta::minutes(15)));
        assert_eq!(retry_delay_for(6), None);
    }

    #[tokio::test]
    async fn test_successful_delivery_deletes_request() {
        let (_dir, context) = context().await;
        let (url, server) = one_shot_server(200).await;
        enqueue(&context, &url).await;

        let mut job = ProcessWebhookRequests::new(context.clone(), "work0");
        assert!(job.call().await.unwrap());

        let body: Value = serde_json::from_str(&server.await.unwrap()).unwrap();
        assert_eq!(body["event"], "MessageSent");
        assert_eq!(body["payload"]["message"]["id"], 12);
        assert_eq!(context.database().webhook_requests().count().await.unwrap(), 0);

        assert!(!job.call().await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_delivery_is_rescheduled() {
        let (_dir, context) = context().await;
        let (url, server) = one_shot_server(503).await;
        let request = enqueue(&context, &url).await;

        let mut job = ProcessWebhookRequests::new(context.clone(), "work0");
        assert!(job.call().await.unwrap());
        server.await.unwrap();

        let row = context
            .database()
            .webhook_requests()
            .find(request.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.attempts, 1);
        assert_eq!(row.locked_at, None);
        assert_eq!(
            row.error.as_deref(),
            Some("Couldn't send to URL. Code received was 503")
        );
        let delay = row.retry_after.unwrap() - Utc::now();
        assert!(delay > TimeDelta::seconds(100) && delay <= TimeDelta::minutes(2));
    }

    #[tokio::test]
    async fn test_last_attempt_gives_up() {
        let (_dir, context) = context().await;
        let request = enqueue(&context, "http://127.0.0.1:9/hooks").await;
        sqlx::query("UPDATE webhook_requests SET attempts = 5 WHERE id = ?")
            .bind(request.id)
            .execute(context.database().pool())
            .await
            .unwrap();

        let mut job = ProcessWebhookRequests::new(context.clone(), "work0");
        assert!(job.call().await.unwrap());

        assert_eq!(context.database().webhook_requests().count().await.unwrap(), 0);
    }

    #[derive(Default)]
    struct RecordingDeliverer {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl WebhookDeliverer for RecordingDeliverer {
        async fn deliver(&self, handle: WebhookRequestHandle<'_>) -> Result<()> {
            self.seen.lock().push(handle.request().uuid.clone());
            handle.retry_later(Some(TimeDelta::hours(1))).await?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_one_request_per_tick() {
        let (_dir, context) = context().await;
        enqueue(&context, "https://hooks.example.com/a").await;
        enqueue(&context, "https://hooks.example.com/b").await;

        let deliverer = Arc::new(RecordingDeliverer::default());
        let mut job = ProcessWebhookRequests::with_deliverer(context.clone(), "work0", deliverer.clone());

        assert!(job.call().await.unwrap());
        assert_eq!(deliverer.seen.lock().len(), 1);
        assert!(job.call().await.unwrap());
        assert_eq!(deliverer.seen.lock().len(), 2);
        assert!(!job.call().await.unwrap());
    }
}
