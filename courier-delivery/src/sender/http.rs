//! Delivery to HTTP endpoints.

use std::time::{Duration, Instant};

use courier_common::outgoing;
use reqwest::header::{HeaderName, HeaderValue, USER_AGENT};
use tracing::{info, warn};

use super::payload::{self, Payload};
use crate::{
    model::{HttpEndpoint, Message},
    send_result::{ResultType, Retry, SendResult, generate_log_id},
    signing::RequestSigner,
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const OUTPUT_LIMIT: usize = 500;
const AGENT: &str = concat!("courier/", env!("CARGO_PKG_VERSION"));

/// Posts each message to one endpoint, one request per message.
#[derive(Debug)]
pub struct HttpSender {
    endpoint: HttpEndpoint,
    client: reqwest::Client,
    signer: Option<RequestSigner>,
    log_id: String,
}

impl HttpSender {
    #[must_use]
    pub fn new(endpoint: HttpEndpoint, client: reqwest::Client) -> Self {
        Self {
            endpoint,
            client,
            signer: None,
            log_id: generate_log_id(),
        }
    }

    /// Signs every request body with `signer`.
    #[must_use]
    pub fn with_signer(mut self, signer: Option<RequestSigner>) -> Self {
        self.signer = signer;
        self
    }

    pub async fn send_message(&mut self, message: &Message) -> SendResult {
        let started = Instant::now();
        let timeout = self
            .endpoint
            .timeout
            .map_or(DEFAULT_TIMEOUT, Duration::from_secs);

        let request = self
            .client
            .post(&self.endpoint.url)
            .timeout(timeout)
            .header(USER_AGENT, AGENT);
        let request = match payload::build(message, &self.endpoint) {
            Payload::Json(body) => request.json(&body),
            Payload::Form(fields) => request.form(&fields),
        };

        outgoing!(level = INFO, "Sending request to {} ({})", self.endpoint.url, self.log_id);

        let response = match request.build() {
            Ok(request) => self.client.execute(self.sign(request)).await,
            Err(err) => Err(err),
        };

        let (status, body) = match response {
            Ok(response) => {
                let status = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                (Some(status), body)
            }
            Err(err) => {
                info!(log_id = %self.log_id, "Request to {} failed: {err}", self.endpoint.url);
                (None, err.to_string())
            }
        };

        let mut result = classify(status);
        result.details = format!(
            "Received a {} from {}",
            status.map_or_else(|| "connection error".to_string(), |code| code.to_string()),
            self.endpoint.url
        );
        result.output = truncate(&body, OUTPUT_LIMIT).trim().to_string();
        result.secure = self.endpoint.url.starts_with("https://");
        result.log_id.clone_from(&self.log_id);
        result.set_elapsed(started.elapsed());
        result
    }

    /// Adds the signature headers. A request that cannot be signed goes out
    /// unsigned, and receivers that require signatures reject it.
    fn sign(&self, mut request: reqwest::Request) -> reqwest::Request {
        let Some(signer) = &self.signer else {
            return request;
        };
        let body = request
            .body()
            .and_then(reqwest::Body::as_bytes)
            .unwrap_or_default();

        let headers = match signer.headers(body) {
            Ok(headers) => headers,
            Err(err) => {
                warn!(log_id = %self.log_id, "Unable to sign request to {}: {err}", self.endpoint.url);
                return request;
            }
        };

        for (name, value) in headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(&value),
            ) {
                request.headers_mut().insert(name, value);
            }
        }
        request
    }
}

/// Maps a response status onto an outcome. `None` means no response arrived.
///
/// 429 is the endpoint shedding load rather than a fault in the message, so
/// it fails without a bounce and without a retry.
#[must_use]
pub fn classify(status: Option<u16>) -> SendResult {
    match status {
        Some(200..=299) => SendResult::new(ResultType::Sent),
        Some(500..=599) => SendResult::new(ResultType::SoftFail).with_retry(Retry::Yes),
        None => {
            let mut result = SendResult::new(ResultType::SoftFail).with_retry(Retry::Yes);
            result.connect_error = true;
            result
        }
        Some(429) => {
            let mut result = SendResult::new(ResultType::HardFail);
            result.suppress_bounce = true;
            result
        }
        Some(_) => SendResult::new(ResultType::HardFail),
    }
}

fn truncate(text: &str, limit: usize) -> &str {
    if text.len() <= limit {
        return text;
    }

    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
