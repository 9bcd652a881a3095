//! HTTP transport with the retry policy the whole engine funnels through.
//!
//! Retries happen here so that anything stubbing the transport in tests
//! exercises the same backoff behavior the real clients see. A request is
//! retried only when the server answered with a status in the retry set;
//! transport failures without a status are surfaced immediately.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::StreamExt;
use rand::{thread_rng, Rng};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH};
use reqwest::{Method, Response};
use serde::de::DeserializeOwned;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

use dxsync_core::{Options, SyncError};

/// Statuses retried by default: throttling plus the transient 5xx family.
pub const DEFAULT_RETRY_STATUS_CODES: [u16; 5] = [429, 500, 502, 503, 504];

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub min_timeout: Duration,
    pub max_timeout: Duration,
    pub factor: f64,
    pub randomize: bool,
    pub status_codes: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            min_timeout: Duration::from_millis(500),
            max_timeout: Duration::from_secs(10),
            factor: 2.0,
            randomize: true,
            status_codes: DEFAULT_RETRY_STATUS_CODES.to_vec(),
        }
    }
}

impl RetryPolicy {
    /// Apply per-call overrides from the options bag.
    pub fn with_options(&self, opts: &Options) -> Self {
        Self {
            max_attempts: self.max_attempts,
            min_timeout: opts.retry_min_timeout.unwrap_or(self.min_timeout),
            max_timeout: opts.retry_max_timeout.unwrap_or(self.max_timeout),
            factor: opts.retry_factor.unwrap_or(self.factor),
            randomize: opts.retry_randomize.unwrap_or(self.randomize),
            status_codes: opts
                .retry_status_codes
                .clone()
                .unwrap_or_else(|| self.status_codes.clone()),
        }
    }

    pub fn retries_status(&self, status: u16) -> bool {
        self.status_codes.contains(&status)
    }

    /// Exponential delay before re-issuing attempt `attempt_index + 2`,
    /// jittered when `randomize` is set and clamped to `max_timeout`.
    pub fn delay_for_attempt(&self, attempt_index: u32) -> Duration {
        let base = self.min_timeout.as_millis() as f64 * self.factor.powi(attempt_index as i32);
        let jittered = if self.randomize {
            base * thread_rng().gen_range(1.0..2.0)
        } else {
            base
        };
        Duration::from_millis(jittered as u64).min(self.max_timeout)
    }
}

/// Produces a fresh request body for every attempt, so streamed uploads can
/// be retried without buffering the payload.
pub type BodyFactory =
    Arc<dyn Fn() -> BoxFuture<'static, std::io::Result<reqwest::Body>> + Send + Sync>;

/// Body factory that re-opens a file per attempt and streams it in chunks.
pub fn file_body_factory(path: std::path::PathBuf) -> BodyFactory {
    Arc::new(move || {
        let path = path.clone();
        Box::pin(async move {
            let file = tokio::fs::File::open(&path).await?;
            let stream = tokio_util::io::ReaderStream::new(file);
            Ok(reqwest::Body::wrap_stream(stream))
        })
    })
}

#[derive(Clone, Default)]
pub enum RequestBody {
    #[default]
    None,
    Json(serde_json::Value),
    Bytes(Bytes),
    Stream {
        length: Option<u64>,
        factory: BodyFactory,
    },
}

#[derive(Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: RequestBody,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: RequestBody::None,
        }
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn json(mut self, value: serde_json::Value) -> Self {
        self.body = RequestBody::Json(value);
        self
    }

    pub fn stream(mut self, length: Option<u64>, factory: BodyFactory) -> Self {
        self.body = RequestBody::Stream { length, factory };
        self
    }
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub user_agent: Option<String>,
    pub connect_timeout: Duration,
    pub basic_auth: Option<(String, String)>,
    pub policy: RetryPolicy,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: None,
            connect_timeout: Duration::from_secs(10),
            basic_auth: None,
            policy: RetryPolicy::default(),
        }
    }
}

pub struct HttpClient {
    client: reqwest::Client,
    basic_auth: Option<(String, String)>,
    policy: RetryPolicy,
}

impl HttpClient {
    pub fn new(config: HttpConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .connect_timeout(config.connect_timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            basic_auth: config.basic_auth,
            policy: config.policy,
        })
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn send(&self, req: &HttpRequest) -> Result<Response, SyncError> {
        self.send_with_policy(req, &self.policy).await
    }

    /// Issue a request, retrying per `policy` while the server answers with
    /// a retryable status. Success is any 2xx; everything else maps onto the
    /// engine error taxonomy.
    pub async fn send_with_policy(
        &self,
        req: &HttpRequest,
        policy: &RetryPolicy,
    ) -> Result<Response, SyncError> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let response = self.issue(req).await?;
            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }

            if policy.retries_status(status.as_u16()) {
                if attempt >= policy.max_attempts {
                    return Err(SyncError::Transient {
                        attempts: attempt,
                        last_status: status.as_u16(),
                    });
                }
                let delay = policy.delay_for_attempt(attempt - 1);
                debug!(
                    url = req.url.as_str(),
                    status = status.as_u16(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retrying after transient status"
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            return Err(decode_failure(response).await);
        }
    }

    /// Stream a response body into `writer`. The status/header exchange goes
    /// through the normal retry path; once bytes start flowing the transfer
    /// is not restarted.
    pub async fn download<W>(
        &self,
        req: &HttpRequest,
        writer: &mut W,
    ) -> Result<HeaderMap, SyncError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let response = self.send(req).await?;
        let headers = response.headers().clone();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|err| SyncError::Network {
                message: err.to_string(),
            })?;
            writer.write_all(&chunk).await.map_err(|err| SyncError::LocalIo {
                context: format!("writing download body for {}", req.url),
                source: err,
            })?;
        }
        writer.flush().await.map_err(|err| SyncError::LocalIo {
            context: format!("flushing download body for {}", req.url),
            source: err,
        })?;
        Ok(headers)
    }

    async fn issue(&self, req: &HttpRequest) -> Result<Response, SyncError> {
        let mut builder = self
            .client
            .request(req.method.clone(), &req.url)
            .headers(req.headers.clone());

        if let Some((user, password)) = &self.basic_auth {
            builder = builder.basic_auth(user, Some(password));
        }

        builder = match &req.body {
            RequestBody::None => builder,
            RequestBody::Json(value) => builder.json(value),
            RequestBody::Bytes(bytes) => builder.body(bytes.clone()),
            RequestBody::Stream { length, factory } => {
                let body = factory().await.map_err(|err| SyncError::LocalIo {
                    context: format!("opening upload body for {}", req.url),
                    source: err,
                })?;
                if let Some(length) = length {
                    builder = builder.header(CONTENT_LENGTH, *length);
                }
                builder.body(body)
            }
        };

        builder.send().await.map_err(|err| SyncError::Network {
            message: err.to_string(),
        })
    }
}

/// Parse a JSON response body, mapping decode failures onto the taxonomy.
pub async fn json_body<T: DeserializeOwned>(response: Response) -> Result<T, SyncError> {
    let url = response.url().to_string();
    response
        .json()
        .await
        .map_err(|err| SyncError::Body(format!("decoding response from {url}: {err}")))
}

/// Decode a non-retryable failure response into a `Permanent` error,
/// surfacing the server's message when the body carries one.
async fn decode_failure(response: Response) -> SyncError {
    let status = response.status().as_u16();
    let text = response.text().await.unwrap_or_default();
    let message = match serde_json::from_str::<serde_json::Value>(&text) {
        Ok(body) => body
            .get("message")
            .and_then(|m| m.as_str())
            .or_else(|| {
                body.get("errors")
                    .and_then(|e| e.get(0))
                    .and_then(|e| e.get("message"))
                    .and_then(|m| m.as_str())
            })
            .map(str::to_string)
            .unwrap_or(text),
        Err(_) => text,
    };
    let mut message = message.trim().to_string();
    message.truncate(500);
    SyncError::Permanent { status, message }
}
