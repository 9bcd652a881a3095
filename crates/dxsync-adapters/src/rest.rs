//! Per-kind CRUD against `/authoring/v1/{kind}`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::SecondsFormat;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, CONNECTION};
use reqwest::Method;
use serde_json::Value;
use tracing::debug;

use dxsync_core::{Artifact, ArtifactKind, Options, SyncError};
use dxsync_storage::http::{json_body, HttpClient, HttpRequest};

use crate::{ListFilter, Page, PageCursor, RemoteStore};

/// Characters escaped in query parameter values. `+` matters because the
/// base64 md5 form may contain it.
const QUERY_ENCODE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'<')
    .add(b'>')
    .add(b'&')
    .add(b'+')
    .add(b'%')
    .add(b'?');

pub(crate) fn encode_query(value: &str) -> String {
    utf8_percent_encode(value, QUERY_ENCODE).to_string()
}

pub(crate) const PUBLISH_PRIORITY_HEADER: &str = "x-ibm-dx-publish-priority";

/// Headers common to JSON reads and writes: JSON accept, caller locale,
/// keep-alive, and the publish-now priority marker on writes.
pub(crate) fn json_headers(opts: &Options, write: bool) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    let locale = opts.locale.as_deref().unwrap_or("en");
    if let Ok(value) = HeaderValue::from_str(locale) {
        headers.insert(ACCEPT_LANGUAGE, value);
    }
    headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    if write && opts.publish_now {
        headers.insert(PUBLISH_PRIORITY_HEADER, HeaderValue::from_static("now"));
    }
    headers
}

/// Map a bare status failure onto the not-found/conflict variants once the
/// caller can say what the request was about.
pub(crate) fn refine_status(err: SyncError, what: impl FnOnce() -> String) -> SyncError {
    match err.status() {
        Some(404) => SyncError::RemoteNotFound { what: what() },
        Some(409) => SyncError::Conflict { what: what() },
        _ => err,
    }
}

/// REST adapter for one artifact kind.
pub struct AuthoringApi {
    http: Arc<HttpClient>,
    base_url: String,
    kind: ArtifactKind,
}

impl AuthoringApi {
    pub fn new(http: Arc<HttpClient>, base_url: impl Into<String>, kind: ArtifactKind) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            kind,
        }
    }

    fn base<'a>(&'a self, opts: &'a Options) -> &'a str {
        opts.tenant_base_url
            .as_deref()
            .map(|url| url.trim_end_matches('/'))
            .unwrap_or(&self.base_url)
    }

    fn collection_url(&self, opts: &Options) -> String {
        format!("{}/authoring/v1/{}", self.base(opts), self.kind.api_segment())
    }

    fn item_url(&self, opts: &Options, id: &str) -> String {
        format!("{}/{}", self.collection_url(opts), encode_query(id))
    }

    fn require_id<'a>(&self, artifact: &'a Artifact, action: &str) -> Result<&'a str, SyncError> {
        artifact.id.as_deref().ok_or_else(|| {
            SyncError::Body(format!(
                "cannot {action} {} without an id",
                self.kind.label()
            ))
        })
    }

    async fn send_artifact(
        &self,
        method: Method,
        url: String,
        artifact: &Artifact,
        opts: &Options,
    ) -> Result<Artifact, SyncError> {
        let request = HttpRequest {
            method,
            url,
            headers: json_headers(opts, true),
            body: dxsync_storage::http::RequestBody::Json(artifact.to_value()),
        };
        let policy = self.http.policy().with_options(opts);
        let response = self.http.send_with_policy(&request, &policy).await?;
        let value: Value = json_body(response).await?;
        Artifact::from_value(value)
            .map_err(|err| SyncError::Body(format!("decoding {} body: {err}", self.kind.label())))
    }
}

#[async_trait]
impl RemoteStore for AuthoringApi {
    fn kind(&self) -> ArtifactKind {
        self.kind
    }

    async fn list(
        &self,
        cursor: PageCursor,
        filter: ListFilter,
        opts: &Options,
    ) -> Result<Page, SyncError> {
        let mut url = format!(
            "{}?offset={}&limit={}",
            self.collection_url(opts),
            cursor.offset,
            cursor.limit
        );
        if let Some(since) = filter.modified_since {
            url.push_str(&format!(
                "&modified-since={}",
                encode_query(&since.to_rfc3339_opts(SecondsFormat::Millis, true))
            ));
        }
        debug!(kind = self.kind.label(), offset = cursor.offset, "listing remote artifacts");

        let request = HttpRequest {
            method: Method::GET,
            url,
            headers: json_headers(opts, false),
            body: dxsync_storage::http::RequestBody::None,
        };
        let policy = self.http.policy().with_options(opts);
        let response = self.http.send_with_policy(&request, &policy).await?;
        let value: Value = json_body(response).await?;

        // Some listings wrap the page in `{"items": [...]}`, others return
        // a bare array.
        let raw_items = match value {
            Value::Array(items) => items,
            Value::Object(mut map) => match map.remove("items") {
                Some(Value::Array(items)) => items,
                _ => Vec::new(),
            },
            _ => Vec::new(),
        };
        let items = raw_items
            .into_iter()
            .map(Artifact::from_value)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| {
                SyncError::Body(format!("decoding {} listing: {err}", self.kind.label()))
            })?;
        let next = cursor.advance(items.len());
        Ok(Page { items, next })
    }

    async fn get(&self, id: &str, opts: &Options) -> Result<Artifact, SyncError> {
        let request = HttpRequest {
            method: Method::GET,
            url: self.item_url(opts, id),
            headers: json_headers(opts, false),
            body: dxsync_storage::http::RequestBody::None,
        };
        let policy = self.http.policy().with_options(opts);
        let response = self
            .http
            .send_with_policy(&request, &policy)
            .await
            .map_err(|err| refine_status(err, || format!("{} {id}", self.kind.label())))?;
        let value: Value = json_body(response).await?;
        Artifact::from_value(value)
            .map_err(|err| SyncError::Body(format!("decoding {} {id}: {err}", self.kind.label())))
    }

    async fn create(&self, artifact: &Artifact, opts: &Options) -> Result<Artifact, SyncError> {
        self.send_artifact(Method::POST, self.collection_url(opts), artifact, opts)
            .await
            .map_err(|err| {
                refine_status(err, || {
                    format!("{} {}", self.kind.label(), artifact.display_name())
                })
            })
    }

    async fn update(&self, artifact: &Artifact, opts: &Options) -> Result<Artifact, SyncError> {
        // Kinds without a revision token only support POST updates.
        if !self.kind.has_rev() || artifact.rev.is_none() {
            return self.create(artifact, opts).await;
        }

        let id = self.require_id(artifact, "update")?;
        let mut url = self.item_url(opts, id);
        if opts.force_override {
            url.push_str("?forceOverride=true");
        }
        self.send_artifact(Method::PUT, url, artifact, opts)
            .await
            .map_err(|err| {
                refine_status(err, || {
                    format!("{} {}", self.kind.label(), artifact.display_name())
                })
            })
    }

    async fn delete(&self, artifact: &Artifact, opts: &Options) -> Result<String, SyncError> {
        let id = self.require_id(artifact, "delete")?;
        let request = HttpRequest {
            method: Method::DELETE,
            url: self.item_url(opts, id),
            headers: json_headers(opts, false),
            body: dxsync_storage::http::RequestBody::None,
        };
        let policy = self.http.policy().with_options(opts);
        let response = self
            .http
            .send_with_policy(&request, &policy)
            .await
            .map_err(|err| refine_status(err, || format!("{} {id}", self.kind.label())))?;

        // 200 carries a message body, 204 carries nothing.
        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(|body| body.get("message").and_then(|m| m.as_str()).map(str::to_string))
            .or_else(|| (!text.trim().is_empty()).then(|| text.trim().to_string()))
            .unwrap_or_else(|| format!("deleted {} {id}", self.kind.label()));
        Ok(message)
    }
}
