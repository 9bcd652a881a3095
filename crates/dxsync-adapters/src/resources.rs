//! The content-addressed resource endpoints backing binary assets.

use std::sync::Arc;

use async_trait::async_trait;
use percent_encoding::percent_decode_str;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONNECTION, CONTENT_DISPOSITION, CONTENT_TYPE};
use reqwest::Method;
use serde_json::Value;
use tokio::io::AsyncWrite;
use tracing::debug;

use dxsync_core::{Artifact, Options, SyncError};
use dxsync_storage::http::{json_body, BodyFactory, HttpClient, HttpRequest, RequestBody};
use dxsync_storage::local::ContentDigest;

use crate::content_type::content_type_for;
use crate::rest::{encode_query, refine_status};
use crate::{Page, PageCursor};

/// One upload attempt's worth of identity: the stream factory re-opens the
/// content so the transport can retry without buffering it.
pub struct ResourceUpload {
    pub name: String,
    pub digest: Option<ContentDigest>,
    pub length: u64,
    pub factory: BodyFactory,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceHeaders {
    pub filename: Option<String>,
    pub content_type: Option<String>,
}

/// Blob half of the asset adapter. Implemented by [`AuthoringResources`]
/// against the live service and by test doubles in the engine tests.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Upload content, returning the server resource id. Content-addressed
    /// PUT is used when the md5 is known, plain POST otherwise.
    async fn upload(&self, upload: &ResourceUpload, opts: &Options) -> Result<String, SyncError>;

    async fn head(&self, resource_id: &str, opts: &Options) -> Result<bool, SyncError>;

    async fn download(
        &self,
        resource_id: &str,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
        opts: &Options,
    ) -> Result<ResourceHeaders, SyncError>;

    async fn list_by_created(&self, cursor: PageCursor, opts: &Options)
        -> Result<Page, SyncError>;
}

pub struct AuthoringResources {
    http: Arc<HttpClient>,
    base_url: String,
}

impl AuthoringResources {
    pub fn new(http: Arc<HttpClient>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn base<'a>(&'a self, opts: &'a Options) -> &'a str {
        opts.tenant_base_url
            .as_deref()
            .map(|url| url.trim_end_matches('/'))
            .unwrap_or(&self.base_url)
    }

    fn resources_url(&self, opts: &Options) -> String {
        format!("{}/authoring/v1/resources", self.base(opts))
    }

    fn upload_headers(&self, name: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static(content_type_for(name)),
        );
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        headers
    }
}

#[async_trait]
impl ResourceStore for AuthoringResources {
    async fn upload(&self, upload: &ResourceUpload, opts: &Options) -> Result<String, SyncError> {
        let (method, url, addressed_id) = match &upload.digest {
            Some(digest) => (
                Method::PUT,
                format!(
                    "{}/{}?name={}&md5={}",
                    self.resources_url(opts),
                    digest.hex,
                    encode_query(&upload.name),
                    encode_query(&digest.base64)
                ),
                Some(digest.hex.clone()),
            ),
            None => (
                Method::POST,
                format!(
                    "{}?name={}",
                    self.resources_url(opts),
                    encode_query(&upload.name)
                ),
                None,
            ),
        };
        debug!(name = upload.name.as_str(), ?method, "uploading resource");

        let request = HttpRequest {
            method,
            url,
            headers: self.upload_headers(&upload.name),
            body: RequestBody::Stream {
                length: Some(upload.length),
                factory: upload.factory.clone(),
            },
        };
        let policy = self.http.policy().with_options(opts);
        let response = match self.http.send_with_policy(&request, &policy).await {
            Ok(response) => response,
            // The blob is immutable, so "already exists" means the bytes are
            // there: success under createOnly.
            Err(err) if err.is_conflict() && opts.create_only => {
                return addressed_id.ok_or(err);
            }
            Err(err) => {
                return Err(refine_status(err, || format!("resource {}", upload.name)))
            }
        };

        let body: Value = match json_body(response).await {
            Ok(body) => body,
            Err(_) if addressed_id.is_some() => Value::Null,
            Err(err) => return Err(err),
        };
        body.get("id")
            .and_then(|id| id.as_str())
            .map(str::to_string)
            .or(addressed_id)
            .ok_or_else(|| {
                SyncError::Body(format!(
                    "resource upload response for {} carried no id",
                    upload.name
                ))
            })
    }

    async fn head(&self, resource_id: &str, opts: &Options) -> Result<bool, SyncError> {
        let request = HttpRequest {
            method: Method::HEAD,
            url: format!("{}/{}", self.resources_url(opts), encode_query(resource_id)),
            headers: HeaderMap::new(),
            body: RequestBody::None,
        };
        let policy = self.http.policy().with_options(opts);
        match self.http.send_with_policy(&request, &policy).await {
            Ok(_) => Ok(true),
            Err(err) if err.status() == Some(404) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn download(
        &self,
        resource_id: &str,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
        opts: &Options,
    ) -> Result<ResourceHeaders, SyncError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        let request = HttpRequest {
            method: Method::GET,
            url: format!("{}/{}", self.resources_url(opts), encode_query(resource_id)),
            headers,
            body: RequestBody::None,
        };
        let response_headers = self.http.download(&request, writer).await.map_err(|err| {
            match err.status() {
                Some(status) => SyncError::CannotGetAsset {
                    path: resource_id.to_string(),
                    status,
                },
                None => err,
            }
        })?;

        let filename = response_headers
            .get(CONTENT_DISPOSITION)
            .and_then(|value| value.to_str().ok())
            .and_then(filename_from_content_disposition);
        let content_type = response_headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        Ok(ResourceHeaders {
            filename,
            content_type,
        })
    }

    async fn list_by_created(
        &self,
        cursor: PageCursor,
        opts: &Options,
    ) -> Result<Page, SyncError> {
        let request = HttpRequest {
            method: Method::GET,
            url: format!(
                "{}/views/by-created?offset={}&limit={}",
                self.resources_url(opts),
                cursor.offset,
                cursor.limit
            ),
            headers: HeaderMap::new(),
            body: RequestBody::None,
        };
        let policy = self.http.policy().with_options(opts);
        let response = self.http.send_with_policy(&request, &policy).await?;
        let value: Value = json_body(response).await?;
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
            .map_err(|err| SyncError::Body(format!("decoding resource listing: {err}")))?;
        let next = cursor.advance(items.len());
        Ok(Page { items, next })
    }
}

/// Extract the filename from a `Content-Disposition` header, preferring the
/// RFC 5987 `filename*` form over the plain quoted one.
pub fn filename_from_content_disposition(value: &str) -> Option<String> {
    for part in value.split(';') {
        let part = part.trim();
        if let Some(rest) = part.strip_prefix("filename*=") {
            let mut pieces = rest.splitn(3, '\'');
            let charset = pieces.next()?;
            let _language = pieces.next()?;
            let encoded = pieces.next()?;
            if charset.eq_ignore_ascii_case("utf-8") {
                return percent_decode_str(encoded)
                    .decode_utf8()
                    .ok()
                    .map(|name| name.into_owned());
            }
        }
    }
    for part in value.split(';') {
        let part = part.trim();
        if let Some(rest) = part.strip_prefix("filename=") {
            return Some(rest.trim_matches('"').to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_filename_is_unquoted() {
        assert_eq!(
            filename_from_content_disposition("attachment; filename=\"banner.png\""),
            Some("banner.png".to_string())
        );
        assert_eq!(
            filename_from_content_disposition("attachment; filename=banner.png"),
            Some("banner.png".to_string())
        );
    }

    #[test]
    fn rfc5987_filename_is_decoded_and_preferred() {
        assert_eq!(
            filename_from_content_disposition(
                "attachment; filename=\"fallback.png\"; filename*=UTF-8''b%C3%A4nner%20neu.png"
            ),
            Some("bänner neu.png".to_string())
        );
    }

    #[test]
    fn missing_filename_yields_none() {
        assert_eq!(filename_from_content_disposition("inline"), None);
    }
}
