//! put.io API v2 backend.
//!
//! Auth is a personal OAuth token sent as a bearer header on every request.
//! Listings are paged through `files/list` + `files/list/continue`; reads use
//! HTTP range requests against the download endpoint; uploads are one
//! multipart POST against the upload host.

use crate::cadapter::client::{
    AccountUsage, NodeId, RemoteClient, RemoteEntry, RemoteError, UploadBody,
};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue, RANGE};
use reqwest::multipart::{Form, Part};
use reqwest::{Body, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_API_URL: &str = "https://api.put.io/v2";
pub const DEFAULT_UPLOAD_URL: &str = "https://upload.put.io/v2";
pub const DEFAULT_PAGE_SIZE: u32 = 1000;

#[derive(Debug, Clone)]
pub struct PutioOptions {
    pub api_url: String,
    pub upload_url: String,
    pub page_size: u32,
    pub timeout: Duration,
}

impl Default for PutioOptions {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            upload_url: DEFAULT_UPLOAD_URL.to_string(),
            page_size: DEFAULT_PAGE_SIZE,
            timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Deserialize)]
struct FileResponse {
    file: RemoteEntry,
}

#[derive(Deserialize)]
struct ListResponse {
    files: Vec<RemoteEntry>,
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Deserialize)]
struct AccountInfoResponse {
    info: AccountInfo,
}

#[derive(Deserialize)]
struct AccountInfo {
    disk: DiskInfo,
}

#[derive(Deserialize)]
struct DiskInfo {
    avail: u64,
    size: u64,
    used: u64,
}

pub struct PutioClient {
    http: reqwest::Client,
    options: PutioOptions,
}

impl PutioClient {
    pub fn new(token: impl AsRef<str>, options: PutioOptions) -> Result<Self, RemoteError> {
        let http = client_with_authentication(token.as_ref(), options.timeout)?;
        Ok(Self { http, options })
    }

    fn api(&self, path: &str) -> String {
        format!("{}/{}", self.options.api_url.trim_end_matches('/'), path)
    }

    fn upload_endpoint(&self) -> String {
        format!(
            "{}/files/upload",
            self.options.upload_url.trim_end_matches('/')
        )
    }
}

fn client_with_authentication(token: &str, timeout: Duration) -> Result<reqwest::Client, RemoteError> {
    let mut headers = HeaderMap::new();
    let bearer = HeaderValue::from_str(&format!("Bearer {token}"))
        .map_err(|e| RemoteError::Config(format!("token is not a valid header value: {e}")))?;
    headers.insert(AUTHORIZATION, bearer);

    Ok(reqwest::Client::builder()
        .default_headers(headers)
        .timeout(timeout)
        .build()?)
}

/// Send a request and classify any non-success status.
async fn send_and_handle_unexpected(
    builder: RequestBuilder,
    id: NodeId,
) -> Result<Response, RemoteError> {
    let res = builder.send().await?;
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    match status {
        StatusCode::NOT_FOUND => Err(RemoteError::NotFound(id)),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Err(RemoteError::Unauthorized(status.as_u16()))
        }
        _ => {
            let message = res.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), %message, "unexpected put.io response");
            Err(RemoteError::Status {
                status: status.as_u16(),
                message,
            })
        }
    }
}

/// `Range` header value for bytes `[start, end)`. HTTP ranges are inclusive.
pub fn range_header(start: u64, end: u64) -> Option<String> {
    (end > start).then(|| format!("bytes={}-{}", start, end - 1))
}

#[async_trait]
impl RemoteClient for PutioClient {
    async fn fetch_metadata(&self, id: NodeId) -> Result<RemoteEntry, RemoteError> {
        let url = self.api(&format!("files/{id}"));
        let res = send_and_handle_unexpected(self.http.get(&url), id).await?;
        let body: FileResponse = res
            .json()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))?;
        Ok(body.file)
    }

    async fn list_children(&self, id: NodeId) -> Result<Vec<RemoteEntry>, RemoteError> {
        let url = self.api("files/list");
        let builder = self.http.get(&url).query(&[
            ("parent_id", id.to_string()),
            ("per_page", self.options.page_size.to_string()),
        ]);
        let mut page: ListResponse = send_and_handle_unexpected(builder, id)
            .await?
            .json()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))?;

        let mut files = std::mem::take(&mut page.files);
        let continue_url = self.api("files/list/continue");
        while let Some(cursor) = page.cursor.take().filter(|c| !c.is_empty()) {
            debug!(parent = id, fetched = files.len(), "continuing paged listing");
            let builder = self.http.post(&continue_url).form(&[
                ("cursor", cursor),
                ("per_page", self.options.page_size.to_string()),
            ]);
            page = send_and_handle_unexpected(builder, id)
                .await?
                .json()
                .await
                .map_err(|e| RemoteError::Decode(e.to_string()))?;
            files.append(&mut page.files);
        }
        Ok(files)
    }

    async fn download_range(
        &self,
        id: NodeId,
        start: u64,
        end: u64,
    ) -> Result<Bytes, RemoteError> {
        let Some(range) = range_header(start, end) else {
            return Ok(Bytes::new());
        };
        let url = self.api(&format!("files/{id}/download"));
        let res = send_and_handle_unexpected(self.http.get(&url).header(RANGE, range), id).await?;
        let partial = res.status() == StatusCode::PARTIAL_CONTENT;
        let body = res.bytes().await?;
        if partial {
            return Ok(body);
        }

        // Server ignored the range and sent the whole object.
        let len = body.len() as u64;
        let from = start.min(len) as usize;
        let to = end.min(len) as usize;
        Ok(body.slice(from..to.max(from)))
    }

    async fn upload(
        &self,
        parent_id: NodeId,
        name: &str,
        body: UploadBody,
    ) -> Result<RemoteEntry, RemoteError> {
        debug!(parent_id, file = name, len = body.len, "streaming upload");
        let part = Part::stream_with_length(Body::wrap_stream(body.stream), body.len)
            .file_name(name.to_string());
        let form = Form::new()
            .part("file", part)
            .text("filename", name.to_string())
            .text("parent_id", parent_id.to_string());
        let builder = self.http.post(self.upload_endpoint()).multipart(form);
        let body: FileResponse = send_and_handle_unexpected(builder, parent_id)
            .await?
            .json()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))?;
        Ok(body.file)
    }

    async fn account_usage(&self) -> Result<Option<AccountUsage>, RemoteError> {
        let url = self.api("account/info");
        let body: AccountInfoResponse = send_and_handle_unexpected(self.http.get(&url), 0)
            .await?
            .json()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))?;
        let disk = body.info.disk;
        Ok(Some(AccountUsage {
            total: disk.size,
            available: disk.avail,
            used: disk.used,
        }))
    }
}
