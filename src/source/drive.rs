//! Drive v3 REST adapter.
//!
//! Lists files page by page, resolves parent links and streams media or
//! export renditions. HTTP failures are classified into the `BackupError`
//! taxonomy here so callers only ever see retryable/permanent errors.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::time::Duration;
use futures_util::{StreamExt, TryStreamExt, stream};
use reqwest::header::RETRY_AFTER;
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use tracing::debug;
use url::Url;

use super::{ContentKind, EntryStream, NodeInfo, RemoteEntry, Scope, SourceClient};
use crate::config::SourceConfig;
use crate::errors::{BackupError, Result};
use crate::session::Session;
use crate::utils::retry::{RetryPolicy, parse_retry_after, with_retry};

const LIST_FIELDS: &str =
    "nextPageToken, files(id, name, mimeType, size, modifiedTime, parents, owners(emailAddress), md5Checksum)";
const NODE_FIELDS: &str = "name, parents";
const UNKNOWN_OWNER: &str = "shared";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileListPage {
    #[serde(default)]
    files: Vec<DriveFile>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    name: String,
    mime_type: Option<String>,
    /// int64 values arrive as JSON strings
    size: Option<String>,
    modified_time: Option<String>,
    #[serde(default)]
    parents: Vec<String>,
    #[serde(default)]
    owners: Vec<DriveOwner>,
    md5_checksum: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveOwner {
    email_address: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DriveNode {
    name: String,
    #[serde(default)]
    parents: Vec<String>,
}

impl DriveFile {
    fn into_entry(self) -> RemoteEntry {
        let mime_type = self.mime_type.unwrap_or_else(|| "application/octet-stream".to_string());
        let owner_identity = self
            .owners
            .into_iter()
            .find_map(|o| o.email_address)
            .unwrap_or_else(|| UNKNOWN_OWNER.to_string());

        RemoteEntry {
            content_kind: ContentKind::from_mime_type(&mime_type),
            entry_id: self.id,
            name: self.name,
            mime_type,
            size: self.size.and_then(|s| s.parse().ok()),
            modified_time: self
                .modified_time
                .as_deref()
                .and_then(|s| s.parse::<DateTime<Utc>>().ok()),
            owner_identity,
            parent_id: self.parents.into_iter().next(),
            remote_checksum: self.md5_checksum.filter(|s| !s.is_empty()),
        }
    }
}

enum Cursor {
    Start,
    Next(String),
    Done,
}

pub struct DriveClient {
    http: reqwest::Client,
    api_base: Url,
    access_token: String,
    page_size: u32,
    retry: RetryPolicy,
}

impl DriveClient {
    /// `retry` covers listing pages and node lookups. Content downloads are
    /// retried by the fetcher instead.
    pub fn new(http: reqwest::Client, api_base: Url, access_token: String, page_size: u32, retry: RetryPolicy) -> Self {
        DriveClient {
            http,
            api_base,
            access_token,
            page_size,
            retry,
        }
    }

    pub fn from_session(session: &Session, source: &SourceConfig, retry: RetryPolicy) -> Self {
        Self::new(
            session.http.clone(),
            source.api_base.clone(),
            session.access_token().to_string(),
            source.page_size,
            retry,
        )
    }

    fn files_url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.api_base.clone();
        url.path_segments_mut()
            .map_err(|_| BackupError::Config(format!("API base cannot be a base URL: {}", self.api_base)))?
            .pop_if_empty()
            .extend(["drive", "v3", "files"])
            .extend(segments);
        Ok(url)
    }

    async fn get(&self, url: Url, query: &[(&str, String)]) -> Result<Response> {
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.access_token)
            .query(query)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, retry_after, &body))
    }

    async fn list_page(&self, scope: &Scope, page_token: Option<String>) -> Result<FileListPage> {
        let mut query = vec![
            ("q", "trashed=false".to_string()),
            ("pageSize", self.page_size.to_string()),
            ("fields", LIST_FIELDS.to_string()),
        ];
        if let Scope::SharedDrive(drive) = scope {
            query.push(("corpora", "drive".to_string()));
            query.push(("driveId", drive.id.clone()));
            query.push(("includeItemsFromAllDrives", "true".to_string()));
            query.push(("supportsAllDrives", "true".to_string()));
        }
        if let Some(token) = page_token {
            query.push(("pageToken", token));
        }

        let page: FileListPage = self
            .get(self.files_url(&[])?, &query)
            .await?
            .json()
            .await
            .map_err(|e| BackupError::TransientNetwork(format!("Malformed file list page: {}", e)))?;
        debug!(files = page.files.len(), has_more = page.next_page_token.is_some(), "Fetched listing page");
        Ok(page)
    }

    async fn fetch_bytes(&self, url: Url, query: &[(&str, String)]) -> Result<Bytes> {
        self.get(url, query)
            .await?
            .bytes()
            .await
            .map_err(|e| BackupError::TransientNetwork(format!("Body read interrupted: {}", e)))
    }
}

#[async_trait]
impl SourceClient for DriveClient {
    fn list(&self, scope: Scope) -> EntryStream<'_> {
        stream::try_unfold(Cursor::Start, move |cursor| {
            let scope = scope.clone();
            async move {
                let token = match cursor {
                    Cursor::Done => return Ok(None),
                    Cursor::Start => None,
                    Cursor::Next(token) => Some(token),
                };
                let page = with_retry(&self.retry, "list", |_| self.list_page(&scope, token.clone())).await?;
                let next = match page.next_page_token {
                    Some(token) if !token.is_empty() => Cursor::Next(token),
                    _ => Cursor::Done,
                };
                let entries: Vec<Result<RemoteEntry>> =
                    page.files.into_iter().map(|f| Ok(f.into_entry())).collect();
                Ok::<_, BackupError>(Some((stream::iter(entries), next)))
            }
        })
        .try_flatten()
        .boxed()
    }

    async fn node_info(&self, entry_id: &str) -> Result<NodeInfo> {
        let query = [
            ("fields", NODE_FIELDS.to_string()),
            ("supportsAllDrives", "true".to_string()),
        ];
        let url = self.files_url(&[entry_id])?;
        let query = &query;
        let node: DriveNode = with_retry(&self.retry, "node_info", |_| {
            let url = url.clone();
            async move {
                self.get(url, query)
                    .await?
                    .json::<DriveNode>()
                    .await
                    .map_err(|e| BackupError::TransientNetwork(format!("Malformed node metadata: {}", e)))
            }
        })
        .await?;
        Ok(NodeInfo {
            name: node.name,
            parent_id: node.parents.into_iter().next(),
        })
    }

    async fn download(&self, entry_id: &str) -> Result<Bytes> {
        let query = [
            ("alt", "media".to_string()),
            ("supportsAllDrives", "true".to_string()),
        ];
        self.fetch_bytes(self.files_url(&[entry_id])?, &query).await
    }

    async fn export(&self, entry_id: &str, export_mime_type: &str) -> Result<Bytes> {
        let query = [("mimeType", export_mime_type.to_string())];
        self.fetch_bytes(self.files_url(&[entry_id, "export"])?, &query).await
    }
}

fn classify_transport_error(err: reqwest::Error) -> BackupError {
    if let Some(status) = err.status() {
        return classify_status(status, None, "");
    }
    BackupError::TransientNetwork(err.to_string())
}

fn classify_status(status: StatusCode, retry_after: Option<Duration>, body: &str) -> BackupError {
    let message = format!("HTTP {}: {}", status.as_u16(), body.trim());
    if status == StatusCode::TOO_MANY_REQUESTS
        || (status == StatusCode::FORBIDDEN && body.contains("ateLimitExceeded"))
    {
        BackupError::RateLimited { message, retry_after }
    } else if status == StatusCode::FORBIDDEN && body.contains("cannotExportFile") {
        BackupError::UnsupportedContentKind(message)
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        BackupError::TransientNetwork(message)
    } else {
        BackupError::PermanentSource(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(5),
            rate_limit_multiplier: 2,
        }
    }

    fn client(server: &MockServer) -> anyhow::Result<DriveClient> {
        Ok(DriveClient::new(
            reqwest::Client::new(),
            Url::parse(&server.uri())?,
            "token-123".to_string(),
            2,
            policy(),
        ))
    }

    #[test]
    fn test_classify_status() {
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, None, ""),
            BackupError::RateLimited { .. }
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, None, r#"{"reason":"userRateLimitExceeded"}"#),
            BackupError::RateLimited { .. }
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, None, r#"{"reason":"cannotExportFile"}"#),
            BackupError::UnsupportedContentKind(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, None, ""),
            BackupError::TransientNetwork(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, None, ""),
            BackupError::PermanentSource(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, None, ""),
            BackupError::PermanentSource(_)
        ));
    }

    #[test]
    fn test_drive_file_into_entry() -> anyhow::Result<()> {
        let file: DriveFile = serde_json::from_value(json!({
            "id": "f1",
            "name": "report.pdf",
            "mimeType": "application/pdf",
            "size": "5242880",
            "modifiedTime": "2024-03-01T10:00:00.000Z",
            "parents": ["folder-a"],
            "owners": [{ "emailAddress": "alice@example.com" }],
            "md5Checksum": "abc123"
        }))?;
        let entry = file.into_entry();

        assert_eq!(entry.entry_id, "f1");
        assert_eq!(entry.content_kind, ContentKind::Regular);
        assert_eq!(entry.size, Some(5 * 1024 * 1024));
        assert_eq!(entry.modified_time, Some("2024-03-01T10:00:00Z".parse()?));
        assert_eq!(entry.owner_identity, "alice@example.com");
        assert_eq!(entry.parent_id.as_deref(), Some("folder-a"));
        assert_eq!(entry.remote_checksum.as_deref(), Some("abc123"));
        Ok(())
    }

    #[test]
    fn test_drive_file_without_owner_or_checksum() -> anyhow::Result<()> {
        let file: DriveFile = serde_json::from_value(json!({
            "id": "d1",
            "name": "Budget",
            "mimeType": "application/vnd.google-apps.spreadsheet"
        }))?;
        let entry = file.into_entry();

        assert_eq!(entry.content_kind, ContentKind::Virtual);
        assert_eq!(entry.owner_identity, "shared");
        assert_eq!(entry.size, None);
        assert_eq!(entry.remote_checksum, None);
        assert_eq!(entry.parent_id, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_list_follows_page_tokens() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/drive/v3/files"))
            .and(query_param("pageToken", "p2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "files": [{ "id": "c", "name": "c.txt", "mimeType": "text/plain" }]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/drive/v3/files"))
            .and(header("authorization", "Bearer token-123"))
            .and(query_param("pageSize", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "files": [
                    { "id": "a", "name": "a.txt", "mimeType": "text/plain" },
                    { "id": "b", "name": "docs", "mimeType": "application/vnd.google-apps.folder" }
                ],
                "nextPageToken": "p2"
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;

        let drive = client(&server)?;
        let entries: Vec<RemoteEntry> = drive.list(Scope::UserFiles).try_collect().await?;

        let ids: Vec<&str> = entries.iter().map(|e| e.entry_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(entries[1].content_kind, ContentKind::Container);
        Ok(())
    }

    #[tokio::test]
    async fn test_list_shared_drive_sends_corpora() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/drive/v3/files"))
            .and(query_param("corpora", "drive"))
            .and(query_param("driveId", "0AB"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "files": [{ "id": "s1", "name": "q1.xlsx", "mimeType": "application/octet-stream" }]
            })))
            .mount(&server)
            .await;

        let drive = client(&server)?;
        let scope = Scope::SharedDrive(crate::config::SharedDrive {
            id: "0AB".into(),
            name: "Finance".into(),
        });
        let entries: Vec<RemoteEntry> = drive.list(scope).try_collect().await?;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].owner_identity, "shared");
        Ok(())
    }

    #[tokio::test]
    async fn test_list_surfaces_authorization_failure() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/drive/v3/files"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid credentials"))
            .mount(&server)
            .await;

        let drive = client(&server)?;
        let result: Result<Vec<RemoteEntry>> = drive.list(Scope::UserFiles).try_collect().await;
        assert!(matches!(result, Err(BackupError::PermanentSource(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_node_info_and_download() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/drive/v3/files/f1"))
            .and(query_param("alt", "media"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello".to_vec()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/drive/v3/files/f1"))
            .and(query_param("fields", NODE_FIELDS))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "name": "notes.txt", "parents": ["root-id"] })),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/drive/v3/files/d1/export"))
            .and(query_param("mimeType", "application/pdf"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"%PDF".to_vec()))
            .mount(&server)
            .await;

        let drive = client(&server)?;
        assert_eq!(
            drive.node_info("f1").await?,
            NodeInfo { name: "notes.txt".into(), parent_id: Some("root-id".into()) }
        );
        assert_eq!(drive.download("f1").await?, Bytes::from_static(b"hello"));
        assert_eq!(drive.export("d1", "application/pdf").await?, Bytes::from_static(b"%PDF"));
        Ok(())
    }

    #[tokio::test]
    async fn test_download_throttled() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/drive/v3/files/f1"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/drive/v3/files/f2"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "12"))
            .mount(&server)
            .await;

        let drive = client(&server)?;
        assert!(matches!(
            drive.download("f1").await,
            Err(BackupError::RateLimited { retry_after: None, .. })
        ));
        assert!(matches!(
            drive.download("f2").await,
            Err(BackupError::RateLimited { retry_after: Some(d), .. }) if d == Duration::from_secs(12)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_list_retries_transient_first_page() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/drive/v3/files"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/drive/v3/files"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "files": [{ "id": "a", "name": "a.txt", "mimeType": "text/plain" }]
            })))
            .mount(&server)
            .await;

        let drive = client(&server)?;
        let entries: Vec<RemoteEntry> = drive.list(Scope::UserFiles).try_collect().await?;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].entry_id, "a");
        Ok(())
    }

    #[tokio::test]
    async fn test_list_retries_transient_later_page() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/drive/v3/files"))
            .and(query_param("pageToken", "p2"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/drive/v3/files"))
            .and(query_param("pageToken", "p2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "files": [{ "id": "b", "name": "b.txt", "mimeType": "text/plain" }]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/drive/v3/files"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "files": [{ "id": "a", "name": "a.txt", "mimeType": "text/plain" }],
                "nextPageToken": "p2"
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;

        let drive = client(&server)?;
        let entries: Vec<RemoteEntry> = drive.list(Scope::UserFiles).try_collect().await?;
        let ids: Vec<&str> = entries.iter().map(|e| e.entry_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_list_gives_up_after_attempt_bound() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/drive/v3/files"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let drive = client(&server)?;
        let result: Result<Vec<RemoteEntry>> = drive.list(Scope::UserFiles).try_collect().await;
        assert!(matches!(result, Err(BackupError::TransientNetwork(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_node_info_retries_transient_failure() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/drive/v3/files/f1"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/drive/v3/files/f1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "name": "Docs" })))
            .mount(&server)
            .await;

        let drive = client(&server)?;
        assert_eq!(
            drive.node_info("f1").await?,
            NodeInfo { name: "Docs".into(), parent_id: None }
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_stalled_download_times_out() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/drive/v3/files/f1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(b"late".to_vec())
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let http = crate::session::build_http_client(Duration::from_secs(1), Duration::from_millis(200))?;
        let drive = DriveClient::new(http, Url::parse(&server.uri())?, "token-123".to_string(), 2, policy());
        assert!(matches!(drive.download("f1").await, Err(BackupError::TransientNetwork(_))));
        Ok(())
    }
}
