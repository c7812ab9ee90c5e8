//! Microsoft Graph content source
//!
//! This module maps SharePoint Online onto the [`ContentSource`] contract:
//! - Client-credentials tokens from the identity platform
//! - Site lookup by host and server-relative path
//! - Document libraries as drives
//! - Recursive listing of drive items with `@odata.nextLink` paging
//! - Streaming downloads of item content
//!
//! HTTP failures are classified as follows:
//!
//! | Condition | Error |
//! |-----------|-------|
//! | HTTP 429 | RateLimited (with Retry-After) |
//! | HTTP 401 | AuthExpired |
//! | HTTP 403, 404, other 4xx | Permanent |
//! | HTTP 5xx, timeout, connect failure | Transient |
//! | Body or local write failure mid-transfer | Interrupted |
//! | No download progress within the stall timeout | Interrupted |

use crate::source::{
    ContentSource, Credentials, LibraryDescriptor, RemoteFile, SessionHandle, SourceError,
};
use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, trace};
use url::Url;

const GRAPH_SCOPE: &str = "https://graph.microsoft.com/.default";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_ERROR_BODY: usize = 300;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct SiteResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct Collection<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Drive {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct DriveItem {
    id: String,
    name: String,
    size: Option<u64>,
    folder: Option<FolderFacet>,
    file: Option<FileFacet>,
}

#[derive(Debug, Deserialize)]
struct FolderFacet {}

#[derive(Debug, Deserialize)]
struct FileFacet {}

/// Content source backed by the Microsoft Graph API
pub struct GraphContentSource {
    client: Client,
    graph_url: String,
    authority_url: String,
    /// Longest wait for download headers or for the next body chunk
    stall_timeout: Duration,
}

impl GraphContentSource {
    /// Creates a source against the given Graph and authority base URLs
    pub fn new(graph_url: &str, authority_url: &str) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(concat!("site-mirror/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .gzip(true)
            .brotli(true)
            .build()?;

        Ok(Self {
            client,
            graph_url: graph_url.trim_end_matches('/').to_string(),
            authority_url: authority_url.trim_end_matches('/').to_string(),
            stall_timeout: DEFAULT_STALL_TIMEOUT,
        })
    }

    /// Sets how long a download may go without progress before it is abandoned
    pub fn with_stall_timeout(mut self, stall_timeout: Duration) -> Self {
        self.stall_timeout = stall_timeout;
        self
    }

    fn stalled(&self, remote_id: &str) -> SourceError {
        SourceError::Interrupted(format!(
            "No data for {} within {:?}",
            remote_id, self.stall_timeout
        ))
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        session: &SessionHandle,
        url: &str,
    ) -> Result<T, SourceError> {
        trace!("GET {}", url);
        let response = self
            .client
            .get(url)
            .bearer_auth(&session.token)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(request_error)?;
        let response = check_status(response).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| SourceError::Transient(format!("Invalid response from {}: {}", url, e)))
    }

    /// Follows `@odata.nextLink` until the collection is exhausted
    async fn get_all<T: DeserializeOwned>(
        &self,
        session: &SessionHandle,
        url: String,
    ) -> Result<Vec<T>, SourceError> {
        let mut items = Vec::new();
        let mut next = Some(url);
        while let Some(url) = next {
            let page: Collection<T> = self.get_json(session, &url).await?;
            items.extend(page.value);
            next = page.next_link;
        }
        Ok(items)
    }

    fn site_lookup_url(&self, site_url: &str) -> Result<String, SourceError> {
        let parsed = Url::parse(site_url)
            .map_err(|e| SourceError::Permanent(format!("Invalid site URL '{}': {}", site_url, e)))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| SourceError::Permanent(format!("Site URL '{}' has no host", site_url)))?;
        let path = parsed.path().trim_end_matches('/');

        if path.is_empty() {
            Ok(format!("{}/sites/{}", self.graph_url, host))
        } else {
            Ok(format!("{}/sites/{}:{}", self.graph_url, host, path))
        }
    }
}

#[async_trait]
impl ContentSource for GraphContentSource {
    async fn authenticate(&self, credentials: &Credentials) -> Result<SessionHandle, SourceError> {
        let url = format!(
            "{}/{}/oauth2/v2.0/token",
            self.authority_url, credentials.tenant_id
        );
        debug!("Requesting access token from {}", url);

        let response = self
            .client
            .post(&url)
            .form(&[
                ("client_id", credentials.client_id.as_str()),
                ("client_secret", credentials.client_secret.as_str()),
                ("scope", GRAPH_SCOPE),
                ("grant_type", "client_credentials"),
            ])
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(request_error)?;

        let response = check_status(response).await.map_err(|e| match e {
            SourceError::AuthExpired(msg) => {
                SourceError::Permanent(format!("Credentials rejected: {}", msg))
            }
            other => other,
        })?;

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| SourceError::Transient(format!("Invalid token response: {}", e)))?;

        Ok(SessionHandle::new(
            token.access_token,
            token.expires_in.map(Duration::from_secs),
        ))
    }

    async fn list_libraries(
        &self,
        session: &SessionHandle,
        site_url: &str,
    ) -> Result<Vec<LibraryDescriptor>, SourceError> {
        let site: SiteResponse = self
            .get_json(session, &self.site_lookup_url(site_url)?)
            .await?;

        let drives: Vec<Drive> = self
            .get_all(session, format!("{}/sites/{}/drives", self.graph_url, site.id))
            .await?;

        debug!("Site {} has {} libraries", site_url, drives.len());
        Ok(drives
            .into_iter()
            .map(|d| LibraryDescriptor {
                id: d.id,
                name: d.name,
            })
            .collect())
    }

    async fn list_files(
        &self,
        session: &SessionHandle,
        library: &LibraryDescriptor,
    ) -> Result<Vec<RemoteFile>, SourceError> {
        let mut files = Vec::new();
        // (children URL, path prefix)
        let mut folders = vec![(
            format!("{}/drives/{}/root/children", self.graph_url, library.id),
            String::new(),
        )];

        while let Some((url, prefix)) = folders.pop() {
            let items: Vec<DriveItem> = self.get_all(session, url).await?;
            for item in items {
                let path = format!("{}{}", prefix, item.name);
                if item.folder.is_some() {
                    folders.push((
                        format!(
                            "{}/drives/{}/items/{}/children",
                            self.graph_url, library.id, item.id
                        ),
                        format!("{}/", path),
                    ));
                } else if item.file.is_some() {
                    files.push(RemoteFile {
                        name: path,
                        size: item.size,
                        remote_id: format!("{}/{}", library.id, item.id),
                    });
                } else {
                    trace!("Skipping non-file item {}", path);
                }
            }
        }

        debug!("Library {} has {} files", library.name, files.len());
        Ok(files)
    }

    async fn download(
        &self,
        session: &SessionHandle,
        remote_id: &str,
        destination: &Path,
    ) -> Result<u64, SourceError> {
        let (drive_id, item_id) = remote_id
            .split_once('/')
            .ok_or_else(|| SourceError::Permanent(format!("Malformed remote id '{}'", remote_id)))?;
        let url = format!(
            "{}/drives/{}/items/{}/content",
            self.graph_url, drive_id, item_id
        );

        let request = self.client.get(&url).bearer_auth(&session.token).send();
        let response = tokio::time::timeout(self.stall_timeout, request)
            .await
            .map_err(|_| self.stalled(remote_id))?
            .map_err(request_error)?;
        let mut response = check_status(response).await?;

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| local_write_error(destination, e))?;
        }
        let mut file = tokio::fs::File::create(destination)
            .await
            .map_err(|e| local_write_error(destination, e))?;

        let mut written = 0u64;
        loop {
            let next = tokio::time::timeout(self.stall_timeout, response.chunk())
                .await
                .map_err(|_| self.stalled(remote_id))?
                .map_err(|e| SourceError::Interrupted(format!("Connection dropped: {}", e)))?;
            let Some(chunk) = next else {
                break;
            };
            file.write_all(&chunk)
                .await
                .map_err(|e| local_write_error(destination, e))?;
            written += chunk.len() as u64;
        }
        file.flush()
            .await
            .map_err(|e| local_write_error(destination, e))?;
        file.sync_all()
            .await
            .map_err(|e| local_write_error(destination, e))?;

        Ok(written)
    }
}

fn local_write_error(path: &Path, e: std::io::Error) -> SourceError {
    SourceError::Interrupted(format!("Failed to write {}: {}", path.display(), e))
}

fn request_error(e: reqwest::Error) -> SourceError {
    if e.is_timeout() {
        SourceError::Transient(format!("Request timed out: {}", e))
    } else if e.is_connect() {
        SourceError::Transient(format!("Connection failed: {}", e))
    } else {
        SourceError::Transient(e.to_string())
    }
}

/// Passes successful responses through and classifies the rest
async fn check_status(response: Response) -> Result<Response, SourceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let url = response.url().to_string();
    let mut body = response.text().await.unwrap_or_default();
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }

    Err(classify_status(status, retry_after, &format!("{} {}", url, body)))
}

fn classify_status(status: StatusCode, retry_after: Option<Duration>, detail: &str) -> SourceError {
    let message = format!("HTTP {}: {}", status.as_u16(), detail.trim());
    match status {
        StatusCode::TOO_MANY_REQUESTS => {
            let message = match retry_after {
                Some(delay) => format!("{} (retry after {}s)", message, delay.as_secs()),
                None => message,
            };
            SourceError::RateLimited {
                message,
                retry_after,
            }
        }
        StatusCode::UNAUTHORIZED => SourceError::AuthExpired(message),
        s if s.is_server_error() => SourceError::Transient(message),
        _ => SourceError::Permanent(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status() {
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, Some(Duration::from_secs(7)), ""),
            SourceError::RateLimited { retry_after: Some(d), ref message } if d.as_secs() == 7 && message.contains("retry after 7s")
        ));
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, None, ""),
            SourceError::AuthExpired(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, None, ""),
            SourceError::Permanent(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, None, ""),
            SourceError::Permanent(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, None, ""),
            SourceError::Transient(_)
        ));
    }

    #[test]
    fn test_site_lookup_url() {
        let source = GraphContentSource::new("https://graph.example.com/v1.0/", "https://login.example.com").unwrap();

        assert_eq!(
            source
                .site_lookup_url("https://contoso.sharepoint.com/sites/marketing/")
                .unwrap(),
            "https://graph.example.com/v1.0/sites/contoso.sharepoint.com:/sites/marketing"
        );
        assert_eq!(
            source.site_lookup_url("https://contoso.sharepoint.com").unwrap(),
            "https://graph.example.com/v1.0/sites/contoso.sharepoint.com"
        );
        assert!(matches!(
            source.site_lookup_url("nonsense"),
            Err(SourceError::Permanent(_))
        ));
    }
}
