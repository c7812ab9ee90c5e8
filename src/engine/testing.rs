//! In-memory content source for engine unit tests

use crate::source::{
    ContentSource, Credentials, LibraryDescriptor, RemoteFile, SessionHandle, SourceError,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

struct FakeLibrary {
    descriptor: LibraryDescriptor,
    files: Vec<RemoteFile>,
}

/// Scriptable [`ContentSource`] serving files from memory
#[derive(Default)]
pub struct FakeSource {
    sites: Mutex<HashMap<String, Vec<FakeLibrary>>>,
    contents: Mutex<HashMap<String, Vec<u8>>>,
    auth_failures: Mutex<VecDeque<SourceError>>,
    listing_failures: Mutex<HashMap<String, VecDeque<SourceError>>>,
    download_failures: Mutex<HashMap<String, VecDeque<SourceError>>>,
    downloads: Mutex<Vec<String>>,
    auth_calls: AtomicU32,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn credentials() -> Credentials {
        Credentials {
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
            tenant_id: "tenant".to_string(),
        }
    }

    /// Registers a site with no libraries
    pub fn add_site(&self, site_url: &str) {
        self.sites.lock().entry(site_url.to_string()).or_default();
    }

    /// Adds a file and returns its remote id
    pub fn add_file(&self, site_url: &str, library: &str, path: &str, content: &[u8]) -> String {
        self.add_file_with_size(site_url, library, path, content, content.len() as u64)
    }

    /// Adds a file whose listed size differs from what the transfer delivers
    pub fn add_file_with_size(
        &self,
        site_url: &str,
        library: &str,
        path: &str,
        content: &[u8],
        listed_size: u64,
    ) -> String {
        let library_id = format!("{}::{}", site_url, library);
        let remote_id = format!("{}/{}", library_id, path);
        let mut sites = self.sites.lock();
        let libraries = sites.entry(site_url.to_string()).or_default();
        let position = match libraries.iter().position(|l| l.descriptor.name == library) {
            Some(position) => position,
            None => {
                libraries.push(FakeLibrary {
                    descriptor: LibraryDescriptor {
                        id: library_id,
                        name: library.to_string(),
                    },
                    files: Vec::new(),
                });
                libraries.len() - 1
            }
        };
        libraries[position].files.push(RemoteFile {
            name: path.to_string(),
            size: Some(listed_size),
            remote_id: remote_id.clone(),
        });
        self.contents
            .lock()
            .insert(remote_id.clone(), content.to_vec());
        remote_id
    }

    pub fn fail_auth(&self, error: SourceError) {
        self.auth_failures.lock().push_back(error);
    }

    pub fn fail_listing(&self, site_url: &str, error: SourceError) {
        self.listing_failures
            .lock()
            .entry(site_url.to_string())
            .or_default()
            .push_back(error);
    }

    pub fn fail_download(&self, remote_id: &str, error: SourceError) {
        self.download_failures
            .lock()
            .entry(remote_id.to_string())
            .or_default()
            .push_back(error);
    }

    pub fn auth_calls(&self) -> u32 {
        self.auth_calls.load(Ordering::SeqCst)
    }

    /// Number of download attempts made for `remote_id`
    pub fn download_attempts(&self, remote_id: &str) -> usize {
        self.downloads
            .lock()
            .iter()
            .filter(|id| id.as_str() == remote_id)
            .count()
    }
}

#[async_trait]
impl ContentSource for FakeSource {
    async fn authenticate(&self, _credentials: &Credentials) -> Result<SessionHandle, SourceError> {
        let call = self.auth_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let failure = self.auth_failures.lock().pop_front();
        if let Some(error) = failure {
            return Err(error);
        }
        Ok(SessionHandle::new(format!("token-{}", call), None))
    }

    async fn list_libraries(
        &self,
        _session: &SessionHandle,
        site_url: &str,
    ) -> Result<Vec<LibraryDescriptor>, SourceError> {
        let failure = self
            .listing_failures
            .lock()
            .get_mut(site_url)
            .and_then(|q| q.pop_front());
        if let Some(error) = failure {
            return Err(error);
        }

        let sites = self.sites.lock();
        let libraries = sites
            .get(site_url)
            .ok_or_else(|| SourceError::Permanent(format!("no such site {}", site_url)))?;
        Ok(libraries.iter().map(|l| l.descriptor.clone()).collect())
    }

    async fn list_files(
        &self,
        _session: &SessionHandle,
        library: &LibraryDescriptor,
    ) -> Result<Vec<RemoteFile>, SourceError> {
        let sites = self.sites.lock();
        let files = sites
            .values()
            .flatten()
            .find(|l| l.descriptor.id == library.id)
            .map(|l| l.files.clone())
            .unwrap_or_default();
        Ok(files)
    }

    async fn download(
        &self,
        _session: &SessionHandle,
        remote_id: &str,
        destination: &Path,
    ) -> Result<u64, SourceError> {
        self.downloads.lock().push(remote_id.to_string());

        let failure = self
            .download_failures
            .lock()
            .get_mut(remote_id)
            .and_then(|q| q.pop_front());
        if let Some(error) = failure {
            return Err(error);
        }

        let content = self
            .contents
            .lock()
            .get(remote_id)
            .cloned()
            .ok_or_else(|| SourceError::Permanent(format!("no such item {}", remote_id)))?;

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SourceError::Interrupted(e.to_string()))?;
        }
        tokio::fs::write(destination, &content)
            .await
            .map_err(|e| SourceError::Interrupted(e.to_string()))?;
        Ok(content.len() as u64)
    }
}
