use crate::config::WebdavConfig;
use crate::feed::build_http_agent;
use crate::paths::AppPaths;
use crate::store::{self, DownloadStatus};
use crate::{Result, VaultError};
use base64::Engine as _;
use std::path::Path;
use tracing::{debug, info, warn};
use url::Url;

const WEBDAV_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, Clone, Copy, Default)]
pub struct UploadSummary {
    pub attempted: usize,
    pub uploaded: usize,
    pub failed: usize,
}

/// Thin WebDAV client: MKCOL, PUT, HEAD and a PROPFIND connection probe are
/// all this system ever needs from the blob store.
pub struct WebdavClient {
    agent: ureq::Agent,
    base_url: Url,
    auth_header: String,
}

impl WebdavClient {
    pub fn new(config: &WebdavConfig) -> Result<Self> {
        let mut base_url = Url::parse(config.base_url.trim())
            .map_err(|e| VaultError::InvalidInput(format!("webdav base URL: {e}")))?;
        if !base_url.path().ends_with('/') {
            base_url.set_path(&format!("{}/", base_url.path()));
        }

        let credentials = format!("{}:{}", config.username, config.password);
        let auth_header = format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(credentials)
        );

        Ok(Self {
            agent: build_http_agent(WEBDAV_TIMEOUT_SECS),
            base_url,
            auth_header,
        })
    }

    /// Resolve a slash-separated remote path against the base URL, percent
    /// encoding each segment.
    fn remote_url(&self, remote_path: &str) -> Result<Url> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                VaultError::InvalidInput("webdav base URL cannot be a base".to_string())
            })?;
            segments.pop_if_empty();
            for segment in remote_path.split('/').filter(|s| !s.trim().is_empty()) {
                segments.push(segment);
            }
        }
        Ok(url)
    }

    /// Create a remote directory. 405 means it already exists, which is
    /// just as good.
    pub fn mkcol(&self, remote_dir: &str) -> Result<()> {
        let url = self.remote_url(remote_dir)?;
        let response = self.run_bodyless("MKCOL", &url, &[])?;

        match response.status().as_u16() {
            201 | 405 => Ok(()),
            status => Err(VaultError::Http(format!(
                "MKCOL {url} returned http {status}"
            ))),
        }
    }

    /// Upload one local file, creating the parent collection first. Returns
    /// the remote path on success.
    pub fn put_file(&self, local: &Path, remote_path: &str) -> Result<String> {
        if !local.exists() {
            return Err(VaultError::InvalidInput(format!(
                "local file does not exist: {}",
                local.to_string_lossy()
            )));
        }

        if let Some((dir, _)) = remote_path.rsplit_once('/') {
            self.mkcol(dir)?;
        }

        let url = self.remote_url(remote_path)?;
        let file = std::fs::File::open(local)?;
        let response = self
            .agent
            .put(url.as_str())
            .header("Authorization", &self.auth_header)
            .send(ureq::SendBody::from_owned_reader(file))
            .map_err(|e| VaultError::Http(format!("PUT {url} failed: {e}")))?;

        match response.status().as_u16() {
            201 | 204 => {
                debug!(%url, "uploaded file");
                Ok(remote_path.to_string())
            }
            status => Err(VaultError::Http(format!(
                "PUT {url} returned http {status}"
            ))),
        }
    }

    pub fn exists(&self, remote_path: &str) -> bool {
        let url = match self.remote_url(remote_path) {
            Ok(v) => v,
            Err(_) => return false,
        };
        match self
            .agent
            .head(url.as_str())
            .header("Authorization", &self.auth_header)
            .call()
        {
            Ok(response) => response.status().as_u16() == 200,
            Err(_) => false,
        }
    }

    /// Probe the root collection. Useful at startup to tell a typo'd
    /// password from a down server before a long sweep.
    pub fn test_connection(&self) -> bool {
        let url = self.base_url.clone();
        match self.run_bodyless("PROPFIND", &url, &[("Depth", "0")]) {
            Ok(response) => matches!(response.status().as_u16(), 200 | 207),
            Err(e) => {
                warn!(error = %e, "webdav connection test failed");
                false
            }
        }
    }

    fn run_bodyless(
        &self,
        method: &str,
        url: &Url,
        extra_headers: &[(&str, &str)],
    ) -> Result<ureq::http::Response<ureq::Body>> {
        let parsed_method = ureq::http::Method::from_bytes(method.as_bytes())
            .map_err(|e| VaultError::Http(format!("invalid method {method}: {e}")))?;
        let mut builder = ureq::http::Request::builder()
            .method(parsed_method)
            .uri(url.as_str())
            .header("Authorization", &self.auth_header);
        for (name, value) in extra_headers {
            builder = builder.header(*name, *value);
        }
        let request = builder
            .body(())
            .map_err(|e| VaultError::Http(format!("{method} {url} request build failed: {e}")))?;
        self.agent
            .run(request)
            .map_err(|e| VaultError::Http(format!("{method} {url} failed: {e}")))
    }
}

/// Push every Completed record whose file is still on disk to the blob
/// store and mark it Uploaded. One record failing does not stop the sweep.
pub fn upload_sweep(
    paths: &AppPaths,
    client: &WebdavClient,
    remote_root: &str,
) -> Result<UploadSummary> {
    let mut summary = UploadSummary::default();

    for record in store::list_by_status(paths, DownloadStatus::Completed)? {
        let Some(file_path) = record.file_path.clone() else {
            continue;
        };
        let local = Path::new(&file_path);
        if !local.exists() {
            debug!(identity_key = %record.identity_key, "local file missing, leaving for reconciliation");
            continue;
        }

        summary.attempted += 1;
        let file_name = local
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| format!("{}.mp4", record.identity_key));
        let remote_path = format!("{}/{}", remote_root.trim_matches('/'), file_name);

        match client.put_file(local, &remote_path) {
            Ok(cloud_path) => {
                if let Err(e) = store::update_upload_info(paths, &record.identity_key, &cloud_path)
                {
                    warn!(identity_key = %record.identity_key, error = %e, "upload succeeded but store update failed");
                    summary.failed += 1;
                    continue;
                }
                store::record_history(
                    paths,
                    &record.identity_key,
                    "upload",
                    "uploaded",
                    None,
                    None,
                );
                info!(identity_key = %record.identity_key, remote = %cloud_path, "uploaded");
                summary.uploaded += 1;
            }
            Err(e) => {
                warn!(identity_key = %record.identity_key, error = %e, "upload failed");
                store::record_history(
                    paths,
                    &record.identity_key,
                    "upload",
                    "failed",
                    Some(&e.to_string()),
                    None,
                );
                summary.failed += 1;
            }
        }
    }

    Ok(summary)
}
