//! Large file downloads streamed to disk.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, info_span, Instrument};

use crate::{FetchError, HttpClientConfig};

/// Client for archive downloads. Only the connect and per-read timeouts
/// apply, so a slow transfer that keeps delivering bytes is never cut off.
#[derive(Debug, Clone)]
pub struct Downloader {
    client: reqwest::Client,
}

impl Downloader {
    pub fn new(config: &HttpClientConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(config.timeout)
            .read_timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building download client")?;
        Ok(Self { client })
    }

    /// Streams `url` into a temp file next to `dest` and renames it into place
    /// once the body is complete. Returns the number of bytes written.
    pub async fn download_to(&self, url: &str, dest: &Path) -> Result<u64> {
        let span = info_span!("download", url);
        async {
            if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("creating {}", parent.display()))?;
            }

            let temp_path = partial_path(dest);
            let written = match self.stream_into(url, &temp_path).await {
                Ok(written) => written,
                Err(err) => {
                    let _ = fs::remove_file(&temp_path).await;
                    return Err(err);
                }
            };

            fs::rename(&temp_path, dest)
                .await
                .with_context(|| format!("moving {} into place", dest.display()))?;
            info!(path = %dest.display(), bytes = written, "download complete");
            Ok(written)
        }
        .instrument(span)
        .await
    }

    async fn stream_into(&self, url: &str, temp_path: &Path) -> Result<u64> {
        let request_error = |source| FetchError::Request {
            url: url.to_string(),
            source,
        };

        let mut resp = self.client.get(url).send().await.map_err(request_error)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            }
            .into());
        }

        let mut file = fs::File::create(temp_path)
            .await
            .with_context(|| format!("creating {}", temp_path.display()))?;
        let mut written = 0u64;
        while let Some(chunk) = resp.chunk().await.map_err(request_error)? {
            file.write_all(&chunk)
                .await
                .with_context(|| format!("writing {}", temp_path.display()))?;
            written += chunk.len() as u64;
        }
        file.flush()
            .await
            .with_context(|| format!("flushing {}", temp_path.display()))?;
        debug!(bytes = written, "body streamed");
        Ok(written)
    }
}

fn partial_path(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string());
    dest.with_file_name(format!(".{name}.part"))
}
