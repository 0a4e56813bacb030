//! GitHub API access: source archive downloads and commit comparisons.

use bytes::Bytes;
use futures::StreamExt;
use hal_core::{Error, Result};
use serde_json::Value;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Client for the GitHub REST API.
#[derive(Clone)]
pub struct GithubDownloader {
    client: reqwest::Client,
    api_base: String,
    token: Option<String>,
}

impl GithubDownloader {
    pub fn new(api_base: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    pub fn tarball_url(&self, user: &str, repo: &str, reference: &str) -> String {
        format!("{}/repos/{user}/{repo}/tarball/{reference}", self.api_base)
    }

    pub fn compare_url(&self, user: &str, repo: &str, base: &str, head: &str) -> String {
        format!("{}/repos/{user}/{repo}/compare/{base}...{head}", self.api_base)
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        let request = self
            .client
            .get(url)
            .header("User-Agent", "hal-agent")
            .header("Accept", "application/vnd.github+json");
        match &self.token {
            Some(token) => request.header("Authorization", format!("Bearer {token}")),
            None => request,
        }
    }

    /// Comparison of two commits, as returned by the compare endpoint.
    pub async fn compare(&self, user: &str, repo: &str, base: &str, head: &str) -> Result<Value> {
        let url = self.compare_url(user, repo, base, head);
        debug!(%url, "Comparing commits");
        let response = self
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Provider(format!("GitHub request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::Provider(format!(
                "GitHub returned {} comparing {user}/{repo} {base}...{head}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| Error::Provider(format!("GitHub returned an invalid comparison: {e}")))
    }

    /// Stream the tarball for `user/repo@reference` into `target`.
    ///
    /// Returns the number of bytes written. A partial file is removed on
    /// failure.
    pub async fn download(&self, user: &str, repo: &str, reference: &str, target: &Path) -> Result<u64> {
        let url = self.tarball_url(user, repo, reference);
        debug!(%url, "Downloading source archive");

        let response = self
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Provider(format!("GitHub request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::Provider(format!(
                "GitHub returned {} for {user}/{repo}@{reference}",
                response.status()
            )));
        }

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        match write_stream(response.bytes_stream(), target).await {
            Ok(size) => {
                info!(target = %target.display(), size, "Downloaded source archive");
                Ok(size)
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(target).await;
                Err(e)
            }
        }
    }
}

async fn write_stream<S>(stream: S, target: &Path) -> Result<u64>
where
    S: futures::Stream<Item = reqwest::Result<Bytes>>,
{
    let mut stream = std::pin::pin!(stream);
    let mut file = tokio::fs::File::create(target).await?;
    let mut size = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| Error::Provider(format!("GitHub download interrupted: {e}")))?;
        file.write_all(&chunk).await?;
        size += chunk.len() as u64;
    }
    file.flush().await?;
    Ok(size)
}
