use base64::{engine::general_purpose, Engine as _};
use log::info;
use reqwest::Client;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

const ARTIFACT_STORE_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Error)]
pub enum ArtifactStoreError {
    #[error("artifact store unavailable: {0}")]
    Unavailable(String),
    #[error("artifact already exists at {0}")]
    AlreadyExists(String),
    #[error("version conflict updating {0}")]
    VersionConflict(String),
}

/// Artifact Store Client (C2): create/read/update files in a Git-hosted
/// content repository. Handler source is stored at `handlers/<handler_name>.rhai`.
/// Writes are idempotent against the remote content SHA, used as the
/// versioning token for conditional updates. No local filesystem cache is
/// kept here beyond what the handler registry (C3) maintains.
pub struct ArtifactStoreClient {
    client: Client,
    token: String,
    user: String,
    repo: String,
    branch: String,
}

impl ArtifactStoreClient {
    pub fn new(token: String, user: String, repo: String, branch: String) -> Self {
        Self {
            client: Client::new(),
            token,
            user,
            repo,
            branch,
        }
    }

    fn content_url(&self, path: &str) -> String {
        format!(
            "https://api.github.com/repos/{}/{}/contents/{}",
            self.user, self.repo, path
        )
    }

    pub fn handler_path(handler_name: &str) -> String {
        format!("handlers/{}.rhai", handler_name)
    }

    pub async fn exists(&self, path: &str) -> Result<bool, ArtifactStoreError> {
        Ok(self.get(path).await?.is_some())
    }

    /// Returns (content, version sha) if the path exists.
    pub async fn get(&self, path: &str) -> Result<Option<(String, String)>, ArtifactStoreError> {
        let response = self
            .request(self.client.get(self.content_url(path)))
            .send()
            .await
            .map_err(|e| ArtifactStoreError::Unavailable(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(ArtifactStoreError::Unavailable(format!(
                "unexpected status {}",
                response.status()
            )));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ArtifactStoreError::Unavailable(e.to_string()))?;
        let encoded = body["content"].as_str().unwrap_or("").replace('\n', "");
        let sha = body["sha"].as_str().unwrap_or("").to_string();
        let decoded = general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| ArtifactStoreError::Unavailable(e.to_string()))?;
        let text = String::from_utf8_lossy(&decoded).to_string();
        Ok(Some((text, sha)))
    }

    pub async fn create(&self, path: &str, content: &str) -> Result<String, ArtifactStoreError> {
        if self.exists(path).await? {
            return Err(ArtifactStoreError::AlreadyExists(path.to_string()));
        }
        self.put(path, content, None).await
    }

    pub async fn update(
        &self,
        path: &str,
        content: &str,
        expected_version: &str,
    ) -> Result<String, ArtifactStoreError> {
        self.put(path, content, Some(expected_version)).await
    }

    async fn put(
        &self,
        path: &str,
        content: &str,
        expected_version: Option<&str>,
    ) -> Result<String, ArtifactStoreError> {
        let encoded = general_purpose::STANDARD.encode(content);
        let mut body = json!({
            "message": format!("update {}", path),
            "content": encoded,
            "branch": self.branch,
        });
        if let Some(sha) = expected_version {
            body["sha"] = json!(sha);
        }

        let response = self
            .request(self.client.put(self.content_url(path)))
            .json(&body)
            .send()
            .await
            .map_err(|e| ArtifactStoreError::Unavailable(e.to_string()))?;

        if response.status() == reqwest::StatusCode::CONFLICT {
            return Err(ArtifactStoreError::VersionConflict(path.to_string()));
        }
        if !response.status().is_success() {
            return Err(ArtifactStoreError::Unavailable(format!(
                "unexpected status {}",
                response.status()
            )));
        }

        let parsed: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ArtifactStoreError::Unavailable(e.to_string()))?;
        let new_sha = parsed["content"]["sha"].as_str().unwrap_or("").to_string();
        info!("wrote artifact {} (sha {})", path, new_sha);
        Ok(new_sha)
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .timeout(Duration::from_secs(ARTIFACT_STORE_TIMEOUT_SECS))
            .header("Authorization", format!("Bearer {}", self.token))
            .header("User-Agent", "bot-factory")
            .header("Accept", "application/vnd.github+json")
    }
}
