//! Content-addressed artifact storage.
//!
//! The worker pins artifacts through Pinata's pinning API and hands back an
//! `ipfs://<cid>` locator that any IPFS gateway can resolve.

use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde_derive::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{error, info};

use crate::config::StorageConfig;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage credential is not configured (set PINATA_JWT)")]
    NotConfigured,

    #[error("artifact upload failed: {0}")]
    UploadFailed(String),
}

impl StorageError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotConfigured => "StorageNotConfigured",
            Self::UploadFailed(_) => "ArtifactUploadFailed",
        }
    }
}

/// Where an uploaded artifact lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Locator {
    cid: String,
}

impl Locator {
    pub const SCHEME: &'static str = "ipfs";

    pub fn new(cid: impl Into<String>) -> Self {
        Self { cid: cid.into() }
    }

    pub fn cid(&self) -> &str {
        &self.cid
    }

    pub fn uri(&self) -> String {
        self.to_string()
    }

    pub fn gateway_url(&self, gateway: &str) -> String {
        format!("{}/{}", gateway.trim_end_matches('/'), self.cid)
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", Self::SCHEME, self.cid)
    }
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Uploads a raw file, e.g. an image produced by a job.
    async fn upload_file(&self, path: &Path, name: &str) -> Result<Locator, StorageError>;

    /// Uploads a JSON document, e.g. job metadata.
    async fn upload_json(&self, content: &Value, name: &str) -> Result<Locator, StorageError>;
}

#[derive(Deserialize)]
struct PinResponse {
    #[serde(rename = "IpfsHash")]
    ipfs_hash: Option<String>,
}

pub struct PinataStore {
    client: reqwest::Client,
    api_url: String,
    jwt: Option<String>,
}

impl PinataStore {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: config.api_url.trim_end_matches('/').to_string(),
            jwt: config.jwt.clone(),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.jwt.is_some()
    }

    fn credential(&self) -> Result<&str, StorageError> {
        self.jwt.as_deref().ok_or_else(|| {
            error!("pinning credential not configured, refusing upload");
            StorageError::NotConfigured
        })
    }

    async fn pin(&self, request: reqwest::RequestBuilder, name: &str) -> Result<Locator, StorageError> {
        let response = request
            .send()
            .await
            .map_err(|e| StorageError::UploadFailed(format!("request for {name} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(%status, name, "pinning service rejected upload");
            return Err(StorageError::UploadFailed(format!(
                "pinning service returned {status}: {}",
                body.trim()
            )));
        }

        let pinned: PinResponse = response
            .json()
            .await
            .map_err(|e| StorageError::UploadFailed(format!("unreadable pin response: {e}")))?;
        match pinned.ipfs_hash.filter(|cid| !cid.is_empty()) {
            Some(cid) => {
                let locator = Locator::new(cid);
                info!(name, %locator, "artifact pinned");
                Ok(locator)
            }
            None => Err(StorageError::UploadFailed(
                "pin response did not contain a content identifier".to_string(),
            )),
        }
    }
}

#[async_trait]
impl ArtifactStore for PinataStore {
    async fn upload_file(&self, path: &Path, name: &str) -> Result<Locator, StorageError> {
        let jwt = self.credential()?;
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| StorageError::UploadFailed(format!("cannot read {}: {e}", path.display())))?;

        let form = Form::new()
            .part("file", Part::bytes(bytes).file_name(name.to_string()))
            .text("pinataMetadata", json!({ "name": name }).to_string());
        let request = self
            .client
            .post(format!("{}/pinning/pinFileToIPFS", self.api_url))
            .bearer_auth(jwt)
            .multipart(form);

        self.pin(request, name).await
    }

    async fn upload_json(&self, content: &Value, name: &str) -> Result<Locator, StorageError> {
        let jwt = self.credential()?;
        let request = self
            .client
            .post(format!("{}/pinning/pinJSONToIPFS", self.api_url))
            .bearer_auth(jwt)
            .json(&json!({
                "pinataContent": content,
                "pinataMetadata": { "name": name },
            }));

        self.pin(request, name).await
    }
}
