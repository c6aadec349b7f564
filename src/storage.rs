//! Remote media storage and transformation client
//!
//! Talks to the storage service REST API: uploads, prefix listings,
//! resource metadata, bulk deletes, and derived splice transformations.

use crate::config::Config;
use async_trait::async_trait;
use reqwest::{multipart, Client};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("storage quota exceeded")]
    QuotaExceeded,
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },
}

/// Remote resource namespace addressed by the API path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Video,
    Raw,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Video => "video",
            ResourceKind::Raw => "raw",
        }
    }
}

/// Response from an upload request
#[derive(Debug, Clone, Deserialize)]
pub struct UploadedAsset {
    pub public_id: String,
    pub secure_url: String,
}

/// One entry from a prefix listing
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteResource {
    pub public_id: String,
    #[serde(default)]
    pub bytes: Option<u64>,
    #[serde(default)]
    pub created_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    resources: Vec<RemoteResource>,
}

/// Metadata for a single remote resource
#[derive(Debug, Clone, Deserialize)]
pub struct ResourceInfo {
    pub public_id: String,
    #[serde(default)]
    pub duration: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<ApiErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// An ordered transform request: the first fragment plays as the base and
/// every later fragment is spliced onto it in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpliceChain {
    pub base: String,
    pub overlays: Vec<String>,
}

impl SpliceChain {
    /// Build a chain from public ids already in playback order
    ///
    /// Returns None for fewer than two ids: splicing needs a base and at
    /// least one overlay.
    pub fn from_ordered_ids(ids: &[String]) -> Option<Self> {
        let (base, overlays) = ids.split_first()?;
        if overlays.is_empty() {
            return None;
        }
        Some(Self {
            base: base.clone(),
            overlays: overlays.to_vec(),
        })
    }
}

/// The remote storage operations the consolidation pipeline consumes
#[async_trait]
pub trait MediaStore: Send + Sync {
    /// List resources under a public id prefix
    ///
    /// Listing order is not guaranteed to match capture order.
    async fn list(
        &self,
        kind: ResourceKind,
        prefix: &str,
    ) -> Result<Vec<RemoteResource>, StorageError>;

    /// Fetch metadata for one resource
    ///
    /// A not-yet-visible resource is `StorageError::NotFound`.
    async fn resource_info(
        &self,
        kind: ResourceKind,
        public_id: &str,
    ) -> Result<ResourceInfo, StorageError>;

    /// Resolve a splice chain remotely and persist the derived asset under
    /// `target_id`, overwriting any prior value
    async fn upload_spliced(
        &self,
        chain: &SpliceChain,
        target_id: &str,
    ) -> Result<UploadedAsset, StorageError>;

    /// Upload a local file under `target_id`, overwriting any prior value
    async fn upload_file(
        &self,
        path: &Path,
        target_id: &str,
    ) -> Result<UploadedAsset, StorageError>;

    /// Bulk-delete resources by public id; deleting zero is success
    async fn delete_many(
        &self,
        kind: ResourceKind,
        public_ids: &[String],
    ) -> Result<(), StorageError>;

    /// Stream a remote asset to a local file
    async fn download(&self, url: &str, dest: &Path) -> Result<(), StorageError>;

    /// Delivery URL for a stored video resource
    fn delivery_url(&self, public_id: &str) -> String;
}

/// Fixed output canonicalization applied to every derived recording
const CANONICAL_TRANSFORM: &str = "c_pad,w_1280,h_720/vc_h264,br_2500k";

/// REST client for the media storage service
pub struct StorageClient {
    client: Client,
    base_url: String,
    cloud: String,
    api_key: String,
    api_secret: String,
}

impl StorageClient {
    /// Create a client from injected configuration
    pub fn new(config: &Config) -> Result<Self, StorageError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(300))
            .build()?;

        Ok(Self {
            client,
            base_url: config.storage_base_url.trim_end_matches('/').to_string(),
            cloud: config.storage_cloud.clone(),
            api_key: config.storage_api_key.clone(),
            api_secret: config.storage_api_secret.clone(),
        })
    }

    fn admin_url(&self, tail: &str) -> String {
        format!("{}/v1/{}/{}", self.base_url, self.cloud, tail)
    }

    /// Derived-asset URL that resolves a splice chain on fetch
    ///
    /// Each overlay id is rewritten with ':' separators for the layer
    /// reference syntax; the canonical transform pins codec, frame and
    /// bitrate so every consolidated recording comes out uniform.
    pub fn spliced_source_url(&self, chain: &SpliceChain) -> String {
        let mut segments: Vec<String> = chain
            .overlays
            .iter()
            .map(|overlay| {
                format!(
                    "l_video:{}/fl_splice,fl_layer_apply",
                    overlay.replace('/', ":")
                )
            })
            .collect();
        segments.push(CANONICAL_TRANSFORM.to_string());

        format!(
            "{}/{}/video/upload/{}/{}.mp4",
            self.base_url,
            self.cloud,
            segments.join("/"),
            chain.base
        )
    }
}

/// Map a non-success response to the matching error class
async fn api_error(response: reqwest::Response, subject: &str) -> StorageError {
    let status = response.status();
    let message = match response.json::<ApiErrorBody>().await {
        Ok(body) => body.error.map(|e| e.message).unwrap_or_default(),
        Err(_) => String::new(),
    };

    match status.as_u16() {
        404 => StorageError::NotFound(subject.to_string()),
        401 | 403 => StorageError::Auth(if message.is_empty() {
            status.to_string()
        } else {
            message
        }),
        429 => StorageError::QuotaExceeded,
        code => StorageError::Api {
            status: code,
            message,
        },
    }
}

#[async_trait]
impl MediaStore for StorageClient {
    async fn list(
        &self,
        kind: ResourceKind,
        prefix: &str,
    ) -> Result<Vec<RemoteResource>, StorageError> {
        let url = self.admin_url(&format!("resources/{}", kind.as_str()));
        let response = self
            .client
            .get(&url)
            .basic_auth(&self.api_key, Some(&self.api_secret))
            .query(&[("prefix", prefix), ("max_results", "500")])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(api_error(response, prefix).await);
        }

        let body: ListResponse = response.json().await?;
        debug!("Listed {} resources under {}", body.resources.len(), prefix);
        Ok(body.resources)
    }

    async fn resource_info(
        &self,
        kind: ResourceKind,
        public_id: &str,
    ) -> Result<ResourceInfo, StorageError> {
        let url = self.admin_url(&format!("resources/{}/{}", kind.as_str(), public_id));
        let response = self
            .client
            .get(&url)
            .basic_auth(&self.api_key, Some(&self.api_secret))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(api_error(response, public_id).await);
        }

        Ok(response.json().await?)
    }

    async fn upload_spliced(
        &self,
        chain: &SpliceChain,
        target_id: &str,
    ) -> Result<UploadedAsset, StorageError> {
        let source = self.spliced_source_url(chain);
        info!(
            "Splicing {} overlays onto {} -> {}",
            chain.overlays.len(),
            chain.base,
            target_id
        );

        let params = [
            ("file", source.as_str()),
            ("public_id", target_id),
            ("overwrite", "true"),
        ];

        let response = self
            .client
            .post(self.admin_url("video/upload"))
            .basic_auth(&self.api_key, Some(&self.api_secret))
            .form(&params)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(api_error(response, target_id).await);
        }

        let asset: UploadedAsset = response.json().await?;
        info!(
            "Stored spliced recording {} at {}",
            asset.public_id, asset.secure_url
        );
        Ok(asset)
    }

    async fn upload_file(
        &self,
        path: &Path,
        target_id: &str,
    ) -> Result<UploadedAsset, StorageError> {
        let mut file = File::open(path).await?;
        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer).await?;

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("upload.mp4")
            .to_string();

        let part = multipart::Part::bytes(buffer)
            .file_name(file_name)
            .mime_str("video/mp4")?;

        let form = multipart::Form::new()
            .text("public_id", target_id.to_string())
            .text("overwrite", "true")
            .part("file", part);

        let response = self
            .client
            .post(self.admin_url("video/upload"))
            .basic_auth(&self.api_key, Some(&self.api_secret))
            .multipart(form)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(api_error(response, target_id).await);
        }

        let asset: UploadedAsset = response.json().await?;
        info!("Uploaded {:?} as {}", path, asset.public_id);
        Ok(asset)
    }

    async fn delete_many(
        &self,
        kind: ResourceKind,
        public_ids: &[String],
    ) -> Result<(), StorageError> {
        if public_ids.is_empty() {
            return Ok(());
        }

        let url = self.admin_url(&format!("resources/{}", kind.as_str()));
        let body = serde_json::json!({ "public_ids": public_ids });
        let response = self
            .client
            .delete(&url)
            .basic_auth(&self.api_key, Some(&self.api_secret))
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(api_error(response, "bulk delete").await);
        }

        info!("Deleted {} resources", public_ids.len());
        Ok(())
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<(), StorageError> {
        let mut response = self.client.get(url).send().await?;

        if !response.status().is_success() {
            return Err(api_error(response, url).await);
        }

        let mut file = File::create(dest).await?;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        debug!("Downloaded {} to {:?}", url, dest);
        Ok(())
    }

    fn delivery_url(&self, public_id: &str) -> String {
        format!(
            "{}/{}/video/upload/{}.mp4",
            self.base_url, self.cloud, public_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_client() -> StorageClient {
        StorageClient {
            client: Client::new(),
            base_url: "https://media.example.com".to_string(),
            cloud: "demo".to_string(),
            api_key: "key".to_string(),
            api_secret: "secret".to_string(),
        }
    }

    #[test]
    fn splice_chain_needs_at_least_two_ids() {
        assert!(SpliceChain::from_ordered_ids(&[]).is_none());
        assert!(SpliceChain::from_ordered_ids(&["only".to_string()]).is_none());

        let ids = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let chain = SpliceChain::from_ordered_ids(&ids).unwrap();
        assert_eq!(chain.base, "a");
        assert_eq!(chain.overlays, vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn delivery_url_targets_the_video_namespace() {
        let client = test_client();
        assert_eq!(
            client.delivery_url("sess1/host/final"),
            "https://media.example.com/demo/video/upload/sess1/host/final.mp4"
        );
    }

    #[test]
    fn splice_url_keeps_overlay_order_and_rewrites_ids() {
        let client = test_client();
        let chain = SpliceChain {
            base: "sess1/host/chunks/0_100".to_string(),
            overlays: vec![
                "sess1/host/chunks/1_200".to_string(),
                "sess1/host/chunks/2_300".to_string(),
            ],
        };

        let url = client.spliced_source_url(&chain);
        let first = url.find("l_video:sess1:host:chunks:1_200").unwrap();
        let second = url.find("l_video:sess1:host:chunks:2_300").unwrap();
        assert!(first < second);
        assert!(url.ends_with("/sess1/host/chunks/0_100.mp4"));
        assert_eq!(url.matches("fl_splice").count(), 2);
    }

    #[test]
    fn splice_url_pins_codec_and_frame() {
        let client = test_client();
        let chain = SpliceChain {
            base: "a".to_string(),
            overlays: vec!["b".to_string()],
        };

        let url = client.spliced_source_url(&chain);
        assert!(url.contains("vc_h264"));
        assert!(url.contains("w_1280,h_720"));
        assert!(url.contains("br_2500k"));
    }

    #[test]
    fn resource_kind_maps_to_api_path_segment() {
        assert_eq!(ResourceKind::Video.as_str(), "video");
        assert_eq!(ResourceKind::Raw.as_str(), "raw");
    }
}
