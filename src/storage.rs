use crate::config::StorageConfig;
use crate::error::CameraError;
use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info};

/// 快照上传的对象存储
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// 写入对象，返回时已提交
    async fn write(&self, path: &str, data: Bytes, content_type: &str) -> Result<(), CameraError>;

    /// 设置对象为公开可读
    async fn make_public(&self, path: &str) -> Result<(), CameraError>;

    /// 对象的公开地址，只由配置和路径决定
    fn public_url(&self, path: &str) -> String;
}

const GCS_API: &str = "https://storage.googleapis.com";

/// Google Cloud Storage JSON API
pub struct GcsStore {
    client: reqwest::Client,
    bucket: String,
    access_token: Option<String>,
}

impl GcsStore {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            bucket: config.bucket_name().to_string(),
            access_token: config.access_token.clone(),
        }
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.access_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn check(response: reqwest::Response, op: &str) -> Result<(), CameraError> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(CameraError::Upload(format!("{} returned {}: {}", op, status, body)))
    }
}

/// 对象名作为 URL 路径段时需要转义 '/'
fn encode_object_name(path: &str) -> String {
    path.trim_start_matches('/').replace('/', "%2F")
}

#[async_trait]
impl ObjectStore for GcsStore {
    async fn write(&self, path: &str, data: Bytes, content_type: &str) -> Result<(), CameraError> {
        let url = format!("{}/upload/storage/v1/b/{}/o", GCS_API, self.bucket);
        let size = data.len();
        let request = self
            .client
            .post(url)
            .query(&[("uploadType", "media"), ("name", path.trim_start_matches('/'))])
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(data);

        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| CameraError::Upload(e.to_string()))?;
        Self::check(response, "upload").await?;
        debug!("Uploaded {} bytes to gs://{}/{}", size, self.bucket, path);
        Ok(())
    }

    async fn make_public(&self, path: &str) -> Result<(), CameraError> {
        let url = format!(
            "{}/storage/v1/b/{}/o/{}/acl",
            GCS_API,
            self.bucket,
            encode_object_name(path)
        );
        let request = self.client.post(url).json(&serde_json::json!({
            "entity": "allUsers",
            "role": "READER",
        }));

        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| CameraError::Upload(e.to_string()))?;
        Self::check(response, "make public").await?;
        info!("gs://{}/{} is now public", self.bucket, path);
        Ok(())
    }

    fn public_url(&self, path: &str) -> String {
        format!("{}/{}/{}", GCS_API, self.bucket, path.trim_start_matches('/'))
    }
}
