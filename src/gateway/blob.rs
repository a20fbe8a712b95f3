//! Screenshot blob store on S3-compatible storage.

use super::{BlobMetadata, BlobStore, GatewayError, GatewayResult};
use crate::config::S3Config;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use tracing::{debug, info};
use uuid::Uuid;

/// [`BlobStore`] writing objects under `{prefix}/{uuid}`.
///
/// The generated UUID is the reference recorded on events, so it can be
/// used directly as the record's `image_uuid`.
pub struct S3BlobStore {
    client: S3Client,
    bucket: String,
    prefix: String,
}

impl S3BlobStore {
    pub async fn new(config: &S3Config) -> Self {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut builder = S3ConfigBuilder::from(&aws_config);
        if let Some(endpoint_url) = &config.endpoint_url {
            builder = builder.endpoint_url(endpoint_url);
        }
        if config.force_path_style {
            builder = builder.force_path_style(true);
        }

        info!(bucket = %config.bucket, region = %config.region, "Blob store initialized");

        Self {
            client: S3Client::from_conf(builder.build()),
            bucket: config.bucket.clone(),
            prefix: config.prefix.trim_matches('/').to_string(),
        }
    }

    fn object_key(&self, id: &Uuid) -> String {
        if self.prefix.is_empty() {
            id.to_string()
        } else {
            format!("{}/{}", self.prefix, id)
        }
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn save(&self, name: &str, metadata: &BlobMetadata, bytes: Vec<u8>) -> GatewayResult<String> {
        let id = Uuid::new_v4();
        let key = self.object_key(&id);
        let size = bytes.len();

        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(bytes))
            .content_type(&metadata.content_type)
            .metadata("filename", name)
            .metadata("expire", metadata.expire.to_string());

        for (label, value) in &metadata.labels {
            request = request.metadata(label, value);
        }

        request
            .send()
            .await
            .map_err(|e| GatewayError::Storage(DisplayErrorContext(&e).to_string()))?;

        debug!(key = %key, size = size, "Blob stored");
        Ok(id.to_string())
    }
}
