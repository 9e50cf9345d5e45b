//! Presigned URL sources
//!
//! - `HttpPresignSource`: asks the resource metadata service for a URL
//! - `S3PresignSource`: signs S3 `GetObject`/`PutObject` requests locally

use async_trait::async_trait;
use aws_config::Region;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::Client as S3Client;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::cache::UrlOperation;
use crate::error::RefreshError;

/// A URL and how many seconds it stays valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignedUrl {
    pub url: String,
    pub expires_in: u64,
}

/// Upstream of presigned URL cache refreshes.
#[async_trait]
pub trait PresignSource: Send + Sync {
    async fn presign(
        &self,
        resource_id: &str,
        expires_in_secs: u64,
        operation: UrlOperation,
    ) -> Result<PresignedUrl, RefreshError>;
}

fn refresh_error(
    resource_id: &str,
    operation: UrlOperation,
    status: Option<u16>,
    message: String,
) -> RefreshError {
    RefreshError {
        resource_id: resource_id.to_string(),
        operation,
        status,
        message,
    }
}

// ============ Resource metadata service ============

#[derive(Debug, Deserialize)]
struct ServiceError {
    code: Option<String>,
    message: Option<String>,
}

/// Client for `GET {base_url}/resources/{id}/presigned-url`.
pub struct HttpPresignSource {
    client: Client,
    base_url: String,
    bearer_token: Option<String>,
}

impl HttpPresignSource {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        HttpPresignSource {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            bearer_token: None,
        }
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    fn endpoint(&self, resource_id: &str) -> String {
        format!(
            "{}/resources/{}/presigned-url",
            self.base_url,
            urlencoding::encode(resource_id)
        )
    }
}

#[async_trait]
impl PresignSource for HttpPresignSource {
    async fn presign(
        &self,
        resource_id: &str,
        expires_in_secs: u64,
        operation: UrlOperation,
    ) -> Result<PresignedUrl, RefreshError> {
        let url = format!(
            "{}?expiresIn={}&operation={}",
            self.endpoint(resource_id),
            expires_in_secs,
            operation
        );
        let mut request = self.client.get(url);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            refresh_error(resource_id, operation, None, format!("Request failed: {}", e))
        })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = match serde_json::from_str::<ServiceError>(&text) {
                Ok(ServiceError {
                    code,
                    message: Some(message),
                }) => match code {
                    Some(code) => format!("{} ({})", message, code),
                    None => message,
                },
                _ => format!("{} - {}", status, text),
            };
            return Err(refresh_error(
                resource_id,
                operation,
                Some(status.as_u16()),
                message,
            ));
        }

        response.json::<PresignedUrl>().await.map_err(|e| {
            refresh_error(
                resource_id,
                operation,
                Some(status.as_u16()),
                format!("Invalid presign response: {}", e),
            )
        })
    }
}

// ============ S3 presigner ============

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3PresignConfig {
    pub bucket: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub region: String,
    pub endpoint_url: Option<String>,
    pub force_path_style: bool,
    /// Prepended to the resource id to form the object key.
    #[serde(default)]
    pub key_prefix: String,
}

/// Signs object URLs with static credentials; no network round trip.
pub struct S3PresignSource {
    client: S3Client,
    bucket: String,
    key_prefix: String,
}

impl S3PresignSource {
    pub fn new(config: &S3PresignConfig) -> Self {
        let credentials = Credentials::new(
            &config.access_key_id,
            &config.secret_access_key,
            None,
            None,
            "upload-presigner",
        );

        let mut builder = S3ConfigBuilder::new()
            .credentials_provider(credentials)
            .region(Region::new(config.region.clone()));

        if let Some(endpoint_url) = config.endpoint_url.as_deref() {
            builder = builder.endpoint_url(endpoint_url);
        }

        if config.force_path_style {
            builder = builder.force_path_style(true);
        }

        S3PresignSource {
            client: S3Client::from_conf(builder.build()),
            bucket: config.bucket.clone(),
            key_prefix: config.key_prefix.clone(),
        }
    }

    pub fn object_key(&self, resource_id: &str) -> String {
        format!("{}{}", self.key_prefix, resource_id)
    }
}

#[async_trait]
impl PresignSource for S3PresignSource {
    async fn presign(
        &self,
        resource_id: &str,
        expires_in_secs: u64,
        operation: UrlOperation,
    ) -> Result<PresignedUrl, RefreshError> {
        let presigning_config = PresigningConfig::builder()
            .expires_in(Duration::from_secs(expires_in_secs))
            .build()
            .map_err(|e| {
                refresh_error(resource_id, operation, None, format!("Invalid expiry: {}", e))
            })?;

        let key = self.object_key(resource_id);
        let presigned = match operation {
            UrlOperation::Read => self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(&key)
                .presigned(presigning_config)
                .await
                .map_err(|e| e.to_string()),
            UrlOperation::Write => self
                .client
                .put_object()
                .bucket(&self.bucket)
                .key(&key)
                .presigned(presigning_config)
                .await
                .map_err(|e| e.to_string()),
        }
        .map_err(|e| {
            refresh_error(
                resource_id,
                operation,
                None,
                format!("Failed to generate presigned URL: {}", e),
            )
        })?;

        Ok(PresignedUrl {
            url: presigned.uri().to_string(),
            expires_in: expires_in_secs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s3_source() -> S3PresignSource {
        S3PresignSource::new(&S3PresignConfig {
            bucket: "attachments".to_string(),
            access_key_id: "AKIDEXAMPLE".to_string(),
            secret_access_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".to_string(),
            region: "us-east-1".to_string(),
            endpoint_url: Some("http://localhost:9000".to_string()),
            force_path_style: true,
            key_prefix: "uploads/".to_string(),
        })
    }

    #[tokio::test]
    async fn s3_presign_signs_object_url_for_both_operations() {
        let source = s3_source();

        let read = source
            .presign("slider-12.png", 900, UrlOperation::Read)
            .await
            .unwrap();
        let write = source
            .presign("slider-12.png", 900, UrlOperation::Write)
            .await
            .unwrap();

        assert_eq!(read.expires_in, 900);
        assert!(read
            .url
            .starts_with("http://localhost:9000/attachments/uploads/slider-12.png?"));
        assert!(read.url.contains("X-Amz-Expires=900"));
        assert!(read.url.contains("X-Amz-Signature="));
        assert_ne!(read.url, write.url);
    }

    #[test]
    fn endpoint_encodes_resource_id() {
        let source = HttpPresignSource::new(Client::new(), "http://meta.local/api/");
        assert_eq!(
            source.endpoint("content/42 a"),
            "http://meta.local/api/resources/content%2F42%20a/presigned-url"
        );
    }
}
