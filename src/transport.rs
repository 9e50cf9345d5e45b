//! HTTP storage backend (presigned PUT or multipart POST) with streamed progress

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use log::debug;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, ETAG};
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client, Response};
use serde::Deserialize;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs::File;
use tokio_util::io::ReaderStream;

use crate::executor::{BackendError, ProgressSink, StorageBackend, TransferRequest, TransferTarget};
use crate::task::{FileContent, FileDescriptor, RemoteObject};

/// Body chunk size (256 KB) - small enough for smooth progress
const CHUNK_SIZE: usize = 256 * 1024;

/// Error body returned by the storage endpoint.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: Option<String>,
    message: Option<String>,
}

pub struct HttpStorageBackend {
    client: Client,
}

impl HttpStorageBackend {
    pub fn new() -> Result<Self, BackendError> {
        let client = Client::builder()
            .build()
            .map_err(|e| BackendError::new(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: Client) -> Self {
        HttpStorageBackend { client }
    }
}

/// Stream the file content, reporting sent bytes as chunks are pulled.
async fn progress_body(file: &FileDescriptor, progress: ProgressSink) -> Result<Body, BackendError> {
    let total = file.size;
    let sent = Arc::new(AtomicU64::new(0));
    progress.report_bytes(0, total);

    let body = match &file.content {
        FileContent::Path(path) => {
            let handle = File::open(path)
                .await
                .map_err(|e| BackendError::new(format!("Failed to open file: {}", e)))?;
            let stream = ReaderStream::with_capacity(handle, CHUNK_SIZE).map(move |chunk| {
                if let Ok(chunk) = &chunk {
                    let new_total = sent.fetch_add(chunk.len() as u64, Ordering::SeqCst)
                        + chunk.len() as u64;
                    progress.report_bytes(new_total, total);
                }
                chunk
            });
            Body::wrap_stream(stream)
        }
        FileContent::Memory(bytes) => {
            let bytes = bytes.clone();
            let chunk_count = bytes.len().div_ceil(CHUNK_SIZE);
            let stream = stream::iter(0..chunk_count).map(move |index| {
                let start = index * CHUNK_SIZE;
                let end = std::cmp::min(start + CHUNK_SIZE, bytes.len());
                let chunk = bytes[start..end].to_vec();
                let new_total =
                    sent.fetch_add(chunk.len() as u64, Ordering::SeqCst) + chunk.len() as u64;
                progress.report_bytes(new_total, total);
                Ok::<Vec<u8>, io::Error>(chunk)
            });
            Body::wrap_stream(stream)
        }
    };
    Ok(body)
}

/// Turn a non-success response into a backend error, preferring the
/// `{code, message}` JSON body when the server sent one.
async fn error_from_response(response: Response) -> BackendError {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();

    match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) => BackendError {
            status: Some(status.as_u16()),
            code: body.code,
            message: body
                .message
                .unwrap_or_else(|| format!("Upload failed: {}", status)),
        },
        Err(_) => BackendError {
            status: Some(status.as_u16()),
            code: None,
            message: format!("Upload failed: {} - {}", status, text),
        },
    }
}

/// Object URL without the presigned query string.
fn object_url(url: &str) -> String {
    match reqwest::Url::parse(url) {
        Ok(mut parsed) => {
            parsed.set_query(None);
            parsed.to_string()
        }
        Err(_) => url.to_string(),
    }
}

#[async_trait]
impl StorageBackend for HttpStorageBackend {
    async fn upload(
        &self,
        request: TransferRequest<'_>,
        progress: ProgressSink,
    ) -> Result<RemoteObject, BackendError> {
        let file = request.file;
        let body = progress_body(file, progress).await?;

        let sent = match request.target {
            TransferTarget::Put { url } => {
                self.client
                    .put(url)
                    .header(CONTENT_TYPE, &file.mime_type)
                    .header(CONTENT_LENGTH, file.size)
                    .body(body)
                    .send()
                    .await
            }
            TransferTarget::Multipart { url, field } => {
                let part = Part::stream_with_length(body, file.size)
                    .file_name(file.name.clone())
                    .mime_str(&file.mime_type)
                    .map_err(|e| BackendError::new(format!("Invalid content type: {}", e)))?;
                let form = Form::new().part(field.clone(), part);
                self.client.post(url).multipart(form).send().await
            }
        };
        let response =
            sent.map_err(|e| BackendError::new(format!("Upload request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());
        let text = response
            .text()
            .await
            .map_err(|e| BackendError::new(format!("Failed to read response: {}", e)))?;
        let metadata = if text.trim().is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text))
        };

        debug!(
            "upload_response: {} etag={:?}",
            request.task_id,
            etag.as_deref()
        );
        Ok(RemoteObject {
            url: object_url(request.target.url()),
            etag,
            size: file.size,
            content_type: file.mime_type.clone(),
            metadata,
        })
    }
}
