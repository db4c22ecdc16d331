use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::multipart::{Form, Part};
use snafu::{ResultExt, ensure};

use crate::error::{
    ApiResult, BodyReadSnafu, BuildClientSnafu, ConnectSnafu, HttpStatusSnafu, PayloadSnafu,
    ReadDocumentSnafu, RequestSnafu, StatusSnafu, StreamResult, UnsupportedDocumentSnafu,
};
use crate::request::{
    ChatMode, ChatRequest, DEFAULT_BASE_URL, DocumentReceipt, HEALTH_PATH, HealthPayload,
    PromptPayload, RAG_PROMPT_PATH, UPLOAD_PATH,
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type ByteStream = Pin<Box<dyn Stream<Item = StreamResult<Bytes>> + Send + 'static>>;

pub const EVENT_STREAM_MIME: &str = "text/event-stream";
pub const SUPPORTED_DOCUMENT_EXTENSIONS: [&str; 3] = ["pdf", "docx", "txt"];

/// Network seam of the stream client.
///
/// `open_stream` resolves once response headers arrived with a success status;
/// the returned body yields raw chunks at whatever boundaries the network uses.
pub trait ChatTransport: Send + Sync {
    fn open_stream<'a>(
        &'a self,
        mode: ChatMode,
        body: &'a ChatRequest,
    ) -> BoxFuture<'a, StreamResult<ByteStream>>;

    fn fetch_prompt<'a>(&'a self) -> BoxFuture<'a, ApiResult<String>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    pub base_url: String,
    pub connect_timeout: Option<Duration>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_URL)
    }
}

impl TransportConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim().trim_end_matches('/').to_string(),
            connect_timeout: None,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }
}

/// reqwest-backed transport for the RAG backend.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(config: TransportConfig) -> ApiResult<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = config.connect_timeout {
            builder = builder.connect_timeout(timeout);
        }

        let client = builder.build().context(BuildClientSnafu {
            stage: "build-http-client",
        })?;

        Ok(Self {
            client,
            base_url: config.base_url,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Returns true when the backend reports `{"status": "ok"}`.
    pub async fn health(&self) -> ApiResult<bool> {
        let url = self.url(HEALTH_PATH);
        let payload: HealthPayload = self.get_json(&url, "health").await?;
        Ok(payload.status.eq_ignore_ascii_case("ok"))
    }

    /// Uploads a PDF, DOCX or TXT file into the knowledge base.
    pub async fn upload_document(&self, path: &Path) -> ApiResult<DocumentReceipt> {
        ensure!(
            is_supported_document(path),
            UnsupportedDocumentSnafu {
                stage: "validate-document",
                path: path.to_path_buf(),
            }
        );

        let content = tokio::fs::read(path).await.context(ReadDocumentSnafu {
            stage: "read-document",
            path: path.to_path_buf(),
        })?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());

        let url = self.url(UPLOAD_PATH);
        let form = Form::new().part("file", Part::bytes(content).file_name(file_name));
        let response = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .context(RequestSnafu {
                stage: "send-upload",
                url: url.clone(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return StatusSnafu {
                stage: "upload-http-status",
                url,
                status: status.as_u16(),
            }
            .fail();
        }

        let receipt = response
            .json::<DocumentReceipt>()
            .await
            .context(PayloadSnafu {
                stage: "parse-upload-response",
                url,
            })?;
        tracing::info!(doc_id = %receipt.doc_id, "uploaded document");
        Ok(receipt)
    }

    async fn get_json<T>(&self, url: &str, stage: &'static str) -> ApiResult<T>
    where
        T: serde::de::DeserializeOwned,
    {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .context(RequestSnafu { stage, url })?;

        let status = response.status();
        if !status.is_success() {
            return StatusSnafu {
                stage,
                url,
                status: status.as_u16(),
            }
            .fail();
        }

        response
            .json::<T>()
            .await
            .context(PayloadSnafu { stage, url })
    }
}

impl ChatTransport for HttpTransport {
    fn open_stream<'a>(
        &'a self,
        mode: ChatMode,
        body: &'a ChatRequest,
    ) -> BoxFuture<'a, StreamResult<ByteStream>> {
        Box::pin(async move {
            let url = self.url(mode.stream_path());
            let response = self
                .client
                .post(&url)
                .header(CONTENT_TYPE, "application/json")
                .header(ACCEPT, EVENT_STREAM_MIME)
                .json(body)
                .send()
                .await
                .context(ConnectSnafu {
                    stage: "send-chat-request",
                    url: url.clone(),
                })?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return HttpStatusSnafu {
                    stage: "chat-http-status",
                    url,
                    status: status.as_u16(),
                    body,
                }
                .fail();
            }

            let chunks = response.bytes_stream().map(|chunk| {
                chunk.context(BodyReadSnafu {
                    stage: "read-chat-chunk",
                })
            });
            Ok(Box::pin(chunks) as ByteStream)
        })
    }

    fn fetch_prompt<'a>(&'a self) -> BoxFuture<'a, ApiResult<String>> {
        Box::pin(async move {
            let url = self.url(RAG_PROMPT_PATH);
            let payload: PromptPayload = self.get_json(&url, "fetch-rag-prompt").await?;
            Ok(payload.prompt)
        })
    }
}

pub fn is_supported_document(path: &Path) -> bool {
    path.extension()
        .and_then(|extension| extension.to_str())
        .is_some_and(|extension| {
            SUPPORTED_DOCUMENT_EXTENSIONS
                .iter()
                .any(|supported| extension.eq_ignore_ascii_case(supported))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_normalised() {
        let config = TransportConfig::new(" http://localhost:8000/ ");
        assert_eq!(config.base_url, "http://localhost:8000");
    }

    #[test]
    fn only_knowledge_base_formats_are_uploadable() {
        assert!(is_supported_document(Path::new("handbook.PDF")));
        assert!(is_supported_document(Path::new("notes/handbook.docx")));
        assert!(is_supported_document(Path::new("faq.txt")));
        assert!(!is_supported_document(Path::new("setup.exe")));
        assert!(!is_supported_document(Path::new("README")));
    }
}
