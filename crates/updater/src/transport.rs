use crate::error::{Result, UpdaterError};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use reqwest::header::RANGE;
use reqwest::{Client, StatusCode, Url};
use std::time::Duration;

/// Body of a response, delivered chunk by chunk.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// An accepted GET request.
pub struct FetchResponse {
    /// Byte offset of the first body byte within the resource. Zero when the
    /// server ignored the range request and sends the whole resource.
    pub offset: u64,
    /// Length of the body, if the server announced it.
    pub content_length: Option<u64>,
    pub body: ByteStream,
}

/// Abstraction over fetching resources from the update server.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issue a GET for `url`, asking for the bytes from `offset` onwards.
    ///
    /// Non-success statuses are returned as [`UpdaterError::Status`].
    async fn get(&self, url: &Url, offset: u64) -> Result<FetchResponse>;
}

/// Builder for [`HttpTransport`].
#[derive(Default)]
pub struct HttpTransportBuilder {
    client: Option<Client>,
    connect_timeout: Option<Duration>,
}

impl HttpTransportBuilder {
    /// Provide a custom reqwest client instance.
    pub fn client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Limit how long establishing a connection may take.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Build the transport.
    pub fn build(self) -> Result<HttpTransport> {
        let client = match self.client {
            Some(client) => client,
            None => {
                let mut builder = Client::builder();
                if let Some(timeout) = self.connect_timeout {
                    builder = builder.connect_timeout(timeout);
                }
                builder.build()?
            }
        };

        Ok(HttpTransport { client })
    }
}

/// HTTP transport with `Range`-based resumption.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Create a new builder.
    pub fn builder() -> HttpTransportBuilder {
        HttpTransportBuilder::default()
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, url: &Url, offset: u64) -> Result<FetchResponse> {
        let mut request = self.client.get(url.clone());
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(UpdaterError::Status(status.as_u16()));
        }

        let offset = if status == StatusCode::PARTIAL_CONTENT {
            offset
        } else {
            0
        };
        let content_length = response.content_length();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(UpdaterError::from))
            .boxed();

        Ok(FetchResponse {
            offset,
            content_length,
            body,
        })
    }
}
