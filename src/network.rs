//! HTTP implementations of the file collaborators.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use log::debug;
use reqwest::header::{CONTENT_LENGTH, RANGE};
use reqwest::{Client, Response, StatusCode};

use crate::error::{Result, SizeQueryError, TransferError};
use crate::file_ops::{ByteStream, FileDownloader, FileSizeRequester};

/// Connect and read timeout used by [`http_client`].
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Builds the HTTP client shared by the network collaborators.
///
/// # Errors
///
/// Returns an error if the TLS backend cannot be initialized.
pub fn http_client(timeout: Duration) -> Result<Client> {
    Ok(Client::builder()
        .connect_timeout(timeout)
        .read_timeout(timeout)
        .user_agent(concat!("lite-dl/", env!("CARGO_PKG_VERSION")))
        .build()?)
}

fn announced_length(response: &Response) -> Option<u64> {
    response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

fn size_error(e: &reqwest::Error) -> SizeQueryError {
    if e.is_timeout() {
        SizeQueryError::Timeout
    } else {
        SizeQueryError::Unreachable(e.to_string())
    }
}

/// Asks the server for `Content-Length`, first with HEAD, then with GET.
#[derive(Debug, Clone)]
pub struct NetworkFileSizeRequester {
    client: Client,
}

impl NetworkFileSizeRequester {
    #[must_use]
    pub const fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl FileSizeRequester for NetworkFileSizeRequester {
    async fn request_file_size(&self, uri: &str) -> std::result::Result<u64, SizeQueryError> {
        match self.client.head(uri).send().await {
            Ok(response) if response.status().is_success() => {
                if let Some(len) = announced_length(&response) {
                    return Ok(len);
                }
                debug!("HEAD {uri} carried no length, retrying with GET");
            }
            Ok(response) => debug!("HEAD {uri} returned {}, retrying with GET", response.status()),
            Err(e) => debug!("HEAD {uri} failed: {e}, retrying with GET"),
        }

        let response = self
            .client
            .get(uri)
            .send()
            .await
            .map_err(|e| size_error(&e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(SizeQueryError::Status(status.as_u16()));
        }
        announced_length(&response)
            .or_else(|| response.content_length())
            .ok_or(SizeQueryError::MissingLength)
    }
}

fn transfer_error(e: &reqwest::Error) -> TransferError {
    if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() || e.is_decode() {
        TransferError::Network(e.to_string())
    } else {
        TransferError::Permanent(e.to_string())
    }
}

/// Streams a file with a ranged GET so partial files can be resumed.
#[derive(Debug, Clone)]
pub struct NetworkFileDownloader {
    client: Client,
}

impl NetworkFileDownloader {
    #[must_use]
    pub const fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl FileDownloader for NetworkFileDownloader {
    async fn start_download(
        &self,
        uri: &str,
        offset: u64,
    ) -> std::result::Result<ByteStream, TransferError> {
        let mut request = self.client.get(uri);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }
        let response = request.send().await.map_err(|e| transfer_error(&e))?;
        let status = response.status();

        if offset > 0 && status == StatusCode::OK {
            return Err(TransferError::Permanent(format!(
                "{uri} does not support resuming at byte {offset}"
            )));
        }
        if !status.is_success() {
            return Err(TransferError::Permanent(format!("{uri} returned {status}")));
        }

        Ok(Box::pin(
            response
                .bytes_stream()
                .map(|chunk| chunk.map_err(|e| transfer_error(&e))),
        ))
    }
}
