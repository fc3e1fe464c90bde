//! Store-and-forward cloud fallback.
//!
//! The relay never sees plaintext: a sender uploads the serialized
//! [`ChatMessage`](meshrelay_shared::ChatMessage) to a content-addressed
//! blob store and drops the resulting handle in the recipient's rendezvous
//! mailbox. The recipient polls its mailbox and fetches each handle.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::debug;

use meshrelay_shared::error::CloudError;
use meshrelay_shared::protocol::{BlobUploaded, PendingHandles, RendezvousNotify};
use meshrelay_shared::types::PeerKey;

#[async_trait]
pub trait CloudRelay: Send + Sync {
    /// Store `bytes`, returning their content handle.
    async fn upload(&self, bytes: Vec<u8>) -> Result<String, CloudError>;

    /// Tell `recipient` that `handle` is waiting for them.
    async fn notify(&self, recipient: &PeerKey, handle: &str) -> Result<(), CloudError>;

    /// Drain the handles waiting for `peer`.
    async fn poll_pending(&self, peer: &PeerKey) -> Result<Vec<String>, CloudError>;

    async fn fetch(&self, handle: &str) -> Result<Vec<u8>, CloudError>;
}

/// [`CloudRelay`] against the HTTP API of `meshrelay-server`.
pub struct HttpCloudRelay {
    base_url: String,
    client: reqwest::Client,
}

impl HttpCloudRelay {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl CloudRelay for HttpCloudRelay {
    async fn upload(&self, bytes: Vec<u8>) -> Result<String, CloudError> {
        let size = bytes.len();
        let resp = self
            .client
            .post(self.url("/blobs"))
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(bytes)
            .send()
            .await
            .map_err(|e| CloudError::Upload(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(CloudError::Upload(format!("server answered {}", resp.status())));
        }
        let uploaded: BlobUploaded = resp
            .json()
            .await
            .map_err(|e| CloudError::Upload(format!("invalid response: {e}")))?;

        debug!(handle = %uploaded.handle, size, "Uploaded blob");
        Ok(uploaded.handle)
    }

    async fn notify(&self, recipient: &PeerKey, handle: &str) -> Result<(), CloudError> {
        let resp = self
            .client
            .post(self.url(&format!("/rendezvous/{}", recipient.to_hex())))
            .json(&RendezvousNotify {
                handle: handle.to_string(),
            })
            .send()
            .await
            .map_err(|e| CloudError::Notify(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(CloudError::Notify(format!("server answered {}", resp.status())));
        }
        Ok(())
    }

    async fn poll_pending(&self, peer: &PeerKey) -> Result<Vec<String>, CloudError> {
        let resp = self
            .client
            .get(self.url(&format!("/rendezvous/{}", peer.to_hex())))
            .send()
            .await
            .map_err(|e| CloudError::Poll(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(CloudError::Poll(format!("server answered {}", resp.status())));
        }
        let pending: PendingHandles = resp
            .json()
            .await
            .map_err(|e| CloudError::Poll(format!("invalid response: {e}")))?;
        Ok(pending.handles)
    }

    async fn fetch(&self, handle: &str) -> Result<Vec<u8>, CloudError> {
        let resp = self
            .client
            .get(self.url(&format!("/blobs/{handle}")))
            .send()
            .await
            .map_err(|e| CloudError::Fetch(e.to_string()))?;

        match resp.status() {
            StatusCode::NOT_FOUND => Err(CloudError::NotFound(handle.to_string())),
            status if !status.is_success() => {
                Err(CloudError::Fetch(format!("server answered {status}")))
            }
            _ => {
                let bytes = resp
                    .bytes()
                    .await
                    .map_err(|e| CloudError::Fetch(e.to_string()))?;
                Ok(bytes.to_vec())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_is_normalized() {
        let relay = HttpCloudRelay::new("http://relay.local:8080/", Duration::from_secs(5)).unwrap();
        assert_eq!(relay.base_url(), "http://relay.local:8080");
        assert_eq!(relay.url("/blobs"), "http://relay.local:8080/blobs");
    }

    #[tokio::test]
    async fn test_unreachable_relay_is_an_upload_error() {
        // Nothing listens on the discard port
        let relay = HttpCloudRelay::new("http://127.0.0.1:9", Duration::from_secs(2)).unwrap();
        let err = relay.upload(vec![1, 2, 3]).await.unwrap_err();
        assert!(matches!(err, CloudError::Upload(_)));
    }
}
