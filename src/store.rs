use async_trait::async_trait;
use tokio::time::Instant;
use url::Url;

use crate::{
    config::Settings,
    error::StoreError,
    persist::{Document, DocumentStore},
};

/// [`DocumentStore`] that POSTs each document as JSON to a collector
/// endpoint, e.g. a document database's HTTP insert API or a log shipper.
#[derive(Debug, Clone)]
pub struct HttpDocumentStore {
    client: reqwest::Client,
    endpoint: Url,
}

impl HttpDocumentStore {
    pub fn new(endpoint: Url) -> Self {
        Self::with_client(reqwest::Client::new(), endpoint)
    }

    pub fn with_client(client: reqwest::Client, endpoint: Url) -> Self {
        HttpDocumentStore { client, endpoint }
    }

    /// Store for `LOG_STORE_URL`; `None` when persistence is disabled.
    pub fn from_settings(settings: &Settings) -> Option<Self> {
        settings.log_store_url.clone().map(Self::new)
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl DocumentStore for HttpDocumentStore {
    async fn insert_one(&self, document: Document, deadline: Instant) -> Result<(), StoreError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(StoreError::Timeout);
        }

        let response = self
            .client
            .post(self.endpoint.clone())
            .timeout(remaining)
            .json(&document)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(StoreError::Rejected {
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}
