//! Log aggregator index client
//!
//! The aggregator files every record it receives under the first path segment
//! of the request, so each slice's output (`<base>/<slice-name>/`) gets its own
//! index. A slice passes once its index exists with at least one record.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
#[cfg(test)]
use mockall::automock;
use reqwest::header::{ACCEPT, HeaderValue};
use serde::{Deserialize, Serialize};
use tracing::debug;

use plumber_common::{Error, Result};

/// Request timeout for index listings
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// One aggregator index
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Index {
    /// Index name (the slice name the output posted to)
    pub name: String,
    /// Timestamp of the oldest record
    #[serde(default)]
    pub first_log: Option<DateTime<Utc>>,
    /// Timestamp of the newest record
    #[serde(default)]
    pub last_log: Option<DateTime<Utc>>,
    /// Number of records received
    #[serde(default)]
    pub log_count: u64,
}

/// True when `name` has an index with at least one record
pub fn has_logs(indexes: &[Index], name: &str) -> bool {
    indexes.iter().any(|i| i.name == name && i.log_count > 0)
}

/// Read access to the aggregator's index listing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LogIndex: Send + Sync {
    /// Fetch every index currently known to the aggregator
    async fn list_indexes(&self) -> Result<Vec<Index>>;
}

/// HTTP client for the aggregator listing endpoint
pub struct AggregatorClient {
    client: reqwest::Client,
    endpoint: String,
}

impl AggregatorClient {
    /// Create a client for `endpoint`
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let endpoint = endpoint.into();
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::aggregator(&endpoint, format!("failed to build client: {e}")))?;
        Ok(Self::with_client(client, endpoint))
    }

    /// Create a client around an existing `reqwest::Client`
    pub fn with_client(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }

    /// The URL being polled
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl LogIndex for AggregatorClient {
    async fn list_indexes(&self) -> Result<Vec<Index>> {
        let response = self
            .client
            .get(&self.endpoint)
            .header(ACCEPT, HeaderValue::from_static("application/json"))
            .send()
            .await
            .map_err(|e| Error::aggregator(&self.endpoint, format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::aggregator(&self.endpoint, format!("HTTP {status}")));
        }

        let indexes: Vec<Index> = response
            .json()
            .await
            .map_err(|e| Error::aggregator(&self.endpoint, format!("invalid JSON: {e}")))?;

        debug!(endpoint = %self.endpoint, count = indexes.len(), "fetched aggregator indexes");
        Ok(indexes)
    }
}
