//! JSON/HTTP registry endpoint
//!
//! - `POST {base}/requests/{operation}` with the payload, answers `{"ack": ...}`
//! - `GET {base}/requests/{ack}/state`, answers `{"state": "processing"}`
//! - `GET {base}/requests/{ack}/result`, answers a result or `{"fault": ...}`

use async_trait::async_trait;
use regsync_core::operation::RegistryTransport;
use regsync_domain::{
    AckToken, FetchOutcome, ItemError, PollState, RegSyncError, RegistryConfig, RegistryError,
    RegistryPayload, RegistryResult, ResultItem,
};
use reqwest::{Method, RequestBuilder};
use serde::Deserialize;
use tracing::{debug, instrument};
use url::Url;

use super::errors::{classify_status, from_client_error, undecodable};
use crate::http::HttpClient;

#[derive(Debug, Deserialize)]
struct AckBody {
    ack: String,
}

#[derive(Debug, Deserialize)]
struct StateBody {
    state: PollState,
}

#[derive(Debug, Deserialize)]
struct ResultBody {
    #[serde(default)]
    fault: Option<ItemError>,
    #[serde(default)]
    error: Option<ItemError>,
    #[serde(default)]
    items: Vec<ResultItem>,
}

/// [`RegistryTransport`] over the retrying [`HttpClient`].
#[derive(Clone)]
pub struct HttpRegistryTransport {
    client: HttpClient,
    base_url: Url,
}

impl HttpRegistryTransport {
    pub fn new(client: HttpClient, base_url: &str) -> Result<Self, RegSyncError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| {
                RegSyncError::Config(format!("invalid registry base url '{base_url}': {e}"))
            })?;
        if base_url.cannot_be_a_base() {
            return Err(RegSyncError::Config(format!(
                "registry base url '{base_url}' cannot be a base"
            )));
        }
        Ok(Self { client, base_url })
    }

    pub fn from_config(config: &RegistryConfig) -> Result<Self, RegSyncError> {
        Self::new(HttpClient::from_config(config)?, &config.base_url)
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, RegistryError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| RegistryError::internal("registry base url cannot be a base"))?
            .pop_if_empty()
            .push("requests")
            .extend(segments);
        Ok(url)
    }

    /// Send and read the body; non-success statuses are classified.
    async fn exchange(&self, builder: RequestBuilder, url: &Url) -> Result<String, RegistryError> {
        let response = self.client.send(builder).await.map_err(from_client_error)?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .text()
            .await
            .map_err(|e| RegistryError::transport(format!("reading {url} failed: {e}")))?;

        if !status.is_success() {
            debug!(%status, %url, "Registry returned an error status");
            return Err(classify_status(status, &headers, url.as_str(), &body));
        }
        Ok(body)
    }
}

#[async_trait]
impl RegistryTransport for HttpRegistryTransport {
    #[instrument(skip(self, payload), fields(items = payload.items.len()))]
    async fn submit(
        &self,
        operation: &str,
        payload: &RegistryPayload,
    ) -> Result<AckToken, RegistryError> {
        let url = self.endpoint(&[operation])?;
        let request = self.client.request(Method::POST, url.clone()).json(payload);
        let body = self.exchange(request, &url).await?;

        let ack: AckBody =
            serde_json::from_str(&body).map_err(|e| undecodable("acknowledgment", &e))?;
        if ack.ack.trim().is_empty() {
            return Err(RegistryError::process("registry returned an empty acknowledgment"));
        }
        Ok(AckToken(ack.ack))
    }

    async fn poll(&self, ack: &AckToken) -> Result<PollState, RegistryError> {
        let url = self.endpoint(&[ack.as_str(), "state"])?;
        let body = self.exchange(self.client.request(Method::GET, url.clone()), &url).await?;

        let state: StateBody = serde_json::from_str(&body).map_err(|e| undecodable("state", &e))?;
        Ok(state.state)
    }

    async fn fetch_result(&self, ack: &AckToken) -> Result<FetchOutcome, RegistryError> {
        let url = self.endpoint(&[ack.as_str(), "result"])?;
        let body = self.exchange(self.client.request(Method::GET, url.clone()), &url).await?;

        let result: ResultBody =
            serde_json::from_str(&body).map_err(|e| undecodable("result", &e))?;
        Ok(match result.fault {
            Some(fault) => FetchOutcome::Fault(fault),
            None => {
                FetchOutcome::Response(RegistryResult { error: result.error, items: result.items })
            }
        })
    }
}
