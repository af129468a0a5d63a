use async_trait::async_trait;
use serde_json::Value;

use super::{EntityState, HomeHub};
use crate::{config::HubConfig, LightSyncError, Result};

/// REST client for a Home-Assistant style API.
pub struct HttpHub {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpHub {
    /// Builds a client with the configured request timeout and token.
    pub fn new(config: &HubConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token(),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: reqwest::RequestBuilder, what: &str) -> Result<reqwest::Response> {
        let response = builder
            .send()
            .await
            .map_err(|e| LightSyncError::upstream(format!("{what}: {e}")))?;

        if !response.status().is_success() {
            return Err(LightSyncError::upstream(format!(
                "{what}: status {}",
                response.status()
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl HomeHub for HttpHub {
    async fn read_state(&self, entity_id: &str) -> Result<EntityState> {
        let what = format!("reading state of `{entity_id}`");
        let response = self
            .send(
                self.request(reqwest::Method::GET, &format!("/api/states/{entity_id}")),
                &what,
            )
            .await?;
        response
            .json()
            .await
            .map_err(|e| LightSyncError::upstream(format!("{what}: {e}")))
    }

    async fn read_states(&self) -> Result<Vec<EntityState>> {
        let response = self
            .send(
                self.request(reqwest::Method::GET, "/api/states"),
                "reading entity states",
            )
            .await?;
        response
            .json()
            .await
            .map_err(|e| LightSyncError::upstream(format!("reading entity states: {e}")))
    }

    async fn invoke_service(&self, domain: &str, service: &str, payload: Value) -> Result<()> {
        let what = format!("invoking {domain}.{service}");
        self.send(
            self.request(
                reqwest::Method::POST,
                &format!("/api/services/{domain}/{service}"),
            )
            .json(&payload),
            &what,
        )
        .await?;
        tracing::trace!(domain, service, "service invoked");
        Ok(())
    }
}

impl std::fmt::Debug for HttpHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpHub")
            .field("base_url", &self.base_url)
            .field("authenticated", &self.token.is_some())
            .finish()
    }
}
