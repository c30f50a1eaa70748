//! On-demand origin revalidation (`POST /api/revalidate`).

use cachekit_net::Request;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{error, info};

use crate::controller::CacheController;
use crate::error::Result;
use crate::page::Page;

/// Body of a revalidation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RevalidateRequest {
    pub secret: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paths: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub force: Option<bool>,
}

impl RevalidateRequest {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            paths: None,
            force: None,
        }
    }

    pub fn paths(mut self, paths: Vec<String>) -> Self {
        self.paths = Some(paths);
        self
    }

    pub fn force(mut self, force: bool) -> Self {
        self.force = Some(force);
        self
    }
}

/// One revalidated path.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RevalidatedPath {
    pub path: String,
    #[serde(default)]
    pub status: JsonValue,
}

/// `revalidated` is a per-path list on newer servers and a bare flag on
/// older ones.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Revalidated {
    Flag(bool),
    Paths(Vec<RevalidatedPath>),
}

/// Parsed revalidation response. Every field is optional.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct RevalidateResponse {
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub revalidated: Option<Revalidated>,
}

impl CacheController {
    /// POST `request` to the revalidation endpoint. `true` iff the response
    /// is 2xx with a JSON body.
    pub async fn revalidate(&self, request: RevalidateRequest) -> bool {
        let Some(page) = &self.page else {
            return false;
        };

        match self.try_revalidate(page, &request).await {
            Ok(ok) => ok,
            Err(e) => {
                error!(error = %e, "Revalidation failed");
                false
            }
        }
    }

    /// Revalidate with only a secret.
    pub async fn trigger_revalidation(&self, secret: &str) -> bool {
        self.revalidate(RevalidateRequest::new(secret)).await
    }

    async fn try_revalidate(&self, page: &Page, request: &RevalidateRequest) -> Result<bool> {
        let mut url = page.location().await.join(&self.config.revalidate_path)?;
        // The origin reads the secret from the query string.
        url.query_pairs_mut().append_pair("secret", &request.secret);

        let response = page.fetch(Request::post_json(url, request)?).await?;
        let result: RevalidateResponse = serde_json::from_slice(&response.body)?;
        info!(status = %response.status, result = ?result, "Revalidation result");

        Ok(response.ok())
    }
}
