//! REST 场景存储

use crate::config::RestConfig;
use async_trait::async_trait;
use flux_scene::SceneStore;
use flux_scene_core::{FusionError, Result};
use flux_scene_types::{AssetRecord, ChildSceneRecord, SceneRecord};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// 列表接口的分页外壳，只取 `results`
#[derive(Debug, Deserialize)]
struct Listing<T> {
    #[serde(default = "Vec::new")]
    results: Vec<T>,
}

pub struct RestSceneStore {
    base_url: String,
    token: Option<String>,
    client: Client,
}

impl RestSceneStore {
    pub fn new(config: &RestConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| FusionError::store(e.to_string()))?;
        Ok(Self {
            base_url: config.url.clone(),
            token: config.token.clone(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        format!("{}/{}", base, path)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.header(reqwest::header::AUTHORIZATION, format!("Token {token}")),
            None => request,
        }
    }

    async fn list<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<Vec<T>> {
        let url = self.url(path);
        let request = self.authorized(self.client.get(&url).query(query));
        let resp = request
            .send()
            .await
            .map_err(|e| FusionError::store(format!("GET {url}: {e}")))?;
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(FusionError::store(format!("GET {url}: status={status} body={text}")));
        }
        let listing: Listing<T> = serde_json::from_str(&text)
            .map_err(|e| FusionError::store(format!("GET {url}: invalid json: {e}")))?;
        debug!(url = %url, count = listing.results.len(), "Store listing");
        Ok(listing.results)
    }
}

#[async_trait]
impl SceneStore for RestSceneStore {
    async fn get_scenes(&self) -> Result<Vec<SceneRecord>> {
        self.list("scenes", &[]).await
    }

    async fn get_child_scenes(&self, parent: &str) -> Result<Vec<ChildSceneRecord>> {
        self.list("scenes/child", &[("parent", parent)]).await
    }

    async fn get_assets(&self) -> Result<Vec<AssetRecord>> {
        self.list("assets", &[]).await
    }

    async fn update_camera(&self, camera_id: &str, parameters: &Value) -> Result<()> {
        let url = self.url(&format!("camera/{camera_id}"));
        let resp = self
            .authorized(self.client.post(&url).json(parameters))
            .send()
            .await
            .map_err(|e| FusionError::store(format!("POST {url}: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(FusionError::store(format!("POST {url}: status={status} body={text}")));
        }
        Ok(())
    }
}
