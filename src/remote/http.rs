//! `RemoteApi` over HTTP with JSON bodies.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

use super::{LibraryEntry, RemoteApi, RemoteSearchHit};
use crate::config::RemoteConfig;
use crate::error::RemoteError;
use crate::search::SearchOptions;

#[derive(Clone)]
pub struct HttpRemote {
    agent: ureq::Agent,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpRemote {
    pub fn new(config: &RemoteConfig, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            agent,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        }
    }

    fn request(&self, method: &str, path: &str) -> ureq::Request {
        let url = format!("{}{}", self.endpoint, path);
        let mut req = self.agent.request(method, &url);
        if let Some(ref api_key) = self.api_key {
            req = req.set("Authorization", &format!("Bearer {}", api_key));
        }
        req
    }

    async fn post<B, T>(&self, path: &str, body: B) -> Result<T, RemoteError>
    where
        B: Serialize + Send + 'static,
        T: DeserializeOwned + Send + 'static,
    {
        let req = self
            .request("POST", path)
            .set("Content-Type", "application/json");
        let path = path.to_string();
        blocking(move || {
            debug!(path = %path, "POST");
            let response = req.send_json(body).map_err(map_error)?;
            read_json(response)
        })
        .await
    }

    async fn post_unit<B>(&self, path: &str, body: B) -> Result<(), RemoteError>
    where
        B: Serialize + Send + 'static,
    {
        let req = self
            .request("POST", path)
            .set("Content-Type", "application/json");
        blocking(move || {
            req.send_json(body).map_err(map_error)?;
            Ok(())
        })
        .await
    }
}

/// Run a blocking HTTP call off the async runtime.
async fn blocking<T, F>(f: F) -> Result<T, RemoteError>
where
    F: FnOnce() -> Result<T, RemoteError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| RemoteError::Network(format!("request task failed: {}", e)))?
}

fn map_error(err: ureq::Error) -> RemoteError {
    match err {
        ureq::Error::Status(status, response) => {
            let message = response
                .into_string()
                .unwrap_or_else(|_| String::from("unreadable response body"));
            RemoteError::http(status, message)
        }
        ureq::Error::Transport(transport) => RemoteError::Network(transport.to_string()),
    }
}

fn read_json<T: DeserializeOwned>(response: ureq::Response) -> Result<T, RemoteError> {
    let status = response.status();
    response
        .into_json()
        .map_err(|e| RemoteError::http(status, format!("invalid response body: {}", e)))
}

#[async_trait]
impl RemoteApi for HttpRemote {
    async fn set_favorite(&self, dir: &str, path: &str, favorite: bool) -> Result<(), RemoteError> {
        self.post_unit(
            "/api/favorite",
            json!({ "dir": dir, "path": path, "favorite": favorite }),
        )
        .await
    }

    async fn set_tags(&self, dir: &str, path: &str, tags: &[String]) -> Result<(), RemoteError> {
        self.post_unit("/api/tags", json!({ "dir": dir, "path": path, "tags": tags }))
            .await
    }

    async fn delete(&self, dir: &str, paths: &[String]) -> Result<(), RemoteError> {
        self.post_unit("/api/delete", json!({ "dir": dir, "paths": paths }))
            .await
    }

    async fn search(
        &self,
        dir: &str,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Vec<RemoteSearchHit>, RemoteError> {
        self.post(
            "/api/search",
            json!({ "dir": dir, "query": query, "options": options }),
        )
        .await
    }

    async fn get_library(&self, dir: &str) -> Result<Vec<LibraryEntry>, RemoteError> {
        let req = self.request("GET", "/api/library").query("dir", dir);
        blocking(move || {
            let response = req.call().map_err(map_error)?;
            read_json(response)
        })
        .await
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        let req = self.request("GET", "/api/health");
        blocking(move || {
            req.call().map_err(map_error)?;
            Ok(())
        })
        .await
    }
}
