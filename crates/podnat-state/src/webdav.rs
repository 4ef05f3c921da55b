//! Rule book persistence on a WebDAV share

use crate::StateStore;
use async_trait::async_trait;
use podnat_core::{Error, Result};
use reqwest::{Client, Method, StatusCode};
use tokio::sync::Mutex;
use tracing::error;

const STATE_FILE: &str = "state.json";

/// Stores the serialized rule book as `<uri>/<node>/state.json`
pub struct WebDavState {
    client: Client,
    base: String,
    directory: String,
    lock: Mutex<()>,
}

impl WebDavState {
    /// Connect to the share and ensure the per-node directory exists.
    ///
    /// Failing to create the directory is unrecoverable remote I/O and
    /// terminates the process with exit code 121.
    pub async fn new(uri: &str, node_id: &str) -> Self {
        let state = Self {
            client: Client::new(),
            base: uri.trim_end_matches('/').to_string(),
            directory: node_id.to_string(),
            lock: Mutex::new(()),
        };

        if let Err(e) = state.init().await {
            error!("could not init state directory: {}", e);
            // EREMOTEIO
            std::process::exit(121);
        }

        state
    }

    fn file_url(&self) -> String {
        format!("{}/{}/{}", self.base, self.directory, STATE_FILE)
    }

    async fn init(&self) -> Result<()> {
        let mkcol = Method::from_bytes(b"MKCOL")
            .map_err(|e| Error::State(format!("invalid webdav method: {}", e)))?;

        let response = self
            .client
            .request(mkcol, format!("{}/{}", self.base, self.directory))
            .send()
            .await
            .map_err(|e| Error::State(format!("could not reach state store: {}", e)))?;

        // 405 means the collection already exists
        if !response.status().is_success() && response.status() != StatusCode::METHOD_NOT_ALLOWED {
            return Err(Error::State(format!(
                "state directory creation returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for WebDavState {
    async fn get(&self) -> Result<Vec<u8>> {
        let _guard = self.lock.lock().await;

        let response = self
            .client
            .get(self.file_url())
            .send()
            .await
            .map_err(|e| Error::State(format!("could not read state: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::State(format!(
                "could not read state: {}",
                response.status()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::State(format!("could not read state body: {}", e)))?;
        Ok(bytes.to_vec())
    }

    async fn put(&self, data: &serde_json::Value) -> Result<()> {
        let _guard = self.lock.lock().await;

        let body = serde_json::to_vec(data)?;
        let response = self
            .client
            .put(self.file_url())
            .body(body)
            .send()
            .await
            .map_err(|e| Error::State(format!("could not write state: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::State(format!(
                "could not write state: {}",
                response.status()
            )));
        }
        Ok(())
    }
}
