//! Rule book persistence in a per-node ConfigMap

use crate::StateStore;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use podnat_core::{Error, Result};
use std::collections::BTreeMap;
use tokio::sync::Mutex;
use tracing::debug;

const STATE_KEY: &str = "state.json";

/// Stores the serialized rule book under `podnat-controller-<node>` in
/// the controller namespace (`NAMESPACE` env, default
/// `podnat-controller-system`).
pub struct ConfigMapState {
    api: Api<ConfigMap>,
    name: String,
    lock: Mutex<()>,
}

impl ConfigMapState {
    pub fn new(client: Client, node_id: &str) -> Self {
        let namespace = std::env::var("NAMESPACE")
            .unwrap_or_else(|_| "podnat-controller-system".to_string());
        Self {
            api: Api::namespaced(client, &namespace),
            name: format!("podnat-controller-{}", node_id),
            lock: Mutex::new(()),
        }
    }

    fn render(&self, data: &serde_json::Value) -> Result<ConfigMap> {
        let mut contents = BTreeMap::new();
        contents.insert(STATE_KEY.to_string(), serde_json::to_string(data)?);
        Ok(ConfigMap {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                ..Default::default()
            },
            data: Some(contents),
            ..Default::default()
        })
    }
}

#[async_trait]
impl StateStore for ConfigMapState {
    async fn get(&self) -> Result<Vec<u8>> {
        let _guard = self.lock.lock().await;

        let configmap = self
            .api
            .get(&self.name)
            .await
            .map_err(|e| Error::State(format!("could not read configmap {}: {}", self.name, e)))?;

        configmap
            .data
            .and_then(|mut data| data.remove(STATE_KEY))
            .map(String::into_bytes)
            .ok_or_else(|| {
                Error::State(format!("configmap {} has no {} key", self.name, STATE_KEY))
            })
    }

    async fn put(&self, data: &serde_json::Value) -> Result<()> {
        let _guard = self.lock.lock().await;

        let configmap = self.render(data)?;
        let existing = self
            .api
            .get_opt(&self.name)
            .await
            .map_err(|e| Error::State(format!("could not query configmap {}: {}", self.name, e)))?;

        if existing.is_some() {
            debug!("updating existing configmap {}", self.name);
            self.api
                .patch(&self.name, &PatchParams::default(), &Patch::Merge(&configmap))
                .await
                .map_err(|e| {
                    Error::State(format!("could not update configmap {}: {}", self.name, e))
                })?;
        } else {
            debug!("creating configmap {}", self.name);
            self.api
                .create(&PostParams::default(), &configmap)
                .await
                .map_err(|e| {
                    Error::State(format!("could not create configmap {}: {}", self.name, e))
                })?;
        }

        Ok(())
    }
}
