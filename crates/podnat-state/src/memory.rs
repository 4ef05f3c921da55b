//! In-memory state store
//!
//! Keeps the blob in process memory, used by tests and as a template for
//! additional backends.

use crate::StateStore;
use async_trait::async_trait;
use podnat_core::{Error, Result};
use tokio::sync::Mutex;

#[derive(Default)]
pub struct MemoryState {
    blob: Mutex<Option<Vec<u8>>>,
}

impl MemoryState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start out with a pre-existing blob, as a restarted controller would
    pub fn with_blob(blob: Vec<u8>) -> Self {
        Self {
            blob: Mutex::new(Some(blob)),
        }
    }
}

#[async_trait]
impl StateStore for MemoryState {
    async fn get(&self) -> Result<Vec<u8>> {
        let blob = self.blob.lock().await;
        blob.clone()
            .ok_or_else(|| Error::State("no state written yet".to_string()))
    }

    async fn put(&self, data: &serde_json::Value) -> Result<()> {
        let encoded = serde_json::to_vec(data)?;
        let mut blob = self.blob.lock().await;
        *blob = Some(encoded);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_a_blob() {
        let store = MemoryState::new();
        assert!(store.get().await.is_err());

        let value = serde_json::json!({"1.2.3.4:25": []});
        store.put(&value).await.unwrap();

        let bytes = store.get().await.unwrap();
        let back: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, value);
    }
}
