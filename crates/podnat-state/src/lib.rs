//! Durable state storage for the podnat rule book
//!
//! The controller persists its rule intentions so they can be reclaimed
//! after a process or node restart. Backends only see an opaque JSON
//! value and guard their blob with an internal mutex because the event
//! loop writes twice per event.

pub mod configmap;
pub mod memory;
pub mod webdav;

use async_trait::async_trait;
use podnat_core::Result;

/// Narrow get/put contract over the remote state blob
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self) -> Result<Vec<u8>>;
    async fn put(&self, data: &serde_json::Value) -> Result<()>;
}

pub use configmap::ConfigMapState;
pub use memory::MemoryState;
pub use webdav::WebDavState;
