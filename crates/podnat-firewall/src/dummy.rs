//! No-op firewall processor
//!
//! Template for additional firewall flavors; accepts every event and
//! touches nothing on the host.

use crate::FirewallProcessor;
use async_trait::async_trait;
use podnat_core::types::PodEvent;
use podnat_core::Result;
use tracing::warn;

pub struct DummyProcessor;

impl DummyProcessor {
    pub fn new(flavor: &str) -> Self {
        warn!(
            "firewall flavor '{}' not implemented, please use a supported firewall",
            flavor
        );
        Self
    }
}

#[async_trait]
impl FirewallProcessor for DummyProcessor {
    async fn apply(&self, event: &PodEvent) -> Result<()> {
        warn!(
            "firewall processing disabled, dropping {} event for pod {}/{}",
            event.kind, event.namespace, event.name
        );
        Ok(())
    }
}
