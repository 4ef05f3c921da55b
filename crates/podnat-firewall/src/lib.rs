//! Firewall rule programming for the podnat controller
//!
//! Pod events flow into a rule book of NAT intentions which the
//! reconciling processor projects onto the host packet filter. A
//! periodic defender keeps the jump rules from the builtin chains into
//! the managed chains at their configured positions.

pub mod driver;
pub mod dummy;
pub mod iptables;
pub mod mock;
pub mod processor;
pub mod rulebook;

use async_trait::async_trait;
use podnat_core::types::PodEvent;
use podnat_core::Result;

/// Applies pod NAT events to a concrete firewall backend
#[async_trait]
pub trait FirewallProcessor: Send + Sync {
    async fn apply(&self, event: &PodEvent) -> Result<()>;
}

pub use driver::PacketFilter;
pub use dummy::DummyProcessor;
pub use iptables::IptablesDriver;
pub use mock::{DriverCall, MockFilter};
pub use processor::{IptablesProcessor, ProcessorConfig};
pub use rulebook::{RuleBook, SharedRuleBook};
