//! Core type definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Transport protocol supported for NAT entries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// Pod lifecycle event kind as delivered by the informer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Add,
    Update,
    Delete,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Add => write!(f, "add"),
            EventKind::Update => write!(f, "update"),
            EventKind::Delete => write!(f, "delete"),
        }
    }
}

/// One NAT request taken from the pod annotation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatDefinition {
    /// Use the node's auto-detected public address as external endpoint
    #[serde(rename = "ifaceAuto", default = "default_iface_auto")]
    pub interface_auto_detect: bool,

    /// Explicit external address, mutually exclusive with auto-detection
    #[serde(rename = "srcIP", default)]
    pub source_ip: Option<String>,

    /// External port the rule listens on
    #[serde(rename = "srcPort")]
    pub source_port: u16,

    /// Pod port traffic is translated to
    #[serde(rename = "dstPort")]
    pub destination_port: u16,

    #[serde(rename = "proto", default)]
    pub protocol: Protocol,
}

fn default_iface_auto() -> bool {
    true
}

/// Parsed pod NAT annotation, nested `{"entries":[...]}` schema
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodNatAnnotation {
    pub entries: Vec<NatDefinition>,
}

/// A pod lifecycle event scoped to this node
#[derive(Debug, Clone)]
pub struct PodEvent {
    pub kind: EventKind,
    pub name: String,
    pub namespace: String,
    pub node: String,
    pub ipv4: IpAddr,
    pub annotation: PodNatAnnotation,
}

/// NAT rule intent derived from pod events.
///
/// Field names are serialized in PascalCase because the persisted state
/// blob is shared across controller restarts and documented that way.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NatRule {
    #[serde(rename = "Protocol")]
    pub protocol: Protocol,

    #[serde(rename = "SourceIP")]
    pub source_ip: IpAddr,

    #[serde(rename = "SourcePort")]
    pub source_port: u16,

    #[serde(rename = "DestinationIP")]
    pub destination_ip: IpAddr,

    #[serde(rename = "DestinationPort")]
    pub destination_port: u16,

    #[serde(rename = "LastVerified")]
    pub last_verified: DateTime<Utc>,

    #[serde(rename = "Created")]
    pub created: DateTime<Utc>,

    /// `<namespace>:<pod-name>` of the owning pod
    #[serde(rename = "Comment")]
    pub comment: String,
}

/// A managed iptables chain and its jump anchor in the parent chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chain {
    pub name: String,
    pub table: String,
    pub parent: String,
    /// Requested jump rule position, negative values count from the end
    pub rule_position: i16,
}
