//! podnat controller
//!
//! Per-node controller that exposes annotated pods through iptables
//! DNAT/SNAT rules. A pod watch feeds NAT events into a single-consumer
//! loop; the firewall processor reconciles the host chains and persists
//! its rule book to a remote state store so rules survive restarts.

mod http;
mod informer;

use anyhow::{Context, Result};
use clap::Parser;
use informer::{InformerConfig, PodInformer};
use podnat_core::netutil;
use podnat_core::types::EventKind;
use podnat_firewall::{
    DummyProcessor, FirewallProcessor, IptablesDriver, IptablesProcessor, ProcessorConfig,
    RuleBook, SharedRuleBook,
};
use podnat_state::{ConfigMapState, StateStore, WebDavState};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Per-node controller exposing annotated pods through iptables NAT rules
#[derive(Parser, Debug)]
#[command(name = "podnat-controller")]
struct Flags {
    /// Pod annotation key for iptables NAT trigger
    #[arg(long, default_value = "bln.space/podnat")]
    annotation_key: String,

    /// HTTP service port number
    #[arg(long, default_value_t = 8484)]
    http_port: u16,

    /// Kubernetes informer resync interval in seconds
    #[arg(long, default_value_t = 180)]
    informer_resync: u32,

    /// Execute iptables commands or print only
    #[arg(long, default_value_t = false)]
    dry_run: bool,

    /// Restricted ports refused for NAT rules
    #[arg(long, default_value = "22,53,6443")]
    restricted_ports: String,

    /// Allow NAT rules on the restricted ports
    #[arg(long, default_value_t = false)]
    restricted_ports_enable: bool,

    /// Firewall implementation to use for NAT setup
    #[arg(long, default_value = "iptables")]
    firewall_flavor: String,

    /// Rule positions for the chain jumps (FORWARD,PREROUTING,POSTROUTING)
    #[arg(long, default_value = "-2,-2,-2")]
    iptables_jump: String,

    /// Networks added to the public IP detection block list
    #[arg(long, default_value = "")]
    incl_filter_net: String,

    /// Networks removed from the public IP detection block list (e.g. RFC1918)
    #[arg(long, default_value = "")]
    excl_filter_net: String,

    /// Resource prefix used for firewall chains and comments
    #[arg(long, default_value = "podnat")]
    resource_prefix: String,

    /// State implementation to save iptables rules
    #[arg(long, default_value = "configmap")]
    state_flavor: String,

    /// URI for the webdav state store
    #[arg(long, default_value = "http://podnat-state-store:80")]
    state_uri: String,

    /// Kubernetes node identifier, defaults to the short host name
    #[arg(long)]
    node_id: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let flags = Flags::parse();
    if let Err(e) = run(flags).await {
        error!("startup failed: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(flags: Flags) -> Result<()> {
    let node_id = match flags.node_id.clone() {
        Some(node_id) => node_id,
        None => default_node_id(),
    };
    info!("starting podnat controller on node {}", node_id);

    let restricted_ports = netutil::parse_port_list(&flags.restricted_ports)
        .context("parsing restricted ports flag")?;

    let client = kube::Client::try_default()
        .await
        .context("connecting to the cluster API")?;

    let state: Arc<dyn StateStore> = match flags.state_flavor.as_str() {
        "webdav" => Arc::new(WebDavState::new(&flags.state_uri, &node_id).await),
        _ => Arc::new(ConfigMapState::new(client.clone(), &node_id)),
    };

    let (processor, book): (Arc<dyn FirewallProcessor>, SharedRuleBook) =
        match flags.firewall_flavor.as_str() {
            // iptables needs the remote state to survive pod and node restarts
            "iptables" => {
                let driver = Arc::new(IptablesDriver::new().context("initializing iptables")?);
                let public_node_ip = netutil::public_ip_address(
                    4,
                    &flags.incl_filter_net,
                    &flags.excl_filter_net,
                );
                match public_node_ip {
                    Some(ip) => info!("detected public node IP {}", ip),
                    None => info!("no public node IP detected, auto-detect entries will be skipped"),
                }

                let config = ProcessorConfig {
                    resource_prefix: flags.resource_prefix.clone(),
                    dry_run: flags.dry_run,
                    jump_positions: netutil::parse_jump_positions(&flags.iptables_jump),
                    public_node_ip,
                };
                let processor = IptablesProcessor::new(driver, Arc::clone(&state), config)
                    .await
                    .context("iptables basic setup")?;
                processor.spawn_jump_defenders();

                let book = processor.book();
                (Arc::new(processor), book)
            }
            flavor => (
                Arc::new(DummyProcessor::new(flavor)),
                Arc::new(tokio::sync::Mutex::new(RuleBook::new())),
            ),
        };

    let (events_tx, mut events_rx) = mpsc::channel(1);
    let informer_config = InformerConfig {
        node_id,
        annotation_key: flags.annotation_key.clone(),
        resync_secs: flags.informer_resync,
        restricted_ports,
        restricted_ports_enable: flags.restricted_ports_enable,
        subscriptions: vec![EventKind::Add, EventKind::Update, EventKind::Delete],
    };
    let pod_informer = PodInformer::new(client, informer_config, events_tx);
    tokio::spawn(pod_informer.run());

    let http_server = http::Server::new(flags.http_port, book);
    tokio::spawn(async move {
        if let Err(e) = http_server.run().await {
            error!("http server failed: {}", e);
        }
    });

    // single consumer: event handling and reconciliation stay serialized
    while let Some(event) = events_rx.recv().await {
        if let Err(e) = processor.apply(&event).await {
            error!(
                "applying event for pod {}/{} failed: {}",
                event.namespace, event.name, e
            );
        }
    }

    Ok(())
}

fn default_node_id() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|value| !value.is_empty())
        .or_else(|| {
            hostname::get()
                .ok()
                .and_then(|name| name.into_string().ok())
        })
        .unwrap_or_else(|| "node".to_string());
    netutil::short_host_name(&host).to_string()
}
