//! iptables reconciliation: event intake, rule projection, jump defense

use crate::driver::PacketFilter;
use crate::rulebook::{split_stale, RuleBook, SharedRuleBook};
use crate::FirewallProcessor;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use podnat_core::types::{Chain, NatRule, PodEvent};
use podnat_core::{Error, Result};
use podnat_state::StateStore;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Seconds a rule survives without a refreshing event
const RULE_STALENESS_SECS: i64 = 600;

/// Seconds between jump defense passes per managed chain
const JUMP_CHAIN_REFRESH_SECS: u64 = 300;

/// Networks that never get source NAT applied
const INTERNAL_NETWORKS: &[&str] = &[
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "127.0.0.0/8",
];

/// Tunables handed down from the supervisor flags
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub resource_prefix: String,
    pub dry_run: bool,
    /// Requested jump positions for FORWARD, PREROUTING, POSTROUTING
    pub jump_positions: (i16, i16, i16),
    /// Node address used when an entry relies on auto-detection
    pub public_node_ip: Option<IpAddr>,
}

/// The managed chain triple for a resource prefix
fn managed_chains(prefix: &str, positions: (i16, i16, i16)) -> Vec<Chain> {
    vec![
        Chain {
            name: format!("{}_FORWARD", prefix).to_uppercase(),
            table: "filter".to_string(),
            parent: "FORWARD".to_string(),
            rule_position: positions.0,
        },
        Chain {
            name: format!("{}_PRE", prefix).to_uppercase(),
            table: "nat".to_string(),
            parent: "PREROUTING".to_string(),
            rule_position: positions.1,
        },
        Chain {
            name: format!("{}_POST", prefix).to_uppercase(),
            table: "nat".to_string(),
            parent: "POSTROUTING".to_string(),
            rule_position: positions.2,
        },
    ]
}

/// Map a requested signed position onto the current rule count.
///
/// Positive values count from the top, negative values from the end,
/// zero and an empty chain land on 1, out-of-range values clamp to the
/// last position.
fn compute_position(requested: i16, count: i16) -> i16 {
    let (requested, count) = (i32::from(requested), i32::from(count));
    let position = if count <= 0 || requested == 0 {
        1
    } else if requested > 0 && requested <= count {
        requested
    } else if requested < 0 && requested.abs() <= count {
        count + requested + 1
    } else {
        count
    };
    position as i16
}

/// Chain specific spec for a winner rule
fn rule_spec(chain: &Chain, rule: &NatRule) -> String {
    match chain.parent.as_str() {
        "FORWARD" => format!(
            "-d {}/32 -p {} -m conntrack --ctstate NEW -m {} --dport {} -m comment --comment {} -j ACCEPT",
            rule.destination_ip,
            rule.protocol,
            rule.protocol,
            rule.destination_port,
            rule.comment
        ),
        "PREROUTING" => format!(
            "-d {}/32 -p {} -m {} --dport {} -m comment --comment {} -j DNAT --to-destination {}:{}",
            rule.source_ip,
            rule.protocol,
            rule.protocol,
            rule.source_port,
            rule.comment,
            rule.destination_ip,
            rule.destination_port
        ),
        "POSTROUTING" => format!(
            "-s {}/32 -p {} -m comment --comment {} -j SNAT --to-source {}",
            rule.destination_ip, rule.protocol, rule.comment, rule.source_ip
        ),
        _ => String::new(),
    }
}

/// Re-assert the jump rule from the parent chain into the managed chain
/// at its computed position.
///
/// Other controllers reshuffle the builtin chains, so the rule is
/// matched by its comment token against the canonical listing. A rule
/// found at the wrong index is deleted and reinserted.
pub fn ensure_jump_to_chain(driver: &dyn PacketFilter, chain: &Chain, prefix: &str) -> Result<()> {
    let rule = format!(
        "-m comment --comment {}[jump_to_chain] -j {}",
        prefix, chain.name
    );
    let canonical = format!(
        "-A {} -m comment --comment \"{}[jump_to_chain]\" -j {}",
        chain.parent, prefix, chain.name
    );

    let rules = driver.list(&chain.table, &chain.parent)?;
    // the chain header is the first listed element, real rules follow
    let count = rules.len().saturating_sub(1) as i16;
    let position = i32::from(compute_position(chain.rule_position, count));

    match rules.iter().position(|line| line == &canonical) {
        Some(index) if index as i32 == position => Ok(()),
        Some(index) => {
            info!(
                "moving jump rule for chain {} in table {} from position {} to {}",
                chain.name, chain.table, index, position
            );
            driver.delete(&chain.table, &chain.parent, &rule)?;
            driver.insert(&chain.table, &chain.parent, &rule, position)
        }
        None => {
            info!(
                "adding jump rule for chain {} in table {} at position {}",
                chain.name, chain.table, position
            );
            driver.insert(&chain.table, &chain.parent, &rule, position)
        }
    }
}

/// Consumes pod events and keeps the host packet filter in sync with
/// the rule book, persisting the book around every mutation.
pub struct IptablesProcessor {
    driver: Arc<dyn PacketFilter>,
    state: Arc<dyn StateStore>,
    book: SharedRuleBook,
    chains: Vec<Chain>,
    public_node_ip: Option<IpAddr>,
    staleness: Duration,
    resource_prefix: String,
    dry_run: bool,
}

impl IptablesProcessor {
    /// Load persisted state and bootstrap the managed chains.
    pub async fn new(
        driver: Arc<dyn PacketFilter>,
        state: Arc<dyn StateStore>,
        config: ProcessorConfig,
    ) -> Result<Self> {
        let book = fetch_state(state.as_ref()).await;

        let processor = Self {
            driver,
            state,
            book: Arc::new(tokio::sync::Mutex::new(book)),
            chains: managed_chains(&config.resource_prefix, config.jump_positions),
            public_node_ip: config.public_node_ip,
            staleness: Duration::seconds(RULE_STALENESS_SECS),
            resource_prefix: config.resource_prefix,
            dry_run: config.dry_run,
        };

        processor.init()?;
        Ok(processor)
    }

    /// Shared handle for the introspection endpoint
    pub fn book(&self) -> SharedRuleBook {
        Arc::clone(&self.book)
    }

    fn init(&self) -> Result<()> {
        if self.dry_run {
            info!("dry-run mode enabled, not initializing iptables chains");
            return Ok(());
        }

        for chain in &self.chains {
            self.ensure_chain(chain).map_err(|e| {
                Error::Driver(format!(
                    "initializing iptables chain {} in table {} failed: {}",
                    chain.name, chain.table, e
                ))
            })?;
            self.ensure_defaults(chain).map_err(|e| {
                Error::Driver(format!(
                    "setting up default rules for chain {} in table {} failed: {}",
                    chain.name, chain.table, e
                ))
            })?;
        }
        Ok(())
    }

    /// Create the managed chain unless it is already there. Chains are
    /// never destroyed so rules survive controller restarts without a
    /// reconcile gap.
    fn ensure_chain(&self, chain: &Chain) -> Result<()> {
        let existing = self.driver.list_chains(&chain.table)?;
        if existing.iter().any(|name| name == &chain.name) {
            return Ok(());
        }
        self.driver.new_chain(&chain.table, &chain.name)
    }

    /// Leading no-SNAT block for internal destinations on POSTROUTING
    fn ensure_defaults(&self, chain: &Chain) -> Result<()> {
        if chain.parent != "POSTROUTING" {
            return Ok(());
        }

        for (index, network) in INTERNAL_NETWORKS.iter().enumerate() {
            let rule = format!(
                "-d {} -m comment --comment {}[no_snat_for_internal] -j RETURN",
                network, self.resource_prefix
            );
            if self.driver.exists(&chain.table, &chain.name, &rule)? {
                continue;
            }
            self.driver
                .insert(&chain.table, &chain.name, &rule, (index + 1) as i32)?;
        }
        Ok(())
    }

    /// One background task per managed chain re-asserting the jump rule
    pub fn spawn_jump_defenders(&self) {
        if self.dry_run {
            return;
        }

        for chain in self.chains.clone() {
            let driver = Arc::clone(&self.driver);
            let prefix = self.resource_prefix.clone();
            tokio::spawn(async move {
                let mut ticker =
                    tokio::time::interval(std::time::Duration::from_secs(JUMP_CHAIN_REFRESH_SECS));
                loop {
                    ticker.tick().await;
                    if let Err(e) = ensure_jump_to_chain(driver.as_ref(), &chain, &prefix) {
                        warn!(
                            "jump defense for chain {} in table {} failed: {}",
                            chain.name, chain.table, e
                        );
                    }
                }
            });
        }
    }

    /// Project the rule book onto the packet filter and prune stale
    /// candidates, leaving at most one winner per key.
    pub async fn reconcile(&self) -> Result<()> {
        let now = Utc::now();

        {
            let mut book = self.book.lock().await;
            for key in book.keys_cloned() {
                let Some(list) = book.get(&key) else {
                    continue;
                };
                let (live, stale) = split_stale(list, now, self.staleness);

                for rule in &stale {
                    for chain in &self.chains {
                        info!(
                            "[chain:{}] deleting rule {}: {}",
                            chain.name,
                            rule.comment,
                            rule_spec(chain, rule)
                        );
                        if self.dry_run {
                            info!("dry-run activated, not deleting rule for {}", rule.comment);
                            continue;
                        }
                        if let Err(e) = self.driver.delete_if_exists(
                            &chain.table,
                            &chain.name,
                            &rule_spec(chain, rule),
                        ) {
                            warn!("failed deleting stale rule for {}: {}", rule.comment, e);
                        }
                    }
                }

                if live.is_empty() {
                    if !self.dry_run {
                        info!("empty NAT mapping, removing key {}", key);
                        book.remove(&key);
                    }
                    continue;
                }

                if live.len() > 1 {
                    warn!(
                        "unexpected conflicting entries for {}, choosing first in list",
                        key
                    );
                }
                let winner = &live[0];
                for chain in &self.chains {
                    if self.dry_run {
                        warn!(
                            "dry-run activated, not applying rule {} in chain {}",
                            winner.comment, chain.name
                        );
                        continue;
                    }
                    self.driver
                        .append_unique(&chain.table, &chain.name, &rule_spec(chain, winner))
                        .map_err(|e| {
                            Error::Driver(format!(
                                "failed appending rule for '{}' in chain '{}': {}",
                                key, chain.name, e
                            ))
                        })?;
                }

                if !self.dry_run {
                    book.replace(key, live);
                }
            }
        }

        self.sync_state().await;
        Ok(())
    }

    async fn sync_state(&self) {
        // LastVerified moves on every refreshing event, so the blob is
        // written out on each pass
        let value = {
            let book = self.book.lock().await;
            match serde_json::to_value(&*book) {
                Ok(value) => value,
                Err(e) => {
                    warn!("could not encode rule book: {}", e);
                    return;
                }
            }
        };
        if let Err(e) = self.state.put(&value).await {
            warn!("could not sync to remote state: {}", e);
        }
    }
}

async fn fetch_state(state: &dyn StateStore) -> RuleBook {
    let bytes = match state.get().await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("could not read remote state: {}", e);
            return RuleBook::new();
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(book) => book,
        Err(e) => {
            warn!("state format malformed, starting empty: {}", e);
            RuleBook::new()
        }
    }
}

#[async_trait]
impl FirewallProcessor for IptablesProcessor {
    async fn apply(&self, event: &PodEvent) -> Result<()> {
        {
            let mut book = self.book.lock().await;
            for entry in &event.annotation.entries {
                let source_ip = match &entry.source_ip {
                    Some(ip) => ip.parse::<IpAddr>().ok(),
                    None => self.public_node_ip,
                };
                let Some(source_ip) = source_ip else {
                    warn!(
                        "could not determine source IP for entry of pod {}/{}, skipping",
                        event.namespace, event.name
                    );
                    continue;
                };

                book.apply_entry(
                    event,
                    source_ip,
                    entry.source_port,
                    entry.destination_port,
                    entry.protocol,
                    self.staleness,
                );
            }
        }

        self.sync_state().await;

        if let Err(e) = self.reconcile().await {
            error!("reconciling rules failed: {}", e);
            return Err(e);
        }
        Ok(())
    }
}
