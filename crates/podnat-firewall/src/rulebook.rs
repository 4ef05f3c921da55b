//! In-memory NAT rule intention map

use chrono::{DateTime, Duration, Utc};
use podnat_core::types::{EventKind, NatRule, PodEvent, Protocol};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{info, warn};

/// Shared handle to the rule book.
///
/// Mutated only on the supervisor's event task; the HTTP server takes
/// short read locks for introspection.
pub type SharedRuleBook = Arc<tokio::sync::Mutex<RuleBook>>;

/// Intention map keyed by `"<source-ip>:<source-port>"`.
///
/// Several candidate rules may coexist under one key between events
/// when pod incarnations compete for the same external endpoint. The
/// reconciler keeps the newest candidate and drops the rest.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleBook {
    entries: HashMap<String, Vec<NatRule>>,
}

impl RuleBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(source_ip: &IpAddr, source_port: u16) -> String {
        format!("{}:{}", source_ip, source_port)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn keys_cloned(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn get(&self, key: &str) -> Option<&Vec<NatRule>> {
        self.entries.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Vec<NatRule>> {
        self.entries.remove(key)
    }

    pub fn replace(&mut self, key: String, rules: Vec<NatRule>) {
        self.entries.insert(key, rules);
    }

    /// Apply one annotation entry of a pod event to the book.
    ///
    /// Cases, in order:
    /// 1. unknown key: record a fresh rule
    /// 2. known key and same pod/target: refresh, or mark stale on delete
    /// 3. delete for a pod the book no longer holds: nothing to do
    /// 4. known key but different pod: append a competing candidate, the
    ///    reconciler keeps whichever was created last
    pub fn apply_entry(
        &mut self,
        event: &PodEvent,
        source_ip: IpAddr,
        source_port: u16,
        destination_port: u16,
        protocol: Protocol,
        staleness: Duration,
    ) {
        let now = Utc::now();
        let key = Self::key(&source_ip, source_port);

        let new_rule = || NatRule {
            protocol,
            source_ip,
            source_port,
            destination_ip: event.ipv4,
            destination_port,
            created: now,
            last_verified: now,
            comment: format!("{}:{}", event.namespace, event.name),
        };

        let Some(list) = self.entries.get_mut(&key) else {
            warn!(
                "creating new NAT rule for {} => {}:{}",
                key, event.ipv4, destination_port
            );
            self.entries.insert(key, vec![new_rule()]);
            return;
        };

        if let Some(rule) = list
            .iter_mut()
            .find(|r| r.destination_ip == event.ipv4 && r.destination_port == destination_port)
        {
            match event.kind {
                EventKind::Delete => {
                    warn!(
                        "marking pod NAT rule for deletion {} => {}:{} ({})",
                        key, event.ipv4, destination_port, event.name
                    );
                    rule.last_verified = now - staleness;
                }
                EventKind::Add | EventKind::Update => {
                    info!(
                        "refreshing pod NAT rule {} => {}:{} ({})",
                        key, event.ipv4, destination_port, event.name
                    );
                    rule.last_verified = now;
                }
            }
            return;
        }

        // the old entry may already have been reaped
        if event.kind == EventKind::Delete {
            return;
        }

        info!(
            "appending replacement NAT rule for {} => {}:{} ({})",
            key, event.ipv4, destination_port, event.name
        );
        list.push(new_rule());
    }
}

/// Split one key's candidates into surviving and stale rules.
///
/// A rule is stale once its last verification fell out of the staleness
/// window or a later-created candidate supersedes it. The split works
/// on an immutable borrow so callers never remove elements from a list
/// they are still iterating.
pub fn split_stale(
    list: &[NatRule],
    now: DateTime<Utc>,
    staleness: Duration,
) -> (Vec<NatRule>, Vec<NatRule>) {
    let newest = list.iter().map(|rule| rule.created).max();

    let mut live = Vec::new();
    let mut stale = Vec::new();
    for rule in list {
        let expired = now.signed_duration_since(rule.last_verified) >= staleness;
        let superseded = newest.map_or(false, |t| rule.created < t);
        if expired || superseded {
            stale.push(rule.clone());
        } else {
            live.push(rule.clone());
        }
    }
    (live, stale)
}

#[cfg(test)]
mod tests {
    use super::*;
    use podnat_core::types::PodNatAnnotation;

    fn event(kind: EventKind, name: &str, ip: &str) -> PodEvent {
        PodEvent {
            kind,
            name: name.to_string(),
            namespace: "prod".to_string(),
            node: "node1".to_string(),
            ipv4: ip.parse().unwrap(),
            annotation: PodNatAnnotation::default(),
        }
    }

    fn staleness() -> Duration {
        Duration::seconds(600)
    }

    #[test]
    fn add_creates_a_fresh_rule() {
        let mut book = RuleBook::new();
        let source: IpAddr = "1.2.3.4".parse().unwrap();

        book.apply_entry(
            &event(EventKind::Add, "web", "10.0.0.5"),
            source,
            25,
            25,
            Protocol::Tcp,
            staleness(),
        );

        let list = book.get("1.2.3.4:25").unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].comment, "prod:web");
        assert_eq!(list[0].destination_ip, "10.0.0.5".parse::<IpAddr>().unwrap());
        assert_eq!(list[0].created, list[0].last_verified);
    }

    #[test]
    fn update_refreshes_last_verified() {
        let mut book = RuleBook::new();
        let source: IpAddr = "1.2.3.4".parse().unwrap();

        book.apply_entry(
            &event(EventKind::Add, "web", "10.0.0.5"),
            source,
            25,
            25,
            Protocol::Tcp,
            staleness(),
        );
        let before = book.get("1.2.3.4:25").unwrap()[0].last_verified;

        book.apply_entry(
            &event(EventKind::Update, "web", "10.0.0.5"),
            source,
            25,
            25,
            Protocol::Tcp,
            staleness(),
        );
        let after = book.get("1.2.3.4:25").unwrap()[0].last_verified;
        assert!(after >= before);
        assert_eq!(book.get("1.2.3.4:25").unwrap().len(), 1);
    }

    #[test]
    fn delete_marks_the_rule_stale() {
        let mut book = RuleBook::new();
        let source: IpAddr = "1.2.3.4".parse().unwrap();

        book.apply_entry(
            &event(EventKind::Add, "web", "10.0.0.5"),
            source,
            25,
            25,
            Protocol::Tcp,
            staleness(),
        );
        book.apply_entry(
            &event(EventKind::Delete, "web", "10.0.0.5"),
            source,
            25,
            25,
            Protocol::Tcp,
            staleness(),
        );

        let rule = &book.get("1.2.3.4:25").unwrap()[0];
        assert!(Utc::now().signed_duration_since(rule.last_verified) >= staleness());
    }

    #[test]
    fn delete_on_unknown_destination_is_a_noop() {
        let mut book = RuleBook::new();
        let source: IpAddr = "1.2.3.4".parse().unwrap();

        book.apply_entry(
            &event(EventKind::Add, "web", "10.0.0.5"),
            source,
            25,
            25,
            Protocol::Tcp,
            staleness(),
        );
        // delete for a pod that was never recorded under this key
        book.apply_entry(
            &event(EventKind::Delete, "web-2", "10.0.0.6"),
            source,
            25,
            25,
            Protocol::Tcp,
            staleness(),
        );

        let list = book.get("1.2.3.4:25").unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].comment, "prod:web");
    }

    #[test]
    fn competing_pod_appends_a_candidate() {
        let mut book = RuleBook::new();
        let source: IpAddr = "1.2.3.4".parse().unwrap();

        book.apply_entry(
            &event(EventKind::Add, "web", "10.0.0.5"),
            source,
            25,
            25,
            Protocol::Tcp,
            staleness(),
        );
        book.apply_entry(
            &event(EventKind::Add, "web-2", "10.0.0.6"),
            source,
            25,
            25,
            Protocol::Tcp,
            staleness(),
        );

        let list = book.get("1.2.3.4:25").unwrap();
        assert_eq!(list.len(), 2);
        assert!(list[0].created <= list[1].created);
    }

    #[test]
    fn split_keeps_only_latest_created() {
        let now = Utc::now();
        let mut old = NatRule {
            protocol: Protocol::Tcp,
            source_ip: "1.2.3.4".parse().unwrap(),
            source_port: 25,
            destination_ip: "10.0.0.5".parse().unwrap(),
            destination_port: 25,
            created: now - Duration::seconds(30),
            last_verified: now,
            comment: "prod:web".to_string(),
        };
        let new = NatRule {
            destination_ip: "10.0.0.6".parse().unwrap(),
            created: now,
            comment: "prod:web-2".to_string(),
            ..old.clone()
        };

        let (live, stale) = split_stale(&[old.clone(), new.clone()], now, staleness());
        assert_eq!(live, vec![new.clone()]);
        assert_eq!(stale, vec![old.clone()]);

        // an expired verification stamp retires the rule as well
        old.created = new.created;
        old.last_verified = now - Duration::seconds(600);
        let (live, stale) = split_stale(&[old.clone(), new.clone()], now, staleness());
        assert_eq!(live, vec![new]);
        assert_eq!(stale, vec![old]);
    }

    #[test]
    fn book_serializes_as_plain_map() {
        let mut book = RuleBook::new();
        let source: IpAddr = "1.2.3.4".parse().unwrap();
        book.apply_entry(
            &event(EventKind::Add, "web", "10.0.0.5"),
            source,
            25,
            25,
            Protocol::Tcp,
            staleness(),
        );

        let json = serde_json::to_value(&book).unwrap();
        assert!(json.is_object());
        assert!(json.get("1.2.3.4:25").is_some());

        let back: RuleBook = serde_json::from_value(json).unwrap();
        assert_eq!(back, book);
    }
}
