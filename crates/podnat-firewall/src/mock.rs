//! Recording packet filter mock used for tests
//!
//! Chains are plain line lists in canonical iptables-save form with a
//! header element first, so position arithmetic behaves like the real
//! thing. Unknown chains act as empty and come into existence on the
//! first mutation, which keeps test setup short.

use crate::driver::PacketFilter;
use podnat_core::{Error, Result};
use std::collections::HashMap;
use std::sync::Mutex;

/// One driver call as recorded by the mock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverCall {
    pub op: &'static str,
    pub table: String,
    pub chain: String,
    pub rule: String,
}

#[derive(Default)]
pub struct MockFilter {
    chains: Mutex<HashMap<(String, String), Vec<String>>>,
    calls: Mutex<Vec<DriverCall>>,
}

/// Render a rule spec the way iptables-save lists it, with the comment
/// argument quoted.
fn canonical_line(chain: &str, rule: &str) -> String {
    let mut tokens: Vec<String> = Vec::new();
    let mut quote_next = false;
    for token in rule.split_whitespace() {
        if quote_next && !token.starts_with('"') {
            tokens.push(format!("\"{}\"", token));
        } else {
            tokens.push(token.to_string());
        }
        quote_next = token == "--comment";
    }
    format!("-A {} {}", chain, tokens.join(" "))
}

impl MockFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate a chain with raw lines, header included
    pub fn seed(&self, table: &str, chain: &str, lines: &[&str]) {
        let mut chains = self.lock_chains();
        chains.insert(
            (table.to_string(), chain.to_string()),
            lines.iter().map(|l| l.to_string()).collect(),
        );
    }

    /// Raw lines of a chain, header included
    pub fn rules(&self, table: &str, chain: &str) -> Vec<String> {
        let chains = self.lock_chains();
        chains
            .get(&(table.to_string(), chain.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Everything recorded so far
    pub fn calls(&self) -> Vec<DriverCall> {
        self.lock_calls().clone()
    }

    /// Recorded calls for one operation
    pub fn calls_for(&self, op: &str) -> Vec<DriverCall> {
        self.lock_calls()
            .iter()
            .filter(|call| call.op == op)
            .cloned()
            .collect()
    }

    pub fn reset_calls(&self) {
        self.lock_calls().clear();
    }

    fn record(&self, op: &'static str, table: &str, chain: &str, rule: &str) {
        self.lock_calls().push(DriverCall {
            op,
            table: table.to_string(),
            chain: chain.to_string(),
            rule: rule.to_string(),
        });
    }

    fn lock_chains(&self) -> std::sync::MutexGuard<'_, HashMap<(String, String), Vec<String>>> {
        self.chains
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_calls(&self) -> std::sync::MutexGuard<'_, Vec<DriverCall>> {
        self.calls
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn with_chain<T>(&self, table: &str, chain: &str, f: impl FnOnce(&mut Vec<String>) -> T) -> T {
        let mut chains = self.lock_chains();
        let lines = chains
            .entry((table.to_string(), chain.to_string()))
            .or_insert_with(|| vec![format!("-N {}", chain)]);
        f(lines)
    }
}

impl PacketFilter for MockFilter {
    fn new_chain(&self, table: &str, chain: &str) -> Result<()> {
        self.record("new_chain", table, chain, "");
        self.with_chain(table, chain, |_| ());
        Ok(())
    }

    fn list_chains(&self, table: &str) -> Result<Vec<String>> {
        let chains = self.lock_chains();
        Ok(chains
            .keys()
            .filter(|(t, _)| t == table)
            .map(|(_, c)| c.clone())
            .collect())
    }

    fn list(&self, table: &str, chain: &str) -> Result<Vec<String>> {
        Ok(self.rules(table, chain))
    }

    fn exists(&self, table: &str, chain: &str, rule: &str) -> Result<bool> {
        let line = canonical_line(chain, rule);
        Ok(self.rules(table, chain).contains(&line))
    }

    fn insert(&self, table: &str, chain: &str, rule: &str, position: i32) -> Result<()> {
        self.record("insert", table, chain, rule);
        let line = canonical_line(chain, rule);
        self.with_chain(table, chain, |lines| {
            // header sits at index 0, rule position 1 follows it
            let index = position.max(1) as usize;
            lines.insert(index.min(lines.len()), line);
        });
        Ok(())
    }

    fn append_unique(&self, table: &str, chain: &str, rule: &str) -> Result<()> {
        self.record("append_unique", table, chain, rule);
        let line = canonical_line(chain, rule);
        self.with_chain(table, chain, |lines| {
            if !lines.contains(&line) {
                lines.push(line);
            }
        });
        Ok(())
    }

    fn delete(&self, table: &str, chain: &str, rule: &str) -> Result<()> {
        self.record("delete", table, chain, rule);
        let line = canonical_line(chain, rule);
        self.with_chain(table, chain, |lines| {
            match lines.iter().position(|l| l == &line) {
                Some(index) => {
                    lines.remove(index);
                    Ok(())
                }
                None => Err(Error::Driver(format!(
                    "no matching rule in {}/{}: {}",
                    table, chain, rule
                ))),
            }
        })
    }

    fn delete_if_exists(&self, table: &str, chain: &str, rule: &str) -> Result<()> {
        self.record("delete_if_exists", table, chain, rule);
        let line = canonical_line(chain, rule);
        self.with_chain(table, chain, |lines| {
            if let Some(index) = lines.iter().position(|l| l == &line) {
                lines.remove(index);
            }
        });
        Ok(())
    }
}
