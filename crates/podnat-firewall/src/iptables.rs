//! iptables driver backed by the system binaries

use crate::driver::PacketFilter;
use podnat_core::{Error, Result};

/// Shells out through the iptables crate; IPv4 only.
pub struct IptablesDriver {
    conn: ::iptables::IPTables,
}

impl IptablesDriver {
    pub fn new() -> Result<Self> {
        let conn = ::iptables::new(false)
            .map_err(|e| Error::Driver(format!("initializing iptables failed: {}", e)))?;
        Ok(Self { conn })
    }
}

fn driver_err(e: Box<dyn std::error::Error>) -> Error {
    Error::Driver(e.to_string())
}

impl PacketFilter for IptablesDriver {
    fn new_chain(&self, table: &str, chain: &str) -> Result<()> {
        self.conn.new_chain(table, chain).map_err(driver_err)
    }

    fn list_chains(&self, table: &str) -> Result<Vec<String>> {
        self.conn.list_chains(table).map_err(driver_err)
    }

    fn list(&self, table: &str, chain: &str) -> Result<Vec<String>> {
        self.conn.list(table, chain).map_err(driver_err)
    }

    fn exists(&self, table: &str, chain: &str, rule: &str) -> Result<bool> {
        self.conn.exists(table, chain, rule).map_err(driver_err)
    }

    fn insert(&self, table: &str, chain: &str, rule: &str, position: i32) -> Result<()> {
        self.conn
            .insert(table, chain, rule, position)
            .map_err(driver_err)
    }

    fn append_unique(&self, table: &str, chain: &str, rule: &str) -> Result<()> {
        if self.exists(table, chain, rule)? {
            return Ok(());
        }
        self.conn.append(table, chain, rule).map_err(driver_err)
    }

    fn delete(&self, table: &str, chain: &str, rule: &str) -> Result<()> {
        self.conn.delete(table, chain, rule).map_err(driver_err)
    }

    fn delete_if_exists(&self, table: &str, chain: &str, rule: &str) -> Result<()> {
        if !self.exists(table, chain, rule)? {
            return Ok(());
        }
        self.conn.delete(table, chain, rule).map_err(driver_err)
    }
}
