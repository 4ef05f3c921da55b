//! Low-level packet filter primitives

use podnat_core::Result;

/// Narrow contract over the host packet filter.
///
/// Rule specs are iptables argument strings without the `-A <chain>`
/// prefix. `list` returns canonical iptables-save lines: the chain
/// header first (`-P` for builtin chains, `-N` for created ones)
/// followed by one `-A <chain> <tokens...>` line per rule, so callers
/// can locate their own rules by string equality.
pub trait PacketFilter: Send + Sync {
    fn new_chain(&self, table: &str, chain: &str) -> Result<()>;
    fn list_chains(&self, table: &str) -> Result<Vec<String>>;
    fn list(&self, table: &str, chain: &str) -> Result<Vec<String>>;
    fn exists(&self, table: &str, chain: &str, rule: &str) -> Result<bool>;
    fn insert(&self, table: &str, chain: &str, rule: &str, position: i32) -> Result<()>;
    fn append_unique(&self, table: &str, chain: &str, rule: &str) -> Result<()>;
    fn delete(&self, table: &str, chain: &str, rule: &str) -> Result<()>;
    fn delete_if_exists(&self, table: &str, chain: &str, rule: &str) -> Result<()>;
}
