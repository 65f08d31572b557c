//! Host allowlist for direct-dial routing
//!
//! Destinations whose host matches the allowlist are dialed directly;
//! everything else is sent over the bridge. Matching is exact, with an
//! optional dot-suffix scan for domain names: `a.b.c.d` matches entries
//! `a.b.c.d`, `b.c.d` and `c.d`, but never the bare rightmost label `d`.

use std::collections::HashSet;

use parking_lot::RwLock;
use tracing::{debug, warn};

/// Concurrent host allowlist (many readers, exclusive writer)
#[derive(Debug, Default)]
pub struct HostAllowlist {
    hosts: RwLock<HashSet<String>>,
}

impl HostAllowlist {
    /// Create an empty allowlist
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stored set with the given hosts
    ///
    /// Entries are trimmed; empty entries are skipped.
    pub fn load<I, S>(&self, hosts: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut guard = self.hosts.write();
        guard.clear();
        for host in hosts {
            let host = host.as_ref().trim();
            if !host.is_empty() {
                debug!(host = %host, "allowlist load");
                guard.insert(host.to_owned());
            }
        }
    }

    /// Add a single host
    pub fn add(&self, host: &str) {
        let host = host.trim();
        if host.is_empty() {
            warn!("allowlist add skipped, empty host");
            return;
        }

        let mut guard = self.hosts.write();
        if !guard.insert(host.to_owned()) {
            warn!(host = %host, "allowlist add skipped, duplicate");
            return;
        }
        debug!(host = %host, "allowlist +");
    }

    /// Remove a single host
    pub fn remove(&self, host: &str) {
        let host = host.trim();
        if host.is_empty() {
            warn!("allowlist remove skipped, empty host");
            return;
        }

        let mut guard = self.hosts.write();
        if !guard.remove(host) {
            warn!(host = %host, "allowlist remove skipped, not found");
            return;
        }
        debug!(host = %host, "allowlist -");
    }

    /// Check whether a host is allowlisted
    ///
    /// With `check_subdomain`, parent-domain suffixes are tested too,
    /// stopping before the rightmost label (a bare TLD entry never
    /// matches a subdomain).
    #[must_use]
    pub fn contains(&self, host: &str, check_subdomain: bool) -> bool {
        let host = host.trim();
        if host.is_empty() {
            return false;
        }

        let guard = self.hosts.read();
        if guard.contains(host) {
            return true;
        }

        if check_subdomain {
            let parts: Vec<&str> = host.split('.').collect();
            for i in 1..parts.len().saturating_sub(1) {
                if guard.contains(parts[i..].join(".").as_str()) {
                    return true;
                }
            }
        }
        false
    }

    /// Snapshot of the stored hosts
    #[must_use]
    pub fn hosts(&self) -> Vec<String> {
        self.hosts.read().iter().cloned().collect()
    }

    /// Number of stored hosts
    #[must_use]
    pub fn len(&self) -> usize {
        self.hosts.read().len()
    }

    /// Whether the allowlist is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hosts.read().is_empty()
    }
}
