// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Local network interface tracking.
//
// Keeps a snapshot of `(interface, family, address)` triples plus the set of
// hostnames under which this machine is reachable, so the discovery intake
// can drop announcements of our own shared queues.  Refreshes are debounced;
// enumeration errors keep the previous snapshot.

use std::collections::HashSet;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{debug, warn};

use druckwerk_core::AddrFamily;

/// Coalescing window for on-demand refreshes.
const REFRESH_DEBOUNCE: Duration = Duration::from_secs(10);

/// One local address as seen on one interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalAddr {
    pub interface: String,
    pub family: AddrFamily,
    pub addr: IpAddr,
}

#[derive(Debug, Default)]
struct Snapshot {
    addrs: Vec<LocalAddr>,
    /// Extra hostnames observed alongside the static set (tests inject here).
    hostnames: HashSet<String>,
}

/// Tracks local interfaces and hostnames.
///
/// Refresh happens on demand (`refresh`) with a 10-second debounce, or
/// unconditionally via `refresh_now` when the caller reacts to an operating
/// system change notification.
pub struct NetifTracker {
    snapshot: RwLock<Snapshot>,
    last_refresh: RwLock<Option<Instant>>,
    /// Hostnames derived from the machine name; independent of interface
    /// enumeration so a failed refresh cannot evict them.
    static_hostnames: HashSet<String>,
}

impl NetifTracker {
    /// Create a tracker and take the first snapshot.
    pub fn new(hostname: impl Into<String>) -> Self {
        let hostname = hostname.into().trim_end_matches('.').to_ascii_lowercase();
        let mut static_hostnames = HashSet::new();
        static_hostnames.insert("localhost".to_string());
        if !hostname.is_empty() {
            let short = hostname
                .split('.')
                .next()
                .unwrap_or(&hostname)
                .to_string();
            static_hostnames.insert(format!("{short}.local"));
            static_hostnames.insert(short);
            static_hostnames.insert(hostname);
        }
        let tracker = Self {
            snapshot: RwLock::new(Snapshot::default()),
            last_refresh: RwLock::new(None),
            static_hostnames,
        };
        tracker.refresh_now();
        tracker
    }

    /// Debounced refresh; a no-op within the coalescing window.
    pub fn refresh(&self) {
        {
            let last = self.last_refresh.read();
            if let Some(at) = *last {
                if at.elapsed() < REFRESH_DEBOUNCE {
                    return;
                }
            }
        }
        self.refresh_now();
    }

    /// Unconditional refresh.
    ///
    /// On enumeration failure the previous snapshot is retained; nothing is
    /// evicted while the error is outstanding.
    pub fn refresh_now(&self) {
        *self.last_refresh.write() = Some(Instant::now());

        let interfaces = match if_addrs::get_if_addrs() {
            Ok(list) => list,
            Err(e) => {
                warn!(error = %e, "interface enumeration failed, keeping previous snapshot");
                return;
            }
        };

        let mut addrs = Vec::with_capacity(interfaces.len());
        for iface in interfaces {
            let ip = iface.ip();
            addrs.push(LocalAddr {
                interface: iface.name.clone(),
                family: AddrFamily::of(&ip),
                addr: ip,
            });
        }

        debug!(addrs = addrs.len(), "interface snapshot refreshed");
        let mut snapshot = self.snapshot.write();
        snapshot.addrs = addrs;
    }

    /// Current `(interface, family, address)` triples.
    pub fn local_addrs(&self) -> Vec<LocalAddr> {
        self.snapshot.read().addrs.clone()
    }

    /// Whether the given address belongs to this machine.
    pub fn is_local_addr(&self, addr: &IpAddr) -> bool {
        self.snapshot.read().addrs.iter().any(|a| &a.addr == addr)
    }

    /// Whether `name` resolves to this machine.
    ///
    /// Case-insensitive, tolerant of a trailing dot.
    pub fn is_local_hostname(&self, name: &str) -> bool {
        let name = name.trim_end_matches('.').to_ascii_lowercase();
        if name.is_empty() {
            return false;
        }
        if let Ok(addr) = name.parse::<IpAddr>() {
            return addr.is_loopback() || self.is_local_addr(&addr);
        }
        self.static_hostnames.contains(&name) || self.snapshot.read().hostnames.contains(&name)
    }

    #[cfg(test)]
    pub(crate) fn inject_snapshot(&self, addrs: Vec<LocalAddr>, hostnames: &[&str]) {
        *self.snapshot.write() = Snapshot {
            addrs,
            hostnames: hostnames.iter().map(|h| h.to_string()).collect(),
        };
    }
}
