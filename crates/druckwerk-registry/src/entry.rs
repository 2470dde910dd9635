// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// One remote printer entry: identity, discovery instances, capability cache,
// cluster linkage, status, and reconciliation bookkeeping.

use std::collections::HashMap;
use std::time::Instant;

use tracing::debug;

use druckwerk_core::error::{DruckwerkError, Result};
use druckwerk_core::{
    AddrFamily, CapabilityHints, DiscoveryInstance, DiscoveryOrigin, EntryStatus,
    PrinterAttributes, Transport,
};

/// Stable identifier of a registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(pub u64);

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a newly seen discovery instance relates to the stored preferred one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceDecision {
    /// The new instance replaces the preferred one; the device URI changes.
    Upgrade,
    /// Worse than the preferred instance; recorded but not exposed.
    Downgrade,
    /// Equally ranked; added to the instance set.
    Tie,
    /// Same instance seen again; nothing changed.
    Duplicate,
}

/// A remote printer tracked across discovery events.
#[derive(Debug, Clone)]
pub struct RemotePrinter {
    pub id: EntryId,
    /// Local queue name, unique up to master/slave sharing.
    pub queue_name: String,
    /// Currently exposed device URI, always derived from the preferred
    /// instance.
    pub uri: String,
    instances: Vec<DiscoveryInstance>,
    /// True if the upstream is itself a print scheduler queue.
    pub cups_queue: bool,
    pub cluster: bool,
    /// Master entry id when this entry is a cluster slave.
    pub slave_of: Option<EntryId>,
    /// Full attribute set from the last get-printer-attributes query.
    pub attributes: Option<PrinterAttributes>,
    pub hints: CapabilityHints,
    /// Option defaults restored from a previous session.
    pub saved_options: HashMap<String, String>,
    pub status: EntryStatus,
    /// Next reconciler action deadline.
    pub timeout: Instant,
    /// Expiry for entries learned via legacy scheduler broadcast.
    pub browse_expiry: Option<Instant>,
    /// Round-robin cursor of the last dispatched cluster member.
    pub last_printer: usize,
    /// Set when an external actor rewrote our queue.
    pub overwritten: bool,
    /// Consecutive transient-failure count.
    pub retries: u32,
    /// Token held by the worker currently processing this entry.
    pub called: bool,
    /// Nickname of the driver attached to our queue, for overwrite checks.
    pub nickname: Option<String>,
    /// Human-readable reason attached to the last status change.
    pub status_note: Option<String>,
    /// Skipped for the rest of the session after the retry cap.
    pub abandoned: bool,
}

impl RemotePrinter {
    pub fn new(id: EntryId, queue_name: String, instance: DiscoveryInstance) -> Self {
        let uri = instance.uri();
        Self {
            id,
            queue_name,
            uri,
            instances: vec![instance],
            cups_queue: false,
            cluster: false,
            slave_of: None,
            attributes: None,
            hints: CapabilityHints::default(),
            saved_options: HashMap::new(),
            status: EntryStatus::ToBeCreated,
            timeout: Instant::now(),
            browse_expiry: None,
            last_printer: 0,
            overwritten: false,
            retries: 0,
            called: false,
            nickname: None,
            status_note: None,
            abandoned: false,
        }
    }

    /// The sentinel entry that parents slaves of a removed master.
    pub(crate) fn deleted_master(id: EntryId) -> Self {
        let placeholder = DiscoveryInstance {
            origin: DiscoveryOrigin::DnsSd,
            transport: Transport::Ipp,
            family: AddrFamily::V4,
            interface: String::new(),
            service_name: String::new(),
            domain: String::new(),
            host: String::new(),
            ip: None,
            port: 0,
            resource: String::new(),
        };
        let mut entry = Self::new(id, String::new(), placeholder);
        entry.status = EntryStatus::DeletedMaster;
        entry
    }

    /// The preferred discovery instance (index 0 of the sorted set).
    pub fn preferred(&self) -> &DiscoveryInstance {
        &self.instances[0]
    }

    pub fn instances(&self) -> &[DiscoveryInstance] {
        &self.instances
    }

    /// Record a discovery instance.
    ///
    /// The instance set stays sorted by preference; the device URI only
    /// changes on an upgrade.  An upgrade also invalidates the capability
    /// cache, since the printer may expose different attributes through the
    /// better path.
    pub fn add_instance(&mut self, instance: DiscoveryInstance) -> InstanceDecision {
        if let Some(existing) = self.instances.iter_mut().find(|i| {
            i.interface == instance.interface
                && i.transport == instance.transport
                && i.family == instance.family
                && i.origin == instance.origin
        }) {
            if *existing == instance {
                return InstanceDecision::Duplicate;
            }
            *existing = instance;
            self.resort();
            return InstanceDecision::Duplicate;
        }

        let decision = {
            let new_rank = instance.preference_rank();
            let preferred_rank = self.preferred().preference_rank();
            if new_rank < preferred_rank {
                InstanceDecision::Upgrade
            } else if new_rank > preferred_rank {
                InstanceDecision::Downgrade
            } else {
                InstanceDecision::Tie
            }
        };

        self.instances.push(instance);
        self.resort();

        if decision == InstanceDecision::Upgrade {
            self.attributes = None;
            debug!(
                entry = %self.id,
                queue = %self.queue_name,
                uri = %self.uri,
                "preferred instance upgraded"
            );
        }
        decision
    }

    /// Remove the instance seen through `(interface, transport, family)`.
    ///
    /// Returns true when an instance was removed; the device URI follows the
    /// new preferred instance (an explicit downgrade).  The last instance is
    /// removable; callers must then retire the entry.
    pub fn remove_instance(
        &mut self,
        interface: &str,
        transport: Transport,
        family: AddrFamily,
    ) -> bool {
        let before = self.instances.len();
        self.instances.retain(|i| {
            !(i.interface == interface && i.transport == transport && i.family == family)
        });
        if self.instances.len() == before {
            return false;
        }
        if !self.instances.is_empty() {
            self.resort();
        }
        true
    }

    /// Fold a discovery into an entry recovered from a previous session.
    ///
    /// Recovery synthesizes placeholder instances (empty host) for queues
    /// whose device URI could not be parsed; the first real discovery
    /// replaces them.
    pub fn merge_recovered(&mut self, instance: DiscoveryInstance) -> InstanceDecision {
        self.instances.retain(|i| !i.host.is_empty());
        if self.instances.is_empty() {
            self.instances.push(instance);
            self.resort();
            self.attributes = None;
            return InstanceDecision::Upgrade;
        }
        self.add_instance(instance)
    }

    /// Remove every instance announced under `(service_name, transport)`.
    ///
    /// This is the shape of a DNS-SD browse removal: one event retires the
    /// service across all interfaces and families at once.
    pub fn remove_service(&mut self, service_name: &str, transport: Transport) -> bool {
        let before = self.instances.len();
        self.instances
            .retain(|i| !(i.service_name == service_name && i.transport == transport));
        if self.instances.len() == before {
            return false;
        }
        if !self.instances.is_empty() {
            self.resort();
        }
        true
    }

    pub fn has_instances(&self) -> bool {
        !self.instances.is_empty()
    }

    fn resort(&mut self) {
        self.instances.sort_by_key(|i| i.preference_rank());
        self.uri = self.instances[0].uri();
    }

    /// Move to `next`, validating against the state machine.
    pub fn transition(&mut self, next: EntryStatus) -> Result<()> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(DruckwerkError::InvalidTransition(format!(
                "{} -> {} on queue {}",
                self.status, next, self.queue_name
            )));
        }
        debug!(
            entry = %self.id,
            queue = %self.queue_name,
            from = %self.status,
            to = %next,
            "entry transition"
        );
        self.status = next;
        Ok(())
    }

    /// Whether this entry is a cluster master (flagged, not a slave).
    pub fn is_master(&self) -> bool {
        self.cluster && self.slave_of.is_none()
    }
}
