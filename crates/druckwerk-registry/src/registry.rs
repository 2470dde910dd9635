// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// The remote printer registry: an arena of entries in stable insertion
// order, plus the reconciliation-on-entry logic that absorbs discovery
// records, the cluster promotion rule, and the deleted-master sentinel.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use druckwerk_core::{DiscoveredPrinter, DiscoveryOrigin, EntryStatus, Transport};

use crate::entry::{EntryId, InstanceDecision, RemotePrinter};
use crate::naming::Resolution;

/// Reserved id of the sentinel that parents slaves of a removed master.
pub const DELETED_MASTER: EntryId = EntryId(0);

/// Result of absorbing one discovery record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbsorbOutcome {
    /// A new entry was created.
    Created(EntryId),
    /// An existing entry was refreshed.
    Updated {
        id: EntryId,
        decision: InstanceDecision,
    },
    /// The record joined a cluster as a slave of `master`.
    ClusterJoined { master: EntryId, slave: EntryId },
    /// The record was discarded (name collision with clustering off).
    Dropped(String),
}

/// Keyed store of remote printer entries.
///
/// Scans iterate in insertion order so that cluster masters created before
/// their slaves are always reconciled first.
pub struct Registry {
    entries: HashMap<EntryId, RemotePrinter>,
    order: Vec<EntryId>,
    next_id: u64,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        let mut entries = HashMap::new();
        entries.insert(DELETED_MASTER, RemotePrinter::deleted_master(DELETED_MASTER));
        Self {
            entries,
            order: Vec::new(),
            next_id: 1,
        }
    }

    pub fn get(&self, id: EntryId) -> Option<&RemotePrinter> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: EntryId) -> Option<&mut RemotePrinter> {
        self.entries.get_mut(&id)
    }

    /// Entry ids in insertion order; the sentinel is never included.
    pub fn ids(&self) -> Vec<EntryId> {
        self.order.clone()
    }

    /// Number of tracked entries, sentinel excluded.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// All entries sharing a queue name, in insertion order.
    pub fn by_queue_name(&self, name: &str) -> Vec<EntryId> {
        self.order
            .iter()
            .filter(|id| {
                self.entries
                    .get(id)
                    .map(|e| e.queue_name == name)
                    .unwrap_or(false)
            })
            .copied()
            .collect()
    }

    /// Non-slave live entries; these are the queues we own on the scheduler.
    pub fn managed_queue_count(&self) -> usize {
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id))
            .filter(|e| e.slave_of.is_none() && e.status.is_live())
            .count()
    }

    /// Absorb one normalized discovery record.
    ///
    /// Implements the reconciliation-on-entry rules: match an existing entry
    /// by name and trivially-equivalent URI, classify the instance against
    /// the stored preferred one, or create/cluster a new entry.
    pub fn absorb(
        &mut self,
        record: DiscoveredPrinter,
        resolution: Resolution,
        auto_clustering: bool,
        fresh_attrs: bool,
    ) -> AbsorbOutcome {
        let queue_name = resolution.queue_name;

        // Step 1: same queue name, same printer up to trivial URI variants.
        if let Some(id) = self.find_same_printer(&queue_name, &record) {
            let entry = self.entries.get_mut(&id).expect("id from scan");
            let decision = entry.add_instance(record.instance);
            merge_hints(entry, record.hints);
            if record.cups_queue {
                entry.cups_queue = true;
            }
            if fresh_attrs {
                entry.attributes = None;
            }
            if matches!(
                entry.status,
                EntryStatus::Unconfirmed | EntryStatus::Disappeared
            ) {
                entry.timeout = Instant::now();
                if let Err(e) = entry.transition(EntryStatus::ToBeCreated) {
                    warn!(error = %e, "discovery could not revive entry");
                }
            }
            return AbsorbOutcome::Updated { id, decision };
        }

        // Step 2: a recovered queue from a previous session matches by name
        // alone; the discovery fills in its real instance data.
        let recovered = self.by_queue_name(&queue_name).into_iter().find(|id| {
            self.entries
                .get(id)
                .map(|e| e.slave_of.is_none() && e.status == EntryStatus::Unconfirmed)
                .unwrap_or(false)
        });
        if let Some(id) = recovered {
            let entry = self.entries.get_mut(&id).expect("id from scan");
            let decision = entry.merge_recovered(record.instance);
            merge_hints(entry, record.hints);
            entry.cups_queue |= record.cups_queue;
            entry.timeout = Instant::now();
            let _ = entry.transition(EntryStatus::ToBeCreated);
            info!(entry = %id, queue = %queue_name, "recovered queue confirmed by discovery");
            return AbsorbOutcome::Updated { id, decision };
        }

        // Step 3: same queue name but a different printer; cluster or drop.
        let same_name_master = self
            .by_queue_name(&queue_name)
            .into_iter()
            .find(|id| {
                self.entries
                    .get(id)
                    .map(|e| e.slave_of.is_none() && e.status.is_live())
                    .unwrap_or(false)
            });

        if let Some(master_id) = same_name_master {
            if !auto_clustering && !resolution.manual_cluster {
                info!(
                    queue = %queue_name,
                    uri = %record.instance.uri(),
                    "queue name collision with auto-clustering off, dropping record"
                );
                return AbsorbOutcome::Dropped(queue_name);
            }

            let slave_id = self.allocate_id();
            let mut slave = self.build_entry(slave_id, queue_name.clone(), record);
            slave.cluster = true;
            slave.slave_of = Some(master_id);
            // A slave owns no scheduler resource; it is confirmed by the
            // master's queue.
            slave.status = EntryStatus::Confirmed;
            self.entries.insert(slave_id, slave);
            self.order.push(slave_id);

            let master = self.entries.get_mut(&master_id).expect("id from scan");
            master.cluster = true;
            // Rewrite the queue so its device URI reflects cluster status.
            if master.status == EntryStatus::Confirmed {
                master.timeout = Instant::now();
                let _ = master.transition(EntryStatus::ToBeCreated);
            }
            info!(
                queue = %queue_name,
                master = %master_id,
                slave = %slave_id,
                "clustered two equally-named printers"
            );
            return AbsorbOutcome::ClusterJoined {
                master: master_id,
                slave: slave_id,
            };
        }

        // Step 4: brand-new printer.
        let id = self.allocate_id();
        let mut entry = self.build_entry(id, queue_name, record);
        if resolution.manual_cluster {
            entry.cluster = true;
        }
        info!(entry = %id, queue = %entry.queue_name, uri = %entry.uri, "new remote printer");
        self.entries.insert(id, entry);
        self.order.push(id);
        AbsorbOutcome::Created(id)
    }

    /// Re-adopt a managed queue found on the scheduler at startup.
    ///
    /// The entry starts *unconfirmed*; a matching discovery confirms it
    /// before `deadline`, otherwise it is torn down.
    pub fn recover(
        &mut self,
        queue_name: String,
        instance: druckwerk_core::DiscoveryInstance,
        cluster: bool,
        deadline: Instant,
    ) -> EntryId {
        let id = self.allocate_id();
        let mut entry = RemotePrinter::new(id, queue_name, instance);
        entry.cluster = cluster;
        entry.status = EntryStatus::Unconfirmed;
        entry.timeout = deadline;
        info!(entry = %id, queue = %entry.queue_name, "recovered queue from previous session");
        self.entries.insert(id, entry);
        self.order.push(id);
        id
    }

    /// React to a DNS-SD remove event.
    ///
    /// A browse removal retires every instance seen under that service name
    /// and transport.  Returns the affected entry id when the event matched
    /// one.  An entry whose last instance disappears is scheduled for
    /// removal; a master with a live slave is promoted away first.
    pub fn retire_service(&mut self, service_name: &str, transport: Transport) -> Option<EntryId> {
        let id = self.order.iter().copied().find(|id| {
            self.entries
                .get(id)
                .map(|e| {
                    e.instances()
                        .iter()
                        .any(|i| i.service_name == service_name && i.transport == transport)
                })
                .unwrap_or(false)
        })?;

        let entry = self.entries.get_mut(&id)?;
        entry.remove_service(service_name, transport);
        if entry.has_instances() {
            debug!(entry = %id, uri = %entry.uri, "instance retired, printer still reachable");
            return Some(id);
        }

        entry.timeout = Instant::now();
        if let Err(e) = entry.transition(EntryStatus::Disappeared) {
            warn!(error = %e, "entry with no instances could not be retired");
            return Some(id);
        }
        info!(entry = %id, queue = %entry.queue_name, "last discovery instance gone");
        self.promote_slave_of(id);
        Some(id)
    }

    /// Graceful DNS-SD daemon shutdown: demote DNS-SD-confirmed entries to
    /// *unconfirmed* instead of tearing their queues down, giving the daemon
    /// `grace` to come back.
    pub fn demote_dnssd_entries(&mut self, grace: Duration) {
        let deadline = Instant::now() + grace;
        for id in self.order.clone() {
            let Some(entry) = self.entries.get_mut(&id) else {
                continue;
            };
            let dnssd_only = entry
                .instances()
                .iter()
                .all(|i| i.origin == DiscoveryOrigin::DnsSd);
            if dnssd_only && entry.status == EntryStatus::Confirmed {
                entry.timeout = deadline;
                let _ = entry.transition(EntryStatus::Unconfirmed);
            }
        }
    }

    /// Promotion rule: when `master` is no longer live, its first live slave
    /// becomes the new master and the queue is rewritten to its backing
    /// printer.  Remaining slaves are reparented to the promoted entry.
    ///
    /// Returns the promoted entry id, if any.
    pub fn promote_slave_of(&mut self, master: EntryId) -> Option<EntryId> {
        let is_master = self
            .entries
            .get(&master)
            .map(|e| e.cluster && e.slave_of.is_none())
            .unwrap_or(false);
        if !is_master {
            return None;
        }

        let promoted = self.order.iter().copied().find(|id| {
            self.entries
                .get(id)
                .map(|e| e.slave_of == Some(master) && e.status.is_live())
                .unwrap_or(false)
        })?;

        {
            let entry = self.entries.get_mut(&promoted).expect("id from scan");
            entry.slave_of = None;
            entry.timeout = Instant::now();
            entry.status = EntryStatus::ToBeCreated;
            info!(
                promoted = %promoted,
                queue = %entry.queue_name,
                uri = %entry.uri,
                "slave promoted to cluster master"
            );
        }
        self.reparent_slaves(master, promoted);
        // Still a cluster only while other backings remain; a lone survivor
        // exposes its own device URI again.
        let has_slaves = self.order.iter().any(|id| {
            self.entries
                .get(id)
                .map(|e| e.slave_of == Some(promoted))
                .unwrap_or(false)
        });
        if let Some(entry) = self.entries.get_mut(&promoted) {
            entry.cluster = has_slaves;
        }
        Some(promoted)
    }

    /// Repoint every slave of `from` at `to`.
    ///
    /// `to` may be the deleted-master sentinel while a cluster is being torn
    /// down; a slave parked there is never followed to a real queue.
    pub fn reparent_slaves(&mut self, from: EntryId, to: EntryId) {
        for id in self.order.clone() {
            if let Some(entry) = self.entries.get_mut(&id) {
                if entry.slave_of == Some(from) && id != to {
                    entry.slave_of = Some(to);
                }
            }
        }
    }

    /// Remove an entry from the arena.
    ///
    /// Slaves still pointing at it are parked on the deleted-master
    /// sentinel so that their own teardown cannot touch a replacement queue
    /// created under the same name.
    pub fn remove_entry(&mut self, id: EntryId) -> Option<RemotePrinter> {
        if id == DELETED_MASTER {
            return None;
        }
        self.reparent_slaves(id, DELETED_MASTER);
        self.order.retain(|x| *x != id);
        self.entries.remove(&id)
    }

    /// Release an externally overwritten entry and re-create it under a
    /// `name@host` suffix.
    ///
    /// The original entry moves to *to-be-released* with the given note; a
    /// clone with the suffixed name enters *to-be-created-renamed* and is
    /// immediately advanced to *to-be-created* once the name is set.  Slaves
    /// of the released entry follow the clone.  Returns the clone's id, or
    /// `None` when the name already carries the suffix.
    pub fn release_and_rename(&mut self, id: EntryId, note: &str) -> Option<EntryId> {
        let (new_name, template) = {
            let entry = self.entries.get_mut(&id)?;
            if entry.queue_name.contains('@') {
                // Already renamed once; give up on this printer.
                entry.status_note = Some(note.to_string());
                let _ = entry.transition(EntryStatus::ToBeReleased);
                return None;
            }
            let host = crate::naming::sanitize_dnssd(&entry.preferred().host);
            let new_name = format!("{}@{}", entry.queue_name, host);
            entry.status_note = Some(note.to_string());
            entry.timeout = Instant::now();
            let _ = entry.transition(EntryStatus::ToBeReleased);
            (new_name, entry.clone())
        };

        let new_id = self.allocate_id();
        let mut clone = template;
        clone.id = new_id;
        clone.queue_name = new_name;
        clone.status = EntryStatus::ToBeCreatedRenamed;
        clone.status_note = None;
        clone.called = false;
        clone.retries = 0;
        clone.timeout = Instant::now();
        let _ = clone.transition(EntryStatus::ToBeCreated);
        info!(
            released = %id,
            renamed = %new_id,
            queue = %clone.queue_name,
            "entry released and re-created under suffixed name"
        );
        self.entries.insert(new_id, clone);
        self.order.push(new_id);
        self.reparent_slaves(id, new_id);
        Some(new_id)
    }

    /// Whether another live non-slave entry owns this queue name.
    ///
    /// Used by the delete path: when true, the scheduler queue must survive
    /// the removal of `id` (a promoted master or renamed entry now owns it).
    pub fn queue_has_other_owner(&self, id: EntryId, queue_name: &str) -> bool {
        self.order.iter().any(|other| {
            *other != id
                && self
                    .entries
                    .get(other)
                    .map(|e| {
                        e.queue_name == queue_name
                            && e.slave_of.is_none()
                            && e.status.is_live()
                    })
                    .unwrap_or(false)
        })
    }

    fn find_same_printer(&self, queue_name: &str, record: &DiscoveredPrinter) -> Option<EntryId> {
        self.order.iter().copied().find(|id| {
            self.entries
                .get(id)
                .map(|e| {
                    e.queue_name == queue_name
                        && e.instances()
                            .iter()
                            .any(|i| same_printer_uri(i, &record.instance))
                })
                .unwrap_or(false)
        })
    }

    fn build_entry(
        &mut self,
        id: EntryId,
        queue_name: String,
        record: DiscoveredPrinter,
    ) -> RemotePrinter {
        let mut entry = RemotePrinter::new(id, queue_name, record.instance);
        entry.cups_queue = record.cups_queue;
        entry.hints = record.hints;
        if entry.preferred().origin == DiscoveryOrigin::LegacyBroadcast {
            entry.browse_expiry = Some(Instant::now());
        }
        entry
    }

    fn allocate_id(&mut self) -> EntryId {
        let id = EntryId(self.next_id);
        self.next_id += 1;
        id
    }
}

/// Whether two instances address the same printer up to trivial variants:
/// IPP vs secure IPP, port 631 vs 443, same host and resource path.
fn same_printer_uri(
    a: &druckwerk_core::DiscoveryInstance,
    b: &druckwerk_core::DiscoveryInstance,
) -> bool {
    let ports_equivalent = a.port == b.port
        || (matches!(a.port, 631 | 443) && matches!(b.port, 631 | 443));
    a.host.eq_ignore_ascii_case(&b.host) && a.resource == b.resource && ports_equivalent
}

fn merge_hints(entry: &mut RemotePrinter, hints: druckwerk_core::CapabilityHints) {
    if hints.make_model.is_some() {
        entry.hints.make_model = hints.make_model;
    }
    if !hints.formats.is_empty() {
        entry.hints.formats = hints.formats;
    }
    entry.hints.color |= hints.color;
    entry.hints.duplex |= hints.duplex;
    if hints.location.is_some() {
        entry.hints.location = hints.location;
    }
    if hints.info.is_some() {
        entry.hints.info = hints.info;
    }
}
