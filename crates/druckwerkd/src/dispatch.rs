// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Per-job load balancing for cluster queues.
//
// When a job enters processing on a cluster master, exactly one backing
// printer is chosen and recorded in the queue's dispatch option; the
// scheduler backend forwards the job there.  Selection is round-robin over
// the confirmed cluster members, constrained by what each member's cached
// attributes say it supports, refined by a live state probe.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, instrument, warn};

use druckwerk_core::config::DispatchPolicy;
use druckwerk_core::error::Result;
use druckwerk_core::{JobConstraints, PrintQuality, PrinterAttributes, PrinterState};
use druckwerk_cups::attrs::{
    is_accepting, printer_state, resolution_default, resolutions_supported, value_set,
};
use druckwerk_cups::{Scheduler, DEST_OPTION};
use druckwerk_registry::{EntryId, Registry};

/// Marker written when every suitable member was busy (QueueOnClient).
pub const ALL_DESTS_BUSY: &str = "ALL_DESTS_BUSY";

/// Marker written when no member supports the job's constraints.
pub const NO_DEST_FOUND: &str = "NO_DEST_FOUND";

/// Forwarding format preference, most desirable first.
const FORMAT_PRIORITY: &[&str] = &[
    "application/vnd.cups-pdf",
    "image/urf",
    "application/pdf",
    "image/pwg-raster",
    "application/PCLm",
    "application/vnd.hp-pclxl",
    "application/postscript",
    "application/pcl",
];

/// Outcome of one dispatch decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Chosen {
        entry: EntryId,
        uri: String,
        format: String,
        resolution_dpi: u32,
    },
    AllBusy,
    NoDestination,
}

#[derive(Clone)]
struct Candidate {
    id: EntryId,
    uri: String,
    attributes: Option<PrinterAttributes>,
}

/// Selects one backing printer per job on cluster queues.
pub struct Dispatcher {
    registry: Arc<RwLock<Registry>>,
    scheduler: Arc<dyn Scheduler>,
    policy: DispatchPolicy,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<RwLock<Registry>>,
        scheduler: Arc<dyn Scheduler>,
        policy: DispatchPolicy,
    ) -> Self {
        Self {
            registry,
            scheduler,
            policy,
        }
    }

    /// Handle a job entering processing on `queue`.
    ///
    /// Returns `None` when the queue is not a cluster master we manage.
    #[instrument(skip(self))]
    pub async fn dispatch_job(&self, queue: &str, job_id: i32) -> Result<Option<Dispatch>> {
        // Snapshot the cluster under the read lock; probing happens without it.
        let (master, start, candidates) = {
            let registry = self.registry.read();
            let Some(master) = registry
                .by_queue_name(queue)
                .into_iter()
                .find(|id| {
                    registry
                        .get(*id)
                        .map(|e| e.is_master() && e.status == druckwerk_core::EntryStatus::Confirmed)
                        .unwrap_or(false)
                })
            else {
                return Ok(None);
            };

            let candidates: Vec<Candidate> = registry
                .by_queue_name(queue)
                .into_iter()
                .filter_map(|id| registry.get(id))
                .filter(|e| e.status == druckwerk_core::EntryStatus::Confirmed)
                .map(|e| Candidate {
                    id: e.id,
                    uri: e.uri.clone(),
                    attributes: e.attributes.clone(),
                })
                .collect();

            let last = registry.get(master).map(|e| e.last_printer).unwrap_or(0);
            (master, last, candidates)
        };

        if candidates.is_empty() {
            return Ok(None);
        }

        let constraints = match self.scheduler.job_attributes(queue, job_id).await {
            Ok(attrs) => constraints_from_job(&attrs),
            Err(e) => {
                debug!(error = %e, "no job attributes, dispatching unconstrained");
                JobConstraints::default()
            }
        };

        let suitable: Vec<Candidate> = candidates
            .iter()
            .filter(|c| supports_constraints(c.attributes.as_ref(), &constraints))
            .cloned()
            .collect();

        if suitable.is_empty() {
            warn!(queue, job_id, "no cluster member supports the job constraints");
            self.write_dest(queue, &format!("{job_id} {NO_DEST_FOUND}")).await?;
            return Ok(Some(Dispatch::NoDestination));
        }

        let decision = self.select(&suitable, start, &constraints).await;

        match &decision {
            Dispatch::Chosen {
                entry,
                uri,
                format,
                resolution_dpi,
            } => {
                self.write_dest(
                    queue,
                    &format!("{job_id} {uri} {format} {resolution_dpi}dpi"),
                )
                .await?;
                // Advance the round-robin cursor only on an actual choice.
                let chosen = *entry;
                let mut registry = self.registry.write();
                if let Some(index) = suitable.iter().position(|c| c.id == chosen) {
                    let absolute = candidates
                        .iter()
                        .position(|c| c.id == suitable[index].id)
                        .unwrap_or(index);
                    if let Some(master) = registry.get_mut(master) {
                        master.last_printer = absolute;
                    }
                }
                info!(queue, job_id, dest = %uri, "job dispatched");
            }
            Dispatch::AllBusy => {
                self.write_dest(queue, &format!("{job_id} {ALL_DESTS_BUSY}")).await?;
                info!(queue, job_id, "all cluster members busy, backend will retry");
            }
            Dispatch::NoDestination => {
                self.write_dest(queue, &format!("{job_id} {NO_DEST_FOUND}")).await?;
            }
        }
        Ok(Some(decision))
    }

    /// Probe members round-robin and pick the winner per policy.
    async fn select(
        &self,
        suitable: &[Candidate],
        last_printer: usize,
        constraints: &JobConstraints,
    ) -> Dispatch {
        let n = suitable.len();
        let start = (last_printer + 1) % n;

        let mut fallback: Option<(usize, u32)> = None;

        for offset in 0..n {
            let index = (start + offset) % n;
            let candidate = &suitable[index];

            let probe = match self.scheduler.probe_printer(&candidate.uri).await {
                Ok(attrs) => attrs,
                Err(e) => {
                    debug!(uri = %candidate.uri, error = %e, "probe failed, skipping member");
                    continue;
                }
            };

            if !is_accepting(&probe) {
                continue;
            }

            match printer_state(&probe) {
                PrinterState::Idle => {
                    return self.choose(candidate, &probe, constraints);
                }
                PrinterState::Processing => {
                    if self.policy == DispatchPolicy::QueueOnServers {
                        let jobs = probe
                            .get("queued-job-count")
                            .and_then(|v| v.trim().parse::<u32>().ok())
                            .unwrap_or(u32::MAX);
                        let better = fallback.map(|(_, best)| jobs < best).unwrap_or(true);
                        if better {
                            fallback = Some((index, jobs));
                        }
                    }
                }
                PrinterState::Stopped => {}
            }
        }

        if let Some((index, _)) = fallback {
            let candidate = &suitable[index];
            // The fallback's probe is refetched; it was cheap and the state
            // may have moved on.
            if let Ok(probe) = self.scheduler.probe_printer(&candidate.uri).await {
                return self.choose(candidate, &probe, constraints);
            }
        }

        Dispatch::AllBusy
    }

    fn choose(
        &self,
        candidate: &Candidate,
        probe: &PrinterAttributes,
        constraints: &JobConstraints,
    ) -> Dispatch {
        let attrs = candidate.attributes.as_ref().unwrap_or(probe);
        Dispatch::Chosen {
            entry: candidate.id,
            uri: candidate.uri.clone(),
            format: pick_format(attrs),
            resolution_dpi: pick_resolution(attrs, constraints.quality),
        }
    }

    async fn write_dest(&self, queue: &str, value: &str) -> Result<()> {
        self.scheduler
            .set_queue_option(queue, DEST_OPTION, value)
            .await
    }
}

/// Parse job attribute constraints out of a Get-Job-Attributes result.
pub fn constraints_from_job(attrs: &PrinterAttributes) -> JobConstraints {
    let get = |key: &str| attrs.get(key).map(|v| v.trim().to_string());
    let finishings = value_set(attrs, "finishings");
    let has_finishing = |keyword: &str, value: &str| {
        finishings.contains(keyword) || finishings.contains(value)
    };

    JobConstraints {
        document_format: get("document-format"),
        media_type: get("media-type"),
        page_size: get("media"),
        duplex: get("sides").map(|v| v.starts_with("two-sided")),
        color: get("print-color-mode").map(|v| v == "color"),
        staple: has_finishing("staple", "4"),
        punch: has_finishing("punch", "5"),
        fold: has_finishing("fold", "10"),
        quality: get("print-quality").and_then(|v| match v.as_str() {
            "3" => Some(PrintQuality::Draft),
            "4" => Some(PrintQuality::Normal),
            "5" => Some(PrintQuality::High),
            _ => None,
        }),
        orientation: get("orientation-requested").and_then(|v| v.parse().ok()),
    }
}

/// Whether a member's cached attributes advertise support for the job.
///
/// A member with no cached attributes passes; unknown capabilities are
/// assumed supported, the same optimism the capability cache applies
/// elsewhere.
pub fn supports_constraints(
    attributes: Option<&PrinterAttributes>,
    constraints: &JobConstraints,
) -> bool {
    let Some(attrs) = attributes else {
        return true;
    };
    let supports = |list: &str, wanted: &Option<String>| match wanted {
        Some(value) => {
            let set = value_set(attrs, list);
            set.is_empty() || set.contains(value)
        }
        None => true,
    };

    if !supports("document-format-supported", &constraints.document_format) {
        return false;
    }
    if !supports("media-supported", &constraints.page_size) {
        return false;
    }
    if !supports("media-type-supported", &constraints.media_type) {
        return false;
    }

    if constraints.duplex == Some(true) {
        let sides = value_set(attrs, "sides-supported");
        if !sides.is_empty() && !sides.iter().any(|s| s.starts_with("two-sided")) {
            return false;
        }
    }

    if constraints.color == Some(true) {
        let modes = value_set(attrs, "print-color-mode-supported");
        let color_supported = attrs
            .get("color-supported")
            .map(|v| v.eq_ignore_ascii_case("true") || v == "1");
        let mode_ok = modes.is_empty() || modes.contains("color");
        if color_supported == Some(false) || !mode_ok {
            return false;
        }
    }

    let finishings = value_set(attrs, "finishings-supported");
    let finishing_ok = |wanted: bool, keyword: &str, value: &str| {
        !wanted
            || finishings.is_empty()
            || finishings.contains(keyword)
            || finishings.contains(value)
    };
    if !finishing_ok(constraints.staple, "staple", "4") {
        return false;
    }
    if !finishing_ok(constraints.punch, "punch", "5") {
        return false;
    }
    if !finishing_ok(constraints.fold, "fold", "10") {
        return false;
    }

    if let Some(orientation) = constraints.orientation {
        let orientations = value_set(attrs, "orientation-requested-supported");
        if !orientations.is_empty() && !orientations.contains(&orientation.to_string()) {
            return false;
        }
    }

    true
}

/// Forwarding format by fixed priority over what the printer supports.
fn pick_format(attrs: &PrinterAttributes) -> String {
    let supported = value_set(attrs, "document-format-supported");
    if supported.is_empty() {
        return "application/pdf".to_string();
    }
    FORMAT_PRIORITY
        .iter()
        .find(|f| supported.contains(**f))
        .map(|f| f.to_string())
        .unwrap_or_else(|| "application/pdf".to_string())
}

/// Resolution to request: draft takes the minimum supported, high the
/// maximum, anything else the printer default (600 dpi fallback).
fn pick_resolution(attrs: &PrinterAttributes, quality: Option<PrintQuality>) -> u32 {
    let supported = resolutions_supported(attrs);
    match quality {
        Some(PrintQuality::Draft) => supported
            .iter()
            .min()
            .copied()
            .unwrap_or_else(|| resolution_default(attrs)),
        Some(PrintQuality::High) => supported
            .iter()
            .max()
            .copied()
            .unwrap_or_else(|| resolution_default(attrs)),
        _ => resolution_default(attrs),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use druckwerk_core::{
        AddrFamily, CapabilityHints, DiscoveredPrinter, DiscoveryInstance, DiscoveryOrigin,
        EntryStatus, Transport,
    };
    use druckwerk_cups::MockScheduler;
    use druckwerk_registry::{AbsorbOutcome, Resolution};

    fn record(host: &str) -> DiscoveredPrinter {
        DiscoveredPrinter {
            instance: DiscoveryInstance {
                origin: DiscoveryOrigin::DnsSd,
                transport: Transport::Ipp,
                family: AddrFamily::V4,
                interface: "any".into(),
                service_name: format!("P @ {host}"),
                domain: "local".into(),
                host: host.into(),
                ip: None,
                port: 631,
                resource: "ipp/print".into(),
            },
            cups_queue: false,
            hints: CapabilityHints::default(),
            uuid: None,
            remote_queue: None,
        }
    }

    fn idle_attrs(formats: &str) -> PrinterAttributes {
        PrinterAttributes::from([
            ("printer-state".to_string(), "3".to_string()),
            ("printer-is-accepting-jobs".to_string(), "true".to_string()),
            ("document-format-supported".to_string(), formats.to_string()),
            (
                "printer-resolution-supported".to_string(),
                "300dpi, 600dpi, 1200dpi".to_string(),
            ),
            ("printer-resolution-default".to_string(), "600dpi".to_string()),
        ])
    }

    fn busy_attrs(jobs: u32) -> PrinterAttributes {
        PrinterAttributes::from([
            ("printer-state".to_string(), "4".to_string()),
            ("printer-is-accepting-jobs".to_string(), "true".to_string()),
            ("queued-job-count".to_string(), jobs.to_string()),
            (
                "document-format-supported".to_string(),
                "application/pdf".to_string(),
            ),
        ])
    }

    /// Cluster of `hosts` confirmed members sharing one queue name.
    fn cluster(
        registry: &Arc<RwLock<Registry>>,
        queue: &str,
        hosts: &[&str],
    ) -> Vec<EntryId> {
        let mut ids = Vec::new();
        let mut registry = registry.write();
        for host in hosts {
            let outcome = registry.absorb(
                record(host),
                Resolution {
                    queue_name: queue.into(),
                    manual_cluster: false,
                },
                true,
                false,
            );
            let id = match outcome {
                AbsorbOutcome::Created(id) => id,
                AbsorbOutcome::ClusterJoined { slave, .. } => slave,
                other => panic!("unexpected outcome {other:?}"),
            };
            ids.push(id);
        }
        for id in &ids {
            let entry = registry.get_mut(*id).unwrap();
            entry.status = EntryStatus::Confirmed;
            entry.cluster = true;
        }
        ids
    }

    fn setup(
        hosts: &[&str],
        policy: DispatchPolicy,
    ) -> (Dispatcher, Arc<RwLock<Registry>>, Arc<MockScheduler>, Vec<EntryId>) {
        let registry = Arc::new(RwLock::new(Registry::new()));
        let ids = cluster(&registry, "office", hosts);
        let mock = Arc::new(MockScheduler::new());
        mock.add_queue(druckwerk_cups::LocalQueue {
            name: "office".into(),
            device_uri: "implicitclass:office".into(),
            ..druckwerk_cups::LocalQueue::default()
        });
        let dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&mock) as Arc<dyn Scheduler>,
            policy,
        );
        (dispatcher, registry, mock, ids)
    }

    #[tokio::test]
    async fn idle_member_wins_over_busy() {
        let (dispatcher, registry, mock, ids) =
            setup(&["a.local", "b.local"], DispatchPolicy::QueueOnServers);
        mock.add_remote("ipp://a.local:631/ipp/print", idle_attrs("application/pdf"));
        mock.add_remote("ipp://b.local:631/ipp/print", busy_attrs(2));

        let decision = dispatcher.dispatch_job("office", 17).await.unwrap().unwrap();
        let Dispatch::Chosen { entry, uri, .. } = decision else {
            panic!("expected Chosen, got {decision:?}");
        };
        assert_eq!(entry, ids[0]);
        assert_eq!(uri, "ipp://a.local:631/ipp/print");

        // The dispatch option records job id, uri, format, and resolution.
        let queue = mock.queue_snapshot("office").unwrap();
        let dest = queue.options.get(DEST_OPTION).unwrap();
        assert!(dest.starts_with("17 ipp://a.local:631/ipp/print"));
        assert!(dest.contains("application/pdf"));
        assert!(dest.ends_with("600dpi"));

        // The cursor points at the chosen member.
        let registry = registry.read();
        let master = registry
            .by_queue_name("office")
            .into_iter()
            .find(|id| registry.get(*id).unwrap().is_master())
            .unwrap();
        assert_eq!(registry.get(master).unwrap().last_printer, 0);
    }

    #[tokio::test]
    async fn round_robin_is_fair_over_idle_members() {
        let hosts = ["a.local", "b.local", "c.local"];
        let (dispatcher, _registry, mock, ids) =
            setup(&hosts, DispatchPolicy::QueueOnServers);
        for host in hosts {
            mock.add_remote(
                &format!("ipp://{host}:631/ipp/print"),
                idle_attrs("application/pdf"),
            );
        }

        let mut counts = std::collections::HashMap::new();
        for job in 0..9 {
            let decision = dispatcher
                .dispatch_job("office", job)
                .await
                .unwrap()
                .unwrap();
            let Dispatch::Chosen { entry, .. } = decision else {
                panic!("expected Chosen");
            };
            *counts.entry(entry).or_insert(0u32) += 1;
        }
        for id in &ids {
            assert_eq!(counts.get(id), Some(&3), "member {id} not selected fairly");
        }
    }

    #[tokio::test]
    async fn queue_on_servers_falls_back_to_least_loaded() {
        let (dispatcher, _registry, mock, ids) =
            setup(&["a.local", "b.local"], DispatchPolicy::QueueOnServers);
        mock.add_remote("ipp://a.local:631/ipp/print", busy_attrs(5));
        mock.add_remote("ipp://b.local:631/ipp/print", busy_attrs(1));

        let decision = dispatcher.dispatch_job("office", 1).await.unwrap().unwrap();
        let Dispatch::Chosen { entry, .. } = decision else {
            panic!("expected Chosen, got {decision:?}");
        };
        assert_eq!(entry, ids[1]);
    }

    #[tokio::test]
    async fn queue_on_client_reports_busy() {
        let (dispatcher, registry, mock, _ids) =
            setup(&["a.local", "b.local"], DispatchPolicy::QueueOnClient);
        mock.add_remote("ipp://a.local:631/ipp/print", busy_attrs(1));
        mock.add_remote("ipp://b.local:631/ipp/print", busy_attrs(1));

        let before = {
            let registry = registry.read();
            let master = registry
                .by_queue_name("office")
                .into_iter()
                .find(|id| registry.get(*id).unwrap().is_master())
                .unwrap();
            registry.get(master).unwrap().last_printer
        };

        let decision = dispatcher.dispatch_job("office", 3).await.unwrap().unwrap();
        assert_eq!(decision, Dispatch::AllBusy);

        let queue = mock.queue_snapshot("office").unwrap();
        assert_eq!(
            queue.options.get(DEST_OPTION).map(String::as_str),
            Some("3 ALL_DESTS_BUSY")
        );

        // The cursor does not move when nothing was chosen.
        let registry = registry.read();
        let master = registry
            .by_queue_name("office")
            .into_iter()
            .find(|id| registry.get(*id).unwrap().is_master())
            .unwrap();
        assert_eq!(registry.get(master).unwrap().last_printer, before);
    }

    #[tokio::test]
    async fn constraints_filter_unsupporting_members() {
        let (dispatcher, registry, mock, ids) =
            setup(&["a.local", "b.local"], DispatchPolicy::QueueOnServers);
        // Member a only does PostScript; member b does urf.
        {
            let mut registry = registry.write();
            registry.get_mut(ids[0]).unwrap().attributes = Some(PrinterAttributes::from([(
                "document-format-supported".to_string(),
                "application/postscript".to_string(),
            )]));
            registry.get_mut(ids[1]).unwrap().attributes = Some(PrinterAttributes::from([(
                "document-format-supported".to_string(),
                "image/urf".to_string(),
            )]));
        }
        mock.add_remote("ipp://b.local:631/ipp/print", idle_attrs("image/urf"));
        mock.set_job_attributes(
            "office",
            5,
            PrinterAttributes::from([(
                "document-format".to_string(),
                "image/urf".to_string(),
            )]),
        );

        let decision = dispatcher.dispatch_job("office", 5).await.unwrap().unwrap();
        let Dispatch::Chosen { entry, format, .. } = decision else {
            panic!("expected Chosen, got {decision:?}");
        };
        assert_eq!(entry, ids[1]);
        assert_eq!(format, "image/urf");
    }

    #[tokio::test]
    async fn impossible_constraints_mark_no_destination() {
        let (dispatcher, registry, mock, ids) =
            setup(&["a.local"], DispatchPolicy::QueueOnServers);
        {
            let mut registry = registry.write();
            registry.get_mut(ids[0]).unwrap().attributes = Some(PrinterAttributes::from([(
                "sides-supported".to_string(),
                "one-sided".to_string(),
            )]));
        }
        mock.set_job_attributes(
            "office",
            9,
            PrinterAttributes::from([(
                "sides".to_string(),
                "two-sided-long-edge".to_string(),
            )]),
        );

        let decision = dispatcher.dispatch_job("office", 9).await.unwrap().unwrap();
        assert_eq!(decision, Dispatch::NoDestination);
        let queue = mock.queue_snapshot("office").unwrap();
        assert_eq!(
            queue.options.get(DEST_OPTION).map(String::as_str),
            Some("9 NO_DEST_FOUND")
        );
    }

    #[tokio::test]
    async fn quality_steers_resolution() {
        let (dispatcher, _registry, mock, _ids) =
            setup(&["a.local"], DispatchPolicy::QueueOnServers);
        mock.add_remote("ipp://a.local:631/ipp/print", idle_attrs("application/pdf"));
        mock.set_job_attributes(
            "office",
            2,
            PrinterAttributes::from([("print-quality".to_string(), "5".to_string())]),
        );

        let decision = dispatcher.dispatch_job("office", 2).await.unwrap().unwrap();
        let Dispatch::Chosen { resolution_dpi, .. } = decision else {
            panic!("expected Chosen");
        };
        assert_eq!(resolution_dpi, 1200);
    }

    #[tokio::test]
    async fn non_cluster_queue_is_ignored() {
        let registry = Arc::new(RwLock::new(Registry::new()));
        {
            let mut reg = registry.write();
            let AbsorbOutcome::Created(id) = reg.absorb(
                record("solo.local"),
                Resolution {
                    queue_name: "solo".into(),
                    manual_cluster: false,
                },
                true,
                false,
            ) else {
                panic!("expected Created");
            };
            reg.get_mut(id).unwrap().status = EntryStatus::Confirmed;
        }
        let mock = Arc::new(MockScheduler::new());
        let dispatcher = Dispatcher::new(
            registry,
            mock as Arc<dyn Scheduler>,
            DispatchPolicy::QueueOnServers,
        );
        assert!(dispatcher.dispatch_job("solo", 1).await.unwrap().is_none());
    }
}
