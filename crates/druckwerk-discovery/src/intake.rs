// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Discovery intake: normalizes DNS-SD events and poll results into
// discovered-printer records, filters out our own shared queues and anything
// the access policy or browse filters reject, then hands the record to the
// registry.

use std::collections::HashSet;

use parking_lot::RwLock;
use regex::RegexBuilder;
use tracing::{debug, info, warn};

use druckwerk_core::config::{Config, FilterField, FilterPattern, FilterRule};
use druckwerk_core::{
    AddrFamily, CapabilityHints, DiscoveredPrinter, DiscoveryInstance, DiscoveryOrigin, Transport,
};
use druckwerk_cups::RemoteQueueInfo;
use druckwerk_net::{AccessPolicy, NetifTracker};
use druckwerk_registry::{AbsorbOutcome, ClusterResolver, Registry};

use crate::dnssd::DnsSdService;

/// Queues and identifiers of the local scheduler, refreshed by the daemon.
#[derive(Debug, Default)]
struct LocalSnapshot {
    /// Scheduler queues not managed by us; name clashes fall back to `@host`.
    foreign_queues: HashSet<String>,
    /// UUIDs of locally shared queues; used by the local-origin filter.
    local_uuids: HashSet<uuid::Uuid>,
}

enum CompiledPattern {
    Regex(regex::Regex),
    Exact(String),
    Boolean,
}

struct CompiledFilter {
    affirmative: bool,
    field: FilterField,
    pattern: CompiledPattern,
}

/// Normalizes and dispatches discovery input.
pub struct Intake {
    netifs: std::sync::Arc<NetifTracker>,
    access: AccessPolicy,
    resolver: ClusterResolver,
    filters: Vec<CompiledFilter>,
    registry: std::sync::Arc<RwLock<Registry>>,
    local: RwLock<LocalSnapshot>,
    auto_clustering: bool,
    fresh_attrs: bool,
}

impl Intake {
    pub fn new(
        config: &Config,
        netifs: std::sync::Arc<NetifTracker>,
        registry: std::sync::Arc<RwLock<Registry>>,
    ) -> Self {
        Self {
            netifs,
            access: AccessPolicy::new(config.access.clone()),
            resolver: ClusterResolver::new(
                config.remote_cups_naming,
                config.ipp_printer_naming,
                &config.clusters,
            ),
            filters: compile_filters(&config.filters),
            registry,
            local: RwLock::new(LocalSnapshot::default()),
            auto_clustering: config.auto_clustering,
            fresh_attrs: config.fresh_attrs_on_discovery,
        }
    }

    /// Refresh the local scheduler snapshot used by name resolution and the
    /// local-origin filter.
    pub fn set_local_queues(
        &self,
        foreign_queues: HashSet<String>,
        local_uuids: HashSet<uuid::Uuid>,
    ) {
        let mut local = self.local.write();
        local.foreign_queues = foreign_queues;
        local.local_uuids = local_uuids;
    }

    /// Handle one resolved DNS-SD service.
    pub fn handle_resolved(&self, service: DnsSdService) -> Option<AbsorbOutcome> {
        let record = normalize_dnssd(&service);
        self.dispatch(record, &service)
    }

    /// Handle a DNS-SD removal.
    pub fn handle_removed(&self, service_name: &str, transport: Transport) {
        if let Some(id) = self
            .registry
            .write()
            .retire_service(service_name, transport)
        {
            debug!(entry = %id, service = service_name, "discovery removal applied");
        }
    }

    /// Handle the result of polling one remote scheduler.
    pub fn handle_poll(&self, server: &str, queues: Vec<RemoteQueueInfo>) {
        for queue in queues {
            let Some(record) = normalize_polled(&queue) else {
                warn!(server, uri = %queue.uri, "polled queue has an unusable URI");
                continue;
            };
            let pseudo = DnsSdService {
                service_name: String::new(),
                transport: record.instance.transport,
                domain: String::new(),
                interface: record.instance.interface.clone(),
                family: record.instance.family,
                host: record.instance.host.clone(),
                ip: record.instance.ip,
                port: record.instance.port,
                txt: Default::default(),
            };
            self.dispatch(record, &pseudo);
        }
    }

    /// The shared tail of every intake path: local-origin filter, access
    /// policy, name resolution, browse filters, registry absorption.
    fn dispatch(
        &self,
        record: DiscoveredPrinter,
        service: &DnsSdService,
    ) -> Option<AbsorbOutcome> {
        if self.is_local_origin(&record) {
            debug!(host = %record.instance.host, "dropping announcement of our own queue");
            return None;
        }

        if let Some(ip) = record.instance.ip {
            if !self.access.allows(&ip) {
                info!(peer = %ip, "access policy rejected announcement");
                return None;
            }
        }

        let resolution = {
            let local = self.local.read();
            match self.resolver.resolve(&record, &local.foreign_queues, None) {
                Ok(resolution) => resolution,
                Err(e) => {
                    info!(uri = %record.instance.uri(), error = %e, "no local queue name, dropping");
                    return None;
                }
            }
        };

        if !self.passes_filters(&record, &resolution.queue_name, service) {
            debug!(queue = %resolution.queue_name, "browse filter rejected record");
            return None;
        }

        let outcome = self.registry.write().absorb(
            record,
            resolution,
            self.auto_clustering,
            self.fresh_attrs,
        );
        Some(outcome)
    }

    /// Whether the announcement describes a queue shared by this host.
    ///
    /// Matches on the TXT `UUID` against locally shared queues, on the peer
    /// host being one of our hostnames, and on loopback announcements from a
    /// co-resident scheduler (secure or not).
    fn is_local_origin(&self, record: &DiscoveredPrinter) -> bool {
        if let Some(uuid) = record.uuid {
            if self.local.read().local_uuids.contains(&uuid) {
                return true;
            }
        }
        if self.netifs.is_local_hostname(&record.instance.host) {
            return true;
        }
        record
            .instance
            .ip
            .map(|ip| ip.is_loopback() && record.cups_queue)
            .unwrap_or(false)
    }

    fn passes_filters(
        &self,
        record: &DiscoveredPrinter,
        queue_name: &str,
        service: &DnsSdService,
    ) -> bool {
        self.filters.iter().all(|filter| {
            let value = match &filter.field {
                FilterField::QueueName => Some(queue_name.to_string()),
                FilterField::Host => Some(record.instance.host.clone()),
                FilterField::Port => Some(record.instance.port.to_string()),
                FilterField::ServiceName => Some(record.instance.service_name.clone()),
                FilterField::Domain => Some(record.instance.domain.clone()),
                FilterField::TxtKey(key) => service
                    .txt
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(key))
                    .map(|(_, v)| v.clone()),
            };
            let matched = match (&filter.pattern, value) {
                (CompiledPattern::Boolean, Some(v)) => txt_truthy(&v),
                (CompiledPattern::Boolean, None) => false,
                (CompiledPattern::Exact(expected), Some(v)) => v.eq_ignore_ascii_case(expected),
                (CompiledPattern::Regex(re), Some(v)) => re.is_match(&v),
                (_, None) => false,
            };
            matched == filter.affirmative
        })
    }
}

fn compile_filters(rules: &[FilterRule]) -> Vec<CompiledFilter> {
    rules
        .iter()
        .filter_map(|rule| {
            let pattern = match &rule.pattern {
                FilterPattern::Boolean => CompiledPattern::Boolean,
                FilterPattern::Exact(s) => CompiledPattern::Exact(s.clone()),
                FilterPattern::Regex(s) => {
                    match RegexBuilder::new(s).case_insensitive(true).build() {
                        Ok(re) => CompiledPattern::Regex(re),
                        Err(e) => {
                            warn!(pattern = %s, error = %e, "skipping unparsable browse filter");
                            return None;
                        }
                    }
                }
            };
            Some(CompiledFilter {
                affirmative: rule.affirmative,
                field: rule.field.clone(),
                pattern,
            })
        })
        .collect()
}

/// Build a discovered-printer record from a resolved DNS-SD service.
pub fn normalize_dnssd(service: &DnsSdService) -> DiscoveredPrinter {
    let txt = |key: &str| {
        service
            .txt
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    };

    // Make/model preference: ty, then product without its wrapping
    // parentheses, then the USB manufacturer/model pair.
    let make_model = txt("ty")
        .map(str::to_string)
        .or_else(|| {
            txt("product").map(|p| {
                p.trim()
                    .trim_start_matches('(')
                    .trim_end_matches(')')
                    .to_string()
            })
        })
        .or_else(|| match (txt("usb_MFG"), txt("usb_MDL")) {
            (Some(mfg), Some(mdl)) => Some(format!("{mfg} {mdl}")),
            _ => None,
        })
        .filter(|s| !s.is_empty());

    let resource = txt("rp").unwrap_or("ipp/print").trim_start_matches('/').to_string();

    // A printer-type TXT key means the announcement comes from a print
    // scheduler; otherwise the resource path prefix decides.
    let cups_queue = txt("printer-type").is_some()
        || resource.starts_with("printers/")
        || resource.starts_with("classes/");

    let formats = txt("pdl")
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let remote_queue = cups_queue
        .then(|| resource.rsplit('/').next().map(str::to_string))
        .flatten();

    DiscoveredPrinter {
        instance: DiscoveryInstance {
            origin: DiscoveryOrigin::DnsSd,
            transport: service.transport,
            family: service.family,
            interface: service.interface.clone(),
            service_name: service.service_name.clone(),
            domain: service.domain.clone(),
            host: service.host.clone(),
            ip: service.ip,
            port: service.port,
            resource,
        },
        cups_queue,
        hints: CapabilityHints {
            make_model,
            formats,
            color: txt("Color").map(txt_truthy).unwrap_or(false),
            duplex: txt("Duplex").map(txt_truthy).unwrap_or(false),
            location: txt("note").map(str::to_string),
            info: None,
        },
        uuid: txt("UUID").and_then(|v| v.parse().ok()),
        remote_queue,
    }
}

/// Build a record from one polled remote scheduler queue.
///
/// No TXT table exists here; make/model and capabilities are fetched later
/// with a get-printer-attributes query when the reconciler needs them.
pub fn normalize_polled(queue: &RemoteQueueInfo) -> Option<DiscoveredPrinter> {
    let (transport, rest) = if let Some(rest) = queue.uri.strip_prefix("ipps://") {
        (Transport::Ipps, rest)
    } else if let Some(rest) = queue.uri.strip_prefix("https://") {
        (Transport::Ipps, rest)
    } else if let Some(rest) = queue.uri.strip_prefix("ipp://") {
        (Transport::Ipp, rest)
    } else if let Some(rest) = queue.uri.strip_prefix("http://") {
        (Transport::Ipp, rest)
    } else {
        return None;
    };

    let (authority, resource) = rest.split_once('/').unwrap_or((rest, ""));
    let (host, port) = match authority.rsplit_once(':') {
        Some((h, p)) => (h, p.parse().unwrap_or(631)),
        None => (authority, 631),
    };
    if host.is_empty() {
        return None;
    }

    let resource = resource.to_string();
    let remote_queue = resource.rsplit('/').next().map(str::to_string);

    Some(DiscoveredPrinter {
        instance: DiscoveryInstance {
            origin: DiscoveryOrigin::Poll,
            transport,
            family: AddrFamily::V4,
            interface: "any".into(),
            service_name: String::new(),
            domain: String::new(),
            host: host.to_string(),
            ip: None,
            port,
            resource,
        },
        cups_queue: true,
        hints: CapabilityHints {
            location: (!queue.location.is_empty()).then(|| queue.location.clone()),
            info: (!queue.info.is_empty()).then(|| queue.info.clone()),
            ..CapabilityHints::default()
        },
        uuid: None,
        remote_queue,
    })
}

/// IPP Everywhere boolean TXT values are "T"/"F".
fn txt_truthy(value: &str) -> bool {
    value.eq_ignore_ascii_case("t")
        || value.eq_ignore_ascii_case("true")
        || value == "1"
        || value.eq_ignore_ascii_case("yes")
}
