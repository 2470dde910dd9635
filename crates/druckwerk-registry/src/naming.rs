// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Local queue naming and cluster membership resolution.
//
// A discovered printer needs a legal local queue name.  The base name comes
// from the configured naming policy; clashes with foreign scheduler queues
// fall back to `name@host`.  User-defined clusters override the name when a
// member matcher fires.

use std::collections::HashSet;

use regex::RegexBuilder;
use tracing::{debug, warn};

use druckwerk_core::config::{ClusterDef, IppPrinterNaming, RemoteCupsNaming};
use druckwerk_core::error::{DruckwerkError, Result};
use druckwerk_core::DiscoveredPrinter;

/// Sanitize a DNS-SD-sourced name: keep `[A-Za-z0-9]`, collapse any other
/// character run to a single `_`, strip leading/trailing separators.
pub fn sanitize_dnssd(s: &str) -> String {
    sanitize(s, '_')
}

/// Sanitize a make/model-sourced name the same way, with `-` as separator.
pub fn sanitize_make_model(s: &str) -> String {
    sanitize(s, '-')
}

fn sanitize(s: &str, sep: char) -> String {
    let mut out = String::with_capacity(s.len());
    let mut pending_sep = false;
    for c in s.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push(sep);
            }
            pending_sep = false;
            out.push(c);
        } else {
            pending_sep = true;
        }
    }
    out
}

/// A user-defined cluster with compiled member matchers.
struct CompiledCluster {
    queue_name: String,
    /// `(raw, regex)` pairs; a failed compile leaves only the sanitized
    /// exact-match fallback.
    members: Vec<(String, Option<regex::Regex>)>,
}

/// Where a resolved record should live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub queue_name: String,
    /// True when the name came from a user-defined cluster definition.
    pub manual_cluster: bool,
}

/// Resolves discovered records to local queue names.
pub struct ClusterResolver {
    remote_cups_naming: RemoteCupsNaming,
    ipp_printer_naming: IppPrinterNaming,
    clusters: Vec<CompiledCluster>,
}

impl ClusterResolver {
    pub fn new(
        remote_cups_naming: RemoteCupsNaming,
        ipp_printer_naming: IppPrinterNaming,
        cluster_defs: &[ClusterDef],
    ) -> Self {
        let clusters = cluster_defs
            .iter()
            .map(|def| CompiledCluster {
                queue_name: sanitize_dnssd(&def.queue_name),
                members: def
                    .members
                    .iter()
                    .map(|m| {
                        let compiled = RegexBuilder::new(&format!("^{m}$"))
                            .case_insensitive(true)
                            .build();
                        match compiled {
                            Ok(re) => (m.clone(), Some(re)),
                            Err(e) => {
                                warn!(matcher = %m, error = %e, "cluster matcher is not a valid regex, using exact comparison");
                                (m.clone(), None)
                            }
                        }
                    })
                    .collect(),
            })
            .collect();
        Self {
            remote_cups_naming,
            ipp_printer_naming,
            clusters,
        }
    }

    /// Resolve the local queue name for a record.
    ///
    /// `foreign_queues` are scheduler queues not managed by us; a clash with
    /// one of them forces the `name@host` fallback.  `excluded` is a name the
    /// caller forbids (used while renaming an overwritten queue).
    pub fn resolve(
        &self,
        record: &DiscoveredPrinter,
        foreign_queues: &HashSet<String>,
        excluded: Option<&str>,
    ) -> Result<Resolution> {
        let base = self
            .base_name(record)
            .ok_or_else(|| DruckwerkError::NameExhausted(record.instance.uri()))?;

        // A manual cluster wins over everything else.
        if let Some(cluster_name) = self.manual_cluster_for(record, &base) {
            return Ok(Resolution {
                queue_name: cluster_name,
                manual_cluster: true,
            });
        }

        let name = if foreign_queues.contains(&base) || excluded == Some(base.as_str()) {
            let host = sanitize_dnssd(&record.instance.host);
            let fallback = format!("{base}@{host}");
            if foreign_queues.contains(&fallback) || excluded == Some(fallback.as_str()) {
                return Err(DruckwerkError::NameExhausted(fallback));
            }
            debug!(base, fallback, "queue name taken by a foreign queue");
            fallback
        } else {
            base
        };

        Ok(Resolution {
            queue_name: name,
            manual_cluster: false,
        })
    }

    /// Base name per the configured naming policy, with fallbacks when the
    /// preferred source is missing.
    fn base_name(&self, record: &DiscoveredPrinter) -> Option<String> {
        let service = || {
            let s = sanitize_dnssd(&record.instance.service_name);
            (!s.is_empty()).then_some(s)
        };
        let make_model = || {
            record
                .hints
                .make_model
                .as_deref()
                .map(sanitize_make_model)
                .filter(|s| !s.is_empty())
        };
        let remote_name = || {
            record
                .remote_queue
                .as_deref()
                .map(sanitize_dnssd)
                .filter(|s| !s.is_empty())
        };

        if record.cups_queue {
            match self.remote_cups_naming {
                RemoteCupsNaming::DnsSd => service().or_else(make_model).or_else(remote_name),
                RemoteCupsNaming::MakeModel => make_model().or_else(service).or_else(remote_name),
                RemoteCupsNaming::RemoteName => remote_name().or_else(service).or_else(make_model),
            }
        } else {
            match self.ipp_printer_naming {
                IppPrinterNaming::DnsSd => service().or_else(make_model),
                IppPrinterNaming::MakeModel => make_model().or_else(service),
            }
        }
    }

    /// First user-defined cluster with a matching member matcher.
    ///
    /// Matchers compare against the sanitized remote queue name, the
    /// sanitized make/model, and the sanitized service name.
    fn manual_cluster_for(&self, record: &DiscoveredPrinter, base: &str) -> Option<String> {
        let candidates = [
            Some(base.to_string()),
            record.hints.make_model.as_deref().map(sanitize_make_model),
            Some(sanitize_dnssd(&record.instance.service_name)),
            record.remote_queue.as_deref().map(sanitize_dnssd),
        ];

        for cluster in &self.clusters {
            for (raw, re) in &cluster.members {
                for candidate in candidates.iter().flatten() {
                    let hit = match re {
                        Some(re) => re.is_match(candidate),
                        None => {
                            sanitize_dnssd(raw).eq_ignore_ascii_case(candidate)
                                || sanitize_make_model(raw).eq_ignore_ascii_case(candidate)
                        }
                    };
                    if hit {
                        debug!(
                            cluster = %cluster.queue_name,
                            matcher = %raw,
                            matched = %candidate,
                            "record joins user-defined cluster"
                        );
                        return Some(cluster.queue_name.clone());
                    }
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use druckwerk_core::{
        AddrFamily, CapabilityHints, DiscoveryInstance, DiscoveryOrigin, Transport,
    };

    fn record(service: &str, make_model: Option<&str>, cups_queue: bool) -> DiscoveredPrinter {
        DiscoveredPrinter {
            instance: DiscoveryInstance {
                origin: DiscoveryOrigin::DnsSd,
                transport: Transport::Ipps,
                family: AddrFamily::V4,
                interface: "eth0".into(),
                service_name: service.into(),
                domain: "local".into(),
                host: "lab.local".into(),
                ip: None,
                port: 631,
                resource: "printers/lab".into(),
            },
            cups_queue,
            hints: CapabilityHints {
                make_model: make_model.map(String::from),
                ..CapabilityHints::default()
            },
            uuid: None,
            remote_queue: Some("lab".into()),
        }
    }

    fn resolver(naming: RemoteCupsNaming, clusters: &[ClusterDef]) -> ClusterResolver {
        ClusterResolver::new(naming, IppPrinterNaming::MakeModel, clusters)
    }

    #[test]
    fn sanitize_is_idempotent() {
        for input in [
            "Lab Printer @ lab",
            "  trailing--stuff!!",
            "___",
            "Example MFG 9000",
            "(parens) [and] {braces}",
        ] {
            let once = sanitize_dnssd(input);
            assert_eq!(sanitize_dnssd(&once), once);
            assert!(once.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
            let mm = sanitize_make_model(input);
            assert_eq!(sanitize_make_model(&mm), mm);
            assert!(mm.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'));
        }
    }

    #[test]
    fn sanitize_collapses_runs_and_trims() {
        assert_eq!(sanitize_dnssd("Lab Printer @ lab"), "Lab_Printer_lab");
        assert_eq!(sanitize_make_model("Example MFG 9000"), "Example-MFG-9000");
        assert_eq!(sanitize_dnssd("--x--"), "x");
        assert_eq!(sanitize_dnssd("!!!"), "");
    }

    #[test]
    fn dnssd_naming_uses_service_name() {
        let r = resolver(RemoteCupsNaming::DnsSd, &[]);
        let resolution = r
            .resolve(&record("Lab Printer @ lab", Some("Example MFG 9000"), true), &HashSet::new(), None)
            .unwrap();
        assert_eq!(resolution.queue_name, "Lab_Printer_lab");
    }

    #[test]
    fn make_model_naming() {
        let r = resolver(RemoteCupsNaming::MakeModel, &[]);
        let resolution = r
            .resolve(&record("Lab Printer @ lab", Some("Example MFG 9000"), true), &HashSet::new(), None)
            .unwrap();
        assert_eq!(resolution.queue_name, "Example-MFG-9000");
    }

    #[test]
    fn remote_name_policy_falls_back_without_remote_queue() {
        let r = resolver(RemoteCupsNaming::RemoteName, &[]);
        let mut rec = record("Lab Printer @ lab", None, true);
        rec.remote_queue = None;
        let resolution = r.resolve(&rec, &HashSet::new(), None).unwrap();
        assert_eq!(resolution.queue_name, "Lab_Printer_lab");
    }

    #[test]
    fn foreign_queue_forces_host_suffix() {
        let r = resolver(RemoteCupsNaming::DnsSd, &[]);
        let foreign: HashSet<String> = ["Lab_Printer_lab".to_string()].into();
        let resolution = r
            .resolve(&record("Lab Printer @ lab", None, true), &foreign, None)
            .unwrap();
        assert_eq!(resolution.queue_name, "Lab_Printer_lab@lab_local");
    }

    #[test]
    fn exhausted_names_fail() {
        let r = resolver(RemoteCupsNaming::DnsSd, &[]);
        let foreign: HashSet<String> = [
            "Lab_Printer_lab".to_string(),
            "Lab_Printer_lab@lab_local".to_string(),
        ]
        .into();
        assert!(matches!(
            r.resolve(&record("Lab Printer @ lab", None, true), &foreign, None),
            Err(DruckwerkError::NameExhausted(_))
        ));
    }

    #[test]
    fn excluded_name_forces_fallback() {
        let r = resolver(RemoteCupsNaming::DnsSd, &[]);
        let resolution = r
            .resolve(
                &record("Lab Printer @ lab", None, true),
                &HashSet::new(),
                Some("Lab_Printer_lab"),
            )
            .unwrap();
        assert_eq!(resolution.queue_name, "Lab_Printer_lab@lab_local");
    }

    #[test]
    fn manual_cluster_wins() {
        let clusters = [ClusterDef {
            queue_name: "office".into(),
            members: vec!["Example.MFG.*".into()],
        }];
        let r = resolver(RemoteCupsNaming::DnsSd, &clusters);
        let resolution = r
            .resolve(&record("Lab Printer @ lab", Some("Example MFG 9000"), true), &HashSet::new(), None)
            .unwrap();
        assert_eq!(resolution.queue_name, "office");
        assert!(resolution.manual_cluster);
    }

    #[test]
    fn broken_matcher_falls_back_to_exact() {
        let clusters = [ClusterDef {
            queue_name: "office".into(),
            members: vec!["Example(MFG".into()],
        }];
        let r = resolver(RemoteCupsNaming::DnsSd, &clusters);
        // "Example(MFG" sanitizes to "Example_MFG"; no candidate equals it.
        let resolution = r
            .resolve(&record("Lab Printer @ lab", Some("Example MFG 9000"), true), &HashSet::new(), None)
            .unwrap();
        assert!(!resolution.manual_cluster);
    }
}
