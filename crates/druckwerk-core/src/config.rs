// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Daemon configuration.
//
// The configuration is a flat list of `Directive value` lines (read from a
// file or injected ad hoc on the command line).  Unparsable directives are
// logged and skipped; they never abort startup.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{DruckwerkError, Result};

/// Naming policy for queues exported by a remote print scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteCupsNaming {
    DnsSd,
    MakeModel,
    RemoteName,
}

/// Naming policy for plain IPP network printers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IppPrinterNaming {
    DnsSd,
    MakeModel,
}

/// Load-balancing policy for cluster queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DispatchPolicy {
    /// Prefer idle printers but queue on a busy server when none is idle.
    QueueOnServers,
    /// Only ever dispatch to an idle printer; otherwise let the backend retry.
    QueueOnClient,
}

/// What counts as "inactive" for auto-shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AutoShutdownOn {
    NoQueues,
    NoJobs,
}

/// Auto-shutdown behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoShutdownConfig {
    pub enabled: bool,
    pub on: AutoShutdownOn,
    pub timeout_secs: u64,
    /// Also shut down while the DNS-SD daemon is unreachable.
    pub avahi_bound: bool,
}

impl Default for AutoShutdownConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            on: AutoShutdownOn::NoQueues,
            timeout_secs: 30,
            avahi_bound: false,
        }
    }
}

/// Whether allow rules or deny rules are applied first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleOrder {
    AllowDeny,
    DenyAllow,
}

/// Sense of an access rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleSense {
    Allow,
    Deny,
}

/// One allow/deny rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleKind {
    /// Literal address; family-sensitive equality.
    Ip(IpAddr),
    /// Network with prefix length; peer AND mask must equal the base.
    Network { addr: IpAddr, prefix: u8 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRule {
    pub sense: RuleSense,
    pub kind: RuleKind,
}

/// Full access-control configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessConfig {
    pub order: RuleOrder,
    pub allow_all: bool,
    pub deny_all: bool,
    pub rules: Vec<AccessRule>,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            order: RuleOrder::AllowDeny,
            allow_all: true,
            deny_all: false,
            rules: Vec::new(),
        }
    }
}

/// Field a browse filter rule matches against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterField {
    QueueName,
    Host,
    Port,
    ServiceName,
    Domain,
    /// Any DNS-SD TXT key by name.
    TxtKey(String),
}

/// How a filter rule matches its field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterPattern {
    /// Regular expression over the field value.
    Regex(String),
    /// Case-insensitive exact comparison.
    Exact(String),
    /// Field must be present and truthy (TXT keys only).
    Boolean,
}

/// One browse filter rule; a record must pass every rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterRule {
    /// False inverts the match.
    pub affirmative: bool,
    pub field: FilterField,
    pub pattern: FilterPattern,
}

/// A user-defined cluster: local queue name plus member matchers.
///
/// Matchers compare against the sanitized remote queue name, the make/model
/// string, and the DNS-SD service name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterDef {
    pub queue_name: String,
    pub members: Vec<String>,
}

/// Complete daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Browse DNS-SD announcements.
    pub browse_dnssd: bool,
    /// Poll the servers in `poll_servers`.
    pub browse_poll: bool,
    /// Remote scheduler URIs polled every `browse_interval_secs`.
    pub poll_servers: Vec<String>,

    pub remote_cups_naming: RemoteCupsNaming,
    pub ipp_printer_naming: IppPrinterNaming,
    pub auto_clustering: bool,
    pub clusters: Vec<ClusterDef>,

    pub access: AccessConfig,
    pub filters: Vec<FilterRule>,

    pub dispatch: DispatchPolicy,
    pub autoshutdown: AutoShutdownConfig,

    pub browse_interval_secs: u64,
    pub browse_timeout_secs: u64,
    pub http_local_timeout_secs: u64,
    pub http_remote_timeout_secs: u64,
    pub http_max_retries: u32,
    pub notify_lease_secs: u64,
    pub max_updates_per_call: usize,
    pub pause_between_updates_secs: u64,

    /// Option defaults merged into every created queue.
    pub default_options: HashMap<String, String>,
    pub cache_dir: PathBuf,
    pub keep_generated_queues_on_shutdown: bool,
    pub allow_resharing_remote_cups_printers: bool,
    /// Invalidate the capability cache on every discovery event.
    pub fresh_attrs_on_discovery: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            browse_dnssd: true,
            browse_poll: false,
            poll_servers: Vec::new(),
            remote_cups_naming: RemoteCupsNaming::DnsSd,
            ipp_printer_naming: IppPrinterNaming::MakeModel,
            auto_clustering: true,
            clusters: Vec::new(),
            access: AccessConfig::default(),
            filters: Vec::new(),
            dispatch: DispatchPolicy::QueueOnServers,
            autoshutdown: AutoShutdownConfig::default(),
            browse_interval_secs: 60,
            browse_timeout_secs: 300,
            http_local_timeout_secs: 5,
            http_remote_timeout_secs: 10,
            http_max_retries: 5,
            notify_lease_secs: 86400,
            max_updates_per_call: 10,
            pause_between_updates_secs: 2,
            default_options: HashMap::new(),
            cache_dir: PathBuf::from("/var/cache/druckwerk"),
            keep_generated_queues_on_shutdown: false,
            allow_resharing_remote_cups_printers: false,
            fresh_attrs_on_discovery: false,
        }
    }
}

impl Config {
    pub fn browse_interval(&self) -> Duration {
        Duration::from_secs(self.browse_interval_secs)
    }

    pub fn browse_timeout(&self) -> Duration {
        Duration::from_secs(self.browse_timeout_secs)
    }

    pub fn http_local_timeout(&self) -> Duration {
        Duration::from_secs(self.http_local_timeout_secs)
    }

    pub fn http_remote_timeout(&self) -> Duration {
        Duration::from_secs(self.http_remote_timeout_secs)
    }

    pub fn notify_lease(&self) -> Duration {
        Duration::from_secs(self.notify_lease_secs)
    }

    pub fn pause_between_updates(&self) -> Duration {
        Duration::from_secs(self.pause_between_updates_secs)
    }

    /// Load a configuration file, applying one directive per line.
    ///
    /// Unparsable lines are logged and skipped so that a single typo does not
    /// take the daemon down.
    pub fn load_file(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut config = Self::default();
        config.apply_lines(&text);
        Ok(config)
    }

    /// Apply several directive lines, skipping comments and blank lines.
    pub fn apply_lines(&mut self, text: &str) {
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Err(e) = self.apply_directive(line) {
                warn!(line, error = %e, "skipping configuration directive");
            }
        }
    }

    /// Apply a single `Directive value` line.
    pub fn apply_directive(&mut self, line: &str) -> Result<()> {
        let mut parts = line.splitn(2, char::is_whitespace);
        let directive = parts
            .next()
            .ok_or_else(|| DruckwerkError::Config("empty directive".into()))?;
        let value = parts.next().unwrap_or("").trim();

        match directive.to_ascii_lowercase().as_str() {
            "browseremoteprotocols" => {
                self.browse_dnssd = false;
                self.browse_poll = false;
                for token in value.split_whitespace() {
                    match token.to_ascii_lowercase().as_str() {
                        "dnssd" => self.browse_dnssd = true,
                        "cups" => self.browse_poll = true,
                        "none" => {}
                        other => {
                            return Err(DruckwerkError::Config(format!(
                                "unknown browse protocol {other}"
                            )))
                        }
                    }
                }
                Ok(())
            }
            "browsepoll" => {
                if value.is_empty() {
                    return Err(DruckwerkError::Config("BrowsePoll needs a server".into()));
                }
                self.browse_poll = true;
                self.poll_servers.push(value.to_string());
                Ok(())
            }
            "browseorder" => {
                self.access.order = match value.to_ascii_lowercase().as_str() {
                    "allow,deny" => RuleOrder::AllowDeny,
                    "deny,allow" => RuleOrder::DenyAllow,
                    other => {
                        return Err(DruckwerkError::Config(format!("unknown order {other}")))
                    }
                };
                Ok(())
            }
            "browseallow" => {
                self.push_access_rule(RuleSense::Allow, value)
            }
            "browsedeny" => {
                self.push_access_rule(RuleSense::Deny, value)
            }
            "browsefilter" => {
                self.filters.push(parse_filter(value)?);
                Ok(())
            }
            "cluster" => {
                self.clusters.push(parse_cluster(value)?);
                Ok(())
            }
            "localqueuenamingremotecups" => {
                self.remote_cups_naming = match value.to_ascii_lowercase().as_str() {
                    "dnssd" | "dns-sd" => RemoteCupsNaming::DnsSd,
                    "makemodel" | "make-and-model" => RemoteCupsNaming::MakeModel,
                    "remotename" => RemoteCupsNaming::RemoteName,
                    other => {
                        return Err(DruckwerkError::Config(format!("unknown naming {other}")))
                    }
                };
                Ok(())
            }
            "localqueuenamingippprinter" => {
                self.ipp_printer_naming = match value.to_ascii_lowercase().as_str() {
                    "dnssd" | "dns-sd" => IppPrinterNaming::DnsSd,
                    "makemodel" | "make-and-model" => IppPrinterNaming::MakeModel,
                    other => {
                        return Err(DruckwerkError::Config(format!("unknown naming {other}")))
                    }
                };
                Ok(())
            }
            "autoclustering" => {
                self.auto_clustering = parse_bool(value)?;
                Ok(())
            }
            "loadbalancing" => {
                self.dispatch = match value.to_ascii_lowercase().as_str() {
                    "queueonservers" => DispatchPolicy::QueueOnServers,
                    "queueonclient" => DispatchPolicy::QueueOnClient,
                    other => {
                        return Err(DruckwerkError::Config(format!("unknown policy {other}")))
                    }
                };
                Ok(())
            }
            "autoshutdown" => {
                match value.to_ascii_lowercase().as_str() {
                    "on" | "yes" => self.autoshutdown.enabled = true,
                    "off" | "no" => self.autoshutdown.enabled = false,
                    "avahi" => {
                        self.autoshutdown.enabled = true;
                        self.autoshutdown.avahi_bound = true;
                    }
                    other => {
                        return Err(DruckwerkError::Config(format!("unknown mode {other}")))
                    }
                }
                Ok(())
            }
            "autoshutdowntimeout" => {
                self.autoshutdown.timeout_secs = parse_secs(value)?;
                Ok(())
            }
            "autoshutdownon" => {
                self.autoshutdown.on = match value.to_ascii_lowercase().as_str() {
                    "no-queues" | "queues" => AutoShutdownOn::NoQueues,
                    "no-jobs" | "jobs" => AutoShutdownOn::NoJobs,
                    other => {
                        return Err(DruckwerkError::Config(format!("unknown trigger {other}")))
                    }
                };
                Ok(())
            }
            "browseinterval" => {
                self.browse_interval_secs = parse_secs(value)?;
                Ok(())
            }
            "browsetimeout" => {
                self.browse_timeout_secs = parse_secs(value)?;
                Ok(())
            }
            "httplocaltimeout" => {
                self.http_local_timeout_secs = parse_secs(value)?;
                Ok(())
            }
            "httpremotetimeout" => {
                self.http_remote_timeout_secs = parse_secs(value)?;
                Ok(())
            }
            "httpmaxretries" => {
                self.http_max_retries = value
                    .parse()
                    .map_err(|_| DruckwerkError::Config(format!("bad retry count {value}")))?;
                Ok(())
            }
            "notifyleaseduration" => {
                self.notify_lease_secs = parse_secs(value)?;
                Ok(())
            }
            "updatecupsqueuesmaxpercall" => {
                self.max_updates_per_call = value
                    .parse()
                    .map_err(|_| DruckwerkError::Config(format!("bad budget {value}")))?;
                Ok(())
            }
            "pausebetweencupsqueueupdates" => {
                self.pause_between_updates_secs = parse_secs(value)?;
                Ok(())
            }
            "defaultoptions" => {
                for pair in value.split_whitespace() {
                    if let Some((k, v)) = pair.split_once('=') {
                        self.default_options.insert(k.to_string(), v.to_string());
                    } else {
                        return Err(DruckwerkError::Config(format!(
                            "DefaultOptions entry {pair} is not key=value"
                        )));
                    }
                }
                Ok(())
            }
            "cachedir" => {
                if value.is_empty() {
                    return Err(DruckwerkError::Config("CacheDir needs a path".into()));
                }
                self.cache_dir = PathBuf::from(value);
                Ok(())
            }
            "keepgeneratedqueuesonshutdown" => {
                self.keep_generated_queues_on_shutdown = parse_bool(value)?;
                Ok(())
            }
            "allowresharingremotecupsprinters" => {
                self.allow_resharing_remote_cups_printers = parse_bool(value)?;
                Ok(())
            }
            "freshattrsondiscovery" => {
                self.fresh_attrs_on_discovery = parse_bool(value)?;
                Ok(())
            }
            other => Err(DruckwerkError::Config(format!("unknown directive {other}"))),
        }
    }

    fn push_access_rule(&mut self, sense: RuleSense, value: &str) -> Result<()> {
        match value.to_ascii_lowercase().as_str() {
            "all" => {
                match sense {
                    RuleSense::Allow => self.access.allow_all = true,
                    RuleSense::Deny => self.access.deny_all = true,
                }
                Ok(())
            }
            _ => {
                let kind = parse_rule_kind(value)?;
                self.access.rules.push(AccessRule { sense, kind });
                Ok(())
            }
        }
    }
}

/// Parse `addr` or `addr/prefix` into a rule kind.
fn parse_rule_kind(value: &str) -> Result<RuleKind> {
    if let Some((addr, prefix)) = value.split_once('/') {
        let addr: IpAddr = addr
            .parse()
            .map_err(|_| DruckwerkError::Config(format!("bad network address {addr}")))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| DruckwerkError::Config(format!("bad prefix {prefix}")))?;
        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix > max {
            return Err(DruckwerkError::Config(format!(
                "prefix {prefix} too long for {addr}"
            )));
        }
        Ok(RuleKind::Network { addr, prefix })
    } else {
        let addr: IpAddr = value
            .parse()
            .map_err(|_| DruckwerkError::Config(format!("bad address {value}")))?;
        Ok(RuleKind::Ip(addr))
    }
}

/// Parse a `BrowseFilter [NOT] [EXACT] field [value]` body.
fn parse_filter(value: &str) -> Result<FilterRule> {
    let mut tokens = value.split_whitespace().peekable();

    let mut affirmative = true;
    if tokens.peek().map(|t| t.eq_ignore_ascii_case("not")) == Some(true) {
        affirmative = false;
        tokens.next();
    }

    let mut exact = false;
    if tokens.peek().map(|t| t.eq_ignore_ascii_case("exact")) == Some(true) {
        exact = true;
        tokens.next();
    }

    let field_name = tokens
        .next()
        .ok_or_else(|| DruckwerkError::Config("BrowseFilter needs a field".into()))?;
    let field = match field_name.to_ascii_lowercase().as_str() {
        "name" | "queuename" => FilterField::QueueName,
        "host" | "hostname" => FilterField::Host,
        "port" => FilterField::Port,
        "service" | "servicename" => FilterField::ServiceName,
        "domain" => FilterField::Domain,
        _ => FilterField::TxtKey(field_name.to_string()),
    };

    let rest: Vec<&str> = tokens.collect();
    let pattern = if rest.is_empty() {
        FilterPattern::Boolean
    } else if exact {
        FilterPattern::Exact(rest.join(" "))
    } else {
        let joined = rest.join(" ");
        // Validate eagerly so a broken regex is skipped at load time.
        regex_syntax_check(&joined)?;
        FilterPattern::Regex(joined)
    };

    Ok(FilterRule {
        affirmative,
        field,
        pattern,
    })
}

/// Cheap validity probe for a filter regex.
///
/// The actual compilation happens in the intake; this only rejects patterns
/// that can never compile so the config loader can report them.
fn regex_syntax_check(pattern: &str) -> Result<()> {
    let mut depth = 0i32;
    for c in pattern.chars() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            _ => {}
        }
        if depth < 0 {
            return Err(DruckwerkError::Config(format!("unbalanced regex {pattern}")));
        }
    }
    if depth != 0 {
        return Err(DruckwerkError::Config(format!("unbalanced regex {pattern}")));
    }
    Ok(())
}

/// Parse `Cluster name: member1, member2` (members optional).
fn parse_cluster(value: &str) -> Result<ClusterDef> {
    let (name, members) = match value.split_once(':') {
        Some((n, m)) => (n.trim(), m),
        None => (value.trim(), ""),
    };
    if name.is_empty() {
        return Err(DruckwerkError::Config("Cluster needs a queue name".into()));
    }
    let members = members
        .split(',')
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(String::from)
        .collect();
    Ok(ClusterDef {
        queue_name: name.to_string(),
        members,
    })
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "yes" | "true" | "on" | "1" => Ok(true),
        "no" | "false" | "off" | "0" => Ok(false),
        other => Err(DruckwerkError::Config(format!("expected boolean, got {other}"))),
    }
}

fn parse_secs(value: &str) -> Result<u64> {
    value
        .parse()
        .map_err(|_| DruckwerkError::Config(format!("bad duration {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert!(config.browse_dnssd);
        assert!(!config.browse_poll);
        assert_eq!(config.max_updates_per_call, 10);
        assert_eq!(config.dispatch, DispatchPolicy::QueueOnServers);
    }

    #[test]
    fn browse_poll_directive() {
        let mut config = Config::default();
        config
            .apply_directive("BrowsePoll printserver.example.com:631")
            .unwrap();
        assert!(config.browse_poll);
        assert_eq!(config.poll_servers, vec!["printserver.example.com:631"]);
    }

    #[test]
    fn access_rules_parse() {
        let mut config = Config::default();
        config.apply_directive("BrowseOrder deny,allow").unwrap();
        config.apply_directive("BrowseDeny all").unwrap();
        config.apply_directive("BrowseAllow 192.168.1.0/24").unwrap();
        config.apply_directive("BrowseAllow 10.0.0.7").unwrap();

        assert_eq!(config.access.order, RuleOrder::DenyAllow);
        assert!(config.access.deny_all);
        assert_eq!(config.access.rules.len(), 2);
        assert!(matches!(
            config.access.rules[0].kind,
            RuleKind::Network { prefix: 24, .. }
        ));
    }

    #[test]
    fn bad_prefix_rejected() {
        let mut config = Config::default();
        assert!(config.apply_directive("BrowseAllow 10.0.0.0/40").is_err());
    }

    #[test]
    fn filter_variants_parse() {
        let mut config = Config::default();
        config.apply_directive("BrowseFilter name ^Lab.*").unwrap();
        config.apply_directive("BrowseFilter NOT host legacy\\.local").unwrap();
        config.apply_directive("BrowseFilter EXACT domain local").unwrap();
        config.apply_directive("BrowseFilter Duplex").unwrap();

        assert_eq!(config.filters.len(), 4);
        assert!(!config.filters[1].affirmative);
        assert_eq!(
            config.filters[2].pattern,
            FilterPattern::Exact("local".into())
        );
        assert_eq!(config.filters[3].pattern, FilterPattern::Boolean);
        assert_eq!(config.filters[3].field, FilterField::TxtKey("Duplex".into()));
    }

    #[test]
    fn cluster_parses_members() {
        let mut config = Config::default();
        config
            .apply_directive("Cluster lab: Example_MFG_9000, Other_Printer")
            .unwrap();
        assert_eq!(config.clusters[0].queue_name, "lab");
        assert_eq!(
            config.clusters[0].members,
            vec!["Example_MFG_9000", "Other_Printer"]
        );
    }

    #[test]
    fn unknown_directive_is_error() {
        let mut config = Config::default();
        assert!(config.apply_directive("NoSuchDirective 1").is_err());
    }

    #[test]
    fn apply_lines_skips_comments_and_bad_lines() {
        let mut config = Config::default();
        config.apply_lines(
            "# a comment\n\nBrowseInterval 120\nBogusDirective x\nAutoClustering No\n",
        );
        assert_eq!(config.browse_interval_secs, 120);
        assert!(!config.auto_clustering);
    }

    #[test]
    fn autoshutdown_directives() {
        let mut config = Config::default();
        config.apply_directive("AutoShutdown avahi").unwrap();
        config.apply_directive("AutoShutdownTimeout 45").unwrap();
        config.apply_directive("AutoShutdownOn no-jobs").unwrap();
        assert!(config.autoshutdown.enabled);
        assert!(config.autoshutdown.avahi_bound);
        assert_eq!(config.autoshutdown.timeout_secs, 45);
        assert_eq!(config.autoshutdown.on, AutoShutdownOn::NoJobs);
    }

    #[test]
    fn default_options_parse() {
        let mut config = Config::default();
        config
            .apply_directive("DefaultOptions media=iso_a4_210x297mm sides=two-sided-long-edge")
            .unwrap();
        assert_eq!(
            config.default_options.get("media").map(String::as_str),
            Some("iso_a4_210x297mm")
        );
    }
}
