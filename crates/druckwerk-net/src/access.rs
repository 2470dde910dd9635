// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Peer access policy.
//
// Evaluates the configured allow/deny rules against a peer address.  Rule
// application order depends on `BrowseOrder`; the last matching rule wins.

use std::net::IpAddr;

use tracing::debug;

use druckwerk_core::config::{AccessConfig, AccessRule, RuleKind, RuleOrder, RuleSense};

/// Evaluates allow/deny rules against peer addresses.
pub struct AccessPolicy {
    config: AccessConfig,
}

impl AccessPolicy {
    pub fn new(config: AccessConfig) -> Self {
        Self { config }
    }

    /// Whether announcements from `peer` are accepted.
    pub fn allows(&self, peer: &IpAddr) -> bool {
        let mut decision = match self.config.order {
            RuleOrder::AllowDeny => false,
            RuleOrder::DenyAllow => true,
        };

        // The all-flags act as the first rules of their sense.
        match self.config.order {
            RuleOrder::AllowDeny => {
                if self.config.allow_all {
                    decision = true;
                }
                decision = self.apply_sense(peer, RuleSense::Allow, decision, true);
                if self.config.deny_all {
                    decision = false;
                }
                decision = self.apply_sense(peer, RuleSense::Deny, decision, false);
            }
            RuleOrder::DenyAllow => {
                if self.config.deny_all {
                    decision = false;
                }
                decision = self.apply_sense(peer, RuleSense::Deny, decision, false);
                if self.config.allow_all {
                    decision = true;
                }
                decision = self.apply_sense(peer, RuleSense::Allow, decision, true);
            }
        }

        debug!(peer = %peer, decision, "access policy evaluated");
        decision
    }

    fn apply_sense(
        &self,
        peer: &IpAddr,
        sense: RuleSense,
        current: bool,
        on_match: bool,
    ) -> bool {
        let mut decision = current;
        for rule in self.config.rules.iter().filter(|r| r.sense == sense) {
            if rule_matches(rule, peer) {
                decision = on_match;
            }
        }
        decision
    }
}

/// Whether a single rule matches the peer address.
///
/// Family-sensitive: a v4 rule never matches a v6 peer and vice versa.
fn rule_matches(rule: &AccessRule, peer: &IpAddr) -> bool {
    match &rule.kind {
        RuleKind::Ip(addr) => addr == peer,
        RuleKind::Network { addr, prefix } => match (addr, peer) {
            (IpAddr::V4(net), IpAddr::V4(peer)) => {
                let mask = v4_mask(*prefix);
                u32::from(*net) & mask == u32::from(*peer) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(peer)) => {
                let mask = v6_mask(*prefix);
                u128::from(*net) & mask == u128::from(*peer) & mask
            }
            _ => false,
        },
    }
}

fn v4_mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix.min(32)))
    }
}

fn v6_mask(prefix: u8) -> u128 {
    if prefix == 0 {
        0
    } else {
        u128::MAX << (128 - u32::from(prefix.min(128)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use druckwerk_core::config::AccessConfig;

    fn rule(sense: RuleSense, spec: &str) -> AccessRule {
        let kind = if let Some((addr, prefix)) = spec.split_once('/') {
            RuleKind::Network {
                addr: addr.parse().unwrap(),
                prefix: prefix.parse().unwrap(),
            }
        } else {
            RuleKind::Ip(spec.parse().unwrap())
        };
        AccessRule { sense, kind }
    }

    #[test]
    fn allow_deny_starts_denying() {
        let policy = AccessPolicy::new(AccessConfig {
            order: RuleOrder::AllowDeny,
            allow_all: false,
            deny_all: false,
            rules: vec![rule(RuleSense::Allow, "192.168.1.0/24")],
        });
        assert!(policy.allows(&"192.168.1.42".parse().unwrap()));
        assert!(!policy.allows(&"10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn deny_rules_override_allow_in_allow_deny_order() {
        let policy = AccessPolicy::new(AccessConfig {
            order: RuleOrder::AllowDeny,
            allow_all: false,
            deny_all: false,
            rules: vec![
                rule(RuleSense::Allow, "192.168.1.0/24"),
                rule(RuleSense::Deny, "192.168.1.13"),
            ],
        });
        assert!(policy.allows(&"192.168.1.42".parse().unwrap()));
        assert!(!policy.allows(&"192.168.1.13".parse().unwrap()));
    }

    #[test]
    fn deny_allow_starts_allowing() {
        let policy = AccessPolicy::new(AccessConfig {
            order: RuleOrder::DenyAllow,
            allow_all: false,
            deny_all: false,
            rules: vec![
                rule(RuleSense::Deny, "10.0.0.0/8"),
                rule(RuleSense::Allow, "10.1.2.3"),
            ],
        });
        assert!(policy.allows(&"192.168.0.5".parse().unwrap()));
        assert!(!policy.allows(&"10.9.9.9".parse().unwrap()));
        // Allow applied after deny wins back the specific host.
        assert!(policy.allows(&"10.1.2.3".parse().unwrap()));
    }

    #[test]
    fn deny_all_with_allow_rules() {
        let policy = AccessPolicy::new(AccessConfig {
            order: RuleOrder::DenyAllow,
            allow_all: false,
            deny_all: true,
            rules: vec![rule(RuleSense::Allow, "192.168.1.0/24")],
        });
        assert!(policy.allows(&"192.168.1.1".parse().unwrap()));
        assert!(!policy.allows(&"172.16.0.1".parse().unwrap()));
    }

    #[test]
    fn family_sensitive_rules() {
        let policy = AccessPolicy::new(AccessConfig {
            order: RuleOrder::AllowDeny,
            allow_all: false,
            deny_all: false,
            rules: vec![rule(RuleSense::Allow, "0.0.0.0/0")],
        });
        assert!(policy.allows(&"203.0.113.9".parse().unwrap()));
        // The v4 catch-all must not match a v6 peer.
        assert!(!policy.allows(&"2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn v6_network_rule() {
        let policy = AccessPolicy::new(AccessConfig {
            order: RuleOrder::AllowDeny,
            allow_all: false,
            deny_all: false,
            rules: vec![rule(RuleSense::Allow, "2001:db8::/32")],
        });
        assert!(policy.allows(&"2001:db8::42".parse().unwrap()));
        assert!(!policy.allows(&"2001:db9::42".parse().unwrap()));
    }
}
