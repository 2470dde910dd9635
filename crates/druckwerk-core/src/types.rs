// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Core domain types for the Druckwerk queue reconciler.

use std::collections::HashMap;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Flattened attribute set from a get-printer-attributes query.
///
/// Multi-valued attributes are joined with `", "` by the IPP layer.
pub type PrinterAttributes = HashMap<String, String>;

/// Transport used to reach a remote printing service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Transport {
    /// Plain IPP (`ipp://`, typically port 631).
    Ipp,
    /// TLS-secured IPP (`ipps://`, port 631 or 443).
    Ipps,
}

impl Transport {
    /// URI scheme for this transport.
    pub fn scheme(&self) -> &'static str {
        match self {
            Self::Ipp => "ipp",
            Self::Ipps => "ipps",
        }
    }
}

/// How a discovery instance was learned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscoveryOrigin {
    /// DNS-SD browse result.
    DnsSd,
    /// Periodic poll of a remote print scheduler.
    Poll,
    /// Legacy scheduler broadcast; entries expire on a browse timeout.
    LegacyBroadcast,
}

/// Address family of a discovery instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddrFamily {
    V4,
    V6,
}

impl AddrFamily {
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Self::V4,
            IpAddr::V6(_) => Self::V6,
        }
    }
}

/// One concrete way a logical printer has been seen on the network.
///
/// An entry keeps every instance it has been discovered through; the sorted
/// first element is the *preferred* instance and defines the exposed device
/// URI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryInstance {
    pub origin: DiscoveryOrigin,
    pub transport: Transport,
    pub family: AddrFamily,
    /// Interface name the announcement arrived on ("lo", "eth0", ...).
    pub interface: String,
    /// DNS-SD service name; empty for polled instances.
    pub service_name: String,
    /// DNS-SD administrative domain; empty for polled instances.
    pub domain: String,
    pub host: String,
    pub ip: Option<IpAddr>,
    pub port: u16,
    /// Resource path without a leading slash ("printers/lab", "ipp/print").
    pub resource: String,
}

impl DiscoveryInstance {
    /// Device URI exposed when this instance is preferred.
    pub fn uri(&self) -> String {
        format!(
            "{}://{}:{}/{}",
            self.transport.scheme(),
            self.host,
            self.port,
            self.resource
        )
    }

    /// Whether the announcement arrived over the loopback interface.
    pub fn is_loopback(&self) -> bool {
        self.interface == "lo"
            || self.interface == "lo0"
            || self.ip.map(|ip| ip.is_loopback()).unwrap_or(false)
    }

    /// Sort key: lower ranks are preferred.
    ///
    /// Preference order: loopback first, then secure transport, then IPv4
    /// over IPv6, then DNS-SD over polling.
    pub fn preference_rank(&self) -> (u8, u8, u8, u8) {
        let loopback = u8::from(!self.is_loopback());
        let secure = u8::from(self.transport != Transport::Ipps);
        let family = match self.family {
            AddrFamily::V4 => 0,
            AddrFamily::V6 => 1,
        };
        let origin = match self.origin {
            DiscoveryOrigin::DnsSd => 0,
            DiscoveryOrigin::LegacyBroadcast => 1,
            DiscoveryOrigin::Poll => 2,
        };
        (loopback, secure, family, origin)
    }
}

/// Capability hints parsed from a DNS-SD TXT table or attribute query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityHints {
    pub make_model: Option<String>,
    /// Supported data formats from the `pdl` TXT key.
    pub formats: Vec<String>,
    pub color: bool,
    pub duplex: bool,
    /// Location text from the `note` TXT key.
    pub location: Option<String>,
    pub info: Option<String>,
}

/// A printer discovered on the network, normalized by the intake.
///
/// Transient: the record is consumed when it is handed to the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredPrinter {
    pub instance: DiscoveryInstance,
    /// True if the upstream service is itself a print scheduler queue.
    pub cups_queue: bool,
    pub hints: CapabilityHints,
    /// TXT `UUID` key, used by the local-origin filter.
    pub uuid: Option<uuid::Uuid>,
    /// Remote queue name for scheduler-exported queues (last URI segment).
    pub remote_queue: Option<String>,
}

/// Lifecycle states of a remote printer entry.
///
/// `DeletedMaster` is carried only by the reserved sentinel entry that holds
/// slave references while a master is being torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryStatus {
    /// Needs a create/modify request against the local scheduler.
    ToBeCreated,
    /// Matches a live scheduler queue.
    Confirmed,
    /// Recovered from a previous session, no discovery yet.
    Unconfirmed,
    /// Scheduled for queue removal.
    Disappeared,
    /// Detached from our control after an external modification.
    ToBeReleased,
    /// Transient sub-state while a name clash is resolved with `@host`.
    ToBeCreatedRenamed,
    /// Sentinel parent for slaves of a removed master.
    DeletedMaster,
}

impl EntryStatus {
    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(&self, next: EntryStatus) -> bool {
        use EntryStatus::*;
        match (self, next) {
            (DeletedMaster, _) | (_, DeletedMaster) => false,
            (ToBeCreated, Confirmed)
            | (ToBeCreated, ToBeCreated)
            | (ToBeCreated, Disappeared) => true,
            (Confirmed, ToBeCreated)
            | (Confirmed, Unconfirmed)
            | (Confirmed, Disappeared)
            | (Confirmed, ToBeReleased) => true,
            (Unconfirmed, Confirmed)
            | (Unconfirmed, ToBeCreated)
            | (Unconfirmed, Disappeared) => true,
            // A disappeared backup slave may be promoted back to life.
            (Disappeared, ToBeCreated) => true,
            (ToBeCreatedRenamed, ToBeCreated) => true,
            (_, ToBeReleased) => true,
            _ => false,
        }
    }

    /// States in which the entry still represents a live printer.
    pub fn is_live(&self) -> bool {
        !matches!(self, EntryStatus::Disappeared | EntryStatus::ToBeReleased | EntryStatus::DeletedMaster)
    }
}

impl std::fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ToBeCreated => "to-be-created",
            Self::Confirmed => "confirmed",
            Self::Unconfirmed => "unconfirmed",
            Self::Disappeared => "disappeared",
            Self::ToBeReleased => "to-be-released",
            Self::ToBeCreatedRenamed => "to-be-created-renamed",
            Self::DeletedMaster => "deleted-master",
        };
        f.write_str(s)
    }
}

/// Scheduler-reported state of a queue or remote printer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrinterState {
    #[default]
    Idle,
    Processing,
    Stopped,
}

impl PrinterState {
    /// Parse the IPP `printer-state` enum (RFC 8011 §5.4.11).
    pub fn from_ipp_enum(value: i32) -> Self {
        match value {
            4 => Self::Processing,
            5 => Self::Stopped,
            _ => Self::Idle,
        }
    }
}

/// Print-quality request carried by a job (IPP `print-quality`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrintQuality {
    Draft,
    Normal,
    High,
}

/// Attribute constraints a job may carry, used to filter cluster candidates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobConstraints {
    pub document_format: Option<String>,
    pub media_type: Option<String>,
    pub page_size: Option<String>,
    pub duplex: Option<bool>,
    pub color: Option<bool>,
    pub staple: bool,
    pub fold: bool,
    pub punch: bool,
    pub quality: Option<PrintQuality>,
    pub orientation: Option<i32>,
}
