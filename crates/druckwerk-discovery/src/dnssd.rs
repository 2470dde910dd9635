// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// DNS-SD browsing for IPP and IPPS printing services.
//
// We browse `_ipp._tcp.local.` and `_ipps._tcp.local.` with the `mdns-sd`
// crate.  Resolved and removed services are forwarded into a typed event
// channel that the daemon's event loop consumes; the channel closing without
// a stop request is reported as the DNS-SD daemon disappearing, which feeds
// the Avahi-bound auto-shutdown variant.

use std::collections::HashMap;
use std::net::IpAddr;

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use druckwerk_core::error::{DruckwerkError, Result};
use druckwerk_core::{AddrFamily, Transport};

/// mDNS service type for plain IPP.
const IPP_SERVICE: &str = "_ipp._tcp.local.";

/// mDNS service type for TLS-secured IPP.
const IPPS_SERVICE: &str = "_ipps._tcp.local.";

/// A resolved DNS-SD printing service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsSdService {
    /// Instance name without the service type suffix.
    pub service_name: String,
    pub transport: Transport,
    pub domain: String,
    /// Interface the announcement was received on; "lo" when the resolved
    /// address is loopback, "any" otherwise (the mDNS daemon browses all
    /// interfaces at once).
    pub interface: String,
    pub family: AddrFamily,
    pub host: String,
    pub ip: Option<IpAddr>,
    pub port: u16,
    /// TXT key/value table.
    pub txt: HashMap<String, String>,
}

/// Events flowing from the browser to the intake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    Resolved(DnsSdService),
    Removed {
        service_name: String,
        transport: Transport,
    },
    /// The mDNS daemon went away; entries should be demoted, not torn down.
    DaemonGone,
    DaemonBack,
}

/// Browser for IPP/IPPS services, forwarding into an event channel.
pub struct DnsSdBrowser {
    daemon: ServiceDaemon,
    browsing: bool,
}

impl DnsSdBrowser {
    /// Spawn the mDNS daemon.  Call [`start`] to begin browsing.
    pub fn new() -> Result<Self> {
        let daemon = ServiceDaemon::new()
            .map_err(|e| DruckwerkError::Discovery(format!("failed to start mDNS daemon: {e}")))?;
        Ok(Self {
            daemon,
            browsing: false,
        })
    }

    /// Start browsing both service types.
    ///
    /// Returns immediately; a background thread per service type drains the
    /// browse channel into `tx`.
    pub fn start(&mut self, tx: mpsc::UnboundedSender<DiscoveryEvent>) -> Result<()> {
        if self.browsing {
            debug!("DNS-SD browsing already running");
            return Ok(());
        }

        let ipp_receiver = self
            .daemon
            .browse(IPP_SERVICE)
            .map_err(|e| DruckwerkError::Discovery(format!("browse {IPP_SERVICE}: {e}")))?;
        let ipps_receiver = self
            .daemon
            .browse(IPPS_SERVICE)
            .map_err(|e| DruckwerkError::Discovery(format!("browse {IPPS_SERVICE}: {e}")))?;

        Self::spawn_listener(IPP_SERVICE, Transport::Ipp, ipp_receiver, tx.clone());
        Self::spawn_listener(IPPS_SERVICE, Transport::Ipps, ipps_receiver, tx);

        self.browsing = true;
        info!("DNS-SD browsing started");
        Ok(())
    }

    /// Stop browsing; the listener threads exit on their stop events.
    pub fn stop(&mut self) -> Result<()> {
        if !self.browsing {
            return Ok(());
        }
        self.daemon
            .stop_browse(IPP_SERVICE)
            .map_err(|e| DruckwerkError::Discovery(format!("stop browse {IPP_SERVICE}: {e}")))?;
        self.daemon
            .stop_browse(IPPS_SERVICE)
            .map_err(|e| DruckwerkError::Discovery(format!("stop browse {IPPS_SERVICE}: {e}")))?;
        self.browsing = false;
        info!("DNS-SD browsing stopped");
        Ok(())
    }

    /// Shut down the mDNS daemon entirely.
    pub fn shutdown(self) -> Result<()> {
        let _status_rx = self
            .daemon
            .shutdown()
            .map_err(|e| DruckwerkError::Discovery(format!("daemon shutdown: {e}")))?;
        info!("mDNS daemon shut down");
        Ok(())
    }

    /// Drain one browse receiver into the shared event channel.
    fn spawn_listener(
        service_type: &'static str,
        transport: Transport,
        receiver: mdns_sd::Receiver<ServiceEvent>,
        tx: mpsc::UnboundedSender<DiscoveryEvent>,
    ) {
        std::thread::Builder::new()
            .name(format!("dnssd-{service_type}"))
            .spawn(move || {
                let mut stopped = false;
                while let Ok(event) = receiver.recv() {
                    match event {
                        ServiceEvent::SearchStarted(stype) => {
                            debug!(service_type = %stype, "DNS-SD search started");
                        }
                        ServiceEvent::ServiceFound(stype, fullname) => {
                            debug!(service_type = %stype, name = %fullname, "service found");
                        }
                        ServiceEvent::ServiceResolved(info) => {
                            match service_to_event(&info, transport) {
                                Some(service) => {
                                    debug!(
                                        name = %service.service_name,
                                        host = %service.host,
                                        port = service.port,
                                        "service resolved"
                                    );
                                    if tx.send(DiscoveryEvent::Resolved(service)).is_err() {
                                        break;
                                    }
                                }
                                None => {
                                    warn!(
                                        fullname = %info.get_fullname(),
                                        "resolved service has no usable address"
                                    );
                                }
                            }
                        }
                        ServiceEvent::ServiceRemoved(stype, fullname) => {
                            info!(service_type = %stype, name = %fullname, "service removed");
                            let event = DiscoveryEvent::Removed {
                                service_name: strip_service_suffix(&fullname, service_type),
                                transport,
                            };
                            if tx.send(event).is_err() {
                                break;
                            }
                        }
                        ServiceEvent::SearchStopped(stype) => {
                            debug!(service_type = %stype, "DNS-SD search stopped");
                            stopped = true;
                            break;
                        }
                    }
                }
                if !stopped {
                    // The daemon died under us rather than being stopped.
                    let _ = tx.send(DiscoveryEvent::DaemonGone);
                }
            })
            .expect("failed to spawn DNS-SD listener thread");
    }
}

/// Convert a resolved `ServiceInfo` into a discovery event payload.
///
/// Prefers an IPv4 address for wider printer compatibility; the interface is
/// reported as "lo" for loopback announcements.
fn service_to_event(info: &ServiceInfo, transport: Transport) -> Option<DnsSdService> {
    let ip: IpAddr = info
        .get_addresses()
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| info.get_addresses().iter().next())
        .copied()?;

    let fullname = info.get_fullname();
    let service_type = match transport {
        Transport::Ipp => IPP_SERVICE,
        Transport::Ipps => IPPS_SERVICE,
    };

    let mut txt = HashMap::new();
    for property in info.get_properties().iter() {
        txt.insert(property.key().to_string(), property.val_str().to_string());
    }

    Some(DnsSdService {
        service_name: strip_service_suffix(fullname, service_type),
        transport,
        domain: "local".to_string(),
        interface: if ip.is_loopback() { "lo" } else { "any" }.to_string(),
        family: AddrFamily::of(&ip),
        host: info.get_hostname().trim_end_matches('.').to_string(),
        ip: Some(ip),
        port: info.get_port(),
        txt,
    })
}

/// Strip `.<service_type>` from a DNS-SD full name.
fn strip_service_suffix(fullname: &str, service_type: &str) -> String {
    fullname
        .strip_suffix(service_type)
        .map(|s| s.trim_end_matches('.'))
        .unwrap_or(fullname)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffix_stripping() {
        assert_eq!(
            strip_service_suffix("Lab Printer @ lab._ipps._tcp.local.", IPPS_SERVICE),
            "Lab Printer @ lab"
        );
        assert_eq!(
            strip_service_suffix("Plain._ipp._tcp.local.", IPP_SERVICE),
            "Plain"
        );
        // Unexpected shape passes through untouched.
        assert_eq!(strip_service_suffix("odd-name", IPP_SERVICE), "odd-name");
    }
}
