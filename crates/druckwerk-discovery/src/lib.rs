// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Druckwerk Discovery — DNS-SD browsing, intake normalization, and periodic
// polling of remote print schedulers.  Everything funnels into the remote
// printer registry through the intake.

pub mod dnssd;
pub mod intake;
pub mod poller;

pub use dnssd::{DiscoveryEvent, DnsSdBrowser, DnsSdService};
pub use intake::Intake;
pub use poller::Poller;
