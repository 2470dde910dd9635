// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Druckwerk Net — local interface tracking and peer access policy.

pub mod access;
pub mod netif;

pub use access::AccessPolicy;
pub use netif::NetifTracker;
