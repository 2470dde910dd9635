// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Druckwerk daemon — queue reconciliation engine.
//
// The daemon browses DNS-SD and polls remote schedulers for printers, keeps
// a registry of what it found, and drives the local print scheduler so that
// every discovered printer has a matching local queue.  Cluster queues are
// load-balanced per job through the dispatcher.

pub mod autoshutdown;
pub mod cli;
pub mod daemon;
pub mod dispatch;
pub mod notifications;
pub mod options;
pub mod reconciler;

pub use cli::Cli;
pub use daemon::Daemon;
