// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Druckwerk CUPS — access to the local print scheduler.
//
// The `Scheduler` trait is the seam between the reconciliation engine and
// the actual scheduler: the daemon talks IPP through `IppScheduler`, the
// test suites drive a `MockScheduler`.

pub mod attrs;
pub mod client;
pub mod events;
#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use client::{
    IppScheduler, JobInfo, LocalQueue, QueueSpec, RemoteQueueInfo, Scheduler, DEST_OPTION,
    MARK_OPTION,
};
pub use events::SchedulerEvent;
#[cfg(any(test, feature = "mock"))]
pub use mock::MockScheduler;
