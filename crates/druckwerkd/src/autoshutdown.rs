// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Auto-shutdown on inactivity.
//
// Two triggers: no managed queues, or additionally no active jobs on any
// managed queue.  When the condition holds, orderly shutdown is scheduled
// after the configured timeout and cancelled if activity returns first.
// The Avahi-bound variant also counts a missing DNS-SD daemon as
// inactivity.  SIGUSR1/SIGUSR2 toggle the controller at runtime.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, info};

use druckwerk_core::config::{AutoShutdownConfig, AutoShutdownOn};
use druckwerk_cups::Scheduler;
use druckwerk_registry::Registry;

pub struct AutoShutdown {
    config: AutoShutdownConfig,
    registry: Arc<RwLock<Registry>>,
    scheduler: Arc<dyn Scheduler>,
    enabled: AtomicBool,
    dnssd_present: AtomicBool,
    deadline: Mutex<Option<Instant>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl AutoShutdown {
    pub fn new(
        config: AutoShutdownConfig,
        registry: Arc<RwLock<Registry>>,
        scheduler: Arc<dyn Scheduler>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Arc<Self> {
        let enabled = config.enabled;
        Arc::new(Self {
            config,
            registry,
            scheduler,
            enabled: AtomicBool::new(enabled),
            dnssd_present: AtomicBool::new(true),
            deadline: Mutex::new(None),
            shutdown_tx,
        })
    }

    /// Runtime toggle (SIGUSR1 on, SIGUSR2 off).
    pub fn set_enabled(&self, enabled: bool) {
        info!(enabled, "auto-shutdown toggled");
        self.enabled.store(enabled, Ordering::SeqCst);
        if !enabled {
            *self.deadline.lock() = None;
        }
    }

    /// DNS-SD daemon presence, fed by the discovery event stream.
    pub fn set_dnssd_present(&self, present: bool) {
        self.dnssd_present.store(present, Ordering::SeqCst);
    }

    /// Re-check the trigger condition; fires the shutdown channel when a
    /// scheduled deadline has passed.  Returns true when shutdown fired.
    pub async fn evaluate(&self) -> bool {
        let condition = self.condition_holds().await;
        let mut deadline = self.deadline.lock();

        match (*deadline, condition) {
            (None, true) => {
                let at = Instant::now() + Duration::from_secs(self.config.timeout_secs);
                info!(
                    timeout_secs = self.config.timeout_secs,
                    "inactive, shutdown scheduled"
                );
                *deadline = Some(at);
            }
            (Some(_), false) => {
                info!("activity returned, shutdown cancelled");
                *deadline = None;
            }
            (Some(at), true) if at <= Instant::now() => {
                info!("auto-shutdown timeout reached, requesting exit");
                let _ = self.shutdown_tx.send(());
                *deadline = None;
                return true;
            }
            _ => {}
        }
        false
    }

    async fn condition_holds(&self) -> bool {
        if !self.enabled.load(Ordering::SeqCst) {
            return false;
        }
        if self.config.avahi_bound && !self.dnssd_present.load(Ordering::SeqCst) {
            debug!("DNS-SD daemon gone, counting as inactive");
            return true;
        }

        let queues: Vec<String> = {
            let registry = self.registry.read();
            registry
                .ids()
                .into_iter()
                .filter_map(|id| registry.get(id))
                .filter(|e| e.slave_of.is_none() && e.status.is_live())
                .map(|e| e.queue_name.clone())
                .collect()
        };

        match self.config.on {
            AutoShutdownOn::NoQueues => queues.is_empty(),
            AutoShutdownOn::NoJobs => {
                for queue in &queues {
                    let jobs = self.scheduler.active_jobs(queue).await.unwrap_or_default();
                    if !jobs.is_empty() {
                        return false;
                    }
                }
                true
            }
        }
    }

    /// Periodic evaluation until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.evaluate().await {
                        return;
                    }
                }
                _ = shutdown.recv() => return,
            }
        }
    }
}
