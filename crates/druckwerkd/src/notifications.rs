// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Scheduler notification handling.
//
// The daemon keeps one pull subscription on the local scheduler and feeds
// the decoded events back into registry transitions: deleted managed queues
// are re-created, externally modified queues are released, default-printer
// identity is tracked across removals, and processing jobs trigger the
// cluster dispatcher.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use druckwerk_core::config::Config;
use druckwerk_core::EntryStatus;
use druckwerk_cups::{Scheduler, SchedulerEvent};
use druckwerk_registry::{EntryId, Registry};

use crate::dispatch::Dispatcher;
use crate::options::OptionStore;

/// How often pending notifications are pulled.
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Wait before re-creating a failed subscription.
const RESUBSCRIBE_PAUSE: Duration = Duration::from_secs(10);

pub struct NotificationHandler {
    registry: Arc<RwLock<Registry>>,
    scheduler: Arc<dyn Scheduler>,
    dispatcher: Arc<Dispatcher>,
    options: Arc<OptionStore>,
    config: Arc<Config>,
    /// Shared with the reconciler's delete path.
    active: Arc<AtomicBool>,
    /// Scheduler default as last reported by state-changed events.
    current_default: Mutex<Option<String>>,
}

impl NotificationHandler {
    pub fn new(
        registry: Arc<RwLock<Registry>>,
        scheduler: Arc<dyn Scheduler>,
        dispatcher: Arc<Dispatcher>,
        options: Arc<OptionStore>,
        config: Arc<Config>,
        active: Arc<AtomicBool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            scheduler,
            dispatcher,
            options,
            config,
            active,
            current_default: Mutex::new(None),
        })
    }

    /// Seed the tracked default from the scheduler.
    pub async fn prime_default(&self) {
        if let Ok(default) = self.scheduler.default_queue().await {
            *self.current_default.lock() = default;
        }
    }

    /// Apply one scheduler event.
    pub async fn handle_event(&self, event: SchedulerEvent) {
        debug!(?event, "scheduler event");
        match event {
            SchedulerEvent::PrinterAdded { name } => {
                debug!(queue = %name, "printer added on scheduler");
            }
            SchedulerEvent::PrinterDeleted { name } => {
                self.on_printer_deleted(&name).await;
            }
            SchedulerEvent::PrinterModified { name } => {
                self.on_printer_modified(&name).await;
            }
            SchedulerEvent::PrinterStateChanged { name, text } => {
                self.on_state_changed(&name, &text);
            }
            SchedulerEvent::JobState {
                queue,
                job_id,
                state,
            } => {
                if state == "processing" {
                    if let Err(e) = self.dispatcher.dispatch_job(&queue, job_id).await {
                        warn!(queue = %queue, job_id, error = %e, "dispatch failed");
                    }
                }
            }
        }
    }

    /// A managed queue deleted behind our back is re-created immediately;
    /// if it was the scheduler default, that fact is recorded so the create
    /// path restores defaulthood.
    async fn on_printer_deleted(&self, name: &str) {
        let Some(id) = self.managed_entry(name) else {
            return;
        };

        let was_default = self.current_default.lock().as_deref() == Some(name);
        if was_default {
            if let Err(e) = self.options.save_remote_default(name) {
                warn!(queue = name, error = %e, "could not record default for restore");
            }
        }

        // Only act when no re-created queue with that name is visible.
        match self.scheduler.queue(name).await {
            Ok(None) => {
                info!(queue = name, "managed queue deleted externally, re-creating");
                let mut registry = self.registry.write();
                if let Some(entry) = registry.get_mut(id) {
                    entry.timeout = Instant::now();
                    let _ = entry.transition(EntryStatus::ToBeCreated);
                }
            }
            Ok(Some(_)) => {
                debug!(queue = name, "queue already re-created, nothing to do");
            }
            Err(e) => {
                warn!(queue = name, error = %e, "cannot inspect deleted queue");
            }
        }
    }

    /// Overwrite detection on modification events, applied to every managed
    /// entry sharing the name.  Entries the reconciler itself is rewriting
    /// (called flag set) are skipped.
    async fn on_printer_modified(&self, name: &str) {
        let queue = match self.scheduler.queue(name).await {
            Ok(Some(queue)) => queue,
            Ok(None) => return,
            Err(e) => {
                warn!(queue = name, error = %e, "cannot inspect modified queue");
                return;
            }
        };

        let candidates: Vec<EntryId> = {
            let registry = self.registry.read();
            registry
                .by_queue_name(name)
                .into_iter()
                .filter(|id| {
                    registry
                        .get(*id)
                        .map(|e| {
                            e.slave_of.is_none()
                                && e.status == EntryStatus::Confirmed
                                && !e.called
                        })
                        .unwrap_or(false)
                })
                .collect()
        };

        for id in candidates {
            enum Change {
                Uri,
                Driver,
                None,
            }
            let change = {
                let registry = self.registry.read();
                let Some(entry) = registry.get(id) else { continue };
                let expected = if entry.cluster && entry.slave_of.is_none() {
                    format!("implicitclass:{name}")
                } else {
                    entry.uri.clone()
                };
                if queue.device_uri != expected {
                    Change::Uri
                } else if entry
                    .nickname
                    .as_deref()
                    .map(|n| n != queue.nickname)
                    .unwrap_or(false)
                {
                    Change::Driver
                } else {
                    Change::None
                }
            };

            match change {
                Change::Uri => {
                    warn!(queue = name, uri = %queue.device_uri, "queue externally overwritten");
                    self.registry
                        .write()
                        .release_and_rename(id, "externally modified");
                }
                Change::Driver => {
                    info!(queue = name, "queue driver externally changed, rewriting");
                    let mut registry = self.registry.write();
                    if let Some(entry) = registry.get_mut(id) {
                        entry.timeout = Instant::now();
                        let _ = entry.transition(EntryStatus::ToBeCreated);
                    }
                }
                Change::None => {}
            }
        }
    }

    /// Track default-printer identity from the notify text.
    fn on_state_changed(&self, name: &str, text: &str) {
        if text.contains("is now the default printer") {
            *self.current_default.lock() = Some(name.to_string());
            if self.managed_entry(name).is_none() {
                // The user picked their own default; remember it so we can
                // restore it when one of ours stops being default, and stop
                // competing for defaulthood.
                if let Err(e) = self.options.save_local_default(name) {
                    warn!(queue = name, error = %e, "could not record local default");
                }
                self.options.clear_remote_default();
            }
        } else if text.contains("is no longer the default printer") {
            let mut current = self.current_default.lock();
            if current.as_deref() == Some(name) {
                *current = None;
            }
        }
    }

    /// Live non-slave managed entry for a queue name.
    fn managed_entry(&self, name: &str) -> Option<EntryId> {
        let registry = self.registry.read();
        registry.by_queue_name(name).into_iter().find(|id| {
            registry
                .get(*id)
                .map(|e| e.slave_of.is_none() && e.status.is_live())
                .unwrap_or(false)
        })
    }

    /// Subscription lifecycle: create, poll, renew at half the lease,
    /// re-create after failures.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let lease = self.config.notify_lease();
        let mut subscription: Option<i32> = None;
        let mut sequence = 1;
        let mut poll = tokio::time::interval(POLL_INTERVAL);
        let mut renew = tokio::time::interval(lease / 2);
        renew.reset();

        loop {
            if subscription.is_none() {
                match self.scheduler.create_subscription(lease).await {
                    Ok(id) => {
                        info!(subscription = id, "notification subscription active");
                        subscription = Some(id);
                        sequence = 1;
                        self.active.store(true, Ordering::SeqCst);
                    }
                    Err(e) => {
                        warn!(error = %e, "cannot subscribe to scheduler notifications");
                        self.active.store(false, Ordering::SeqCst);
                        tokio::select! {
                            _ = tokio::time::sleep(RESUBSCRIBE_PAUSE) => continue,
                            _ = shutdown.recv() => return,
                        }
                    }
                }
            }
            let Some(id) = subscription else { continue };

            tokio::select! {
                _ = poll.tick() => {
                    match self.scheduler.notifications(id, sequence).await {
                        Ok((events, next)) => {
                            sequence = next;
                            for event in events {
                                self.handle_event(event).await;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "notification poll failed, resubscribing");
                            self.active.store(false, Ordering::SeqCst);
                            subscription = None;
                        }
                    }
                }
                _ = renew.tick() => {
                    if let Err(e) = self.scheduler.renew_subscription(id, lease).await {
                        warn!(error = %e, "subscription renewal failed");
                        self.active.store(false, Ordering::SeqCst);
                        subscription = None;
                    }
                }
                _ = shutdown.recv() => {
                    let _ = self.scheduler.cancel_subscription(id).await;
                    return;
                }
            }
        }
    }
}
