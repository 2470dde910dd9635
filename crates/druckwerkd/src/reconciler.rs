// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// The queue reconciler: realizes registry intent onto the local scheduler.
//
// A single timer drives the scan.  Entries whose deadline has passed are
// processed in insertion order under a per-call budget; anything over the
// budget is pushed to the next tick.  The actual IPP work runs in detached
// worker tasks so the scan never blocks on a slow scheduler; the per-entry
// `called` flag is the token that keeps at most one worker per entry in
// flight.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use druckwerk_core::config::Config;
use druckwerk_core::{DiscoveryOrigin, EntryStatus};
use druckwerk_cups::{LocalQueue, QueueSpec, Scheduler};
use druckwerk_discovery::Intake;
use druckwerk_registry::{EntryId, Registry};

use crate::options::OptionStore;

/// State message used when a queue with pending jobs cannot be removed yet.
const BUSY_MESSAGE: &str = "Printer disappeared; waiting for remaining jobs before removal";

/// Cap on the exponential retry backoff.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

pub struct Reconciler {
    registry: Arc<RwLock<Registry>>,
    scheduler: Arc<dyn Scheduler>,
    intake: Arc<Intake>,
    options: Arc<OptionStore>,
    config: Arc<Config>,
    /// Held while a scan is in progress; one scan at a time.
    update_lock: tokio::sync::Mutex<()>,
    /// Whether the notification subscription is currently alive; gates
    /// deletion of the scheduler default queue.
    notifications_active: Arc<AtomicBool>,
    terminating: Arc<AtomicBool>,
}

impl Reconciler {
    pub fn new(
        registry: Arc<RwLock<Registry>>,
        scheduler: Arc<dyn Scheduler>,
        intake: Arc<Intake>,
        options: Arc<OptionStore>,
        config: Arc<Config>,
        notifications_active: Arc<AtomicBool>,
        terminating: Arc<AtomicBool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            scheduler,
            intake,
            options,
            config,
            update_lock: tokio::sync::Mutex::new(()),
            notifications_active,
            terminating,
        })
    }

    /// One reconciliation scan.
    ///
    /// Returns the handles of the worker tasks it launched; the event loop
    /// drops them (workers are detached), tests await them.
    pub async fn scan(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let _guard = self.update_lock.lock().await;

        // Refresh the scheduler view once per scan; the overwrite pre-check
        // and the intake's local-origin filter both feed from it.
        let queues = match self.scheduler.queues().await {
            Ok(queues) => queues,
            Err(e) => {
                warn!(error = %e, "cannot list scheduler queues, skipping scan");
                return Vec::new();
            }
        };
        let by_name: HashMap<String, LocalQueue> =
            queues.iter().map(|q| (q.name.clone(), q.clone())).collect();
        let foreign: HashSet<String> = queues
            .iter()
            .filter(|q| !q.is_managed())
            .map(|q| q.name.clone())
            .collect();
        let local_uuids: HashSet<uuid::Uuid> = queues
            .iter()
            .filter(|q| q.is_shared)
            .filter_map(|q| q.uuid)
            .collect();
        self.intake.set_local_queues(foreign, local_uuids);

        let now = Instant::now();
        let ids = self.registry.read().ids();
        let mut budget_used = 0usize;
        let mut handles = Vec::new();

        for id in ids {
            let Some((status, timeout, called, abandoned, is_slave, name)) =
                self.registry.read().get(id).map(|e| {
                    (
                        e.status,
                        e.timeout,
                        e.called,
                        e.abandoned,
                        e.slave_of.is_some(),
                        e.queue_name.clone(),
                    )
                })
            else {
                continue;
            };

            if called || abandoned || timeout > now {
                continue;
            }

            // Slaves own no scheduler resource; dead ones are freed inline.
            if is_slave {
                if matches!(status, EntryStatus::Disappeared | EntryStatus::ToBeReleased) {
                    self.registry.write().remove_entry(id);
                }
                continue;
            }

            match status {
                EntryStatus::Confirmed => {
                    self.check_confirmed(id, &name, by_name.get(&name), now);
                }
                EntryStatus::Unconfirmed => {
                    // Recovered entry that never got a discovery in time.
                    let mut registry = self.registry.write();
                    if let Some(entry) = registry.get_mut(id) {
                        info!(queue = %name, "unconfirmed queue timed out");
                        entry.timeout = now;
                        let _ = entry.transition(EntryStatus::Disappeared);
                    }
                }
                EntryStatus::ToBeReleased => {
                    self.release(id, &name);
                }
                EntryStatus::ToBeCreated
                | EntryStatus::ToBeCreatedRenamed
                | EntryStatus::Disappeared => {
                    if budget_used >= self.config.max_updates_per_call {
                        let mut registry = self.registry.write();
                        if let Some(entry) = registry.get_mut(id) {
                            entry.timeout = now + self.config.pause_between_updates();
                        }
                        continue;
                    }
                    budget_used += 1;

                    {
                        let mut registry = self.registry.write();
                        let Some(entry) = registry.get_mut(id) else { continue };
                        entry.called = true;
                    }
                    let worker = Arc::clone(self);
                    let handle = if status == EntryStatus::Disappeared {
                        tokio::spawn(async move { worker.delete_worker(id).await })
                    } else {
                        tokio::spawn(async move { worker.create_worker(id).await })
                    };
                    handles.push(handle);
                }
                EntryStatus::DeletedMaster => {}
            }
        }

        handles
    }

    /// Scan and wait for every launched worker; used by tests and shutdown.
    pub async fn scan_and_wait(self: &Arc<Self>) {
        for handle in self.scan().await {
            let _ = handle.await;
        }
    }

    /// Periodic scan loop until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.terminating.load(Ordering::SeqCst) {
                        return;
                    }
                    let _detached = self.scan().await;
                }
                _ = shutdown.recv() => return,
            }
        }
    }

    /// Final pass on termination: remove every managed queue unless the
    /// configuration says to keep them.
    pub async fn shutdown_cleanup(self: &Arc<Self>) {
        if self.config.keep_generated_queues_on_shutdown {
            info!("keeping generated queues on shutdown");
            return;
        }
        {
            let mut registry = self.registry.write();
            for id in registry.ids() {
                if let Some(entry) = registry.get_mut(id) {
                    if entry.status.is_live() {
                        entry.timeout = Instant::now();
                        let _ = entry.transition(EntryStatus::Disappeared);
                    }
                }
            }
        }
        // Deletions may be budget-split over several passes.
        for _ in 0..8 {
            self.scan_and_wait().await;
            if self.registry.read().is_empty() {
                break;
            }
        }
    }

    /// Overwrite pre-check for a confirmed entry.
    ///
    /// Compares the scheduler's device URI and driver nickname against what
    /// we last wrote.  A URI divergence releases the entry and re-creates it
    /// under a `@host` name; a nickname divergence only rewrites the driver.
    fn check_confirmed(&self, id: EntryId, name: &str, queue: Option<&LocalQueue>, now: Instant) {
        enum Action {
            Recreate,
            Release,
            RewriteDriver,
            Requeue,
            Expire,
        }

        let action = {
            let registry = self.registry.read();
            let Some(entry) = registry.get(id) else { return };
            if entry
                .browse_expiry
                .map(|expiry| expiry <= now)
                .unwrap_or(false)
            {
                Action::Expire
            } else {
                match queue {
                    None => Action::Recreate,
                    Some(q) => {
                        let expected = if entry.cluster && entry.slave_of.is_none() {
                            format!("implicitclass:{name}")
                        } else {
                            entry.uri.clone()
                        };
                        if q.device_uri != expected {
                            Action::Release
                        } else if entry
                            .nickname
                            .as_deref()
                            .map(|n| n != q.nickname)
                            .unwrap_or(false)
                        {
                            Action::RewriteDriver
                        } else {
                            Action::Requeue
                        }
                    }
                }
            }
        };

        let mut registry = self.registry.write();
        match action {
            Action::Expire => {
                if let Some(entry) = registry.get_mut(id) {
                    info!(queue = name, "legacy broadcast expired");
                    entry.timeout = now;
                    let _ = entry.transition(EntryStatus::Disappeared);
                }
            }
            Action::Recreate => {
                if let Some(entry) = registry.get_mut(id) {
                    info!(queue = name, "managed queue vanished, re-creating");
                    entry.timeout = now;
                    let _ = entry.transition(EntryStatus::ToBeCreated);
                }
            }
            Action::Release => {
                warn!(queue = name, "device URI externally modified, releasing queue");
                registry.release_and_rename(id, "externally modified");
            }
            Action::RewriteDriver => {
                if let Some(entry) = registry.get_mut(id) {
                    info!(queue = name, "driver externally replaced, rewriting");
                    entry.timeout = now;
                    let _ = entry.transition(EntryStatus::ToBeCreated);
                }
            }
            Action::Requeue => {
                if let Some(entry) = registry.get_mut(id) {
                    entry.timeout = now + self.config.browse_interval();
                }
            }
        }
    }

    /// Free a released entry.  The scheduler queue survives untouched; the
    /// user took it over.
    fn release(&self, id: EntryId, name: &str) {
        info!(queue = name, "queue released from management");
        self.registry.write().remove_entry(id);
    }

    // -- workers ------------------------------------------------------------

    async fn create_worker(self: Arc<Self>, id: EntryId) {
        let result = self.create_entry(id).await;
        if let Err(e) = result {
            warn!(entry = %id, error = %e, "create worker failed");
        }
        if let Some(entry) = self.registry.write().get_mut(id) {
            entry.called = false;
        }
    }

    async fn create_entry(&self, id: EntryId) -> druckwerk_core::error::Result<()> {
        let Some((name, uri, cups_queue, is_cluster_master, has_attrs, hints, saved, origin)) =
            self.registry.read().get(id).map(|e| {
                (
                    e.queue_name.clone(),
                    e.uri.clone(),
                    e.cups_queue,
                    e.cluster && e.slave_of.is_none(),
                    e.attributes.is_some(),
                    e.hints.clone(),
                    e.saved_options.clone(),
                    e.preferred().origin,
                )
            })
        else {
            return Ok(());
        };

        // 1. Capability acquisition.
        if !has_attrs {
            match self.scheduler.probe_printer(&uri).await {
                Ok(attrs) => {
                    let mut registry = self.registry.write();
                    if let Some(entry) = registry.get_mut(id) {
                        if entry.hints.make_model.is_none() {
                            entry.hints.make_model =
                                attrs.get("printer-make-and-model").cloned();
                        }
                        entry.attributes = Some(attrs);
                    }
                }
                Err(e) if e.is_transient() => {
                    self.reschedule_transient(id, &name, "attribute fetch");
                    return Ok(());
                }
                Err(e) => {
                    // A well-formed refusal: the printer is gone for us.
                    warn!(queue = %name, error = %e, "attribute fetch refused, giving up");
                    let mut registry = self.registry.write();
                    if let Some(entry) = registry.get_mut(id) {
                        entry.timeout = Instant::now();
                        let _ = entry.transition(EntryStatus::Disappeared);
                    }
                    return Ok(());
                }
            }
        }

        // 2. Convert a pre-existing temporary queue to permanent by toggling
        // the shared bit; a temporary queue backed by a remote scheduler is
        // removed instead, but only when it is idle.
        let existing = self.scheduler.queue(&name).await.unwrap_or(None);
        if let Some(q) = &existing {
            if q.is_temporary {
                if self.scheduler.set_shared(&name, true).await.is_err() {
                    let jobs = self.scheduler.active_jobs(&name).await.unwrap_or_default();
                    if jobs.is_empty() {
                        debug!(queue = %name, "removing stuck temporary queue");
                        let _ = self.scheduler.delete_queue(&name).await;
                    }
                }
            }
        }

        // 3. Option defaults: config-wide defaults, then the defaults the
        // printer itself reports, overlaid with the snapshot saved before
        // the queue last went away.
        let mut options = self.config.default_options.clone();
        if let Some(attrs) = self.registry.read().get(id).and_then(|e| e.attributes.as_ref().cloned()) {
            for (key, value) in attrs.iter().filter(|(k, _)| k.ends_with("-default")) {
                options.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
        options.extend(self.options.load_queue_options(&name));
        options.extend(saved);
        let nickname = hints
            .make_model
            .clone()
            .unwrap_or_else(|| "Remote Printer".to_string());
        options.insert("printer-make-and-model".to_string(), nickname.clone());

        // 4. Device URI per classification.
        let device_uri = if is_cluster_master {
            format!("implicitclass:{name}")
        } else {
            uri.clone()
        };

        // Shared policy: queues backed by a remote scheduler are not
        // re-shared unless configured; a user's shared choice on a plain
        // network printer queue is preserved.
        let is_shared = if cups_queue {
            self.config.allow_resharing_remote_cups_printers
        } else {
            existing.as_ref().map(|q| q.is_shared).unwrap_or(true)
        };

        let spec = QueueSpec {
            name: name.clone(),
            device_uri,
            info: hints.info.clone().unwrap_or_else(|| nickname.clone()),
            location: hints.location.clone().unwrap_or_default(),
            is_shared,
            options,
        };

        // 5. Send the modify request.
        if let Err(e) = self.scheduler.create_or_modify_queue(&spec).await {
            if e.is_transient() {
                self.retry_or_disappear(id, &name);
            } else {
                warn!(queue = %name, error = %e, "scheduler refused queue creation");
                let mut registry = self.registry.write();
                if let Some(entry) = registry.get_mut(id) {
                    entry.timeout = Instant::now();
                    let _ = entry.transition(EntryStatus::Disappeared);
                }
            }
            return Ok(());
        }

        // 6. Re-enable the queue if a previous run or a backend error
        // disabled it.
        if existing
            .as_ref()
            .map(|q| q.state == druckwerk_core::PrinterState::Stopped)
            .unwrap_or(false)
        {
            let _ = self.scheduler.resume_queue(&name).await;
        }

        // 7. Restore defaulthood recorded for this queue.
        if self.options.load_remote_default().as_deref() == Some(name.as_str()) {
            if self.scheduler.set_default(&name).await.is_ok() {
                info!(queue = %name, "restored default designation");
                self.options.clear_remote_default();
            }
        }

        // 8. Confirm.
        let mut registry = self.registry.write();
        if let Some(entry) = registry.get_mut(id) {
            entry.retries = 0;
            entry.status_note = None;
            entry.nickname = Some(nickname);
            if origin == DiscoveryOrigin::LegacyBroadcast {
                let expiry = Instant::now() + self.config.browse_timeout();
                entry.browse_expiry = Some(expiry);
                entry.timeout = expiry;
            } else {
                entry.browse_expiry = None;
                entry.timeout = Instant::now() + self.config.browse_interval();
            }
            let _ = entry.transition(EntryStatus::Confirmed);
            info!(queue = %name, uri = %entry.uri, "queue confirmed");
        }
        Ok(())
    }

    async fn delete_worker(self: Arc<Self>, id: EntryId) {
        let Some(name) = self
            .registry
            .read()
            .get(id)
            .map(|e| e.queue_name.clone())
        else {
            return;
        };

        // A disappearing master hands its queue to a surviving slave first,
        // whatever made it disappear.
        self.registry.write().promote_slave_of(id);

        // 1. Persist option defaults for a future re-creation.
        if let Ok(Some(queue)) = self.scheduler.queue(&name).await {
            let defaults: HashMap<String, String> = queue
                .options
                .iter()
                .filter(|(k, _)| k.ends_with("-default"))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            if !defaults.is_empty() {
                if let Err(e) = self.options.save_queue_options(&name, &defaults) {
                    warn!(queue = %name, error = %e, "could not persist queue options");
                }
            }
        }

        // 2. A queue with pending jobs is only disabled; removal waits.
        let jobs = self.scheduler.active_jobs(&name).await.unwrap_or_default();
        if !jobs.is_empty() {
            info!(queue = %name, jobs = jobs.len(), "queue busy, disabling instead of removing");
            let _ = self.scheduler.pause_queue(&name, BUSY_MESSAGE).await;
            let mut registry = self.registry.write();
            if let Some(entry) = registry.get_mut(id) {
                entry.timeout = Instant::now() + self.config.pause_between_updates();
                entry.called = false;
            }
            return;
        }

        let is_default = self
            .scheduler
            .default_queue()
            .await
            .ok()
            .flatten()
            .as_deref()
            == Some(name.as_str());

        // 3. Without a live notification channel we would never learn about
        // a manually chosen replacement default, so keep the queue.
        if is_default && !self.notifications_active.load(Ordering::SeqCst) {
            info!(queue = %name, "default queue kept while notifications are down");
            let _ = self.scheduler.pause_queue(&name, BUSY_MESSAGE).await;
            let mut registry = self.registry.write();
            if let Some(entry) = registry.get_mut(id) {
                entry.timeout = Instant::now() + self.config.pause_between_updates();
                entry.called = false;
            }
            return;
        }

        // 4. Delete, unless a promoted master or renamed clone owns the
        // queue name now.
        let has_other_owner = self.registry.read().queue_has_other_owner(id, &name);
        if !has_other_owner {
            if let Err(e) = self.scheduler.delete_queue(&name).await {
                warn!(queue = %name, error = %e, "queue deletion failed, rescheduling");
                let mut registry = self.registry.write();
                if let Some(entry) = registry.get_mut(id) {
                    entry.timeout = Instant::now() + self.config.pause_between_updates();
                    entry.called = false;
                }
                return;
            }
            if is_default {
                if let Some(prior) = self.options.load_local_default() {
                    if self.scheduler.set_default(&prior).await.is_ok() {
                        info!(queue = %prior, "restored prior local default");
                        self.options.clear_local_default();
                    }
                }
            }
        } else {
            debug!(queue = %name, "queue name has a new owner, skipping scheduler delete");
        }

        self.registry.write().remove_entry(id);
        info!(queue = %name, "entry removed");
    }

    /// Transient failure before the create request: back off, and abandon
    /// the entry for this session once the retry cap is reached.
    fn reschedule_transient(&self, id: EntryId, name: &str, what: &str) {
        let mut registry = self.registry.write();
        let Some(entry) = registry.get_mut(id) else { return };
        entry.retries += 1;
        if entry.retries >= self.config.http_max_retries {
            warn!(
                queue = name,
                retries = entry.retries,
                "{what} kept timing out, abandoning entry for this session"
            );
            entry.abandoned = true;
        } else {
            entry.timeout = Instant::now() + backoff(self.config.pause_between_updates(), entry.retries);
            debug!(queue = name, retries = entry.retries, "{what} timed out, rescheduled");
        }
    }

    /// Transient failure of the create/modify request itself: back off, and
    /// after the cap treat the printer as gone.
    fn retry_or_disappear(&self, id: EntryId, name: &str) {
        let mut registry = self.registry.write();
        let Some(entry) = registry.get_mut(id) else { return };
        entry.retries += 1;
        if entry.retries >= self.config.http_max_retries {
            warn!(queue = name, retries = entry.retries, "create retries exhausted");
            entry.timeout = Instant::now();
            let _ = entry.transition(EntryStatus::Disappeared);
        } else {
            entry.timeout = Instant::now() + backoff(self.config.pause_between_updates(), entry.retries);
            debug!(queue = name, retries = entry.retries, "create failed, rescheduled");
        }
    }
}

/// pause * 2^attempt, capped.
fn backoff(pause: Duration, attempt: u32) -> Duration {
    let factor = 1u32 << attempt.min(8);
    (pause * factor).min(MAX_BACKOFF)
}

#[cfg(test)]
mod tests {
    use super::*;
    use druckwerk_core::{PrinterAttributes, Transport};
    use druckwerk_cups::{JobInfo, MockScheduler};
    use druckwerk_discovery::dnssd::DnsSdService;
    use druckwerk_net::NetifTracker;

    struct Harness {
        reconciler: Arc<Reconciler>,
        registry: Arc<RwLock<Registry>>,
        intake: Arc<Intake>,
        mock: Arc<MockScheduler>,
        options: Arc<OptionStore>,
        notifications_active: Arc<AtomicBool>,
        _dir: tempfile::TempDir,
    }

    fn harness_with(config: Config) -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = Arc::new(config);
        let registry = Arc::new(RwLock::new(Registry::new()));
        let netifs = Arc::new(NetifTracker::new("workstation.example.com"));
        let intake = Arc::new(Intake::new(&config, netifs, Arc::clone(&registry)));
        let mock = Arc::new(MockScheduler::new());
        let options = Arc::new(OptionStore::new(dir.path()).expect("store"));
        let notifications_active = Arc::new(AtomicBool::new(true));
        let reconciler = Reconciler::new(
            Arc::clone(&registry),
            Arc::clone(&mock) as Arc<dyn Scheduler>,
            Arc::clone(&intake),
            Arc::clone(&options),
            Arc::clone(&config),
            Arc::clone(&notifications_active),
            Arc::new(AtomicBool::new(false)),
        );
        Harness {
            reconciler,
            registry,
            intake,
            mock,
            options,
            notifications_active,
            _dir: dir,
        }
    }

    fn harness() -> Harness {
        harness_with(Config::default())
    }

    /// Make every entry due so the next scan picks it up.
    fn reset_timeouts(registry: &Arc<RwLock<Registry>>) {
        let mut registry = registry.write();
        for id in registry.ids() {
            registry.get_mut(id).unwrap().timeout = Instant::now();
        }
    }

    fn lab_service() -> DnsSdService {
        DnsSdService {
            service_name: "Lab Printer @ lab".into(),
            transport: Transport::Ipps,
            domain: "local".into(),
            interface: "any".into(),
            family: druckwerk_core::AddrFamily::V4,
            host: "lab.local".into(),
            ip: Some("192.0.2.77".parse().unwrap()),
            port: 631,
            txt: [
                ("rp", "printers/lab"),
                ("ty", "Example MFG 9000"),
                ("printer-type", "0x480904c"),
            ]
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        }
    }

    fn remote_attrs() -> PrinterAttributes {
        PrinterAttributes::from([
            ("printer-state".to_string(), "3".to_string()),
            (
                "printer-make-and-model".to_string(),
                "Example MFG 9000".to_string(),
            ),
            (
                "document-format-supported".to_string(),
                "application/pdf".to_string(),
            ),
            ("media-default".to_string(), "iso_a4_210x297mm".to_string()),
        ])
    }

    #[tokio::test]
    async fn discovered_printer_becomes_managed_queue() {
        let h = harness();
        h.mock
            .add_remote("ipps://lab.local:631/printers/lab", remote_attrs());

        h.intake.handle_resolved(lab_service());
        h.reconciler.scan_and_wait().await;

        let queue = h.mock.queue_snapshot("Lab_Printer_lab").expect("queue created");
        assert!(queue.is_managed());
        assert_eq!(queue.device_uri, "ipps://lab.local:631/printers/lab");

        let registry = h.registry.read();
        let entry = registry.get(registry.ids()[0]).unwrap();
        assert_eq!(entry.status, EntryStatus::Confirmed);
        assert!(entry.attributes.is_some());
        // Remote scheduler queues are not re-shared by default.
        assert!(!queue.is_shared);
    }

    #[tokio::test]
    async fn scan_honours_update_budget() {
        let mut config = Config::default();
        config.max_updates_per_call = 4;
        let h = harness_with(config);

        for i in 0..10 {
            let mut svc = lab_service();
            svc.service_name = format!("Printer {i}");
            svc.host = format!("host-{i}.local");
            svc.txt.remove("printer-type");
            h.intake.handle_resolved(svc);
        }
        // Pre-fill capability caches so each entry costs exactly one create.
        {
            let mut registry = h.registry.write();
            for id in registry.ids() {
                registry.get_mut(id).unwrap().attributes = Some(remote_attrs());
            }
        }

        h.reconciler.scan_and_wait().await;
        assert_eq!(h.mock.request_count("create"), 4);

        // The pushed-out entries complete over the following ticks.
        for _ in 0..2 {
            reset_timeouts(&h.registry);
            h.reconciler.scan_and_wait().await;
        }
        assert_eq!(h.mock.request_count("create"), 10);
    }

    #[tokio::test]
    async fn called_flag_prevents_overlapping_workers() {
        let h = harness();
        h.mock
            .add_remote("ipps://lab.local:631/printers/lab", remote_attrs());
        h.mock.set_create_delay(Duration::from_millis(50));

        h.intake.handle_resolved(lab_service());

        let first = h.reconciler.scan().await;
        // Second scan while the first worker is still in flight.
        let second = h.reconciler.scan().await;
        assert!(second.is_empty(), "entry with called flag must be skipped");

        for handle in first {
            let _ = handle.await;
        }
        assert_eq!(h.mock.max_inflight("Lab_Printer_lab"), 1);
        assert_eq!(h.mock.request_count("create"), 1);
    }

    #[tokio::test]
    async fn transient_probe_failures_abandon_after_cap() {
        let mut config = Config::default();
        config.http_max_retries = 3;
        config.pause_between_updates_secs = 0;
        let h = harness_with(config);

        // No remote registered: every probe times out.
        h.intake.handle_resolved(lab_service());

        for _ in 0..4 {
            {
                let mut registry = h.registry.write();
                for id in registry.ids() {
                    registry.get_mut(id).unwrap().timeout = Instant::now();
                }
            }
            h.reconciler.scan_and_wait().await;
        }

        let registry = h.registry.read();
        let entry = registry.get(registry.ids()[0]).unwrap();
        assert!(entry.abandoned);
        assert_eq!(entry.status, EntryStatus::ToBeCreated);
        assert_eq!(h.mock.request_count("create"), 0);
    }

    #[tokio::test]
    async fn refused_probe_disappears_entry() {
        let h = harness();
        h.mock.refuse_probe("ipps://lab.local:631/printers/lab");

        h.intake.handle_resolved(lab_service());
        h.reconciler.scan_and_wait().await;

        let registry = h.registry.read();
        let entry = registry.get(registry.ids()[0]).unwrap();
        assert_eq!(entry.status, EntryStatus::Disappeared);
    }

    #[tokio::test]
    async fn busy_queue_is_disabled_not_deleted() {
        let h = harness();
        h.mock
            .add_remote("ipps://lab.local:631/printers/lab", remote_attrs());
        h.intake.handle_resolved(lab_service());
        h.reconciler.scan_and_wait().await;

        h.mock.set_jobs(
            "Lab_Printer_lab",
            vec![JobInfo {
                id: 11,
                name: "report.pdf".into(),
                state: "processing".into(),
            }],
        );
        h.intake.handle_removed("Lab Printer @ lab", Transport::Ipps);
        reset_timeouts(&h.registry);
        h.reconciler.scan_and_wait().await;

        // Still present on the scheduler, but paused.
        let queue = h.mock.queue_snapshot("Lab_Printer_lab").expect("kept");
        assert_eq!(queue.state, druckwerk_core::PrinterState::Stopped);
        assert!(queue.state_message.contains("waiting for remaining jobs"));
        assert_eq!(h.mock.request_count("delete"), 0);
        assert_eq!(h.registry.read().len(), 1);

        // Jobs drain; the next pass removes the queue.
        h.mock.set_jobs("Lab_Printer_lab", Vec::new());
        reset_timeouts(&h.registry);
        h.reconciler.scan_and_wait().await;
        assert!(h.mock.queue_snapshot("Lab_Printer_lab").is_none());
        assert!(h.registry.read().is_empty());
    }

    #[tokio::test]
    async fn master_removal_promotes_slave_and_keeps_queue() {
        let h = harness();
        h.mock
            .add_remote("ipps://host-a.local:631/ipp/print", remote_attrs());
        h.mock
            .add_remote("ipps://host-b.local:631/ipp/print", remote_attrs());

        // Two printers deriving the same name cluster automatically.
        for host in ["host-a.local", "host-b.local"] {
            let mut svc = lab_service();
            svc.service_name = "Example MFG 9000".into();
            svc.host = host.into();
            svc.txt.remove("printer-type");
            svc.txt.insert("rp".into(), "ipp/print".into());
            h.intake.handle_resolved(svc);
        }
        h.reconciler.scan_and_wait().await;

        let queue = h.mock.queue_snapshot("Example_MFG_9000").expect("cluster queue");
        assert_eq!(queue.device_uri, "implicitclass:Example_MFG_9000");

        // The master's announcement goes away; its slave takes over.
        h.intake.handle_removed("Example MFG 9000", Transport::Ipps);
        reset_timeouts(&h.registry);
        h.reconciler.scan_and_wait().await;

        let queue = h.mock.queue_snapshot("Example_MFG_9000").expect("queue survives");
        assert_eq!(queue.device_uri, "ipps://host-b.local:631/ipp/print");

        let registry = h.registry.read();
        assert_eq!(registry.len(), 1);
        let survivor = registry.get(registry.ids()[0]).unwrap();
        assert_eq!(survivor.status, EntryStatus::Confirmed);
        assert!(survivor.slave_of.is_none());
    }

    #[tokio::test]
    async fn overwritten_uri_releases_and_renames() {
        let h = harness();
        h.mock
            .add_remote("ipps://lab.local:631/printers/lab", remote_attrs());
        h.intake.handle_resolved(lab_service());
        h.reconciler.scan_and_wait().await;

        // An external actor repoints our queue.
        let mut queue = h.mock.queue_snapshot("Lab_Printer_lab").unwrap();
        queue.device_uri = "socket://printer/".into();
        h.mock.add_queue(queue);

        reset_timeouts(&h.registry);
        h.reconciler.scan_and_wait().await;
        // Second pass creates the renamed queue and frees the released entry.
        reset_timeouts(&h.registry);
        h.reconciler.scan_and_wait().await;

        // The original queue is left to its new owner.
        let original = h.mock.queue_snapshot("Lab_Printer_lab").expect("untouched");
        assert_eq!(original.device_uri, "socket://printer/");

        let renamed = h
            .mock
            .queue_snapshot("Lab_Printer_lab@lab_local")
            .expect("renamed queue");
        assert_eq!(renamed.device_uri, "ipps://lab.local:631/printers/lab");

        let registry = h.registry.read();
        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.get(registry.ids()[0]).unwrap().queue_name,
            "Lab_Printer_lab@lab_local"
        );
    }

    #[tokio::test]
    async fn saved_options_are_restored_on_recreate() {
        let h = harness();
        h.mock
            .add_remote("ipps://lab.local:631/printers/lab", remote_attrs());
        h.intake.handle_resolved(lab_service());
        h.reconciler.scan_and_wait().await;

        // The create path carried the remote's media default onto the queue;
        // removal persists it.
        h.intake.handle_removed("Lab Printer @ lab", Transport::Ipps);
        reset_timeouts(&h.registry);
        h.reconciler.scan_and_wait().await;
        assert!(h.mock.queue_snapshot("Lab_Printer_lab").is_none());
        let saved = h.options.load_queue_options("Lab_Printer_lab");
        assert_eq!(
            saved.get("media-default").map(String::as_str),
            Some("iso_a4_210x297mm")
        );

        // Re-discovery recreates the queue with the snapshot applied.
        h.intake.handle_resolved(lab_service());
        h.reconciler.scan_and_wait().await;
        let queue = h.mock.queue_snapshot("Lab_Printer_lab").expect("recreated");
        assert_eq!(
            queue.options.get("media-default").map(String::as_str),
            Some("iso_a4_210x297mm")
        );
    }

    #[tokio::test]
    async fn default_queue_survives_while_notifications_down() {
        let h = harness();
        h.mock
            .add_remote("ipps://lab.local:631/printers/lab", remote_attrs());
        h.intake.handle_resolved(lab_service());
        h.reconciler.scan_and_wait().await;
        h.mock.set_default("Lab_Printer_lab").await.unwrap();

        h.notifications_active.store(false, Ordering::SeqCst);
        h.intake.handle_removed("Lab Printer @ lab", Transport::Ipps);
        reset_timeouts(&h.registry);
        h.reconciler.scan_and_wait().await;

        let queue = h.mock.queue_snapshot("Lab_Printer_lab").expect("kept");
        assert_eq!(queue.state, druckwerk_core::PrinterState::Stopped);
        assert_eq!(h.mock.request_count("delete"), 0);
    }

    #[tokio::test]
    async fn shutdown_cleanup_removes_managed_queues() {
        let h = harness();
        h.mock
            .add_remote("ipps://lab.local:631/printers/lab", remote_attrs());
        h.intake.handle_resolved(lab_service());
        h.reconciler.scan_and_wait().await;
        assert!(h.mock.queue_snapshot("Lab_Printer_lab").is_some());

        h.reconciler.shutdown_cleanup().await;
        assert!(h.mock.queue_snapshot("Lab_Printer_lab").is_none());
        assert!(h.registry.read().is_empty());
    }

    #[tokio::test]
    async fn shutdown_cleanup_respects_keep_flag() {
        let mut config = Config::default();
        config.keep_generated_queues_on_shutdown = true;
        let h = harness_with(config);
        h.mock
            .add_remote("ipps://lab.local:631/printers/lab", remote_attrs());
        h.intake.handle_resolved(lab_service());
        h.reconciler.scan_and_wait().await;

        h.reconciler.shutdown_cleanup().await;
        assert!(h.mock.queue_snapshot("Lab_Printer_lab").is_some());
    }
}
