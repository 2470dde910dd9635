// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Daemon wiring and the main event loop.
//
// Discovery events, scheduler notifications, and timer ticks all run on
// their own tasks; the main loop only routes discovery events into the
// intake and waits for shutdown.  Termination runs a final reconciliation
// pass that removes managed queues unless configured otherwise.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use druckwerk_core::error::Result;
use druckwerk_core::{
    AddrFamily, Config, DiscoveryInstance, DiscoveryOrigin, Transport,
};
use druckwerk_cups::{LocalQueue, Scheduler};
use druckwerk_discovery::{DiscoveryEvent, DnsSdBrowser, Intake, Poller};
use druckwerk_net::NetifTracker;
use druckwerk_registry::Registry;

use crate::autoshutdown::AutoShutdown;
use crate::dispatch::Dispatcher;
use crate::notifications::NotificationHandler;
use crate::options::OptionStore;
use crate::reconciler::Reconciler;

pub struct Daemon {
    config: Arc<Config>,
    registry: Arc<RwLock<Registry>>,
    intake: Arc<Intake>,
    reconciler: Arc<Reconciler>,
    notifications: Arc<NotificationHandler>,
    autoshutdown: Arc<AutoShutdown>,
    poller: Option<Poller>,
    terminating: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Daemon {
    /// Wire all components.
    ///
    /// Fails when the local scheduler cannot be reached even once; that is
    /// the one fatal initialization error.
    pub async fn new(
        config: Config,
        scheduler: Arc<dyn Scheduler>,
        hostname: String,
    ) -> Result<Self> {
        let existing = scheduler.queues().await?;

        let config = Arc::new(config);
        let registry = Arc::new(RwLock::new(Registry::new()));
        let netifs = Arc::new(NetifTracker::new(hostname));
        let intake = Arc::new(Intake::new(&config, netifs, Arc::clone(&registry)));
        let options = Arc::new(OptionStore::new(&config.cache_dir)?);
        let notifications_active = Arc::new(AtomicBool::new(false));
        let terminating = Arc::new(AtomicBool::new(false));
        let (shutdown_tx, _) = broadcast::channel(4);

        recover_managed_queues(&registry, &existing, &config);

        let reconciler = Reconciler::new(
            Arc::clone(&registry),
            Arc::clone(&scheduler),
            Arc::clone(&intake),
            Arc::clone(&options),
            Arc::clone(&config),
            Arc::clone(&notifications_active),
            Arc::clone(&terminating),
        );
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&scheduler),
            config.dispatch,
        ));
        let notifications = NotificationHandler::new(
            Arc::clone(&registry),
            Arc::clone(&scheduler),
            dispatcher,
            Arc::clone(&options),
            Arc::clone(&config),
            notifications_active,
        );
        let autoshutdown = AutoShutdown::new(
            config.autoshutdown.clone(),
            Arc::clone(&registry),
            Arc::clone(&scheduler),
            shutdown_tx.clone(),
        );
        let poller = config.browse_poll.then(|| {
            Poller::new(
                config.poll_servers.clone(),
                config.browse_interval(),
                Arc::clone(&scheduler),
                Arc::clone(&intake),
            )
        });

        Ok(Self {
            config,
            registry,
            intake,
            reconciler,
            notifications,
            autoshutdown,
            poller,
            terminating,
            shutdown_tx,
        })
    }

    /// Run until a shutdown signal or auto-shutdown fires.
    pub async fn run(mut self) -> Result<()> {
        let (discovery_tx, mut discovery_rx) = mpsc::unbounded_channel();

        let mut browser = if self.config.browse_dnssd {
            match DnsSdBrowser::new() {
                Ok(mut browser) => match browser.start(discovery_tx.clone()) {
                    Ok(()) => Some(browser),
                    Err(e) => {
                        warn!(error = %e, "DNS-SD browsing unavailable");
                        None
                    }
                },
                Err(e) => {
                    warn!(error = %e, "mDNS daemon unavailable");
                    None
                }
            }
        } else {
            None
        };
        if browser.is_none() {
            self.autoshutdown.set_dnssd_present(false);
        }

        self.notifications.prime_default().await;

        tokio::spawn(
            Arc::clone(&self.reconciler).run(self.shutdown_tx.subscribe()),
        );
        tokio::spawn(
            Arc::clone(&self.notifications).run(self.shutdown_tx.subscribe()),
        );
        tokio::spawn(
            Arc::clone(&self.autoshutdown).run(self.shutdown_tx.subscribe()),
        );
        if let Some(poller) = self.poller.take() {
            tokio::spawn(poller.run(self.shutdown_tx.subscribe()));
        }
        spawn_signal_tasks(self.shutdown_tx.clone(), Arc::clone(&self.autoshutdown));

        info!("druckwerkd running");
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                event = discovery_rx.recv() => {
                    match event {
                        Some(DiscoveryEvent::Resolved(service)) => {
                            self.intake.handle_resolved(service);
                        }
                        Some(DiscoveryEvent::Removed { service_name, transport }) => {
                            self.intake.handle_removed(&service_name, transport);
                        }
                        Some(DiscoveryEvent::DaemonGone) => {
                            warn!("DNS-SD daemon disappeared");
                            self.autoshutdown.set_dnssd_present(false);
                            self.registry
                                .write()
                                .demote_dnssd_entries(self.config.browse_timeout());
                        }
                        Some(DiscoveryEvent::DaemonBack) => {
                            info!("DNS-SD daemon returned");
                            self.autoshutdown.set_dnssd_present(true);
                        }
                        None => {
                            // All browse threads ended without a shutdown
                            // request; the channel stays closed.
                            self.autoshutdown.set_dnssd_present(false);
                            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                        }
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }

        info!("shutting down");
        self.terminating.store(true, Ordering::SeqCst);
        if let Some(browser) = browser.take() {
            let _ = browser.shutdown();
        }
        self.reconciler.shutdown_cleanup().await;
        info!("goodbye");
        Ok(())
    }
}

/// Re-adopt queues carrying our mark option from a previous session.
///
/// Each becomes an *unconfirmed* entry that a discovery must confirm within
/// the browse timeout.
fn recover_managed_queues(
    registry: &Arc<RwLock<Registry>>,
    queues: &[LocalQueue],
    config: &Config,
) {
    let deadline = Instant::now() + config.browse_timeout();
    let mut registry = registry.write();
    for queue in queues.iter().filter(|q| q.is_managed()) {
        let cluster = queue.device_uri.starts_with("implicitclass:");
        let instance = instance_from_device_uri(&queue.device_uri);
        registry.recover(queue.name.clone(), instance, cluster, deadline);
    }
}

/// Best-effort instance from a persisted device URI.
///
/// `implicitclass:` URIs carry no host; the placeholder is replaced by the
/// first matching discovery.
fn instance_from_device_uri(device_uri: &str) -> DiscoveryInstance {
    let (transport, rest) = if let Some(rest) = device_uri.strip_prefix("ipps://") {
        (Transport::Ipps, Some(rest))
    } else if let Some(rest) = device_uri.strip_prefix("ipp://") {
        (Transport::Ipp, Some(rest))
    } else {
        (Transport::Ipp, None)
    };

    let (host, port, resource) = rest
        .and_then(|rest| {
            let (authority, resource) = rest.split_once('/').unwrap_or((rest, ""));
            let (host, port) = match authority.rsplit_once(':') {
                Some((h, p)) => (h.to_string(), p.parse().unwrap_or(631)),
                None => (authority.to_string(), 631),
            };
            (!host.is_empty()).then_some((host, port, resource.to_string()))
        })
        .unwrap_or_default();

    DiscoveryInstance {
        origin: DiscoveryOrigin::Poll,
        transport,
        family: AddrFamily::V4,
        interface: "any".into(),
        service_name: String::new(),
        domain: String::new(),
        host,
        ip: None,
        port,
        resource,
    }
}

/// SIGTERM/Ctrl+C request shutdown; SIGUSR1/SIGUSR2 toggle auto-shutdown.
fn spawn_signal_tasks(shutdown_tx: broadcast::Sender<()>, autoshutdown: Arc<AutoShutdown>) {
    tokio::spawn(async move {
        wait_for_stop_signal().await;
        info!("termination signal received");
        let _ = shutdown_tx.send(());
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let controller = Arc::clone(&autoshutdown);
        tokio::spawn(async move {
            let Ok(mut usr1) = signal(SignalKind::user_defined1()) else {
                return;
            };
            while usr1.recv().await.is_some() {
                controller.set_enabled(true);
            }
        });
        tokio::spawn(async move {
            let Ok(mut usr2) = signal(SignalKind::user_defined2()) else {
                return;
            };
            while usr2.recv().await.is_some() {
                autoshutdown.set_enabled(false);
            }
        });
    }
    #[cfg(not(unix))]
    let _ = autoshutdown;
}

async fn wait_for_stop_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_uri_parsing_for_recovery() {
        let inst = instance_from_device_uri("ipps://lab.local:631/printers/lab");
        assert_eq!(inst.transport, Transport::Ipps);
        assert_eq!(inst.host, "lab.local");
        assert_eq!(inst.port, 631);
        assert_eq!(inst.resource, "printers/lab");

        let inst = instance_from_device_uri("implicitclass:office");
        assert!(inst.host.is_empty());
    }

    #[tokio::test]
    async fn init_fails_without_scheduler() {
        struct DeadScheduler;

        #[async_trait::async_trait]
        impl Scheduler for DeadScheduler {
            async fn queues(&self) -> Result<Vec<LocalQueue>> {
                Err(druckwerk_core::DruckwerkError::IppTimeout("no scheduler".into()))
            }
            async fn queue(&self, _: &str) -> Result<Option<LocalQueue>> {
                unimplemented!()
            }
            async fn create_or_modify_queue(
                &self,
                _: &druckwerk_cups::QueueSpec,
            ) -> Result<()> {
                unimplemented!()
            }
            async fn delete_queue(&self, _: &str) -> Result<()> {
                unimplemented!()
            }
            async fn pause_queue(&self, _: &str, _: &str) -> Result<()> {
                unimplemented!()
            }
            async fn resume_queue(&self, _: &str) -> Result<()> {
                unimplemented!()
            }
            async fn active_jobs(&self, _: &str) -> Result<Vec<druckwerk_cups::JobInfo>> {
                unimplemented!()
            }
            async fn job_attributes(
                &self,
                _: &str,
                _: i32,
            ) -> Result<druckwerk_core::PrinterAttributes> {
                unimplemented!()
            }
            async fn set_default(&self, _: &str) -> Result<()> {
                unimplemented!()
            }
            async fn default_queue(&self) -> Result<Option<String>> {
                unimplemented!()
            }
            async fn set_shared(&self, _: &str, _: bool) -> Result<()> {
                unimplemented!()
            }
            async fn set_queue_option(&self, _: &str, _: &str, _: &str) -> Result<()> {
                unimplemented!()
            }
            async fn probe_printer(&self, _: &str) -> Result<druckwerk_core::PrinterAttributes> {
                unimplemented!()
            }
            async fn remote_queues(
                &self,
                _: &str,
            ) -> Result<Vec<druckwerk_cups::RemoteQueueInfo>> {
                unimplemented!()
            }
            async fn create_subscription(&self, _: std::time::Duration) -> Result<i32> {
                unimplemented!()
            }
            async fn renew_subscription(&self, _: i32, _: std::time::Duration) -> Result<()> {
                unimplemented!()
            }
            async fn cancel_subscription(&self, _: i32) -> Result<()> {
                unimplemented!()
            }
            async fn notifications(
                &self,
                _: i32,
                _: i32,
            ) -> Result<(Vec<druckwerk_cups::SchedulerEvent>, i32)> {
                unimplemented!()
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.cache_dir = dir.path().to_path_buf();
        let result = Daemon::new(config, Arc::new(DeadScheduler), "host".into()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn recovery_adopts_marked_queues() {
        let mock = Arc::new(druckwerk_cups::MockScheduler::new());
        mock.create_or_modify_queue(&druckwerk_cups::QueueSpec {
            name: "Lab_Printer_lab".into(),
            device_uri: "ipps://lab.local:631/printers/lab".into(),
            ..druckwerk_cups::QueueSpec::default()
        })
        .await
        .unwrap();
        // A foreign queue without the mark option is left alone.
        mock.add_queue(LocalQueue {
            name: "office".into(),
            device_uri: "usb://local".into(),
            ..LocalQueue::default()
        });

        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.cache_dir = dir.path().to_path_buf();
        let daemon = Daemon::new(config, Arc::clone(&mock) as Arc<dyn Scheduler>, "host".into())
            .await
            .unwrap();

        let registry = daemon.registry.read();
        assert_eq!(registry.len(), 1);
        let entry = registry.get(registry.ids()[0]).unwrap();
        assert_eq!(entry.queue_name, "Lab_Printer_lab");
        assert_eq!(entry.status, druckwerk_core::EntryStatus::Unconfirmed);
    }
}
