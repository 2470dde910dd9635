// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Periodic polling of remote print schedulers.
//
// Each configured server is asked for its exported queues on every browse
// interval; the results flow through the same intake as DNS-SD events.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, warn};

use druckwerk_cups::Scheduler;

use crate::intake::Intake;

/// Polls remote schedulers on the browse interval.
pub struct Poller {
    servers: Vec<String>,
    interval: Duration,
    scheduler: Arc<dyn Scheduler>,
    intake: Arc<Intake>,
}

impl Poller {
    pub fn new(
        servers: Vec<String>,
        interval: Duration,
        scheduler: Arc<dyn Scheduler>,
        intake: Arc<Intake>,
    ) -> Self {
        Self {
            servers,
            interval,
            scheduler,
            intake,
        }
    }

    /// Poll every server once.
    pub async fn poll_once(&self) {
        for server in &self.servers {
            match self.scheduler.remote_queues(server).await {
                Ok(queues) => {
                    debug!(server = %server, count = queues.len(), "poll answered");
                    self.intake.handle_poll(server, queues);
                }
                Err(e) => {
                    // An unreachable server is a normal condition; its
                    // entries age out through the registry timeouts.
                    warn!(server = %server, error = %e, "poll failed");
                }
            }
        }
    }

    /// Poll on the browse interval until shutdown.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        if self.servers.is_empty() {
            return;
        }
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.poll_once().await,
                _ = shutdown.recv() => {
                    debug!("poller stopping");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use druckwerk_core::Config;
    use druckwerk_cups::{MockScheduler, RemoteQueueInfo};
    use druckwerk_net::NetifTracker;
    use druckwerk_registry::Registry;
    use parking_lot::RwLock;

    #[tokio::test]
    async fn poll_feeds_registry_through_intake() {
        let mock = Arc::new(MockScheduler::new());
        mock.add_remote_server(
            "ipp://printserver.example.com:631",
            vec![RemoteQueueInfo {
                uri: "ipp://printserver.example.com:631/printers/lab".into(),
                location: "Basement".into(),
                info: "Lab printer".into(),
            }],
        );

        let registry = Arc::new(RwLock::new(Registry::new()));
        let intake = Arc::new(Intake::new(
            &Config::default(),
            Arc::new(NetifTracker::new("workstation.example.com")),
            Arc::clone(&registry),
        ));

        let poller = Poller::new(
            vec!["ipp://printserver.example.com:631".into()],
            Duration::from_secs(60),
            mock,
            intake,
        );
        poller.poll_once().await;

        let registry = registry.read();
        assert_eq!(registry.len(), 1);
        let entry = registry.get(registry.ids()[0]).unwrap();
        assert!(entry.cups_queue);
        assert_eq!(entry.uri, "ipp://printserver.example.com:631/printers/lab");
    }

    #[tokio::test]
    async fn unreachable_server_is_tolerated() {
        let mock = Arc::new(MockScheduler::new());
        let registry = Arc::new(RwLock::new(Registry::new()));
        let intake = Arc::new(Intake::new(
            &Config::default(),
            Arc::new(NetifTracker::new("workstation.example.com")),
            Arc::clone(&registry),
        ));
        let poller = Poller::new(
            vec!["ipp://gone.example.com:631".into()],
            Duration::from_secs(60),
            mock,
            intake,
        );
        poller.poll_once().await;
        assert!(registry.read().is_empty());
    }
}
