// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// In-memory scheduler for test suites.
//
// Holds queues, jobs, remote printer attribute sets, and a request log so
// tests can assert what the reconciler and dispatcher actually sent.
// Failure injection covers transient create failures and permanent probe
// refusals.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use druckwerk_core::error::{DruckwerkError, Result};
use druckwerk_core::PrinterAttributes;

use crate::client::{JobInfo, LocalQueue, QueueSpec, RemoteQueueInfo, Scheduler, MARK_OPTION};
use crate::events::SchedulerEvent;

#[derive(Default)]
struct MockState {
    queues: HashMap<String, LocalQueue>,
    jobs: HashMap<String, Vec<JobInfo>>,
    default: Option<String>,
    remotes: HashMap<String, PrinterAttributes>,
    remote_servers: HashMap<String, Vec<RemoteQueueInfo>>,
    job_attrs: HashMap<(String, i32), PrinterAttributes>,
    pending_events: Vec<SchedulerEvent>,
    requests: Vec<String>,
    fail_creates: u32,
    refused_probes: Vec<String>,
    next_subscription: i32,
    inflight: HashMap<String, usize>,
    max_inflight: HashMap<String, usize>,
}

/// Scriptable in-memory `Scheduler`.
#[derive(Default)]
pub struct MockScheduler {
    state: Mutex<MockState>,
    create_delay: Mutex<Option<Duration>>,
}

impl MockScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    // -- scripting ----------------------------------------------------------

    pub fn add_queue(&self, queue: LocalQueue) {
        self.state.lock().queues.insert(queue.name.clone(), queue);
    }

    pub fn set_jobs(&self, name: &str, jobs: Vec<JobInfo>) {
        self.state.lock().jobs.insert(name.to_string(), jobs);
    }

    /// Register a remote printer reachable through `probe_printer`.
    pub fn add_remote(&self, uri: &str, attrs: PrinterAttributes) {
        self.state.lock().remotes.insert(uri.to_string(), attrs);
    }

    /// Register a pollable remote scheduler with its exported queues.
    pub fn add_remote_server(&self, server: &str, queues: Vec<RemoteQueueInfo>) {
        self.state
            .lock()
            .remote_servers
            .insert(server.to_string(), queues);
    }

    /// Fail the next `n` create/modify requests with a transient error.
    pub fn fail_next_creates(&self, n: u32) {
        self.state.lock().fail_creates = n;
    }

    /// Answer probes of `uri` with a permanent refusal.
    pub fn refuse_probe(&self, uri: &str) {
        self.state.lock().refused_probes.push(uri.to_string());
    }

    /// Script the attribute set returned for one job.
    pub fn set_job_attributes(&self, queue: &str, job_id: i32, attrs: PrinterAttributes) {
        self.state
            .lock()
            .job_attrs
            .insert((queue.to_string(), job_id), attrs);
    }

    pub fn push_event(&self, event: SchedulerEvent) {
        self.state.lock().pending_events.push(event);
    }

    /// Stretch create/modify calls so overlap tests can observe concurrency.
    pub fn set_create_delay(&self, delay: Duration) {
        *self.create_delay.lock() = Some(delay);
    }

    // -- inspection ---------------------------------------------------------

    pub fn requests(&self) -> Vec<String> {
        self.state.lock().requests.clone()
    }

    pub fn request_count(&self, prefix: &str) -> usize {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|r| r.starts_with(prefix))
            .count()
    }

    pub fn clear_requests(&self) {
        self.state.lock().requests.clear();
    }

    pub fn queue_snapshot(&self, name: &str) -> Option<LocalQueue> {
        self.state.lock().queues.get(name).cloned()
    }

    /// Highest number of concurrent create/modify calls seen for a queue.
    pub fn max_inflight(&self, name: &str) -> usize {
        self.state.lock().max_inflight.get(name).copied().unwrap_or(0)
    }

    fn log(&self, line: String) {
        self.state.lock().requests.push(line);
    }
}

#[async_trait]
impl Scheduler for MockScheduler {
    async fn queues(&self) -> Result<Vec<LocalQueue>> {
        Ok(self.state.lock().queues.values().cloned().collect())
    }

    async fn queue(&self, name: &str) -> Result<Option<LocalQueue>> {
        Ok(self.state.lock().queues.get(name).cloned())
    }

    async fn create_or_modify_queue(&self, spec: &QueueSpec) -> Result<()> {
        let delay = *self.create_delay.lock();
        {
            let mut state = self.state.lock();
            let count = state.inflight.entry(spec.name.clone()).or_insert(0);
            *count += 1;
            let current = *count;
            let max = state.max_inflight.entry(spec.name.clone()).or_insert(0);
            *max = (*max).max(current);
        }

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if let Some(count) = state.inflight.get_mut(&spec.name) {
            *count -= 1;
        }
        state.requests.push(format!("create {}", spec.name));

        if state.fail_creates > 0 {
            state.fail_creates -= 1;
            return Err(DruckwerkError::IppTimeout(format!(
                "create {} (scripted)",
                spec.name
            )));
        }

        let existing = state.queues.get(&spec.name);
        let mut options: HashMap<String, String> = spec.options.clone();
        options.insert(MARK_OPTION.to_string(), "true".to_string());
        let queue = LocalQueue {
            name: spec.name.clone(),
            device_uri: spec.device_uri.clone(),
            info: spec.info.clone(),
            location: spec.location.clone(),
            is_shared: spec.is_shared,
            is_accepting: true,
            state: existing.map(|q| q.state).unwrap_or_default(),
            state_message: String::new(),
            nickname: spec
                .options
                .get("printer-make-and-model")
                .cloned()
                .unwrap_or_else(|| {
                    existing
                        .map(|q| q.nickname.clone())
                        .unwrap_or_default()
                }),
            is_temporary: false,
            is_default: existing.map(|q| q.is_default).unwrap_or(false),
            uuid: existing.and_then(|q| q.uuid),
            options,
        };
        state.queues.insert(spec.name.clone(), queue);
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.requests.push(format!("delete {name}"));
        state.queues.remove(name);
        state.jobs.remove(name);
        Ok(())
    }

    async fn pause_queue(&self, name: &str, message: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.requests.push(format!("pause {name}"));
        if let Some(queue) = state.queues.get_mut(name) {
            queue.state = druckwerk_core::PrinterState::Stopped;
            queue.state_message = message.to_string();
        }
        Ok(())
    }

    async fn resume_queue(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.requests.push(format!("resume {name}"));
        if let Some(queue) = state.queues.get_mut(name) {
            queue.state = druckwerk_core::PrinterState::Idle;
            queue.state_message.clear();
        }
        Ok(())
    }

    async fn active_jobs(&self, name: &str) -> Result<Vec<JobInfo>> {
        Ok(self.state.lock().jobs.get(name).cloned().unwrap_or_default())
    }

    async fn job_attributes(&self, name: &str, job_id: i32) -> Result<PrinterAttributes> {
        Ok(self
            .state
            .lock()
            .job_attrs
            .get(&(name.to_string(), job_id))
            .cloned()
            .unwrap_or_default())
    }

    async fn set_default(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.requests.push(format!("set-default {name}"));
        state.default = Some(name.to_string());
        Ok(())
    }

    async fn default_queue(&self) -> Result<Option<String>> {
        Ok(self.state.lock().default.clone())
    }

    async fn set_shared(&self, name: &str, shared: bool) -> Result<()> {
        let mut state = self.state.lock();
        state.requests.push(format!("set-shared {name} {shared}"));
        if let Some(queue) = state.queues.get_mut(name) {
            queue.is_shared = shared;
        }
        Ok(())
    }

    async fn set_queue_option(&self, name: &str, key: &str, value: &str) -> Result<()> {
        let mut state = self.state.lock();
        state
            .requests
            .push(format!("set-option {name} {key}={value}"));
        if let Some(queue) = state.queues.get_mut(name) {
            queue.options.insert(key.to_string(), value.to_string());
            Ok(())
        } else {
            Err(DruckwerkError::SchedulerRefused(format!(
                "no queue {name}"
            )))
        }
    }

    async fn probe_printer(&self, uri: &str) -> Result<PrinterAttributes> {
        let state = self.state.lock();
        if state.refused_probes.iter().any(|u| u == uri) {
            return Err(DruckwerkError::SchedulerRefused(format!(
                "client-error-not-possible for {uri}"
            )));
        }
        state
            .remotes
            .get(uri)
            .cloned()
            .ok_or_else(|| DruckwerkError::IppTimeout(format!("no route to {uri}")))
    }

    async fn remote_queues(&self, server: &str) -> Result<Vec<RemoteQueueInfo>> {
        let state = self.state.lock();
        state
            .remote_servers
            .get(server)
            .cloned()
            .ok_or_else(|| DruckwerkError::IppTimeout(format!("no route to {server}")))
    }

    async fn create_subscription(&self, _lease: Duration) -> Result<i32> {
        let mut state = self.state.lock();
        state.next_subscription += 1;
        state.requests.push(format!("subscribe {}", state.next_subscription));
        Ok(state.next_subscription)
    }

    async fn renew_subscription(&self, id: i32, _lease: Duration) -> Result<()> {
        self.log(format!("renew {id}"));
        Ok(())
    }

    async fn cancel_subscription(&self, id: i32) -> Result<()> {
        self.log(format!("unsubscribe {id}"));
        Ok(())
    }

    async fn notifications(&self, _id: i32, sequence: i32) -> Result<(Vec<SchedulerEvent>, i32)> {
        let mut state = self.state.lock();
        let events = std::mem::take(&mut state.pending_events);
        let next = sequence + events.len() as i32;
        Ok((events, next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_and_inspect() {
        let mock = MockScheduler::new();
        let spec = QueueSpec {
            name: "lab".into(),
            device_uri: "ipps://lab.local:631/printers/lab".into(),
            info: "Lab Printer".into(),
            is_shared: true,
            ..QueueSpec::default()
        };
        mock.create_or_modify_queue(&spec).await.unwrap();

        let queue = mock.queue_snapshot("lab").unwrap();
        assert!(queue.is_managed());
        assert_eq!(queue.device_uri, "ipps://lab.local:631/printers/lab");
        assert_eq!(mock.request_count("create"), 1);
    }

    #[tokio::test]
    async fn scripted_create_failure_is_transient() {
        let mock = MockScheduler::new();
        mock.fail_next_creates(1);
        let spec = QueueSpec {
            name: "lab".into(),
            ..QueueSpec::default()
        };
        let err = mock.create_or_modify_queue(&spec).await.unwrap_err();
        assert!(err.is_transient());
        assert!(mock.create_or_modify_queue(&spec).await.is_ok());
    }

    #[tokio::test]
    async fn probe_refusal_is_permanent() {
        let mock = MockScheduler::new();
        mock.refuse_probe("ipp://gone.local:631/ipp/print");
        let err = mock
            .probe_printer("ipp://gone.local:631/ipp/print")
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn notifications_drain_queue() {
        let mock = MockScheduler::new();
        mock.push_event(SchedulerEvent::PrinterDeleted { name: "lab".into() });
        let id = mock.create_subscription(Duration::from_secs(60)).await.unwrap();

        let (events, next) = mock.notifications(id, 1).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(next, 2);

        let (events, _) = mock.notifications(id, next).await.unwrap();
        assert!(events.is_empty());
    }
}
