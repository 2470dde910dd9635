// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// The `Scheduler` seam and its async IPP implementation.
//
// All queue manipulation goes through the local scheduler's IPP endpoint:
//   - CUPS-Get-Printers / Get-Printer-Attributes for inspection
//   - CUPS-Add-Modify-Printer / CUPS-Delete-Printer for reconciliation
//   - Pause-Printer / Resume-Printer for busy-queue handling
//   - Get-Jobs for active-job checks
//   - CUPS-Set-Default plus subscription operations for notifications
//
// Remote printers are probed with Get-Printer-Attributes through the same
// machinery, with the longer remote timeout.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use ipp::prelude::*;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument};

use druckwerk_core::error::{DruckwerkError, Result};
use druckwerk_core::{PrinterAttributes, PrinterState};

use crate::attrs::{flatten_attributes, is_accepting, printer_state};
use crate::events::{parse_notifications, SchedulerEvent};

/// Option marking a queue as managed by this daemon.
pub const MARK_OPTION: &str = "druckwerk";

/// Per-job dispatch option written on cluster queues.
pub const DEST_OPTION: &str = "druckwerk-dest-printer";

/// A queue as visible on the local scheduler.
#[derive(Debug, Clone, Default)]
pub struct LocalQueue {
    pub name: String,
    pub device_uri: String,
    pub info: String,
    pub location: String,
    pub is_shared: bool,
    pub is_accepting: bool,
    pub state: PrinterState,
    pub state_message: String,
    /// Make-and-model of the attached driver; used for overwrite detection.
    pub nickname: String,
    pub is_temporary: bool,
    pub is_default: bool,
    pub uuid: Option<uuid::Uuid>,
    /// Remaining per-queue attributes, including our mark option.
    pub options: HashMap<String, String>,
}

impl LocalQueue {
    /// Whether this queue carries our mark option.
    pub fn is_managed(&self) -> bool {
        self.options
            .get(MARK_OPTION)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }
}

/// A create/modify request for one queue.
#[derive(Debug, Clone, Default)]
pub struct QueueSpec {
    pub name: String,
    pub device_uri: String,
    pub info: String,
    pub location: String,
    pub is_shared: bool,
    /// Extra options; always includes the mark option.
    pub options: HashMap<String, String>,
}

/// Summary of one job on a queue.
#[derive(Debug, Clone)]
pub struct JobInfo {
    pub id: i32,
    pub name: String,
    /// IPP job-state keyword ("pending", "processing", ...).
    pub state: String,
}

/// One queue exported by a polled remote scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteQueueInfo {
    pub uri: String,
    pub location: String,
    pub info: String,
}

/// Seam to the local print scheduler (and to remote printers for probing).
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// All queues currently visible on the scheduler.
    async fn queues(&self) -> Result<Vec<LocalQueue>>;

    /// One queue by name, `None` when it does not exist.
    async fn queue(&self, name: &str) -> Result<Option<LocalQueue>>;

    /// Create the queue or modify it in place.
    async fn create_or_modify_queue(&self, spec: &QueueSpec) -> Result<()>;

    async fn delete_queue(&self, name: &str) -> Result<()>;

    /// Disable the queue with an explanatory state message.
    async fn pause_queue(&self, name: &str, message: &str) -> Result<()>;

    async fn resume_queue(&self, name: &str) -> Result<()>;

    /// Not-completed jobs on the queue.
    async fn active_jobs(&self, name: &str) -> Result<Vec<JobInfo>>;

    /// Attributes of one job (Get-Job-Attributes).
    async fn job_attributes(&self, name: &str, job_id: i32) -> Result<PrinterAttributes>;

    async fn set_default(&self, name: &str) -> Result<()>;

    async fn default_queue(&self) -> Result<Option<String>>;

    async fn set_shared(&self, name: &str, shared: bool) -> Result<()>;

    /// Set a single per-queue option (used for the dispatch option).
    async fn set_queue_option(&self, name: &str, key: &str, value: &str) -> Result<()>;

    /// Get-Printer-Attributes against an arbitrary (remote) printer URI.
    async fn probe_printer(&self, uri: &str) -> Result<PrinterAttributes>;

    /// Queues exported by a remote scheduler (CUPS-Get-Printers).
    async fn remote_queues(&self, server: &str) -> Result<Vec<RemoteQueueInfo>>;

    async fn create_subscription(&self, lease: Duration) -> Result<i32>;

    async fn renew_subscription(&self, id: i32, lease: Duration) -> Result<()>;

    async fn cancel_subscription(&self, id: i32) -> Result<()>;

    /// Poll notifications; returns decoded events and the next sequence
    /// number to ask for.
    async fn notifications(&self, id: i32, sequence: i32) -> Result<(Vec<SchedulerEvent>, i32)>;
}

/// Production implementation speaking IPP to the local scheduler.
pub struct IppScheduler {
    base: Uri,
    local_timeout: Duration,
    remote_timeout: Duration,
}

impl IppScheduler {
    /// `base` is the scheduler endpoint, e.g. `ipp://localhost:631`.
    pub fn new(base: &str, local_timeout: Duration, remote_timeout: Duration) -> Result<Self> {
        let base: Uri = base
            .parse()
            .map_err(|e| DruckwerkError::IppRequest(format!("invalid scheduler URI '{base}': {e}")))?;
        Ok(Self {
            base,
            local_timeout,
            remote_timeout,
        })
    }

    /// Printer URI for a queue name on the local scheduler.
    fn queue_uri(&self, name: &str) -> Result<Uri> {
        let authority = self
            .base
            .authority()
            .map(|a| a.as_str())
            .unwrap_or("localhost:631");
        format!("ipp://{authority}/printers/{name}")
            .parse()
            .map_err(|e| DruckwerkError::IppRequest(format!("queue URI for {name}: {e}")))
    }

    /// Send a request to the local scheduler with the local timeout.
    async fn send_local(&self, req: IppRequestResponse) -> Result<IppRequestResponse> {
        self.send(self.base.clone(), req, self.local_timeout).await
    }

    async fn send(
        &self,
        endpoint: Uri,
        req: IppRequestResponse,
        deadline: Duration,
    ) -> Result<IppRequestResponse> {
        let client = AsyncIppClient::new(endpoint);
        let response = timeout(deadline, client.send(req))
            .await
            .map_err(|_| DruckwerkError::IppTimeout(format!("no reply within {deadline:?}")))?
            .map_err(|e| DruckwerkError::IppRequest(e.to_string()))?;

        let status = response.header().status_code();
        if !status.is_success() {
            return Err(DruckwerkError::SchedulerRefused(format!("{status:?}")));
        }
        Ok(response)
    }

    fn new_request(&self, operation: Operation, uri: Option<Uri>) -> IppRequestResponse {
        IppRequestResponse::new(IppVersion::v1_1(), operation, uri)
    }
}

#[async_trait]
impl Scheduler for IppScheduler {
    #[instrument(skip(self))]
    async fn queues(&self) -> Result<Vec<LocalQueue>> {
        let req = self.new_request(Operation::CupsGetPrinters, None);
        let response = self.send_local(req).await?;

        let mut queues = Vec::new();
        for group in response
            .attributes()
            .groups_of(DelimiterTag::PrinterAttributes)
        {
            let mut flat = PrinterAttributes::new();
            for (name, attr) in group.attributes() {
                flat.insert(name.clone(), format!("{}", attr.value()));
            }
            queues.push(queue_from_attributes(flat));
        }
        debug!(count = queues.len(), "scheduler queue listing");
        Ok(queues)
    }

    async fn queue(&self, name: &str) -> Result<Option<LocalQueue>> {
        let uri = self.queue_uri(name)?;
        let req = self.new_request(Operation::GetPrinterAttributes, Some(uri));
        match self.send_local(req).await {
            Ok(response) => {
                let flat = flatten_attributes(response.attributes());
                Ok(Some(queue_from_attributes(flat)))
            }
            // The scheduler answers not-found for unknown queues.
            Err(DruckwerkError::SchedulerRefused(status))
                if status.to_ascii_lowercase().contains("not") =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self, spec), fields(queue = %spec.name, uri = %spec.device_uri))]
    async fn create_or_modify_queue(&self, spec: &QueueSpec) -> Result<()> {
        let queue_uri = self.queue_uri(&spec.name)?;
        let mut req = self.new_request(Operation::CupsAddModifyPrinter, Some(queue_uri));

        let printer = req.attributes_mut();
        printer.add(
            DelimiterTag::PrinterAttributes,
            IppAttribute::new("device-uri", IppValue::Uri(spec.device_uri.clone())),
        );
        printer.add(
            DelimiterTag::PrinterAttributes,
            IppAttribute::new(
                "printer-info",
                IppValue::TextWithoutLanguage(spec.info.clone()),
            ),
        );
        printer.add(
            DelimiterTag::PrinterAttributes,
            IppAttribute::new(
                "printer-location",
                IppValue::TextWithoutLanguage(spec.location.clone()),
            ),
        );
        printer.add(
            DelimiterTag::PrinterAttributes,
            IppAttribute::new("printer-is-shared", IppValue::Boolean(spec.is_shared)),
        );
        printer.add(
            DelimiterTag::PrinterAttributes,
            IppAttribute::new(
                "printer-state",
                IppValue::Enum(3), // idle
            ),
        );
        printer.add(
            DelimiterTag::PrinterAttributes,
            IppAttribute::new("printer-is-accepting-jobs", IppValue::Boolean(true)),
        );
        printer.add(
            DelimiterTag::PrinterAttributes,
            IppAttribute::new(MARK_OPTION, IppValue::Boolean(true)),
        );
        for (key, value) in &spec.options {
            printer.add(
                DelimiterTag::PrinterAttributes,
                IppAttribute::new(
                    key.as_str(),
                    IppValue::TextWithoutLanguage(value.clone()),
                ),
            );
        }

        info!("sending CUPS-Add-Modify-Printer");
        self.send_local(req).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_queue(&self, name: &str) -> Result<()> {
        let uri = self.queue_uri(name)?;
        let req = self.new_request(Operation::CupsDeletePrinter, Some(uri));
        info!("sending CUPS-Delete-Printer");
        self.send_local(req).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn pause_queue(&self, name: &str, message: &str) -> Result<()> {
        let uri = self.queue_uri(name)?;
        let mut req = self.new_request(Operation::PausePrinter, Some(uri));
        req.attributes_mut().add(
            DelimiterTag::OperationAttributes,
            IppAttribute::new(
                "printer-state-message",
                IppValue::TextWithoutLanguage(message.to_string()),
            ),
        );
        self.send_local(req).await?;
        Ok(())
    }

    async fn resume_queue(&self, name: &str) -> Result<()> {
        let uri = self.queue_uri(name)?;
        let req = self.new_request(Operation::ResumePrinter, Some(uri));
        self.send_local(req).await?;
        Ok(())
    }

    async fn active_jobs(&self, name: &str) -> Result<Vec<JobInfo>> {
        let uri = self.queue_uri(name)?;
        let mut req = self.new_request(Operation::GetJobs, Some(uri));
        req.attributes_mut().add(
            DelimiterTag::OperationAttributes,
            IppAttribute::new(
                "which-jobs",
                IppValue::Keyword("not-completed".to_string()),
            ),
        );
        let response = self.send_local(req).await?;

        let mut jobs = Vec::new();
        for group in response.attributes().groups_of(DelimiterTag::JobAttributes) {
            let attributes = group.attributes();
            let id = attributes.get("job-id").and_then(|a| {
                if let IppValue::Integer(id) = a.value() {
                    Some(*id)
                } else {
                    None
                }
            });
            let Some(id) = id else { continue };
            jobs.push(JobInfo {
                id,
                name: attributes
                    .get("job-name")
                    .map(|a| format!("{}", a.value()))
                    .unwrap_or_default(),
                state: attributes
                    .get("job-state")
                    .map(|a| format!("{}", a.value()))
                    .unwrap_or_else(|| "unknown".into()),
            });
        }
        Ok(jobs)
    }

    async fn job_attributes(&self, name: &str, job_id: i32) -> Result<PrinterAttributes> {
        let uri = self.queue_uri(name)?;
        let mut req = self.new_request(Operation::GetJobAttributes, Some(uri));
        req.attributes_mut().add(
            DelimiterTag::OperationAttributes,
            IppAttribute::new("job-id", IppValue::Integer(job_id)),
        );
        let response = self.send_local(req).await?;
        Ok(flatten_attributes(response.attributes()))
    }

    async fn set_default(&self, name: &str) -> Result<()> {
        let uri = self.queue_uri(name)?;
        let req = self.new_request(Operation::CupsSetDefault, Some(uri));
        info!(queue = name, "setting scheduler default queue");
        self.send_local(req).await?;
        Ok(())
    }

    async fn default_queue(&self) -> Result<Option<String>> {
        let req = self.new_request(Operation::CupsGetDefault, None);
        match self.send_local(req).await {
            Ok(response) => {
                let flat = flatten_attributes(response.attributes());
                Ok(flat.get("printer-name").cloned())
            }
            Err(DruckwerkError::SchedulerRefused(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn set_shared(&self, name: &str, shared: bool) -> Result<()> {
        let uri = self.queue_uri(name)?;
        let mut req = self.new_request(Operation::CupsAddModifyPrinter, Some(uri));
        req.attributes_mut().add(
            DelimiterTag::PrinterAttributes,
            IppAttribute::new("printer-is-shared", IppValue::Boolean(shared)),
        );
        self.send_local(req).await?;
        Ok(())
    }

    async fn set_queue_option(&self, name: &str, key: &str, value: &str) -> Result<()> {
        let uri = self.queue_uri(name)?;
        let mut req = self.new_request(Operation::CupsAddModifyPrinter, Some(uri));
        req.attributes_mut().add(
            DelimiterTag::PrinterAttributes,
            IppAttribute::new(key, IppValue::TextWithoutLanguage(value.to_string())),
        );
        self.send_local(req).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn remote_queues(&self, server: &str) -> Result<Vec<RemoteQueueInfo>> {
        let endpoint: Uri = server.parse().map_err(|e| {
            DruckwerkError::IppRequest(format!("invalid server URI '{server}': {e}"))
        })?;
        let req = self.new_request(Operation::CupsGetPrinters, None);

        debug!("polling remote scheduler");
        let response = self.send(endpoint, req, self.remote_timeout).await?;

        let mut queues = Vec::new();
        for group in response
            .attributes()
            .groups_of(DelimiterTag::PrinterAttributes)
        {
            let attributes = group.attributes();
            let get = |key: &str| {
                attributes
                    .get(key)
                    .map(|a| format!("{}", a.value()))
                    .unwrap_or_default()
            };
            let uri = get("printer-uri-supported");
            if uri.is_empty() {
                continue;
            }
            queues.push(RemoteQueueInfo {
                uri,
                location: get("printer-location"),
                info: get("printer-info"),
            });
        }
        debug!(count = queues.len(), "remote scheduler answered poll");
        Ok(queues)
    }

    #[instrument(skip(self))]
    async fn probe_printer(&self, uri: &str) -> Result<PrinterAttributes> {
        let target: Uri = uri
            .parse()
            .map_err(|e| DruckwerkError::IppRequest(format!("invalid printer URI '{uri}': {e}")))?;
        let req = self.new_request(Operation::GetPrinterAttributes, Some(target.clone()));

        debug!("sending Get-Printer-Attributes");
        let response = self.send(target, req, self.remote_timeout).await?;
        let attrs = flatten_attributes(response.attributes());
        debug!(count = attrs.len(), "received printer attributes");
        Ok(attrs)
    }

    async fn create_subscription(&self, lease: Duration) -> Result<i32> {
        let mut req = self.new_request(Operation::CreatePrinterSubscriptions, Some(self.base.clone()));
        let events = vec![
            IppValue::Keyword("printer-added".into()),
            IppValue::Keyword("printer-modified".into()),
            IppValue::Keyword("printer-deleted".into()),
            IppValue::Keyword("printer-state-changed".into()),
            IppValue::Keyword("job-state".into()),
        ];
        req.attributes_mut().add(
            DelimiterTag::SubscriptionAttributes,
            IppAttribute::new("notify-events", IppValue::Array(events)),
        );
        req.attributes_mut().add(
            DelimiterTag::SubscriptionAttributes,
            IppAttribute::new(
                "notify-pull-method",
                IppValue::Keyword("ippget".to_string()),
            ),
        );
        req.attributes_mut().add(
            DelimiterTag::SubscriptionAttributes,
            IppAttribute::new(
                "notify-lease-duration",
                IppValue::Integer(lease.as_secs() as i32),
            ),
        );

        let response = self.send_local(req).await?;
        let flat = flatten_attributes(response.attributes());
        let id = flat
            .get("notify-subscription-id")
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| {
                error!("subscription response missing notify-subscription-id");
                DruckwerkError::IppRequest("no notify-subscription-id in response".into())
            })?;
        info!(subscription = id, "scheduler notification subscription created");
        Ok(id)
    }

    async fn renew_subscription(&self, id: i32, lease: Duration) -> Result<()> {
        let mut req = self.new_request(Operation::RenewSubscription, Some(self.base.clone()));
        req.attributes_mut().add(
            DelimiterTag::OperationAttributes,
            IppAttribute::new("notify-subscription-id", IppValue::Integer(id)),
        );
        req.attributes_mut().add(
            DelimiterTag::SubscriptionAttributes,
            IppAttribute::new(
                "notify-lease-duration",
                IppValue::Integer(lease.as_secs() as i32),
            ),
        );
        self.send_local(req).await?;
        Ok(())
    }

    async fn cancel_subscription(&self, id: i32) -> Result<()> {
        let mut req = self.new_request(Operation::CancelSubscription, Some(self.base.clone()));
        req.attributes_mut().add(
            DelimiterTag::OperationAttributes,
            IppAttribute::new("notify-subscription-id", IppValue::Integer(id)),
        );
        self.send_local(req).await?;
        Ok(())
    }

    async fn notifications(&self, id: i32, sequence: i32) -> Result<(Vec<SchedulerEvent>, i32)> {
        let mut req = self.new_request(Operation::GetNotifications, Some(self.base.clone()));
        req.attributes_mut().add(
            DelimiterTag::OperationAttributes,
            IppAttribute::new("notify-subscription-ids", IppValue::Integer(id)),
        );
        req.attributes_mut().add(
            DelimiterTag::OperationAttributes,
            IppAttribute::new("notify-sequence-numbers", IppValue::Integer(sequence)),
        );
        let response = self.send_local(req).await?;
        Ok(parse_notifications(response.attributes(), sequence))
    }
}

/// Build a `LocalQueue` from a flattened per-printer attribute group.
fn queue_from_attributes(flat: PrinterAttributes) -> LocalQueue {
    let truthy = |key: &str| {
        flat.get(key)
            .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
            .unwrap_or(false)
    };

    LocalQueue {
        name: flat.get("printer-name").cloned().unwrap_or_default(),
        device_uri: flat.get("device-uri").cloned().unwrap_or_default(),
        info: flat.get("printer-info").cloned().unwrap_or_default(),
        location: flat.get("printer-location").cloned().unwrap_or_default(),
        is_shared: truthy("printer-is-shared"),
        is_accepting: is_accepting(&flat),
        state: printer_state(&flat),
        state_message: flat
            .get("printer-state-message")
            .cloned()
            .unwrap_or_default(),
        nickname: flat
            .get("printer-make-and-model")
            .cloned()
            .unwrap_or_default(),
        is_temporary: truthy("printer-is-temporary"),
        is_default: false,
        uuid: flat
            .get("printer-uuid")
            .and_then(|v| v.trim_start_matches("urn:uuid:").parse::<uuid::Uuid>().ok()),
        options: flat,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_rejects_invalid_uri() {
        let result = IppScheduler::new(
            "not a valid uri %%%",
            Duration::from_secs(5),
            Duration::from_secs(10),
        );
        assert!(result.is_err());
    }

    #[test]
    fn queue_uri_shape() {
        let scheduler = IppScheduler::new(
            "ipp://localhost:631",
            Duration::from_secs(5),
            Duration::from_secs(10),
        )
        .unwrap();
        let uri = scheduler.queue_uri("Example-MFG-9000").unwrap();
        assert_eq!(
            uri.to_string(),
            "ipp://localhost:631/printers/Example-MFG-9000"
        );
    }

    #[test]
    fn queue_from_attributes_reads_mark_and_uuid() {
        let mut flat = PrinterAttributes::new();
        flat.insert("printer-name".into(), "lab".into());
        flat.insert("device-uri".into(), "implicitclass:lab".into());
        flat.insert("printer-is-shared".into(), "true".into());
        flat.insert(MARK_OPTION.into(), "true".into());
        flat.insert(
            "printer-uuid".into(),
            "urn:uuid:9e3ab7c8-42a1-43f2-82a9-b0f50c0d2a3b".into(),
        );

        let queue = queue_from_attributes(flat);
        assert_eq!(queue.name, "lab");
        assert!(queue.is_shared);
        assert!(queue.is_managed());
        assert!(queue.uuid.is_some());
        assert_eq!(queue.state, PrinterState::Idle);
    }

    #[test]
    fn unmarked_queue_is_foreign() {
        let mut flat = PrinterAttributes::new();
        flat.insert("printer-name".into(), "office".into());
        let queue = queue_from_attributes(flat);
        assert!(!queue.is_managed());
    }
}
