// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Decoded scheduler notification events.
//
// A Get-Notifications response carries one event-notification group per
// event; each is decoded into a typed `SchedulerEvent` for the daemon's
// notification handler.

use ipp::prelude::*;

/// One scheduler lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    PrinterAdded {
        name: String,
    },
    PrinterDeleted {
        name: String,
    },
    PrinterModified {
        name: String,
    },
    PrinterStateChanged {
        name: String,
        /// Human-readable notify-text; carries the default-printer phrasing.
        text: String,
    },
    JobState {
        queue: String,
        job_id: i32,
        /// IPP job-state keyword.
        state: String,
    },
}

impl SchedulerEvent {
    /// Queue name the event concerns.
    pub fn queue_name(&self) -> &str {
        match self {
            Self::PrinterAdded { name }
            | Self::PrinterDeleted { name }
            | Self::PrinterModified { name }
            | Self::PrinterStateChanged { name, .. } => name,
            Self::JobState { queue, .. } => queue,
        }
    }
}

/// Decode a Get-Notifications response.
///
/// Returns the events plus the next sequence number to request (one past
/// the highest seen, or the previous value when the response was empty).
pub fn parse_notifications(
    attrs: &IppAttributes,
    previous_sequence: i32,
) -> (Vec<SchedulerEvent>, i32) {
    let mut events = Vec::new();
    let mut next_sequence = previous_sequence;

    for group in attrs.groups_of(DelimiterTag::EventNotificationAttributes) {
        let attributes = group.attributes();

        let get_str = |key: &str| {
            attributes
                .get(key)
                .map(|a| format!("{}", a.value()))
                .unwrap_or_default()
        };
        let get_int = |key: &str| {
            attributes.get(key).and_then(|a| {
                if let IppValue::Integer(v) = a.value() {
                    Some(*v)
                } else {
                    format!("{}", a.value()).parse().ok()
                }
            })
        };

        if let Some(seq) = get_int("notify-sequence-number") {
            next_sequence = next_sequence.max(seq + 1);
        }

        let kind = get_str("notify-subscribed-event");
        let printer = {
            let name = get_str("printer-name");
            if name.is_empty() {
                // Some schedulers only fill notify-printer-uri; take the
                // last path segment.
                get_str("notify-printer-uri")
                    .rsplit('/')
                    .next()
                    .unwrap_or_default()
                    .to_string()
            } else {
                name
            }
        };

        let event = match kind.as_str() {
            "printer-added" => Some(SchedulerEvent::PrinterAdded { name: printer }),
            "printer-deleted" => Some(SchedulerEvent::PrinterDeleted { name: printer }),
            "printer-modified" => Some(SchedulerEvent::PrinterModified { name: printer }),
            "printer-state-changed" => Some(SchedulerEvent::PrinterStateChanged {
                name: printer,
                text: get_str("notify-text"),
            }),
            "job-state" | "job-state-changed" => get_int("notify-job-id").map(|job_id| {
                SchedulerEvent::JobState {
                    queue: printer,
                    job_id,
                    state: job_state_keyword(get_int("job-state").unwrap_or(0)),
                }
            }),
            _ => None,
        };
        if let Some(event) = event {
            events.push(event);
        }
    }

    (events, next_sequence)
}

/// Map the IPP job-state enum to its keyword.
fn job_state_keyword(value: i32) -> String {
    match value {
        3 => "pending",
        4 => "pending-held",
        5 => "processing",
        6 => "processing-stopped",
        7 => "canceled",
        8 => "aborted",
        9 => "completed",
        _ => "unknown",
    }
    .to_string()
}
