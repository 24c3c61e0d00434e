use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::entities::account::Role;

pub mod outbox;

/// Events emitted by the workflow services, delivered to the notification
/// sink. Emission is strictly post-commit and best-effort: a failed send is
/// logged and dropped, never propagated to the operation that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    // Request events
    RequestCreated {
        request_id: Uuid,
        device_id: Uuid,
        requester_id: Uuid,
    },
    RequestConfirmed(Uuid),
    RequestCancelled(Uuid),
    RequestRejected(Uuid),
    RequestAwaitingConfirm(Uuid),

    // Task events
    TaskCreated {
        task_id: Uuid,
        request_id: Uuid,
    },
    TaskAssigned {
        task_id: Uuid,
        fixer_id: Uuid,
        scheduled_for: DateTime<Utc>,
    },
    TaskCompleted(Uuid),
    TaskCancelled {
        task_id: Uuid,
        cancelled_by: Uuid,
    },

    // Warehouse events
    ExportOpened {
        ticket_id: Uuid,
        task_id: Uuid,
    },
    ExportCompleted(Uuid),
    ExportCancelled(Uuid),
    StockDebited {
        spare_part_id: Uuid,
        quantity: i32,
        remaining: i32,
    },
    StockReceived {
        spare_part_id: Uuid,
        quantity: i32,
    },

    // Device events
    DeviceRelocated {
        old_device_id: Uuid,
        new_device_id: Uuid,
    },
}

impl Event {
    /// Short machine-readable name used by the outbox and log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Event::RequestCreated { .. } => "request.created",
            Event::RequestConfirmed(_) => "request.confirmed",
            Event::RequestCancelled(_) => "request.cancelled",
            Event::RequestRejected(_) => "request.rejected",
            Event::RequestAwaitingConfirm(_) => "request.awaiting_confirm",
            Event::TaskCreated { .. } => "task.created",
            Event::TaskAssigned { .. } => "task.assigned",
            Event::TaskCompleted(_) => "task.completed",
            Event::TaskCancelled { .. } => "task.cancelled",
            Event::ExportOpened { .. } => "export.opened",
            Event::ExportCompleted(_) => "export.completed",
            Event::ExportCancelled(_) => "export.cancelled",
            Event::StockDebited { .. } => "stock.debited",
            Event::StockReceived { .. } => "stock.received",
            Event::DeviceRelocated { .. } => "device.relocated",
        }
    }

    /// The staff role the notification sink should deliver this event to.
    pub fn target_role(&self) -> Role {
        match self {
            // Requester-facing lifecycle outcomes
            Event::RequestAwaitingConfirm(_)
            | Event::RequestConfirmed(_)
            | Event::RequestRejected(_) => Role::Head,
            // Fixer-facing assignments
            Event::TaskAssigned { .. } | Event::TaskCancelled { .. } => Role::Staff,
            // Everything else lands on the coordinator dashboard
            _ => Role::HeadStaff,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event to the processing loop.
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Post-commit emission helper: logs and swallows send failures so a
    /// full channel can never fail the workflow transition that produced
    /// the event.
    pub async fn emit(&self, event: Event) {
        let name = event.name();
        if let Err(e) = self.send(event).await {
            warn!(event = name, error = %e, "dropping workflow event");
        }
    }
}

/// Consumes events from the channel and hands them to the notification
/// sink. This loop runs for the lifetime of the process; it exits when
/// every sender has been dropped.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        dispatch(&event).await;
    }

    info!("Event channel closed, stopping event processing loop");
}

async fn dispatch(event: &Event) {
    let role = event.target_role();
    info!(event = event.name(), target_role = %role, "dispatching event");

    match event {
        Event::TaskAssigned {
            task_id, fixer_id, ..
        } => {
            metrics::counter!("fixflow_notifications_task_assigned", 1);
            info!(task_id = %task_id, fixer_id = %fixer_id, "notifying fixer of assignment");
        }
        Event::RequestCreated {
            request_id,
            device_id,
            ..
        } => {
            metrics::counter!("fixflow_notifications_request_created", 1);
            info!(request_id = %request_id, device_id = %device_id, "notifying coordinators of new request");
        }
        Event::StockDebited {
            spare_part_id,
            remaining,
            ..
        } => {
            if *remaining == 0 {
                error!(spare_part_id = %spare_part_id, "spare part stock exhausted");
            }
        }
        _ => {}
    }
}
