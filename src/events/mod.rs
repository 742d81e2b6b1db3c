use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

/// Events emitted by the order workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    OrderCreated(String),
    OrderStatusChanged {
        order_id: String,
        old_status: String,
        new_status: String,
    },
    StockReserved {
        order_id: String,
        variant_id: Uuid,
        quantity: i32,
    },
    PaymentSessionCreated(String),
    OrderRolledBack {
        order_id: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously.
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends an event, logging instead of failing when the channel is gone.
    /// Event delivery is best-effort and never blocks the request path.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            warn!("Event delivery failed: {}", e);
        }
    }
}

/// Consumes events from the channel and logs them. Downstream consumers
/// (notifications, analytics) would hang off this loop.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    while let Some(event) = rx.recv().await {
        match &event {
            Event::OrderCreated(order_id) => {
                info!(order_id = %order_id, "event: order created");
            }
            Event::OrderStatusChanged {
                order_id,
                old_status,
                new_status,
            } => {
                info!(order_id = %order_id, from = %old_status, to = %new_status, "event: order status changed");
            }
            Event::StockReserved {
                order_id,
                variant_id,
                quantity,
            } => {
                info!(order_id = %order_id, variant_id = %variant_id, quantity = quantity, "event: stock reserved");
            }
            Event::PaymentSessionCreated(order_id) => {
                info!(order_id = %order_id, "event: payment session created");
            }
            Event::OrderRolledBack { order_id, reason } => {
                warn!(order_id = %order_id, reason = %reason, "event: order rolled back");
            }
        }
    }
    info!("Event channel closed; processor exiting");
}
