use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Deserialize;
use sha2::{Digest, Sha512};
use tracing::{info, warn};
use utoipa::ToSchema;

use crate::{
    entities::order::OrderStatus,
    errors::ServiceError,
    services::orders::ReconcileOutcome,
    AppState,
};

/// Server-to-server notification posted by the payment gateway after a
/// transaction changes state. Field names follow the gateway's wire format.
#[derive(Debug, Deserialize, ToSchema)]
pub struct GatewayNotification {
    pub order_id: String,
    pub status_code: String,
    pub gross_amount: String,
    pub signature_key: String,
    pub transaction_status: String,
    #[serde(default)]
    pub fraud_status: Option<String>,
}

/// The gateway signs each notification with
/// `sha512(order_id + status_code + gross_amount + server_key)`, hex-encoded.
fn expected_signature(
    order_id: &str,
    status_code: &str,
    gross_amount: &str,
    server_key: &str,
) -> String {
    let mut hasher = Sha512::new();
    hasher.update(order_id.as_bytes());
    hasher.update(status_code.as_bytes());
    hasher.update(gross_amount.as_bytes());
    hasher.update(server_key.as_bytes());
    hex::encode(hasher.finalize())
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.as_bytes().iter().zip(b.as_bytes()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Maps a gateway transaction status (plus fraud verdict) onto the order
/// state machine. `None` means the notification carries nothing actionable
/// and should be acknowledged as-is.
fn map_gateway_status(transaction_status: &str, fraud_status: Option<&str>) -> Option<OrderStatus> {
    match transaction_status {
        // a captured card payment only counts once fraud screening accepts it
        "capture" => match fraud_status {
            Some("accept") => Some(OrderStatus::Paid),
            _ => Some(OrderStatus::Cancelled),
        },
        "settlement" => Some(OrderStatus::Paid),
        "pending" => Some(OrderStatus::Pending),
        "cancel" | "deny" => Some(OrderStatus::Cancelled),
        "expire" => Some(OrderStatus::Expired),
        "refund" | "partial_refund" => Some(OrderStatus::Refunded),
        _ => None,
    }
}

/// POST /api/v1/payments/webhook
///
/// Always answers 200 once the signature checks out, whatever the payload
/// says about unknown orders or stale statuses: a non-2xx would only make
/// the gateway retry a notification that will never apply.
#[utoipa::path(
    post,
    path = "/api/v1/payments/webhook",
    request_body = GatewayNotification,
    responses(
        (status = 200, description = "Notification acknowledged"),
        (status = 401, description = "Invalid signature", body = crate::errors::ErrorResponse)
    ),
    tag = "Payments"
)]
pub async fn payment_webhook(
    State(state): State<AppState>,
    Json(notification): Json<GatewayNotification>,
) -> Result<impl IntoResponse, ServiceError> {
    let expected = expected_signature(
        &notification.order_id,
        &notification.status_code,
        &notification.gross_amount,
        &state.config.midtrans_server_key,
    );
    if !constant_time_eq(&expected, &notification.signature_key) {
        warn!(order_id = %notification.order_id, "Rejected gateway notification with bad signature");
        return Err(ServiceError::InvalidSignature);
    }

    let Some(mapped) = map_gateway_status(
        &notification.transaction_status,
        notification.fraud_status.as_deref(),
    ) else {
        info!(
            order_id = %notification.order_id,
            transaction_status = %notification.transaction_status,
            "Unhandled gateway transaction status acknowledged"
        );
        return Ok((StatusCode::OK, "ok"));
    };

    match state
        .services
        .orders
        .apply_gateway_status(&notification.order_id, mapped)
        .await?
    {
        ReconcileOutcome::Applied(status) => {
            info!(order_id = %notification.order_id, status = %status, "Gateway notification applied");
        }
        ReconcileOutcome::Ignored => {}
    }

    Ok((StatusCode::OK, "ok"))
}
