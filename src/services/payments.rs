use crate::{config::AppConfig, errors::ServiceError};
use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::{error, instrument};
use uuid::Uuid;

/// Item-level breakdown sent to the gateway.
#[derive(Debug, Clone, Serialize)]
pub struct ItemDetail {
    pub id: Uuid,
    pub name: String,
    pub price: Decimal,
    pub quantity: i32,
}

/// Customer/contact details forwarded to the hosted checkout page.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CustomerDetails {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

/// One hosted-payment transaction request.
#[derive(Debug, Clone, Serialize)]
pub struct TransactionRequest {
    pub order_id: String,
    pub gross_amount: Decimal,
    pub customer: CustomerDetails,
    pub items: Vec<ItemDetail>,
}

/// Opaque session handle issued by the gateway for one checkout attempt.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySession {
    pub token: String,
    pub redirect_url: String,
}

/// Boundary to the external payment processor. The order service only
/// depends on this trait; tests substitute a scripted implementation.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_transaction(
        &self,
        request: &TransactionRequest,
    ) -> Result<GatewaySession, ServiceError>;
}

/// Snap-style hosted-payment gateway client. Authenticates with the
/// server-held key via HTTP basic auth; the key never reaches clients.
pub struct SnapGateway {
    client: reqwest::Client,
    endpoint: String,
    server_key: String,
}

impl SnapGateway {
    pub fn new(cfg: &AppConfig) -> Result<Self, ServiceError> {
        Self::from_parts(
            cfg.midtrans_snap_url.clone(),
            cfg.midtrans_server_key.clone(),
            Duration::from_secs(cfg.payment_gateway_timeout_secs),
        )
    }

    pub fn from_parts(
        endpoint: String,
        server_key: String,
        timeout: Duration,
    ) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceError::InternalError(format!("gateway client init: {}", e)))?;

        Ok(Self {
            client,
            endpoint,
            server_key,
        })
    }
}

#[async_trait]
impl PaymentGateway for SnapGateway {
    #[instrument(skip(self, request), fields(order_id = %request.order_id))]
    async fn create_transaction(
        &self,
        request: &TransactionRequest,
    ) -> Result<GatewaySession, ServiceError> {
        let body = json!({
            "transaction_details": {
                "order_id": request.order_id,
                "gross_amount": request.gross_amount.to_f64(),
            },
            "customer_details": {
                "first_name": request.customer.name,
                "email": request.customer.email,
                "phone": request.customer.phone,
            },
            "item_details": request.items.iter().map(|item| json!({
                "id": item.id,
                "name": item.name,
                "price": item.price.to_f64(),
                "quantity": item.quantity,
            })).collect::<Vec<_>>(),
        });

        // Timeout is configured on the client; an elapsed deadline surfaces
        // as a request error and is treated like any other gateway failure.
        let response = self
            .client
            .post(&self.endpoint)
            .basic_auth(&self.server_key, None::<&str>)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                error!(order_id = %request.order_id, error = %e, "Payment gateway request failed");
                ServiceError::PaymentGateway(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            error!(order_id = %request.order_id, status = %status, "Payment gateway rejected transaction");
            return Err(ServiceError::PaymentGateway(format!(
                "gateway returned {}: {}",
                status, detail
            )));
        }

        response.json::<GatewaySession>().await.map_err(|e| {
            error!(order_id = %request.order_id, error = %e, "Malformed payment gateway response");
            ServiceError::PaymentGateway(format!("malformed gateway response: {}", e))
        })
    }
}
