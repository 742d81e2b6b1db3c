use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::{
    auth::{AuthUser, OptionalAuthUser},
    entities::order::OrderStatus,
    errors::ServiceError,
    services::orders::{
        CreateOrder, GuestContact, OrderAccessor, OrderOwner, OrderWithItems, RequestedItem,
    },
    ApiResponse, AppState, PaginatedResponse,
};

/// One cart line. Any price the client sends alongside is ignored by
/// deserialization; unit prices always come from the catalog.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct OrderItemRequest {
    pub variant_id: Uuid,
    pub quantity: i32,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct CreateOrderRequest {
    #[validate(length(min = 1, message = "items are required"))]
    pub items: Vec<OrderItemRequest>,
    /// Guest checkout contact; ignored for authenticated callers.
    pub customer_name: Option<String>,
    #[validate(email)]
    pub customer_email: Option<String>,
    pub customer_phone: Option<String>,
    pub shipping_address: Option<serde_json::Value>,
    pub payment_method: Option<String>,
    pub shipping_price: Option<Decimal>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ListOrdersQuery {
    pub status: Option<String>,
    #[serde(default = "default_page")]
    pub page: u64,
    #[serde(default = "default_limit")]
    pub limit: u64,
    /// Guest lookup credentials; ignored for authenticated callers.
    pub email: Option<String>,
    pub phone: Option<String>,
}

fn default_page() -> u64 {
    1
}
fn default_limit() -> u64 {
    20
}
const MAX_PAGE_SIZE: u64 = 100;

#[derive(Debug, Deserialize, ToSchema)]
pub struct GuestLookupQuery {
    pub email: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateOrderStatusRequest {
    pub status: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct OrderItemResponse {
    pub variant_id: Uuid,
    pub quantity: i32,
    pub price: Decimal,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct OrderResponse {
    pub id: String,
    pub status: OrderStatus,
    /// Customer-facing label for the current status.
    pub status_label: String,
    pub customer_name: Option<String>,
    pub customer_email: Option<String>,
    pub customer_phone: Option<String>,
    pub total_price: Decimal,
    pub shipping_price: Decimal,
    pub shipping_address: Option<serde_json::Value>,
    pub payment_method: Option<String>,
    pub payment_token: Option<String>,
    pub payment_redirect_url: Option<String>,
    pub items: Vec<OrderItemResponse>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

fn parse_stored_status(raw: &str) -> Result<OrderStatus, ServiceError> {
    OrderStatus::from_str(raw)
        .map_err(|_| ServiceError::InternalError(format!("order has unknown status '{}'", raw)))
}

fn map_order(order_with_items: OrderWithItems) -> Result<OrderResponse, ServiceError> {
    let OrderWithItems { order, items } = order_with_items;
    let status = parse_stored_status(&order.status)?;

    Ok(OrderResponse {
        id: order.id,
        status,
        status_label: status.label().to_string(),
        customer_name: order.customer_name,
        customer_email: order.customer_email,
        customer_phone: order.customer_phone,
        total_price: order.total_price,
        shipping_price: order.shipping_price,
        shipping_address: order.shipping_address,
        payment_method: order.payment_method,
        payment_token: order.payment_token,
        payment_redirect_url: order.payment_redirect_url,
        items: items
            .into_iter()
            .map(|item| OrderItemResponse {
                variant_id: item.variant_id,
                quantity: item.quantity,
                price: item.price,
            })
            .collect(),
        created_at: order.created_at,
        updated_at: order.updated_at,
        paid_at: order.paid_at,
        delivered_at: order.delivered_at,
        completed_at: order.completed_at,
    })
}

fn parse_requested_status(raw: &str) -> Result<OrderStatus, ServiceError> {
    OrderStatus::from_str(&raw.to_ascii_lowercase())
        .map_err(|_| ServiceError::InvalidStatus(format!("Unknown order status: {raw}")))
}

/// POST /api/v1/orders
///
/// Members checkout with just a bearer token; guests supply contact
/// details and a shipping address in the body.
#[utoipa::path(
    post,
    path = "/api/v1/orders",
    request_body = CreateOrderRequest,
    responses(
        (status = 201, description = "Order created", body = ApiResponse<OrderResponse>),
        (status = 400, description = "Invalid input", body = crate::errors::ErrorResponse),
        (status = 422, description = "Insufficient stock", body = crate::errors::ErrorResponse),
        (status = 502, description = "Payment gateway failure", body = crate::errors::ErrorResponse)
    ),
    tag = "Orders"
)]
pub async fn create_order(
    State(state): State<AppState>,
    OptionalAuthUser(auth): OptionalAuthUser,
    Json(payload): Json<CreateOrderRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    payload.validate()?;

    let owner = match auth {
        Some(user) => OrderOwner::Member {
            user_id: user.user_id,
            email: user.email,
        },
        None => OrderOwner::Guest(GuestContact {
            name: payload.customer_name.unwrap_or_default(),
            email: payload.customer_email.unwrap_or_default(),
            phone: payload.customer_phone.unwrap_or_default(),
        }),
    };

    let input = CreateOrder {
        owner,
        items: payload
            .items
            .into_iter()
            .map(|item| RequestedItem {
                variant_id: item.variant_id,
                quantity: item.quantity,
            })
            .collect(),
        shipping_address: payload.shipping_address,
        payment_method: payload.payment_method,
        shipping_price: payload.shipping_price.unwrap_or(Decimal::ZERO),
    };

    let created = state.services.orders.create_order(input).await?;
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success(map_order(created)?)),
    ))
}

/// GET /api/v1/orders
#[utoipa::path(
    get,
    path = "/api/v1/orders",
    params(
        ("status" = Option<String>, Query, description = "Filter by order status"),
        ("page" = Option<u64>, Query, description = "Page number, 1-based"),
        ("limit" = Option<u64>, Query, description = "Page size, capped at 100"),
        ("email" = Option<String>, Query, description = "Guest lookup email"),
        ("phone" = Option<String>, Query, description = "Guest lookup phone")
    ),
    responses(
        (status = 200, description = "Orders for the caller", body = ApiResponse<PaginatedResponse<OrderResponse>>),
        (status = 401, description = "No token and no guest credentials", body = crate::errors::ErrorResponse)
    ),
    tag = "Orders"
)]
pub async fn list_orders(
    State(state): State<AppState>,
    OptionalAuthUser(auth): OptionalAuthUser,
    Query(query): Query<ListOrdersQuery>,
) -> Result<impl IntoResponse, ServiceError> {
    let accessor = match auth {
        Some(user) => OrderAccessor::Member(user.user_id),
        None => OrderAccessor::Guest {
            email: query.email,
            phone: query.phone,
        },
    };

    let status = query.status.as_deref().map(parse_requested_status).transpose()?;
    let page = query.page.max(1);
    let limit = query.limit.clamp(1, MAX_PAGE_SIZE);

    let (orders, total) = state
        .services
        .orders
        .list_orders(accessor, status, page, limit)
        .await?;

    let items = orders
        .into_iter()
        .map(map_order)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Json(ApiResponse::success(PaginatedResponse {
        items,
        total,
        page,
        limit,
        total_pages: total.div_ceil(limit),
    })))
}

/// GET /api/v1/orders/:id
#[utoipa::path(
    get,
    path = "/api/v1/orders/{id}",
    params(
        ("id" = String, Path, description = "Order id"),
        ("email" = Option<String>, Query, description = "Guest lookup email"),
        ("phone" = Option<String>, Query, description = "Guest lookup phone")
    ),
    responses(
        (status = 200, description = "The order", body = ApiResponse<OrderResponse>),
        (status = 403, description = "Order belongs to another account", body = crate::errors::ErrorResponse),
        (status = 404, description = "Not found, or guest credentials do not match", body = crate::errors::ErrorResponse)
    ),
    tag = "Orders"
)]
pub async fn get_order(
    State(state): State<AppState>,
    OptionalAuthUser(auth): OptionalAuthUser,
    Path(id): Path<String>,
    Query(query): Query<GuestLookupQuery>,
) -> Result<impl IntoResponse, ServiceError> {
    let accessor = match auth {
        Some(user) => OrderAccessor::Member(user.user_id),
        None => OrderAccessor::Guest {
            email: query.email,
            phone: query.phone,
        },
    };

    let order = state.services.orders.get_order_for(&id, accessor).await?;
    Ok(Json(ApiResponse::success(map_order(order)?)))
}

/// PUT /api/v1/orders/:id/status
///
/// Fulfillment transitions, restricted to admin callers.
#[utoipa::path(
    put,
    path = "/api/v1/orders/{id}/status",
    params(("id" = String, Path, description = "Order id")),
    request_body = UpdateOrderStatusRequest,
    responses(
        (status = 200, description = "Status updated", body = ApiResponse<OrderResponse>),
        (status = 400, description = "Transition not allowed", body = crate::errors::ErrorResponse),
        (status = 403, description = "Caller is not an admin", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Orders"
)]
pub async fn update_order_status(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    Json(payload): Json<UpdateOrderStatusRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    if !user.is_admin() {
        return Err(ServiceError::Forbidden(
            "admin role required".to_string(),
        ));
    }

    let new_status = parse_requested_status(&payload.status)?;
    state
        .services
        .orders
        .update_order_status(&id, new_status)
        .await?;

    let updated = state
        .services
        .orders
        .get_order_for(&id, OrderAccessor::Admin)
        .await?;

    Ok(Json(ApiResponse::success(map_order(updated)?)))
}
