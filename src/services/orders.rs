use crate::{
    entities::{
        order::{self, Entity as OrderEntity, OrderStatus},
        order_item::{self, Entity as OrderItemEntity},
        product_variant::{self, Entity as ProductVariantEntity},
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        catalog::{CatalogService, VariantRecord},
        order_id,
        payments::{CustomerDetails, ItemDetail, PaymentGateway, TransactionRequest},
    },
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection,
    DatabaseTransaction, EntityTrait, LoaderTrait, PaginatorTrait, QueryFilter, QueryOrder, Set,
    SqlErr, TransactionTrait,
};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// How many fresh ids to try when an insert hits the primary-key
/// constraint (three random letters + minute timestamp can collide).
const MAX_ID_ATTEMPTS: u32 = 3;

/// One line of the inbound cart, before validation. Any client-supplied
/// price is discarded upstream; only ids and quantities come in.
#[derive(Debug, Clone)]
pub struct RequestedItem {
    pub variant_id: Uuid,
    pub quantity: i32,
}

/// Contact details identifying a guest purchaser.
#[derive(Debug, Clone)]
pub struct GuestContact {
    pub name: String,
    pub email: String,
    pub phone: String,
}

/// Exactly one ownership mode per order.
#[derive(Debug, Clone)]
pub enum OrderOwner {
    Member { user_id: Uuid, email: Option<String> },
    Guest(GuestContact),
}

#[derive(Debug, Clone)]
pub struct CreateOrder {
    pub owner: OrderOwner,
    pub items: Vec<RequestedItem>,
    pub shipping_address: Option<serde_json::Value>,
    pub payment_method: Option<String>,
    pub shipping_price: Decimal,
}

/// A line item that passed validation, with the unit price snapshotted
/// from the catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedLine {
    pub variant_id: Uuid,
    pub quantity: i32,
    pub price: Decimal,
}

#[derive(Debug, Clone)]
pub struct OrderWithItems {
    pub order: order::Model,
    pub items: Vec<order_item::Model>,
}

/// Caller identity for order lookups.
#[derive(Debug, Clone)]
pub enum OrderAccessor {
    /// No ownership restriction; reserved for admin callers.
    Admin,
    Member(Uuid),
    Guest {
        email: Option<String>,
        phone: Option<String>,
    },
}

/// Result of applying a gateway notification.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    Applied(OrderStatus),
    /// Duplicate, unknown-order, or out-of-machine notification; acknowledged
    /// without any state change.
    Ignored,
}

/// Validates requested items against a catalog snapshot and computes the
/// order total from server-trusted prices. Pure; no side effects.
///
/// The whole request fails on the first unknown variant or stock shortfall:
/// there is no partial success before any write happens.
pub fn validate_items(
    items: &[RequestedItem],
    snapshot: &HashMap<Uuid, VariantRecord>,
) -> Result<(Vec<ValidatedLine>, Decimal), ServiceError> {
    if items.is_empty() {
        return Err(ServiceError::InvalidInput("items are required".to_string()));
    }

    let mut total = Decimal::ZERO;
    let mut lines = Vec::with_capacity(items.len());

    for item in items {
        if item.quantity <= 0 {
            return Err(ServiceError::InvalidInput(format!(
                "quantity for variant {} must be a positive integer",
                item.variant_id
            )));
        }

        let record = snapshot
            .get(&item.variant_id)
            .ok_or_else(|| ServiceError::VariantNotFound(item.variant_id.to_string()))?;

        if item.quantity > record.quantity {
            return Err(ServiceError::InsufficientStock(item.variant_id.to_string()));
        }

        total += record.price * Decimal::from(item.quantity);
        lines.push(ValidatedLine {
            variant_id: item.variant_id,
            quantity: item.quantity,
            price: record.price,
        });
    }

    Ok((lines, total))
}

/// Source of candidate order ids. Injected so tests can script collisions.
pub type OrderIdSource = Arc<dyn Fn() -> String + Send + Sync>;

/// Order workflow: validation, transactional persistence with stock
/// reservation, payment-session coordination, and status transitions.
#[derive(Clone)]
pub struct OrderService {
    db: Arc<DatabaseConnection>,
    catalog: Arc<CatalogService>,
    gateway: Arc<dyn PaymentGateway>,
    event_sender: Arc<EventSender>,
    id_source: OrderIdSource,
}

impl OrderService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        catalog: Arc<CatalogService>,
        gateway: Arc<dyn PaymentGateway>,
        event_sender: Arc<EventSender>,
    ) -> Self {
        Self {
            db,
            catalog,
            gateway,
            event_sender,
            id_source: Arc::new(|| order_id::generate(Utc::now())),
        }
    }

    /// Replaces the order-id source, keeping everything else.
    pub fn with_id_source(mut self, id_source: OrderIdSource) -> Self {
        self.id_source = id_source;
        self
    }

    /// Creates an order from a finalized cart.
    ///
    /// Header, line items, and the conditional stock decrement all run in
    /// one transaction, so a partially persisted order cannot be observed.
    /// Member orders additionally request a hosted-payment session; if the
    /// gateway step fails, the committed order is rolled back (items and
    /// header deleted, stock restored) and the gateway error is returned.
    /// Guest orders skip the gateway and stay `pending` for offline payment.
    #[instrument(skip(self, input), fields(item_count = input.items.len()))]
    pub async fn create_order(&self, input: CreateOrder) -> Result<OrderWithItems, ServiceError> {
        if let OrderOwner::Guest(contact) = &input.owner {
            if contact.name.trim().is_empty() {
                return Err(ServiceError::InvalidInput(
                    "customer_name is required".to_string(),
                ));
            }
            if contact.email.trim().is_empty() {
                return Err(ServiceError::InvalidInput(
                    "customer_email is required".to_string(),
                ));
            }
            if contact.phone.trim().is_empty() {
                return Err(ServiceError::InvalidInput(
                    "customer_phone is required".to_string(),
                ));
            }
            if input.shipping_address.is_none() {
                return Err(ServiceError::InvalidInput(
                    "shipping_address is required".to_string(),
                ));
            }
        }

        let ids: Vec<Uuid> = input.items.iter().map(|item| item.variant_id).collect();
        let snapshot = self.catalog.variant_snapshot(&ids).await?;
        let (lines, items_total) = validate_items(&input.items, &snapshot)?;

        let mut attempt = 0;
        let mut persisted = loop {
            attempt += 1;
            let candidate_id = (self.id_source)();
            match self
                .persist_order(&candidate_id, &input, &lines, items_total)
                .await
            {
                Ok(persisted) => break persisted,
                Err(ServiceError::DatabaseError(err)) => {
                    let id_collision =
                        matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_)));
                    if id_collision && attempt < MAX_ID_ATTEMPTS {
                        warn!(order_id = %candidate_id, "Order id collision, retrying with a fresh id");
                        continue;
                    }
                    error!(order_id = %candidate_id, error = %err, "Failed to persist order");
                    return Err(ServiceError::OrderCreateFailed(err.to_string()));
                }
                Err(other) => return Err(other),
            }
        };

        info!(order_id = %persisted.order.id, total = %items_total, "Order created");
        self.event_sender
            .send_or_log(Event::OrderCreated(persisted.order.id.clone()))
            .await;
        for line in &lines {
            self.event_sender
                .send_or_log(Event::StockReserved {
                    order_id: persisted.order.id.clone(),
                    variant_id: line.variant_id,
                    quantity: line.quantity,
                })
                .await;
        }

        if let OrderOwner::Member { email, .. } = &input.owner {
            let request = TransactionRequest {
                order_id: persisted.order.id.clone(),
                gross_amount: items_total + input.shipping_price,
                customer: CustomerDetails {
                    name: None,
                    email: email.clone(),
                    phone: None,
                },
                items: self.item_details(&snapshot, &lines).await?,
            };

            match self.gateway.create_transaction(&request).await {
                Ok(session) => {
                    let mut active: order::ActiveModel = persisted.order.clone().into();
                    active.payment_token = Set(Some(session.token));
                    active.payment_redirect_url = Set(Some(session.redirect_url));
                    active.updated_at = Set(Some(Utc::now()));
                    persisted.order = active.update(&*self.db).await?;

                    self.event_sender
                        .send_or_log(Event::PaymentSessionCreated(persisted.order.id.clone()))
                        .await;
                }
                Err(gateway_err) => {
                    warn!(order_id = %persisted.order.id, error = %gateway_err, "Gateway failure, rolling back order");
                    self.rollback_order(&persisted, "payment gateway failure")
                        .await;
                    return Err(gateway_err);
                }
            }
        }

        Ok(persisted)
    }

    /// Inserts the header, reserves stock, and inserts line items inside a
    /// single transaction. The decrement is conditional (`quantity >= n`):
    /// a concurrent sale that drained stock since the snapshot aborts the
    /// whole transaction instead of overselling.
    async fn persist_order(
        &self,
        candidate_id: &str,
        input: &CreateOrder,
        lines: &[ValidatedLine],
        total: Decimal,
    ) -> Result<OrderWithItems, ServiceError> {
        let txn = self.db.begin().await?;
        let now = Utc::now();

        let (user_id, contact) = match &input.owner {
            OrderOwner::Member { user_id, .. } => (Some(*user_id), None),
            OrderOwner::Guest(contact) => (None, Some(contact.clone())),
        };

        let header = order::ActiveModel {
            id: Set(candidate_id.to_string()),
            user_id: Set(user_id),
            customer_name: Set(contact.as_ref().map(|c| c.name.clone())),
            customer_email: Set(contact.as_ref().map(|c| c.email.clone())),
            customer_phone: Set(contact.as_ref().map(|c| c.phone.clone())),
            status: Set(OrderStatus::Pending.to_string()),
            total_price: Set(total),
            shipping_price: Set(input.shipping_price),
            tax_amount: Set(Decimal::ZERO),
            discount_amount: Set(Decimal::ZERO),
            shipping_address: Set(input.shipping_address.clone()),
            payment_method: Set(input.payment_method.clone()),
            payment_token: Set(None),
            payment_redirect_url: Set(None),
            created_at: Set(now),
            updated_at: Set(Some(now)),
            paid_at: Set(None),
            delivered_at: Set(None),
            completed_at: Set(None),
        };
        let order = header.insert(&txn).await?;

        let mut items = Vec::with_capacity(lines.len());
        for line in lines {
            Self::reserve_stock(&txn, line).await?;

            let item = order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(candidate_id.to_string()),
                variant_id: Set(line.variant_id),
                quantity: Set(line.quantity),
                price: Set(line.price),
                created_at: Set(now),
            };
            items.push(item.insert(&txn).await?);
        }

        txn.commit().await?;
        Ok(OrderWithItems { order, items })
    }

    /// Atomic conditional decrement: zero rows affected means another
    /// checkout consumed the stock first.
    async fn reserve_stock(
        txn: &DatabaseTransaction,
        line: &ValidatedLine,
    ) -> Result<(), ServiceError> {
        let reserved = ProductVariantEntity::update_many()
            .col_expr(
                product_variant::Column::Quantity,
                Expr::col(product_variant::Column::Quantity).sub(line.quantity),
            )
            .filter(product_variant::Column::Id.eq(line.variant_id))
            .filter(product_variant::Column::Quantity.gte(line.quantity))
            .exec(txn)
            .await?;

        if reserved.rows_affected == 0 {
            return Err(ServiceError::InsufficientStock(line.variant_id.to_string()));
        }
        Ok(())
    }

    /// Best-effort compensation after a post-commit gateway failure:
    /// delete items, delete the header, restore reserved stock. A failure
    /// here is logged but never masks the original gateway error.
    async fn rollback_order(&self, persisted: &OrderWithItems, reason: &str) {
        let order_id = persisted.order.id.clone();

        let result: Result<(), ServiceError> = async {
            let txn = self.db.begin().await?;
            OrderItemEntity::delete_many()
                .filter(order_item::Column::OrderId.eq(order_id.clone()))
                .exec(&txn)
                .await?;
            OrderEntity::delete_many()
                .filter(order::Column::Id.eq(order_id.clone()))
                .exec(&txn)
                .await?;
            for item in &persisted.items {
                ProductVariantEntity::update_many()
                    .col_expr(
                        product_variant::Column::Quantity,
                        Expr::col(product_variant::Column::Quantity).add(item.quantity),
                    )
                    .filter(product_variant::Column::Id.eq(item.variant_id))
                    .exec(&txn)
                    .await?;
            }
            txn.commit().await?;
            Ok(())
        }
        .await;

        if let Err(e) = result {
            error!(order_id = %order_id, error = %e, "Compensating rollback failed; order left for reconciliation");
        }

        self.event_sender
            .send_or_log(Event::OrderRolledBack {
                order_id,
                reason: reason.to_string(),
            })
            .await;
    }

    async fn item_details(
        &self,
        snapshot: &HashMap<Uuid, VariantRecord>,
        lines: &[ValidatedLine],
    ) -> Result<Vec<ItemDetail>, ServiceError> {
        // Variant names for the gateway's item breakdown; the snapshot only
        // carries price/stock.
        let ids: Vec<Uuid> = lines.iter().map(|l| l.variant_id).collect();
        let names: HashMap<Uuid, String> = ProductVariantEntity::find()
            .filter(product_variant::Column::Id.is_in(ids))
            .all(&*self.db)
            .await?
            .into_iter()
            .map(|v| (v.id, v.name))
            .collect();

        Ok(lines
            .iter()
            .map(|line| ItemDetail {
                id: line.variant_id,
                name: names
                    .get(&line.variant_id)
                    .cloned()
                    .unwrap_or_else(|| line.variant_id.to_string()),
                price: snapshot
                    .get(&line.variant_id)
                    .map(|r| r.price)
                    .unwrap_or(line.price),
                quantity: line.quantity,
            })
            .collect())
    }

    /// Fetch one order with ownership enforcement. Members get 403 on
    /// someone else's order; guests get 404 unless a contact detail
    /// matches, so the endpoint cannot be used to probe order ids.
    #[instrument(skip(self, accessor))]
    pub async fn get_order_for(
        &self,
        id: &str,
        accessor: OrderAccessor,
    ) -> Result<OrderWithItems, ServiceError> {
        let order = OrderEntity::find_by_id(id.to_string())
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Order not found".to_string()))?;

        match accessor {
            OrderAccessor::Admin => {}
            OrderAccessor::Member(user_id) => {
                if order.user_id != Some(user_id) {
                    return Err(ServiceError::Forbidden(
                        "order belongs to another account".to_string(),
                    ));
                }
            }
            OrderAccessor::Guest { email, phone } => {
                if email.is_none() && phone.is_none() {
                    return Err(ServiceError::InvalidInput(
                        "email or phone is required to look up a guest order".to_string(),
                    ));
                }
                let email_match = matches!((&email, &order.customer_email), (Some(a), Some(b)) if a == b);
                let phone_match = matches!((&phone, &order.customer_phone), (Some(a), Some(b)) if a == b);
                if order.user_id.is_some() || (!email_match && !phone_match) {
                    return Err(ServiceError::NotFound("Order not found".to_string()));
                }
            }
        }

        let items = OrderItemEntity::find()
            .filter(order_item::Column::OrderId.eq(order.id.clone()))
            .all(&*self.db)
            .await?;

        Ok(OrderWithItems { order, items })
    }

    /// Lists orders for one owner, newest first, optionally filtered by
    /// status.
    #[instrument(skip(self, accessor))]
    pub async fn list_orders(
        &self,
        accessor: OrderAccessor,
        status: Option<OrderStatus>,
        page: u64,
        per_page: u64,
    ) -> Result<(Vec<OrderWithItems>, u64), ServiceError> {
        let mut query = OrderEntity::find();

        match accessor {
            OrderAccessor::Admin => {}
            OrderAccessor::Member(user_id) => {
                query = query.filter(order::Column::UserId.eq(user_id));
            }
            OrderAccessor::Guest { email, phone } => {
                if email.is_none() && phone.is_none() {
                    return Err(ServiceError::Unauthorized(
                        "login required, or provide email/phone to look up guest orders"
                            .to_string(),
                    ));
                }
                let mut cond = Condition::any();
                if let Some(email) = email {
                    cond = cond.add(order::Column::CustomerEmail.eq(email));
                }
                if let Some(phone) = phone {
                    cond = cond.add(order::Column::CustomerPhone.eq(phone));
                }
                query = query.filter(order::Column::UserId.is_null()).filter(cond);
            }
        }

        if let Some(status) = status {
            query = query.filter(order::Column::Status.eq(status.to_string()));
        }

        let paginator = query
            .order_by_desc(order::Column::CreatedAt)
            .paginate(&*self.db, per_page.max(1));

        let total = paginator.num_items().await?;
        let orders = paginator.fetch_page(page.saturating_sub(1)).await?;
        let items = orders.load_many(OrderItemEntity, &*self.db).await?;

        Ok((
            orders
                .into_iter()
                .zip(items)
                .map(|(order, items)| OrderWithItems { order, items })
                .collect(),
            total,
        ))
    }

    /// Admin status override, constrained by the state machine. Setting the
    /// current status again is an idempotent no-op.
    #[instrument(skip(self))]
    pub async fn update_order_status(
        &self,
        order_id: &str,
        new_status: OrderStatus,
    ) -> Result<order::Model, ServiceError> {
        let order = OrderEntity::find_by_id(order_id.to_string())
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Order not found".to_string()))?;

        let current = parse_status(&order.status)?;
        if current == new_status {
            return Ok(order);
        }
        if !current.can_transition_to(new_status) {
            return Err(ServiceError::InvalidStatus(format!(
                "cannot transition from {} to {}",
                current, new_status
            )));
        }

        self.apply_status(order, current, new_status).await
    }

    /// Applies a status mapped from a gateway notification. Unknown orders,
    /// duplicates, and transitions the state machine rejects are all
    /// acknowledged without a state change so the gateway stops retrying.
    #[instrument(skip(self))]
    pub async fn apply_gateway_status(
        &self,
        order_id: &str,
        mapped: OrderStatus,
    ) -> Result<ReconcileOutcome, ServiceError> {
        let Some(order) = OrderEntity::find_by_id(order_id.to_string())
            .one(&*self.db)
            .await?
        else {
            warn!(order_id = %order_id, "Gateway notification for unknown order acknowledged");
            return Ok(ReconcileOutcome::Ignored);
        };

        let current = parse_status(&order.status)?;
        if mapped == OrderStatus::Pending || current == mapped {
            return Ok(ReconcileOutcome::Ignored);
        }
        if !current.can_transition_to(mapped) {
            warn!(order_id = %order_id, from = %current, to = %mapped, "Gateway notification outside the state machine, ignored");
            return Ok(ReconcileOutcome::Ignored);
        }

        self.apply_status(order, current, mapped).await?;
        Ok(ReconcileOutcome::Applied(mapped))
    }

    /// Writes a status transition and stamps the matching phase timestamp
    /// the first time the order enters that phase.
    async fn apply_status(
        &self,
        order: order::Model,
        current: OrderStatus,
        next: OrderStatus,
    ) -> Result<order::Model, ServiceError> {
        let order_id = order.id.clone();
        let now = Utc::now();

        let paid_at = order.paid_at;
        let delivered_at = order.delivered_at;
        let completed_at = order.completed_at;

        let mut active: order::ActiveModel = order.into();
        active.status = Set(next.to_string());
        active.updated_at = Set(Some(now));
        match next {
            OrderStatus::Paid if paid_at.is_none() => active.paid_at = Set(Some(now)),
            OrderStatus::Delivered if delivered_at.is_none() => {
                active.delivered_at = Set(Some(now))
            }
            OrderStatus::Completed if completed_at.is_none() => {
                active.completed_at = Set(Some(now))
            }
            _ => {}
        }

        let updated = active.update(&*self.db).await?;

        info!(order_id = %order_id, from = %current, to = %next, "Order status updated");
        self.event_sender
            .send_or_log(Event::OrderStatusChanged {
                order_id,
                old_status: current.to_string(),
                new_status: next.to_string(),
            })
            .await;

        Ok(updated)
    }
}

fn parse_status(raw: &str) -> Result<OrderStatus, ServiceError> {
    OrderStatus::from_str(raw)
        .map_err(|_| ServiceError::InternalError(format!("order has unknown status '{}'", raw)))
}
