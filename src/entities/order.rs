use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use utoipa::ToSchema;

/// Order header. Member and guest orders share this table: a member order
/// carries `user_id`, a guest order carries the `customer_*` contact
/// fields. Exactly one ownership mode is set per order.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    /// Human-readable order id, e.g. `KQT-202403100800`. Immutable.
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    pub user_id: Option<Uuid>,
    pub customer_name: Option<String>,
    pub customer_email: Option<String>,
    pub customer_phone: Option<String>,

    pub status: String,

    /// Sum of line-item price x quantity, computed server-side at creation.
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub total_price: Decimal,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub shipping_price: Decimal,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub tax_amount: Decimal,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub discount_amount: Decimal,

    /// Address snapshot captured at order time; later address-book edits
    /// must not alter past orders.
    #[sea_orm(column_type = "Json", nullable)]
    pub shipping_address: Option<Json>,

    pub payment_method: Option<String>,
    /// Hosted-payment session token, set once by the gateway adapter.
    pub payment_token: Option<String>,
    pub payment_redirect_url: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    /// Phase timestamps, each stamped exactly once on first entry.
    pub paid_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::order_item::Entity")]
    OrderItems,
}

impl Related<super::order_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::OrderItems.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

/// Order lifecycle states.
///
/// `pending -> {paid, cancelled, expired}`; `paid -> processing`;
/// `processing -> shipping`; `shipping -> {delivered, completed}`;
/// `delivered -> completed`; any non-terminal state may be cancelled by an
/// admin override, and `paid`/`completed` may be refunded by one.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, ToSchema,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Paid,
    Processing,
    Shipping,
    Delivered,
    Completed,
    Cancelled,
    Refunded,
    Expired,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Completed
                | OrderStatus::Cancelled
                | OrderStatus::Refunded
                | OrderStatus::Expired
        )
    }

    /// Whether the state machine permits moving from `self` to `next`.
    /// Re-entering the current state is not a transition (callers treat it
    /// as a no-op).
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        if self == next {
            return false;
        }
        match (self, next) {
            (Pending, Paid | Expired) => true,
            (Paid, Processing | Refunded) => true,
            (Processing, Shipping) => true,
            (Shipping, Delivered | Completed) => true,
            (Delivered, Completed) => true,
            (Completed, Refunded) => true,
            (from, Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }

    /// Customer-facing label, kept from the storefront UI.
    pub fn label(self) -> &'static str {
        match self {
            OrderStatus::Pending => "Menunggu Pembayaran",
            OrderStatus::Paid => "Dibayar",
            OrderStatus::Processing => "Diproses",
            OrderStatus::Shipping => "Dikirim",
            OrderStatus::Delivered => "Terkirim",
            OrderStatus::Completed => "Selesai",
            OrderStatus::Cancelled => "Dibatalkan",
            OrderStatus::Refunded => "Dikembalikan",
            OrderStatus::Expired => "Kedaluwarsa",
        }
    }
}
