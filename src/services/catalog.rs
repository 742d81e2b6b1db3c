use crate::{
    entities::product_variant::{self, Entity as ProductVariantEntity},
    errors::ServiceError,
};
use rust_decimal::Decimal;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

/// Authoritative price and stock for one variant at snapshot time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VariantRecord {
    pub price: Decimal,
    pub quantity: i32,
}

/// Read-only view over the product catalog. Always hits the database: stock
/// changes between requests must be visible immediately, so results are
/// never cached.
#[derive(Clone)]
pub struct CatalogService {
    db: Arc<DatabaseConnection>,
}

impl CatalogService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Batch-fetch current `{price, quantity}` for the given variant ids.
    /// Ids that do not exist (or are inactive) are simply absent from the
    /// result; callers must detect the gap.
    #[instrument(skip(self))]
    pub async fn variant_snapshot(
        &self,
        ids: &[Uuid],
    ) -> Result<HashMap<Uuid, VariantRecord>, ServiceError> {
        if ids.is_empty() {
            return Err(ServiceError::InvalidInput(
                "at least one variant id is required".to_string(),
            ));
        }

        let variants = ProductVariantEntity::find()
            .filter(product_variant::Column::Id.is_in(ids.to_vec()))
            .filter(product_variant::Column::IsActive.eq(true))
            .all(&*self.db)
            .await?;

        Ok(variants
            .into_iter()
            .map(|v| {
                (
                    v.id,
                    VariantRecord {
                        price: v.price,
                        quantity: v.quantity,
                    },
                )
            })
            .collect())
    }
}
