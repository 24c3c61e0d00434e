use crate::{
    db::DbPool,
    entities::issue_spare_part::{self, Entity as IssueSparePartEntity},
    entities::spare_part::{self, Entity as SparePartEntity},
    errors::ServiceError,
    events::{Event, EventSender},
};
use chrono::Utc;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct CreateSparePartInput {
    #[validate(length(min = 1, max = 200, message = "Part name is required"))]
    pub name: String,
    #[validate(range(min = 0, message = "Initial quantity cannot be negative"))]
    pub quantity: i32,
}

/// Ledger for spare part stock.
///
/// Stock moves only at export time: quantities are debited when a ticket is
/// marked exported, not when a fixer is assigned. The debit is a guarded
/// conditional decrement, so no interleaving of concurrent exports can
/// drive a quantity negative.
#[derive(Clone)]
pub struct InventoryService {
    db_pool: Arc<DbPool>,
    event_sender: EventSender,
}

impl InventoryService {
    pub fn new(db_pool: Arc<DbPool>, event_sender: EventSender) -> Self {
        Self {
            db_pool,
            event_sender,
        }
    }

    /// Registers a new spare part with its opening stock.
    #[instrument(skip(self, input), fields(name = %input.name))]
    pub async fn create_spare_part(
        &self,
        input: CreateSparePartInput,
    ) -> Result<spare_part::Model, ServiceError> {
        input.validate()?;

        let part = spare_part::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(input.name),
            quantity: Set(input.quantity),
            updated_at: Set(Some(Utc::now())),
        };

        let part = part
            .insert(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?;

        info!(spare_part_id = %part.id, quantity = part.quantity, "spare part registered");
        Ok(part)
    }

    /// Debits `quantity` units from a part inside the caller's transaction.
    ///
    /// The decrement only applies when `quantity <= stock`; otherwise the
    /// statement matches no row and the call fails with
    /// `InsufficientStock`, leaving the caller's transaction to roll back
    /// the whole batch. Returns the remaining quantity.
    pub async fn debit_on<C: ConnectionTrait>(
        conn: &C,
        spare_part_id: Uuid,
        quantity: i32,
    ) -> Result<i32, ServiceError> {
        if quantity <= 0 {
            return Err(ServiceError::ValidationError(
                "debit quantity must be positive".to_string(),
            ));
        }

        let result = SparePartEntity::update_many()
            .col_expr(
                spare_part::Column::Quantity,
                Expr::col(spare_part::Column::Quantity).sub(quantity),
            )
            .col_expr(spare_part::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(spare_part::Column::Id.eq(spare_part_id))
            .filter(spare_part::Column::Quantity.gte(quantity))
            .exec(conn)
            .await
            .map_err(ServiceError::db_error)?;

        if result.rows_affected == 0 {
            // Either the part does not exist or the guard refused.
            let part = SparePartEntity::find_by_id(spare_part_id)
                .one(conn)
                .await
                .map_err(ServiceError::db_error)?
                .ok_or_else(|| {
                    ServiceError::NotFound(format!("spare part {} not found", spare_part_id))
                })?;
            return Err(ServiceError::InsufficientStock(format!(
                "spare part '{}' has {} units, {} requested",
                part.name, part.quantity, quantity
            )));
        }

        let remaining = SparePartEntity::find_by_id(spare_part_id)
            .one(conn)
            .await
            .map_err(ServiceError::db_error)?
            .map(|p| p.quantity)
            .unwrap_or_default();

        Ok(remaining)
    }

    /// Standalone debit in its own transaction. Warehouse exports use
    /// [`InventoryService::debit_on`] inside the ticket transaction
    /// instead.
    #[instrument(skip(self))]
    pub async fn debit(&self, spare_part_id: Uuid, quantity: i32) -> Result<i32, ServiceError> {
        let txn = self
            .db_pool
            .begin()
            .await
            .map_err(ServiceError::db_error)?;

        let remaining = Self::debit_on(&txn, spare_part_id, quantity).await?;

        txn.commit().await.map_err(ServiceError::db_error)?;

        metrics::counter!("fixflow_stock_debits", 1);
        self.event_sender
            .emit(Event::StockDebited {
                spare_part_id,
                quantity,
                remaining,
            })
            .await;

        Ok(remaining)
    }

    /// Adds received stock to a part.
    #[instrument(skip(self))]
    pub async fn restock(
        &self,
        spare_part_id: Uuid,
        quantity: i32,
    ) -> Result<spare_part::Model, ServiceError> {
        if quantity <= 0 {
            return Err(ServiceError::ValidationError(
                "restock quantity must be positive".to_string(),
            ));
        }

        let db = &*self.db_pool;
        let part = SparePartEntity::find_by_id(spare_part_id)
            .one(db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("spare part {} not found", spare_part_id))
            })?;

        let new_quantity = part.quantity + quantity;
        let mut active: spare_part::ActiveModel = part.into();
        active.quantity = Set(new_quantity);
        active.updated_at = Set(Some(Utc::now()));
        let part = active.update(db).await.map_err(ServiceError::db_error)?;

        self.event_sender
            .emit(Event::StockReceived {
                spare_part_id,
                quantity,
            })
            .await;

        Ok(part)
    }

    #[instrument(skip(self))]
    pub async fn get_spare_part(
        &self,
        spare_part_id: Uuid,
    ) -> Result<spare_part::Model, ServiceError> {
        SparePartEntity::find_by_id(spare_part_id)
            .one(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("spare part {} not found", spare_part_id))
            })
    }

    /// Lists spare parts with pagination, lowest stock first.
    #[instrument(skip(self))]
    pub async fn list_spare_parts(
        &self,
        page: u64,
        per_page: u64,
    ) -> Result<(Vec<spare_part::Model>, u64), ServiceError> {
        let paginator = SparePartEntity::find()
            .order_by_asc(spare_part::Column::Quantity)
            .paginate(&*self.db_pool, per_page.max(1));

        let total = paginator.num_items().await.map_err(ServiceError::db_error)?;
        let parts = paginator
            .fetch_page(page.saturating_sub(1))
            .await
            .map_err(ServiceError::db_error)?;

        Ok((parts, total))
    }

    /// Whether `quantity` units of a part are currently on hand.
    #[instrument(skip(self))]
    pub async fn is_in_stock(
        &self,
        spare_part_id: Uuid,
        quantity: i32,
    ) -> Result<bool, ServiceError> {
        let part = self.get_spare_part(spare_part_id).await?;
        Ok(part.quantity >= quantity)
    }

    /// Verifies that current stock covers the aggregated part demand of
    /// the given issues. Demand is summed across issues before comparing,
    /// so two issues needing the same part are not each checked against
    /// the full stock.
    pub async fn verify_stock_for_issues_on<C: ConnectionTrait>(
        conn: &C,
        issue_ids: &[Uuid],
    ) -> Result<(), ServiceError> {
        if issue_ids.is_empty() {
            return Ok(());
        }

        let requirements = IssueSparePartEntity::find()
            .filter(issue_spare_part::Column::IssueId.is_in(issue_ids.to_vec()))
            .all(conn)
            .await
            .map_err(ServiceError::db_error)?;

        let mut demand: HashMap<Uuid, i32> = HashMap::new();
        for req in &requirements {
            *demand.entry(req.spare_part_id).or_default() += req.quantity;
        }

        for (spare_part_id, required) in demand {
            let part = SparePartEntity::find_by_id(spare_part_id)
                .one(conn)
                .await
                .map_err(ServiceError::db_error)?
                .ok_or_else(|| {
                    ServiceError::NotFound(format!("spare part {} not found", spare_part_id))
                })?;
            if part.quantity < required {
                warn!(
                    spare_part_id = %spare_part_id,
                    available = part.quantity,
                    required,
                    "stock shortfall"
                );
                return Err(ServiceError::InsufficientStock(format!(
                    "spare part '{}' has {} units, {} required",
                    part.name, part.quantity, required
                )));
            }
        }

        Ok(())
    }
}
