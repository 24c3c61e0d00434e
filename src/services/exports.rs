use crate::{
    db::{self, DbPool},
    entities::export_ticket::{
        self, Entity as ExportTicketEntity, ExportStatus, ExportType,
    },
    entities::issue_spare_part::{self, Entity as IssueSparePartEntity},
    entities::task::Entity as TaskEntity,
    errors::ServiceError,
    events::{outbox, Event, EventSender},
    services::inventory::InventoryService,
};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, Set,
};
use serde_json::Value as Json;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

/// Warehouse export workflow.
///
/// A task owns at most one non-cancelled ticket at a time; cancelled
/// tickets accumulate as history. Stock is debited only when a ticket is
/// marked exported, never while it waits.
#[derive(Clone)]
pub struct ExportService {
    db_pool: Arc<DbPool>,
    event_sender: EventSender,
}

impl ExportService {
    pub fn new(db_pool: Arc<DbPool>, event_sender: EventSender) -> Self {
        Self {
            db_pool,
            event_sender,
        }
    }

    /// Opens a ticket inside the caller's transaction. The
    /// single-active-ticket check runs on the same connection as the
    /// insert, so it must be a serializable (or SQLite) transaction to be
    /// race-free.
    pub async fn open_on<C: ConnectionTrait>(
        conn: &C,
        task_id: Uuid,
        export_type: ExportType,
        detail: Json,
    ) -> Result<export_ticket::Model, ServiceError> {
        TaskEntity::find_by_id(task_id)
            .one(conn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("task {} not found", task_id)))?;

        let active_tickets = ExportTicketEntity::find()
            .filter(export_ticket::Column::TaskId.eq(task_id))
            .filter(export_ticket::Column::Status.ne(ExportStatus::Cancel))
            .count(conn)
            .await
            .map_err(ServiceError::db_error)?;

        if active_tickets > 0 {
            return Err(ServiceError::Conflict(format!(
                "task {} already has an active export ticket",
                task_id
            )));
        }

        let ticket = export_ticket::ActiveModel {
            id: Set(Uuid::new_v4()),
            task_id: Set(task_id),
            export_type: Set(export_type),
            detail: Set(detail),
            status: Set(ExportStatus::Waiting),
            ..Default::default()
        };

        ticket.insert(conn).await.map_err(ServiceError::db_error)
    }

    /// Opens a ticket for a task's material or device needs.
    #[instrument(skip(self, detail), fields(task_id = %task_id))]
    pub async fn open_export(
        &self,
        task_id: Uuid,
        export_type: ExportType,
        detail: Json,
    ) -> Result<export_ticket::Model, ServiceError> {
        let txn = db::begin_serializable(&self.db_pool)
            .await
            .map_err(ServiceError::db_error)?;

        let ticket = Self::open_on(&txn, task_id, export_type, detail).await?;
        outbox::enqueue(
            &txn,
            "export_ticket",
            ticket.id,
            &Event::ExportOpened {
                ticket_id: ticket.id,
                task_id,
            },
        )
        .await?;

        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(ticket_id = %ticket.id, "export ticket opened");
        metrics::counter!("fixflow_exports_opened", 1);
        self.event_sender
            .emit(Event::ExportOpened {
                ticket_id: ticket.id,
                task_id,
            })
            .await;

        Ok(ticket)
    }

    /// Fulfils a waiting ticket.
    ///
    /// For spare part tickets every referenced issue's part demand is
    /// debited in the ticket's own transaction; one shortfall aborts the
    /// whole batch and the ticket stays `Waiting` with no stock moved.
    #[instrument(skip(self), fields(ticket_id = %ticket_id))]
    pub async fn mark_exported(
        &self,
        ticket_id: Uuid,
    ) -> Result<export_ticket::Model, ServiceError> {
        // Serializable so two concurrent fulfilments of the same ticket
        // cannot both pass the Waiting check and debit twice.
        let txn = db::begin_serializable(&self.db_pool)
            .await
            .map_err(ServiceError::db_error)?;

        let ticket = ExportTicketEntity::find_by_id(ticket_id)
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("export ticket {} not found", ticket_id))
            })?;

        let next = ticket.status.transition_to(ExportStatus::Exported)?;

        let mut debits: Vec<(Uuid, i32, i32)> = Vec::new();
        if ticket.export_type == ExportType::SparePart {
            let issue_ids = ticket.issue_detail().ok_or_else(|| {
                ServiceError::ValidationError(format!(
                    "export ticket {} carries no issue list",
                    ticket_id
                ))
            })?;

            let requirements = IssueSparePartEntity::find()
                .filter(issue_spare_part::Column::IssueId.is_in(issue_ids))
                .all(&txn)
                .await
                .map_err(ServiceError::db_error)?;

            for req in &requirements {
                let remaining =
                    InventoryService::debit_on(&txn, req.spare_part_id, req.quantity).await?;
                debits.push((req.spare_part_id, req.quantity, remaining));
            }
        }

        let mut active: export_ticket::ActiveModel = ticket.into();
        active.status = Set(next);
        let ticket = active.update(&txn).await.map_err(ServiceError::db_error)?;

        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(parts_debited = debits.len(), "export ticket fulfilled");
        metrics::counter!("fixflow_exports_fulfilled", 1);
        self.event_sender.emit(Event::ExportCompleted(ticket.id)).await;
        for (spare_part_id, quantity, remaining) in debits {
            self.event_sender
                .emit(Event::StockDebited {
                    spare_part_id,
                    quantity,
                    remaining,
                })
                .await;
        }

        Ok(ticket)
    }

    /// Cancels a ticket. Already-terminal tickets are returned unchanged:
    /// the task cancellation cascade re-cancels blindly and must not fail
    /// on a ticket that was exported or cancelled in the meantime.
    #[instrument(skip(self), fields(ticket_id = %ticket_id))]
    pub async fn cancel_export(
        &self,
        ticket_id: Uuid,
    ) -> Result<export_ticket::Model, ServiceError> {
        // Serializable so a cancel racing a fulfilment cannot overwrite a
        // ticket that just became Exported.
        let txn = db::begin_serializable(&self.db_pool)
            .await
            .map_err(ServiceError::db_error)?;

        let ticket = ExportTicketEntity::find_by_id(ticket_id)
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("export ticket {} not found", ticket_id))
            })?;

        if ticket.status.is_terminal() {
            return Ok(ticket);
        }

        let mut active: export_ticket::ActiveModel = ticket.into();
        active.status = Set(ExportStatus::Cancel);
        let ticket = active.update(&txn).await.map_err(ServiceError::db_error)?;

        txn.commit().await.map_err(ServiceError::db_error)?;

        info!("export ticket cancelled");
        self.event_sender.emit(Event::ExportCancelled(ticket.id)).await;

        Ok(ticket)
    }

    /// Cancels a task's waiting ticket inside the caller's transaction.
    /// Used by the task cancellation cascade; exported or already
    /// cancelled tickets are left untouched. Returns the cancelled ticket
    /// id, if any.
    pub async fn cancel_active_for_task_on<C: ConnectionTrait>(
        conn: &C,
        task_id: Uuid,
    ) -> Result<Option<Uuid>, ServiceError> {
        let ticket = ExportTicketEntity::find()
            .filter(export_ticket::Column::TaskId.eq(task_id))
            .filter(export_ticket::Column::Status.eq(ExportStatus::Waiting))
            .one(conn)
            .await
            .map_err(ServiceError::db_error)?;

        match ticket {
            Some(ticket) => {
                let ticket_id = ticket.id;
                let mut active: export_ticket::ActiveModel = ticket.into();
                active.status = Set(ExportStatus::Cancel);
                active.update(conn).await.map_err(ServiceError::db_error)?;
                Ok(Some(ticket_id))
            }
            None => Ok(None),
        }
    }

    #[instrument(skip(self))]
    pub async fn get_export(
        &self,
        ticket_id: Uuid,
    ) -> Result<export_ticket::Model, ServiceError> {
        ExportTicketEntity::find_by_id(ticket_id)
            .one(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("export ticket {} not found", ticket_id))
            })
    }

    /// Lists tickets with pagination, newest first, optionally filtered by
    /// status.
    #[instrument(skip(self))]
    pub async fn list_exports(
        &self,
        page: u64,
        per_page: u64,
        status: Option<ExportStatus>,
    ) -> Result<(Vec<export_ticket::Model>, u64), ServiceError> {
        let mut query = ExportTicketEntity::find();
        if let Some(status) = status {
            query = query.filter(export_ticket::Column::Status.eq(status));
        }

        let paginator = query
            .order_by_desc(export_ticket::Column::CreatedAt)
            .paginate(&*self.db_pool, per_page.max(1));

        let total = paginator.num_items().await.map_err(ServiceError::db_error)?;
        let tickets = paginator
            .fetch_page(page.saturating_sub(1))
            .await
            .map_err(ServiceError::db_error)?;

        Ok((tickets, total))
    }
}
