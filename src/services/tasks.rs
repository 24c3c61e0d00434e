use crate::{
    config::WorkflowConfig,
    db::{self, DbPool},
    entities::account::Entity as AccountEntity,
    entities::device::{self, Entity as DeviceEntity},
    entities::export_ticket::{self, Entity as ExportTicketEntity, ExportType},
    entities::issue::{self, Entity as IssueEntity, FixType},
    entities::issue_spare_part::{self, Entity as IssueSparePartEntity},
    entities::request::{self, Entity as RequestEntity, RequestStatus},
    entities::task::{self, Entity as TaskEntity, TaskStatus, TaskType},
    errors::ServiceError,
    events::{outbox, Event, EventSender},
    services::exports::ExportService,
    services::inventory::InventoryService,
    services::requests::RequestService,
};
use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseTransaction, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct CreateTaskInput {
    pub request_id: Uuid,
    #[validate(length(min = 1, message = "At least one issue is required"))]
    pub issue_ids: Vec<Uuid>,
    pub task_type: TaskType,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct AssignFixerInput {
    pub fixer_id: Uuid,
    pub scheduled_date: DateTime<Utc>,
}

/// A task together with its bound issues and export history.
#[derive(Debug, Serialize, Deserialize)]
pub struct TaskDetail {
    pub task: task::Model,
    pub issues: Vec<issue::Model>,
    pub export_tickets: Vec<export_ticket::Model>,
}

/// Task workflow: creation against a request, fixer assignment with
/// warehouse dispatch, renewal device relocation, completion and the
/// cancellation cascade.
#[derive(Clone)]
pub struct TaskService {
    db_pool: Arc<DbPool>,
    event_sender: EventSender,
    workflow: WorkflowConfig,
    requests: RequestService,
}

impl TaskService {
    pub fn new(
        db_pool: Arc<DbPool>,
        event_sender: EventSender,
        workflow: WorkflowConfig,
        requests: RequestService,
    ) -> Self {
        Self {
            db_pool,
            event_sender,
            workflow,
            requests,
        }
    }

    /// Creates a task against a request and binds the given issues to it.
    /// A pending request moves to in-progress in the same transaction:
    /// staff picking up the first task is what starts the work.
    #[instrument(skip(self, input), fields(request_id = %input.request_id))]
    pub async fn create_task(&self, input: CreateTaskInput) -> Result<task::Model, ServiceError> {
        input.validate()?;

        let txn = db::begin_serializable(&self.db_pool)
            .await
            .map_err(ServiceError::db_error)?;

        let request = RequestEntity::find_by_id(input.request_id)
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("request {} not found", input.request_id))
            })?;

        if request.status == RequestStatus::Rejected {
            return Err(ServiceError::InvalidState(
                "cannot create a task for a rejected request".to_string(),
            ));
        }

        if self.workflow.single_open_task_per_request {
            let open_tasks = TaskEntity::find()
                .filter(task::Column::RequestId.eq(request.id))
                .filter(task::Column::Status.is_in([TaskStatus::AwaitingFixer, TaskStatus::Assigned]))
                .count(&txn)
                .await
                .map_err(ServiceError::db_error)?;
            if open_tasks > 0 {
                return Err(ServiceError::Conflict(format!(
                    "request {} already has an open task",
                    request.id
                )));
            }
        }

        let issues = IssueEntity::find()
            .filter(issue::Column::Id.is_in(input.issue_ids.clone()))
            .all(&txn)
            .await
            .map_err(ServiceError::db_error)?;

        if issues.len() != input.issue_ids.len() {
            return Err(ServiceError::NotFound(
                "one or more issues do not exist".to_string(),
            ));
        }
        for bound in &issues {
            if bound.request_id != request.id {
                return Err(ServiceError::ValidationError(format!(
                    "issue {} does not belong to request {}",
                    bound.id, request.id
                )));
            }
            if bound.task_id.is_some() {
                return Err(ServiceError::Conflict(format!(
                    "issue {} is already bound to a task",
                    bound.id
                )));
            }
        }

        let new_task = task::ActiveModel {
            id: Set(Uuid::new_v4()),
            request_id: Set(request.id),
            device_id: Set(request.device_id),
            device_renew_id: Set(None),
            fixer_id: Set(None),
            fixer_date: Set(None),
            task_type: Set(input.task_type),
            status: Set(TaskStatus::AwaitingFixer),
            cancel_by: Set(None),
            last_issues_data: Set(None),
            ..Default::default()
        };
        let new_task = new_task
            .insert(&txn)
            .await
            .map_err(ServiceError::db_error)?;

        IssueEntity::update_many()
            .col_expr(
                issue::Column::TaskId,
                sea_orm::sea_query::Expr::value(new_task.id),
            )
            .filter(issue::Column::Id.is_in(input.issue_ids))
            .exec(&txn)
            .await
            .map_err(ServiceError::db_error)?;

        if request.status == RequestStatus::Pending {
            let next = request.status.transition_to(RequestStatus::InProgress)?;
            let mut active: request::ActiveModel = request.into();
            active.status = Set(next);
            active.update(&txn).await.map_err(ServiceError::db_error)?;
        }

        let event = Event::TaskCreated {
            task_id: new_task.id,
            request_id: new_task.request_id,
        };
        outbox::enqueue(&txn, "task", new_task.id, &event).await?;

        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(task_id = %new_task.id, issues = issues.len(), "task created");
        metrics::counter!("fixflow_tasks_created", 1);
        self.event_sender.emit(event).await;

        Ok(new_task)
    }

    /// Assigns a fixer to an awaiting task and, when any bound issue needs
    /// material (a spare part demand, or a replace fix), opens the one
    /// export ticket covering all of them.
    #[instrument(skip(self, input), fields(task_id = %task_id, fixer_id = %input.fixer_id))]
    pub async fn assign_fixer(
        &self,
        task_id: Uuid,
        input: AssignFixerInput,
    ) -> Result<task::Model, ServiceError> {
        input.validate()?;

        let txn = db::begin_serializable(&self.db_pool)
            .await
            .map_err(ServiceError::db_error)?;

        let found = TaskEntity::find_by_id(task_id)
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("task {} not found", task_id)))?;

        if found.fixer_id.is_some() {
            return Err(ServiceError::InvalidState(format!(
                "task {} already has a fixer",
                task_id
            )));
        }
        let next = found.status.transition_to(TaskStatus::Assigned)?;

        let fixer = AccountEntity::find_by_id(input.fixer_id)
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?
            .filter(|a| !a.is_deleted())
            .ok_or_else(|| {
                ServiceError::NotFound(format!("fixer account {} is not valid", input.fixer_id))
            })?;

        let mut active: task::ActiveModel = found.clone().into();
        active.fixer_id = Set(Some(fixer.id));
        active.fixer_date = Set(Some(input.scheduled_date));
        active.status = Set(next);
        let updated = active.update(&txn).await.map_err(ServiceError::db_error)?;

        let material_issues = self.material_issues_on(&txn, task_id).await?;
        let existing_ticket = ExportTicketEntity::find()
            .filter(export_ticket::Column::TaskId.eq(task_id))
            .filter(export_ticket::Column::Status.ne(export_ticket::ExportStatus::Cancel))
            .count(&txn)
            .await
            .map_err(ServiceError::db_error)?;

        let mut opened_ticket = None;
        // A renewal task may already carry the device ticket opened when
        // its replacement was assigned; that ticket covers the dispatch.
        if !material_issues.is_empty() && existing_ticket == 0 {
            let (export_type, detail) = match updated.task_type {
                TaskType::Renew => {
                    let renew_id = updated.device_renew_id.ok_or_else(|| {
                        ServiceError::InvalidState(
                            "renewal device must be assigned before the fixer".to_string(),
                        )
                    })?;
                    (ExportType::Device, json!(renew_id))
                }
                TaskType::Repair => (ExportType::SparePart, json!(material_issues)),
            };
            let ticket = ExportService::open_on(&txn, task_id, export_type, detail).await?;
            opened_ticket = Some(ticket.id);
        }

        let event = Event::TaskAssigned {
            task_id,
            fixer_id: fixer.id,
            scheduled_for: input.scheduled_date,
        };
        outbox::enqueue(&txn, "task", task_id, &event).await?;

        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(
            material_issues = material_issues.len(),
            export_opened = opened_ticket.is_some(),
            "fixer assigned"
        );
        metrics::counter!("fixflow_tasks_assigned", 1);
        self.event_sender.emit(event).await;
        if let Some(ticket_id) = opened_ticket {
            self.event_sender
                .emit(Event::ExportOpened { ticket_id, task_id })
                .await;
        }

        Ok(updated)
    }

    /// Assigns the replacement device for a renewal task.
    ///
    /// The physical position moves from the old device to the new one as a
    /// single relocation: the new device inherits area and coordinates,
    /// the old one ends up unpositioned and inactive, and the task records
    /// the replacement. A device export ticket is opened for the dispatch.
    /// All of it commits together or not at all.
    #[instrument(skip(self), fields(task_id = %task_id, new_device_id = %new_device_id))]
    pub async fn assign_renewal_device(
        &self,
        task_id: Uuid,
        new_device_id: Uuid,
    ) -> Result<task::Model, ServiceError> {
        let txn = self
            .db_pool
            .begin()
            .await
            .map_err(ServiceError::db_error)?;

        let found = TaskEntity::find_by_id(task_id)
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("task {} not found", task_id)))?;

        if found.status.is_terminal() {
            return Err(ServiceError::InvalidState(format!(
                "task {} is {}",
                task_id, found.status
            )));
        }

        let old_device = DeviceEntity::find_by_id(found.device_id)
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("device {} not found", found.device_id))
            })?;

        let new_device = DeviceEntity::find_by_id(new_device_id)
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?
            .filter(|d| !d.is_deleted())
            .ok_or_else(|| {
                ServiceError::NotFound(format!("device {} is not valid", new_device_id))
            })?;

        let mut new_active: device::ActiveModel = new_device.into();
        new_active.area_id = Set(old_device.area_id);
        new_active.position_x = Set(old_device.position_x);
        new_active.position_y = Set(old_device.position_y);
        new_active.active = Set(true);
        new_active.update(&txn).await.map_err(ServiceError::db_error)?;

        let old_device_id = old_device.id;
        let mut old_active: device::ActiveModel = old_device.into();
        old_active.area_id = Set(None);
        old_active.position_x = Set(None);
        old_active.position_y = Set(None);
        old_active.active = Set(false);
        old_active.update(&txn).await.map_err(ServiceError::db_error)?;

        let mut active: task::ActiveModel = found.into();
        active.device_renew_id = Set(Some(new_device_id));
        let updated = active.update(&txn).await.map_err(ServiceError::db_error)?;

        let ticket =
            ExportService::open_on(&txn, task_id, ExportType::Device, json!(new_device_id)).await?;

        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(ticket_id = %ticket.id, "renewal device assigned, positions swapped");
        self.event_sender
            .emit(Event::DeviceRelocated {
                old_device_id,
                new_device_id,
            })
            .await;
        self.event_sender
            .emit(Event::ExportOpened {
                ticket_id: ticket.id,
                task_id,
            })
            .await;

        Ok(updated)
    }

    /// Marks an assigned task completed, then reports back to the request
    /// workflow so the owning request can be evaluated for closure.
    #[instrument(skip(self), fields(task_id = %task_id))]
    pub async fn complete_task(&self, task_id: Uuid) -> Result<task::Model, ServiceError> {
        let db = &*self.db_pool;

        let found = TaskEntity::find_by_id(task_id)
            .one(db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("task {} not found", task_id)))?;

        let next = found.status.transition_to(TaskStatus::Completed)?;

        let mut active: task::ActiveModel = found.into();
        active.status = Set(next);
        let updated = active.update(db).await.map_err(ServiceError::db_error)?;

        info!("task completed");
        metrics::counter!("fixflow_tasks_completed", 1);
        self.event_sender.emit(Event::TaskCompleted(task_id)).await;

        self.requests.evaluate_closure(updated.request_id).await?;

        Ok(updated)
    }

    /// Cancels a task and unwinds what it holds, atomically: the bound
    /// issues are released back to the request (their rows survive, only
    /// the task reference is cleared), the issue list is snapshotted for
    /// audit, and a still-waiting export ticket is cancelled. No
    /// interleaved reader can observe a cancelled task with issues still
    /// bound.
    #[instrument(skip(self), fields(task_id = %task_id, actor = %actor_id))]
    pub async fn cancel_task(
        &self,
        task_id: Uuid,
        actor_id: Uuid,
    ) -> Result<task::Model, ServiceError> {
        let txn = self
            .db_pool
            .begin()
            .await
            .map_err(ServiceError::db_error)?;

        let found = TaskEntity::find_by_id(task_id)
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("task {} not found", task_id)))?;

        let next = found.status.transition_to(TaskStatus::Cancelled)?;

        let snapshot = self.snapshot_issues_on(&txn, task_id).await?;

        let mut active: task::ActiveModel = found.into();
        active.status = Set(next);
        active.cancel_by = Set(Some(actor_id));
        active.last_issues_data = Set(Some(snapshot));
        let updated = active.update(&txn).await.map_err(ServiceError::db_error)?;

        IssueEntity::update_many()
            .col_expr(
                issue::Column::TaskId,
                sea_orm::sea_query::Expr::value(Option::<Uuid>::None),
            )
            .filter(issue::Column::TaskId.eq(task_id))
            .exec(&txn)
            .await
            .map_err(ServiceError::db_error)?;

        let cancelled_ticket = ExportService::cancel_active_for_task_on(&txn, task_id).await?;

        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(
            export_cancelled = cancelled_ticket.is_some(),
            "task cancelled, issues released"
        );
        metrics::counter!("fixflow_tasks_cancelled", 1);
        self.event_sender
            .emit(Event::TaskCancelled {
                task_id,
                cancelled_by: actor_id,
            })
            .await;
        if let Some(ticket_id) = cancelled_ticket {
            self.event_sender.emit(Event::ExportCancelled(ticket_id)).await;
        }

        Ok(updated)
    }

    /// Re-exposes a task for fixer assignment. When
    /// `workflow.enforce_stock_before_fixer` is set, the aggregated spare
    /// part demand of the bound issues must be coverable by current stock;
    /// otherwise the task is left untouched and the shortfall is surfaced.
    #[instrument(skip(self), fields(task_id = %task_id))]
    pub async fn update_status_to_awaiting_fixer(
        &self,
        task_id: Uuid,
    ) -> Result<task::Model, ServiceError> {
        let txn = self
            .db_pool
            .begin()
            .await
            .map_err(ServiceError::db_error)?;

        let found = TaskEntity::find_by_id(task_id)
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("task {} not found", task_id)))?;

        let next = found.status.transition_to(TaskStatus::AwaitingFixer)?;

        if self.workflow.enforce_stock_before_fixer {
            let bound: Vec<Uuid> = IssueEntity::find()
                .filter(issue::Column::TaskId.eq(task_id))
                .all(&txn)
                .await
                .map_err(ServiceError::db_error)?
                .into_iter()
                .map(|i| i.id)
                .collect();
            InventoryService::verify_stock_for_issues_on(&txn, &bound).await?;
        }

        let mut active: task::ActiveModel = found.into();
        active.status = Set(next);
        let updated = active.update(&txn).await.map_err(ServiceError::db_error)?;

        txn.commit().await.map_err(ServiceError::db_error)?;

        Ok(updated)
    }

    /// Fetches a task with its issues and export history.
    #[instrument(skip(self))]
    pub async fn get_task(&self, task_id: Uuid) -> Result<TaskDetail, ServiceError> {
        let db = &*self.db_pool;

        let found = TaskEntity::find_by_id(task_id)
            .one(db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("task {} not found", task_id)))?;

        let issues = IssueEntity::find()
            .filter(issue::Column::TaskId.eq(task_id))
            .all(db)
            .await
            .map_err(ServiceError::db_error)?;

        let export_tickets = ExportTicketEntity::find()
            .filter(export_ticket::Column::TaskId.eq(task_id))
            .order_by_desc(export_ticket::Column::CreatedAt)
            .all(db)
            .await
            .map_err(ServiceError::db_error)?;

        Ok(TaskDetail {
            task: found,
            issues,
            export_tickets,
        })
    }

    /// Lists tasks with pagination, newest first, optionally filtered by
    /// status.
    #[instrument(skip(self))]
    pub async fn list_tasks(
        &self,
        page: u64,
        per_page: u64,
        status: Option<TaskStatus>,
    ) -> Result<(Vec<task::Model>, u64), ServiceError> {
        let mut query = TaskEntity::find();
        if let Some(status) = status {
            query = query.filter(task::Column::Status.eq(status));
        }

        let paginator = query
            .order_by_desc(task::Column::CreatedAt)
            .paginate(&*self.db_pool, per_page.max(1));

        let total = paginator.num_items().await.map_err(ServiceError::db_error)?;
        let tasks = paginator
            .fetch_page(page.saturating_sub(1))
            .await
            .map_err(ServiceError::db_error)?;

        Ok((tasks, total))
    }

    /// Bound issues that need anything from the warehouse: a spare part
    /// demand or a replace-type fix.
    async fn material_issues_on(
        &self,
        txn: &DatabaseTransaction,
        task_id: Uuid,
    ) -> Result<Vec<Uuid>, ServiceError> {
        let issues = IssueEntity::find()
            .filter(issue::Column::TaskId.eq(task_id))
            .all(txn)
            .await
            .map_err(ServiceError::db_error)?;

        let mut material = Vec::new();
        for bound in issues {
            if bound.fix_type == FixType::Replace {
                material.push(bound.id);
                continue;
            }
            let demand = IssueSparePartEntity::find()
                .filter(issue_spare_part::Column::IssueId.eq(bound.id))
                .count(txn)
                .await
                .map_err(ServiceError::db_error)?;
            if demand > 0 {
                material.push(bound.id);
            }
        }

        Ok(material)
    }

    /// Immutable audit copy of the task's current issue list, taken at
    /// cancellation time.
    async fn snapshot_issues_on(
        &self,
        txn: &DatabaseTransaction,
        task_id: Uuid,
    ) -> Result<serde_json::Value, ServiceError> {
        let issues = IssueEntity::find()
            .filter(issue::Column::TaskId.eq(task_id))
            .all(txn)
            .await
            .map_err(ServiceError::db_error)?;

        let mut entries = Vec::with_capacity(issues.len());
        for bound in issues {
            let parts = IssueSparePartEntity::find()
                .filter(issue_spare_part::Column::IssueId.eq(bound.id))
                .all(txn)
                .await
                .map_err(ServiceError::db_error)?;
            entries.push(json!({
                "id": bound.id,
                "type_error_id": bound.type_error_id,
                "fix_type": bound.fix_type,
                "status": bound.status,
                "spare_parts": parts
                    .iter()
                    .map(|p| json!({
                        "spare_part_id": p.spare_part_id,
                        "quantity": p.quantity,
                    }))
                    .collect::<Vec<_>>(),
            }));
        }

        Ok(serde_json::Value::Array(entries))
    }
}
