use crate::{
    config::WorkflowConfig,
    db::{self, DbPool},
    entities::account::{Entity as AccountEntity, Role},
    entities::device::Entity as DeviceEntity,
    entities::feedback::{self},
    entities::issue::{self, Entity as IssueEntity, IssueStatus},
    entities::request::{self, Entity as RequestEntity, RequestStatus},
    entities::task::{self, Entity as TaskEntity, TaskStatus},
    errors::ServiceError,
    events::{outbox, Event, EventSender},
};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct CreateRequestInput {
    pub requester_id: Uuid,
    pub device_id: Uuid,
    #[validate(length(max = 500, message = "Note must be at most 500 characters"))]
    pub requester_note: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct ConfirmRequestInput {
    #[validate(length(min = 1, max = 1000, message = "Feedback content is required"))]
    pub content: String,
}

/// Request workflow: intake, requester-side closure and cancellation, and
/// aggregation of task completion into the request lifecycle.
#[derive(Clone)]
pub struct RequestService {
    db_pool: Arc<DbPool>,
    event_sender: EventSender,
    workflow: WorkflowConfig,
}

impl RequestService {
    pub fn new(db_pool: Arc<DbPool>, event_sender: EventSender, workflow: WorkflowConfig) -> Self {
        Self {
            db_pool,
            event_sender,
            workflow,
        }
    }

    /// Files a new request for a broken device.
    ///
    /// The duplicate gate (one non-terminal request per device) is checked
    /// in the same serializable transaction as the insert, so two
    /// concurrent reports of the same device cannot both pass.
    #[instrument(skip(self, input), fields(requester_id = %input.requester_id, device_id = %input.device_id))]
    pub async fn create_request(
        &self,
        input: CreateRequestInput,
    ) -> Result<request::Model, ServiceError> {
        input.validate()?;

        let txn = db::begin_serializable(&self.db_pool)
            .await
            .map_err(ServiceError::db_error)?;

        let requester = AccountEntity::find_by_id(input.requester_id)
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?
            .filter(|a| !a.is_deleted() && a.role == Role::Head)
            .ok_or_else(|| {
                ServiceError::NotFound(format!(
                    "requester account {} is not valid",
                    input.requester_id
                ))
            })?;

        let device = DeviceEntity::find_by_id(input.device_id)
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?
            .filter(|d| !d.is_deleted())
            .ok_or_else(|| {
                ServiceError::NotFound(format!("device {} is not valid", input.device_id))
            })?;

        let open_request = RequestEntity::find()
            .filter(request::Column::DeviceId.eq(device.id))
            .filter(request::Column::Status.is_in(RequestStatus::ACTIVE))
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?;

        if let Some(existing) = open_request {
            return Err(ServiceError::Conflict(format!(
                "device {} already has an open request ({})",
                device.id, existing.id
            )));
        }

        let new_request = request::ActiveModel {
            id: Set(Uuid::new_v4()),
            requester_id: Set(requester.id),
            device_id: Set(device.id),
            requester_note: Set(input.requester_note),
            status: Set(RequestStatus::Pending),
            checker_id: Set(None),
            ..Default::default()
        };

        let new_request = new_request
            .insert(&txn)
            .await
            .map_err(ServiceError::db_error)?;

        let event = Event::RequestCreated {
            request_id: new_request.id,
            device_id: device.id,
            requester_id: requester.id,
        };
        outbox::enqueue(&txn, "request", new_request.id, &event).await?;

        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(request_id = %new_request.id, "request created");
        metrics::counter!("fixflow_requests_created", 1);
        self.event_sender.emit(event).await;

        Ok(new_request)
    }

    /// Requester accepts the outcome: the request closes and the feedback
    /// is recorded. Both writes commit together or not at all.
    #[instrument(skip(self, input), fields(request_id = %request_id))]
    pub async fn confirm_request(
        &self,
        request_id: Uuid,
        requester_id: Uuid,
        input: ConfirmRequestInput,
    ) -> Result<(request::Model, feedback::Model), ServiceError> {
        input.validate()?;

        let txn = self
            .db_pool
            .begin()
            .await
            .map_err(ServiceError::db_error)?;

        let request = Self::find_owned(&txn, request_id, requester_id).await?;
        let next = request.status.transition_to(RequestStatus::Closed)?;

        let mut active: request::ActiveModel = request.into();
        active.status = Set(next);
        let request = active.update(&txn).await.map_err(ServiceError::db_error)?;

        let feedback = feedback::ActiveModel {
            id: Set(Uuid::new_v4()),
            request_id: Set(request.id),
            requester_id: Set(requester_id),
            content: Set(input.content),
            created_at: Set(chrono::Utc::now()),
        };
        let feedback = feedback
            .insert(&txn)
            .await
            .map_err(ServiceError::db_error)?;

        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(request_id = %request.id, "request closed with feedback");
        metrics::counter!("fixflow_requests_closed", 1);
        self.event_sender.emit(Event::RequestConfirmed(request.id)).await;

        Ok((request, feedback))
    }

    /// Requester withdraws the request. Tasks already in flight are not
    /// cancelled here; winding those down is a separate staff action.
    #[instrument(skip(self), fields(request_id = %request_id))]
    pub async fn cancel_request(
        &self,
        request_id: Uuid,
        requester_id: Uuid,
    ) -> Result<request::Model, ServiceError> {
        let db = &*self.db_pool;

        let request = Self::find_owned(db, request_id, requester_id).await?;
        let next = request.status.transition_to(RequestStatus::HeadCancel)?;

        let mut active: request::ActiveModel = request.into();
        active.status = Set(next);
        let request = active.update(db).await.map_err(ServiceError::db_error)?;

        info!(request_id = %request.id, "request cancelled by requester");
        self.event_sender.emit(Event::RequestCancelled(request.id)).await;

        Ok(request)
    }

    /// Coordinator turns the request down, recording who reviewed it.
    #[instrument(skip(self), fields(request_id = %request_id))]
    pub async fn reject_request(
        &self,
        request_id: Uuid,
        checker_id: Uuid,
    ) -> Result<request::Model, ServiceError> {
        let db = &*self.db_pool;

        let request = RequestEntity::find_by_id(request_id)
            .one(db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("request {} not found", request_id)))?;

        let next = request.status.transition_to(RequestStatus::Rejected)?;

        let mut active: request::ActiveModel = request.into();
        active.status = Set(next);
        active.checker_id = Set(Some(checker_id));
        let request = active.update(db).await.map_err(ServiceError::db_error)?;

        info!(request_id = %request.id, checker_id = %checker_id, "request rejected");
        self.event_sender.emit(Event::RequestRejected(request.id)).await;

        Ok(request)
    }

    /// Re-evaluates whether the request is ready for requester
    /// confirmation. Invoked by the task workflow after each completion:
    /// when every non-cancelled task is completed and no issue is still
    /// pending, the request moves to awaiting confirmation.
    ///
    /// Gated by `workflow.auto_confirm_on_completion`; with the toggle off
    /// this is a no-op hook and closure stays a manual coordinator step.
    #[instrument(skip(self), fields(request_id = %request_id))]
    pub async fn evaluate_closure(
        &self,
        request_id: Uuid,
    ) -> Result<Option<request::Model>, ServiceError> {
        if !self.workflow.auto_confirm_on_completion {
            return Ok(None);
        }

        let txn = self
            .db_pool
            .begin()
            .await
            .map_err(ServiceError::db_error)?;

        let request = RequestEntity::find_by_id(request_id)
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("request {} not found", request_id)))?;

        if request.status != RequestStatus::InProgress {
            return Ok(None);
        }

        let open_tasks = TaskEntity::find()
            .filter(task::Column::RequestId.eq(request_id))
            .filter(task::Column::Status.ne(TaskStatus::Cancelled))
            .filter(task::Column::Status.ne(TaskStatus::Completed))
            .count(&txn)
            .await
            .map_err(ServiceError::db_error)?;

        let pending_issues = IssueEntity::find()
            .filter(issue::Column::RequestId.eq(request_id))
            .filter(issue::Column::Status.eq(IssueStatus::Pending))
            .count(&txn)
            .await
            .map_err(ServiceError::db_error)?;

        if open_tasks > 0 || pending_issues > 0 {
            return Ok(None);
        }

        let next = request.status.transition_to(RequestStatus::HeadConfirm)?;
        let mut active: request::ActiveModel = request.into();
        active.status = Set(next);
        let request = active.update(&txn).await.map_err(ServiceError::db_error)?;

        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(request_id = %request.id, "request awaiting requester confirmation");
        self.event_sender
            .emit(Event::RequestAwaitingConfirm(request.id))
            .await;

        Ok(Some(request))
    }

    #[instrument(skip(self))]
    pub async fn get_request(&self, request_id: Uuid) -> Result<request::Model, ServiceError> {
        RequestEntity::find_by_id(request_id)
            .one(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("request {} not found", request_id)))
    }

    /// Lists requests with pagination, newest first, optionally filtered
    /// by status.
    #[instrument(skip(self))]
    pub async fn list_requests(
        &self,
        page: u64,
        per_page: u64,
        status: Option<RequestStatus>,
    ) -> Result<(Vec<request::Model>, u64), ServiceError> {
        let mut query = RequestEntity::find();
        if let Some(status) = status {
            query = query.filter(request::Column::Status.eq(status));
        }

        let paginator = query
            .order_by_desc(request::Column::CreatedAt)
            .paginate(&*self.db_pool, per_page.max(1));

        let total = paginator.num_items().await.map_err(ServiceError::db_error)?;
        let requests = paginator
            .fetch_page(page.saturating_sub(1))
            .await
            .map_err(ServiceError::db_error)?;

        Ok((requests, total))
    }

    /// Maintenance history of a device, newest first.
    #[instrument(skip(self))]
    pub async fn list_requests_for_device(
        &self,
        device_id: Uuid,
    ) -> Result<Vec<request::Model>, ServiceError> {
        RequestEntity::find()
            .filter(request::Column::DeviceId.eq(device_id))
            .order_by_desc(request::Column::CreatedAt)
            .all(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)
    }

    async fn find_owned<C: ConnectionTrait>(
        conn: &C,
        request_id: Uuid,
        requester_id: Uuid,
    ) -> Result<request::Model, ServiceError> {
        let request = RequestEntity::find_by_id(request_id)
            .one(conn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("request {} not found", request_id)))?;

        if request.requester_id != requester_id {
            warn!(request_id = %request_id, actor = %requester_id, "ownership check failed");
            return Err(ServiceError::Forbidden(
                "only the original requester may act on this request".to_string(),
            ));
        }

        Ok(request)
    }
}
