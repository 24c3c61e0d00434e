use crate::{
    db::DbPool,
    entities::issue::{self, Entity as IssueEntity, FixType, IssueStatus},
    entities::issue_spare_part::{self, Entity as IssueSparePartEntity},
    entities::request::Entity as RequestEntity,
    entities::spare_part::Entity as SparePartEntity,
    errors::ServiceError,
};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Serialize, Deserialize)]
pub struct SparePartRequirement {
    pub spare_part_id: Uuid,
    pub quantity: i32,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct CreateIssueInput {
    pub request_id: Uuid,
    pub type_error_id: Uuid,
    pub fix_type: FixType,
    #[validate(length(max = 500, message = "Description must be at most 500 characters"))]
    pub description: Option<String>,
    pub spare_parts: Vec<SparePartRequirement>,
}

/// Issue intake. Issues are diagnosed on a request during review, before
/// any task binds them; they carry their own spare part demand.
#[derive(Clone)]
pub struct IssueService {
    db_pool: Arc<DbPool>,
}

impl IssueService {
    pub fn new(db_pool: Arc<DbPool>) -> Self {
        Self { db_pool }
    }

    /// Records a diagnosed issue with its spare part requirements.
    #[instrument(skip(self, input), fields(request_id = %input.request_id))]
    pub async fn create_issue(&self, input: CreateIssueInput) -> Result<issue::Model, ServiceError> {
        input.validate()?;
        for req in &input.spare_parts {
            if req.quantity <= 0 {
                return Err(ServiceError::ValidationError(
                    "spare part quantity must be positive".to_string(),
                ));
            }
        }

        let txn = self
            .db_pool
            .begin()
            .await
            .map_err(ServiceError::db_error)?;

        let request = RequestEntity::find_by_id(input.request_id)
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("request {} not found", input.request_id))
            })?;

        if request.status.is_terminal() {
            return Err(ServiceError::InvalidState(format!(
                "request {} is {}",
                request.id, request.status
            )));
        }

        let new_issue = issue::ActiveModel {
            id: Set(Uuid::new_v4()),
            request_id: Set(request.id),
            task_id: Set(None),
            type_error_id: Set(input.type_error_id),
            description: Set(input.description),
            fix_type: Set(input.fix_type),
            status: Set(IssueStatus::Pending),
            created_at: Set(chrono::Utc::now()),
        };
        let new_issue = new_issue
            .insert(&txn)
            .await
            .map_err(ServiceError::db_error)?;

        for req in &input.spare_parts {
            SparePartEntity::find_by_id(req.spare_part_id)
                .one(&txn)
                .await
                .map_err(ServiceError::db_error)?
                .ok_or_else(|| {
                    ServiceError::NotFound(format!("spare part {} not found", req.spare_part_id))
                })?;

            let requirement = issue_spare_part::ActiveModel {
                id: Set(Uuid::new_v4()),
                issue_id: Set(new_issue.id),
                spare_part_id: Set(req.spare_part_id),
                quantity: Set(req.quantity),
            };
            requirement
                .insert(&txn)
                .await
                .map_err(ServiceError::db_error)?;
        }

        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(issue_id = %new_issue.id, parts = input.spare_parts.len(), "issue recorded");
        Ok(new_issue)
    }

    /// Marks a pending issue resolved.
    #[instrument(skip(self))]
    pub async fn resolve_issue(&self, issue_id: Uuid) -> Result<issue::Model, ServiceError> {
        self.finish_issue(issue_id, IssueStatus::Resolved).await
    }

    /// Marks a pending issue as failed (could not be fixed).
    #[instrument(skip(self))]
    pub async fn fail_issue(&self, issue_id: Uuid) -> Result<issue::Model, ServiceError> {
        self.finish_issue(issue_id, IssueStatus::Failed).await
    }

    async fn finish_issue(
        &self,
        issue_id: Uuid,
        outcome: IssueStatus,
    ) -> Result<issue::Model, ServiceError> {
        let db = &*self.db_pool;

        let found = IssueEntity::find_by_id(issue_id)
            .one(db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("issue {} not found", issue_id)))?;

        if found.status != IssueStatus::Pending {
            return Err(ServiceError::InvalidState(format!(
                "issue {} is already {}",
                issue_id, found.status
            )));
        }

        let mut active: issue::ActiveModel = found.into();
        active.status = Set(outcome);
        active.update(db).await.map_err(ServiceError::db_error)
    }

    #[instrument(skip(self))]
    pub async fn get_issue(&self, issue_id: Uuid) -> Result<issue::Model, ServiceError> {
        IssueEntity::find_by_id(issue_id)
            .one(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("issue {} not found", issue_id)))
    }

    /// All issues diagnosed on a request, oldest first.
    #[instrument(skip(self))]
    pub async fn list_issues_for_request(
        &self,
        request_id: Uuid,
    ) -> Result<Vec<issue::Model>, ServiceError> {
        IssueEntity::find()
            .filter(issue::Column::RequestId.eq(request_id))
            .order_by_asc(issue::Column::CreatedAt)
            .all(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)
    }

    /// The spare part demand of one issue.
    #[instrument(skip(self))]
    pub async fn list_requirements(
        &self,
        issue_id: Uuid,
    ) -> Result<Vec<issue_spare_part::Model>, ServiceError> {
        IssueSparePartEntity::find()
            .filter(issue_spare_part::Column::IssueId.eq(issue_id))
            .all(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)
    }
}
