use crate::errors::ServiceError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::{entity::prelude::*, ActiveValue::Set};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a maintenance request.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize,
    strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
pub enum RequestStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "in_progress")]
    InProgress,
    #[sea_orm(string_value = "head_confirm")]
    HeadConfirm,
    #[sea_orm(string_value = "closed")]
    Closed,
    #[sea_orm(string_value = "head_cancel")]
    HeadCancel,
    #[sea_orm(string_value = "rejected")]
    Rejected,
}

impl RequestStatus {
    /// Statuses that block a second request for the same device.
    pub const ACTIVE: [RequestStatus; 2] = [RequestStatus::Pending, RequestStatus::InProgress];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Closed | RequestStatus::HeadCancel | RequestStatus::Rejected
        )
    }

    pub fn can_transition_to(&self, next: RequestStatus) -> bool {
        matches!(
            (self, next),
            (RequestStatus::Pending, RequestStatus::InProgress)
                | (RequestStatus::Pending, RequestStatus::HeadCancel)
                | (RequestStatus::Pending, RequestStatus::Rejected)
                | (RequestStatus::InProgress, RequestStatus::HeadConfirm)
                | (RequestStatus::InProgress, RequestStatus::HeadCancel)
                | (RequestStatus::InProgress, RequestStatus::Rejected)
                | (RequestStatus::HeadConfirm, RequestStatus::Closed)
        )
    }

    /// Validates the (current, next) pair against the transition table.
    pub fn transition_to(&self, next: RequestStatus) -> Result<RequestStatus, ServiceError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(ServiceError::InvalidState(format!(
                "request cannot move from {} to {}",
                self, next
            )))
        }
    }
}

/// The `requests` table. Rows are never physically deleted; terminal
/// statuses close them out.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "requests")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub requester_id: Uuid,
    pub device_id: Uuid,
    pub requester_note: Option<String>,
    pub status: RequestStatus,
    /// Coordinator who reviewed the request, set on rejection.
    pub checker_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::device::Entity",
        from = "Column::DeviceId",
        to = "super::device::Column::Id"
    )]
    Device,
    #[sea_orm(has_many = "super::task::Entity")]
    Tasks,
    #[sea_orm(has_many = "super::issue::Entity")]
    Issues,
    #[sea_orm(has_many = "super::feedback::Entity")]
    Feedbacks,
}

impl Related<super::device::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Device.def()
    }
}

impl Related<super::task::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Tasks.def()
    }
}

impl Related<super::issue::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Issues.def()
    }
}

impl Related<super::feedback::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Feedbacks.def()
    }
}

#[async_trait]
impl ActiveModelBehavior for ActiveModel {
    async fn before_save<C: ConnectionTrait>(self, _db: &C, insert: bool) -> Result<Self, DbErr>
    where
        C: ConnectionTrait,
    {
        let mut active_model = self;
        let now = Utc::now();

        if insert {
            active_model.created_at = Set(now);
        }
        active_model.updated_at = Set(Some(now));

        Ok(active_model)
    }
}
