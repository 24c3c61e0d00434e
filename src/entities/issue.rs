use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How an issue gets fixed: swapping the faulty component or anything else
/// (adjustment, cleaning, recalibration).
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize,
    strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
pub enum FixType {
    #[sea_orm(string_value = "replace")]
    Replace,
    #[sea_orm(string_value = "other")]
    Other,
}

#[derive(
    Copy, Clone, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize,
    strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
pub enum IssueStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "resolved")]
    Resolved,
    #[sea_orm(string_value = "failed")]
    Failed,
}

/// The `issues` table.
///
/// `task_id` is a weak reference: cancelling the owning task clears it
/// ("releases" the issue) but never deletes the row. Queries for "issues
/// currently being worked" must filter on `task_id` being set plus the
/// task's status.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "issues")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub request_id: Uuid,
    pub task_id: Option<Uuid>,
    /// Fault catalogue entry this issue was diagnosed as.
    pub type_error_id: Uuid,
    pub description: Option<String>,
    pub fix_type: FixType,
    pub status: IssueStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::request::Entity",
        from = "Column::RequestId",
        to = "super::request::Column::Id"
    )]
    Request,
    #[sea_orm(
        belongs_to = "super::task::Entity",
        from = "Column::TaskId",
        to = "super::task::Column::Id"
    )]
    Task,
    #[sea_orm(has_many = "super::issue_spare_part::Entity")]
    IssueSpareParts,
}

impl Related<super::request::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Request.def()
    }
}

impl Related<super::task::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Task.def()
    }
}

impl Related<super::issue_spare_part::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::IssueSpareParts.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
