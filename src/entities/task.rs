use crate::errors::ServiceError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::{entity::prelude::*, ActiveValue::Set};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a repair/renewal task.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize,
    strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
pub enum TaskStatus {
    #[sea_orm(string_value = "awaiting_fixer")]
    AwaitingFixer,
    #[sea_orm(string_value = "assigned")]
    Assigned,
    #[sea_orm(string_value = "completed")]
    Completed,
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Cancelled)
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            // AwaitingFixer -> AwaitingFixer re-arms the assignment gate
            // after a stock re-check.
            (TaskStatus::AwaitingFixer, TaskStatus::AwaitingFixer)
                | (TaskStatus::AwaitingFixer, TaskStatus::Assigned)
                | (TaskStatus::AwaitingFixer, TaskStatus::Cancelled)
                | (TaskStatus::Assigned, TaskStatus::Completed)
                | (TaskStatus::Assigned, TaskStatus::Cancelled)
        )
    }

    pub fn transition_to(&self, next: TaskStatus) -> Result<TaskStatus, ServiceError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(ServiceError::InvalidState(format!(
                "task cannot move from {} to {}",
                self, next
            )))
        }
    }
}

/// Whether the task repairs the device in place or replaces it entirely.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize,
    strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
pub enum TaskType {
    #[sea_orm(string_value = "repair")]
    Repair,
    #[sea_orm(string_value = "renew")]
    Renew,
}

/// The `tasks` table. Tasks are never deleted; `Cancelled` marks them
/// terminal and `last_issues_data` preserves the issue list they held at
/// cancellation time for audit.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "tasks")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub request_id: Uuid,
    pub device_id: Uuid,
    /// Replacement device, set only for `Renew` tasks.
    pub device_renew_id: Option<Uuid>,
    /// Set only when status is `Assigned` or later.
    pub fixer_id: Option<Uuid>,
    pub fixer_date: Option<DateTime<Utc>>,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub cancel_by: Option<Uuid>,
    pub last_issues_data: Option<Json>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::request::Entity",
        from = "Column::RequestId",
        to = "super::request::Column::Id"
    )]
    Request,
    #[sea_orm(has_many = "super::issue::Entity")]
    Issues,
    #[sea_orm(has_many = "super::export_ticket::Entity")]
    ExportTickets,
}

impl Related<super::request::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Request.def()
    }
}

impl Related<super::issue::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Issues.def()
    }
}

impl Related<super::export_ticket::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ExportTickets.def()
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_requires_assignment_first() {
        assert!(TaskStatus::AwaitingFixer
            .transition_to(TaskStatus::Completed)
            .is_err());
        assert!(TaskStatus::Assigned.can_transition_to(TaskStatus::Completed));
    }

    #[test]
    fn cancellation_is_legal_from_both_open_states() {
        assert!(TaskStatus::AwaitingFixer.can_transition_to(TaskStatus::Cancelled));
        assert!(TaskStatus::Assigned.can_transition_to(TaskStatus::Cancelled));
    }

    #[test]
    fn no_transition_leaves_a_terminal_state() {
        for terminal in [TaskStatus::Completed, TaskStatus::Cancelled] {
            for next in [
                TaskStatus::AwaitingFixer,
                TaskStatus::Assigned,
                TaskStatus::Completed,
                TaskStatus::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn awaiting_fixer_can_re_arm() {
        assert!(TaskStatus::AwaitingFixer.can_transition_to(TaskStatus::AwaitingFixer));
    }
}
