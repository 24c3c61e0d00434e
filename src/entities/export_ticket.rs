use crate::errors::ServiceError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::{entity::prelude::*, ActiveValue::Set};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(
    Copy, Clone, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize,
    strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
pub enum ExportType {
    #[sea_orm(string_value = "device")]
    Device,
    #[sea_orm(string_value = "spare_part")]
    SparePart,
}

#[derive(
    Copy, Clone, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize,
    strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
pub enum ExportStatus {
    #[sea_orm(string_value = "waiting")]
    Waiting,
    #[sea_orm(string_value = "exported")]
    Exported,
    #[sea_orm(string_value = "cancel")]
    Cancel,
}

impl ExportStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExportStatus::Exported | ExportStatus::Cancel)
    }

    pub fn can_transition_to(&self, next: ExportStatus) -> bool {
        matches!(
            (self, next),
            (ExportStatus::Waiting, ExportStatus::Exported)
                | (ExportStatus::Waiting, ExportStatus::Cancel)
        )
    }

    pub fn transition_to(&self, next: ExportStatus) -> Result<ExportStatus, ServiceError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(ServiceError::InvalidState(format!(
                "export ticket cannot move from {} to {}",
                self, next
            )))
        }
    }
}

/// The `export_tickets` table: warehouse dispatch orders tied to a task.
///
/// `detail` is polymorphic on `export_type`: a single device id for
/// `Device` exports, a list of issue ids for `SparePart` exports. Callers
/// must discriminate before interpreting it.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "export_tickets")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub task_id: Uuid,
    pub export_type: ExportType,
    pub detail: Json,
    pub status: ExportStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Model {
    /// The replacement device to dispatch. `None` unless this is a
    /// `Device` export.
    pub fn device_detail(&self) -> Option<Uuid> {
        if self.export_type != ExportType::Device {
            return None;
        }
        serde_json::from_value(self.detail.clone()).ok()
    }

    /// The issues whose part requirements this export covers. `None`
    /// unless this is a `SparePart` export.
    pub fn issue_detail(&self) -> Option<Vec<Uuid>> {
        if self.export_type != ExportType::SparePart {
            return None;
        }
        serde_json::from_value(self.detail.clone()).ok()
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::task::Entity",
        from = "Column::TaskId",
        to = "super::task::Column::Id"
    )]
    Task,
}

impl Related<super::task::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Task.def()
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
